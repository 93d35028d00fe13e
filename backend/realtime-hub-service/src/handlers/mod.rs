/// HTTP and WebSocket entry points
pub mod notifications;
pub mod presence;
pub mod ws;

use actix_web::{web, HttpResponse};
use serde::Serialize;

/// API Response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    ws::register_routes(cfg);
    notifications::register_routes(cfg);
    presence::register_routes(cfg);
}
