use super::ApiResponse;
use crate::error::AppResult;
use crate::models::ChannelKind;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct OnlineUsers {
    pub count: usize,
    pub users: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStatus {
    pub user_id: String,
    pub online: bool,
    pub local_connections: usize,
}

/// GET /api/v1/presence/online
pub async fn list_online(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let users = state.presence.list_online().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(OnlineUsers {
        count: users.len(),
        users,
    })))
}

/// GET /api/v1/presence/{user_id}
pub async fn presence_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let user_id = path.into_inner();
    let online = state.presence.is_online(&user_id).await?;
    let local_connections = state
        .registry
        .connection_count(&user_id, ChannelKind::Chat)
        .await;

    Ok(HttpResponse::Ok().json(ApiResponse::ok(PresenceStatus {
        user_id,
        online,
        local_connections,
    })))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/presence")
            .route("/online", web::get().to(list_online))
            .route("/{user_id}", web::get().to(presence_status)),
    );
}
