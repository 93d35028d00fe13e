use super::ApiResponse;
use crate::models::ChannelKind;
use crate::services::ChannelGateway;
use crate::state::AppState;
use crate::websocket::session::WsSession;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

impl WsParams {
    fn identity(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

async fn start_session(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    params: WsParams,
    gateway: Arc<dyn ChannelGateway>,
) -> Result<HttpResponse, Error> {
    let Some(identity) = params.identity() else {
        return Ok(HttpResponse::BadRequest()
            .json(ApiResponse::<()>::err("userId is required".to_string())));
    };

    let channel: ChannelKind = gateway.channel();
    let (connection, outbound) = state.registry.register(identity, channel).await;
    let session = WsSession::new(connection.clone(), outbound, gateway);

    match ws::start(session, &req, stream) {
        Ok(response) => Ok(response),
        Err(e) => {
            tracing::warn!(identity = %identity, channel = %channel, error = %e, "WebSocket upgrade failed");
            state.registry.unregister(&connection).await;
            Err(e)
        }
    }
}

/// GET /ws/chat?userId=<id>
pub async fn chat_ws(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let gateway: Arc<dyn ChannelGateway> = state.chat.clone();
    start_session(req, stream, state, query.into_inner(), gateway).await
}

/// GET /ws/notification?userId=<id>
pub async fn notification_ws(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let gateway: Arc<dyn ChannelGateway> = state.notifications.clone();
    start_session(req, stream, state, query.into_inner(), gateway).await
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/ws")
            .route("/chat", web::get().to(chat_ws))
            .route("/notification", web::get().to(notification_ws)),
    );
}
