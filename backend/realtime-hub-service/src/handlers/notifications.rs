use super::ApiResponse;
use crate::error::{AppError, AppResult};
use crate::models::{NewNotification, NotificationKind};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Request to create a notification
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationPayload {
    pub user_id: String,
    pub title: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub subject: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastPayload {
    pub title: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

// `message` notifications only originate from the chat relay
fn parse_kind(kind: Option<&str>, subject: Option<String>) -> AppResult<NotificationKind> {
    match kind.map(|k| k.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("system") => Ok(NotificationKind::System {
            auto_generated: false,
        }),
        Some("reminder") => Ok(NotificationKind::Reminder { subject }),
        Some("broadcast") => Ok(NotificationKind::broadcast()),
        Some(other) => Err(AppError::validation(format!(
            "Unsupported notification type: {other}"
        ))),
    }
}

/// Create a notification, delivered now or at `dueAt`
///
/// POST /api/v1/notifications
pub async fn create_notification(
    state: web::Data<AppState>,
    req: web::Json<CreateNotificationPayload>,
) -> AppResult<HttpResponse> {
    let payload = req.into_inner();
    let kind = parse_kind(payload.kind.as_deref(), payload.subject)?;
    let new = NewNotification {
        target: payload.user_id,
        title: payload.title,
        body: payload.content,
        kind,
        metadata: payload.metadata,
    };

    let notification = match payload.due_at {
        Some(due_at) if due_at > Utc::now() => state.dispatcher.schedule(new, due_at).await?,
        _ => state.dispatcher.immediate(new).await?,
    };
    Ok(HttpResponse::Created().json(ApiResponse::ok(notification)))
}

/// Deliver one notification to every known identity
///
/// POST /api/v1/notifications/broadcast
pub async fn broadcast_notification(
    state: web::Data<AppState>,
    req: web::Json<BroadcastPayload>,
) -> AppResult<HttpResponse> {
    let payload = req.into_inner();
    let notification = state
        .dispatcher
        .broadcast_all(NewNotification {
            target: String::new(),
            title: payload.title,
            body: payload.content,
            kind: NotificationKind::broadcast(),
            metadata: payload.metadata,
        })
        .await?;
    Ok(HttpResponse::Created().json(ApiResponse::ok(notification)))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/notifications")
            .route("", web::post().to(create_notification))
            .route("/broadcast", web::post().to(broadcast_notification)),
    );
}
