//! Frames exchanged on the chat and notification channels.
//!
//! Every frame is a JSON text frame `{"event": "<name>", "data": {...}}`.

use crate::error::{AppError, AppResult};
use crate::models::{Message, Notification};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MALFORMED_EVENT: &str = "Malformed event";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ChatClientEvent {
    SendMessage {
        receiver_id: String,
        content: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
    MarkAsRead {
        message_id: String,
    },
    GetMessages {
        other_user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<i64>,
    },
    Typing {
        receiver_id: String,
        is_typing: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ChatServerEvent {
    OnlineUsersList { online_users: Vec<String> },
    UserOnline { user_id: String },
    UserOffline { user_id: String },
    NewMessage(Message),
    MessageSent { message_id: String, status: String },
    MessageRead { message_id: String, read_by: String },
    MessageHistory { messages: Vec<Message>, has_more: bool },
    UserTyping { user_id: String, is_typing: bool },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum NotificationClientEvent {
    GetNotifications {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<i64>,
    },
    MarkAsRead {
        notification_id: String,
    },
    MarkAllAsRead {},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum NotificationServerEvent {
    UnreadCount { count: i64 },
    NotificationList { notifications: Vec<Notification>, has_more: bool },
    NotificationRead { notification_id: String },
    AllNotificationsRead,
    Notification(Notification),
    Error { message: String },
}

impl ChatServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ChatServerEvent::Error {
            message: message.into(),
        }
    }
}

impl NotificationServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        NotificationServerEvent::Error {
            message: message.into(),
        }
    }
}

/// Serialize an event into a text frame
pub fn encode<E: Serialize>(event: &E) -> AppResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Parse a client frame. A missing or null `data` is read as `{}` so
/// payload-less events may omit it.
pub fn decode<E: DeserializeOwned>(text: &str) -> AppResult<E> {
    let mut value: Value =
        serde_json::from_str(text).map_err(|_| AppError::validation(MALFORMED_EVENT))?;

    let Value::Object(map) = &mut value else {
        return Err(AppError::validation(MALFORMED_EVENT));
    };
    if map.get("data").map_or(true, Value::is_null) {
        map.insert("data".to_string(), Value::Object(Default::default()));
    }

    serde_json::from_value(value).map_err(|_| AppError::validation(MALFORMED_EVENT))
}
