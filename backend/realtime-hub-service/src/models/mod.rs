use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

mod message;
mod notification;

pub use message::{Message, MessageKind};
pub use notification::{
    NewNotification, Notification, NotificationKind, ScheduledEntry, BROADCAST_TARGET,
};

/// Which WebSocket namespace a connection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Chat,
    Notification,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Chat => write!(f, "chat"),
            ChannelKind::Notification => write!(f, "notification"),
        }
    }
}

/// Directory record for an identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(rename = "userId")]
    pub id: String,
    pub display_name: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

impl Identity {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: default_display_name(id),
            is_online: false,
            last_seen: Utc::now(),
        }
    }
}

/// Display name given to identities first seen on connect
pub fn default_display_name(id: &str) -> String {
    format!("User {id}")
}

/// Deployment-wide reference to one live chat connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionRef {
    pub instance_id: String,
    pub connection_id: Uuid,
}

impl ConnectionRef {
    pub fn new(instance_id: impl Into<String>, connection_id: Uuid) -> Self {
        Self {
            instance_id: instance_id.into(),
            connection_id,
        }
    }
}

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_display_name_is_derived_from_id() {
        assert_eq!(default_display_name("alice"), "User alice");
        assert_eq!(Identity::new("42").display_name, "User 42");
    }

    #[test]
    fn channel_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ChannelKind::Notification).unwrap(),
            "\"notification\""
        );
    }
}
