use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            "system" => Ok(MessageKind::System),
            other => Err(AppError::validation(format!(
                "Unsupported message type: {other}"
            ))),
        }
    }
}

/// A relayed chat message. Only `is_read` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "messageId")]
    pub id: Uuid,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Message {
    pub fn new(sender_id: &str, receiver_id: &str, content: &str, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            kind,
            created_at: Utc::now(),
            is_read: false,
        }
    }

    /// True when the message belongs to the conversation between `a` and `b`
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_is_a_validation_error() {
        assert_eq!("image".parse::<MessageKind>().unwrap(), MessageKind::Image);
        assert!(matches!(
            "sticker".parse::<MessageKind>(),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn wire_shape_uses_client_field_names() {
        let msg = Message::new("alice", "bob", "hi", MessageKind::Text);
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["messageId"], msg.id.to_string());
        assert_eq!(value["senderId"], "alice");
        assert_eq!(value["receiverId"], "bob");
        assert_eq!(value["type"], "text");
        assert_eq!(value["isRead"], false);
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn pair_matching_ignores_direction() {
        let msg = Message::new("alice", "bob", "hi", MessageKind::Text);
        assert!(msg.is_between("alice", "bob"));
        assert!(msg.is_between("bob", "alice"));
        assert!(!msg.is_between("alice", "carol"));
    }
}
