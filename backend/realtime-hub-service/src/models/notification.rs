use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// `userId` carried by the single frame of a broadcast
pub const BROADCAST_TARGET: &str = "*";

fn default_audience() -> String {
    "all".to_string()
}

/// Notification kind with the payload each kind carries.
///
/// Serialized inline on the notification under the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum NotificationKind {
    System {
        #[serde(default)]
        auto_generated: bool,
    },
    Message {
        sender_id: String,
        sender_name: String,
        message_id: Uuid,
    },
    Reminder {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    Broadcast {
        #[serde(default = "default_audience")]
        audience: String,
    },
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::System { .. } => "system",
            NotificationKind::Message { .. } => "message",
            NotificationKind::Reminder { .. } => "reminder",
            NotificationKind::Broadcast { .. } => "broadcast",
        }
    }

    pub fn broadcast() -> Self {
        NotificationKind::Broadcast {
            audience: default_audience(),
        }
    }
}

/// Input for creating a notification
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub target: String,
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "notificationId")]
    pub id: Uuid,
    #[serde(rename = "userId")]
    pub target: String,
    pub title: String,
    #[serde(rename = "content")]
    pub body: String,
    #[serde(flatten)]
    pub kind: NotificationKind,
    pub is_read: bool,
    pub is_sent: bool,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Notification {
    /// Record for immediate delivery: created already sent.
    pub fn immediate(req: NewNotification) -> Self {
        Self::build(Uuid::new_v4(), req, true, None)
    }

    /// Record for later delivery: unsent until the scheduler picks it up.
    pub fn scheduled(req: NewNotification, due_at: DateTime<Utc>) -> Self {
        Self::build(Uuid::new_v4(), req, false, Some(due_at))
    }

    /// One record per recipient of a broadcast, all sharing `id`.
    pub fn broadcast_copy(id: Uuid, target: &str, template: &NewNotification) -> Self {
        let mut req = template.clone();
        req.target = target.to_string();
        Self::build(id, req, true, None)
    }

    fn build(id: Uuid, req: NewNotification, is_sent: bool, due_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id,
            target: req.target,
            title: req.title,
            body: req.body,
            kind: req.kind,
            is_read: false,
            is_sent,
            due_at,
            created_at: Utc::now(),
            metadata: req.metadata,
        }
    }
}

/// Entry of the scheduled index: one pending notification for `identity`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub identity: String,
    pub due_at: DateTime<Utc>,
    pub notification: Notification,
}

impl ScheduledEntry {
    pub fn for_notification(notification: &Notification) -> Option<Self> {
        notification.due_at.map(|due_at| Self {
            identity: notification.target.clone(),
            due_at,
            notification: notification.clone(),
        })
    }
}
