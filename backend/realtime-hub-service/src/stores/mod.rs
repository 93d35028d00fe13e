//! Storage seams: presence directory, messages, notifications and the
//! scheduled index.

use crate::error::AppResult;
use crate::models::{ConnectionRef, Identity, Message, Notification, ScheduledEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub mod memory;
pub mod postgres;
pub mod redis_schedule;

/// Directory and presence. Presence is derived from the set of live chat
/// connection references held for each identity.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn find_or_create(&self, identity: &str) -> AppResult<Identity>;

    async fn find(&self, identity: &str) -> AppResult<Option<Identity>>;

    /// Record a live connection. Returns true when the identity went from
    /// offline to online.
    async fn set_online(&self, identity: &str, connection: &ConnectionRef) -> AppResult<bool>;

    /// Drop a connection reference. Returns true while other references remain.
    async fn set_offline(&self, identity: &str, connection: &ConnectionRef) -> AppResult<bool>;

    async fn is_online(&self, identity: &str) -> AppResult<bool>;

    async fn list_online(&self) -> AppResult<Vec<String>>;

    /// Every identity known to the directory
    async fn list_identities(&self) -> AppResult<Vec<String>>;

    /// Remove references owned by `instance_id` (left behind by a crash).
    /// Returns identities that went offline as a result.
    async fn purge_instance(&self, instance_id: &str) -> AppResult<Vec<String>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: &Message) -> AppResult<()>;

    /// Flag a message read if `reader` is its receiver. `None` when no such
    /// message exists.
    async fn mark_read(&self, message_id: Uuid, reader: &str) -> AppResult<Option<Message>>;

    /// Messages between `a` and `b`, newest first
    async fn history(&self, a: &str, b: &str, limit: i64, offset: i64) -> AppResult<Vec<Message>>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, notification: &Notification) -> AppResult<()>;

    async fn insert_many(&self, notifications: &[Notification]) -> AppResult<u64>;

    async fn get(&self, id: Uuid, identity: &str) -> AppResult<Option<Notification>>;

    /// Flip `is_sent` false -> true. Returns false if already sent or unknown.
    async fn mark_sent(&self, id: Uuid, identity: &str) -> AppResult<bool>;

    /// Remove a record that was never sent. Returns false if it is unknown or
    /// already sent.
    async fn discard_unsent(&self, id: Uuid, identity: &str) -> AppResult<bool>;

    /// Delivered notifications for `identity`, newest first
    async fn list(&self, identity: &str, limit: i64, offset: i64) -> AppResult<Vec<Notification>>;

    async fn unread_count(&self, identity: &str) -> AppResult<i64>;

    /// Returns false when no delivered notification exists for `identity`
    async fn mark_read(&self, id: Uuid, identity: &str) -> AppResult<bool>;

    async fn mark_all_read(&self, identity: &str) -> AppResult<u64>;

    /// Unsent notifications due at or before `cutoff`
    async fn pending_before(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Notification>>;
}

/// Durable per-identity index of scheduled notifications ordered by due time
#[async_trait]
pub trait ScheduleIndex: Send + Sync {
    /// Add an entry. Returns false if the notification is already indexed.
    async fn insert(&self, entry: &ScheduledEntry) -> AppResult<bool>;

    /// Atomically remove and return every entry of `identity` due at or
    /// before `now`, in due order.
    async fn pop_due_before(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<ScheduledEntry>>;

    async fn identities_with_entries(&self) -> AppResult<Vec<String>>;

    /// Pending entries of `identity` without removing them
    async fn entries(&self, identity: &str) -> AppResult<Vec<ScheduledEntry>>;
}

/// The store set a hub runs on
#[derive(Clone)]
pub struct Stores {
    pub presence: Arc<dyn PresenceStore>,
    pub messages: Arc<dyn MessageStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub schedule: Arc<dyn ScheduleIndex>,
}

impl Stores {
    /// Fresh in-memory stores
    pub fn memory() -> Self {
        Self {
            presence: Arc::new(memory::MemoryPresenceStore::new()),
            messages: Arc::new(memory::MemoryMessageStore::new()),
            notifications: Arc::new(memory::MemoryNotificationStore::new()),
            schedule: Arc::new(memory::MemoryScheduleIndex::new()),
        }
    }
}
