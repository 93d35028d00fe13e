//! Process-local stores for single-instance runs and tests.

use super::{MessageStore, NotificationStore, PresenceStore, ScheduleIndex};
use crate::error::AppResult;
use crate::models::{ConnectionRef, Identity, Message, Notification, ScheduledEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct PresenceRecord {
    identity: Option<Identity>,
    connections: HashSet<ConnectionRef>,
}

#[derive(Default)]
pub struct MemoryPresenceStore {
    inner: RwLock<HashMap<String, PresenceRecord>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ensure_identity<'a>(
    map: &'a mut HashMap<String, PresenceRecord>,
    identity: &str,
) -> &'a mut PresenceRecord {
    let record = map.entry(identity.to_string()).or_default();
    if record.identity.is_none() {
        record.identity = Some(Identity::new(identity));
    }
    record
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn find_or_create(&self, identity: &str) -> AppResult<Identity> {
        let mut guard = self.inner.write().await;
        let record = ensure_identity(&mut guard, identity);
        Ok(record.identity.clone().unwrap_or_else(|| Identity::new(identity)))
    }

    async fn find(&self, identity: &str) -> AppResult<Option<Identity>> {
        let guard = self.inner.read().await;
        Ok(guard.get(identity).and_then(|r| r.identity.clone()))
    }

    async fn set_online(&self, identity: &str, connection: &ConnectionRef) -> AppResult<bool> {
        let mut guard = self.inner.write().await;
        let record = ensure_identity(&mut guard, identity);

        let was_online = !record.connections.is_empty();
        record.connections.insert(connection.clone());
        if let Some(id) = record.identity.as_mut() {
            id.is_online = true;
            id.last_seen = Utc::now();
        }
        Ok(!was_online)
    }

    async fn set_offline(&self, identity: &str, connection: &ConnectionRef) -> AppResult<bool> {
        let mut guard = self.inner.write().await;
        let record = ensure_identity(&mut guard, identity);

        record.connections.remove(connection);
        let still_online = !record.connections.is_empty();
        if let Some(id) = record.identity.as_mut() {
            id.is_online = still_online;
            id.last_seen = Utc::now();
        }
        Ok(still_online)
    }

    async fn is_online(&self, identity: &str) -> AppResult<bool> {
        let guard = self.inner.read().await;
        Ok(guard
            .get(identity)
            .map(|r| !r.connections.is_empty())
            .unwrap_or(false))
    }

    async fn list_online(&self) -> AppResult<Vec<String>> {
        let guard = self.inner.read().await;
        let mut online: Vec<String> = guard
            .iter()
            .filter(|(_, r)| !r.connections.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        online.sort();
        Ok(online)
    }

    async fn list_identities(&self) -> AppResult<Vec<String>> {
        let guard = self.inner.read().await;
        let mut ids: Vec<String> = guard.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn purge_instance(&self, instance_id: &str) -> AppResult<Vec<String>> {
        let mut guard = self.inner.write().await;
        let mut went_offline = Vec::new();

        for (identity, record) in guard.iter_mut() {
            let before = record.connections.len();
            record.connections.retain(|c| c.instance_id != instance_id);
            if before > 0 && record.connections.is_empty() {
                if let Some(id) = record.identity.as_mut() {
                    id.is_online = false;
                    id.last_seen = Utc::now();
                }
                went_offline.push(identity.clone());
            }
        }
        Ok(went_offline)
    }
}

#[derive(Default)]
pub struct MemoryMessageStore {
    inner: RwLock<Vec<Message>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: &Message) -> AppResult<()> {
        self.inner.write().await.push(message.clone());
        Ok(())
    }

    async fn mark_read(&self, message_id: Uuid, reader: &str) -> AppResult<Option<Message>> {
        let mut guard = self.inner.write().await;
        Ok(guard
            .iter_mut()
            .find(|m| m.id == message_id && m.receiver_id == reader)
            .map(|m| {
                m.is_read = true;
                m.clone()
            }))
    }

    async fn history(&self, a: &str, b: &str, limit: i64, offset: i64) -> AppResult<Vec<Message>> {
        let guard = self.inner.read().await;
        // Ties on timestamp keep reverse insertion order.
        let mut newest_first: Vec<&Message> =
            guard.iter().rev().filter(|m| m.is_between(a, b)).collect();
        newest_first.sort_by(|x, y| y.created_at.cmp(&x.created_at));

        Ok(newest_first
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryNotificationStore {
    // records in insertion order
    inner: RwLock<Vec<Notification>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn insert(&self, notification: &Notification) -> AppResult<()> {
        self.inner.write().await.push(notification.clone());
        Ok(())
    }

    async fn insert_many(&self, notifications: &[Notification]) -> AppResult<u64> {
        let mut guard = self.inner.write().await;
        guard.extend_from_slice(notifications);
        Ok(notifications.len() as u64)
    }

    async fn get(&self, id: Uuid, identity: &str) -> AppResult<Option<Notification>> {
        let guard = self.inner.read().await;
        Ok(guard
            .iter()
            .find(|n| n.id == id && n.target == identity)
            .cloned())
    }

    async fn mark_sent(&self, id: Uuid, identity: &str) -> AppResult<bool> {
        let mut guard = self.inner.write().await;
        match guard
            .iter_mut()
            .find(|n| n.id == id && n.target == identity && !n.is_sent)
        {
            Some(n) => {
                n.is_sent = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn discard_unsent(&self, id: Uuid, identity: &str) -> AppResult<bool> {
        let mut guard = self.inner.write().await;
        let before = guard.len();
        guard.retain(|n| !(n.id == id && n.target == identity && !n.is_sent));
        Ok(guard.len() < before)
    }

    async fn list(&self, identity: &str, limit: i64, offset: i64) -> AppResult<Vec<Notification>> {
        let guard = self.inner.read().await;
        let mut sent: Vec<&Notification> = guard
            .iter()
            .rev()
            .filter(|n| n.target == identity && n.is_sent)
            .collect();
        sent.sort_by(|x, y| y.created_at.cmp(&x.created_at));

        Ok(sent
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn unread_count(&self, identity: &str) -> AppResult<i64> {
        let guard = self.inner.read().await;
        Ok(guard
            .iter()
            .filter(|n| n.target == identity && n.is_sent && !n.is_read)
            .count() as i64)
    }

    async fn mark_read(&self, id: Uuid, identity: &str) -> AppResult<bool> {
        let mut guard = self.inner.write().await;
        match guard
            .iter_mut()
            .find(|n| n.id == id && n.target == identity && n.is_sent)
        {
            Some(n) => {
                n.is_read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_all_read(&self, identity: &str) -> AppResult<u64> {
        let mut guard = self.inner.write().await;
        let mut updated = 0;
        for n in guard
            .iter_mut()
            .filter(|n| n.target == identity && n.is_sent && !n.is_read)
        {
            n.is_read = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn pending_before(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Notification>> {
        let guard = self.inner.read().await;
        Ok(guard
            .iter()
            .filter(|n| !n.is_sent && n.due_at.map_or(false, |due| due <= cutoff))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryScheduleIndex {
    // identity -> (due ms, notification id) -> entry
    inner: RwLock<HashMap<String, BTreeMap<(i64, Uuid), ScheduledEntry>>>,
}

impl MemoryScheduleIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleIndex for MemoryScheduleIndex {
    async fn insert(&self, entry: &ScheduledEntry) -> AppResult<bool> {
        let mut guard = self.inner.write().await;
        let bucket = guard.entry(entry.identity.clone()).or_default();
        if bucket.keys().any(|(_, id)| *id == entry.notification.id) {
            return Ok(false);
        }
        bucket.insert(
            (entry.due_at.timestamp_millis(), entry.notification.id),
            entry.clone(),
        );
        Ok(true)
    }

    async fn pop_due_before(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<ScheduledEntry>> {
        let mut guard = self.inner.write().await;
        let Some(bucket) = guard.get_mut(identity) else {
            return Ok(Vec::new());
        };

        let cutoff = now.timestamp_millis();
        let due_keys: Vec<(i64, Uuid)> = bucket
            .keys()
            .take_while(|(due, _)| *due <= cutoff)
            .copied()
            .collect();
        let popped = due_keys
            .into_iter()
            .filter_map(|key| bucket.remove(&key))
            .collect();

        if bucket.is_empty() {
            guard.remove(identity);
        }
        Ok(popped)
    }

    async fn identities_with_entries(&self) -> AppResult<Vec<String>> {
        let guard = self.inner.read().await;
        Ok(guard
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(identity, _)| identity.clone())
            .collect())
    }

    async fn entries(&self, identity: &str) -> AppResult<Vec<ScheduledEntry>> {
        let guard = self.inner.read().await;
        Ok(guard
            .get(identity)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default())
    }
}
