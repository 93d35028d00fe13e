//! Scheduled index on Redis sorted sets.
//!
//! Per identity:
//! - `hub:scheduled:{<identity>}`: sorted set, member = notification id, score = due time (ms)
//! - `hub:scheduled-payload:{<identity>}`: hash, notification id -> serialized entry
//!
//! The identity is a cluster hash tag so both keys live in one slot and the
//! Lua scripts below stay atomic.

use super::ScheduleIndex;
use crate::error::AppResult;
use crate::models::ScheduledEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, warn};

const INDEX_PREFIX: &str = "hub:scheduled:";
const PAYLOAD_PREFIX: &str = "hub:scheduled-payload:";
const POP_BATCH: usize = 500;

const INSERT_SCRIPT: &str = r#"
    local added = redis.call('ZADD', KEYS[1], 'NX', ARGV[1], ARGV[2])
    if added == 1 then
        redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
    end
    return added
"#;

const POP_DUE_SCRIPT: &str = r#"
    local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
    if #ids == 0 then
        return {}
    end
    redis.call('ZREM', KEYS[1], unpack(ids))
    local payloads = redis.call('HMGET', KEYS[2], unpack(ids))
    redis.call('HDEL', KEYS[2], unpack(ids))
    return payloads
"#;

pub fn index_key(identity: &str) -> String {
    format!("{INDEX_PREFIX}{{{identity}}}")
}

fn payload_key(identity: &str) -> String {
    format!("{PAYLOAD_PREFIX}{{{identity}}}")
}

/// Inverse of [`index_key`]
pub fn identity_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(INDEX_PREFIX)?
        .strip_prefix('{')?
        .strip_suffix('}')
}

#[derive(Clone)]
pub struct RedisScheduleIndex {
    conn: ConnectionManager,
    insert_script: Script,
    pop_script: Script,
}

impl RedisScheduleIndex {
    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            insert_script: Script::new(INSERT_SCRIPT),
            pop_script: Script::new(POP_DUE_SCRIPT),
        }
    }

    fn decode_payloads(identity: &str, payloads: Vec<Option<String>>) -> Vec<ScheduledEntry> {
        payloads
            .into_iter()
            .flatten()
            .filter_map(|raw| match serde_json::from_str(&raw) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Dropping undecodable scheduled entry");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl ScheduleIndex for RedisScheduleIndex {
    async fn insert(&self, entry: &ScheduledEntry) -> AppResult<bool> {
        let body = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();

        let added: i64 = self
            .insert_script
            .key(index_key(&entry.identity))
            .key(payload_key(&entry.identity))
            .arg(entry.due_at.timestamp_millis())
            .arg(entry.notification.id.to_string())
            .arg(body)
            .invoke_async(&mut conn)
            .await?;

        debug!(
            identity = %entry.identity,
            notification_id = %entry.notification.id,
            due_at = %entry.due_at,
            added,
            "Indexed scheduled notification"
        );
        Ok(added == 1)
    }

    async fn pop_due_before(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<ScheduledEntry>> {
        let mut conn = self.conn.clone();
        let mut popped = Vec::new();

        loop {
            let payloads: Vec<Option<String>> = self
                .pop_script
                .key(index_key(identity))
                .key(payload_key(identity))
                .arg(now.timestamp_millis())
                .arg(POP_BATCH)
                .invoke_async(&mut conn)
                .await?;

            let batch_len = payloads.len();
            popped.extend(Self::decode_payloads(identity, payloads));
            if batch_len < POP_BATCH {
                break;
            }
        }

        popped.sort_by_key(|e: &ScheduledEntry| e.due_at);
        Ok(popped)
    }

    async fn identities_with_entries(&self) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{INDEX_PREFIX}*");
        let mut cursor: u64 = 0;
        let mut identities = Vec::new();

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            identities.extend(
                keys.iter()
                    .filter_map(|k| identity_from_key(k))
                    .map(str::to_string),
            );

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        identities.sort();
        identities.dedup();
        Ok(identities)
    }

    async fn entries(&self, identity: &str) -> AppResult<Vec<ScheduledEntry>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(index_key(identity))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let payloads: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(payload_key(identity))
            .arg(&ids)
            .query_async(&mut conn)
            .await?;
        Ok(Self::decode_payloads(identity, payloads))
    }
}
