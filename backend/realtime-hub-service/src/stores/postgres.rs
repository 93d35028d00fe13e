//! Postgres-backed directory, presence, messages and notifications.

use super::{MessageStore, NotificationStore, PresenceStore};
use crate::error::AppResult;
use crate::models::{
    default_display_name, ConnectionRef, Identity, Message, MessageKind, Notification,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};
use uuid::Uuid;

const NOTIFICATION_COLUMNS: &str = "id, user_id, title, body, kind, kind_payload, metadata, \
                                    is_read, is_sent, due_at, created_at";

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, kind, is_read, created_at";

// Postgres caps bind parameters at 65535; 10 per notification row.
const INSERT_BATCH: usize = 1000;

fn identity_from_row(row: &PgRow) -> AppResult<Identity> {
    Ok(Identity {
        id: row.try_get("identity")?,
        display_name: row.try_get("display_name")?,
        is_online: row.try_get("is_online")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn message_from_row(row: &PgRow) -> AppResult<Message> {
    let kind: String = row.try_get("kind")?;
    Ok(Message {
        id: row.try_get("id")?,
        sender_id: row.try_get("sender_id")?,
        receiver_id: row.try_get("receiver_id")?,
        content: row.try_get("content")?,
        kind: kind.parse().unwrap_or(MessageKind::Text),
        created_at: row.try_get("created_at")?,
        is_read: row.try_get("is_read")?,
    })
}

fn notification_from_row(row: &PgRow) -> AppResult<Notification> {
    let kind_payload: Value = row.try_get("kind_payload")?;
    Ok(Notification {
        id: row.try_get("id")?,
        target: row.try_get("user_id")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        kind: serde_json::from_value(kind_payload)?,
        is_read: row.try_get("is_read")?,
        is_sent: row.try_get("is_sent")?,
        due_at: row.try_get("due_at")?,
        created_at: row.try_get("created_at")?,
        metadata: row.try_get("metadata")?,
    })
}

#[derive(Clone)]
pub struct PgPresenceStore {
    db: PgPool,
}

impl PgPresenceStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PresenceStore for PgPresenceStore {
    async fn find_or_create(&self, identity: &str) -> AppResult<Identity> {
        let row = sqlx::query(
            r#"
            INSERT INTO identities (identity, display_name)
            VALUES ($1, $2)
            ON CONFLICT (identity) DO UPDATE SET identity = EXCLUDED.identity
            RETURNING identity, display_name, is_online, last_seen
            "#,
        )
        .bind(identity)
        .bind(default_display_name(identity))
        .fetch_one(&self.db)
        .await?;

        identity_from_row(&row)
    }

    async fn find(&self, identity: &str) -> AppResult<Option<Identity>> {
        let row = sqlx::query(
            "SELECT identity, display_name, is_online, last_seen FROM identities WHERE identity = $1",
        )
        .bind(identity)
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(identity_from_row).transpose()
    }

    async fn set_online(&self, identity: &str, connection: &ConnectionRef) -> AppResult<bool> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO identities (identity, display_name)
            VALUES ($1, $2)
            ON CONFLICT (identity) DO NOTHING
            "#,
        )
        .bind(identity)
        .bind(default_display_name(identity))
        .execute(&mut *tx)
        .await?;

        // Serializes concurrent transitions of the same identity across processes.
        let was_online: bool =
            sqlx::query_scalar("SELECT is_online FROM identities WHERE identity = $1 FOR UPDATE")
                .bind(identity)
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO presence_connections (identity, instance_id, connection_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(identity)
        .bind(&connection.instance_id)
        .bind(connection.connection_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE identities SET is_online = TRUE, last_seen = NOW() WHERE identity = $1")
            .bind(identity)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(identity = %identity, connection = %connection, was_online, "Presence online");
        Ok(!was_online)
    }

    async fn set_offline(&self, identity: &str, connection: &ConnectionRef) -> AppResult<bool> {
        let mut tx = self.db.begin().await?;

        let locked = sqlx::query("SELECT identity FROM identities WHERE identity = $1 FOR UPDATE")
            .bind(identity)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            DELETE FROM presence_connections
            WHERE identity = $1 AND instance_id = $2 AND connection_id = $3
            "#,
        )
        .bind(identity)
        .bind(&connection.instance_id)
        .bind(connection.connection_id)
        .execute(&mut *tx)
        .await?;

        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM presence_connections WHERE identity = $1")
                .bind(identity)
                .fetch_one(&mut *tx)
                .await?;
        let still_online = remaining > 0;

        sqlx::query("UPDATE identities SET is_online = $2, last_seen = NOW() WHERE identity = $1")
            .bind(identity)
            .bind(still_online)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(identity = %identity, connection = %connection, remaining, "Presence offline");
        Ok(still_online)
    }

    async fn is_online(&self, identity: &str) -> AppResult<bool> {
        let online: Option<bool> =
            sqlx::query_scalar("SELECT is_online FROM identities WHERE identity = $1")
                .bind(identity)
                .fetch_optional(&self.db)
                .await?;
        Ok(online.unwrap_or(false))
    }

    async fn list_online(&self) -> AppResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT identity FROM identities WHERE is_online ORDER BY identity",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(ids)
    }

    async fn list_identities(&self) -> AppResult<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT identity FROM identities ORDER BY identity")
                .fetch_all(&self.db)
                .await?;
        Ok(ids)
    }

    async fn purge_instance(&self, instance_id: &str) -> AppResult<Vec<String>> {
        let mut tx = self.db.begin().await?;

        let touched: Vec<String> = sqlx::query_scalar(
            "DELETE FROM presence_connections WHERE instance_id = $1 RETURNING identity",
        )
        .bind(instance_id)
        .fetch_all(&mut *tx)
        .await?;

        let went_offline: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE identities i
            SET is_online = FALSE, last_seen = NOW()
            WHERE i.identity = ANY($1)
              AND i.is_online
              AND NOT EXISTS (
                  SELECT 1 FROM presence_connections pc WHERE pc.identity = i.identity
              )
            RETURNING i.identity
            "#,
        )
        .bind(&touched)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            instance_id = %instance_id,
            purged = touched.len(),
            offline = went_offline.len(),
            "Purged stale presence references"
        );
        Ok(went_offline)
    }
}

#[derive(Clone)]
pub struct PgMessageStore {
    db: PgPool,
}

impl PgMessageStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn insert(&self, message: &Message) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, sender_id, receiver_id, content, kind, is_read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(message.id)
        .bind(&message.sender_id)
        .bind(&message.receiver_id)
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(message.is_read)
        .bind(message.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_read(&self, message_id: Uuid, reader: &str) -> AppResult<Option<Message>> {
        let query = format!(
            "UPDATE messages SET is_read = TRUE WHERE id = $1 AND receiver_id = $2 RETURNING {MESSAGE_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(message_id)
            .bind(reader)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    async fn history(&self, a: &str, b: &str, limit: i64, offset: i64) -> AppResult<Vec<Message>> {
        let query = format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE (sender_id = $1 AND receiver_id = $2)
               OR (sender_id = $2 AND receiver_id = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        );
        let rows = sqlx::query(&query)
            .bind(a)
            .bind(b)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(message_from_row).collect()
    }
}

#[derive(Clone)]
pub struct PgNotificationStore {
    db: PgPool,
}

impl PgNotificationStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, notification: &Notification) -> AppResult<()> {
        self.insert_many(std::slice::from_ref(notification)).await?;
        Ok(())
    }

    async fn insert_many(&self, notifications: &[Notification]) -> AppResult<u64> {
        let mut inserted = 0;
        let mut tx = self.db.begin().await?;

        for chunk in notifications.chunks(INSERT_BATCH) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO notifications (id, user_id, title, body, kind, kind_payload, \
                 metadata, is_read, is_sent, due_at, created_at) ",
            );
            let mut payloads = Vec::with_capacity(chunk.len());
            for n in chunk {
                payloads.push(serde_json::to_value(&n.kind)?);
            }

            builder.push_values(chunk.iter().zip(payloads), |mut b, (n, payload)| {
                b.push_bind(n.id)
                    .push_bind(n.target.clone())
                    .push_bind(n.title.clone())
                    .push_bind(n.body.clone())
                    .push_bind(n.kind.as_str())
                    .push_bind(payload)
                    .push_bind(n.metadata.clone())
                    .push_bind(n.is_read)
                    .push_bind(n.is_sent)
                    .push_bind(n.due_at)
                    .push_bind(n.created_at);
            });

            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get(&self, id: Uuid, identity: &str) -> AppResult<Option<Notification>> {
        let query =
            format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = $1 AND user_id = $2");
        let row = sqlx::query(&query)
            .bind(id)
            .bind(identity)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(notification_from_row).transpose()
    }

    async fn mark_sent(&self, id: Uuid, identity: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET is_sent = TRUE WHERE id = $1 AND user_id = $2 AND NOT is_sent",
        )
        .bind(id)
        .bind(identity)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn discard_unsent(&self, id: Uuid, identity: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "DELETE FROM notifications WHERE id = $1 AND user_id = $2 AND NOT is_sent",
        )
        .bind(id)
        .bind(identity)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, identity: &str, limit: i64, offset: i64) -> AppResult<Vec<Notification>> {
        let query = format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS} FROM notifications
            WHERE user_id = $1 AND is_sent
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        );
        let rows = sqlx::query(&query)
            .bind(identity)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(notification_from_row).collect()
    }

    async fn unread_count(&self, identity: &str) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND is_sent AND NOT is_read",
        )
        .bind(identity)
        .fetch_one(&self.db)
        .await?;
        Ok(count)
    }

    async fn mark_read(&self, id: Uuid, identity: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = TRUE WHERE id = $1 AND user_id = $2 AND is_sent",
        )
        .bind(id)
        .bind(identity)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_read(&self, identity: &str) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = TRUE WHERE user_id = $1 AND is_sent AND NOT is_read",
        )
        .bind(identity)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn pending_before(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Notification>> {
        let query = format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS} FROM notifications
            WHERE NOT is_sent AND due_at <= $1
            ORDER BY due_at
            LIMIT 1000
            "#
        );
        let rows = sqlx::query(&query)
            .bind(cutoff)
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(notification_from_row).collect()
    }
}
