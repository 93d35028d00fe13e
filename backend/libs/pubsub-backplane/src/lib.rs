//! Cross-process event backplane over Redis Pub/Sub
//!
//! Lets several replicas of a service behave like one: every replica publishes
//! typed envelopes on a shared channel and every replica (including the
//! publisher) receives them.
//!
//! # Architecture
//!
//! ```text
//! Replica A:
//!   1. Deliver event to locally connected clients
//!   2. PUBLISH realtime-hub:relay {"message_id": "...", "source_instance": "a", "payload": {...}}
//!      ↓
//! Redis Pub/Sub (broadcast to all subscribers)
//!      ↓
//! Replica B, C:
//!   3. Receive envelope, skip if source_instance is self
//!   4. Deliver payload to their own connected clients
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pubsub_backplane::{BackplaneMessage, BackplanePublisher, BackplaneSubscriber};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let publisher = BackplanePublisher::new("redis://localhost:6379", "replica-a".into()).await?;
//!     let subscriber = BackplaneSubscriber::new("redis://localhost:6379").await?;
//!
//!     let handle = subscriber
//!         .subscribe(|msg: BackplaneMessage<String>| async move {
//!             tracing::info!(source = %msg.source_instance, "got {}", msg.payload);
//!             Ok(())
//!         })
//!         .await?;
//!
//!     publisher.publish("hello".to_string()).await?;
//!     handle.abort();
//!     Ok(())
//! }
//! ```

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod error;

pub use error::BackplaneError;

pub type Result<T> = std::result::Result<T, BackplaneError>;

/// Default Redis channel for relayed events
pub const DEFAULT_CHANNEL: &str = "realtime-hub:relay";

/// Envelope carried on the backplane channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneMessage<T> {
    pub message_id: String,
    pub source_instance: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: T,
}

impl<T> BackplaneMessage<T> {
    pub fn new(source_instance: impl Into<String>, payload: T) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            source_instance: source_instance.into(),
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    /// True when the envelope was published by `instance_id`
    pub fn is_from(&self, instance_id: &str) -> bool {
        self.source_instance == instance_id
    }
}

/// Publisher side of the backplane
#[derive(Clone)]
pub struct BackplanePublisher {
    client: ConnectionManager,
    channel: String,
    instance_id: String,
}

impl BackplanePublisher {
    /// Create new publisher on [`DEFAULT_CHANNEL`]
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `instance_id` - Identifier of the publishing process
    pub async fn new(redis_url: &str, instance_id: String) -> Result<Self> {
        Self::with_channel(redis_url, instance_id, DEFAULT_CHANNEL.to_string()).await
    }

    /// Create publisher with custom channel
    pub async fn with_channel(
        redis_url: &str,
        instance_id: String,
        channel: String,
    ) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            client: connection,
            channel,
            instance_id,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wrap `payload` in an envelope and publish it
    ///
    /// Returns number of subscribers that received the message
    pub async fn publish<T: Serialize>(&self, payload: T) -> Result<usize> {
        let msg = BackplaneMessage::new(self.instance_id.clone(), payload);
        self.publish_message(&msg).await
    }

    /// Publish a pre-built envelope
    pub async fn publish_message<T: Serialize>(&self, msg: &BackplaneMessage<T>) -> Result<usize> {
        let body = serde_json::to_string(msg)?;

        debug!(
            message_id = %msg.message_id,
            channel = %self.channel,
            "Publishing backplane message"
        );

        let mut conn = self.client.clone();
        let subscriber_count: usize = conn.publish(&self.channel, body).await?;

        debug!(
            message_id = %msg.message_id,
            subscribers = subscriber_count,
            "Backplane message published"
        );

        Ok(subscriber_count)
    }
}

/// Subscriber side of the backplane
pub struct BackplaneSubscriber {
    client: Client,
    channel: String,
}

impl BackplaneSubscriber {
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_channel(redis_url, DEFAULT_CHANNEL.to_string()).await
    }

    pub async fn with_channel(redis_url: &str, channel: String) -> Result<Self> {
        let client = Client::open(redis_url)?;

        Ok(Self { client, channel })
    }

    /// Subscribe to the channel and run `callback` for every decoded envelope.
    ///
    /// The subscription is established before this returns. Envelopes that
    /// fail to decode are logged and skipped.
    pub async fn subscribe<T, F, Fut>(&self, callback: F) -> Result<JoinHandle<()>>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(BackplaneMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        info!(channel = %self.channel, "Subscribed to backplane channel");

        let callback = Arc::new(callback);
        let channel = self.channel.clone();

        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();

            while let Some(msg) = stream.next().await {
                let body = match msg.get_payload::<String>() {
                    Ok(p) => p,
                    Err(e) => {
                        error!(error = ?e, "Failed to get message payload");
                        continue;
                    }
                };

                let envelope: BackplaneMessage<T> = match decode(&body) {
                    Ok(m) => m,
                    Err(e) => {
                        error!(error = %e, "Failed to decode backplane message");
                        continue;
                    }
                };

                let message_id = envelope.message_id.clone();
                debug!(message_id = %message_id, "Received backplane message");

                if let Err(e) = callback(envelope).await {
                    error!(error = %e, message_id = %message_id, "Callback execution failed");
                }
            }

            warn!(channel = %channel, "Backplane subscription ended");
        });

        Ok(handle)
    }
}

/// Decode a raw channel body into an envelope
pub fn decode<T: DeserializeOwned>(body: &str) -> Result<BackplaneMessage<T>> {
    let envelope: BackplaneMessage<T> = serde_json::from_str(body)?;
    if envelope.source_instance.is_empty() {
        return Err(BackplaneError::InvalidMessage(
            "envelope without source_instance".to_string(),
        ));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        target: String,
        n: u32,
    }

    #[test]
    fn test_new_message_has_unique_id() {
        let a = BackplaneMessage::new("node-1", 1u8);
        let b = BackplaneMessage::new("node-1", 1u8);
        assert_ne!(a.message_id, b.message_id);
        assert!(a.is_from("node-1"));
        assert!(!a.is_from("node-2"));
    }

    #[test]
    fn test_decode_typed_payload() {
        let msg = BackplaneMessage::new(
            "node-1",
            Ping {
                target: "alice".into(),
                n: 3,
            },
        );
        let body = serde_json::to_string(&msg).unwrap();

        let decoded: BackplaneMessage<Ping> = assert_ok!(decode(&body));
        assert_eq!(decoded.message_id, msg.message_id);
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn test_decode_rejects_empty_source() {
        let msg = BackplaneMessage::new("", 7u32);
        let body = serde_json::to_string(&msg).unwrap();

        let err = assert_err!(decode::<u32>(&body));
        assert!(matches!(err, BackplaneError::InvalidMessage(_)));
    }

    #[test]
    fn test_decode_rejects_wrong_payload_type() {
        let msg = BackplaneMessage::new("node-1", "text");
        let body = serde_json::to_string(&msg).unwrap();

        assert!(matches!(
            decode::<Ping>(&body),
            Err(BackplaneError::Serialization(_))
        ));
    }
}
