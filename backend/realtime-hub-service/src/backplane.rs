//! Cross-process relay of frames.
//!
//! `RedisBackplane` wraps the shared pub/sub library. `MemoryBackplane` is a
//! process-local bus; clones share the bus, so several hubs in one test (or a
//! single-instance deployment) see each other's envelopes.

use crate::error::AppResult;
use crate::websocket::{Fanout, RelayEnvelope};
use async_trait::async_trait;
use pubsub_backplane::{BackplaneMessage, BackplanePublisher, BackplaneSubscriber};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[async_trait]
pub trait Backplane: Send + Sync {
    async fn publish(&self, msg: &BackplaneMessage<RelayEnvelope>) -> AppResult<()>;

    /// Start delivering envelopes from other processes into `fanout`.
    async fn listen(&self, fanout: Fanout) -> AppResult<JoinHandle<()>>;
}

pub struct RedisBackplane {
    publisher: BackplanePublisher,
    subscriber: BackplaneSubscriber,
}

impl RedisBackplane {
    pub async fn connect(redis_url: &str, instance_id: &str, channel: &str) -> AppResult<Self> {
        let publisher = BackplanePublisher::with_channel(
            redis_url,
            instance_id.to_string(),
            channel.to_string(),
        )
        .await?;
        let subscriber = BackplaneSubscriber::with_channel(redis_url, channel.to_string()).await?;

        tracing::info!(channel = %channel, instance_id = %instance_id, "Redis backplane connected");
        Ok(Self {
            publisher,
            subscriber,
        })
    }
}

#[async_trait]
impl Backplane for RedisBackplane {
    async fn publish(&self, msg: &BackplaneMessage<RelayEnvelope>) -> AppResult<()> {
        self.publisher.publish_message(msg).await?;
        Ok(())
    }

    async fn listen(&self, fanout: Fanout) -> AppResult<JoinHandle<()>> {
        let handle = self
            .subscriber
            .subscribe(move |msg: BackplaneMessage<RelayEnvelope>| {
                let fanout = fanout.clone();
                async move {
                    fanout.deliver_remote(msg).await;
                    Ok(())
                }
            })
            .await?;
        Ok(handle)
    }
}

#[derive(Clone)]
pub struct MemoryBackplane {
    bus: broadcast::Sender<String>,
}

impl MemoryBackplane {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self { bus }
    }
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn publish(&self, msg: &BackplaneMessage<RelayEnvelope>) -> AppResult<()> {
        let body = serde_json::to_string(msg)?;
        // No receivers means no other hub is listening.
        let _ = self.bus.send(body);
        Ok(())
    }

    async fn listen(&self, fanout: Fanout) -> AppResult<JoinHandle<()>> {
        let mut rx = self.bus.subscribe();

        Ok(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(body) => match pubsub_backplane::decode::<RelayEnvelope>(&body) {
                        Ok(msg) => {
                            fanout.deliver_remote(msg).await;
                        }
                        Err(e) => tracing::error!(error = %e, "Dropping undecodable envelope"),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Memory backplane listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }
}
