use crate::backplane::Backplane;
use crate::error::AppResult;
use crate::metrics;
use crate::models::ChannelKind;
use crate::websocket::events::encode;
use crate::websocket::{Connection, ConnectionId, ConnectionRegistry};
use pubsub_backplane::BackplaneMessage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RelayTarget {
    Identity { identity: String },
    All,
}

/// Frame relayed to other processes over the backplane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub target: RelayTarget,
    pub channel: ChannelKind,
    pub frame: String,
}

/// Delivers frames to local handles and mirrors them to the other processes.
#[derive(Clone)]
pub struct Fanout {
    registry: ConnectionRegistry,
    backplane: Arc<dyn Backplane>,
    instance_id: Arc<str>,
}

impl Fanout {
    pub fn new(
        registry: ConnectionRegistry,
        backplane: Arc<dyn Backplane>,
        instance_id: &str,
    ) -> Self {
        Self {
            registry,
            backplane,
            instance_id: Arc::from(instance_id),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Send an event to every handle of `identity` on `channel`, on every process.
    ///
    /// Returns the number of local handles reached. An unreachable recipient
    /// is not an error.
    pub async fn send_to_identity<E: Serialize>(
        &self,
        identity: &str,
        channel: ChannelKind,
        event: &E,
    ) -> AppResult<usize> {
        let frame = encode(event)?;
        let delivered = self
            .registry
            .send_to_identity(identity, channel, &frame)
            .await;

        self.publish(RelayEnvelope {
            target: RelayTarget::Identity {
                identity: identity.to_string(),
            },
            channel,
            frame,
        })
        .await;

        Ok(delivered)
    }

    /// Send an event to one local connection only
    pub async fn send_to_connection<E: Serialize>(
        &self,
        connection: &Connection,
        event: &E,
    ) -> AppResult<bool> {
        let frame = encode(event)?;
        Ok(self.registry.send_to_connection(connection, &frame).await)
    }

    /// Send an event to every handle on `channel` deployment-wide. `exclude`
    /// names a local connection to skip.
    pub async fn broadcast<E: Serialize>(
        &self,
        channel: ChannelKind,
        event: &E,
        exclude: Option<ConnectionId>,
    ) -> AppResult<usize> {
        let frame = encode(event)?;
        let delivered = self.registry.broadcast(channel, &frame, exclude).await;

        self.publish(RelayEnvelope {
            target: RelayTarget::All,
            channel,
            frame,
        })
        .await;

        Ok(delivered)
    }

    /// Deliver an envelope received from the backplane to local handles.
    ///
    /// Envelopes published by this process were already delivered locally.
    pub async fn deliver_remote(&self, msg: BackplaneMessage<RelayEnvelope>) -> usize {
        if msg.is_from(&self.instance_id) {
            return 0;
        }

        let envelope = msg.payload;
        let delivered = match &envelope.target {
            RelayTarget::Identity { identity } => {
                self.registry
                    .send_to_identity(identity, envelope.channel, &envelope.frame)
                    .await
            }
            RelayTarget::All => {
                self.registry
                    .broadcast(envelope.channel, &envelope.frame, None)
                    .await
            }
        };

        tracing::debug!(
            message_id = %msg.message_id,
            source = %msg.source_instance,
            delivered,
            "Delivered relayed frame"
        );
        delivered
    }

    async fn publish(&self, envelope: RelayEnvelope) {
        let msg = BackplaneMessage::new(self.instance_id.to_string(), envelope);
        if let Err(e) = self.backplane.publish(&msg).await {
            metrics::BACKPLANE_PUBLISH_FAILURES.inc();
            tracing::warn!(
                error = %e,
                message_id = %msg.message_id,
                "Backplane publish failed; remote handles not reached"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::MemoryBackplane;
    use crate::websocket::events::ChatServerEvent;

    #[tokio::test]
    async fn own_envelopes_are_not_redelivered() {
        let registry = ConnectionRegistry::new();
        let fanout = Fanout::new(registry.clone(), Arc::new(MemoryBackplane::new()), "node-a");
        let (_conn, mut rx) = registry.register("bob", ChannelKind::Chat).await;

        let delivered = fanout
            .send_to_identity("bob", ChannelKind::Chat, &ChatServerEvent::error("x"))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        let frame = rx.recv().await.unwrap();

        let echoed = BackplaneMessage::new(
            "node-a",
            RelayEnvelope {
                target: RelayTarget::Identity {
                    identity: "bob".into(),
                },
                channel: ChannelKind::Chat,
                frame: frame.clone(),
            },
        );
        assert_eq!(fanout.deliver_remote(echoed).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_envelopes_reach_local_handles() {
        let registry = ConnectionRegistry::new();
        let fanout = Fanout::new(registry.clone(), Arc::new(MemoryBackplane::new()), "node-b");
        let (_conn, mut rx) = registry.register("bob", ChannelKind::Notification).await;

        let msg = BackplaneMessage::new(
            "node-a",
            RelayEnvelope {
                target: RelayTarget::All,
                channel: ChannelKind::Notification,
                frame: "{}".into(),
            },
        );
        assert_eq!(fanout.deliver_remote(msg).await, 1);
        assert_eq!(rx.recv().await.as_deref(), Some("{}"));
    }
}
