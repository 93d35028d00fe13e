use crate::models::{ChannelKind, ConnectionRef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

pub mod events;
pub mod fanout;
pub mod session;

pub use fanout::{Fanout, RelayEnvelope, RelayTarget};

/// Unique identifier for one WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A live connection accepted by this process
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: String,
    pub channel: ChannelKind,
}

impl Connection {
    pub fn reference(&self, instance_id: &str) -> ConnectionRef {
        ConnectionRef::new(instance_id, self.id.as_uuid())
    }
}

struct Subscriber {
    id: ConnectionId,
    channel: ChannelKind,
    sender: UnboundedSender<String>,
}

/// Per-process map from identity to its live connection handles.
///
/// Authoritative only for connections accepted by this process.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    // identity -> live handles on any channel
    inner: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. Frames sent to it arrive on the returned receiver.
    pub async fn register(
        &self,
        identity: &str,
        channel: ChannelKind,
    ) -> (Connection, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        let connection = Connection {
            id: ConnectionId::new(),
            identity: identity.to_string(),
            channel,
        };

        let mut guard = self.inner.write().await;
        let handles = guard.entry(identity.to_string()).or_default();
        handles.push(Subscriber {
            id: connection.id,
            channel,
            sender: tx,
        });

        tracing::debug!(
            identity = %identity,
            connection_id = %connection.id,
            channel = %channel,
            handles = handles.len(),
            "Registered connection"
        );

        (connection, rx)
    }

    /// Remove a handle. Returns how many handles remain for the identity on
    /// the same channel.
    pub async fn unregister(&self, connection: &Connection) -> usize {
        let mut guard = self.inner.write().await;

        let Some(handles) = guard.get_mut(&connection.identity) else {
            return 0;
        };
        handles.retain(|s| s.id != connection.id);
        let remaining = handles
            .iter()
            .filter(|s| s.channel == connection.channel)
            .count();

        tracing::debug!(
            identity = %connection.identity,
            connection_id = %connection.id,
            remaining,
            "Unregistered connection"
        );

        if handles.is_empty() {
            guard.remove(&connection.identity);
        }
        remaining
    }

    /// Deliver a frame to every handle of `identity` on `channel`.
    ///
    /// Dead senders are dropped. Returns the number of handles reached.
    pub async fn send_to_identity(&self, identity: &str, channel: ChannelKind, frame: &str) -> usize {
        let mut guard = self.inner.write().await;
        let Some(handles) = guard.get_mut(identity) else {
            return 0;
        };

        let mut delivered = 0;
        handles.retain(|s| {
            if s.channel != channel {
                return true;
            }
            let alive = s.sender.send(frame.to_string()).is_ok();
            if alive {
                delivered += 1;
            }
            alive
        });
        if handles.is_empty() {
            guard.remove(identity);
        }
        delivered
    }

    /// Deliver a frame to one handle only
    pub async fn send_to_connection(&self, connection: &Connection, frame: &str) -> bool {
        let guard = self.inner.read().await;
        guard
            .get(&connection.identity)
            .and_then(|handles| handles.iter().find(|s| s.id == connection.id))
            .map(|s| s.sender.send(frame.to_string()).is_ok())
            .unwrap_or(false)
    }

    /// Deliver a frame to every handle on `channel`, optionally skipping one
    pub async fn broadcast(
        &self,
        channel: ChannelKind,
        frame: &str,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let mut guard = self.inner.write().await;
        let mut delivered = 0;

        for handles in guard.values_mut() {
            handles.retain(|s| {
                if s.channel != channel || Some(s.id) == exclude {
                    return true;
                }
                let alive = s.sender.send(frame.to_string()).is_ok();
                if alive {
                    delivered += 1;
                }
                alive
            });
        }
        guard.retain(|_, handles| !handles.is_empty());

        tracing::debug!(channel = %channel, delivered, "Broadcast frame");
        delivered
    }

    pub async fn connection_count(&self, identity: &str, channel: ChannelKind) -> usize {
        let guard = self.inner.read().await;
        guard
            .get(identity)
            .map(|handles| handles.iter().filter(|s| s.channel == channel).count())
            .unwrap_or(0)
    }

    /// Identities with at least one local handle on `channel`
    pub async fn identities(&self, channel: ChannelKind) -> Vec<String> {
        let guard = self.inner.read().await;
        guard
            .iter()
            .filter(|(_, handles)| handles.iter().any(|s| s.channel == channel))
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    pub async fn total_connections(&self) -> usize {
        let guard = self.inner.read().await;
        guard.values().map(|v| v.len()).sum()
    }
}
