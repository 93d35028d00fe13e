#![allow(dead_code)]

use async_trait::async_trait;
use realtime_hub_service::{
    backplane::{Backplane, MemoryBackplane},
    config::Config,
    error::{AppError, AppResult},
    models::{ChannelKind, Message, ScheduledEntry},
    services::ChannelGateway,
    state::AppState,
    stores::{memory::MemoryScheduleIndex, MessageStore, ScheduleIndex, Stores},
    websocket::Connection,
};
use serde_json::Value;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use uuid::Uuid;

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE_WINDOW: Duration = Duration::from_millis(150);

/// One hub process: its own registry and instance id, sharing stores and the
/// backplane with every other hub built from the same [`Cluster`].
pub struct Hub {
    pub state: AppState,
    _listener: JoinHandle<()>,
}

impl Hub {
    pub fn instance_id(&self) -> &str {
        &self.state.config.instance_id
    }
}

/// Shared stores and bus for a set of hubs
#[derive(Clone)]
pub struct Cluster {
    pub stores: Stores,
    pub backplane: MemoryBackplane,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_stores(Stores::memory())
    }

    pub fn with_stores(stores: Stores) -> Self {
        Self {
            stores,
            backplane: MemoryBackplane::new(),
        }
    }

    pub async fn hub(&self, instance_id: &str) -> Hub {
        let config = Config {
            instance_id: instance_id.to_string(),
            ..Config::default()
        };
        let backplane: Arc<dyn Backplane> = Arc::new(self.backplane.clone());
        let state = AppState::new(config, self.stores.clone(), backplane);
        let listener = state
            .start_backplane_listener()
            .await
            .expect("memory backplane listener");
        Hub {
            state,
            _listener: listener,
        }
    }
}

/// A client handle registered on a hub, after `on_connect` has run
pub struct Client {
    pub connection: Connection,
    pub rx: UnboundedReceiver<String>,
    gateway: Arc<dyn ChannelGateway>,
}

impl Client {
    pub async fn send(&self, frame: Value) {
        self.gateway
            .on_frame(&self.connection, &frame.to_string())
            .await;
    }

    pub async fn send_raw(&self, text: &str) {
        self.gateway.on_frame(&self.connection, text).await;
    }

    pub async fn disconnect(self) {
        self.gateway.on_disconnect(&self.connection).await;
    }

    /// Next frame, failing the test if none arrives in time
    pub async fn recv(&mut self) -> Value {
        let text = tokio::time::timeout(FRAME_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection channel closed");
        serde_json::from_str(&text).expect("frame is JSON")
    }

    /// Next frame named `event`, discarding any others before it
    pub async fn recv_event(&mut self, event: &str) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["event"] == event {
                return frame;
            }
        }
    }

    /// Every frame that arrives within a short window
    pub async fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(Some(text)) = tokio::time::timeout(SILENCE_WINDOW, self.rx.recv()).await {
            frames.push(serde_json::from_str(&text).expect("frame is JSON"));
        }
        frames
    }

    pub async fn drain_events(&mut self, event: &str) -> Vec<Value> {
        self.drain()
            .await
            .into_iter()
            .filter(|f| f["event"] == event)
            .collect()
    }
}

pub async fn connect(hub: &Hub, identity: &str, channel: ChannelKind) -> Client {
    let gateway: Arc<dyn ChannelGateway> = match channel {
        ChannelKind::Chat => hub.state.chat.clone(),
        ChannelKind::Notification => hub.state.notifications.clone(),
    };
    let (connection, rx) = hub.state.registry.register(identity, channel).await;
    gateway.on_connect(&connection).await;
    Client {
        connection,
        rx,
        gateway,
    }
}

pub async fn chat(hub: &Hub, identity: &str) -> Client {
    connect(hub, identity, ChannelKind::Chat).await
}

pub async fn notifications(hub: &Hub, identity: &str) -> Client {
    connect(hub, identity, ChannelKind::Notification).await
}

pub fn send_message(receiver: &str, content: &str) -> Value {
    serde_json::json!({
        "event": "sendMessage",
        "data": { "receiverId": receiver, "content": content }
    })
}

/// Message store whose writes always fail
pub struct UnavailableMessageStore;

#[async_trait]
impl MessageStore for UnavailableMessageStore {
    async fn insert(&self, _message: &Message) -> AppResult<()> {
        Err(AppError::StoreUnavailable("connection refused".into()))
    }

    async fn mark_read(&self, _message_id: Uuid, _reader: &str) -> AppResult<Option<Message>> {
        Err(AppError::StoreUnavailable("connection refused".into()))
    }

    async fn history(
        &self,
        _a: &str,
        _b: &str,
        _limit: i64,
        _offset: i64,
    ) -> AppResult<Vec<Message>> {
        Err(AppError::StoreUnavailable("connection refused".into()))
    }
}

/// Memory index whose first `failures` inserts are refused
pub struct FailingScheduleIndex {
    inner: MemoryScheduleIndex,
    failures: AtomicUsize,
}

impl FailingScheduleIndex {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: MemoryScheduleIndex::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl ScheduleIndex for FailingScheduleIndex {
    async fn insert(&self, entry: &ScheduledEntry) -> AppResult<bool> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AppError::StoreUnavailable("connection refused".into()));
        }
        self.inner.insert(entry).await
    }

    async fn pop_due_before(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<ScheduledEntry>> {
        self.inner.pop_due_before(identity, now).await
    }

    async fn identities_with_entries(&self) -> AppResult<Vec<String>> {
        self.inner.identities_with_entries().await
    }

    async fn entries(&self, identity: &str) -> AppResult<Vec<ScheduledEntry>> {
        self.inner.entries(identity).await
    }
}
