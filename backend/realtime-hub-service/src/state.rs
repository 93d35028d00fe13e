use crate::{
    backplane::Backplane,
    config::Config,
    error::AppResult,
    services::{ChatGateway, MessageRelay, NotificationDispatcher, NotificationGateway},
    stores::{PresenceStore, Stores},
    websocket::{ConnectionRegistry, Fanout},
};
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ConnectionRegistry,
    pub fanout: Fanout,
    pub backplane: Arc<dyn Backplane>,
    pub presence: Arc<dyn PresenceStore>,
    pub stores: Stores,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub relay: Arc<MessageRelay>,
    pub chat: Arc<ChatGateway>,
    pub notifications: Arc<NotificationGateway>,
}

impl AppState {
    /// Wire the hub components over the given stores and backplane.
    pub fn new(config: Config, stores: Stores, backplane: Arc<dyn Backplane>) -> Self {
        let registry = ConnectionRegistry::new();
        let fanout = Fanout::new(registry.clone(), Arc::clone(&backplane), &config.instance_id);

        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&stores.notifications),
            Arc::clone(&stores.schedule),
            Arc::clone(&stores.presence),
            fanout.clone(),
        ));
        let relay = Arc::new(MessageRelay::new(
            Arc::clone(&stores.messages),
            Arc::clone(&stores.presence),
            Arc::clone(&dispatcher),
            fanout.clone(),
        ));
        let chat = Arc::new(ChatGateway::new(
            Arc::clone(&stores.presence),
            Arc::clone(&relay),
            fanout.clone(),
        ));
        let notifications = Arc::new(NotificationGateway::new(
            Arc::clone(&stores.presence),
            Arc::clone(&dispatcher),
            fanout.clone(),
        ));

        Self {
            config: Arc::new(config),
            registry,
            fanout,
            backplane,
            presence: Arc::clone(&stores.presence),
            stores,
            dispatcher,
            relay,
            chat,
            notifications,
        }
    }

    /// Start receiving frames relayed by other instances.
    pub async fn start_backplane_listener(&self) -> AppResult<JoinHandle<()>> {
        self.backplane.listen(self.fanout.clone()).await
    }

    /// Drop presence references a previous run of this instance left behind
    /// and announce the identities that went offline.
    pub async fn purge_stale_presence(&self) -> AppResult<usize> {
        let offline = self
            .presence
            .purge_instance(&self.config.instance_id)
            .await?;
        self.chat.announce_offline(&offline).await;
        Ok(offline.len())
    }
}
