use super::{ChannelGateway, NotificationDispatcher};
use crate::error::AppError;
use crate::metrics;
use crate::models::ChannelKind;
use crate::stores::PresenceStore;
use crate::websocket::events::{self, NotificationClientEvent, NotificationServerEvent};
use crate::websocket::{Connection, Fanout};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Notification channel: unread counts, listing and read flags
pub struct NotificationGateway {
    directory: Arc<dyn PresenceStore>,
    dispatcher: Arc<NotificationDispatcher>,
    fanout: Fanout,
}

impl NotificationGateway {
    pub fn new(
        directory: Arc<dyn PresenceStore>,
        dispatcher: Arc<NotificationDispatcher>,
        fanout: Fanout,
    ) -> Self {
        Self {
            directory,
            dispatcher,
            fanout,
        }
    }

    async fn reply(&self, connection: &Connection, event: &NotificationServerEvent) {
        if let Err(e) = self.fanout.send_to_connection(connection, event).await {
            warn!(connection_id = %connection.id, error = %e, "Failed to encode notification reply");
        }
    }

    async fn reply_error(&self, connection: &Connection, err: &AppError) {
        debug!(connection_id = %connection.id, error = %err, "Notification event rejected");
        self.reply(connection, &NotificationServerEvent::error(err.client_message()))
            .await;
    }

    async fn handle(&self, connection: &Connection, event: NotificationClientEvent) -> Result<(), AppError> {
        let identity = connection.identity.as_str();
        match event {
            NotificationClientEvent::GetNotifications { limit, offset } => {
                let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
                let offset = offset.unwrap_or(0).max(0);
                let (notifications, has_more) =
                    self.dispatcher.list(identity, limit, offset).await?;
                self.reply(
                    connection,
                    &NotificationServerEvent::NotificationList {
                        notifications,
                        has_more,
                    },
                )
                .await;
            }
            NotificationClientEvent::MarkAsRead { notification_id } => {
                if !self.dispatcher.mark_read(&notification_id, identity).await? {
                    debug!(notification_id = %notification_id, "mark_read ignored");
                    return Ok(());
                }
                let count = self.dispatcher.unread_count(identity).await?;
                self.fanout
                    .send_to_identity(
                        identity,
                        ChannelKind::Notification,
                        &NotificationServerEvent::UnreadCount { count },
                    )
                    .await?;
                self.fanout
                    .send_to_identity(
                        identity,
                        ChannelKind::Notification,
                        &NotificationServerEvent::NotificationRead { notification_id },
                    )
                    .await?;
            }
            NotificationClientEvent::MarkAllAsRead {} => {
                self.dispatcher.mark_all_read(identity).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelGateway for NotificationGateway {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Notification
    }

    async fn on_connect(&self, connection: &Connection) {
        let identity = connection.identity.as_str();
        metrics::ACTIVE_CONNECTIONS
            .with_label_values(&["notification"])
            .inc();

        if let Err(e) = self.directory.find_or_create(identity).await {
            warn!(identity = %identity, error = %e, "Directory lookup failed");
        }

        match self.dispatcher.unread_count(identity).await {
            Ok(count) => {
                self.reply(connection, &NotificationServerEvent::UnreadCount { count })
                    .await
            }
            Err(e) => warn!(identity = %identity, error = %e, "Unread count unavailable"),
        }
        info!(identity = %identity, connection_id = %connection.id, "Notification channel connected");
    }

    async fn on_frame(&self, connection: &Connection, text: &str) {
        let result = match events::decode::<NotificationClientEvent>(text) {
            Ok(event) => self.handle(connection, event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.reply_error(connection, &e).await;
        }
    }

    async fn on_disconnect(&self, connection: &Connection) {
        metrics::ACTIVE_CONNECTIONS
            .with_label_values(&["notification"])
            .dec();
        self.fanout.registry().unregister(connection).await;
        info!(
            identity = %connection.identity,
            connection_id = %connection.id,
            "Notification channel disconnected"
        );
    }
}
