use super::{ChannelGateway, MessageRelay};
use crate::error::AppError;
use crate::metrics;
use crate::models::ChannelKind;
use crate::stores::PresenceStore;
use crate::websocket::events::{self, ChatClientEvent, ChatServerEvent};
use crate::websocket::{Connection, Fanout};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Chat channel: presence announcements and message relay
pub struct ChatGateway {
    presence: Arc<dyn PresenceStore>,
    relay: Arc<MessageRelay>,
    fanout: Fanout,
}

impl ChatGateway {
    pub fn new(presence: Arc<dyn PresenceStore>, relay: Arc<MessageRelay>, fanout: Fanout) -> Self {
        Self {
            presence,
            relay,
            fanout,
        }
    }

    pub fn relay(&self) -> &Arc<MessageRelay> {
        &self.relay
    }

    async fn reply(&self, connection: &Connection, event: &ChatServerEvent) {
        if let Err(e) = self.fanout.send_to_connection(connection, event).await {
            warn!(connection_id = %connection.id, error = %e, "Failed to encode chat reply");
        }
    }

    async fn reply_error(&self, connection: &Connection, err: &AppError) {
        debug!(connection_id = %connection.id, error = %err, "Chat event rejected");
        self.reply(connection, &ChatServerEvent::error(err.client_message()))
            .await;
    }

    /// Online identities other than `own`. Falls back to local handles when
    /// the presence store is down.
    async fn online_snapshot(&self, own: &str) -> Vec<String> {
        let online = match self.presence.list_online().await {
            Ok(online) => online,
            Err(e) => {
                warn!(error = %e, "Presence store unavailable; using local snapshot");
                self.fanout.registry().identities(ChannelKind::Chat).await
            }
        };
        online.into_iter().filter(|id| id != own).collect()
    }

    async fn announce(&self, event: ChatServerEvent, exclude: Option<&Connection>) {
        if let Err(e) = self
            .fanout
            .broadcast(ChannelKind::Chat, &event, exclude.map(|c| c.id))
            .await
        {
            warn!(error = %e, "Failed to broadcast presence change");
        }
    }

    /// Announce identities left online by a crashed instance as offline
    pub async fn announce_offline(&self, identities: &[String]) {
        for identity in identities {
            self.announce(
                ChatServerEvent::UserOffline {
                    user_id: identity.clone(),
                },
                None,
            )
            .await;
        }
    }
}

#[async_trait]
impl ChannelGateway for ChatGateway {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Chat
    }

    /// Snapshot first, then mark online, so the client never sees itself in
    /// its own `onlineUsersList`.
    async fn on_connect(&self, connection: &Connection) {
        let identity = connection.identity.as_str();
        metrics::ACTIVE_CONNECTIONS
            .with_label_values(&["chat"])
            .inc();

        if let Err(e) = self.presence.find_or_create(identity).await {
            warn!(identity = %identity, error = %e, "Directory lookup failed");
        }

        let online_users = self.online_snapshot(identity).await;
        self.reply(connection, &ChatServerEvent::OnlineUsersList { online_users })
            .await;

        let reference = connection.reference(self.fanout.instance_id());
        let newly_online = match self.presence.set_online(identity, &reference).await {
            Ok(newly_online) => newly_online,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Presence update failed; using local registry");
                self.fanout
                    .registry()
                    .connection_count(identity, ChannelKind::Chat)
                    .await
                    == 1
            }
        };

        info!(identity = %identity, connection_id = %connection.id, newly_online, "Chat connected");
        if newly_online {
            self.announce(
                ChatServerEvent::UserOnline {
                    user_id: identity.to_string(),
                },
                Some(connection),
            )
            .await;
        }
    }

    async fn on_frame(&self, connection: &Connection, text: &str) {
        let event: ChatClientEvent = match events::decode(text) {
            Ok(event) => event,
            Err(e) => {
                self.reply_error(connection, &e).await;
                return;
            }
        };

        match event {
            ChatClientEvent::SendMessage {
                receiver_id,
                content,
                kind,
            } => {
                if let Err(e) = self
                    .relay
                    .send(connection, &receiver_id, &content, kind.as_deref())
                    .await
                {
                    self.reply_error(connection, &e).await;
                }
            }
            ChatClientEvent::MarkAsRead { message_id } => {
                if let Err(e) = self.relay.mark_read(&message_id, &connection.identity).await {
                    self.reply_error(connection, &e).await;
                }
            }
            ChatClientEvent::GetMessages {
                other_user_id,
                limit,
                offset,
            } => match self
                .relay
                .history(&connection.identity, &other_user_id, limit, offset)
                .await
            {
                Ok((messages, has_more)) => {
                    self.reply(
                        connection,
                        &ChatServerEvent::MessageHistory { messages, has_more },
                    )
                    .await;
                }
                Err(e) => self.reply_error(connection, &e).await,
            },
            ChatClientEvent::Typing {
                receiver_id,
                is_typing,
            } => {
                self.relay
                    .typing(&connection.identity, &receiver_id, is_typing)
                    .await;
            }
        }
    }

    async fn on_disconnect(&self, connection: &Connection) {
        let identity = connection.identity.as_str();
        metrics::ACTIVE_CONNECTIONS
            .with_label_values(&["chat"])
            .dec();
        let local_remaining = self.fanout.registry().unregister(connection).await;

        let reference = connection.reference(self.fanout.instance_id());
        let still_online = match self.presence.set_offline(identity, &reference).await {
            Ok(still_online) => still_online,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Presence update failed; using local registry");
                local_remaining > 0
            }
        };

        info!(identity = %identity, connection_id = %connection.id, still_online, "Chat disconnected");
        if !still_online {
            self.announce(
                ChatServerEvent::UserOffline {
                    user_id: identity.to_string(),
                },
                None,
            )
            .await;
        }
    }
}
