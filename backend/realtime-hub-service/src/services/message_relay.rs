use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{ChannelKind, Message, MessageKind, NewNotification, NotificationKind};
use crate::services::dispatcher::NotificationDispatcher;
use crate::stores::{MessageStore, PresenceStore};
use crate::websocket::events::ChatServerEvent;
use crate::websocket::{Connection, Fanout};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 200;
pub const PREVIEW_CHARS: usize = 50;

/// Notification body for a chat message: the first 50 characters, with an
/// ellipsis when cut.
pub fn message_preview(content: &str) -> String {
    if content.chars().count() > PREVIEW_CHARS {
        let cut: String = content.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        content.to_string()
    }
}

pub struct MessageRelay {
    messages: Arc<dyn MessageStore>,
    directory: Arc<dyn PresenceStore>,
    dispatcher: Arc<NotificationDispatcher>,
    fanout: Fanout,
}

impl MessageRelay {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        directory: Arc<dyn PresenceStore>,
        dispatcher: Arc<NotificationDispatcher>,
        fanout: Fanout,
    ) -> Self {
        Self {
            messages,
            directory,
            dispatcher,
            fanout,
        }
    }

    /// Persist and relay a message sent from `origin`.
    ///
    /// The receiver's handles get `newMessage`, every chat handle of the
    /// sender gets the echo, and `origin` alone gets `messageSent`. A failed
    /// notification is logged and does not fail the send.
    pub async fn send(
        &self,
        origin: &Connection,
        receiver_id: &str,
        content: &str,
        kind: Option<&str>,
    ) -> AppResult<Message> {
        let sender_id = origin.identity.as_str();
        let receiver_id = receiver_id.trim();
        if sender_id.trim().is_empty() || receiver_id.is_empty() || content.trim().is_empty() {
            return Err(AppError::validation("Missing required fields"));
        }
        let kind = match kind {
            Some(k) => k.parse()?,
            None => MessageKind::default(),
        };

        let message = Message::new(sender_id, receiver_id, content, kind);
        self.messages.insert(&message).await?;

        let event = ChatServerEvent::NewMessage(message.clone());
        self.fanout
            .send_to_identity(receiver_id, ChannelKind::Chat, &event)
            .await?;
        if sender_id != receiver_id {
            self.fanout
                .send_to_identity(sender_id, ChannelKind::Chat, &event)
                .await?;
        }
        self.fanout
            .send_to_connection(
                origin,
                &ChatServerEvent::MessageSent {
                    message_id: message.id.to_string(),
                    status: "sent".to_string(),
                },
            )
            .await?;
        metrics::MESSAGES_RELAYED.inc();

        if let Err(e) = self.notify_receiver(&message).await {
            warn!(
                message_id = %message.id,
                receiver = %receiver_id,
                error = %e,
                "Message notification failed"
            );
        }

        debug!(message_id = %message.id, sender = %sender_id, receiver = %receiver_id, "Message relayed");
        Ok(message)
    }

    async fn notify_receiver(&self, message: &Message) -> AppResult<()> {
        let sender_name = match self.directory.find(&message.sender_id).await {
            Ok(Some(identity)) => identity.display_name,
            Ok(None) => message.sender_id.clone(),
            Err(e) => {
                debug!(error = %e, "Directory lookup failed; using sender id as name");
                message.sender_id.clone()
            }
        };

        self.dispatcher
            .immediate(NewNotification {
                target: message.receiver_id.clone(),
                title: format!("New message from {sender_name}"),
                body: message_preview(&message.content),
                kind: NotificationKind::Message {
                    sender_id: message.sender_id.clone(),
                    sender_name,
                    message_id: message.id,
                },
                metadata: Some(json!({ "messageType": message.kind })),
            })
            .await?;
        Ok(())
    }

    /// Flag a message read by its receiver and tell the sender.
    ///
    /// Unknown ids, or a reader who is not the receiver, are a no-op.
    pub async fn mark_read(&self, message_id: &str, reader: &str) -> AppResult<Option<Message>> {
        let Ok(id) = Uuid::parse_str(message_id) else {
            return Ok(None);
        };
        let Some(message) = self.messages.mark_read(id, reader).await? else {
            debug!(message_id = %message_id, reader = %reader, "mark_read ignored");
            return Ok(None);
        };

        self.fanout
            .send_to_identity(
                &message.sender_id,
                ChannelKind::Chat,
                &ChatServerEvent::MessageRead {
                    message_id: message.id.to_string(),
                    read_by: reader.to_string(),
                },
            )
            .await?;
        Ok(Some(message))
    }

    /// Conversation page in chronological order, with `has_more`
    pub async fn history(
        &self,
        a: &str,
        b: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> AppResult<(Vec<Message>, bool)> {
        if b.trim().is_empty() {
            return Err(AppError::validation("Missing required fields"));
        }
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let offset = offset.unwrap_or(0).max(0);

        let mut page = self.messages.history(a, b, limit, offset).await?;
        page.reverse();
        let has_more = page.len() as i64 == limit;
        Ok((page, has_more))
    }

    /// Best-effort typing indicator; never persisted.
    pub async fn typing(&self, sender: &str, receiver: &str, is_typing: bool) {
        if receiver.trim().is_empty() {
            return;
        }
        if let Err(e) = self
            .fanout
            .send_to_identity(
                receiver,
                ChannelKind::Chat,
                &ChatServerEvent::UserTyping {
                    user_id: sender.to_string(),
                    is_typing,
                },
            )
            .await
        {
            debug!(error = %e, "Typing indicator dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_content() {
        let long = "a".repeat(80);
        let preview = message_preview(&long);
        assert_eq!(preview, format!("{}...", "a".repeat(50)));
    }

    #[test]
    fn preview_keeps_short_content() {
        let short = "b".repeat(40);
        assert_eq!(message_preview(&short), short);
        assert_eq!(message_preview(&"c".repeat(50)), "c".repeat(50));
    }

    #[test]
    fn preview_counts_characters_not_bytes() {
        let text = "é".repeat(60);
        let preview = message_preview(&text);
        assert_eq!(preview.chars().count(), 53);
        assert!(preview.ends_with("..."));
    }
}
