use crate::models::ChannelKind;
use crate::websocket::Connection;
use async_trait::async_trait;

pub mod chat_gateway;
pub mod demo_generator;
pub mod dispatcher;
pub mod message_relay;
pub mod notification_gateway;
pub mod scheduler;

pub use chat_gateway::ChatGateway;
pub use dispatcher::{NotificationDispatcher, PollReport};
pub use message_relay::MessageRelay;
pub use notification_gateway::NotificationGateway;

/// Lifecycle of one WebSocket channel.
///
/// A session calls `on_connect` once, `on_frame` for each inbound text frame
/// in arrival order, then `on_disconnect` once. Calls for one connection never
/// overlap.
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    fn channel(&self) -> ChannelKind;

    async fn on_connect(&self, connection: &Connection);

    async fn on_frame(&self, connection: &Connection, text: &str);

    async fn on_disconnect(&self, connection: &Connection);
}
