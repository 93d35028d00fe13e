use crate::services::ChannelGateway;
use crate::websocket::Connection;
use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

// Frame routed to this session by the registry
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct TextMessage(String);

/// One accepted WebSocket connection.
///
/// Inbound text frames are queued to a single worker that runs the gateway's
/// `on_connect`, every frame in arrival order, then `on_disconnect` once the
/// session stops.
pub struct WsSession {
    connection: Connection,
    gateway: Arc<dyn ChannelGateway>,
    outbound: Option<UnboundedReceiver<String>>,
    inbound: Option<UnboundedSender<String>>,
    hb: Instant,
}

impl WsSession {
    pub fn new(
        connection: Connection,
        outbound: UnboundedReceiver<String>,
        gateway: Arc<dyn ChannelGateway>,
    ) -> Self {
        Self {
            connection,
            gateway,
            outbound: Some(outbound),
            inbound: None,
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(
                    connection_id = %act.connection.id,
                    "WebSocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn start_worker(&mut self) {
        let (tx, mut rx) = unbounded_channel::<String>();
        self.inbound = Some(tx);

        let gateway = Arc::clone(&self.gateway);
        let connection = self.connection.clone();
        actix::spawn(async move {
            gateway.on_connect(&connection).await;
            while let Some(text) = rx.recv().await {
                gateway.on_frame(&connection, &text).await;
            }
            gateway.on_disconnect(&connection).await;
        });
    }

    fn forward_outbound(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(mut outbound) = self.outbound.take() else {
            return;
        };
        let addr = ctx.address();
        actix::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if !addr.connected() {
                    break;
                }
                addr.do_send(TextMessage(frame));
            }
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            identity = %self.connection.identity,
            connection_id = %self.connection.id,
            channel = %self.gateway.channel(),
            "WebSocket session started"
        );

        self.hb(ctx);
        self.forward_outbound(ctx);
        self.start_worker();
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            identity = %self.connection.identity,
            connection_id = %self.connection.id,
            "WebSocket session stopped"
        );

        // Closing the queue lets the worker finish pending frames and run on_disconnect
        self.inbound.take();
    }
}

impl Handler<TextMessage> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: TextMessage, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                if let Some(inbound) = &self.inbound {
                    let _ = inbound.send(text.to_string());
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("Binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(?reason, "WebSocket close message received");
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}
