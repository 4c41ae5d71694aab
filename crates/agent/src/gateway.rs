//! Control-channel connector.
//!
//! Maintains exactly one live websocket connection to the remote controller,
//! authenticated by a static token carried in a `TOKEN` handshake header.
//! While connected, a receive loop fills the inbound command queue and a
//! send loop drains the outbound event queue; the two run as siblings and
//! whichever exits first tears the other down with the connection.
//!
//! Faults never escape: the outer loop classifies them, applies the
//! reconnect policy (immediate for transport faults, extended backoff when
//! the controller actively refuses the handshake), and connects again until
//! the shutdown token is set. The dispatcher and workflows never notice a
//! disconnect; their queues simply stall and resume after reconnect.

use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::HeaderValue;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use certrelay_protocol::{InboundMessage, OutboundEvent};

use crate::context::AgentContext;
use crate::errors::GatewayError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Name of the handshake header carrying the agent credential.
pub const TOKEN_HEADER: &str = "TOKEN";

/// Resilient connector for the control channel.
pub struct Gateway {
    ctx: Arc<AgentContext>,
}

impl Gateway {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// Build the authenticated handshake request.
    fn build_request(&self) -> Result<Request, GatewayError> {
        let gateway = &self.ctx.config.gateway;
        let mut request = gateway
            .connect_url
            .as_str()
            .into_client_request()
            .map_err(GatewayError::classify)?;

        let token = HeaderValue::from_str(&gateway.connect_token)
            .map_err(|e| GatewayError::Unexpected(format!("invalid connect token: {e}")))?;
        request.headers_mut().insert(TOKEN_HEADER, token);
        Ok(request)
    }

    /// Run the connector until the shutdown token is set.
    ///
    /// Owns the outbound queue receiver for the lifetime of the agent; the
    /// queue survives across reconnects, so events accumulated while
    /// disconnected are delivered once a connection is back.
    pub async fn run(self, mut outbound_rx: mpsc::UnboundedReceiver<OutboundEvent>) {
        let shutdown = self.ctx.shutdown.clone();
        let rejected_backoff = self.ctx.config.gateway.rejected_backoff();

        while !shutdown.is_cancelled() {
            let fault = tokio::select! {
                _ = shutdown.cancelled() => break,
                fault = self.connect_and_serve(&mut outbound_rx) => fault,
            };

            match &fault {
                GatewayError::Disconnected(reason) => {
                    warn!(reason = %reason, "Disconnected from controller");
                }
                GatewayError::Rejected { status } => {
                    warn!(
                        status = status,
                        backoff_secs = rejected_backoff.as_secs(),
                        "Controller rejected connection, backing off"
                    );
                }
                GatewayError::NonTextFrame => {
                    warn!("Controller sent a non-text frame, dropping connection");
                }
                GatewayError::Unexpected(detail) => {
                    error!(detail = %detail, "Unexpected control channel fault");
                }
            }

            let delay = fault.reconnect_delay(rejected_backoff);
            if !delay.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        info!("Control channel connector shutting down");
    }

    /// One connection lifetime: connect, then serve both directions until
    /// either loop faults. Returns the fault that ended the connection.
    async fn connect_and_serve(
        &self,
        outbound_rx: &mut mpsc::UnboundedReceiver<OutboundEvent>,
    ) -> GatewayError {
        let request = match self.build_request() {
            Ok(request) => request,
            Err(fault) => return fault,
        };

        let (stream, _) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(e) => return GatewayError::classify(e),
        };
        info!(url = %self.ctx.config.gateway.connect_url, "Connected to controller");

        let (sink, source) = stream.split();
        let (pong_tx, pong_rx) = mpsc::channel(1);

        // Sibling discipline: the losing branch is dropped, which cancels
        // its loop and tears the connection down with it.
        tokio::select! {
            fault = Self::receive_loop(self.ctx.clone(), source, pong_tx) => fault,
            fault = Self::send_loop(sink, outbound_rx, pong_rx) => fault,
        }
    }

    /// Receive loop: decode text frames into inbound commands.
    ///
    /// A malformed payload is dropped and logged without disturbing the
    /// connection; a non-text frame violates the framing contract and is
    /// fatal for this connection.
    async fn receive_loop(
        ctx: Arc<AgentContext>,
        mut source: WsSource,
        pong_tx: mpsc::Sender<()>,
    ) -> GatewayError {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => match InboundMessage::from_json(text.as_str()) {
                    Ok(message) => {
                        debug!(action = %message.action, "Received command");
                        ctx.deliver(message);
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed inbound message"),
                },
                Ok(Message::Pong(_)) => {
                    let _ = pong_tx.try_send(());
                }
                Ok(Message::Ping(_)) => {
                    // The transport answers pings itself.
                }
                Ok(Message::Close(_)) => {
                    return GatewayError::Disconnected("close frame received".to_string());
                }
                Ok(_) => return GatewayError::NonTextFrame,
                Err(e) => return GatewayError::classify(e),
            }
        }
        GatewayError::Disconnected("stream ended".to_string())
    }

    /// Send loop: probe liveness, then deliver one queued event per cycle.
    ///
    /// The ping/pong exchange before each send surfaces a dead connection
    /// instead of buffering into it silently; an unresponsive peer stalls
    /// this direction until the connection is torn down externally.
    async fn send_loop(
        mut sink: WsSink,
        outbound_rx: &mut mpsc::UnboundedReceiver<OutboundEvent>,
        mut pong_rx: mpsc::Receiver<()>,
    ) -> GatewayError {
        debug!("Send loop started");
        loop {
            if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                return GatewayError::classify(e);
            }
            if pong_rx.recv().await.is_none() {
                return GatewayError::Disconnected("liveness probe unanswered".to_string());
            }

            let event = match outbound_rx.recv().await {
                Some(event) => event,
                None => return GatewayError::Disconnected("outbound queue closed".to_string()),
            };

            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "Failed to encode outbound event, dropping it");
                    continue;
                }
            };

            debug!(frame = %text, "Sending event");
            if let Err(e) = sink.send(Message::text(text)).await {
                return GatewayError::classify(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use certrelay_config::AgentConfig;

    #[tokio::test]
    async fn test_build_request_carries_token_header() {
        let config = AgentConfig::from_toml(
            r#"
                [gateway]
                connect_url = "ws://127.0.0.1:9000/agent"
                connect_token = "secret"
            "#,
        )
        .unwrap();
        let (ctx, _rx) = AgentContext::new(config, Arc::new(MemoryStore::new()));
        let gateway = Gateway::new(ctx);

        let request = gateway.build_request().unwrap();
        assert_eq!(
            request.headers().get(TOKEN_HEADER).unwrap().to_str().unwrap(),
            "secret"
        );
    }

    #[tokio::test]
    async fn test_build_request_rejects_bad_url() {
        let mut config = AgentConfig::default();
        config.gateway.connect_url = "not a url".to_string();
        let (ctx, _rx) = AgentContext::new(config, Arc::new(MemoryStore::new()));
        let gateway = Gateway::new(ctx);

        assert!(gateway.build_request().is_err());
    }
}
