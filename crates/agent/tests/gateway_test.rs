//! Control-channel connector tests against a local websocket server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use certrelay_agent::{AgentContext, Gateway, MemoryStore};
use certrelay_config::AgentConfig;
use certrelay_protocol::{DomainRecord, OutboundEvent};

fn context_for(
    addr: std::net::SocketAddr,
) -> (Arc<AgentContext>, certrelay_agent::context::QueueReceivers) {
    let config = AgentConfig::from_toml(&format!(
        r#"
            [gateway]
            connect_url = "ws://{addr}/agent"
            connect_token = "test-token"
        "#
    ))
    .unwrap();
    AgentContext::new(config, Arc::new(MemoryStore::new()))
}

/// Accept one websocket connection, capturing the handshake TOKEN header.
async fn accept_with_token(
    listener: &TcpListener,
    token_tx: mpsc::UnboundedSender<Option<String>>,
) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_hdr_async(stream, |request: &tokio_tungstenite::tungstenite::handshake::server::Request, response| {
        let token = request
            .headers()
            .get("TOKEN")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        token_tx.send(token).unwrap();
        Ok(response)
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_and_events_flow_through_the_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (token_tx, mut token_rx) = mpsc::unbounded_channel();

    let (ctx, mut rx) = context_for(addr);
    let gateway = tokio::spawn(Gateway::new(ctx.clone()).run(rx.outbound));

    let mut server = accept_with_token(&listener, token_tx).await;

    // The handshake carried the static credential.
    assert_eq!(
        token_rx.recv().await.unwrap().as_deref(),
        Some("test-token")
    );

    // Malformed inbound JSON is dropped; the command after it still arrives.
    server.send(Message::text("{not json")).await.unwrap();
    server
        .send(Message::text(
            r#"{"action":"add_domain","content":{"domain":"example.com","cache_ttl":30}}"#,
        ))
        .await
        .unwrap();

    let command = tokio::time::timeout(Duration::from_secs(10), rx.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(command.action, "add_domain");
    assert_eq!(command.content["domain"], "example.com");

    // Publish an event and watch it arrive as one text frame. The server
    // keeps reading, which also answers the connector's liveness pings.
    let record = DomainRecord::new("example.com");
    ctx.publish(OutboundEvent::pending_report(&record));

    let frame = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match server.next().await {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(_)) => continue,
                other => panic!("server stream ended unexpectedly: {other:?}"),
            }
        }
    })
    .await
    .unwrap();

    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["type"], "client.forward.message");
    assert_eq!(value["ftype"], "acme_pending");
    assert_eq!(value["content"]["domain"], "example.com");

    ctx.shutdown.cancel();
    gateway.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn abrupt_disconnect_reconnects_without_delay() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (token_tx, _token_rx) = mpsc::unbounded_channel();

    let (ctx, rx) = context_for(addr);
    let gateway = tokio::spawn(Gateway::new(ctx.clone()).run(rx.outbound));

    // First connection is dropped on the floor immediately.
    let server = accept_with_token(&listener, token_tx.clone()).await;
    drop(server);

    // The connector must come back well inside the rejected-peer backoff
    // (60s): an abrupt disconnect reconnects immediately.
    let reconnected = tokio::time::timeout(
        Duration::from_secs(10),
        accept_with_token(&listener, token_tx),
    )
    .await;
    assert!(reconnected.is_ok(), "connector did not reconnect in time");

    ctx.shutdown.cancel();
    gateway.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn binary_frame_forces_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (token_tx, _token_rx) = mpsc::unbounded_channel();

    let (ctx, rx) = context_for(addr);
    let gateway = tokio::spawn(Gateway::new(ctx.clone()).run(rx.outbound));

    let mut server = accept_with_token(&listener, token_tx.clone()).await;
    server
        .send(Message::Binary(vec![0xde, 0xad].into()))
        .await
        .unwrap();

    // The framing violation is fatal for that connection only.
    let reconnected = tokio::time::timeout(
        Duration::from_secs(10),
        accept_with_token(&listener, token_tx),
    )
    .await;
    assert!(reconnected.is_ok(), "connector did not reconnect after framing violation");

    ctx.shutdown.cancel();
    gateway.await.unwrap();
}
