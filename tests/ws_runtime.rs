//! End-to-end tests for WebSocket mocks.

mod common;

use common::{definition, free_port, launch, TIMEOUT};
use futures_util::{SinkExt, StreamExt};
use kuro_mock::ProtocolHandler;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

const PING: &str = r#"
protocol: ws
port: PORT
onMessage:
  match: "(?P<cmd>\\w+)"
  conditions:
    - if: '{{eq input.cmd "ping"}}'
      respond: pong
  else: unknown command
"#;

#[tokio::test]
async fn test_ping_pong_on_one_connection() {
    let port = free_port();
    let mut server = launch(&definition(PING, port)).await;

    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap();

    for (sent, expected) in [("ping", "pong"), ("hello", "unknown command"), ("ping", "pong")] {
        client.send(Message::Text(sent.into())).await.unwrap();
        let reply = timeout(TIMEOUT, client.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(reply.into_text().unwrap().to_string(), expected);
    }

    client.close(None).await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_binary_frames_are_matched() {
    let port = free_port();
    let mut server = launch(&definition(PING, port)).await;

    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/any/path"))
        .await
        .unwrap();
    client
        .send(Message::Binary(b"ping".to_vec().into()))
        .await
        .unwrap();
    let reply = timeout(TIMEOUT, client.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply.into_text().unwrap().to_string(), "pong");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_one_client_leaving_does_not_affect_another() {
    let port = free_port();
    let mut server = launch(&definition(PING, port)).await;
    let url = format!("ws://127.0.0.1:{port}/");

    let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    first.send(Message::Text("ping".into())).await.unwrap();
    timeout(TIMEOUT, first.next()).await.unwrap().unwrap().unwrap();
    drop(first);

    second.send(Message::Text("ping".into())).await.unwrap();
    let reply = timeout(TIMEOUT, second.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply.into_text().unwrap().to_string(), "pong");

    server.stop().await.unwrap();
}
