//! Interoperability with an independent WebSocket client implementation.

mod common;

use futures_util::{SinkExt, StreamExt};
use tether_net::EndpointConfig;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use common::{echo_config, EchoServer};

#[tokio::test(flavor = "multi_thread")]
async fn test_tungstenite_client_text_and_binary_echo() {
    // Arrange
    let server = EchoServer::start(echo_config(), EndpointConfig::default());
    let url = format!("ws://127.0.0.1:{}/echo", server.port);

    // Act
    let (mut ws, response) = connect_async(url).await.unwrap();
    ws.send(Message::Text("hello".into())).await.unwrap();
    let text = ws.next().await.unwrap().unwrap();
    let payload = vec![0x5a; 150_000];
    ws.send(Message::Binary(payload.clone())).await.unwrap();
    let binary = ws.next().await.unwrap().unwrap();

    // Assert
    assert_eq!(response.status().as_u16(), 101);
    assert!(response.headers().contains_key("x-tether-session"));
    assert_eq!(text, Message::Text("hello".into()));
    assert_eq!(binary, Message::Binary(payload));

    ws.close(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tungstenite_ping_is_answered() {
    let server = EchoServer::start(echo_config(), EndpointConfig::default());
    let url = format!("ws://127.0.0.1:{}/", server.port);
    let (mut ws, _) = connect_async(url).await.unwrap();

    ws.send(Message::Ping(b"tick".to_vec())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();

    assert_eq!(reply, Message::Pong(b"tick".to_vec()));
    ws.close(None).await.unwrap();
}
