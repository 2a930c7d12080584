//! End-to-end tests over real WebSocket handshakes
//!
//! Server sides run `handle_stream` on one half of an in-memory duplex
//! pipe; clients speak tungstenite on the other half.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{client_async, WebSocketStream};

use wsrooms::{handle_stream, Config, Hub, Message, Server};

type Client = WebSocketStream<DuplexStream>;

async fn connect(hub: &Hub, config: &Arc<Config>) -> (Client, String) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(handle_stream(server_io, hub.clone(), config.clone(), None));
    let (mut client, _) = client_async("ws://localhost/ws", client_io).await.unwrap();

    // every connection lands in the default room first
    let joined = recv(&mut client).await;
    assert_eq!(joined.event, "join");
    assert_eq!(joined.room, "root");
    (client, joined.src)
}

async fn recv(client: &mut Client) -> Message {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        if let WsMessage::Text(text) = frame {
            return Message::decode(text.as_bytes());
        }
    }
}

async fn assert_silent(client: &mut Client) {
    let quiet = tokio::time::timeout(Duration::from_millis(150), async {
        loop {
            match client.next().await {
                Some(Ok(WsMessage::Text(text))) => return text.to_string(),
                Some(Ok(_)) => continue,
                _ => return String::new(),
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "unexpected frame: {:?}", quiet);
}

async fn send(client: &mut Client, msg: Message) {
    client.send(WsMessage::Text(msg.encode().into())).await.unwrap();
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {}", what);
}

fn prior_members(msg: &Message) -> Vec<String> {
    serde_json::from_slice(&msg.payload).unwrap()
}

#[tokio::test]
async fn lobby_scenario() {
    let hub = Hub::new();
    let config = Arc::new(Config::default());

    let (mut a, a_id) = connect(&hub, &config).await;
    send(&mut a, Message::new("lobby", "join", "", "", "")).await;
    let joined = recv(&mut a).await;
    assert_eq!(joined.room, "lobby");
    assert!(prior_members(&joined).is_empty());

    let (mut b, b_id) = connect(&hub, &config).await;
    send(&mut b, Message::new("lobby", "join", "", "", "")).await;
    let joined = recv(&mut b).await;
    assert_eq!(prior_members(&joined), vec![a_id.clone()]);
    assert_silent(&mut a).await;

    send(&mut b, Message::new("lobby", "chat", "", b_id.as_str(), "hello")).await;
    let chat = recv(&mut a).await;
    assert_eq!(chat.event, "chat");
    assert_eq!(chat.payload, b"hello");
    assert_silent(&mut b).await;

    // closing b notifies both rooms it was in
    b.close(None).await.unwrap();
    let mut left_rooms = vec![recv(&mut a).await, recv(&mut a).await]
        .into_iter()
        .map(|msg| {
            assert_eq!(msg.event, "left");
            assert_eq!(msg.src, b_id);
            msg.room
        })
        .collect::<Vec<_>>();
    left_rooms.sort();
    assert_eq!(left_rooms, vec!["lobby".to_string(), "root".to_string()]);

    let lobby = hub.rooms().get("lobby").unwrap();
    assert_eq!(lobby.members().await.len(), 1);
    eventually("b deregistered", || hub.connections().len() == 1).await;

    send(&mut a, Message::new("lobby", "leave", "", "", "")).await;
    let leave = recv(&mut a).await;
    assert_eq!(leave.event, "leave");
    assert_eq!(leave.room, "lobby");
    eventually("lobby reclaimed", || !hub.rooms().contains("lobby")).await;
    assert!(hub.rooms().contains("root"));
}

#[tokio::test]
async fn directed_delivery() {
    let hub = Hub::new();
    let config = Arc::new(Config::default());
    let (mut a, a_id) = connect(&hub, &config).await;
    let (mut b, _) = connect(&hub, &config).await;
    let (mut c, c_id) = connect(&hub, &config).await;

    send(&mut a, Message::new("root", "whisper", c_id.as_str(), a_id.as_str(), "psst")).await;
    let msg = recv(&mut c).await;
    assert_eq!(msg.event, "whisper");
    assert_eq!(msg.dst, c_id);
    assert_eq!(msg.payload, b"psst");
    assert_silent(&mut b).await;
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn listener_receives_event() {
    let hub = Hub::new();
    let config = Arc::new(Config::default());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    hub.listeners().on("score", move |conn, msg| {
        let _ = tx.send((conn.id().to_string(), msg.payload.clone()));
    });

    let (mut a, a_id) = connect(&hub, &config).await;
    let (mut b, _) = connect(&hub, &config).await;
    send(&mut a, Message::new("root", "score", "", "", "7")).await;

    let (sender, payload) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sender, a_id);
    assert_eq!(payload, b"7");
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn malformed_frame_keeps_connection_open() {
    let hub = Hub::new();
    let config = Arc::new(Config::default());
    let (mut a, _) = connect(&hub, &config).await;
    let (mut b, _) = connect(&hub, &config).await;

    a.send(WsMessage::Text("{broken".to_string().into())).await.unwrap();
    send(&mut a, Message::new("root", "chat", "", "", "still here")).await;
    assert_eq!(recv(&mut b).await.payload, b"still here");
}

#[tokio::test]
async fn silent_peer_is_dropped() {
    let hub = Hub::new();
    let config = Arc::new(Config {
        ping_period: Duration::from_millis(50),
        pong_wait: Duration::from_millis(200),
        ..Config::default()
    });
    let (_idle, _) = connect(&hub, &config).await;
    assert_eq!(hub.connections().len(), 1);

    // never polled, so pings go unanswered
    eventually("idle peer dropped", || hub.connections().is_empty()).await;
    eventually("root reclaimed", || hub.rooms().is_empty()).await;
}

#[tokio::test]
async fn responsive_peer_survives_pings() {
    let hub = Hub::new();
    let config = Arc::new(Config {
        ping_period: Duration::from_millis(50),
        pong_wait: Duration::from_millis(200),
        ..Config::default()
    });
    let (mut a, _) = connect(&hub, &config).await;

    let mut pings = 0;
    let _ = tokio::time::timeout(Duration::from_millis(600), async {
        while let Some(Ok(frame)) = a.next().await {
            if let WsMessage::Ping(_) = frame {
                pings += 1;
            }
        }
    })
    .await;

    assert!(pings >= 3, "only {} pings", pings);
    assert_eq!(hub.connections().len(), 1);
}

#[tokio::test]
async fn non_get_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(Config::default());
    let hub = server.hub().clone();
    tokio::spawn(server.serve(listener));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /ws HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();

    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 405 Method Not Allowed"));
    assert!(hub.connections().is_empty());
}
