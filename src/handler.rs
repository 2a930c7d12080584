//! WebSocket connection handler
//!
//! Handles individual client connections: method check, WebSocket
//! handshake, registration, and running the two pumps. A new connection
//! is joined to the default room before its first frame is read.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info};

use crate::config::Config;
use crate::connection::{write_pump, Connection, Outbound};
use crate::error::AppError;
use crate::registry::Hub;
use crate::session::SessionReader;
use crate::types::ConnId;

const METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 19\r\n\
Connection: close\r\n\
\r\n\
Method not allowed\n";

/// Handle a new TCP connection
///
/// Anything other than a GET upgrade request gets a 405 and is dropped.
pub async fn handle_connection(
    mut stream: TcpStream,
    hub: Hub,
    config: Arc<Config>,
    sessions: Option<Arc<dyn SessionReader>>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    reject_unless_get(&mut stream).await?;
    handle_stream(stream, hub, config, sessions).await
}

/// Upgrade `stream` and run the connection until it ends
///
/// Works over any byte stream, which is what the integration tests use.
pub async fn handle_stream<S>(
    stream: S,
    hub: Hub,
    config: Arc<Config>,
    sessions: Option<Arc<dyn SessionReader>>,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // WebSocket handshake, reading the session on the way
    let mut session = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if let Some(reader) = &sessions {
            session = reader.read(request);
        }
        Ok(response)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(websocket_config(&config)),
    )
    .await?;
    let (ws_sender, ws_receiver) = ws_stream.split();

    let conn_id = ConnId::new();
    let (outbound, queue) = Outbound::channel(config.outbound_capacity);
    let conn = Connection::new(conn_id.clone(), session, outbound, hub.clone());
    hub.connections().insert(conn.clone());
    info!("Connection {} established", conn_id);

    // Outbound pump first so the default room's join reply has a writer
    let write_config = config.clone();
    tokio::spawn(async move {
        write_pump(conn_id, ws_sender, queue, &write_config).await;
    });

    conn.join(&config.default_room);
    conn.read_pump(ws_receiver, &config).await;

    Ok(())
}

fn websocket_config(config: &Config) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        max_frame_size: Some(config.max_message_size),
        ..Default::default()
    }
}

/// Answer 405 unless the request line starts with `GET `
///
/// Only a conclusive mismatch is rejected; a short peek that is still a
/// prefix of `GET ` is left for the handshake to judge.
async fn reject_unless_get(stream: &mut TcpStream) -> Result<(), AppError> {
    let mut head = [0u8; 4];
    let n = stream.peek(&mut head).await?;
    if b"GET ".starts_with(&head[..n]) {
        return Ok(());
    }

    debug!("Rejecting non-GET upgrade request");
    stream.write_all(METHOD_NOT_ALLOWED).await?;
    let _ = stream.shutdown().await;
    Err(AppError::MethodNotAllowed)
}
