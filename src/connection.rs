//! Connection state and the two transport pumps
//!
//! A connection is driven by two tasks sharing one bounded outbound
//! queue. The inbound pump reads frames and hands them to the
//! dispatcher; the outbound pump drains the queue onto the socket and
//! sends keepalive pings. Shutting the outbound side down is signalled
//! through a cancellation token rather than by dropping the queue, so
//! eviction and normal teardown can both ask for it safely.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::dispatch;
use crate::error::{AppError, DeliveryError};
use crate::message::Message;
use crate::registry::Hub;
use crate::room::Member;
use crate::types::{ConnId, Session, EVENT_LEFT};

/// Producer side of a connection's outbound queue
///
/// Pushing never waits. Closing is idempotent and tells the outbound
/// pump to send a close frame and exit.
#[derive(Debug, Clone)]
pub struct Outbound {
    frames: mpsc::Sender<String>,
    closed: CancellationToken,
}

/// Consumer side of a connection's outbound queue
#[derive(Debug)]
pub struct OutboundQueue {
    frames: mpsc::Receiver<String>,
    closed: CancellationToken,
}

impl Outbound {
    /// Create a queue holding at most `capacity` frames
    pub fn channel(capacity: usize) -> (Outbound, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity);
        let closed = CancellationToken::new();
        (
            Outbound {
                frames: tx,
                closed: closed.clone(),
            },
            OutboundQueue { frames: rx, closed },
        )
    }

    /// Enqueue a frame without waiting
    pub fn push(&self, frame: String) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.frames.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Signal the outbound pump to close the transport
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the outbound side shuts down
    pub fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }
}

impl OutboundQueue {
    /// Next queued frame, or `None` once every producer is gone
    pub async fn recv(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.frames.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// One client's duplex session
pub struct Connection {
    id: ConnId,
    session: Option<Session>,
    outbound: Outbound,
    /// Names of rooms this connection has joined
    rooms: DashSet<String>,
    hub: Hub,
}

impl Connection {
    /// Create a connection. It is not registered until the caller
    /// inserts it into the hub's connection registry.
    pub fn new(id: ConnId, session: Option<Session>, outbound: Outbound, hub: Hub) -> Arc<Self> {
        Arc::new(Self {
            id,
            session,
            outbound,
            rooms: DashSet::new(),
            hub,
        })
    }

    pub fn id(&self) -> &ConnId {
        &self.id
    }

    /// Context read from the upgrade request, if any
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Names of joined rooms, sorted
    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.iter().map(|name| name.key().clone()).collect();
        rooms.sort();
        rooms
    }

    /// This connection as a room member
    pub fn member(&self) -> Member {
        Member {
            id: self.id.clone(),
            outbound: self.outbound.clone(),
        }
    }

    /// Join `name`, creating the room if needed
    pub fn join(&self, name: &str) {
        self.rooms.insert(name.to_string());
        self.hub
            .rooms()
            .join(name, self.member(), self.hub.connections());
    }

    /// Leave `name`. No-op for unknown rooms or rooms never joined.
    pub fn leave(&self, name: &str) {
        let Some(room) = self.hub.rooms().get(name) else {
            return;
        };
        if self.rooms.remove(name).is_none() {
            return;
        }
        room.leave(self.member());
    }

    /// Broadcast `msg` to the other members of its room
    ///
    /// Waits while the room's backlog is full.
    pub async fn emit(&self, msg: &Message) {
        if let Some(room) = self.hub.rooms().get(&msg.room) {
            room.emit(&self.id, msg).await;
        }
    }

    /// Announce a closed transport to every joined room
    ///
    /// Each room gets a `left` notification and drops this connection
    /// from its membership, retiring if that empties it.
    async fn announce_departure(&self) {
        for name in self.rooms() {
            let Some(room) = self.hub.rooms().get(&name) else {
                continue;
            };
            let id = self.id.as_str();
            room.emit(&self.id, &Message::new(name.as_str(), EVENT_LEFT, "", id, id))
                .await;
            room.depart(self.id.clone());
        }
    }

    /// Leave everything, deregister and close the outbound side
    fn shutdown(&self) {
        for name in self.rooms() {
            if let Some(room) = self.hub.rooms().get(&name) {
                room.leave(self.member());
            }
        }
        self.rooms.clear();
        self.hub.connections().remove(&self.id);
        self.outbound.close();
    }

    /// Run the inbound pump until the transport closes or fails
    ///
    /// The read deadline starts at `pong_wait` and is pushed out on every
    /// pong, so a peer that stops answering pings is dropped. Only a
    /// close frame from the peer produces `left` notifications.
    pub async fn read_pump<R>(self: Arc<Self>, mut stream: R, config: &Config)
    where
        R: Stream<Item = Result<WsMessage, WsError>> + Unpin,
    {
        let closed = self.outbound.closed_token().clone();
        let mut deadline = Instant::now() + config.pong_wait;

        loop {
            let next = tokio::select! {
                next = time::timeout_at(deadline, stream.next()) => next,
                _ = closed.cancelled() => {
                    debug!("Outbound side of {} closed", self.id);
                    break;
                }
            };

            let frame = match next {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    debug!("WebSocket error for {}: {}", self.id, e);
                    break;
                }
                Ok(None) => {
                    debug!("Stream ended for {}", self.id);
                    break;
                }
                Err(_) => {
                    debug!("Read deadline expired for {}", self.id);
                    break;
                }
            };

            match frame {
                WsMessage::Text(text) => {
                    dispatch::dispatch(&self, Message::decode(text.as_bytes())).await
                }
                WsMessage::Binary(data) => dispatch::dispatch(&self, Message::decode(&data)).await,
                WsMessage::Pong(_) => deadline = Instant::now() + config.pong_wait,
                WsMessage::Close(_) => {
                    debug!("Connection {} sent close frame", self.id);
                    self.announce_departure().await;
                    break;
                }
                // pings are answered by tungstenite
                _ => {}
            }
        }

        self.shutdown();
        info!("Connection {} disconnected", self.id);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("rooms", &self.rooms())
            .field("closed", &self.outbound.is_closed())
            .finish()
    }
}

/// Run the outbound pump until the queue is closed or a write fails
///
/// Either way the close token ends up cancelled, which also stops the
/// inbound pump.
pub async fn write_pump<K>(id: ConnId, mut sink: K, mut queue: OutboundQueue, config: &Config)
where
    K: Sink<WsMessage, Error = WsError> + Unpin,
{
    let mut ticker = time::interval_at(Instant::now() + config.ping_period, config.ping_period);

    loop {
        tokio::select! {
            frame = queue.frames.recv() => {
                let Some(frame) = frame else {
                    let _ = write(&mut sink, WsMessage::Close(None), config.write_wait).await;
                    break;
                };
                if let Err(e) = write(&mut sink, WsMessage::Text(frame.into()), config.write_wait).await {
                    debug!("Write to {} failed: {}", id, e);
                    break;
                }
            }
            _ = queue.closed.cancelled() => {
                let _ = write(&mut sink, WsMessage::Close(None), config.write_wait).await;
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = write(&mut sink, WsMessage::Ping(Vec::<u8>::new().into()), config.write_wait).await {
                    debug!("Ping to {} failed: {}", id, e);
                    break;
                }
            }
        }
    }

    queue.closed.cancel();
    let _ = time::timeout(config.write_wait, sink.close()).await;
    debug!("Write pump ended for {}", id);
}

/// Write one frame within `wait`
async fn write<K>(sink: &mut K, frame: WsMessage, wait: Duration) -> Result<(), AppError>
where
    K: Sink<WsMessage, Error = WsError> + Unpin,
{
    match time::timeout(wait, sink.send(frame)).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(AppError::Timeout(wait)),
    }
}

/// Build and register a connection backed by an in-memory queue
#[cfg(test)]
pub(crate) fn test_connection(hub: &Hub, capacity: usize) -> (Arc<Connection>, OutboundQueue) {
    let (outbound, queue) = Outbound::channel(capacity);
    let conn = Connection::new(ConnId::new(), None, outbound, hub.clone());
    hub.connections().insert(conn.clone());
    (conn, queue)
}
