//! Room-scoped WebSocket Relay Library
//!
//! A publish/subscribe relay built with tokio-tungstenite. Clients join
//! named rooms; messages a client sends are fanned out to the other
//! members of the room, and membership changes are broadcast as events.
//!
//! # Features
//! - Lazily created rooms that disappear when their last member leaves
//! - Join replies listing the members already present
//! - Broadcast with sender exclusion
//! - Directed delivery to a single member of a room
//! - Application listeners for custom events
//! - Ping/pong keepalive and slow-consumer eviction
//!
//! # Architecture
//! - Each room is an actor: one task owning its membership and
//!   processing joins, leaves and broadcasts in submission order
//! - Each connection runs an inbound and an outbound pump around a
//!   bounded queue; enqueueing never blocks, a full queue gets the
//!   connection evicted
//! - Connections and rooms are found through `DashMap` registries held
//!   by a per-server [`Hub`]
//!
//! # Example
//! ```ignore
//! use wsrooms::{Config, Message, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(Config::default().with_addr("127.0.0.1:8080"));
//!     server.on("ping", |conn, msg| {
//!         let pong = Message::new(msg.room.as_str(), "pong", "", conn.id().as_str(), "");
//!         let _ = conn.outbound().push(pong.encode());
//!     });
//!     server.run().await.unwrap();
//! }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod listener;
pub mod message;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use config::Config;
pub use connection::{Connection, Outbound, OutboundQueue};
pub use dispatch::{dispatch, route, Route};
pub use error::{AppError, DeliveryError};
pub use handler::{handle_connection, handle_stream};
pub use listener::{Listener, ListenerId, Listeners};
pub use message::Message;
pub use registry::{ConnRegistry, Hub, RoomRegistry};
pub use room::{Member, RoomHandle};
pub use server::Server;
pub use session::{CookieReader, SessionReader};
pub use types::{ConnId, Session};
