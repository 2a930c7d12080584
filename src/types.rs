//! Basic type definitions for the relay
//!
//! Provides the connection identifier newtype, the opaque session
//! context attached at connection time, and the reserved event names.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

/// Event sent to a connection when it joins a room
pub const EVENT_JOIN: &str = "join";
/// Event sent to a connection when it leaves a room
pub const EVENT_LEAVE: &str = "leave";
/// Reserved confirmation event, re-emitted to the room when echoed back
pub const EVENT_JOINED: &str = "joined";
/// Event broadcast to a room when a member's transport closes
pub const EVENT_LEFT: &str = "left";

/// Unique connection identifier (newtype pattern)
///
/// Wraps the string form of a UUID v4. Inbound messages address
/// connections by string, so the textual form is what gets stored and
/// compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(String);

impl ConnId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConnId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request-scoped context read once when a connection is established
///
/// The relay never interprets it; applications read it from listeners.
pub type Session = Arc<HashMap<String, String>>;

/// Whether `event` is one of the names the relay handles itself
pub fn is_reserved(event: &str) -> bool {
    matches!(event, EVENT_JOIN | EVENT_LEAVE | EVENT_JOINED | EVENT_LEFT)
}
