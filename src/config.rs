//! Relay configuration
//!
//! Timing and sizing knobs shared by the entry point and both pumps.
//! Defaults follow the usual WebSocket keepalive layout: pings go out a
//! little before the read deadline would expire.

use std::time::Duration;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Room every new connection joins
pub const DEFAULT_ROOM: &str = "root";

/// Time allowed to write a single frame to the peer
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between pongs before the read side gives up
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping interval, 9/10 of the pong wait
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Per-connection outbound queue capacity
pub const OUTBOUND_CAPACITY: usize = 256;

/// Broadcasts and directed messages a room may have queued before
/// senders wait
pub const ROOM_BACKLOG: usize = 256;

/// Largest accepted message or frame (1 GiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the TCP listener binds to
    pub addr: String,
    /// Room joined implicitly after the handshake
    pub default_room: String,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub outbound_capacity: usize,
    pub max_message_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            default_room: DEFAULT_ROOM.to_string(),
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            outbound_capacity: OUTBOUND_CAPACITY,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl Config {
    /// Replace the bind address
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_period_precedes_pong_wait() {
        let config = Config::default();
        assert!(config.ping_period < config.pong_wait);
        assert_eq!(config.ping_period, config.pong_wait * 9 / 10);
    }

    #[test]
    fn test_with_addr() {
        let config = Config::default().with_addr("0.0.0.0:9000");
        assert_eq!(config.addr, "0.0.0.0:9000");
        assert_eq!(config.default_room, "root");
        assert_eq!(config.outbound_capacity, 256);
    }
}
