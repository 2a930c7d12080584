//! Error types for the relay
//!
//! Defines connection-level errors and outbound delivery errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// All of these are fatal for the connection that produced them and
/// are only ever logged; the server keeps accepting.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (handshake or transport)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Upgrade request used something other than GET
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// A read or write deadline expired
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Outbound delivery errors
///
/// Enqueueing onto a connection's outbound queue never waits; these
/// describe why a frame was not accepted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The queue is at capacity (slow consumer)
    #[error("Outbound queue full")]
    Full,
    /// The queue has been closed or its pump has exited
    #[error("Outbound queue closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_app_error_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(AppError::from(io), AppError::Io(_)));

        let ws = tokio_tungstenite::tungstenite::Error::ConnectionClosed;
        assert!(matches!(AppError::from(ws), AppError::WebSocket(_)));

        let timeout = AppError::Timeout(Duration::from_secs(10));
        assert_eq!(timeout.to_string(), "Timed out after 10s");
    }
}
