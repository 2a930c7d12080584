//! Session context read from the upgrade request
//!
//! The relay calls a [`SessionReader`] once per connection, during the
//! handshake and before the connection is registered. Whatever it
//! returns is attached to the connection untouched.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::COOKIE;

use crate::types::Session;

/// Extracts request-scoped context for a new connection
pub trait SessionReader: Send + Sync {
    fn read(&self, request: &Request) -> Option<Session>;
}

impl<F> SessionReader for F
where
    F: Fn(&Request) -> Option<Session> + Send + Sync,
{
    fn read(&self, request: &Request) -> Option<Session> {
        self(request)
    }
}

/// Reads the request's cookies into the session map
#[derive(Debug, Default, Clone, Copy)]
pub struct CookieReader;

impl SessionReader for CookieReader {
    fn read(&self, request: &Request) -> Option<Session> {
        let mut cookies = HashMap::new();
        for header in request.headers().get_all(COOKIE) {
            let Ok(header) = header.to_str() else {
                continue;
            };
            for pair in header.split(';') {
                if let Some((name, value)) = pair.split_once('=') {
                    cookies.insert(name.trim().to_string(), value.trim().to_string());
                }
            }
        }

        if cookies.is_empty() {
            None
        } else {
            Some(Arc::new(cookies))
        }
    }
}
