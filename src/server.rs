//! Relay server
//!
//! Owns the [`Hub`] shared by every connection and room of one relay
//! instance, and runs the TCP accept loop. Several servers can live in
//! one process without seeing each other's rooms.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::listener::ListenerId;
use crate::message::Message;
use crate::registry::Hub;
use crate::session::SessionReader;

/// A relay instance
pub struct Server {
    hub: Hub,
    config: Arc<Config>,
    sessions: Option<Arc<dyn SessionReader>>,
}

impl Server {
    /// Create a server with its own empty registries
    pub fn new(config: Config) -> Self {
        Self {
            hub: Hub::new(),
            config: Arc::new(config),
            sessions: None,
        }
    }

    /// Attach a reader invoked once per connection during the handshake
    pub fn with_session_reader<R>(mut self, reader: R) -> Self
    where
        R: SessionReader + 'static,
    {
        self.sessions = Some(Arc::new(reader));
        self
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register an application listener for `event`
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Arc<Connection>, &Message) + Send + Sync + 'static,
    {
        self.hub.listeners().on(event, listener)
    }

    /// Deregister a listener returned by [`Server::on`]
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.hub.listeners().off(event, id)
    }

    /// Bind the configured address and serve forever
    pub async fn run(self) -> Result<(), AppError> {
        let listener = TcpListener::bind(&self.config.addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections from `listener` forever
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    let hub = self.hub.clone();
                    let config = self.config.clone();
                    let sessions = self.sessions.clone();

                    // Spawn handler task for each connection
                    tokio::spawn(async move {
                        match handle_connection(stream, hub, config, sessions).await {
                            Ok(()) => {}
                            Err(AppError::MethodNotAllowed) => {
                                warn!("Rejected non-GET request from {}", addr);
                            }
                            Err(e) => error!("Connection handler error: {}", e),
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
