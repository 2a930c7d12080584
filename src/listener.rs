//! Application event listeners
//!
//! The one extension point of the relay: a message whose event name is
//! not reserved, that has no destination, and that has at least one
//! listener registered for its event is handed to those listeners
//! instead of being broadcast.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::connection::Connection;
use crate::message::Message;
use crate::types::is_reserved;

/// Callback invoked with the sending connection and its message
pub type Listener = Arc<dyn Fn(&Arc<Connection>, &Message) + Send + Sync>;

/// Handle returned by [`Listeners::on`], used to deregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener table keyed by event name
#[derive(Clone, Default)]
pub struct Listeners {
    table: Arc<DashMap<String, Vec<(ListenerId, Listener)>>>,
    next_id: Arc<AtomicU64>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `event`
    ///
    /// Reserved event names are accepted but never routed to listeners.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Arc<Connection>, &Message) + Send + Sync + 'static,
    {
        if is_reserved(event) {
            warn!("Listener registered for reserved event '{}' will never fire", event);
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.table
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Deregister one listener. Returns false if it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let Some(mut listeners) = self.table.get_mut(event) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        let now_empty = listeners.is_empty();
        drop(listeners);

        if now_empty {
            self.table.remove_if(event, |_, listeners| listeners.is_empty());
        }
        removed
    }

    /// Deregister every listener for `event`
    pub fn off_all(&self, event: &str) {
        self.table.remove(event);
    }

    /// Number of listeners registered for `event`
    pub fn count(&self, event: &str) -> usize {
        self.table.get(event).map_or(0, |listeners| listeners.len())
    }

    /// Invoke every listener for `event`, returning how many ran
    ///
    /// The table is not locked while listeners run, so a listener may
    /// register or deregister others.
    pub(crate) fn emit(&self, event: &str, conn: &Arc<Connection>, msg: &Message) -> usize {
        let listeners: Vec<Listener> = match self.table.get(event) {
            Some(entry) => entry.iter().map(|(_, listener)| listener.clone()).collect(),
            None => return 0,
        };
        for listener in &listeners {
            listener(conn, msg);
        }
        listeners.len()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("events", &self.table.len())
            .finish()
    }
}
