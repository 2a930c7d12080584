//! Connection and room registries
//!
//! Both are `DashMap`-backed and cheap to clone, so every room task and
//! connection can hold its own handle. A [`Hub`] bundles them with the
//! listener table; each server instance owns exactly one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::connection::Connection;
use crate::listener::Listeners;
use crate::room::{Member, Room, RoomCommand, RoomHandle};
use crate::types::ConnId;

/// Live connections by id
#[derive(Debug, Clone, Default)]
pub struct ConnRegistry {
    conns: Arc<DashMap<ConnId, Arc<Connection>>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.conns.insert(conn.id().clone(), conn);
    }

    pub fn remove(&self, id: &ConnId) -> Option<Arc<Connection>> {
        self.conns.remove(id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: &ConnId) -> Option<Arc<Connection>> {
        self.conns.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &ConnId) -> bool {
        self.conns.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

/// Live rooms by name
///
/// A name maps to at most one running room. Joins are submitted while
/// holding the name's entry, which is also where a draining room removes
/// itself, so creation and retirement never interleave.
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, RoomHandle>>,
    next_instance: Arc<AtomicU64>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<RoomHandle> {
        self.rooms.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rooms.contains_key(name)
    }

    /// Names of all live rooms, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Submit a join to `name`, creating the room if it is absent
    pub(crate) fn join(&self, name: &str, member: Member, conns: &ConnRegistry) {
        let cmd = RoomCommand::Join(member);
        match self.rooms.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if let Err(cmd) = entry.get().try_submit(cmd) {
                    // loop exited without deregistering
                    let handle = self.spawn(name, conns);
                    let _ = handle.try_submit(cmd);
                    entry.insert(handle);
                }
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn(name, conns);
                let _ = handle.try_submit(cmd);
                entry.insert(handle);
            }
        }
    }

    /// Remove `name` if it still refers to `instance` and `idle` agrees
    ///
    /// Returns whether the room should exit. A room that is no longer
    /// the registered instance has nothing to hold on to and exits too.
    pub(crate) fn retire(&self, name: &str, instance: u64, idle: impl FnOnce() -> bool) -> bool {
        match self.rooms.entry(name.to_string()) {
            Entry::Occupied(entry) if entry.get().instance() == instance => {
                if !idle() {
                    return false;
                }
                entry.remove();
                debug!("Room {} ({}) removed from registry", name, instance);
                true
            }
            _ => true,
        }
    }

    fn spawn(&self, name: &str, conns: &ConnRegistry) -> RoomHandle {
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        Room::spawn(name, instance, conns.clone(), self.clone())
    }
}

/// Everything a relay instance shares between its tasks
#[derive(Debug, Clone, Default)]
pub struct Hub {
    conns: ConnRegistry,
    rooms: RoomRegistry,
    listeners: Listeners,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> &ConnRegistry {
        &self.conns
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}
