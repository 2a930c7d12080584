//! Room actor implementation
//!
//! Each live room is one task that owns its membership set and processes
//! commands one at a time from a single intake channel. Joins, leaves
//! and broadcasts for a room are therefore totally ordered and never
//! need a lock. Members are held by [`ConnId`] only; the room
//! resolves them through the [`ConnRegistry`] when it has something to
//! deliver.
//!
//! A room retires itself as soon as its membership drains to zero and
//! no command is waiting in its intake. Retirement happens under the
//! room registry's entry lock, the same lock joins are submitted under,
//! so a join can never be queued on a room that is about to exit. Joins
//! still waiting when a room is stopped explicitly are handed back to the
//! registry.
//!
//! Broadcasts and directed messages hold a backlog permit while they sit
//! in the intake. A sender waits for a permit once the backlog is full,
//! which bounds the intake and slows a flooding connection's inbound pump
//! instead of letting the room's queue grow.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use crate::config::ROOM_BACKLOG;
use crate::connection::Outbound;
use crate::error::DeliveryError;
use crate::message::Message;
use crate::registry::{ConnRegistry, RoomRegistry};
use crate::types::{ConnId, EVENT_JOIN, EVENT_LEAVE};

/// A connection as seen by a room command
///
/// Carries the outbound handle so join and leave confirmations reach the
/// connection even if it is already gone from the connection registry.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: ConnId,
    pub outbound: Outbound,
}

/// Commands processed by a room's loop
#[derive(Debug)]
pub(crate) enum RoomCommand {
    /// Add a member and send it the prior membership
    Join(Member),
    /// Remove a member and send it a confirmation
    Leave(Member),
    /// Remove a member without confirmation (transport closed)
    Depart(ConnId),
    /// Fan a frame out to every member except the sender
    Broadcast {
        sender: Option<ConnId>,
        frame: String,
        _permit: OwnedSemaphorePermit,
    },
    /// Deliver a frame to a single member
    Direct {
        dst: ConnId,
        frame: String,
        _permit: OwnedSemaphorePermit,
    },
    /// Report the current membership
    Members(oneshot::Sender<Vec<ConnId>>),
    /// Deregister and exit
    Stop,
}

/// Cloneable handle to a running room
#[derive(Debug, Clone)]
pub struct RoomHandle {
    name: Arc<str>,
    instance: u64,
    tx: mpsc::UnboundedSender<RoomCommand>,
    backlog: Arc<Semaphore>,
}

impl RoomHandle {
    /// Get the room name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifies this room instance among rooms that reused the name
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Whether the room's loop has exited
    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    /// Submit a command, handing it back if the loop has exited
    pub(crate) fn try_submit(&self, cmd: RoomCommand) -> Result<(), RoomCommand> {
        self.tx.send(cmd).map_err(|e| e.0)
    }

    /// Remove `member`, confirming with a `leave` message. Ignored if it
    /// is not a member.
    pub fn leave(&self, member: Member) {
        self.submit(RoomCommand::Leave(member));
    }

    /// Remove `id` silently
    pub fn depart(&self, id: ConnId) {
        self.submit(RoomCommand::Depart(id));
    }

    /// Broadcast `msg` to every member other than `sender`
    pub async fn emit(&self, sender: &ConnId, msg: &Message) {
        self.broadcast(Some(sender.clone()), msg.encode()).await;
    }

    /// Broadcast a pre-encoded frame. With no sender every member
    /// receives it.
    ///
    /// Waits while the room's backlog is full.
    pub async fn broadcast(&self, sender: Option<ConnId>, frame: String) {
        let Some(permit) = self.reserve().await else {
            return;
        };
        self.submit(RoomCommand::Broadcast {
            sender,
            frame,
            _permit: permit,
        });
    }

    /// Deliver a frame to `dst` only, provided it is a member
    pub async fn direct(&self, dst: ConnId, frame: String) {
        let Some(permit) = self.reserve().await else {
            return;
        };
        self.submit(RoomCommand::Direct {
            dst,
            frame,
            _permit: permit,
        });
    }

    /// Broadcasts and directed messages that can still be queued without
    /// waiting
    pub fn backlog_available(&self) -> usize {
        self.backlog.available_permits()
    }

    /// Current membership, sorted. Empty once the room has stopped.
    pub async fn members(&self) -> Vec<ConnId> {
        let (reply, rx) = oneshot::channel();
        self.submit(RoomCommand::Members(reply));
        rx.await.unwrap_or_default()
    }

    /// Ask the room to deregister and exit
    pub fn stop(&self) {
        self.submit(RoomCommand::Stop);
    }

    fn submit(&self, cmd: RoomCommand) {
        if self.tx.send(cmd).is_err() {
            debug!("Room {} already stopped, dropping command", self.name);
        }
    }

    /// Wait for a backlog slot. `None` once the room has stopped.
    async fn reserve(&self) -> Option<OwnedSemaphorePermit> {
        match self.backlog.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => {
                debug!("Room {} already stopped, dropping message", self.name);
                None
            }
        }
    }
}

/// The room actor
///
/// Owned by its task; reachable only through [`RoomHandle`].
pub(crate) struct Room {
    name: String,
    instance: u64,
    members: BTreeSet<ConnId>,
    receiver: mpsc::UnboundedReceiver<RoomCommand>,
    backlog: Arc<Semaphore>,
    conns: ConnRegistry,
    rooms: RoomRegistry,
}

impl Room {
    /// Spawn a room task and return its handle
    ///
    /// The caller is responsible for registering the handle.
    pub(crate) fn spawn(
        name: &str,
        instance: u64,
        conns: ConnRegistry,
        rooms: RoomRegistry,
    ) -> RoomHandle {
        let (room, handle) = Room::new(name, instance, ROOM_BACKLOG, conns, rooms);
        tokio::spawn(room.run());
        handle
    }

    /// Build a room and its handle without starting the loop
    fn new(
        name: &str,
        instance: u64,
        backlog: usize,
        conns: ConnRegistry,
        rooms: RoomRegistry,
    ) -> (Room, RoomHandle) {
        let (tx, receiver) = mpsc::unbounded_channel();
        let backlog = Arc::new(Semaphore::new(backlog));
        let room = Room {
            name: name.to_string(),
            instance,
            members: BTreeSet::new(),
            receiver,
            backlog: backlog.clone(),
            conns,
            rooms,
        };
        let handle = RoomHandle {
            name: name.into(),
            instance,
            tx,
            backlog,
        };
        (room, handle)
    }

    /// Run the room event loop until stopped or drained
    async fn run(mut self) {
        debug!("Room {} ({}) started", self.name, self.instance);

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                RoomCommand::Join(member) => self.handle_join(member),
                RoomCommand::Leave(member) => self.handle_leave(member),
                RoomCommand::Depart(id) => {
                    if self.members.remove(&id) {
                        debug!("Connection {} departed room {}", id, self.name);
                    }
                }
                RoomCommand::Broadcast { sender, frame, .. } => {
                    self.handle_broadcast(sender.as_ref(), &frame)
                }
                RoomCommand::Direct { dst, frame, .. } => self.handle_direct(dst, frame),
                RoomCommand::Members(reply) => {
                    let _ = reply.send(self.members.iter().cloned().collect());
                }
                RoomCommand::Stop => {
                    self.rooms.retire(&self.name, self.instance, || true);
                    break;
                }
            }

            if self.members.is_empty() && self.try_retire() {
                break;
            }
        }

        self.backlog.close();
        self.reroute_pending();
        debug!("Room {} ({}) stopped", self.name, self.instance);
    }

    /// Close the intake and pass queued joins on to the registry
    ///
    /// Only an explicit stop can leave joins behind: they were submitted
    /// under the entry lock before the room deregistered. Everything else
    /// left in the intake is dropped.
    fn reroute_pending(&mut self) {
        self.receiver.close();
        while let Ok(cmd) = self.receiver.try_recv() {
            if let RoomCommand::Join(member) = cmd {
                debug!("Rerouting join of {} to a new room {}", member.id, self.name);
                self.rooms.join(&self.name, member, &self.conns);
            }
        }
    }

    /// Deregister if nothing is waiting in the intake
    fn try_retire(&self) -> bool {
        let receiver = &self.receiver;
        self.rooms
            .retire(&self.name, self.instance, || receiver.is_empty())
    }

    /// Handle a join: reply with who was here before, then add
    fn handle_join(&mut self, member: Member) {
        let prior: Vec<&str> = self
            .members
            .iter()
            .filter(|id| **id != member.id)
            .map(ConnId::as_str)
            .collect();

        let payload = match serde_json::to_vec(&prior) {
            Ok(payload) => Some(payload),
            Err(e) => {
                error!("Failed to encode members of room {}: {}", self.name, e);
                None
            }
        };

        self.members.insert(member.id.clone());
        debug!(
            "Connection {} joined room {} ({} members)",
            member.id,
            self.name,
            self.members.len()
        );

        if let Some(payload) = payload {
            let reply = Message::new(self.name.as_str(), EVENT_JOIN, "", member.id.as_str(), payload);
            self.reply(&member, reply);
        }
    }

    /// Handle a leave: ignore strangers, confirm to members
    fn handle_leave(&mut self, member: Member) {
        if !self.members.remove(&member.id) {
            return;
        }
        debug!(
            "Connection {} left room {} ({} members)",
            member.id,
            self.name,
            self.members.len()
        );

        let id = member.id.as_str();
        let reply = Message::new(self.name.as_str(), EVENT_LEAVE, "", id, id);
        self.reply(&member, reply);
    }

    /// Handle a broadcast: non-blocking fan-out with eviction
    ///
    /// A member whose queue is full is closed and dropped from the room
    /// rather than stalling everyone else. Members whose connection has
    /// already been deregistered are skipped.
    fn handle_broadcast(&mut self, sender: Option<&ConnId>, frame: &str) {
        let mut evicted = Vec::new();

        for id in &self.members {
            if Some(id) == sender {
                continue;
            }
            let Some(conn) = self.conns.get(id) else {
                continue;
            };
            if let Err(e) = conn.outbound().push(frame.to_string()) {
                if e == DeliveryError::Full {
                    warn!("Evicting slow connection {} from room {}", id, self.name);
                    conn.outbound().close();
                }
                evicted.push(id.clone());
            }
        }

        for id in evicted {
            self.members.remove(&id);
        }
    }

    /// Handle a directed message: member check, then registry lookup
    fn handle_direct(&mut self, dst: ConnId, frame: String) {
        if !self.members.contains(&dst) {
            debug!("Dropping directed message: {} not in room {}", dst, self.name);
            return;
        }
        let Some(conn) = self.conns.get(&dst) else {
            debug!("Dropping directed message: {} not connected", dst);
            return;
        };
        if let Err(e) = conn.outbound().push(frame) {
            if e == DeliveryError::Full {
                warn!("Evicting slow connection {} from room {}", dst, self.name);
                conn.outbound().close();
            }
            self.members.remove(&dst);
        }
    }

    /// Send a confirmation straight to the member's queue
    fn reply(&self, member: &Member, msg: Message) {
        if let Err(DeliveryError::Full) = member.outbound.push(msg.encode()) {
            warn!(
                "Outbound queue of {} full, closing (room {})",
                member.id, self.name
            );
            member.outbound.close();
        }
    }
}
