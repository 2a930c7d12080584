//! Inbound message routing
//!
//! Every decoded frame is classified into a [`Route`] first and then
//! executed against the sending connection. Keeping the decision separate
//! from its effects lets the routing table be tested on its own.

use std::sync::Arc;

use tracing::trace;

use crate::connection::Connection;
use crate::listener::Listeners;
use crate::message::Message;
use crate::types::{ConnId, EVENT_JOIN, EVENT_JOINED, EVENT_LEAVE, EVENT_LEFT};

/// Where an inbound message goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Join the message's room
    Join,
    /// Leave the message's room
    Leave,
    /// Reserved confirmation echoed back; rebroadcast it
    Reemit,
    /// Departure notice; rebroadcast and drop the sender from the room
    Left,
    /// Point-to-point delivery to `dst` within the room
    Directed,
    /// Hand to application listeners
    Listeners,
    /// Fan out to the room
    Broadcast,
}

/// Decide how `msg` should be handled
pub fn route(msg: &Message, listeners: &Listeners) -> Route {
    match msg.event.as_str() {
        EVENT_JOIN => Route::Join,
        EVENT_LEAVE => Route::Leave,
        EVENT_JOINED => Route::Reemit,
        EVENT_LEFT => Route::Left,
        _ if msg.is_directed() => Route::Directed,
        event if listeners.count(event) > 0 => Route::Listeners,
        _ => Route::Broadcast,
    }
}

/// Route `msg` on behalf of `conn`
///
/// Waits only when the target room's backlog is full.
pub async fn dispatch(conn: &Arc<Connection>, msg: Message) {
    let route = route(&msg, conn.hub().listeners());
    trace!(
        "Connection {} sent '{}' to room '{}': {:?}",
        conn.id(),
        msg.event,
        msg.room,
        route
    );
    execute(conn, route, msg).await;
}

pub(crate) async fn execute(conn: &Arc<Connection>, route: Route, msg: Message) {
    let hub = conn.hub();
    match route {
        Route::Join => conn.join(&msg.room),
        Route::Leave => conn.leave(&msg.room),
        Route::Reemit | Route::Broadcast => conn.emit(&msg).await,
        Route::Left => {
            conn.emit(&msg).await;
            if let Some(room) = hub.rooms().get(&msg.room) {
                room.depart(conn.id().clone());
            }
        }
        Route::Directed => {
            // member and connection lookups happen in the room's loop
            if let Some(room) = hub.rooms().get(&msg.room) {
                room.direct(ConnId::from(msg.dst.as_str()), msg.encode())
                    .await;
            }
        }
        Route::Listeners => {
            // every listener went away after routing
            if hub.listeners().emit(&msg.event, conn, &msg) == 0 {
                conn.emit(&msg).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::connection::{test_connection, OutboundQueue};
    use crate::registry::Hub;

    async fn next_message(queue: &mut OutboundQueue) -> Message {
        let frame = tokio::time::timeout(Duration::from_secs(1), queue.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed");
        Message::decode(frame.as_bytes())
    }

    #[test]
    fn test_route_table() {
        let listeners = Listeners::new();
        listeners.on("chat", |_, _| {});
        listeners.on("join", |_, _| {});

        let msg = |event: &str, dst: &str| Message::new("r", event, dst, "", "");
        assert_eq!(route(&msg("join", ""), &listeners), Route::Join);
        assert_eq!(route(&msg("leave", "x"), &listeners), Route::Leave);
        assert_eq!(route(&msg("joined", ""), &listeners), Route::Reemit);
        assert_eq!(route(&msg("left", ""), &listeners), Route::Left);
        assert_eq!(route(&msg("chat", "x"), &listeners), Route::Directed);
        assert_eq!(route(&msg("chat", ""), &listeners), Route::Listeners);
        assert_eq!(route(&msg("other", ""), &listeners), Route::Broadcast);
        assert_eq!(route(&Message::default(), &listeners), Route::Broadcast);
    }

    #[tokio::test]
    async fn test_join_and_leave_events() {
        let hub = Hub::new();
        let (a, mut qa) = test_connection(&hub, 8);

        dispatch(&a, Message::new("lobby", "join", "", "", "")).await;
        assert_eq!(next_message(&mut qa).await.event, "join");
        assert_eq!(a.rooms(), vec!["lobby".to_string()]);

        dispatch(&a, Message::new("lobby", "leave", "", "", "")).await;
        assert_eq!(next_message(&mut qa).await.event, "leave");
        assert!(a.rooms().is_empty());
    }

    #[tokio::test]
    async fn test_directed_reaches_only_destination() {
        let hub = Hub::new();
        let (a, mut qa) = test_connection(&hub, 8);
        let (b, mut qb) = test_connection(&hub, 8);
        let (c, mut qc) = test_connection(&hub, 8);
        for (conn, queue) in [(&a, &mut qa), (&b, &mut qb), (&c, &mut qc)] {
            conn.join("lobby");
            next_message(queue).await;
        }

        dispatch(&a, Message::new("lobby", "whisper", c.id().as_str(), a.id().as_str(), "psst")).await;
        let msg = next_message(&mut qc).await;
        assert_eq!(msg.event, "whisper");
        assert_eq!(msg.payload, b"psst");

        hub.rooms().get("lobby").unwrap().members().await;
        assert!(qa.try_recv().is_none());
        assert!(qb.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_directed_to_non_member_is_dropped() {
        let hub = Hub::new();
        let (a, mut qa) = test_connection(&hub, 8);
        let (outsider, mut qo) = test_connection(&hub, 8);
        a.join("lobby");
        next_message(&mut qa).await;

        dispatch(&a, Message::new("lobby", "whisper", outsider.id().as_str(), "", "")).await;
        dispatch(&a, Message::new("lobby", "whisper", "no-such-id", "", "")).await;
        dispatch(&a, Message::new("nowhere", "whisper", outsider.id().as_str(), "", "")).await;

        hub.rooms().get("lobby").unwrap().members().await;
        assert!(qo.try_recv().is_none());
        assert!(qa.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_listeners_replace_broadcast() {
        let hub = Hub::new();
        let (a, mut qa) = test_connection(&hub, 8);
        let (b, mut qb) = test_connection(&hub, 8);
        a.join("lobby");
        next_message(&mut qa).await;
        b.join("lobby");
        next_message(&mut qb).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sender = b.id().clone();
        hub.listeners().on("score", move |conn, msg| {
            assert_eq!(conn.id(), &sender);
            assert_eq!(msg.payload, b"42");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatch(&b, Message::new("lobby", "score", "", "", "42")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        hub.rooms().get("lobby").unwrap().members().await;
        assert!(qa.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unhandled_event_broadcasts() {
        let hub = Hub::new();
        let (a, mut qa) = test_connection(&hub, 8);
        let (b, mut qb) = test_connection(&hub, 8);
        a.join("lobby");
        next_message(&mut qa).await;
        b.join("lobby");
        next_message(&mut qb).await;

        dispatch(&b, Message::new("lobby", "chat", "", "", "hi")).await;
        assert_eq!(next_message(&mut qa).await.payload, b"hi");
        hub.rooms().get("lobby").unwrap().members().await;
        assert!(qb.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_listener_route_without_listeners_broadcasts() {
        let hub = Hub::new();
        let (a, mut qa) = test_connection(&hub, 8);
        let (b, mut qb) = test_connection(&hub, 8);
        a.join("lobby");
        next_message(&mut qa).await;
        b.join("lobby");
        next_message(&mut qb).await;

        let id = hub.listeners().on("score", |_, _| {});
        let msg = Message::new("lobby", "score", "", "", "7");
        let route = route(&msg, hub.listeners());
        assert_eq!(route, Route::Listeners);

        // deregistered between routing and execution
        hub.listeners().off("score", id);
        execute(&b, route, msg).await;
        assert_eq!(next_message(&mut qa).await.payload, b"7");
        assert!(qb.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_left_event_departs_and_rebroadcasts() {
        let hub = Hub::new();
        let (a, mut qa) = test_connection(&hub, 8);
        let (b, mut qb) = test_connection(&hub, 8);
        a.join("lobby");
        next_message(&mut qa).await;
        b.join("lobby");
        next_message(&mut qb).await;

        dispatch(&b, Message::new("lobby", "left", "", b.id().as_str(), b.id().as_str())).await;
        assert_eq!(next_message(&mut qa).await.event, "left");

        let room = hub.rooms().get("lobby").unwrap();
        assert_eq!(room.members().await, vec![a.id().clone()]);
        assert!(qb.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_inert() {
        let hub = Hub::new();
        let (a, mut qa) = test_connection(&hub, 8);
        a.join("lobby");
        next_message(&mut qa).await;

        dispatch(&a, Message::decode(b"{not json")).await;
        assert_eq!(hub.rooms().names(), vec!["lobby".to_string()]);
        assert!(!a.outbound().is_closed());
        assert!(qa.try_recv().is_none());
    }
}
