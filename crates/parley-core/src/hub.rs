//! Outbound delivery.
//!
//! Every live connection owns a bounded queue drained by its own writer task.
//! The hub only ever enqueues with `try_send`, so a slow client fills its own
//! queue and loses events while every other connection keeps receiving.

use crate::rooms::{Room, Rooms};
use dashmap::DashMap;
use parley_protocol::{ConnectionId, ServerEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

/// An event queued for delivery. Shared between all recipients of a broadcast.
pub type Outbound = Arc<ServerEvent>;

/// Sending half of a connection's outbound queue.
pub type OutboundSender = mpsc::Sender<Outbound>;

/// Receiving half of a connection's outbound queue, owned by its writer.
pub type OutboundReceiver = mpsc::Receiver<Outbound>;

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Create an outbound queue.
#[must_use]
pub fn outbound_queue(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Delivery hub.
pub struct Hub {
    outboxes: DashMap<ConnectionId, OutboundSender>,
    rooms: Arc<Rooms>,
    dropped: AtomicU64,
}

impl Hub {
    /// Create a hub delivering room traffic according to `rooms`.
    #[must_use]
    pub fn new(rooms: Arc<Rooms>) -> Self {
        Self {
            outboxes: DashMap::new(),
            rooms,
            dropped: AtomicU64::new(0),
        }
    }

    /// Attach a connection's outbound queue.
    ///
    /// Returns `false` (and keeps the existing queue) if one is attached.
    pub fn attach(&self, connection_id: &ConnectionId, sender: OutboundSender) -> bool {
        match self.outboxes.entry(connection_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(sender);
                true
            }
        }
    }

    /// Detach a connection's outbound queue.
    ///
    /// Once the returned sender is dropped, the writer drains whatever is
    /// still queued and stops.
    pub fn detach(&self, connection_id: &ConnectionId) -> Option<OutboundSender> {
        self.outboxes.remove(connection_id).map(|(_, sender)| sender)
    }

    /// Check if a connection has an attached queue.
    #[must_use]
    pub fn is_attached(&self, connection_id: &ConnectionId) -> bool {
        self.outboxes.contains_key(connection_id)
    }

    fn deliver(&self, connection_id: &ConnectionId, event: &Outbound) -> bool {
        let Some(sender) = self.outboxes.get(connection_id) else {
            return false;
        };

        match sender.try_send(Arc::clone(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection = %connection_id,
                    event = event.name(),
                    "Outbound queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!(connection = %connection_id, "Outbound queue closed");
                false
            }
        }
    }

    /// Send an event to one connection.
    pub fn send_to(&self, connection_id: &ConnectionId, event: ServerEvent) -> bool {
        self.deliver(connection_id, &Arc::new(event))
    }

    /// Send an event to every member of a room, except `exclude`.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn send_to_room(
        &self,
        room: &Room,
        event: ServerEvent,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;

        self.rooms.for_each_member(room, |member| {
            if Some(member) != exclude && self.deliver(member, &event) {
                delivered += 1;
            }
        });

        trace!(room = %room, event = event.name(), recipients = delivered, "Room delivery");
        delivered
    }

    /// Send an event to an explicit set of connections.
    pub fn send_to_all<'a>(
        &self,
        connections: impl IntoIterator<Item = &'a ConnectionId>,
        event: ServerEvent,
    ) -> usize {
        let event = Arc::new(event);
        connections
            .into_iter()
            .filter(|connection_id| self.deliver(connection_id, &event))
            .count()
    }

    /// Send an event to every attached connection, except `exclude`.
    pub fn broadcast(&self, event: ServerEvent, exclude: Option<&ConnectionId>) -> usize {
        let event = Arc::new(event);
        let targets: Vec<ConnectionId> = self
            .outboxes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| Some(id) != exclude)
            .collect();

        let delivered = targets.iter().filter(|id| self.deliver(id, &event)).count();
        trace!(event = event.name(), recipients = delivered, "Broadcast");
        delivered
    }

    /// Number of attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    /// Number of events dropped because a queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::{ErrorReply, PresenceStatus, UserStatus};

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    fn status(user: &str) -> ServerEvent {
        ServerEvent::UserStatus(UserStatus {
            user_id: user.into(),
            status: PresenceStatus::Online,
            last_seen: None,
        })
    }

    #[test]
    fn test_room_delivery_excludes_sender() {
        let rooms = Arc::new(Rooms::new());
        let hub = Hub::new(Arc::clone(&rooms));

        let (tx_a, mut rx_a) = outbound_queue(8);
        let (tx_b, mut rx_b) = outbound_queue(8);
        hub.attach(&conn("a"), tx_a);
        hub.attach(&conn("b"), tx_b);

        let room = Room::conversation("c1");
        rooms.join(&conn("a"), room.clone());
        rooms.join(&conn("b"), room.clone());

        assert_eq!(hub.send_to_room(&room, status("u1"), Some(&conn("a"))), 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(*rx_b.try_recv().unwrap(), status("u1"));
    }

    #[test]
    fn test_full_queue_drops_only_for_that_connection() {
        let rooms = Arc::new(Rooms::new());
        let hub = Hub::new(Arc::clone(&rooms));

        let (tx_slow, _rx_slow) = outbound_queue(1);
        let (tx_fast, mut rx_fast) = outbound_queue(8);
        hub.attach(&conn("slow"), tx_slow);
        hub.attach(&conn("fast"), tx_fast);

        assert_eq!(hub.broadcast(status("u1"), None), 2);
        assert_eq!(hub.broadcast(status("u2"), None), 1);
        assert_eq!(hub.dropped_count(), 1);

        assert_eq!(*rx_fast.try_recv().unwrap(), status("u1"));
        assert_eq!(*rx_fast.try_recv().unwrap(), status("u2"));
    }

    #[test]
    fn test_detach_stops_delivery() {
        let hub = Hub::new(Arc::new(Rooms::new()));
        let (tx, mut rx) = outbound_queue(8);
        assert!(hub.attach(&conn("a"), tx));

        let (other, _) = outbound_queue(8);
        assert!(!hub.attach(&conn("a"), other));

        let error = ServerEvent::Error(ErrorReply {
            code: "invalid-payload".into(),
            message: "bad".into(),
            event: None,
        });
        assert!(hub.send_to(&conn("a"), error.clone()));

        drop(hub.detach(&conn("a")));
        assert!(!hub.send_to(&conn("a"), error.clone()));

        // Queued events survive the detach
        assert_eq!(*rx.try_recv().unwrap(), error);
        assert!(rx.try_recv().is_err());
    }
}
