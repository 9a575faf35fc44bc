//! Room membership for Parley.
//!
//! Rooms are named groups of connections. Every identified connection sits in
//! its user's personal room; conversation rooms are joined and left
//! explicitly. Membership is indexed both per room and per connection, so a
//! disconnect only touches the rooms that connection actually joined.

use dashmap::DashMap;
use parley_protocol::{ConnectionId, ConversationId, UserId};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, trace};

/// A room name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Room {
    /// Personal room of a user (`user:<id>`).
    User(UserId),
    /// Shared room of a conversation (`conversation:<id>`).
    Conversation(ConversationId),
}

impl Room {
    #[must_use]
    pub fn user(user_id: impl Into<UserId>) -> Self {
        Room::User(user_id.into())
    }

    #[must_use]
    pub fn conversation(conversation_id: impl Into<ConversationId>) -> Self {
        Room::Conversation(conversation_id.into())
    }

    /// Check if this is a conversation room.
    #[must_use]
    pub fn is_conversation(&self) -> bool {
        matches!(self, Room::Conversation(_))
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user:{id}"),
            Room::Conversation(id) => write!(f, "conversation:{id}"),
        }
    }
}

/// Room statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    /// Rooms with at least one member.
    pub rooms: usize,
    /// Of which conversation rooms.
    pub conversations: usize,
    /// Total memberships across all rooms.
    pub memberships: usize,
}

/// Room manager.
///
/// Lock order: a connection's membership entry is locked before any room
/// entry, and stays locked while that connection is added to or removed from
/// rooms.
#[derive(Debug, Default)]
pub struct Rooms {
    /// Members of each room. Never holds an empty set.
    rooms: DashMap<Room, HashSet<ConnectionId>>,
    /// Rooms joined by each connection.
    memberships: DashMap<ConnectionId, HashSet<Room>>,
}

impl Rooms {
    /// Create an empty room manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room.
    ///
    /// Returns `true` if the connection was not already a member.
    pub fn join(&self, connection_id: &ConnectionId, room: Room) -> bool {
        let mut joined = self.memberships.entry(connection_id.clone()).or_default();
        if joined.contains(&room) {
            return false;
        }

        let mut members = self.rooms.entry(room.clone()).or_default();
        members.insert(connection_id.clone());
        debug!(
            room = %room,
            connection = %connection_id,
            members = members.len(),
            "Joined room"
        );
        drop(members);

        joined.insert(room);
        true
    }

    /// Remove a connection from a room.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&self, connection_id: &ConnectionId, room: &Room) -> bool {
        let Some(mut joined) = self.memberships.get_mut(connection_id) else {
            return false;
        };
        if !joined.remove(room) {
            return false;
        }

        self.remove_member(room, connection_id);
        debug!(room = %room, connection = %connection_id, "Left room");

        let now_empty = joined.is_empty();
        drop(joined);
        if now_empty {
            self.memberships.remove_if(connection_id, |_, rooms| rooms.is_empty());
        }

        true
    }

    /// Remove a connection from every room it belongs to.
    ///
    /// Returns the rooms it left. Safe to call for a connection that never
    /// joined anything.
    pub fn leave_all(&self, connection_id: &ConnectionId) -> Vec<Room> {
        let Some(mut joined) = self.memberships.get_mut(connection_id) else {
            return Vec::new();
        };

        let left: Vec<Room> = joined.drain().collect();
        for room in &left {
            self.remove_member(room, connection_id);
        }
        drop(joined);
        self.memberships.remove_if(connection_id, |_, rooms| rooms.is_empty());

        debug!(connection = %connection_id, rooms = left.len(), "Left all rooms");
        left
    }

    /// Drop a member from a room's set, deleting the room once empty.
    fn remove_member(&self, room: &Room, connection_id: &ConnectionId) {
        let now_empty = match self.rooms.get_mut(room) {
            Some(mut members) => {
                members.remove(connection_id);
                members.is_empty()
            }
            None => false,
        };

        if now_empty && self.rooms.remove_if(room, |_, members| members.is_empty()).is_some() {
            trace!(room = %room, "Deleted empty room");
        }
    }

    /// Snapshot of a room's members.
    #[must_use]
    pub fn members_of(&self, room: &Room) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Visit every member of a room while holding the room's read guard, so
    /// the visit sees exactly one membership state.
    ///
    /// `visit` must not call back into the room manager.
    pub fn for_each_member(&self, room: &Room, mut visit: impl FnMut(&ConnectionId)) -> usize {
        match self.rooms.get(room) {
            Some(members) => {
                members.iter().for_each(&mut visit);
                members.len()
            }
            None => 0,
        }
    }

    /// Snapshot of the rooms a connection belongs to.
    #[must_use]
    pub fn rooms_of(&self, connection_id: &ConnectionId) -> Vec<Room> {
        self.memberships
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check if a connection is in a room.
    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId, room: &Room) -> bool {
        self.rooms
            .get(room)
            .map(|members| members.contains(connection_id))
            .unwrap_or(false)
    }

    /// Check if a room has any members.
    #[must_use]
    pub fn room_exists(&self, room: &Room) -> bool {
        self.rooms.contains_key(room)
    }

    /// Get room statistics.
    #[must_use]
    pub fn stats(&self) -> RoomStats {
        let mut stats = RoomStats::default();
        for entry in self.rooms.iter() {
            stats.rooms += 1;
            stats.memberships += entry.value().len();
            if entry.key().is_conversation() {
                stats.conversations += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[test]
    fn test_room_names() {
        assert_eq!(Room::user("u1").to_string(), "user:u1");
        assert_eq!(Room::conversation("c1").to_string(), "conversation:c1");
    }

    #[test]
    fn test_join_leave() {
        let rooms = Rooms::new();
        let room = Room::conversation("c1");

        assert!(rooms.join(&conn("a"), room.clone()));
        assert!(rooms.join(&conn("b"), room.clone()));
        assert_eq!(rooms.members_of(&room).len(), 2);

        assert!(rooms.leave(&conn("a"), &room));
        assert!(!rooms.is_member(&conn("a"), &room));
        assert!(rooms.rooms_of(&conn("a")).is_empty());

        // Leaving again is a no-op
        assert!(!rooms.leave(&conn("a"), &room));

        assert!(rooms.leave(&conn("b"), &room));
        assert!(!rooms.room_exists(&room));
    }

    #[test]
    fn test_join_is_idempotent() {
        let rooms = Rooms::new();
        let room = Room::conversation("c1");

        assert!(rooms.join(&conn("a"), room.clone()));
        assert!(!rooms.join(&conn("a"), room.clone()));

        assert_eq!(rooms.members_of(&room), vec![conn("a")]);
        assert_eq!(rooms.rooms_of(&conn("a")), vec![room]);
    }

    #[test]
    fn test_leave_all() {
        let rooms = Rooms::new();
        let joined = [
            Room::user("u1"),
            Room::conversation("c1"),
            Room::conversation("c2"),
        ];
        for room in &joined {
            rooms.join(&conn("a"), room.clone());
        }
        rooms.join(&conn("b"), Room::conversation("c1"));

        let mut left = rooms.leave_all(&conn("a"));
        left.sort();
        assert_eq!(left.len(), 3);

        for room in &joined {
            assert!(!rooms.members_of(room).contains(&conn("a")));
        }
        assert_eq!(rooms.members_of(&Room::conversation("c1")), vec![conn("b")]);
        assert!(!rooms.room_exists(&Room::conversation("c2")));

        // Never joined anything
        assert!(rooms.leave_all(&conn("ghost")).is_empty());
    }

    #[test]
    fn test_for_each_member() {
        let rooms = Rooms::new();
        let room = Room::conversation("c1");
        rooms.join(&conn("a"), room.clone());
        rooms.join(&conn("b"), room.clone());

        let mut seen = Vec::new();
        let count = rooms.for_each_member(&room, |c| seen.push(c.clone()));
        seen.sort();

        assert_eq!(count, 2);
        assert_eq!(seen, vec![conn("a"), conn("b")]);
        assert_eq!(rooms.for_each_member(&Room::conversation("none"), |_| {}), 0);
    }

    #[test]
    fn test_room_stats() {
        let rooms = Rooms::new();
        rooms.join(&conn("a"), Room::user("u1"));
        rooms.join(&conn("a"), Room::conversation("c1"));
        rooms.join(&conn("b"), Room::conversation("c1"));

        let stats = rooms.stats();
        assert_eq!(stats.rooms, 2);
        assert_eq!(stats.conversations, 1);
        assert_eq!(stats.memberships, 3);
    }

    proptest! {
        #[test]
        fn prop_leave_all_clears_every_room(
            history in proptest::collection::vec((0u8..4, 0u8..5, any::<bool>()), 0..48),
            target in 0u8..4,
        ) {
            let rooms = Rooms::new();
            for (c, r, join) in history {
                let room = Room::conversation(format!("c{r}"));
                if join {
                    rooms.join(&conn(&format!("k{c}")), room);
                } else {
                    rooms.leave(&conn(&format!("k{c}")), &room);
                }
            }

            let target = conn(&format!("k{target}"));
            let before = rooms.rooms_of(&target).len();
            prop_assert_eq!(rooms.leave_all(&target).len(), before);

            for r in 0..5u8 {
                let room = Room::conversation(format!("c{r}"));
                prop_assert!(!rooms.members_of(&room).contains(&target));
            }
            prop_assert!(rooms.rooms_of(&target).is_empty());
        }
    }
}
