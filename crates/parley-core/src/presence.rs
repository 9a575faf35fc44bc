//! Presence tracking for Parley.
//!
//! A user is online while the registry holds at least one connection for
//! them. The tracker turns the registry's first/last transitions into
//! `user-status` broadcasts, so a user with several devices goes online once
//! and offline once.
//!
//! Broadcasts for a user are serialized on that user's presence entry, and
//! each one reports the registry state read under that entry. A bind racing
//! the user's last unbind therefore never leaves observers with a status the
//! registry no longer agrees with.

use crate::hub::Hub;
use crate::message::now_millis;
use crate::registry::{Binding, Registry, Unbinding};
use dashmap::DashMap;
use parley_protocol::{ConnectionId, PresenceStatus, ServerEvent, UserId, UserStatus};
use std::sync::Arc;
use tracing::debug;

/// Last broadcast presence of a user.
#[derive(Debug, Clone, Copy, Default)]
struct Announced {
    online: bool,
    /// When the user last went offline.
    last_seen: Option<u64>,
}

/// Presence tracker.
pub struct PresenceTracker {
    registry: Arc<Registry>,
    hub: Arc<Hub>,
    announced: DashMap<UserId, Announced>,
}

impl PresenceTracker {
    /// Create a presence tracker over a registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>, hub: Arc<Hub>) -> Self {
        Self {
            registry,
            hub,
            announced: DashMap::new(),
        }
    }

    /// Broadcast that a user came online.
    ///
    /// Returns the number of connections notified.
    pub fn set_online(&self, user_id: &str, exclude: Option<&ConnectionId>) -> usize {
        let mut announced = self.announced.entry(user_id.to_string()).or_default();
        self.announce(&mut announced, user_id, true, exclude)
    }

    /// Broadcast that a user went offline, recording the time.
    ///
    /// Returns the number of connections notified.
    pub fn set_offline(&self, user_id: &str, exclude: Option<&ConnectionId>) -> usize {
        let mut announced = self.announced.entry(user_id.to_string()).or_default();
        self.announce(&mut announced, user_id, false, exclude)
    }

    /// Broadcast the user's registry state if it differs from the last one
    /// announced.
    ///
    /// Returns the status broadcast, if any.
    pub fn sync(&self, user_id: &str, exclude: Option<&ConnectionId>) -> Option<PresenceStatus> {
        let mut announced = self.announced.entry(user_id.to_string()).or_default();
        let online = self.registry.is_online(user_id);
        if announced.online == online {
            return None;
        }

        self.announce(&mut announced, user_id, online, exclude);
        Some(if online {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        })
    }

    /// Record and broadcast a status. Callers hold the user's entry, which
    /// keeps broadcasts for one user in order.
    fn announce(
        &self,
        announced: &mut Announced,
        user_id: &str,
        online: bool,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        announced.online = online;
        let status = if online {
            debug!(user = %user_id, "Presence: user online");
            UserStatus {
                user_id: user_id.to_string(),
                status: PresenceStatus::Online,
                last_seen: None,
            }
        } else {
            debug!(user = %user_id, "Presence: user offline");
            let now = now_millis();
            announced.last_seen = Some(now);
            UserStatus {
                user_id: user_id.to_string(),
                status: PresenceStatus::Offline,
                last_seen: Some(now),
            }
        };

        self.hub.broadcast(ServerEvent::UserStatus(status), exclude)
    }

    /// Apply the presence effects of a bind.
    ///
    /// A displaced user whose last connection moved away goes offline; a user
    /// binding their first connection comes online.
    pub fn on_bind(&self, user_id: &str, binding: &Binding, origin: &ConnectionId) {
        if let Some(displaced) = &binding.displaced {
            self.on_unbind(displaced, Some(origin));
        }
        if binding.first_for_user {
            self.sync(user_id, Some(origin));
        }
    }

    /// Apply the presence effects of an unbind.
    pub fn on_unbind(&self, unbinding: &Unbinding, exclude: Option<&ConnectionId>) {
        if unbinding.last_for_user {
            self.sync(&unbinding.user_id, exclude);
        }
    }

    /// Current status of a user.
    #[must_use]
    pub fn status(&self, user_id: &str) -> UserStatus {
        if self.registry.is_online(user_id) {
            UserStatus {
                user_id: user_id.to_string(),
                status: PresenceStatus::Online,
                last_seen: None,
            }
        } else {
            UserStatus {
                user_id: user_id.to_string(),
                status: PresenceStatus::Offline,
                last_seen: self
                    .announced
                    .get(user_id)
                    .and_then(|announced| announced.last_seen),
            }
        }
    }

    /// Check if a user is online.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.registry.is_online(user_id)
    }

    /// All online users, sorted.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.registry.online_users()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::outbound_queue;
    use crate::rooms::Rooms;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    struct Fixture {
        registry: Arc<Registry>,
        hub: Arc<Hub>,
        presence: PresenceTracker,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::new());
        let hub = Arc::new(Hub::new(Arc::new(Rooms::new())));
        let presence = PresenceTracker::new(Arc::clone(&registry), Arc::clone(&hub));
        Fixture {
            registry,
            hub,
            presence,
        }
    }

    #[test]
    fn test_offline_emitted_once_for_two_devices() {
        let f = fixture();
        let (tx, mut observer) = outbound_queue(16);
        f.hub.attach(&conn("observer"), tx);

        for id in ["a1", "a2"] {
            f.registry.register(&conn(id)).unwrap();
            let binding = f.registry.bind(&conn(id), "u1").unwrap();
            f.presence.on_bind("u1", &binding, &conn(id));
        }

        for id in ["a1", "a2"] {
            let unbinding = f.registry.unbind(&conn(id)).unwrap();
            f.presence.on_unbind(&unbinding, None);
        }

        let mut statuses = Vec::new();
        while let Ok(event) = observer.try_recv() {
            if let ServerEvent::UserStatus(status) = &*event {
                statuses.push(status.status);
            }
        }
        assert_eq!(
            statuses,
            vec![PresenceStatus::Online, PresenceStatus::Offline]
        );
    }

    #[test]
    fn test_status_reports_last_seen() {
        let f = fixture();
        assert_eq!(f.presence.status("u1").last_seen, None);

        f.registry.register(&conn("a")).unwrap();
        let binding = f.registry.bind(&conn("a"), "u1").unwrap();
        f.presence.on_bind("u1", &binding, &conn("a"));
        assert_eq!(f.presence.status("u1").status, PresenceStatus::Online);

        let unbinding = f.registry.unbind(&conn("a")).unwrap();
        f.presence.on_unbind(&unbinding, None);

        let status = f.presence.status("u1");
        assert_eq!(status.status, PresenceStatus::Offline);
        assert!(status.last_seen.is_some());
    }

    #[test]
    fn test_sync_reports_registry_state_once() {
        let f = fixture();
        let (tx, mut observer) = outbound_queue(16);
        f.hub.attach(&conn("observer"), tx);

        f.registry.register(&conn("a")).unwrap();
        f.registry.bind(&conn("a"), "u1").unwrap();
        assert_eq!(f.presence.sync("u1", None), Some(PresenceStatus::Online));
        assert_eq!(f.presence.sync("u1", None), None);

        // Unbind and rebind before either side syncs: nothing changed overall
        let unbinding = f.registry.unbind(&conn("a")).unwrap();
        let binding = f.registry.bind(&conn("a"), "u1").unwrap();
        f.presence.on_bind("u1", &binding, &conn("a"));
        f.presence.on_unbind(&unbinding, None);

        let mut statuses = Vec::new();
        while let Ok(event) = observer.try_recv() {
            if let ServerEvent::UserStatus(status) = &*event {
                statuses.push(status.status);
            }
        }
        assert_eq!(statuses, vec![PresenceStatus::Online]);
        assert!(f.presence.is_online("u1"));
    }
}
