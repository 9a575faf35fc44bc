//! Connection registry.
//!
//! Bidirectional index between connections and the users bound to them. A
//! user may hold any number of live connections (one per device or tab); a
//! connection is bound to at most one user.
//!
//! Lock order: a connection entry is always locked before a user entry.
//! Every mutation of the reverse index happens while the forward entry is
//! held, so the two indices never disagree for a given connection.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::{ConnectionId, UserId};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The connection was never registered, or is already closed.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection is already registered.
    #[error("Duplicate connection: {0}")]
    DuplicateConnection(ConnectionId),
}

/// Outcome of [`Registry::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// The user had no live connection before this bind.
    pub first_for_user: bool,
    /// Previous binding of the connection, if it was bound to another user.
    pub displaced: Option<Unbinding>,
}

/// Outcome of removing a connection from a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unbinding {
    /// The user the connection was bound to.
    pub user_id: UserId,
    /// The user has no live connection left.
    pub last_for_user: bool,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Registered connections, bound or not.
    pub connections: usize,
    /// Connections bound to a user.
    pub identified: usize,
    /// Users with at least one connection.
    pub online_users: usize,
}

/// Bidirectional connection/user index.
#[derive(Debug, Default)]
pub struct Registry {
    /// Forward index: connection -> bound user.
    connections: DashMap<ConnectionId, Option<UserId>>,
    /// Reverse index: user -> live connections. Never holds an empty set.
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unbound connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateConnection`] if the connection is
    /// already registered.
    pub fn register(&self, connection_id: &ConnectionId) -> Result<(), RegistryError> {
        match self.connections.entry(connection_id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateConnection(connection_id.clone())),
            Entry::Vacant(entry) => {
                entry.insert(None);
                debug!(connection = %connection_id, "Connection registered");
                Ok(())
            }
        }
    }

    /// Bind a connection to a user.
    ///
    /// Binding a connection that is bound to another user moves it: the stale
    /// reverse entry is removed first. Binding it again to the same user is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownConnection`] if the connection is not
    /// registered.
    pub fn bind(&self, connection_id: &ConnectionId, user_id: &str) -> Result<Binding, RegistryError> {
        let mut bound = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))?;

        if bound.as_deref() == Some(user_id) {
            return Ok(Binding {
                first_for_user: false,
                displaced: None,
            });
        }

        let displaced = bound
            .take()
            .map(|previous| self.detach(connection_id, previous));

        let first_for_user = {
            let mut set = self.users.entry(user_id.to_string()).or_default();
            let first = set.is_empty();
            set.insert(connection_id.clone());
            first
        };

        *bound = Some(user_id.to_string());

        debug!(
            connection = %connection_id,
            user = %user_id,
            first = first_for_user,
            "Connection bound"
        );

        Ok(Binding {
            first_for_user,
            displaced,
        })
    }

    /// Unbind a connection from its user.
    ///
    /// Returns `None` if the connection is unknown or was never bound.
    pub fn unbind(&self, connection_id: &ConnectionId) -> Option<Unbinding> {
        let mut bound = self.connections.get_mut(connection_id)?;
        let user_id = bound.take()?;
        let unbinding = self.detach(connection_id, user_id);

        debug!(
            connection = %connection_id,
            user = %unbinding.user_id,
            last = unbinding.last_for_user,
            "Connection unbound"
        );

        Some(unbinding)
    }

    /// Unbind and forget a connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownConnection`] if the connection is not
    /// registered.
    pub fn deregister(&self, connection_id: &ConnectionId) -> Result<Option<Unbinding>, RegistryError> {
        if !self.connections.contains_key(connection_id) {
            return Err(RegistryError::UnknownConnection(connection_id.clone()));
        }

        let unbinding = self.unbind(connection_id);
        self.connections.remove(connection_id);
        debug!(connection = %connection_id, "Connection deregistered");

        Ok(unbinding)
    }

    /// Remove a connection from a user's set. Caller holds the connection's
    /// forward entry.
    fn detach(&self, connection_id: &ConnectionId, user_id: UserId) -> Unbinding {
        let last_for_user = match self.users.entry(user_id.clone()) {
            Entry::Occupied(mut set) => {
                set.get_mut().remove(connection_id);
                if set.get().is_empty() {
                    set.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        };

        Unbinding {
            user_id,
            last_for_user,
        }
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Get the user bound to a connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownConnection`] if the connection is not
    /// registered.
    pub fn user_of(&self, connection_id: &ConnectionId) -> Result<Option<UserId>, RegistryError> {
        self.connections
            .get(connection_id)
            .map(|bound| bound.value().clone())
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))
    }

    /// Check if a user has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    /// Snapshot of a user's live connections.
    #[must_use]
    pub fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.users
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of all online users, sorted.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.iter().map(|e| e.key().clone()).collect();
        users.sort_unstable();
        users
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.connections.len(),
            identified: self.users.iter().map(|e| e.value().len()).sum(),
            online_users: self.users.len(),
        }
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
    fn test_register_twice_is_an_error() {
        let registry = Registry::new();
        registry.register(&conn("a")).unwrap();

        assert_eq!(
            registry.register(&conn("a")),
            Err(RegistryError::DuplicateConnection(conn("a")))
        );
    }

    #[test]
    fn test_bind_unknown_connection() {
        let registry = Registry::new();

        assert_eq!(
            registry.bind(&conn("a"), "u1"),
            Err(RegistryError::UnknownConnection(conn("a")))
        );
        assert!(!registry.is_online("u1"));
    }

    #[test]
    fn test_multi_device_presence() {
        let registry = Registry::new();
        registry.register(&conn("a1")).unwrap();
        registry.register(&conn("a2")).unwrap();

        assert!(registry.bind(&conn("a1"), "u1").unwrap().first_for_user);
        assert!(!registry.bind(&conn("a2"), "u1").unwrap().first_for_user);
        assert_eq!(registry.connections_of("u1").len(), 2);

        let first = registry.unbind(&conn("a1")).unwrap();
        assert!(!first.last_for_user);
        assert!(registry.is_online("u1"));

        let second = registry.unbind(&conn("a2")).unwrap();
        assert!(second.last_for_user);
        assert!(!registry.is_online("u1"));
        assert!(registry.connections_of("u1").is_empty());
    }

    #[test]
    fn test_rebind_removes_stale_reverse_entry() {
        let registry = Registry::new();
        registry.register(&conn("a")).unwrap();
        registry.bind(&conn("a"), "u1").unwrap();

        let binding = registry.bind(&conn("a"), "u2").unwrap();
        assert!(binding.first_for_user);
        assert_eq!(
            binding.displaced,
            Some(Unbinding {
                user_id: "u1".into(),
                last_for_user: true,
            })
        );
        assert!(!registry.is_online("u1"));
        assert_eq!(registry.user_of(&conn("a")).unwrap().as_deref(), Some("u2"));
    }

    #[test]
    fn test_bind_same_user_is_noop() {
        let registry = Registry::new();
        registry.register(&conn("a")).unwrap();
        registry.bind(&conn("a"), "u1").unwrap();

        let again = registry.bind(&conn("a"), "u1").unwrap();
        assert!(!again.first_for_user);
        assert!(again.displaced.is_none());
        assert_eq!(registry.connections_of("u1"), vec![conn("a")]);
    }

    #[test]
    fn test_unbind_unbound_is_noop() {
        let registry = Registry::new();
        registry.register(&conn("a")).unwrap();

        assert!(registry.unbind(&conn("a")).is_none());
        assert!(registry.unbind(&conn("missing")).is_none());
    }

    #[test]
    fn test_deregister() {
        let registry = Registry::new();
        registry.register(&conn("a")).unwrap();
        registry.bind(&conn("a"), "u1").unwrap();

        let unbinding = registry.deregister(&conn("a")).unwrap().unwrap();
        assert!(unbinding.last_for_user);
        assert!(!registry.contains(&conn("a")));
        assert_eq!(
            registry.deregister(&conn("a")),
            Err(RegistryError::UnknownConnection(conn("a")))
        );
    }

    #[test]
    fn test_registry_stats() {
        let registry = Registry::new();
        for id in ["a", "b", "c"] {
            registry.register(&conn(id)).unwrap();
        }
        registry.bind(&conn("a"), "u1").unwrap();
        registry.bind(&conn("b"), "u1").unwrap();

        let stats = registry.stats();
        assert_eq!(stats.connections, 3);
        assert_eq!(stats.identified, 2);
        assert_eq!(stats.online_users, 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u8),
        Bind(u8, u8),
        Unbind(u8),
        Deregister(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::Register),
            (0u8..6, 0u8..3).prop_map(|(c, u)| Op::Bind(c, u)),
            (0u8..6).prop_map(Op::Unbind),
            (0u8..6).prop_map(Op::Deregister),
        ]
    }

    proptest! {
        #[test]
        fn prop_online_iff_connected(ops in proptest::collection::vec(op(), 0..64)) {
            let registry = Registry::new();
            // Online set as seen through the first/last transitions only.
            let mut online: HashSet<String> = HashSet::new();

            for op in ops {
                match op {
                    Op::Register(c) => {
                        let _ = registry.register(&conn(&format!("c{c}")));
                    }
                    Op::Bind(c, u) => {
                        let user = format!("u{u}");
                        if let Ok(binding) = registry.bind(&conn(&format!("c{c}")), &user) {
                            if let Some(displaced) = binding.displaced {
                                if displaced.last_for_user {
                                    prop_assert!(online.remove(&displaced.user_id));
                                }
                            }
                            if binding.first_for_user {
                                prop_assert!(online.insert(user));
                            }
                        }
                    }
                    Op::Unbind(c) => {
                        if let Some(unbinding) = registry.unbind(&conn(&format!("c{c}"))) {
                            if unbinding.last_for_user {
                                prop_assert!(online.remove(&unbinding.user_id));
                            }
                        }
                    }
                    Op::Deregister(c) => {
                        if let Ok(Some(unbinding)) = registry.deregister(&conn(&format!("c{c}"))) {
                            if unbinding.last_for_user {
                                prop_assert!(online.remove(&unbinding.user_id));
                            }
                        }
                    }
                }

                for u in 0..3u8 {
                    let user = format!("u{u}");
                    let connections = registry.connections_of(&user);
                    prop_assert_eq!(registry.is_online(&user), !connections.is_empty());
                    prop_assert_eq!(registry.is_online(&user), online.contains(&user));
                    for c in &connections {
                        prop_assert_eq!(registry.user_of(c).unwrap(), Some(user.clone()));
                    }
                }
                for c in 0..6u8 {
                    let id = conn(&format!("c{c}"));
                    if let Ok(Some(user)) = registry.user_of(&id) {
                        prop_assert!(registry.connections_of(&user).contains(&id));
                    }
                }
            }
        }
    }
}
