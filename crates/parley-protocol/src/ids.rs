//! Identifier types shared across Parley.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// An externally supplied user identifier.
pub type UserId = String;

/// An externally supplied conversation identifier.
pub type ConversationId = String;

/// Per-process sequence for connection IDs.
static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Process start time in milliseconds, mixed into every connection ID so
/// IDs are not reused across restarts either.
fn process_epoch() -> u64 {
    static EPOCH: OnceLock<u64> = OnceLock::new();
    *EPOCH.get_or_init(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    })
}

/// Opaque, server-assigned identifier for one live transport session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier. Never returns the same value twice
    /// within a process.
    #[must_use]
    pub fn generate() -> Self {
        let seq = CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", process_epoch(), seq))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
