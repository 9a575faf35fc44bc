//! Typing indicators with automatic expiry.
//!
//! `typing-start` schedules an auto-clear so a client that vanishes mid-word
//! never leaves others staring at a stuck indicator. Each (conversation, user)
//! pair has at most one pending timer. Calls for the same pair serialize on
//! its map entry, and every broadcast happens under that entry, so the last
//! call decides what the room sees.

use crate::hub::Hub;
use crate::rooms::Room;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::{ConnectionId, ConversationId, ServerEvent, TypingIndicator, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Default debounce window.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(3);

type TypingKey = (ConversationId, UserId);

/// Pending auto-clear for one (conversation, user) pair.
#[derive(Debug)]
struct PendingClear {
    /// Distinguishes this timer from any that replaced it.
    generation: u64,
    /// Connection whose event started the indicator; excluded from the clear.
    origin: ConnectionId,
    timer: JoinHandle<()>,
}

struct Inner {
    hub: Arc<Hub>,
    window: Duration,
    pending: DashMap<TypingKey, PendingClear>,
    generation: AtomicU64,
}

impl Inner {
    fn emit(&self, key: &TypingKey, is_typing: bool, origin: &ConnectionId) -> usize {
        let (conversation_id, user_id) = key;
        self.hub.send_to_room(
            &Room::conversation(conversation_id.as_str()),
            ServerEvent::UserTyping(TypingIndicator {
                user_id: user_id.clone(),
                conversation_id: conversation_id.clone(),
                is_typing,
            }),
            Some(origin),
        )
    }
}

/// Typing debouncer.
#[derive(Clone)]
pub struct TypingDebouncer {
    inner: Arc<Inner>,
}

impl TypingDebouncer {
    /// Create a debouncer with the given window.
    #[must_use]
    pub fn new(hub: Arc<Hub>, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                hub,
                window,
                pending: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// The debounce window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Mark a user as typing and (re)arm the auto-clear.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, conversation_id: &str, user_id: &str, origin: &ConnectionId) {
        let key: TypingKey = (conversation_id.to_string(), user_id.to_string());
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let entry = self.inner.pending.entry(key.clone());
        self.inner.emit(&key, true, origin);

        let timer = tokio::spawn(auto_clear(
            Arc::downgrade(&self.inner),
            key,
            generation,
            self.inner.window,
        ));
        let pending = PendingClear {
            generation,
            origin: origin.clone(),
            timer,
        };

        match entry {
            Entry::Occupied(mut occupied) => {
                occupied.get().timer.abort();
                occupied.insert(pending);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(pending);
            }
        }

        trace!(conversation = %conversation_id, user = %user_id, "Typing started");
    }

    /// Mark a user as no longer typing and cancel any pending auto-clear.
    pub fn stop(&self, conversation_id: &str, user_id: &str, origin: &ConnectionId) {
        let key: TypingKey = (conversation_id.to_string(), user_id.to_string());

        match self.inner.pending.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                occupied.get().timer.abort();
                self.inner.emit(&key, false, origin);
                occupied.remove();
            }
            Entry::Vacant(_vacant) => {
                self.inner.emit(&key, false, origin);
            }
        }

        trace!(conversation = %conversation_id, user = %user_id, "Typing stopped");
    }

    /// Check if a user currently shows as typing in a conversation.
    #[must_use]
    pub fn is_typing(&self, conversation_id: &str, user_id: &str) -> bool {
        self.inner
            .pending
            .contains_key(&(conversation_id.to_string(), user_id.to_string()))
    }

    /// Users currently typing in a conversation, sorted.
    #[must_use]
    pub fn active(&self, conversation_id: &str) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .inner
            .pending
            .iter()
            .filter(|entry| entry.key().0 == conversation_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        users.sort_unstable();
        users
    }

    /// Number of pending auto-clears.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

/// Fire the auto-clear for `key` unless a newer `start` or a `stop` got there
/// first. Abort alone is not enough: the timer may already be past its sleep
/// and waiting on the entry lock.
async fn auto_clear(inner: Weak<Inner>, key: TypingKey, generation: u64, window: Duration) {
    tokio::time::sleep(window).await;

    let Some(inner) = inner.upgrade() else {
        return;
    };

    if let Entry::Occupied(occupied) = inner.pending.entry(key.clone()) {
        if occupied.get().generation != generation {
            return;
        }
        inner.emit(&key, false, &occupied.get().origin);
        occupied.remove();
        debug!(conversation = %key.0, user = %key.1, "Typing auto-cleared");
    };
}
