//! Event router for Parley.
//!
//! The router owns the connection lifecycle. It parses inbound envelopes,
//! validates them, updates the registry, rooms and presence, and hands
//! every outbound event to the hub.

use crate::hub::{outbound_queue, Hub, OutboundReceiver, DEFAULT_OUTBOUND_CAPACITY};
use crate::message::compose;
use crate::presence::PresenceTracker;
use crate::registry::{Registry, RegistryError, RegistryStats};
use crate::rooms::{Room, RoomStats, Rooms};
use crate::typing::{TypingDebouncer, DEFAULT_TYPING_TIMEOUT};
use parley_protocol::codec::ProtocolError;
use parley_protocol::{
    ClientEvent, ConnectionId, ConversationMember, Envelope, ErrorReply, EventError, Joined,
    MessageSent, OnlineUsers, ReadReceipt, SendMessage, ServerEvent, UserId, Welcome,
    PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Router errors.
///
/// None of these is fatal: the router reports them to the originating
/// connection and keeps it open.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A required field is absent or empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The payload is structurally malformed.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The connection is not registered.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection is already registered.
    #[error("Duplicate connection: {0}")]
    DuplicateConnection(ConnectionId),

    /// The event needs a user, but the connection has not joined yet.
    #[error("Connection has not joined as a user")]
    NotIdentified,

    /// The event name is not part of the protocol.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
}

impl RouterError {
    /// Stable wire code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "missing-field",
            Self::InvalidPayload(_) => "invalid-payload",
            Self::UnknownConnection(_) => "unknown-connection",
            Self::DuplicateConnection(_) => "duplicate-connection",
            Self::NotIdentified => "not-identified",
            Self::UnknownEvent(_) => "unknown-event",
        }
    }
}

impl From<RegistryError> for RouterError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownConnection(id) => Self::UnknownConnection(id),
            RegistryError::DuplicateConnection(id) => Self::DuplicateConnection(id),
        }
    }
}

impl From<EventError> for RouterError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::MissingField(field) => Self::MissingField(field),
            EventError::InvalidPayload(reason) => Self::InvalidPayload(reason),
            EventError::UnknownEvent(name) => Self::UnknownEvent(name),
        }
    }
}

impl From<ProtocolError> for RouterError {
    fn from(err: ProtocolError) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

/// How a message with a `recipientId` reaches the recipient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientPolicy {
    /// One `new-message` per connection, whether it sits in the conversation
    /// room, the recipient's personal room, or both.
    #[default]
    Deduplicated,
    /// `new-message` to the conversation room plus a `message-notification`
    /// to the recipient's personal room. A connection in both gets both.
    Additional,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Typing auto-clear window.
    pub typing_timeout: Duration,
    /// Outbound queue capacity per connection.
    pub outbound_queue_capacity: usize,
    /// Recipient delivery policy.
    pub recipient_policy: RecipientPolicy,
    /// Push `online-users` to a connection right after it joins.
    pub send_online_users_on_join: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            outbound_queue_capacity: DEFAULT_OUTBOUND_CAPACITY,
            recipient_policy: RecipientPolicy::default(),
            send_online_users_on_join: true,
        }
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, no user bound yet.
    Connected,
    /// Bound to a user.
    Identified(UserId),
    /// Never registered, or disconnected.
    Closed,
}

/// The event router.
pub struct Router {
    registry: Arc<Registry>,
    rooms: Arc<Rooms>,
    hub: Arc<Hub>,
    presence: PresenceTracker,
    typing: TypingDebouncer,
    config: RouterConfig,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);

        let registry = Arc::new(Registry::new());
        let rooms = Arc::new(Rooms::new());
        let hub = Arc::new(Hub::new(Arc::clone(&rooms)));
        let presence = PresenceTracker::new(Arc::clone(&registry), Arc::clone(&hub));
        let typing = TypingDebouncer::new(Arc::clone(&hub), config.typing_timeout);

        Self {
            registry,
            rooms,
            hub,
            presence,
            typing,
            config,
        }
    }

    /// Register a new connection.
    ///
    /// Returns the receiving half of its outbound queue, already holding the
    /// `welcome` event.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateConnection`] if the ID is in use.
    pub fn connect(&self, connection_id: &ConnectionId) -> Result<OutboundReceiver, RouterError> {
        self.registry.register(connection_id)?;

        let (tx, rx) = outbound_queue(self.config.outbound_queue_capacity);
        self.hub.attach(connection_id, tx);
        self.hub.send_to(
            connection_id,
            ServerEvent::Welcome(Welcome {
                connection_id: connection_id.clone(),
                version: PROTOCOL_VERSION,
            }),
        );

        debug!(connection = %connection_id, "Connection accepted");
        Ok(rx)
    }

    /// Get the lifecycle state of a connection.
    #[must_use]
    pub fn state(&self, connection_id: &ConnectionId) -> ConnectionState {
        match self.registry.user_of(connection_id) {
            Ok(Some(user_id)) => ConnectionState::Identified(user_id),
            Ok(None) => ConnectionState::Connected,
            Err(_) => ConnectionState::Closed,
        }
    }

    /// Parse and handle an inbound envelope.
    ///
    /// Failures are also reported to the connection as an `error` event.
    ///
    /// # Errors
    ///
    /// Returns the [`RouterError`] that was reported.
    pub fn dispatch(&self, connection_id: &ConnectionId, envelope: Envelope) -> Result<(), RouterError> {
        let name = envelope.event.clone();
        trace!(connection = %connection_id, event = %name, "Dispatching event");

        let result = ClientEvent::from_envelope(envelope)
            .map_err(RouterError::from)
            .and_then(|event| self.handle(connection_id, event));

        if let Err(err) = &result {
            self.reject(connection_id, err, Some(&name));
        }
        result
    }

    /// Report an error to a single connection.
    pub fn reject(&self, connection_id: &ConnectionId, error: &RouterError, event: Option<&str>) {
        warn!(
            connection = %connection_id,
            event = event.unwrap_or("-"),
            code = error.code(),
            "Rejected event: {}",
            error
        );

        self.hub.send_to(
            connection_id,
            ServerEvent::Error(ErrorReply {
                code: error.code().to_string(),
                message: error.to_string(),
                event: event.map(str::to_string),
            }),
        );
    }

    /// Handle a parsed event.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown, or the event needs a
    /// user and the connection has not joined.
    pub fn handle(&self, connection_id: &ConnectionId, event: ClientEvent) -> Result<(), RouterError> {
        let user = self.registry.user_of(connection_id)?;

        match event {
            ClientEvent::Join { user_id } => self.join(connection_id, user_id),
            ClientEvent::JoinConversation { conversation_id } => {
                let user_id = user.ok_or(RouterError::NotIdentified)?;
                let room = Room::conversation(conversation_id.clone());
                if self.rooms.join(connection_id, room.clone()) {
                    self.hub.send_to_room(
                        &room,
                        ServerEvent::UserJoinedConversation(ConversationMember {
                            user_id,
                            conversation_id,
                        }),
                        Some(connection_id),
                    );
                }
                Ok(())
            }
            ClientEvent::LeaveConversation { conversation_id } => {
                self.rooms
                    .leave(connection_id, &Room::conversation(conversation_id));
                Ok(())
            }
            ClientEvent::SendMessage(payload) => {
                let user_id = user.ok_or(RouterError::NotIdentified)?;
                self.send_message(connection_id, user_id, payload);
                Ok(())
            }
            ClientEvent::TypingStart { conversation_id } => {
                let user_id = user.ok_or(RouterError::NotIdentified)?;
                self.typing.start(&conversation_id, &user_id, connection_id);
                Ok(())
            }
            ClientEvent::TypingStop { conversation_id } => {
                let user_id = user.ok_or(RouterError::NotIdentified)?;
                self.typing.stop(&conversation_id, &user_id, connection_id);
                Ok(())
            }
            ClientEvent::MarkMessagesRead {
                conversation_id,
                message_ids,
            } => {
                let user_id = user.ok_or(RouterError::NotIdentified)?;
                let room = Room::conversation(conversation_id.clone());
                self.hub.send_to_room(
                    &room,
                    ServerEvent::MessagesRead(ReadReceipt {
                        user_id,
                        conversation_id,
                        message_ids,
                    }),
                    Some(connection_id),
                );
                Ok(())
            }
            ClientEvent::CheckUserStatus { user_id } => {
                self.hub.send_to(
                    connection_id,
                    ServerEvent::UserStatus(self.presence.status(&user_id)),
                );
                Ok(())
            }
            ClientEvent::GetOnlineUsers { conversation_id } => {
                let user_ids = match &conversation_id {
                    Some(conversation_id) => self.online_users_in(conversation_id),
                    None => self.presence.online_users(),
                };
                self.hub.send_to(
                    connection_id,
                    ServerEvent::OnlineUsers(OnlineUsers {
                        conversation_id,
                        user_ids,
                    }),
                );
                Ok(())
            }
        }
    }

    fn join(&self, connection_id: &ConnectionId, user_id: UserId) -> Result<(), RouterError> {
        let binding = self.registry.bind(connection_id, &user_id)?;

        if let Some(displaced) = &binding.displaced {
            self.rooms
                .leave(connection_id, &Room::user(displaced.user_id.clone()));
        }
        self.rooms.join(connection_id, Room::user(user_id.clone()));
        self.presence.on_bind(&user_id, &binding, connection_id);

        self.hub.send_to(
            connection_id,
            ServerEvent::Joined(Joined {
                user_id: user_id.clone(),
                connection_id: connection_id.clone(),
            }),
        );
        if self.config.send_online_users_on_join {
            self.hub.send_to(
                connection_id,
                ServerEvent::OnlineUsers(OnlineUsers {
                    conversation_id: None,
                    user_ids: self.presence.online_users(),
                }),
            );
        }

        info!(connection = %connection_id, user = %user_id, "User joined");
        Ok(())
    }

    fn send_message(&self, connection_id: &ConnectionId, sender_id: UserId, payload: SendMessage) {
        let message = compose(payload, sender_id);
        let room = Room::conversation(message.conversation_id.clone());
        let recipient = message
            .recipient_id
            .as_ref()
            .filter(|recipient| **recipient != message.sender_id)
            .map(|recipient| Room::user(recipient.clone()));

        let ack = ServerEvent::MessageSent(MessageSent {
            message_id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            timestamp: message.timestamp,
        });

        let delivered = match (self.config.recipient_policy, recipient) {
            (RecipientPolicy::Deduplicated, Some(recipient)) => {
                let mut targets = HashSet::new();
                self.rooms.for_each_member(&room, |member| {
                    targets.insert(member.clone());
                });
                self.rooms.for_each_member(&recipient, |member| {
                    targets.insert(member.clone());
                });
                targets.remove(connection_id);
                self.hub
                    .send_to_all(&targets, ServerEvent::NewMessage(message.clone()))
            }
            (RecipientPolicy::Additional, Some(recipient)) => {
                let delivered = self.hub.send_to_room(
                    &room,
                    ServerEvent::NewMessage(message.clone()),
                    Some(connection_id),
                );
                delivered
                    + self.hub.send_to_room(
                        &recipient,
                        ServerEvent::MessageNotification(message.clone()),
                        Some(connection_id),
                    )
            }
            (_, None) => self.hub.send_to_room(
                &room,
                ServerEvent::NewMessage(message.clone()),
                Some(connection_id),
            ),
        };

        debug!(
            connection = %connection_id,
            conversation = %message.conversation_id,
            message = %message.id,
            recipients = delivered,
            "Message relayed"
        );

        self.hub.send_to(connection_id, ack);
    }

    /// Disconnect a connection, unwinding all of its state.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::UnknownConnection`] if the connection is not
    /// registered.
    pub fn disconnect(&self, connection_id: &ConnectionId, reason: &str) -> Result<(), RouterError> {
        if !self.registry.contains(connection_id) {
            return Err(RouterError::UnknownConnection(connection_id.clone()));
        }

        // Dropping the sender lets the writer drain and finish
        drop(self.hub.detach(connection_id));

        let left = self.rooms.leave_all(connection_id);
        let unbinding = self.registry.deregister(connection_id)?;
        if let Some(unbinding) = &unbinding {
            self.presence.on_unbind(unbinding, Some(connection_id));
        }

        info!(
            connection = %connection_id,
            user = unbinding.as_ref().map(|u| u.user_id.as_str()).unwrap_or("-"),
            rooms = left.len(),
            reason = %reason,
            "Connection closed"
        );
        Ok(())
    }

    /// Distinct users with a connection in a conversation room, sorted.
    #[must_use]
    pub fn online_users_in(&self, conversation_id: &str) -> Vec<UserId> {
        let mut users = BTreeSet::new();
        for member in self.rooms.members_of(&Room::conversation(conversation_id)) {
            if let Ok(Some(user_id)) = self.registry.user_of(&member) {
                users.insert(user_id);
            }
        }
        users.into_iter().collect()
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            registry: self.registry.stats(),
            rooms: self.rooms.stats(),
            typing: self.typing.pending_count(),
            outbound_dropped: self.hub.dropped_count(),
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The room manager.
    #[must_use]
    pub fn rooms(&self) -> &Rooms {
        &self.rooms
    }

    /// The delivery hub.
    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// The presence tracker.
    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// The typing debouncer.
    #[must_use]
    pub fn typing(&self) -> &TypingDebouncer {
        &self.typing
    }

    /// The router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    pub registry: RegistryStats,
    pub rooms: RoomStats,
    /// Pending typing auto-clears.
    pub typing: usize,
    /// Events dropped on full outbound queues.
    pub outbound_dropped: u64,
}
