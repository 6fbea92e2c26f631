//! Presence and messaging router.
//!
//! The router authenticates connections, keeps the session registry current
//! and fans events out to the right connections. Persistence and identity are
//! delegated to injected collaborators.

use crate::conversation::{Conversation, ConversationError};
use crate::directory::{ContactDirectory, MembershipError, MembershipResolver, SingleRecipient};
use crate::identity::{AuthError, IdentityVerifier};
use crate::message::{Message, MessageId, NewMessage, PayloadError};
use crate::registry::{
    event_queue, EventReceiver, FanOut, RegistryError, RegistryStats, SessionRegistry, Unbound,
};
use crate::session::{ConnectionId, Session, UserId};
use crate::store::{HistoryQuery, MessageStore, StoreError};
use chrono::{DateTime, Utc};
use parley_protocol::{
    ConversationSummary, ConversationType, ErrorKind, PresenceStatus, SendMessage, ServerEvent,
    Typing,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Router errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouterError {
    /// The connection has no bound user.
    #[error("User not authenticated")]
    Unauthenticated,

    /// Handshake credential rejected.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Invalid conversation: {0}")]
    InvalidConversation(#[from] ConversationError),

    #[error("Invalid message: {0}")]
    InvalidPayload(#[from] PayloadError),

    /// The store rejected a new message. Nothing was delivered.
    #[error("Failed to send message: {0}")]
    Persistence(StoreError),

    /// The store failed during a read receipt.
    #[error("Failed to mark message as read: {0}")]
    ReadFailed(StoreError),

    /// The store failed during a history query.
    #[error("Failed to load messages: {0}")]
    Store(StoreError),

    #[error("Failed to resolve conversation members: {0}")]
    Membership(#[from] MembershipError),

    /// The caller is not a participant of the conversation.
    #[error("Not a participant of this conversation")]
    Forbidden,

    #[error("Session error: {0}")]
    Registry(#[from] RegistryError),
}

impl RouterError {
    /// Stable kind reported to clients.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::Unauthenticated | RouterError::Auth(_) => ErrorKind::Unauthenticated,
            RouterError::InvalidConversation(_) => ErrorKind::InvalidConversation,
            RouterError::InvalidPayload(_) => ErrorKind::InvalidPayload,
            RouterError::Persistence(_) => ErrorKind::PersistenceFailed,
            RouterError::ReadFailed(_) | RouterError::Store(_) => ErrorKind::StoreFailed,
            RouterError::Membership(_) => ErrorKind::MembershipFailed,
            RouterError::Forbidden => ErrorKind::Forbidden,
            RouterError::Registry(_) => ErrorKind::Internal,
        }
    }

    /// `error` event for the originating connection.
    ///
    /// Store failures are reported without backend details.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        let message = match self {
            RouterError::Persistence(_) => "Failed to send message".to_string(),
            RouterError::ReadFailed(_) => "Failed to mark message as read".to_string(),
            RouterError::Store(_) => "Failed to load messages".to_string(),
            other => other.to_string(),
        };
        ServerEvent::error(self.kind(), message)
    }
}

/// Audience of presence and read-receipt events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastScope {
    /// Every connected session.
    #[default]
    Global,
    /// Presence: the user's contacts. Read receipts: conversation participants.
    Scoped,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Audience of `user:online` / `user:offline`.
    pub presence_scope: BroadcastScope,
    /// Audience of `message:read`.
    pub read_receipt_scope: BroadcastScope,
    /// Upper bound on identity verification during a handshake.
    pub verify_timeout: Duration,
    /// Outbound queue capacity per connection.
    pub connection_queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            presence_scope: BroadcastScope::Global,
            read_receipt_scope: BroadcastScope::Global,
            verify_timeout: Duration::from_secs(10),
            connection_queue_capacity: 256,
        }
    }
}

/// Result of a read receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The read flag was set.
    Updated {
        message_id: MessageId,
        conversation_id: String,
        read_at: DateTime<Utc>,
    },
    /// No readable message matched: unknown id, or the reader sent it.
    NotApplicable {
        message_id: MessageId,
        read_at: DateTime<Utc>,
    },
}

impl ReadOutcome {
    #[must_use]
    pub fn message_id(&self) -> &MessageId {
        match self {
            ReadOutcome::Updated { message_id, .. } | ReadOutcome::NotApplicable { message_id, .. } => {
                message_id
            }
        }
    }

    #[must_use]
    pub fn read_at(&self) -> DateTime<Utc> {
        match self {
            ReadOutcome::Updated { read_at, .. } | ReadOutcome::NotApplicable { read_at, .. } => {
                *read_at
            }
        }
    }

    #[must_use]
    pub fn is_updated(&self) -> bool {
        matches!(self, ReadOutcome::Updated { .. })
    }
}

/// Presence of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub connections: usize,
}

/// The presence and messaging router.
pub struct ChatRouter {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn MessageStore>,
    verifier: Arc<dyn IdentityVerifier>,
    membership: Arc<dyn MembershipResolver>,
    contacts: Option<Arc<dyn ContactDirectory>>,
    config: RouterConfig,
}

impl ChatRouter {
    /// Create a router with a fresh registry and default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            store,
            verifier,
            membership: Arc::new(SingleRecipient),
            contacts: None,
            config: RouterConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: RouterConfig) -> Self {
        info!("Router config: {:?}", config);
        self.config = config;
        self
    }

    /// Resolve group conversations through `membership`.
    #[must_use]
    pub fn with_membership(mut self, membership: Arc<dyn MembershipResolver>) -> Self {
        self.membership = membership;
        self
    }

    /// Audience source for scoped presence.
    #[must_use]
    pub fn with_contacts(mut self, contacts: Arc<dyn ContactDirectory>) -> Self {
        self.contacts = Some(contacts);
        self
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Authenticate a new connection and bind it to its user.
    ///
    /// Returns the session and the receiving end of the connection's
    /// outbound queue. On success every session in the presence audience,
    /// including this one, receives `user:online`. On failure nothing is
    /// emitted.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Auth`] if the token is missing, invalid or
    /// verification times out.
    pub async fn connect(
        &self,
        connection_id: ConnectionId,
        token: Option<&str>,
    ) -> Result<(Session, EventReceiver), RouterError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let identity = tokio::time::timeout(self.config.verify_timeout, self.verifier.verify(token))
            .await
            .map_err(|_| AuthError::Timeout)??;

        if let Err(e) = self.store.save_profile(identity.profile()).await {
            warn!(user = %identity.user_id, error = %e, "Failed to save sender profile");
        }

        let (sender, receiver) = event_queue(self.config.connection_queue_capacity);
        let session = self.registry.bind(connection_id, identity.user_id, sender)?;

        info!(
            connection = %session.connection_id,
            user = %session.user_id,
            "User connected"
        );

        let audience = self.presence_audience(&session.user_id).await;
        let event = Arc::new(ServerEvent::online(session.user_id.clone(), session.joined_at));
        self.announce(audience.as_deref(), &event);

        Ok((session, receiver))
    }

    /// Drop a connection's binding.
    ///
    /// `user:offline` is announced only when the user's last connection goes
    /// and no new connection of theirs was bound in the meantime.
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> Option<Unbound> {
        let unbound = self.registry.unbind(connection_id)?;
        let user_id = &unbound.session.user_id;

        if unbound.last_connection {
            let audience = self.presence_audience(user_id).await;
            if self.registry.is_online(user_id) {
                debug!(
                    connection = %connection_id,
                    user = %user_id,
                    "User reconnected, offline skipped"
                );
            } else {
                info!(connection = %connection_id, user = %user_id, "User disconnected");
                let event = Arc::new(ServerEvent::offline(user_id.clone(), Utc::now()));
                self.announce(audience.as_deref(), &event);
            }
        } else {
            debug!(
                connection = %connection_id,
                user = %user_id,
                remaining = self.registry.connection_count(user_id),
                "Device disconnected"
            );
        }

        Some(unbound)
    }

    /// Persist a message and deliver it to every participant's sessions.
    ///
    /// Delivery only happens after the store accepted the message. The
    /// originating connection additionally gets `message:sent`.
    ///
    /// # Errors
    ///
    /// Fails if the connection is unbound, the conversation or body is
    /// invalid, group members cannot be resolved, or the store fails.
    pub async fn send_message(
        &self,
        origin: &ConnectionId,
        request: SendMessage,
    ) -> Result<Message, RouterError> {
        let sender_id = self
            .registry
            .user_of(origin)
            .ok_or(RouterError::Unauthenticated)?;

        let conversation = Conversation::parse(&request.conversation_id)?;
        let new = NewMessage::from_request(sender_id, conversation.id(), request);
        new.body.validate()?;

        let participants = self.participants(&conversation).await?;

        let message = self.store.create_message(new).await.map_err(|e| {
            warn!(connection = %origin, error = %e, "Message persistence failed");
            RouterError::Persistence(e)
        })?;

        let event = Arc::new(ServerEvent::MessageReceive(message.to_wire()));
        let fan_out = self
            .registry
            .send_to_users(participants.iter().map(String::as_str), &event);

        let ack = Arc::new(ServerEvent::sent(message.id.to_string(), message.created_at));
        self.registry.send_to_connection(origin, &ack);

        debug!(
            message = %message.id,
            conversation = %message.conversation_id,
            delivered = fan_out.delivered,
            dropped = fan_out.dropped,
            "Message routed"
        );

        Ok(message)
    }

    /// Mark a message read on behalf of the connection's user.
    ///
    /// A message the user sent, or an unknown id, yields
    /// [`ReadOutcome::NotApplicable`] rather than an error. With a global
    /// receipt scope the receipt is broadcast either way.
    ///
    /// # Errors
    ///
    /// Fails if the connection is unbound or the store fails.
    pub async fn mark_read(
        &self,
        origin: &ConnectionId,
        message_id: &MessageId,
    ) -> Result<ReadOutcome, RouterError> {
        let reader_id = self
            .registry
            .user_of(origin)
            .ok_or(RouterError::Unauthenticated)?;

        let found = self
            .store
            .find_readable_message(message_id, &reader_id)
            .await
            .map_err(RouterError::ReadFailed)?;

        let read_at = Utc::now();
        let outcome = match found {
            Some(message) => {
                self.store
                    .mark_message_read(message_id)
                    .await
                    .map_err(RouterError::ReadFailed)?;
                ReadOutcome::Updated {
                    message_id: message_id.clone(),
                    conversation_id: message.conversation_id,
                    read_at,
                }
            }
            None => {
                debug!(message = %message_id, reader = %reader_id, "No readable message matched");
                ReadOutcome::NotApplicable {
                    message_id: message_id.clone(),
                    read_at,
                }
            }
        };

        let receipt = Arc::new(ServerEvent::read(message_id.to_string(), reader_id, read_at));
        match (self.config.read_receipt_scope, &outcome) {
            (BroadcastScope::Global, _) => {
                self.registry.broadcast(&receipt);
            }
            (BroadcastScope::Scoped, ReadOutcome::Updated { conversation_id, .. }) => {
                match self.audience_of(conversation_id).await {
                    Ok(participants) => {
                        self.registry
                            .send_to_users(participants.iter().map(String::as_str), &receipt);
                    }
                    Err(e) => {
                        warn!(message = %message_id, error = %e, "Receipt audience unavailable")
                    }
                }
            }
            (BroadcastScope::Scoped, ReadOutcome::NotApplicable { .. }) => {}
        }

        Ok(outcome)
    }

    /// Tell the other participants that the user started typing.
    ///
    /// Unbound connections and malformed conversation ids are ignored.
    pub async fn typing_start(&self, origin: &ConnectionId, conversation_id: &str) -> FanOut {
        self.typing(origin, conversation_id, true).await
    }

    /// Tell the other participants that the user stopped typing.
    pub async fn typing_stop(&self, origin: &ConnectionId, conversation_id: &str) -> FanOut {
        self.typing(origin, conversation_id, false).await
    }

    async fn typing(&self, origin: &ConnectionId, conversation_id: &str, active: bool) -> FanOut {
        let Some(user_id) = self.registry.user_of(origin) else {
            trace!(connection = %origin, "Typing from unbound connection ignored");
            return FanOut::default();
        };

        let conversation = match Conversation::parse(conversation_id) {
            Ok(conversation) => conversation,
            Err(e) => {
                debug!(connection = %origin, error = %e, "Typing for invalid conversation ignored");
                return FanOut::default();
            }
        };

        let participants = match self.participants(&conversation).await {
            Ok(participants) => participants,
            Err(e) => {
                debug!(connection = %origin, error = %e, "Typing audience unavailable");
                return FanOut::default();
            }
        };

        let payload = Typing {
            conversation_id: conversation.id(),
            user_id: user_id.clone(),
        };
        let event = Arc::new(if active {
            ServerEvent::TypingStart(payload)
        } else {
            ServerEvent::TypingStop(payload)
        });

        self.registry.send_to_users(
            participants
                .iter()
                .map(String::as_str)
                .filter(|p| *p != user_id),
            &event,
        )
    }

    /// Conversation history for a user.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Forbidden`] if the user is not part of a direct
    /// conversation, or a store error.
    pub async fn history(
        &self,
        user_id: &str,
        conversation_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<Message>, RouterError> {
        let conversation = Conversation::parse(conversation_id)?;
        if conversation.is_direct() && conversation.counterpart(user_id).is_none() {
            return Err(RouterError::Forbidden);
        }

        self.store
            .list_messages(&conversation.id(), query)
            .await
            .map_err(RouterError::Store)
    }

    /// Conversations of a user, most recently active first.
    ///
    /// # Errors
    ///
    /// Returns a store error if the listing fails.
    pub async fn conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, RouterError> {
        let threads = self
            .store
            .list_conversations(user_id)
            .await
            .map_err(RouterError::Store)?;

        Ok(threads
            .into_iter()
            .map(|thread| {
                let (conversation_type, participants) =
                    match Conversation::parse(&thread.conversation_id) {
                        Ok(conversation) if conversation.is_direct() => (
                            ConversationType::Private,
                            conversation
                                .counterpart(user_id)
                                .map(str::to_string)
                                .into_iter()
                                .collect(),
                        ),
                        _ => (ConversationType::Group, Vec::new()),
                    };

                ConversationSummary {
                    conversation_id: thread.conversation_id,
                    conversation_type,
                    participants,
                    last_message: thread.last_message.to_wire(),
                    unread_count: thread.unread_count,
                }
            })
            .collect())
    }

    /// Current presence of a user.
    #[must_use]
    pub fn presence(&self, user_id: &str) -> PresenceSnapshot {
        let connections = self.registry.connection_count(user_id);
        PresenceSnapshot {
            user_id: user_id.to_string(),
            status: if connections > 0 {
                PresenceStatus::Online
            } else {
                PresenceStatus::Offline
            },
            connections,
        }
    }

    async fn participants(
        &self,
        conversation: &Conversation,
    ) -> Result<Vec<UserId>, MembershipError> {
        match conversation {
            Conversation::Direct { first, second } => Ok(vec![first.clone(), second.clone()]),
            Conversation::Group { group_id } => self.membership.members(group_id).await,
        }
    }

    async fn audience_of(&self, conversation_id: &str) -> Result<Vec<UserId>, RouterError> {
        let conversation = Conversation::parse(conversation_id)?;
        Ok(self.participants(&conversation).await?)
    }

    /// Users who see presence changes of `user_id`; `None` means everyone.
    async fn presence_audience(&self, user_id: &str) -> Option<Vec<UserId>> {
        match self.config.presence_scope {
            BroadcastScope::Global => None,
            BroadcastScope::Scoped => {
                let mut audience = vec![user_id.to_string()];
                if let Some(directory) = &self.contacts {
                    match directory.contacts(user_id).await {
                        Ok(contacts) => audience.extend(contacts),
                        Err(e) => warn!(user = %user_id, error = %e, "Contact lookup failed"),
                    }
                }
                Some(audience)
            }
        }
    }

    fn announce(&self, audience: Option<&[UserId]>, event: &Arc<ServerEvent>) -> FanOut {
        match audience {
            None => self.registry.broadcast(event),
            Some(users) => self
                .registry
                .send_to_users(users.iter().map(String::as_str), event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::identity::tests::{token_for, SECRET};
    use crate::identity::{Identity, JwtVerifier};
    use crate::store::{ConversationThread, InMemoryMessageStore};
    use async_trait::async_trait;
    use parley_protocol::MessageKind;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::OnceLock;

    struct Client {
        id: ConnectionId,
        rx: EventReceiver,
    }

    impl Client {
        fn drain(&mut self) -> Vec<Arc<ServerEvent>> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }

        fn drain_names(&mut self) -> Vec<&'static str> {
            self.drain().iter().map(|e| e.event_name()).collect()
        }
    }

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn create_message(&self, _: NewMessage) -> Result<Message, StoreError> {
            Err(StoreError::Unavailable("database down".into()))
        }

        async fn find_readable_message(
            &self,
            _: &MessageId,
            _: &str,
        ) -> Result<Option<Message>, StoreError> {
            Err(StoreError::Unavailable("database down".into()))
        }

        async fn mark_message_read(&self, _: &MessageId) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("database down".into()))
        }

        async fn list_messages(
            &self,
            _: &str,
            _: HistoryQuery,
        ) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Unavailable("database down".into()))
        }

        async fn list_conversations(
            &self,
            _: &str,
        ) -> Result<Vec<ConversationThread>, StoreError> {
            Err(StoreError::Unavailable("database down".into()))
        }
    }

    /// Contact lookup that binds a new connection for the user while it runs,
    /// like a tab reopening in the middle of a disconnect.
    #[derive(Default)]
    struct ReopeningContacts {
        registry: OnceLock<Arc<SessionRegistry>>,
        armed: AtomicBool,
        inner: StaticDirectory,
    }

    #[async_trait]
    impl ContactDirectory for ReopeningContacts {
        async fn contacts(&self, user_id: &str) -> Result<Vec<UserId>, MembershipError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                if let Some(registry) = self.registry.get() {
                    let (tx, _rx) = event_queue(8);
                    registry.bind("reopened".into(), user_id, tx).unwrap();
                }
            }
            self.inner.contacts(user_id).await
        }
    }

    struct StalledVerifier;

    #[async_trait]
    impl IdentityVerifier for StalledVerifier {
        async fn verify(&self, _: &str) -> Result<Identity, AuthError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Identity::new("late"))
        }
    }

    fn router_with(store: Arc<dyn MessageStore>) -> ChatRouter {
        ChatRouter::new(store, Arc::new(JwtVerifier::new(SECRET)))
    }

    fn router() -> (ChatRouter, Arc<InMemoryMessageStore>) {
        let store = Arc::new(InMemoryMessageStore::new());
        (router_with(store.clone()), store)
    }

    async fn join(router: &ChatRouter, connection: &str, user: &str) -> Client {
        let (_, rx) = router
            .connect(connection.into(), Some(&token_for(user)))
            .await
            .unwrap();
        Client {
            id: connection.into(),
            rx,
        }
    }

    #[tokio::test]
    async fn test_connect_binds_and_announces() {
        let (router, _) = router();
        let mut u1 = join(&router, "c1", "u1").await;
        assert_eq!(router.registry().user_of(&u1.id).as_deref(), Some("u1"));
        assert_eq!(u1.drain_names(), ["user:online"]);

        let mut u2 = join(&router, "c2", "u2").await;
        let seen = u1.drain();
        assert_eq!(seen.len(), 1);
        match seen[0].as_ref() {
            ServerEvent::UserOnline(online) => {
                assert_eq!(online.user_id, "u2");
                assert_eq!(online.status, PresenceStatus::Online);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(u2.drain_names(), ["user:online"]);
    }

    #[tokio::test]
    async fn test_rejected_connections_emit_nothing() {
        let (router, _) = router();
        let mut watcher = join(&router, "c1", "u1").await;
        watcher.drain();

        assert!(matches!(
            router.connect("c2".into(), None).await,
            Err(RouterError::Auth(AuthError::MissingToken))
        ));
        assert!(matches!(
            router.connect("c3".into(), Some("garbage")).await,
            Err(RouterError::Auth(AuthError::InvalidToken(_)))
        ));

        assert!(watcher.drain().is_empty());
        assert_eq!(router.stats().connections, 1);
        assert!(router.registry().user_of(&"c2".into()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_timeout() {
        let router = ChatRouter::new(
            Arc::new(InMemoryMessageStore::new()),
            Arc::new(StalledVerifier),
        )
        .with_config(RouterConfig {
            verify_timeout: Duration::from_millis(500),
            ..RouterConfig::default()
        });

        assert!(matches!(
            router.connect("c1".into(), Some("token")).await,
            Err(RouterError::Auth(AuthError::Timeout))
        ));
        assert_eq!(router.stats().connections, 0);
    }

    #[tokio::test]
    async fn test_queue_capacity_from_config() {
        let store = Arc::new(InMemoryMessageStore::new());
        let router = router_with(store).with_config(RouterConfig {
            connection_queue_capacity: 1,
            ..RouterConfig::default()
        });

        // The own user:online fills the queue
        let mut a = join(&router, "a", "A").await;
        join(&router, "b", "B").await;

        assert_eq!(a.drain_names(), ["user:online"]);
        assert_eq!(router.stats().dropped_events, 1);
    }

    #[tokio::test]
    async fn test_offline_only_after_last_connection() {
        let (router, _) = router();
        let t1 = join(&router, "t1", "u1").await;
        let t2 = join(&router, "t2", "u1").await;
        let mut watcher = join(&router, "w", "u2").await;
        watcher.drain();

        let unbound = router.disconnect(&t1.id).await.unwrap();
        assert!(!unbound.last_connection);
        assert!(watcher.drain().is_empty());
        assert_eq!(router.presence("u1").status, PresenceStatus::Online);

        let unbound = router.disconnect(&t2.id).await.unwrap();
        assert!(unbound.last_connection);
        let events = watcher.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref(),
            ServerEvent::UserOffline(offline) if offline.user_id == "u1"
        ));
        assert_eq!(router.presence("u1").connections, 0);

        // Already gone
        assert!(router.disconnect(&t2.id).await.is_none());
    }

    #[tokio::test]
    async fn test_offline_skipped_when_user_reconnects() {
        let directory = Arc::new(ReopeningContacts::default());
        directory.inner.connect("A", "B");

        let (router, _) = router();
        let router = router.with_contacts(directory.clone()).with_config(RouterConfig {
            presence_scope: BroadcastScope::Scoped,
            ..RouterConfig::default()
        });
        assert!(directory.registry.set(router.registry().clone()).is_ok());

        let mut b = join(&router, "b", "B").await;
        let a = join(&router, "a", "A").await;
        b.drain();

        directory.armed.store(true, Ordering::SeqCst);
        let unbound = router.disconnect(&a.id).await.unwrap();

        assert!(unbound.last_connection);
        assert!(router.registry().is_online("A"));
        assert!(b.drain().is_empty());
    }

    #[tokio::test]
    async fn test_two_tabs_and_a_friend() {
        let (router, store) = router();
        let mut t1 = join(&router, "t1", "U1").await;
        let mut t2 = join(&router, "t2", "U1").await;
        let mut u2 = join(&router, "c", "U2").await;
        t1.drain();
        t2.drain();
        u2.drain();

        let message = router
            .send_message(&t1.id, SendMessage::text("U1#U2", "hi"))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        for client in [&mut t2, &mut u2] {
            let events = client.drain();
            assert_eq!(events.len(), 1);
            match events[0].as_ref() {
                ServerEvent::MessageReceive(received) => {
                    assert_eq!(received.content.as_deref(), Some("hi"));
                    assert_eq!(received.sender_id, "U1");
                    assert_eq!(received.conversation_id, "U1#U2");
                    assert_eq!(received.message_type, MessageKind::Text);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        let events = t1.drain();
        assert_eq!(
            events.iter().map(|e| e.event_name()).collect::<Vec<_>>(),
            ["message:receive", "message:sent"]
        );
        match events[1].as_ref() {
            ServerEvent::MessageSent(sent) => {
                assert_eq!(sent.message_id, message.id.to_string());
                assert_eq!(sent.timestamp, message.created_at);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sender_summary_comes_from_token_claims() {
        let (router, _) = router();
        let a = join(&router, "a", "A").await;
        let mut b = join(&router, "b", "B").await;
        b.drain();

        router
            .send_message(&a.id, SendMessage::text("A#B", "hi"))
            .await
            .unwrap();

        let events = b.drain();
        assert_eq!(events.len(), 1);
        let value = serde_json::to_value(events[0].as_ref()).unwrap();
        assert_eq!(value["data"]["sender"]["id"], "A");
        assert_eq!(value["data"]["sender"]["username"], "someone");
        assert_eq!(value["data"]["sender"]["nickname"], "someone");
    }

    #[tokio::test]
    async fn test_any_kind_accepts_content_or_media() {
        let (router, store) = router();
        let a = join(&router, "a", "A").await;
        let mut b = join(&router, "b", "B").await;
        b.drain();

        let mut captioned = SendMessage::text("A#B", "caption");
        captioned.message_type = MessageKind::Image;
        router.send_message(&a.id, captioned).await.unwrap();

        let mut link_only = SendMessage::text("A#B", "");
        link_only.content = None;
        link_only.media_url = Some("https://cdn/x.png".into());
        router.send_message(&a.id, link_only).await.unwrap();

        assert_eq!(store.len(), 2);
        let events = b.drain();
        assert_eq!(events.len(), 2);
        match events[0].as_ref() {
            ServerEvent::MessageReceive(received) => {
                assert_eq!(received.message_type, MessageKind::Image);
                assert_eq!(received.content.as_deref(), Some("caption"));
                assert!(received.media_url.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
        match events[1].as_ref() {
            ServerEvent::MessageReceive(received) => {
                assert_eq!(received.message_type, MessageKind::Text);
                assert_eq!(received.media_url.as_deref(), Some("https://cdn/x.png"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_persistence_delivers_nothing() {
        let router = router_with(Arc::new(FailingStore));
        let mut a = join(&router, "a", "A").await;
        let mut b = join(&router, "b", "B").await;
        a.drain();
        b.drain();

        let err = router
            .send_message(&a.id, SendMessage::text("A#B", "lost"))
            .await
            .unwrap_err();

        assert!(matches!(err, RouterError::Persistence(_)));
        assert_eq!(err.kind(), ErrorKind::PersistenceFailed);
        match err.to_event() {
            ServerEvent::Error(e) => assert_eq!(e.message, "Failed to send message"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
    }

    #[tokio::test]
    async fn test_unauthenticated_actions() {
        let (router, store) = router();
        let ghost = ConnectionId::from("ghost");

        let err = router
            .send_message(&ghost, SendMessage::text("a#b", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::Unauthenticated);
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
        assert!(store.is_empty());

        assert_eq!(
            router.mark_read(&ghost, &MessageId::from("m")).await,
            Err(RouterError::Unauthenticated)
        );

        assert_eq!(router.typing_start(&ghost, "a#b").await, FanOut::default());
    }

    #[tokio::test]
    async fn test_invalid_requests_are_not_persisted() {
        let (router, store) = router();
        let a = join(&router, "a", "A").await;

        let err = router
            .send_message(&a.id, SendMessage::text("A#B#C", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConversation);

        let err = router
            .send_message(&a.id, SendMessage::text("A#B", "  "))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPayload);

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_typing_skips_sender() {
        let (router, _) = router();
        let mut a1 = join(&router, "a1", "A").await;
        let mut a2 = join(&router, "a2", "A").await;
        let mut b = join(&router, "b", "B").await;
        a1.drain();
        a2.drain();
        b.drain();

        let fan_out = router.typing_start(&a1.id, "A#B").await;
        assert_eq!(fan_out.delivered, 1);

        let events = b.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref(),
            ServerEvent::TypingStart(t) if t.user_id == "A" && t.conversation_id == "A#B"
        ));
        assert!(a1.drain().is_empty());
        assert!(a2.drain().is_empty());

        router.typing_stop(&a1.id, "B#A").await;
        assert_eq!(b.drain_names(), ["typing:stop"]);

        // Malformed ids are ignored
        assert_eq!(router.typing_start(&a1.id, "").await, FanOut::default());
    }

    #[tokio::test]
    async fn test_mark_read_global_receipt() {
        let (router, store) = router();
        let mut a = join(&router, "a", "A").await;
        let mut b = join(&router, "b", "B").await;
        let mut c = join(&router, "c", "C").await;

        let message = router
            .send_message(&a.id, SendMessage::text("A#B", "hi"))
            .await
            .unwrap();
        a.drain();
        b.drain();
        c.drain();

        let outcome = router.mark_read(&b.id, &message.id).await.unwrap();
        assert!(outcome.is_updated());
        assert!(store.get(&message.id).unwrap().is_read);

        // Global scope reaches uninvolved sessions too
        for client in [&mut a, &mut b, &mut c] {
            assert_eq!(client.drain_names(), ["message:read"]);
        }

        let again = router.mark_read(&b.id, &message.id).await.unwrap();
        assert!(again.is_updated());
        assert!(store.get(&message.id).unwrap().is_read);
    }

    #[tokio::test]
    async fn test_mark_read_by_sender_is_not_applicable() {
        let (router, store) = router();
        let mut a = join(&router, "a", "A").await;
        let b = join(&router, "b", "B").await;

        let message = router
            .send_message(&a.id, SendMessage::text("A#B", "hi"))
            .await
            .unwrap();
        a.drain();

        let outcome = router.mark_read(&a.id, &message.id).await.unwrap();
        assert!(matches!(outcome, ReadOutcome::NotApplicable { .. }));
        assert_eq!(outcome.message_id(), &message.id);
        assert!(!store.get(&message.id).unwrap().is_read);

        // The receipt still goes out under the global scope
        assert_eq!(a.drain_names(), ["message:read"]);

        let unknown = router
            .mark_read(&b.id, &MessageId::from("missing"))
            .await
            .unwrap();
        assert!(!unknown.is_updated());
    }

    #[tokio::test]
    async fn test_mark_read_scoped_receipt() {
        let store = Arc::new(InMemoryMessageStore::new());
        let router = router_with(store.clone()).with_config(RouterConfig {
            read_receipt_scope: BroadcastScope::Scoped,
            ..RouterConfig::default()
        });
        let mut a = join(&router, "a", "A").await;
        let mut b = join(&router, "b", "B").await;
        let mut c = join(&router, "c", "C").await;

        let message = router
            .send_message(&a.id, SendMessage::text("A#B", "hi"))
            .await
            .unwrap();
        a.drain();
        b.drain();
        c.drain();

        router.mark_read(&b.id, &message.id).await.unwrap();
        assert_eq!(a.drain_names(), ["message:read"]);
        assert_eq!(b.drain_names(), ["message:read"]);
        assert!(c.drain().is_empty());

        // No-op receipts are not announced under the scoped policy
        router.mark_read(&a.id, &message.id).await.unwrap();
        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_store_failure() {
        let router = router_with(Arc::new(FailingStore));
        let b = join(&router, "b", "B").await;

        let err = router
            .mark_read(&b.id, &MessageId::from("m"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreFailed);

        let err = router.conversations("B").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreFailed);
    }

    #[tokio::test]
    async fn test_group_delivery_through_membership() {
        let directory = Arc::new(StaticDirectory::new());
        directory.set_group("team", ["A", "B", "C"]);

        let (router, _) = router();
        let router = router.with_membership(directory);
        let mut a = join(&router, "a", "A").await;
        let mut b = join(&router, "b", "B").await;
        let mut c = join(&router, "c", "C").await;
        let mut d = join(&router, "d", "D").await;
        for client in [&mut a, &mut b, &mut c, &mut d] {
            client.drain();
        }

        router
            .send_message(&a.id, SendMessage::text("team", "standup?"))
            .await
            .unwrap();

        assert_eq!(a.drain_names(), ["message:receive", "message:sent"]);
        assert_eq!(b.drain_names(), ["message:receive"]);
        assert_eq!(c.drain_names(), ["message:receive"]);
        assert!(d.drain().is_empty());

        let err = router
            .send_message(&a.id, SendMessage::text("unknown-room", "hello?"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MembershipFailed);
    }

    #[tokio::test]
    async fn test_group_without_resolver_targets_group_id() {
        let (router, _) = router();
        let mut a = join(&router, "a", "A").await;
        let mut room = join(&router, "r", "room").await;
        a.drain();
        room.drain();

        router
            .send_message(&a.id, SendMessage::text("room", "hi"))
            .await
            .unwrap();

        assert_eq!(room.drain_names(), ["message:receive"]);
        assert_eq!(a.drain_names(), ["message:sent"]);
    }

    #[tokio::test]
    async fn test_scoped_presence_uses_contacts() {
        let directory = Arc::new(StaticDirectory::new());
        directory.connect("A", "B");

        let (router, _) = router();
        let router = router.with_contacts(directory).with_config(RouterConfig {
            presence_scope: BroadcastScope::Scoped,
            ..RouterConfig::default()
        });

        let mut b = join(&router, "b", "B").await;
        let mut c = join(&router, "c", "C").await;
        b.drain();
        c.drain();

        let a = join(&router, "a", "A").await;
        assert_eq!(b.drain_names(), ["user:online"]);
        assert!(c.drain().is_empty());

        router.disconnect(&a.id).await;
        assert_eq!(b.drain_names(), ["user:offline"]);
        assert!(c.drain().is_empty());
    }

    #[tokio::test]
    async fn test_history_requires_participation() {
        let (router, _) = router();
        let a = join(&router, "a", "A").await;
        for text in ["one", "two"] {
            router
                .send_message(&a.id, SendMessage::text("A#B", text))
                .await
                .unwrap();
        }

        let history = router
            .history("B", "B#A", HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].body.content.as_deref(), Some("one"));

        assert_eq!(
            router.history("C", "A#B", HistoryQuery::default()).await,
            Err(RouterError::Forbidden)
        );
    }

    #[tokio::test]
    async fn test_conversation_list() {
        let (router, _) = router();
        let a = join(&router, "a", "A").await;
        let b = join(&router, "b", "B").await;

        router
            .send_message(&a.id, SendMessage::text("A#B", "first"))
            .await
            .unwrap();
        router
            .send_message(&b.id, SendMessage::text("B#A", "reply"))
            .await
            .unwrap();
        router
            .send_message(&a.id, SendMessage::text("C#A", "hello c"))
            .await
            .unwrap();

        let list = router.conversations("A").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].conversation_id, "A#C");
        assert_eq!(list[0].conversation_type, ConversationType::Private);
        assert_eq!(list[0].participants, ["C"]);
        assert_eq!(list[1].conversation_id, "A#B");
        assert_eq!(list[1].participants, ["B"]);
        assert_eq!(list[1].last_message.content.as_deref(), Some("reply"));
        assert_eq!(list[1].last_message.sender_id, "B");
        assert_eq!(list[1].unread_count, 1);

        assert_eq!(router.conversations("C").await.unwrap().len(), 1);
        assert!(router.conversations("D").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reply_to_missing_message_is_a_persistence_error() {
        let (router, _) = router();
        let mut a = join(&router, "a", "A").await;
        a.drain();

        let err = router
            .send_message(
                &a.id,
                SendMessage::text("A#B", "re").replying_to("does-not-exist"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceFailed);
        assert!(a.drain().is_empty());
    }
}
