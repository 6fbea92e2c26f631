//! Message persistence.
//!
//! The router only depends on the [`MessageStore`] trait. The
//! [`InMemoryMessageStore`] backs the standalone server and the tests.

use crate::conversation::Conversation;
use crate::message::{Message, MessageId, NewMessage};
use crate::session::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_protocol::SenderSummary;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, trace};

/// Default number of messages returned by a history query.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Upper bound for a history query.
pub const MAX_HISTORY_LIMIT: usize = 200;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The message replied to does not exist.
    #[error("Reply target not found: {0}")]
    ReplyTargetNotFound(MessageId),

    /// The backing storage is unreachable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure.
    #[error("Store failure: {0}")]
    Backend(String),
}

/// A page of conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
    pub limit: usize,
    /// Only messages created strictly before this instant.
    pub before: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    /// Clamp the limit into `1..=MAX_HISTORY_LIMIT`.
    #[must_use]
    pub fn new(limit: Option<usize>, before: Option<DateTime<Utc>>) -> Self {
        Self {
            limit: limit
                .unwrap_or(DEFAULT_HISTORY_LIMIT)
                .clamp(1, MAX_HISTORY_LIMIT),
            before,
        }
    }
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// A conversation a user takes part in, with its newest message.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationThread {
    pub conversation_id: String,
    pub last_message: Message,
    /// Messages from other senders that are still unread.
    pub unread_count: usize,
}

/// Durable append/query of messages per conversation.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message, attaching sender and reply metadata.
    async fn create_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// Find a message that `reader_id` may mark as read, i.e. one they did
    /// not send.
    async fn find_readable_message(
        &self,
        message_id: &MessageId,
        reader_id: &str,
    ) -> Result<Option<Message>, StoreError>;

    /// Set the read flag of a message.
    async fn mark_message_read(&self, message_id: &MessageId) -> Result<(), StoreError>;

    /// The newest `query.limit` messages of a conversation, oldest first.
    async fn list_messages(
        &self,
        conversation_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<Message>, StoreError>;

    /// Conversations of a user, most recently active first.
    async fn list_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationThread>, StoreError>;

    /// Remember the public profile of a user for sender summaries.
    ///
    /// Stores that resolve profiles elsewhere keep the default no-op.
    async fn save_profile(&self, _profile: SenderSummary) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory message store.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: DashMap<MessageId, Message>,
    /// Conversation id -> message ids in insertion order.
    conversations: DashMap<String, Vec<MessageId>>,
    /// User id -> conversations they take part in.
    threads: DashMap<UserId, BTreeSet<String>>,
    /// Conversation id -> sequence number of its newest message.
    activity: DashMap<String, u64>,
    sequence: AtomicU64,
    /// Profiles used for sender summaries.
    profiles: DashMap<UserId, SenderSummary>,
}

impl InMemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user profile so messages carry a sender summary.
    pub fn add_profile(&self, profile: SenderSummary) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    fn index_thread(&self, message: &Message) {
        let conversation_id = &message.conversation_id;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.activity.insert(conversation_id.clone(), seq);

        let participants = match Conversation::parse(conversation_id) {
            Ok(conversation) => match conversation.direct_participants() {
                Some(pair) => pair.map(str::to_string).to_vec(),
                None => vec![message.sender_id.clone()],
            },
            Err(_) => vec![message.sender_id.clone()],
        };

        for user_id in participants {
            self.threads
                .entry(user_id)
                .or_default()
                .insert(conversation_id.clone());
        }
    }

    /// Get a stored message.
    #[must_use]
    pub fn get(&self, message_id: &MessageId) -> Option<Message> {
        self.messages.get(message_id).map(|m| m.clone())
    }

    /// Total number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let reply_to = match &new.reply_to {
            Some(id) => Some(
                self.messages
                    .get(id)
                    .map(|target| target.reply_preview())
                    .ok_or_else(|| StoreError::ReplyTargetNotFound(id.clone()))?,
            ),
            None => None,
        };

        let message = Message {
            id: MessageId::generate(),
            sender: self.profiles.get(&new.sender_id).map(|p| p.clone()),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            kind: new.kind,
            body: new.body,
            reply_to,
            created_at: Utc::now(),
            is_read: false,
        };

        self.messages.insert(message.id.clone(), message.clone());
        self.conversations
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.id.clone());
        self.index_thread(&message);

        debug!(
            message = %message.id,
            conversation = %message.conversation_id,
            "Stored message"
        );

        Ok(message)
    }

    async fn find_readable_message(
        &self,
        message_id: &MessageId,
        reader_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        Ok(self
            .messages
            .get(message_id)
            .filter(|m| m.sender_id != reader_id)
            .map(|m| m.clone()))
    }

    async fn mark_message_read(&self, message_id: &MessageId) -> Result<(), StoreError> {
        if let Some(mut message) = self.messages.get_mut(message_id) {
            message.is_read = true;
            trace!(message = %message_id, "Marked message read");
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<Message>, StoreError> {
        let Some(ids) = self.conversations.get(conversation_id) else {
            return Ok(Vec::new());
        };

        let mut page: Vec<Message> = ids
            .iter()
            .rev()
            .filter_map(|id| self.messages.get(id).map(|m| m.clone()))
            .filter(|m| query.before.map_or(true, |before| m.created_at < before))
            .take(query.limit)
            .collect();
        page.reverse();

        Ok(page)
    }

    async fn list_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationThread>, StoreError> {
        let conversation_ids: Vec<String> = match self.threads.get(user_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Ok(Vec::new()),
        };

        let mut threads: Vec<ConversationThread> = conversation_ids
            .into_iter()
            .filter_map(|conversation_id| {
                let ids = self.conversations.get(&conversation_id)?;
                let messages: Vec<Message> = ids
                    .iter()
                    .filter_map(|id| self.messages.get(id).map(|m| m.clone()))
                    .collect();
                let unread_count = messages
                    .iter()
                    .filter(|m| m.sender_id != user_id && !m.is_read)
                    .count();
                let last_message = messages.into_iter().last()?;
                Some(ConversationThread {
                    conversation_id,
                    last_message,
                    unread_count,
                })
            })
            .collect();

        threads.sort_by_key(|t| {
            std::cmp::Reverse(self.activity.get(&t.conversation_id).map_or(0, |seq| *seq))
        });
        Ok(threads)
    }

    async fn save_profile(&self, profile: SenderSummary) -> Result<(), StoreError> {
        self.add_profile(profile);
        Ok(())
    }
}
