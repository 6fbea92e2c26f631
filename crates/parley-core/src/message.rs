//! Chat message types.
//!
//! Messages are immutable once persisted, apart from the read flag.

use crate::session::UserId;
use chrono::{DateTime, Utc};
use parley_protocol::{MessageKind, MessageReceived, ReplyPreview, SendMessage, SenderSummary};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// A unique message identifier, assigned by the message store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random message ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Message body validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("Message has neither content nor media")]
    Empty,
}

/// Text content and/or media reference of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub file_size: Option<u64>,
    pub duration: Option<u32>,
}

impl MessageBody {
    /// A text-only body.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// A media body.
    #[must_use]
    pub fn media(url: impl Into<String>) -> Self {
        Self {
            media_url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Check that the body carries content, a media reference, or both.
    ///
    /// Any combination is accepted for every kind, so a captioned image
    /// without an uploaded file is still a valid message.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Empty`] if neither is present.
    pub fn validate(&self) -> Result<(), PayloadError> {
        let has_content = self.content.as_deref().is_some_and(|c| !c.trim().is_empty());
        let has_media = self.media_url.as_deref().is_some_and(|m| !m.is_empty());

        if has_content || has_media {
            Ok(())
        } else {
            Err(PayloadError::Empty)
        }
    }
}

/// A message about to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Canonical conversation identifier.
    pub conversation_id: String,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub body: MessageBody,
    pub reply_to: Option<MessageId>,
}

impl NewMessage {
    /// Build a new message from a client request.
    ///
    /// The request's conversation id is replaced by the canonical one.
    #[must_use]
    pub fn from_request(
        sender_id: impl Into<UserId>,
        conversation_id: impl Into<String>,
        request: SendMessage,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            kind: request.message_type,
            body: MessageBody {
                content: request.content,
                media_url: request.media_url,
                file_size: request.file_size,
                duration: request.duration,
            },
            reply_to: request.reply_to_id.map(MessageId::from),
        }
    }
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub sender_id: UserId,
    /// Sender profile, when the store can resolve one.
    pub sender: Option<SenderSummary>,
    pub kind: MessageKind,
    pub body: MessageBody,
    pub reply_to: Option<ReplyPreview>,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Message {
    /// Wire representation delivered with `message:receive`.
    #[must_use]
    pub fn to_wire(&self) -> MessageReceived {
        MessageReceived {
            message_id: self.id.to_string(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            sender: self.sender.clone(),
            message_type: self.kind,
            content: self.body.content.clone(),
            media_url: self.body.media_url.clone(),
            file_size: self.body.file_size,
            duration: self.body.duration,
            reply_to: self.reply_to.clone(),
            created_at: self.created_at,
        }
    }

    /// Excerpt used when another message replies to this one.
    #[must_use]
    pub fn reply_preview(&self) -> ReplyPreview {
        ReplyPreview {
            id: self.id.to_string(),
            content: self.body.content.clone(),
            message_type: self.kind,
            sender_nickname: self.sender.as_ref().map(|s| s.nickname.clone()),
        }
    }
}
