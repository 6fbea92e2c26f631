//! Conversation identifiers.
//!
//! A direct conversation between two users is keyed by the sorted pair of
//! user ids joined with [`SEPARATOR`], so both directions map to the same key.
//! An identifier without a separator names a group.

use crate::session::UserId;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Separator between the two participants of a direct conversation.
pub const SEPARATOR: char = '#';

/// Maximum conversation identifier length.
pub const MAX_CONVERSATION_ID_LENGTH: usize = 256;

/// Conversation identifier errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("Conversation id cannot be empty")]
    Empty,

    #[error("Conversation id too long")]
    TooLong,

    #[error("Conversation id contains invalid characters")]
    InvalidCharacters,

    #[error("Conversation id has an empty participant")]
    EmptyParticipant,

    #[error("Conversation id names more than two participants: {0}")]
    TooManyParticipants(String),
}

/// A parsed conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Conversation {
    /// One-to-one chat. `first <= second` always holds.
    Direct { first: UserId, second: UserId },
    /// Group chat; members are resolved by a
    /// [`MembershipResolver`](crate::directory::MembershipResolver).
    Group { group_id: String },
}

impl Conversation {
    /// Create a direct conversation between two users, in either order.
    #[must_use]
    pub fn direct(a: impl Into<UserId>, b: impl Into<UserId>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Conversation::Direct {
                first: a,
                second: b,
            }
        } else {
            Conversation::Direct {
                first: b,
                second: a,
            }
        }
    }

    /// Create a group conversation.
    #[must_use]
    pub fn group(group_id: impl Into<String>) -> Self {
        Conversation::Group {
            group_id: group_id.into(),
        }
    }

    /// Parse a conversation identifier.
    ///
    /// `"a#b"` and `"b#a"` parse to the same direct conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is empty, too long, contains
    /// control characters, or has an empty or third participant.
    pub fn parse(id: &str) -> Result<Self, ConversationError> {
        if id.is_empty() {
            return Err(ConversationError::Empty);
        }
        if id.len() > MAX_CONVERSATION_ID_LENGTH {
            return Err(ConversationError::TooLong);
        }
        if id.chars().any(char::is_control) {
            return Err(ConversationError::InvalidCharacters);
        }

        let mut parts = id.split(SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(group), None, _) => Ok(Conversation::group(group)),
            (Some(a), Some(b), None) => {
                if a.is_empty() || b.is_empty() {
                    return Err(ConversationError::EmptyParticipant);
                }
                Ok(Conversation::direct(a, b))
            }
            _ => Err(ConversationError::TooManyParticipants(id.to_string())),
        }
    }

    /// Canonical identifier, used as routing and storage key.
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Conversation::Direct { first, second } => format!("{first}{SEPARATOR}{second}"),
            Conversation::Group { group_id } => group_id.clone(),
        }
    }

    /// Check if this is a one-to-one conversation.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self, Conversation::Direct { .. })
    }

    /// Participants of a direct conversation; `None` for groups.
    #[must_use]
    pub fn direct_participants(&self) -> Option<[&str; 2]> {
        match self {
            Conversation::Direct { first, second } => Some([first.as_str(), second.as_str()]),
            Conversation::Group { .. } => None,
        }
    }

    /// The other participant of a direct conversation, if `user_id` is one.
    #[must_use]
    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        match self {
            Conversation::Direct { first, second } if first == user_id => Some(second.as_str()),
            Conversation::Direct { first, second } if second == user_id => Some(first.as_str()),
            _ => None,
        }
    }
}

impl FromStr for Conversation {
    type Err = ConversationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Conversation::parse(s)
    }
}

impl fmt::Display for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conversation::Direct { first, second } => write!(f, "{first}{SEPARATOR}{second}"),
            Conversation::Group { group_id } => f.write_str(group_id),
        }
    }
}
