//! Sessions: live connections bound to a user identity.

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// A user identifier, as issued by the identity verifier.
pub type UserId = String;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
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

/// Snapshot of one authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
}

/// Connection lifecycle.
///
/// ```text
/// Connecting ──▶ Authenticated ──▶ Disconnected ──▶ Closed
///      │
///      └──────▶ Rejected ──────────────────────────▶ Closed
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Connecting,
    Authenticated(UserId),
    Rejected,
    Disconnected(UserId),
    Closed,
}

/// An illegal lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid session transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}

impl SessionState {
    /// Short state name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticated(_) => "authenticated",
            SessionState::Rejected => "rejected",
            SessionState::Disconnected(_) => "disconnected",
            SessionState::Closed => "closed",
        }
    }

    /// The bound user, if the connection is authenticated.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            SessionState::Authenticated(user) => Some(user.as_str()),
            _ => None,
        }
    }

    /// `Connecting -> Authenticated`.
    ///
    /// # Errors
    ///
    /// Returns an error from any other state.
    pub fn authenticate(&mut self, user_id: impl Into<UserId>) -> Result<(), InvalidTransition> {
        match self {
            SessionState::Connecting => {
                *self = SessionState::Authenticated(user_id.into());
                Ok(())
            }
            _ => Err(self.invalid("authenticated")),
        }
    }

    /// `Connecting -> Rejected`.
    ///
    /// # Errors
    ///
    /// Returns an error from any other state.
    pub fn reject(&mut self) -> Result<(), InvalidTransition> {
        match self {
            SessionState::Connecting => {
                *self = SessionState::Rejected;
                Ok(())
            }
            _ => Err(self.invalid("rejected")),
        }
    }

    /// `Authenticated -> Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns an error from any other state.
    pub fn disconnect(&mut self) -> Result<(), InvalidTransition> {
        match std::mem::replace(self, SessionState::Closed) {
            SessionState::Authenticated(user) => {
                *self = SessionState::Disconnected(user);
                Ok(())
            }
            previous => {
                *self = previous;
                Err(self.invalid("disconnected"))
            }
        }
    }

    /// Any state -> `Closed`. Closing twice is a no-op.
    pub fn close(&mut self) {
        *self = SessionState::Closed;
    }

    /// Check if the state is terminal.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    fn invalid(&self, to: &'static str) -> InvalidTransition {
        InvalidTransition {
            from: self.name(),
            to,
        }
    }
}
