//! Audience lookups: group membership and user contacts.

use crate::session::UserId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use thiserror::Error;

/// Directory lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Expands a group conversation into its member user ids.
#[async_trait]
pub trait MembershipResolver: Send + Sync {
    async fn members(&self, group_id: &str) -> Result<Vec<UserId>, MembershipError>;
}

/// Lists the users that should see another user's presence changes.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn contacts(&self, user_id: &str) -> Result<Vec<UserId>, MembershipError>;
}

/// Treats a group id as its only recipient.
///
/// This is the legacy addressing: events for group `g` go to whoever is
/// bound under the identity `g`. Real deployments plug in a resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleRecipient;

#[async_trait]
impl MembershipResolver for SingleRecipient {
    async fn members(&self, group_id: &str) -> Result<Vec<UserId>, MembershipError> {
        Ok(vec![group_id.to_string()])
    }
}

/// In-memory groups and contact lists.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    groups: DashMap<String, BTreeSet<UserId>>,
    contacts: DashMap<UserId, BTreeSet<UserId>>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the members of a group.
    pub fn set_group<I, S>(&self, group_id: impl Into<String>, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        self.groups.insert(
            group_id.into(),
            members.into_iter().map(Into::into).collect(),
        );
    }

    /// Record a mutual contact relation.
    pub fn connect(&self, a: &str, b: &str) {
        self.contacts
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.contacts
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }

    /// Remove a mutual contact relation.
    pub fn disconnect(&self, a: &str, b: &str) {
        if let Some(mut set) = self.contacts.get_mut(a) {
            set.remove(b);
        }
        if let Some(mut set) = self.contacts.get_mut(b) {
            set.remove(a);
        }
    }
}

#[async_trait]
impl MembershipResolver for StaticDirectory {
    async fn members(&self, group_id: &str) -> Result<Vec<UserId>, MembershipError> {
        self.groups
            .get(group_id)
            .map(|members| members.iter().cloned().collect())
            .ok_or_else(|| MembershipError::UnknownGroup(group_id.to_string()))
    }
}

#[async_trait]
impl ContactDirectory for StaticDirectory {
    async fn contacts(&self, user_id: &str) -> Result<Vec<UserId>, MembershipError> {
        Ok(self
            .contacts
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
