//! Session registry.
//!
//! Tracks which connections are bound to which users and delivers events to
//! them. Every connection owns a bounded queue; delivery never waits on a
//! slow consumer; a full queue drops the event and logs it.

use crate::session::{ConnectionId, Session, UserId};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::ServerEvent;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

/// Sending half of a connection's outbound queue.
pub type EventSender = mpsc::Sender<Arc<ServerEvent>>;

/// Receiving half of a connection's outbound queue.
pub type EventReceiver = mpsc::Receiver<Arc<ServerEvent>>;

/// Create an outbound queue for one connection.
#[must_use]
pub fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Connection already bound: {0}")]
    AlreadyBound(ConnectionId),
}

/// Outcome of delivering one event to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the connection.
    Delivered,
    /// The connection's queue was full.
    Dropped,
    /// The connection is gone or was never bound.
    Closed,
}

/// Tally of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

impl FanOut {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Delivered => self.delivered += 1,
            Delivery::Dropped => self.dropped += 1,
            Delivery::Closed => self.closed += 1,
        }
    }

    fn merge(&mut self, other: FanOut) {
        self.delivered += other.delivered;
        self.dropped += other.dropped;
        self.closed += other.closed;
    }
}

/// Result of removing a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unbound {
    pub session: Session,
    /// The user has no connections left.
    pub last_connection: bool,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Users with at least one connection.
    pub online_users: usize,
    /// Bound connections.
    pub connections: usize,
    /// Events dropped on full queues since start.
    pub dropped_events: u64,
}

struct Binding {
    session: Session,
    sender: EventSender,
}

/// Connection-to-user binding table.
///
/// Both maps are updated under per-key entry locks: a connection is added to
/// its user's group before it becomes visible by id, and removed by id before
/// it leaves the group, so a fan-out never sees a half-bound connection.
#[derive(Default)]
pub struct SessionRegistry {
    /// Connection id -> binding.
    connections: DashMap<ConnectionId, Binding>,
    /// User id -> that user's connections.
    users: DashMap<UserId, HashMap<ConnectionId, EventSender>>,
    dropped: AtomicU64,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already bound.
    pub fn bind(
        &self,
        connection_id: ConnectionId,
        user_id: impl Into<UserId>,
        sender: EventSender,
    ) -> Result<Session, RegistryError> {
        let user_id = user_id.into();

        let Entry::Vacant(slot) = self.connections.entry(connection_id.clone()) else {
            return Err(RegistryError::AlreadyBound(connection_id));
        };

        self.users
            .entry(user_id.clone())
            .or_default()
            .insert(connection_id.clone(), sender.clone());

        let session = Session {
            connection_id,
            user_id,
            joined_at: Utc::now(),
        };
        slot.insert(Binding {
            session: session.clone(),
            sender,
        });

        debug!(
            connection = %session.connection_id,
            user = %session.user_id,
            devices = self.connection_count(&session.user_id),
            "Session bound"
        );

        Ok(session)
    }

    /// Remove a connection's binding.
    ///
    /// Returns `None` if the connection was not bound.
    pub fn unbind(&self, connection_id: &ConnectionId) -> Option<Unbound> {
        let (_, binding) = self.connections.remove(connection_id)?;
        let session = binding.session;

        let mut last_connection = false;
        if let Entry::Occupied(mut group) = self.users.entry(session.user_id.clone()) {
            group.get_mut().remove(connection_id);
            if group.get().is_empty() {
                group.remove();
                last_connection = true;
            }
        }

        debug!(
            connection = %connection_id,
            user = %session.user_id,
            last_connection,
            "Session unbound"
        );

        Some(Unbound {
            session,
            last_connection,
        })
    }

    /// The user a connection is bound to.
    #[must_use]
    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.connections
            .get(connection_id)
            .map(|b| b.session.user_id.clone())
    }

    /// Check if a user has any bound connection.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    /// Number of connections bound to a user.
    #[must_use]
    pub fn connection_count(&self, user_id: &str) -> usize {
        self.users.get(user_id).map(|g| g.len()).unwrap_or(0)
    }

    /// All users with at least one connection.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.users.iter().map(|e| e.key().clone()).collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            online_users: self.users.len(),
            connections: self.connections.len(),
            dropped_events: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Deliver an event to a single connection.
    pub fn send_to_connection(
        &self,
        connection_id: &ConnectionId,
        event: &Arc<ServerEvent>,
    ) -> Delivery {
        match self.connections.get(connection_id) {
            Some(binding) => self.deliver(connection_id, &binding.sender, event),
            None => {
                trace!(connection = %connection_id, event = event.event_name(), "No such connection");
                Delivery::Closed
            }
        }
    }

    /// Deliver an event to every connection of a user.
    pub fn send_to_user(&self, user_id: &str, event: &Arc<ServerEvent>) -> FanOut {
        let mut fan_out = FanOut::default();
        if let Some(group) = self.users.get(user_id) {
            for (connection_id, sender) in group.iter() {
                fan_out.record(self.deliver(connection_id, sender, event));
            }
        }
        fan_out
    }

    /// Deliver an event to every connection of each user, visiting each user
    /// once.
    pub fn send_to_users<'a, I>(&self, user_ids: I, event: &Arc<ServerEvent>) -> FanOut
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = std::collections::HashSet::new();
        let mut fan_out = FanOut::default();
        for user_id in user_ids {
            if seen.insert(user_id) {
                fan_out.merge(self.send_to_user(user_id, event));
            }
        }
        fan_out
    }

    /// Deliver an event to every bound connection.
    pub fn broadcast(&self, event: &Arc<ServerEvent>) -> FanOut {
        let mut fan_out = FanOut::default();
        for group in self.users.iter() {
            for (connection_id, sender) in group.value() {
                fan_out.record(self.deliver(connection_id, sender, event));
            }
        }
        trace!(
            event = event.event_name(),
            recipients = fan_out.delivered,
            "Broadcast"
        );
        fan_out
    }

    fn deliver(
        &self,
        connection_id: &ConnectionId,
        sender: &EventSender,
        event: &Arc<ServerEvent>,
    ) -> Delivery {
        match sender.try_send(Arc::clone(event)) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection = %connection_id,
                    event = event.event_name(),
                    "Send queue full, dropping event"
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                trace!(connection = %connection_id, event = event.event_name(), "Connection closed");
                Delivery::Closed
            }
        }
    }
}
