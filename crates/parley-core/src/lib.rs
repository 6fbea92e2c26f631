//! # parley-core
//!
//! Session registry, presence and message routing for the Parley chat server.
//!
//! - **Registry** - connection to user bindings and per-connection queues
//! - **Router** - authenticates sessions and fans events out
//! - **Conversation** - direct / group addressing
//! - **Store** - message persistence seam and an in-memory implementation
//! - **Identity** - credential verification seam and a JWT verifier
//! - **Directory** - group membership and contact lookups
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│ ChatRouter  │────▶│  Registry   │──▶ per-connection queues
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │    │     │
//!                       ▼    ▼     ▼
//!                 Identity  Store  Directory
//! ```

pub mod conversation;
pub mod directory;
pub mod identity;
pub mod message;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;

pub use conversation::{Conversation, ConversationError};
pub use directory::{
    ContactDirectory, MembershipError, MembershipResolver, SingleRecipient, StaticDirectory,
};
pub use identity::{bearer_token, AuthError, Identity, IdentityVerifier, JwtVerifier};
pub use message::{Message, MessageBody, MessageId, NewMessage, PayloadError};
pub use registry::{
    event_queue, Delivery, EventReceiver, EventSender, FanOut, RegistryError, RegistryStats,
    SessionRegistry, Unbound,
};
pub use router::{
    BroadcastScope, ChatRouter, PresenceSnapshot, ReadOutcome, RouterConfig, RouterError,
};
pub use session::{ConnectionId, Session, SessionState, UserId};
pub use store::{ConversationThread, HistoryQuery, InMemoryMessageStore, MessageStore, StoreError};
