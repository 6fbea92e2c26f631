//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat gateway.
//!
//! Every frame is an event envelope `{"event": <name>, "data": {...}}`.
//! Clients send [`ClientFrame`]s and receive [`ServerEvent`]s.
//!
//! ## Client events
//!
//! - `connect` - Credential handshake (when no header/query token is used)
//! - `message:send` / `message:read` - Messaging
//! - `typing:start` / `typing:stop` - Typing indicators
//! - `ping` - Application-level keepalive
//!
//! ## Server events
//!
//! - `user:online` / `user:offline` - Presence changes
//! - `message:receive` / `message:sent` / `message:read` - Delivery and receipts
//! - `typing:start` / `typing:stop` - Typing indicators
//! - `error` - Failure of the originating action
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientFrame};
//!
//! let text = r#"{"event":"typing:start","data":{"conversationId":"alice#bob"}}"#;
//! let frame: ClientFrame = codec::decode_json(text).unwrap();
//! assert_eq!(frame.event_name(), "typing:start");
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, decode_json, encode, encode_json, ProtocolError, WireFormat};
pub use frames::{
    ClientFrame, ConnectRequest, Connected, ConversationSummary, ConversationType, ErrorEvent,
    ErrorKind, MarkRead, MessageKind, MessageReceived, MessageSent, PresenceStatus, ReadReceipt,
    ReplyPreview, SendMessage, SenderSummary, ServerEvent, Typing, TypingRequest, UserOffline,
    UserOnline,
};
