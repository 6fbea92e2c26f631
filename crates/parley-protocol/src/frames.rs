//! Event frames for the Parley protocol.
//!
//! Both directions use adjacently tagged envelopes: the event name lives in
//! `event` and its payload in `data`. Payload fields are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    File,
    Location,
}

impl MessageKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::File => "file",
            MessageKind::Location => "location",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Online status carried by presence events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Stable error kinds reported on the `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The connection has no bound user.
    Unauthenticated,
    /// The conversation identifier could not be parsed.
    InvalidConversation,
    /// The message body is empty or inconsistent with its kind.
    InvalidPayload,
    /// The message store rejected a new message.
    PersistenceFailed,
    /// Group membership could not be resolved.
    MembershipFailed,
    /// The message store failed on a lookup or update.
    StoreFailed,
    /// The caller is not a participant of the conversation.
    Forbidden,
    /// The inbound frame could not be decoded.
    InvalidFrame,
    /// Anything else.
    Internal,
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Credential handshake payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub token: String,
}

/// A new message from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub conversation_id: String,
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

impl SendMessage {
    /// Create a plain text message request.
    #[must_use]
    pub fn text(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_type: MessageKind::Text,
            content: Some(content.into()),
            media_url: None,
            file_size: None,
            duration: None,
            reply_to_id: None,
        }
    }

    /// Reference an earlier message as the one being replied to.
    #[must_use]
    pub fn replying_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to_id = Some(message_id.into());
        self
    }
}

/// Read receipt request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRead {
    pub message_id: String,
}

/// Typing indicator request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    pub conversation_id: String,
}

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "connect")]
    Connect(ConnectRequest),

    #[serde(rename = "message:send")]
    SendMessage(SendMessage),

    #[serde(rename = "message:read")]
    MarkRead(MarkRead),

    #[serde(rename = "typing:start")]
    TypingStart(TypingRequest),

    #[serde(rename = "typing:stop")]
    TypingStop(TypingRequest),

    #[serde(rename = "ping")]
    Ping,
}

impl ClientFrame {
    /// Event name of the frame.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientFrame::Connect(_) => "connect",
            ClientFrame::SendMessage(_) => "message:send",
            ClientFrame::MarkRead(_) => "message:read",
            ClientFrame::TypingStart(_) => "typing:start",
            ClientFrame::TypingStop(_) => "typing:stop",
            ClientFrame::Ping => "ping",
        }
    }

    /// Create a `connect` frame.
    #[must_use]
    pub fn connect(token: impl Into<String>) -> Self {
        ClientFrame::Connect(ConnectRequest {
            token: token.into(),
        })
    }

    /// Create a `message:read` frame.
    #[must_use]
    pub fn mark_read(message_id: impl Into<String>) -> Self {
        ClientFrame::MarkRead(MarkRead {
            message_id: message_id.into(),
        })
    }

    /// Create a `typing:start` frame.
    #[must_use]
    pub fn typing_start(conversation_id: impl Into<String>) -> Self {
        ClientFrame::TypingStart(TypingRequest {
            conversation_id: conversation_id.into(),
        })
    }

    /// Create a `typing:stop` frame.
    #[must_use]
    pub fn typing_stop(conversation_id: impl Into<String>) -> Self {
        ClientFrame::TypingStop(TypingRequest {
            conversation_id: conversation_id.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Handshake confirmation sent to a freshly authenticated connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub connection_id: String,
    pub user_id: String,
    /// Server heartbeat interval in milliseconds.
    pub heartbeat_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOnline {
    pub user_id: String,
    pub status: PresenceStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOffline {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

/// Public profile fields of a message sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderSummary {
    pub id: String,
    pub username: String,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Excerpt of the message being replied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
    pub message_type: MessageKind,
    #[serde(default)]
    pub sender_nickname: Option<String>,
}

/// A persisted message as delivered to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceived {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender: Option<SenderSummary>,
    pub message_type: MessageKind,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub reply_to: Option<ReplyPreview>,
    pub created_at: DateTime<Utc>,
}

/// Whether a conversation is one-to-one or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Private,
    Group,
}

/// One entry of a user's conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    /// The other participants, when known.
    pub participants: Vec<String>,
    pub last_message: MessageReceived,
    /// Messages from others the user has not read yet.
    pub unread_count: usize,
}

/// Acknowledgment to the sending connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: String,
    pub reader_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub conversation_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
}

/// An event sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected(Connected),

    #[serde(rename = "user:online")]
    UserOnline(UserOnline),

    #[serde(rename = "user:offline")]
    UserOffline(UserOffline),

    #[serde(rename = "message:receive")]
    MessageReceive(MessageReceived),

    #[serde(rename = "message:sent")]
    MessageSent(MessageSent),

    #[serde(rename = "message:read")]
    MessageRead(ReadReceipt),

    #[serde(rename = "typing:start")]
    TypingStart(Typing),

    #[serde(rename = "typing:stop")]
    TypingStop(Typing),

    #[serde(rename = "error")]
    Error(ErrorEvent),

    #[serde(rename = "pong")]
    Pong,
}

impl ServerEvent {
    /// Event name of the frame.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::UserOnline(_) => "user:online",
            ServerEvent::UserOffline(_) => "user:offline",
            ServerEvent::MessageReceive(_) => "message:receive",
            ServerEvent::MessageSent(_) => "message:sent",
            ServerEvent::MessageRead(_) => "message:read",
            ServerEvent::TypingStart(_) => "typing:start",
            ServerEvent::TypingStop(_) => "typing:stop",
            ServerEvent::Error(_) => "error",
            ServerEvent::Pong => "pong",
        }
    }

    /// Create a `user:online` event.
    #[must_use]
    pub fn online(user_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        ServerEvent::UserOnline(UserOnline {
            user_id: user_id.into(),
            status: PresenceStatus::Online,
            timestamp,
        })
    }

    /// Create a `user:offline` event.
    #[must_use]
    pub fn offline(user_id: impl Into<String>, last_seen: DateTime<Utc>) -> Self {
        ServerEvent::UserOffline(UserOffline {
            user_id: user_id.into(),
            status: PresenceStatus::Offline,
            last_seen,
        })
    }

    /// Create a `message:sent` acknowledgment.
    #[must_use]
    pub fn sent(message_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        ServerEvent::MessageSent(MessageSent {
            message_id: message_id.into(),
            timestamp,
        })
    }

    /// Create a `message:read` receipt.
    #[must_use]
    pub fn read(
        message_id: impl Into<String>,
        reader_id: impl Into<String>,
        read_at: DateTime<Utc>,
    ) -> Self {
        ServerEvent::MessageRead(ReadReceipt {
            message_id: message_id.into(),
            reader_id: reader_id.into(),
            read_at,
        })
    }

    /// Create an `error` event.
    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorEvent {
            kind,
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_from_json() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "event": "message:send",
            "data": {
                "conversationId": "u1#u2",
                "messageType": "text",
                "content": "hi"
            }
        }))
        .unwrap();

        match frame {
            ClientFrame::SendMessage(req) => {
                assert_eq!(req.conversation_id, "u1#u2");
                assert_eq!(req.message_type, MessageKind::Text);
                assert_eq!(req.content.as_deref(), Some("hi"));
                assert!(req.reply_to_id.is_none());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_ping_without_data() {
        let frame: ClientFrame = serde_json::from_value(json!({ "event": "ping" })).unwrap();
        assert_eq!(frame, ClientFrame::Ping);
    }

    #[test]
    fn test_unknown_message_kind_rejected() {
        let result = serde_json::from_value::<ClientFrame>(json!({
            "event": "message:send",
            "data": { "conversationId": "a#b", "messageType": "sticker" }
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_server_event_shape() {
        let event = ServerEvent::read("m-1", "u2", Utc::now());
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["event"], "message:read");
        assert_eq!(value["data"]["messageId"], "m-1");
        assert_eq!(value["data"]["readerId"], "u2");
        assert!(value["data"]["readAt"].is_string());
    }

    #[test]
    fn test_presence_event_fields() {
        let online = serde_json::to_value(ServerEvent::online("u1", Utc::now())).unwrap();
        assert_eq!(online["event"], "user:online");
        assert_eq!(online["data"]["status"], "online");
        assert!(online["data"].get("timestamp").is_some());

        let offline = serde_json::to_value(ServerEvent::offline("u1", Utc::now())).unwrap();
        assert_eq!(offline["event"], "user:offline");
        assert_eq!(offline["data"]["status"], "offline");
        assert!(offline["data"].get("lastSeen").is_some());
    }

    #[test]
    fn test_error_kind_wire_name() {
        let event = ServerEvent::error(ErrorKind::PersistenceFailed, "Failed to send message");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["data"]["kind"], "persistence_failed");
        assert_eq!(event.event_name(), "error");
    }

    #[test]
    fn test_conversation_summary_shape() {
        let summary = ConversationSummary {
            conversation_id: "u1#u2".into(),
            conversation_type: ConversationType::Private,
            participants: vec!["u2".into()],
            last_message: MessageReceived {
                message_id: "m-1".into(),
                conversation_id: "u1#u2".into(),
                sender_id: "u2".into(),
                sender: None,
                message_type: MessageKind::Text,
                content: Some("hi".into()),
                media_url: None,
                file_size: None,
                duration: None,
                reply_to: None,
                created_at: Utc::now(),
            },
            unread_count: 1,
        };

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["conversationType"], "private");
        assert_eq!(value["participants"], json!(["u2"]));
        assert_eq!(value["lastMessage"]["content"], "hi");
        assert_eq!(value["unreadCount"], 1);
    }
}
