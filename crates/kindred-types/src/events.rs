use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MessageLogEntry;

/// Opaque id the relay assigns to every live WebSocket connection.
pub type ConnectionId = Uuid;

/// Events sent FROM the relay TO a client.
///
/// None of these carry authoritative state. Apart from the display-only
/// message log in `RecipientMessage` and the typing draft, every event means
/// "something changed, re-fetch from REST".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayEvent {
    /// First frame on every connection: the id the client must register under
    Ready { connection_id: ConnectionId },

    /// The named user's unread counter may have changed
    GetUpdatedNotificationCounter { username: String },

    /// A chat request involving the receiving user changed state
    UpdateChatRequest { from_username: String },

    /// Peer draft changed; an empty `message` means the peer stopped typing
    UserIsTypingMsg { username: String, message: String },

    /// Sender pushed its conversation log for immediate display
    RecipientMessage {
        log: Vec<MessageLogEntry>,
        from_username: String,
    },

    /// The "recent conversations" list is stale
    ReceiveUpdateProfileRequest,
}

impl RelayEvent {
    /// Wire name of the event, used as the listener key on the client.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::GetUpdatedNotificationCounter { .. } => "get-updated-notification-counter",
            Self::UpdateChatRequest { .. } => "update-chat-request",
            Self::UserIsTypingMsg { .. } => "user-is-typing-msg",
            Self::RecipientMessage { .. } => "recipient-message",
            Self::ReceiveUpdateProfileRequest => "receive-update-profile-request",
        }
    }
}

/// Commands sent FROM a client TO the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayCommand {
    /// Bind this connection to a username
    StoreUserSocketId {
        username: String,
        connection_id: ConnectionId,
    },

    /// Drop every connection registered under a username (logout)
    RemoveUserSocketId { username: String },

    /// Move this connection from one username to another (username change)
    UpdateUserSocketId {
        old_username: String,
        new_username: String,
        connection_id: ConnectionId,
    },

    /// Ask the relay to invalidate the named user's unread counter
    UpdateNotificationCounter { username: String },

    /// Tell the counterpart of a chat request to re-check its status
    ChatRequest { username: String },

    /// Current draft text for the conversation with `username`
    UserTypingMsg { username: String, message: String },

    /// Push the updated log to `username`'s live sessions
    SenderMessage {
        log: Vec<MessageLogEntry>,
        username: String,
    },

    /// Invalidate `username`'s recent conversations list on its other sessions
    ReceiveUpdateProfileRequest { username: String },
}

impl RelayCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StoreUserSocketId { .. } => "store-user-socket-id",
            Self::RemoveUserSocketId { .. } => "remove-user-socket-id",
            Self::UpdateUserSocketId { .. } => "update-user-socket-id",
            Self::UpdateNotificationCounter { .. } => "update-notification-counter",
            Self::ChatRequest { .. } => "chat-request",
            Self::UserTypingMsg { .. } => "user-typing-msg",
            Self::SenderMessage { .. } => "sender-message",
            Self::ReceiveUpdateProfileRequest { .. } => "receive-update-profile-request",
        }
    }
}
