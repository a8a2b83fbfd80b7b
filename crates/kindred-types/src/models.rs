use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of a two-party conversation, as the REST backend returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLogEntry {
    #[serde(rename = "message_from")]
    pub from: String,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(default, rename = "date_and_time", skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl MessageLogEntry {
    pub fn new(from: impl Into<String>, body: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            from: from.into(),
            body: body.into(),
            sent_at: Some(sent_at),
        }
    }

    /// Calendar day used to bucket the log for date separators.
    pub fn date_key(&self) -> Option<String> {
        self.sent_at.map(|t| t.format("%Y-%m-%d").to_string())
    }
}

/// Action a client has queued against a chat request. Mirrors the `type`
/// field the web client keeps alongside the status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingAction {
    Send,
    Remove,
    #[default]
    #[serde(rename = "")]
    Idle,
}

/// Chat-request status for a (viewer, counterpart) pair as the backend reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequestStatus {
    #[serde(default)]
    pub requestee: String,
    #[serde(default)]
    pub made: bool,
    #[serde(default, rename = "type")]
    pub action: PendingAction,
    #[serde(default)]
    pub is_requestor: bool,
    #[serde(default)]
    pub sent: bool,
    #[serde(default)]
    pub approved: bool,
}

/// Row of the chat-request inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequestSummary {
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub request_made: String,
    #[serde(default)]
    pub request_accepted: bool,
    #[serde(default)]
    pub uri: String,
}

/// Row of the recent-conversations list: the counterpart and the latest
/// message exchanged with them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentConversation {
    #[serde(rename = "user2")]
    pub username: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub sent_time: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub uri: String,
}
