use serde::{Deserialize, Serialize};

// -- Notifications --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationCount {
    pub notification_counter: u32,
}

/// The clear endpoint answers with either a bare count or a one-element list
/// of counts, depending on the backend build.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ClearedCount {
    One(NotificationCount),
    Many(Vec<NotificationCount>),
}

impl ClearedCount {
    /// The post-clear counter; an empty list means the owner has no row yet.
    pub fn value(&self) -> u32 {
        match self {
            Self::One(c) => c.notification_counter,
            Self::Many(list) => list.first().map_or(0, |c| c.notification_counter),
        }
    }
}

// -- Chat requests --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequesteeBody {
    pub requestee: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestorBody {
    pub requestor: String,
}

/// Requestee's answer to a pending chat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRequestDecision {
    Approve,
    Deny,
}

impl ChatRequestDecision {
    pub fn as_query(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Deny => "deny",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCount {
    pub request_count: u32,
}

// -- Messages --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostMessageRequest {
    pub recipient_user: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrieveMessagesRequest {
    pub receiver: String,
}

// -- Relay --

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
    pub users: usize,
}
