//! Connection-level events.
//!
//! Every frame is a JSON object tagged by `type` (`"chat-message"`,
//! `"roster-update"`, ...). Framing and transport are the websocket layer's
//! concern; this module only fixes the shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Reason;
use crate::types::{MessageId, UserId};

/// Public profile of a user as shown in the roster and on messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: String,
}

/// Compact view of the message being replied to, resolved at render time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub id: MessageId,
    pub author_name: String,
    pub avatar_url: Option<String>,
    pub excerpt: String,
    pub deleted: bool,
}

/// A message as delivered to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageView {
    pub id: MessageId,
    /// `None` for system-authored messages.
    pub author: Option<UserSummary>,
    pub content: String,
    pub html: String,
    pub time: DateTime<Utc>,
    pub reply_to: Option<ReplyPreview>,
    pub deleted: bool,
    pub mentions: Vec<UserId>,
}

/// Client -> server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        content: String,
        #[serde(default)]
        reply_to: Option<MessageId>,
    },

    #[serde(rename_all = "camelCase")]
    DeleteMessage { message_id: MessageId },

    #[serde(rename_all = "camelCase")]
    HistoryRequest {
        #[serde(default)]
        before_id: Option<MessageId>,
    },
}

/// Server -> client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    ChatInit {
        #[serde(rename = "self")]
        me: UserSummary,
        history: Vec<ChatMessageView>,
        history_done: bool,
        online_count: usize,
        roster: Vec<UserSummary>,
    },

    #[serde(rename_all = "camelCase")]
    PresenceInit {
        #[serde(rename = "self")]
        me: UserSummary,
        roster: Vec<UserSummary>,
        online_count: usize,
    },

    ChatMessage(ChatMessageView),

    #[serde(rename_all = "camelCase")]
    MessageDeleted { message_id: MessageId },

    SystemMessage { text: String, time: DateTime<Utc> },

    RosterUpdate { roster: Vec<UserSummary> },

    OnlineCount { n: usize },

    Mention {
        from: UserSummary,
        text: String,
        html: String,
        time: DateTime<Utc>,
    },

    History {
        messages: Vec<ChatMessageView>,
        done: bool,
    },

    AuthRequired,

    Error { reason: Reason, detail: String },
}

impl ServerEvent {
    pub fn error(reason: Reason, detail: impl Into<String>) -> Self {
        ServerEvent::Error {
            reason,
            detail: detail.into(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ClientEvent {
    /// Parse a JSON text frame.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}
