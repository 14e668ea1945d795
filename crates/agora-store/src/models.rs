//! Domain model structs held in memory and persisted in the store document.
//!
//! Every struct derives `Serialize` and `Deserialize`; the persisted field
//! names are camelCase so the document stays readable next to the wire
//! protocol.

use agora_shared::protocol::UserSummary;
use agora_shared::{FileId, MessageId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// Where a user's avatar comes from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AvatarKind {
    #[default]
    Gravatar,
    Url,
    Upload,
}

impl AvatarKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gravatar" => Some(Self::Gravatar),
            "url" => Some(Self::Url),
            "upload" => Some(Self::Upload),
            _ => None,
        }
    }
}

/// Avatar selection plus the URL it resolved to when it was chosen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Avatar {
    pub kind: AvatarKind,
    pub url: String,
}

/// Pending password reset. Only a BLAKE3 hash of the 6-digit code is kept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PasswordReset {
    pub code_hash: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub failed_attempts: u32,
}

/// A registered account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Immutable, assigned from the `nextUserId` counter.
    pub id: UserId,
    /// Unique across all users, stored trimmed and lowercased.
    pub email: String,
    pub display_name: String,
    /// Opaque hash produced by the external credential layer.
    pub credential_hash: String,
    pub avatar: Avatar,
    pub verified: bool,
    pub verification_token: Option<String>,
    pub verification_expires_at: Option<DateTime<Utc>>,
    pub password_reset: Option<PasswordReset>,
    /// Custom stickers, never more than [`agora_shared::constants::STICKER_CAP`].
    pub stickers: Vec<Sticker>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Public profile used in the roster and on rendered messages.
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            display_name: self.display_name.clone(),
            avatar_url: self.avatar.url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A chat message. Only `deleted` may change after append, and only once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// `None` for system messages.
    pub author_id: Option<UserId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub reply_to: Option<MessageId>,
    pub deleted: bool,
}

// ---------------------------------------------------------------------------
// Sticker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Sticker {
    /// Random hex token.
    pub id: String,
    pub description: String,
    pub preview_url: String,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// Metadata for an uploaded object. The bytes live in external object storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: FileId,
    pub owner_id: UserId,
    /// Public handle, unique among non-deleted records.
    pub code: String,
    pub object_key: String,
    pub file_name: String,
    pub size: u64,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}
