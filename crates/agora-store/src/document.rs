//! The persisted store document and its load-time normalization.
//!
//! The document is one JSON object:
//!
//! ```text
//! { "version": 1,
//!   "users": [...], "messages": [...], "files": [...],
//!   "nextUserId": n, "nextMessageId": n, "nextFileId": n }
//! ```
//!
//! Loading never trusts the document. Each record is rebuilt field by field:
//! optional fields that are missing or malformed fall back to defaults, while
//! records missing a required field are dropped and counted in the
//! [`LoadReport`]. Counters are repaired so they always run ahead of the
//! highest id present.

use std::collections::{BTreeMap, HashSet};

use agora_shared::constants::{
    DOCUMENT_VERSION, MAX_DISPLAY_NAME_CHARS, MAX_STICKER_DESCRIPTION_CHARS, STICKER_CAP,
};
use agora_shared::{FileId, MessageId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::models::{Avatar, AvatarKind, FileRecord, Message, PasswordReset, Sticker, User};
use crate::store::StoreState;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Borrowed view of the state, serialized without cloning records.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentRef<'a> {
    version: u32,
    users: Vec<&'a User>,
    messages: Vec<&'a Message>,
    files: Vec<&'a FileRecord>,
    next_user_id: u64,
    next_message_id: u64,
    next_file_id: u64,
}

/// What happened while loading a document.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub users: usize,
    pub messages: usize,
    pub files: usize,
    pub dropped_users: usize,
    pub dropped_messages: usize,
    pub dropped_files: usize,
    pub dropped_stickers: usize,
}

impl LoadReport {
    pub fn dropped_anything(&self) -> bool {
        self.dropped_users + self.dropped_messages + self.dropped_files + self.dropped_stickers > 0
    }
}

pub(crate) fn encode(state: &StoreState) -> Result<String> {
    let doc = DocumentRef {
        version: DOCUMENT_VERSION,
        users: state.users.values().collect(),
        messages: state.messages.values().collect(),
        files: state.files.values().collect(),
        next_user_id: state.next_user_id,
        next_message_id: state.next_message_id,
        next_file_id: state.next_file_id,
    };
    Ok(serde_json::to_string(&doc)?)
}

pub(crate) fn decode(raw: &str, now: DateTime<Utc>) -> Result<(StoreState, LoadReport)> {
    let value: Value = serde_json::from_str(raw)?;
    let Some(doc) = value.as_object() else {
        return Err(StoreError::CorruptDocument(
            "top-level value is not an object".into(),
        ));
    };

    if let Some(version) = uint(doc, "version") {
        if version > u64::from(DOCUMENT_VERSION) {
            tracing::warn!(
                version,
                supported = DOCUMENT_VERSION,
                "store document is newer than this build, loading best-effort"
            );
        }
    }

    let mut report = LoadReport::default();
    let mut state = StoreState::default();

    let mut emails = HashSet::new();
    for raw_user in array(doc, "users") {
        match normalize_user(raw_user, now, &mut report) {
            Some(user) if !state.users.contains_key(&user.id) && emails.insert(user.email.clone()) => {
                state.users.insert(user.id, user);
            }
            _ => report.dropped_users += 1,
        }
    }

    for raw_message in array(doc, "messages") {
        match normalize_message(raw_message, now) {
            Some(message) if !state.messages.contains_key(&message.id) => {
                state.messages.insert(message.id, message);
            }
            _ => report.dropped_messages += 1,
        }
    }

    let mut live_codes = HashSet::new();
    for raw_file in array(doc, "files") {
        match normalize_file(raw_file, now) {
            Some(file)
                if !state.files.contains_key(&file.id)
                    && (file.deleted || live_codes.insert(file.code.clone())) =>
            {
                state.files.insert(file.id, file);
            }
            _ => report.dropped_files += 1,
        }
    }

    state.next_user_id = next_counter(uint(doc, "nextUserId"), last_key(&state.users).map(|id| id.0));
    state.next_message_id =
        next_counter(uint(doc, "nextMessageId"), last_key(&state.messages).map(|id| id.0));
    state.next_file_id = next_counter(uint(doc, "nextFileId"), last_key(&state.files).map(|id| id.0));

    report.users = state.users.len();
    report.messages = state.messages.len();
    report.files = state.files.len();

    Ok((state, report))
}

fn last_key<K: Copy, V>(map: &BTreeMap<K, V>) -> Option<K> {
    map.keys().next_back().copied()
}

fn next_counter(stored: Option<u64>, highest: Option<u64>) -> u64 {
    let floor = highest.map_or(1, |id| id.saturating_add(1));
    stored.unwrap_or(1).max(floor).max(1)
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

fn normalize_user(value: &Value, now: DateTime<Utc>, report: &mut LoadReport) -> Option<User> {
    let obj = value.as_object()?;
    let id = UserId(uint(obj, "id")?);
    let email = non_empty(obj, "email")?.to_lowercase();

    let display_name = non_empty(obj, "displayName")
        .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());
    let display_name = truncate_chars(&display_name, MAX_DISPLAY_NAME_CHARS);

    let avatar = field(obj, "avatar")
        .and_then(Value::as_object)
        .map(|a| Avatar {
            kind: string(a, "kind")
                .and_then(|k| AvatarKind::parse(&k))
                .unwrap_or_default(),
            url: string(a, "url").unwrap_or_default(),
        })
        .unwrap_or_default();

    let password_reset = field(obj, "passwordReset")
        .and_then(Value::as_object)
        .and_then(|r| {
            Some(PasswordReset {
                code_hash: non_empty(r, "codeHash")?,
                expires_at: timestamp(r, "expiresAt")?,
                failed_attempts: uint(r, "failedAttempts")
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(0),
            })
        });

    let mut stickers: Vec<Sticker> = Vec::new();
    for raw in array(obj, "stickers") {
        match normalize_sticker(raw, now) {
            Some(sticker)
                if stickers.len() < STICKER_CAP && !stickers.iter().any(|s| s.id == sticker.id) =>
            {
                stickers.push(sticker)
            }
            _ => report.dropped_stickers += 1,
        }
    }

    let created_at = timestamp(obj, "createdAt").unwrap_or(now);

    Some(User {
        id,
        email,
        display_name,
        credential_hash: string(obj, "credentialHash").unwrap_or_default(),
        avatar,
        verified: boolean(obj, "verified").unwrap_or(false),
        verification_token: non_empty(obj, "verificationToken"),
        verification_expires_at: timestamp(obj, "verificationExpiresAt"),
        password_reset,
        stickers,
        created_at,
        updated_at: timestamp(obj, "updatedAt").unwrap_or(created_at),
    })
}

fn normalize_sticker(value: &Value, now: DateTime<Utc>) -> Option<Sticker> {
    let obj = value.as_object()?;
    let id = non_empty(obj, "id")?;
    let image_url = non_empty(obj, "imageUrl")?;
    Some(Sticker {
        id,
        description: truncate_chars(
            &string(obj, "description").unwrap_or_default(),
            MAX_STICKER_DESCRIPTION_CHARS,
        ),
        preview_url: non_empty(obj, "previewUrl").unwrap_or_else(|| image_url.clone()),
        image_url,
        created_at: timestamp(obj, "createdAt").unwrap_or(now),
    })
}

fn normalize_message(value: &Value, now: DateTime<Utc>) -> Option<Message> {
    let obj = value.as_object()?;
    Some(Message {
        id: MessageId(uint(obj, "id")?),
        author_id: uint(obj, "authorId").map(UserId),
        content: string(obj, "content")?,
        created_at: timestamp(obj, "createdAt").unwrap_or(now),
        reply_to: uint(obj, "replyTo").map(MessageId),
        deleted: boolean(obj, "deleted").unwrap_or(false),
    })
}

fn normalize_file(value: &Value, now: DateTime<Utc>) -> Option<FileRecord> {
    let obj = value.as_object()?;
    Some(FileRecord {
        id: FileId(uint(obj, "id")?),
        owner_id: UserId(uint(obj, "ownerId")?),
        code: non_empty(obj, "code")?.to_uppercase(),
        object_key: non_empty(obj, "objectKey")?,
        file_name: non_empty(obj, "fileName")?,
        size: uint(obj, "size").unwrap_or(0),
        content_type: non_empty(obj, "contentType").unwrap_or_else(|| DEFAULT_CONTENT_TYPE.into()),
        created_at: timestamp(obj, "createdAt").unwrap_or(now),
        deleted: boolean(obj, "deleted").unwrap_or(false),
    })
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

fn array<'a>(obj: &'a Map<String, Value>, key: &str) -> impl Iterator<Item = &'a Value> {
    field(obj, key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    field(obj, key).and_then(Value::as_str).map(str::to_string)
}

fn non_empty(obj: &Map<String, Value>, key: &str) -> Option<String> {
    let s = field(obj, key)?.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn uint(obj: &Map<String, Value>, key: &str) -> Option<u64> {
    match field(obj, key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn boolean(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    field(obj, key)?.as_bool()
}

/// RFC 3339 string or epoch milliseconds.
fn timestamp(obj: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    match field(obj, key)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
