//! Uploaded-file index: public code allocation and lookups.
//!
//! The bytes live in external object storage; this registry maps the short
//! public code to the object key and metadata.

use agora_shared::constants::{FILE_CODE_ALPHABET, FILE_CODE_ATTEMPTS, FILE_CODE_LEN};
use agora_shared::{FileId, UserId};
use chrono::Utc;
use rand::{Rng, RngCore};

use crate::error::{Result, StoreError};
use crate::models::FileRecord;
use crate::store::{Store, StoreState};

/// Source of candidate file codes. Swappable so collisions can be forced.
pub trait CodeSource {
    /// A candidate drawn from the code alphabet.
    fn next_code(&mut self) -> String;
    /// Used once every attempt collided. Not re-checked.
    fn fallback_code(&mut self) -> String;
}

/// The production source: `thread_rng` for candidates, `OsRng` hex for the
/// fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodes;

impl CodeSource for RandomCodes {
    fn next_code(&mut self) -> String {
        let mut rng = rand::thread_rng();
        (0..FILE_CODE_LEN)
            .map(|_| char::from(FILE_CODE_ALPHABET[rng.gen_range(0..FILE_CODE_ALPHABET.len())]))
            .collect()
    }

    fn fallback_code(&mut self) -> String {
        let mut bytes = [0u8; FILE_CODE_LEN / 2];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        hex::encode_upper(bytes)
    }
}

/// Try up to [`FILE_CODE_ATTEMPTS`] candidates, then give up and take the
/// fallback.
fn pick_code(source: &mut impl CodeSource, is_taken: impl Fn(&str) -> bool) -> String {
    for attempt in 1..=FILE_CODE_ATTEMPTS {
        let code = source.next_code();
        if !is_taken(&code) {
            return code;
        }
        tracing::debug!(attempt, "file code collision");
    }
    tracing::warn!("file code collided {FILE_CODE_ATTEMPTS} times, using random fallback");
    source.fallback_code()
}

fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

fn live_code_taken(state: &StoreState, code: &str) -> bool {
    state.files.values().any(|f| !f.deleted && f.code == code)
}

/// A file about to be registered. The code comes from
/// [`Store::allocate_file_code`].
#[derive(Debug, Clone)]
pub struct NewFile {
    pub owner_id: UserId,
    pub code: String,
    pub object_key: String,
    pub file_name: String,
    pub size: u64,
    pub content_type: String,
}

impl Store {
    pub async fn allocate_file_code(&self) -> String {
        self.allocate_file_code_with(&mut RandomCodes).await
    }

    pub async fn allocate_file_code_with(&self, source: &mut impl CodeSource) -> String {
        let state = self.read().await;
        pick_code(source, |code| live_code_taken(&state, code))
    }

    /// Register a file. Rejects a code already held by a live record, which
    /// can only happen if the fallback code collided or another save raced.
    pub async fn save_file(&self, file: NewFile) -> Result<FileRecord> {
        let code = normalize_code(&file.code);
        if code.is_empty() || file.object_key.is_empty() || file.file_name.trim().is_empty() {
            return Err(StoreError::Validation(
                "file needs a code, object key and file name".into(),
            ));
        }

        let mut state = self.write().await;
        if !state.users.contains_key(&file.owner_id) {
            return Err(StoreError::NotFound);
        }
        if live_code_taken(&state, &code) {
            return Err(StoreError::Conflict(format!("file code {code} in use")));
        }

        let record = FileRecord {
            id: state.allocate_file_id(),
            owner_id: file.owner_id,
            code,
            object_key: file.object_key,
            file_name: file.file_name.trim().to_string(),
            size: file.size,
            content_type: file.content_type,
            created_at: Utc::now(),
            deleted: false,
        };
        state.files.insert(record.id, record.clone());
        self.changed();

        tracing::info!(file = %record.id, code = %record.code, owner = %record.owner_id, "file registered");
        Ok(record)
    }

    /// Live file by public code, ignoring case and surrounding whitespace.
    pub async fn file_by_code(&self, code: &str) -> Option<FileRecord> {
        let code = normalize_code(code);
        self.read()
            .await
            .files
            .values()
            .find(|f| !f.deleted && f.code == code)
            .cloned()
    }

    pub async fn file(&self, id: FileId) -> Option<FileRecord> {
        self.read().await.files.get(&id).cloned()
    }

    /// A user's live files, newest first.
    pub async fn files_by_user(&self, owner: UserId) -> Vec<FileRecord> {
        let state = self.read().await;
        let mut files: Vec<FileRecord> = state
            .files
            .values()
            .filter(|f| f.owner_id == owner && !f.deleted)
            .cloned()
            .collect();
        files.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        files
    }

    /// Mark a file deleted, freeing its code. Only the owner may do this.
    pub async fn delete_file(&self, id: FileId, requester: UserId) -> Result<FileRecord> {
        let mut state = self.write().await;
        let file = state.files.get_mut(&id).ok_or(StoreError::NotFound)?;
        if file.owner_id != requester {
            return Err(StoreError::PermissionDenied);
        }
        if !file.deleted {
            file.deleted = true;
            self.changed();
        }
        Ok(file.clone())
    }
}
