//! The append-only message log.
//!
//! Ids come from a monotonic counter under the same write lock as the insert,
//! so id order is append order. Messages are never removed; deletion only
//! flips `deleted`, once.

use agora_shared::{MessageId, UserId};
use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};
use crate::models::Message;
use crate::store::Store;

/// Successful soft delete. `already` is set when the message was deleted
/// before this call and nothing changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftDeleted {
    pub already: bool,
}

impl Store {
    /// Append a message and return a copy of it. Content is not validated
    /// here; callers check length and author existence first.
    pub async fn append_message(
        &self,
        author_id: Option<UserId>,
        content: &str,
        created_at: DateTime<Utc>,
        reply_to: Option<MessageId>,
    ) -> Message {
        let mut state = self.write().await;
        let message = Message {
            id: state.allocate_message_id(),
            author_id,
            content: content.to_string(),
            created_at,
            reply_to,
            deleted: false,
        };
        state.messages.insert(message.id, message.clone());
        self.changed();

        tracing::debug!(id = %message.id, author = ?author_id, "message appended");
        message
    }

    /// Soft-delete a message on behalf of `requester`, who must be its author.
    pub async fn soft_delete_message(
        &self,
        id: MessageId,
        requester: UserId,
    ) -> Result<SoftDeleted> {
        let mut state = self.write().await;
        let message = state.messages.get_mut(&id).ok_or(StoreError::NotFound)?;

        if message.author_id != Some(requester) {
            return Err(StoreError::PermissionDenied);
        }
        if message.deleted {
            return Ok(SoftDeleted { already: true });
        }

        message.deleted = true;
        self.changed();

        tracing::info!(id = %id, by = %requester, "message deleted");
        Ok(SoftDeleted { already: false })
    }

    /// Point lookup. Unlike [`Store::page_messages`] this also returns
    /// messages whose author account has since been deleted, so reply
    /// previews keep resolving.
    pub async fn message(&self, id: MessageId) -> Option<Message> {
        self.read().await.messages.get(&id).cloned()
    }

    /// Up to `limit` messages with id `< before` (or the newest ones when
    /// `before` is `None`), in ascending id order.
    ///
    /// Walk history backwards by passing the smallest id of the previous
    /// page; a page shorter than `limit` means there is nothing older.
    /// Messages whose author no longer exists are skipped; system messages
    /// (no author) are kept.
    pub async fn page_messages(&self, limit: usize, before: Option<MessageId>) -> Vec<Message> {
        if limit == 0 {
            return Vec::new();
        }

        let state = self.read().await;
        let range = match before {
            Some(before) => state.messages.range(..before),
            None => state.messages.range(..),
        };

        let mut page: Vec<Message> = range
            .rev()
            .map(|(_, message)| message)
            .filter(|m| m.author_id.map_or(true, |a| state.users.contains_key(&a)))
            .take(limit)
            .cloned()
            .collect();
        page.reverse();
        page
    }

    /// Number of messages ever appended, deleted ones included.
    pub async fn message_count(&self) -> usize {
        self.read().await.messages.len()
    }
}
