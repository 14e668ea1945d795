//! Per-user custom sticker collections, capped at [`STICKER_CAP`].

use agora_shared::constants::{MAX_STICKER_DESCRIPTION_CHARS, STICKER_CAP};
use agora_shared::UserId;
use chrono::Utc;
use rand::RngCore;

use crate::error::{Result, StoreError};
use crate::models::Sticker;
use crate::store::Store;

fn sticker_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Store {
    /// Add a sticker to `user`'s collection. Returns the new sticker and the
    /// whole updated collection.
    pub async fn add_sticker(
        &self,
        user: UserId,
        description: &str,
        preview_url: &str,
        image_url: &str,
    ) -> Result<(Sticker, Vec<Sticker>)> {
        let description = description.trim();
        if description.chars().count() > MAX_STICKER_DESCRIPTION_CHARS {
            return Err(StoreError::Validation(format!(
                "sticker description longer than {MAX_STICKER_DESCRIPTION_CHARS} characters"
            )));
        }
        if image_url.trim().is_empty() {
            return Err(StoreError::Validation("sticker image url is empty".into()));
        }

        let mut state = self.write().await;
        let owner = state.users.get_mut(&user).ok_or(StoreError::NotFound)?;
        if owner.stickers.len() >= STICKER_CAP {
            return Err(StoreError::LimitReached);
        }

        let sticker = Sticker {
            id: sticker_id(),
            description: description.to_string(),
            preview_url: preview_url.trim().to_string(),
            image_url: image_url.trim().to_string(),
            created_at: Utc::now(),
        };
        owner.stickers.push(sticker.clone());
        owner.updated_at = Utc::now();
        let collection = owner.stickers.clone();
        self.changed();

        tracing::debug!(user = %user, sticker = %sticker.id, "sticker added");
        Ok((sticker, collection))
    }

    /// Remove one sticker, returning the remaining collection.
    pub async fn remove_sticker(&self, user: UserId, sticker_id: &str) -> Result<Vec<Sticker>> {
        let mut state = self.write().await;
        let owner = state.users.get_mut(&user).ok_or(StoreError::NotFound)?;
        let index = owner
            .stickers
            .iter()
            .position(|s| s.id == sticker_id)
            .ok_or(StoreError::NotFound)?;

        owner.stickers.remove(index);
        owner.updated_at = Utc::now();
        let collection = owner.stickers.clone();
        self.changed();
        Ok(collection)
    }

    pub async fn stickers(&self, user: UserId) -> Result<Vec<Sticker>> {
        self.read()
            .await
            .users
            .get(&user)
            .map(|u| u.stickers.clone())
            .ok_or(StoreError::NotFound)
    }
}
