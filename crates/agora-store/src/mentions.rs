//! `@name` mention resolution against the user directory.

use std::collections::HashMap;

use agora_shared::UserId;

use crate::store::Store;

/// Users mentioned by a message, in the order their names first appear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mentions {
    pub ordered_ids: Vec<UserId>,
    /// Lowercased, trimmed mention token to the user it resolved to.
    pub names: HashMap<String, UserId>,
}

impl Mentions {
    pub fn is_empty(&self) -> bool {
        self.ordered_ids.is_empty()
    }

    /// The user a raw `@token` (without the `@`) resolved to, if any.
    pub fn lookup(&self, token: &str) -> Option<UserId> {
        self.names.get(&token.trim().to_lowercase()).copied()
    }
}

/// Mention tokens in `text`, left to right: for every whitespace-delimited
/// word containing `@`, the non-empty run after its first `@`.
pub fn mention_tokens(text: &str) -> Vec<&str> {
    text.split_whitespace()
        .filter_map(|word| {
            let (_, name) = word.split_once('@')?;
            (!name.is_empty()).then_some(name)
        })
        .collect()
}

impl Store {
    /// Resolve the `@name` tokens in `text`. Each distinct name appears at
    /// most once, at its first occurrence; the sender is never included.
    pub async fn resolve_mentions(&self, text: &str, sender: UserId) -> Mentions {
        let tokens = mention_tokens(text);
        if tokens.is_empty() {
            return Mentions::default();
        }

        let state = self.read().await;
        let mut by_name: HashMap<String, UserId> = HashMap::new();
        for user in state.users.values() {
            // Lowest id wins on duplicate display names.
            by_name
                .entry(user.display_name.trim().to_lowercase())
                .or_insert(user.id);
        }
        drop(state);

        let mut mentions = Mentions::default();
        for token in tokens {
            let key = token.trim().to_lowercase();
            if mentions.names.contains_key(&key) {
                continue;
            }
            let Some(&id) = by_name.get(&key) else {
                continue;
            };
            if id == sender {
                continue;
            }
            if !mentions.ordered_ids.contains(&id) {
                mentions.ordered_ids.push(id);
            }
            mentions.names.insert(key, id);
        }
        mentions
    }
}
