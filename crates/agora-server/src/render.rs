//! Turns stored messages into the views clients receive.
//!
//! Author and reply-target profiles are looked up at render time, never
//! copied into the stored message, so renamed users show their current name
//! on old messages.

use agora_shared::constants::APP_NAME;
use agora_shared::protocol::{ChatMessageView, ReplyPreview};
use agora_store::{Mentions, Message, Store};

use crate::presence::PresenceRegistry;

/// Label for replies whose author account no longer exists.
pub const DELETED_USER: &str = "Deleted user";

const EXCERPT_CHARS: usize = 120;

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escaped HTML for `text`: newlines become `<br>`, resolved mentions are
/// wrapped in a `mention` span carrying the user id.
pub fn render_html(text: &str, mentions: &Mentions) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut word_start = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(start) = word_start.take() {
                push_word(&mut out, &text[start..i], mentions);
            }
            match c {
                '\n' => out.push_str("<br>"),
                '\r' => {}
                _ => out.push(c),
            }
        } else if word_start.is_none() {
            word_start = Some(i);
        }
    }
    if let Some(start) = word_start {
        push_word(&mut out, &text[start..], mentions);
    }
    out
}

fn push_word(out: &mut String, word: &str, mentions: &Mentions) {
    if let Some((prefix, name)) = word.split_once('@') {
        if let Some(id) = mentions.lookup(name).filter(|_| !name.is_empty()) {
            out.push_str(&escape_html(prefix));
            out.push_str(&format!(
                r#"<span class="mention" data-user-id="{id}">@{}</span>"#,
                escape_html(name)
            ));
            return;
        }
    }
    out.push_str(&escape_html(word));
}

fn excerpt(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Render `message`. `mentions` may be passed when already resolved (fresh
/// sends); otherwise they are resolved against the current directory.
pub async fn render_message(
    store: &Store,
    presence: &PresenceRegistry,
    message: &Message,
    mentions: Option<&Mentions>,
) -> ChatMessageView {
    let author = match message.author_id {
        Some(id) => match store.user(id).await {
            Some(user) => Some(user.summary()),
            None => presence.summary_of(id).await,
        },
        None => None,
    };

    let reply_to = match message.reply_to {
        Some(target) => reply_preview(store, presence, target).await,
        None => None,
    };

    if message.deleted {
        return ChatMessageView {
            id: message.id,
            author,
            content: String::new(),
            html: String::new(),
            time: message.created_at,
            reply_to,
            deleted: true,
            mentions: Vec::new(),
        };
    }

    let resolved;
    let mentions = match (mentions, message.author_id) {
        (Some(m), _) => m,
        (None, Some(author)) => {
            resolved = store.resolve_mentions(&message.content, author).await;
            &resolved
        }
        (None, None) => {
            resolved = Mentions::default();
            &resolved
        }
    };

    ChatMessageView {
        id: message.id,
        author,
        content: message.content.clone(),
        html: render_html(&message.content, mentions),
        time: message.created_at,
        reply_to,
        deleted: false,
        mentions: mentions.ordered_ids.clone(),
    }
}

async fn reply_preview(
    store: &Store,
    presence: &PresenceRegistry,
    target: agora_shared::MessageId,
) -> Option<ReplyPreview> {
    let original = store.message(target).await?;

    let (author_name, avatar_url) = match original.author_id {
        Some(id) => match store.user(id).await {
            Some(user) => (user.display_name, Some(user.avatar.url)),
            None => match presence.summary_of(id).await {
                Some(stale) => (stale.display_name, Some(stale.avatar_url)),
                None => (DELETED_USER.to_string(), None),
            },
        },
        None => (APP_NAME.to_string(), None),
    };

    Some(ReplyPreview {
        id: original.id,
        author_name,
        avatar_url,
        excerpt: if original.deleted {
            String::new()
        } else {
            excerpt(&original.content)
        },
        deleted: original.deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use agora_shared::{ConnectionId, UserId};
    use agora_store::{MemoryBackend, StoreConfig};
    use chrono::Utc;

    async fn store() -> Store {
        Store::open(Arc::new(MemoryBackend::new()), StoreConfig::default())
            .await
            .unwrap()
    }

    fn mentions(pairs: &[(&str, u64)]) -> Mentions {
        Mentions {
            ordered_ids: pairs.iter().map(|(_, id)| UserId(*id)).collect(),
            names: pairs
                .iter()
                .map(|(name, id)| (name.to_lowercase(), UserId(*id)))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn test_escape() {
        assert_eq!(
            escape_html(r#"<b>"Tom" & 'Jerry'</b>"#),
            "&lt;b&gt;&quot;Tom&quot; &amp; &#39;Jerry&#39;&lt;/b&gt;"
        );
    }

    #[test]
    fn test_newlines_and_mentions() {
        let html = render_html("hi @Bob\nand @nobody <3", &mentions(&[("bob", 2)]));
        assert_eq!(
            html,
            r#"hi <span class="mention" data-user-id="2">@Bob</span><br>and @nobody &lt;3"#
        );
    }

    #[test]
    fn test_mention_markup_is_escaped() {
        let html = render_html("(@<b>", &mentions(&[("<b>", 5)]));
        assert_eq!(
            html,
            r#"(<span class="mention" data-user-id="5">@&lt;b&gt;</span>"#
        );
    }

    #[test]
    fn test_excerpt_is_truncated() {
        assert_eq!(excerpt("short"), "short");
        let long = "x".repeat(EXCERPT_CHARS + 10);
        let cut = excerpt(&long);
        assert_eq!(cut.chars().count(), EXCERPT_CHARS + 1);
        assert!(cut.ends_with('…'));
    }

    #[tokio::test]
    async fn test_reply_preview_follows_renames() {
        let store = store().await;
        let presence = PresenceRegistry::new();
        let ada = store.create_user("a@example.com", "Ada", "h").await.unwrap();
        let original = store.append_message(Some(ada.id), "first", Utc::now(), None).await;
        let reply = store
            .append_message(Some(ada.id), "second", Utc::now(), Some(original.id))
            .await;

        store.update_profile(ada.id, Some("Ada L."), None).await.unwrap();
        let view = render_message(&store, &presence, &reply, None).await;
        let preview = view.reply_to.unwrap();
        assert_eq!(preview.author_name, "Ada L.");
        assert_eq!(preview.excerpt, "first");
        assert_eq!(view.author.unwrap().display_name, "Ada L.");
    }

    #[tokio::test]
    async fn test_deleted_author_and_deleted_target() {
        let store = store().await;
        let presence = PresenceRegistry::new();
        let ada = store.create_user("a@example.com", "Ada", "h").await.unwrap();
        let bob = store.create_user("b@example.com", "Bob", "h").await.unwrap();
        let gone = store.append_message(Some(ada.id), "bye", Utc::now(), None).await;
        let removed = store.append_message(Some(bob.id), "oops", Utc::now(), None).await;
        store.soft_delete_message(removed.id, bob.id).await.unwrap();
        store.delete_user(ada.id).await.unwrap();

        let reply = store
            .append_message(Some(bob.id), "re", Utc::now(), Some(gone.id))
            .await;
        let preview = render_message(&store, &presence, &reply, None)
            .await
            .reply_to
            .unwrap();
        assert_eq!(preview.author_name, DELETED_USER);
        assert_eq!(preview.avatar_url, None);

        let reply = store
            .append_message(Some(bob.id), "re", Utc::now(), Some(removed.id))
            .await;
        let preview = render_message(&store, &presence, &reply, None)
            .await
            .reply_to
            .unwrap();
        assert!(preview.deleted);
        assert_eq!(preview.excerpt, "");
    }

    #[tokio::test]
    async fn test_stale_profile_from_presence() {
        let store = store().await;
        let presence = PresenceRegistry::new();
        let ada = store.create_user("a@example.com", "Ada", "h").await.unwrap();
        presence.register(ada.summary(), ConnectionId::new()).await;
        let msg = store.append_message(Some(ada.id), "hi", Utc::now(), None).await;
        store.delete_user(ada.id).await.unwrap();

        let reply = store
            .append_message(None, "re", Utc::now(), Some(msg.id))
            .await;
        let preview = render_message(&store, &presence, &reply, None)
            .await
            .reply_to
            .unwrap();
        assert_eq!(preview.author_name, "Ada");
    }

    #[tokio::test]
    async fn test_deleted_message_renders_empty() {
        let store = store().await;
        let presence = PresenceRegistry::new();
        let ada = store.create_user("a@example.com", "Ada", "h").await.unwrap();
        let msg = store.append_message(Some(ada.id), "secret", Utc::now(), None).await;
        store.soft_delete_message(msg.id, ada.id).await.unwrap();
        let stored = store.message(msg.id).await.unwrap();

        let view = render_message(&store, &presence, &stored, None).await;
        assert!(view.deleted);
        assert_eq!(view.content, "");
        assert_eq!(view.html, "");
    }
}
