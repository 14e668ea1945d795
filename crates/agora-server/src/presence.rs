//! Who is online.
//!
//! Each online user has an entry holding their live connections and at most
//! one pending departure. A user is online while the set is non-empty or a
//! departure is pending; the entry is discarded only when a departure
//! expires with the set still empty.
//!
//! ```text
//! OFFLINE --register--> ONLINE --last unregister--> GRACE --expire--> OFFLINE
//!                         ^                           |
//!                         +---------register----------+   (no events)
//! ```

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use agora_shared::protocol::UserSummary;
use agora_shared::{ConnectionId, UserId};
use tokio::sync::Mutex;
use tracing::{debug, info};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Identifies one pending departure. A departure whose token no longer
/// matches the entry was cancelled by a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepartureToken(u64);

/// Outcome of [`PresenceRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registered {
    /// The user went from fully offline to online with this connection.
    pub is_first_connection: bool,
}

#[derive(Debug)]
struct Entry {
    summary: UserSummary,
    connections: HashSet<ConnectionId>,
    pending: Option<DepartureToken>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<UserId, Entry>,
    next_token: u64,
}

#[derive(Default)]
pub struct PresenceRegistry {
    inner: Mutex<Inner>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection for `summary.id`, cancelling any pending departure.
    /// The cached summary is refreshed so the roster shows the current
    /// profile.
    pub async fn register(&self, summary: UserSummary, conn: ConnectionId) -> Registered {
        let mut inner = self.inner.lock().await;
        let user = summary.id;
        match inner.entries.get_mut(&user) {
            Some(entry) => {
                if entry.pending.take().is_some() {
                    debug!(user = %user, "reconnected within grace period");
                }
                entry.summary = summary;
                entry.connections.insert(conn);
                Registered {
                    is_first_connection: false,
                }
            }
            None => {
                inner.entries.insert(
                    user,
                    Entry {
                        summary,
                        connections: HashSet::from([conn]),
                        pending: None,
                    },
                );
                info!(user = %user, "user online");
                Registered {
                    is_first_connection: true,
                }
            }
        }
    }

    /// Remove a connection. When it was the user's last one, a departure is
    /// armed and its token returned; the caller schedules
    /// [`PresenceRegistry::expire`] after the grace period.
    pub async fn unregister(&self, user: UserId, conn: ConnectionId) -> Option<DepartureToken> {
        let mut inner = self.inner.lock().await;
        let token = DepartureToken(inner.next_token);
        let entry = inner.entries.get_mut(&user)?;
        if !entry.connections.remove(&conn) || !entry.connections.is_empty() {
            return None;
        }

        entry.pending = Some(token);
        inner.next_token += 1;
        debug!(user = %user, "last connection dropped, grace period started");
        Some(token)
    }

    /// Complete a departure. Returns the departed user's summary if `token`
    /// is still the pending one and no connection came back; otherwise the
    /// departure was cancelled and nothing changes.
    pub async fn expire(&self, user: UserId, token: DepartureToken) -> Option<UserSummary> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.get(&user)?;
        if entry.pending != Some(token) || !entry.connections.is_empty() {
            return None;
        }
        let entry = inner.entries.remove(&user)?;
        info!(user = %user, "user offline");
        Some(entry.summary)
    }

    /// Online users sorted by display name.
    pub async fn snapshot(&self) -> Vec<UserSummary> {
        let inner = self.inner.lock().await;
        let mut roster: Vec<UserSummary> =
            inner.entries.values().map(|e| e.summary.clone()).collect();
        roster.sort_by(compare_names);
        roster
    }

    /// Distinct online users, not connections.
    pub async fn online_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    #[cfg(test)]
    pub async fn is_online(&self, user: UserId) -> bool {
        self.inner.lock().await.entries.contains_key(&user)
    }

    /// Last known profile of an online user.
    pub async fn summary_of(&self, user: UserId) -> Option<UserSummary> {
        self.inner
            .lock()
            .await
            .entries
            .get(&user)
            .map(|e| e.summary.clone())
    }
}

/// Base letters with accents stripped and case folded: `Émile` sorts as
/// `emile`.
fn collation_key(name: &str) -> String {
    name.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Base letters first, then accents and case, then exact name, then id for
/// stability.
fn compare_names(a: &UserSummary, b: &UserSummary) -> Ordering {
    collation_key(&a.display_name)
        .cmp(&collation_key(&b.display_name))
        .then_with(|| {
            let (a, b) = (a.display_name.to_lowercase(), b.display_name.to_lowercase());
            a.nfd().cmp(b.nfd())
        })
        .then_with(|| a.display_name.cmp(&b.display_name))
        .then_with(|| a.id.cmp(&b.id))
}
