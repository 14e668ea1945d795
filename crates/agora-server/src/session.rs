//! Session tokens: opaque bearer strings mapping to a user id until they
//! expire. Credential checks happen before a token is issued and are not
//! this module's concern.

use std::collections::HashMap;
use std::time::Duration;

use agora_shared::UserId;
use rand::RngCore;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Session {
    user: UserId,
    expires_at: Instant,
}

pub struct SessionTable {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Issue a fresh token for `user`.
    pub async fn issue(&self, user: UserId) -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        self.sessions.lock().await.insert(
            token.clone(),
            Session {
                user,
                expires_at: Instant::now() + self.ttl,
            },
        );
        debug!(user = %user, "session issued");
        token
    }

    /// The user a token belongs to. Expired tokens are evicted on sight.
    pub async fn resolve(&self, token: &str) -> Option<UserId> {
        let mut sessions = self.sessions.lock().await;
        let session = *sessions.get(token)?;
        if session.expires_at <= Instant::now() {
            sessions.remove(token);
            return None;
        }
        Some(session.user)
    }

    #[cfg(test)]
    pub async fn revoke(&self, token: &str) -> bool {
        self.sessions.lock().await.remove(token).is_some()
    }

    /// Drop every session belonging to `user`, e.g. after account deletion.
    pub async fn revoke_user(&self, user: UserId) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.user != user);
        before - sessions.len()
    }

    /// Evict expired sessions; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
