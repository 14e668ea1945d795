//! User directory: account creation, profile updates, email verification and
//! password-reset codes.
//!
//! Credential hashing and email delivery happen outside the store; this module
//! only keeps the state those flows need and enforces expiry.

use agora_shared::constants::{MAX_DISPLAY_NAME_CHARS, MAX_RESET_ATTEMPTS, RESET_CODE_DIGITS};
use agora_shared::UserId;
use chrono::{DateTime, Duration, Utc};
use rand::{Rng, RngCore};
use subtle::ConstantTimeEq;

use crate::error::{Result, StoreError};
use crate::models::{Avatar, PasswordReset, User};
use crate::store::Store;

/// Normalize a display name, rejecting empty or over-long ones.
pub fn validate_display_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::Validation("display name is empty".into()));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(StoreError::Validation(format!(
            "display name longer than {MAX_DISPLAY_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(StoreError::Validation("malformed email".into())),
    }
}

/// 32 random bytes, hex encoded.
pub(crate) fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn hash_reset_code(email: &str, code: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(email.as_bytes());
    hasher.update(b":");
    hasher.update(code.as_bytes());
    hasher.finalize().to_hex().to_string()
}

impl Store {
    /// Create an account. The email must be unused.
    pub async fn create_user(
        &self,
        email: &str,
        display_name: &str,
        credential_hash: &str,
    ) -> Result<User> {
        let email = normalize_email(email)?;
        let display_name = validate_display_name(display_name)?;

        let mut state = self.write().await;
        if state.users.values().any(|u| u.email == email) {
            return Err(StoreError::Conflict(format!("email {email} already registered")));
        }

        let now = Utc::now();
        let user = User {
            id: state.allocate_user_id(),
            email,
            display_name,
            credential_hash: credential_hash.to_string(),
            avatar: Avatar::default(),
            verified: false,
            verification_token: None,
            verification_expires_at: None,
            password_reset: None,
            stickers: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        state.users.insert(user.id, user.clone());
        self.changed();

        tracing::info!(user = %user.id, "user created");
        Ok(user)
    }

    pub async fn user(&self, id: UserId) -> Option<User> {
        self.read().await.users.get(&id).cloned()
    }

    pub async fn user_by_email(&self, email: &str) -> Option<User> {
        let email = email.trim().to_lowercase();
        self.read()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned()
    }

    /// All users, ordered by id.
    pub async fn users(&self) -> Vec<User> {
        self.read().await.users.values().cloned().collect()
    }

    /// Change display name and/or avatar.
    pub async fn update_profile(
        &self,
        id: UserId,
        display_name: Option<&str>,
        avatar: Option<Avatar>,
    ) -> Result<User> {
        let display_name = display_name.map(validate_display_name).transpose()?;

        let mut state = self.write().await;
        let user = state.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(name) = display_name {
            user.display_name = name;
        }
        if let Some(avatar) = avatar {
            user.avatar = avatar;
        }
        user.updated_at = Utc::now();
        let updated = user.clone();
        self.changed();
        Ok(updated)
    }

    /// Mark a user verified without the email round trip (admin path).
    pub async fn set_verified(&self, id: UserId, verified: bool) -> Result<User> {
        let mut state = self.write().await;
        let user = state.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        user.verified = verified;
        user.verification_token = None;
        user.verification_expires_at = None;
        user.updated_at = Utc::now();
        let updated = user.clone();
        self.changed();
        Ok(updated)
    }

    /// Issue a fresh one-time verification token, replacing any previous one.
    pub async fn issue_verification(&self, id: UserId, ttl: Duration) -> Result<String> {
        let token = random_token();
        let mut state = self.write().await;
        let user = state.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        user.verification_token = Some(token.clone());
        user.verification_expires_at = Some(Utc::now() + ttl);
        user.updated_at = Utc::now();
        self.changed();
        Ok(token)
    }

    /// Consume a verification token. Expired tokens are cleared and rejected.
    pub async fn verify_email(&self, token: &str, now: DateTime<Utc>) -> Result<User> {
        let token = token.trim();
        if token.is_empty() {
            return Err(StoreError::NotFound);
        }

        let mut state = self.write().await;
        let user = state
            .users
            .values_mut()
            .find(|u| u.verification_token.as_deref() == Some(token))
            .ok_or(StoreError::NotFound)?;

        let expired = user.verification_expires_at.map_or(true, |exp| exp <= now);
        user.verification_token = None;
        user.verification_expires_at = None;
        if !expired {
            user.verified = true;
            user.updated_at = now;
        }
        let updated = user.clone();
        self.changed();

        if expired {
            return Err(StoreError::Expired);
        }
        tracing::info!(user = %updated.id, "email verified");
        Ok(updated)
    }

    /// Start a password reset: returns the plain 6-digit code for the mailer,
    /// keeps only its hash.
    pub async fn issue_reset_code(&self, email: &str, ttl: Duration) -> Result<String> {
        let email = email.trim().to_lowercase();
        let code: String = {
            let mut rng = rand::thread_rng();
            (0..RESET_CODE_DIGITS)
                .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
                .collect()
        };

        let mut state = self.write().await;
        let user = state
            .users
            .values_mut()
            .find(|u| u.email == email)
            .ok_or(StoreError::NotFound)?;
        user.password_reset = Some(PasswordReset {
            code_hash: hash_reset_code(&email, &code),
            expires_at: Utc::now() + ttl,
            failed_attempts: 0,
        });
        self.changed();
        Ok(code)
    }

    /// Finish a password reset by swapping in a new credential hash.
    pub async fn consume_reset_code(
        &self,
        email: &str,
        code: &str,
        new_credential_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<User> {
        let email = email.trim().to_lowercase();
        let mut state = self.write().await;
        let user = state
            .users
            .values_mut()
            .find(|u| u.email == email)
            .ok_or(StoreError::NotFound)?;
        let reset = user.password_reset.as_mut().ok_or(StoreError::NotFound)?;

        if reset.expires_at <= now {
            user.password_reset = None;
            self.changed();
            return Err(StoreError::Expired);
        }
        let candidate = hash_reset_code(&email, code.trim());
        let matches: bool = reset.code_hash.as_bytes().ct_eq(candidate.as_bytes()).into();
        if !matches {
            reset.failed_attempts += 1;
            if reset.failed_attempts >= MAX_RESET_ATTEMPTS {
                tracing::warn!(user = %user.id, "too many wrong reset codes, reset discarded");
                user.password_reset = None;
            }
            self.changed();
            return Err(StoreError::PermissionDenied);
        }

        user.password_reset = None;
        user.credential_hash = new_credential_hash.to_string();
        user.updated_at = now;
        let updated = user.clone();
        self.changed();
        Ok(updated)
    }

    /// Remove an account. Its messages stay in the log.
    pub async fn delete_user(&self, id: UserId) -> Result<User> {
        let mut state = self.write().await;
        let user = state.users.remove(&id).ok_or(StoreError::NotFound)?;
        self.changed();
        tracing::info!(user = %id, "user deleted");
        Ok(user)
    }

    /// First user whose display name matches `name`, ignoring case and
    /// surrounding whitespace.
    pub async fn user_by_display_name(&self, name: &str) -> Option<User> {
        let wanted = name.trim().to_lowercase();
        if wanted.is_empty() {
            return None;
        }
        self.read()
            .await
            .users
            .values()
            .find(|u| u.display_name.trim().to_lowercase() == wanted)
            .cloned()
    }
}
