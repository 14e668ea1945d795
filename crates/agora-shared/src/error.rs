use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured reason code returned to a client instead of an error crossing
/// the connection boundary.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    #[error("not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("limit reached")]
    LimitReached,

    #[error("expired")]
    Expired,

    #[error("validation failed")]
    ValidationFailed,

    #[error("authentication required")]
    Unauthenticated,

    #[error("already exists")]
    Conflict,

    #[error("rate limited")]
    RateLimited,
}

impl Reason {
    /// Wire form of the reason code (`"not_found"`, `"limit_reached"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::NotFound => "not_found",
            Reason::PermissionDenied => "permission_denied",
            Reason::LimitReached => "limit_reached",
            Reason::Expired => "expired",
            Reason::ValidationFailed => "validation_failed",
            Reason::Unauthenticated => "unauthenticated",
            Reason::Conflict => "conflict",
            Reason::RateLimited => "rate_limited",
        }
    }
}
