//! # agora-shared
//!
//! Types shared between the Agora store and server: limits and defaults,
//! numeric id newtypes, the reason-code taxonomy returned to clients, and the
//! JSON event protocol spoken over each live connection.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::Reason;
pub use types::{ConnectionId, FileId, MessageId, UserId};
