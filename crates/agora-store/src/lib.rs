//! # agora-store
//!
//! Durable state for the Agora chat backend.
//!
//! The authoritative state (users, messages, files and their id counters)
//! lives in memory behind a single [`Store`] handle; every mutation updates it
//! synchronously so later reads observe it immediately, then schedules a
//! debounced write-behind flush of the whole document to a
//! [`SnapshotBackend`] (SQLite in production, memory in tests).
//!
//! Domain operations are grouped per concern as `impl Store` blocks:
//! [`messages`] (the append-only message log), [`users`] (the user
//! directory), [`mentions`], [`stickers`] and [`files`].

pub mod backend;
pub mod database;
pub mod document;
pub mod files;
pub mod mentions;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod stickers;
pub mod store;
pub mod users;

mod error;
mod write_behind;

pub use backend::{MemoryBackend, SnapshotBackend};
pub use database::Database;
pub use error::{Result, StoreError};
pub use files::{CodeSource, NewFile, RandomCodes};
pub use mentions::Mentions;
pub use messages::SoftDeleted;
pub use models::*;
pub use store::{Store, StoreConfig};
