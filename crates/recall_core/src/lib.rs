//! # Recall Core
//!
//! On-disk state for the recall sync server.
//!
//! This crate provides:
//! - The per-user collection store (SQLite, WAL-journaled)
//! - The schema compatibility layer spanning collection versions V11–V18
//! - The media change log, file bag and batch archive codec
//! - The persistent session store
//! - The identity gateway trait and its built-in implementations

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod collection;
pub mod error;
pub mod media;
pub mod schema;
pub mod session;
pub mod store;

pub use auth::{AcceptAll, IdentityGateway, SqliteGateway};
pub use collection::Collection;
pub use error::{CoreError, CoreResult};
pub use schema::SchemaVersion;
pub use session::{Session, SessionStore};
pub use store::{CollectionHandle, UserStore};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in seconds.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
