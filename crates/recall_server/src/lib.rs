//! # Recall Sync Server
//!
//! HTTP surface and sync engines for the recall server.
//!
//! This crate provides:
//! - The transport shim: header contract, zstd bodies, error mapping
//! - The session registry endpoints and per-user serialization
//! - The collection sync state machine (`/sync/`)
//! - The media sync engine (`/msync/`)
//! - Server configuration and the binary entry point

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod full_sync;
pub mod media;
pub mod routes;
pub mod server;
pub mod state;
pub mod sync;
pub mod transport;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use state::ServerState;
