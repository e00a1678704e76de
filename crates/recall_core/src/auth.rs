//! The identity gateway: credentials in, stable user key out.
//!
//! The sync server never stores passwords itself; it asks a gateway to
//! turn `(username, password)` into an opaque user key or reject the
//! attempt. Two gateways ship in-tree: a SQLite-backed one with salted
//! SHA-256 digests, and an accept-all gateway for development setups.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use uuid::Uuid;

/// Length of the hex-encoded salt appended to stored digests.
const SALT_LEN: usize = 16;

/// Translates credentials into a stable user key.
pub trait IdentityGateway: Send + Sync {
    /// Returns the user key on success, `None` on bad credentials, and an
    /// error only when the gateway itself is unavailable.
    fn authenticate(&self, username: &str, password: &str) -> CoreResult<Option<String>>;
}

/// Development gateway: accepts any password and uses the username itself
/// as the user key.
pub struct AcceptAll;

impl IdentityGateway for AcceptAll {
    fn authenticate(&self, username: &str, _password: &str) -> CoreResult<Option<String>> {
        if username.is_empty() {
            return Ok(None);
        }
        Ok(Some(username.to_string()))
    }
}

/// SQLite-backed gateway.
///
/// Stored digest format: `sha256_hex(username + password + salt) + salt`,
/// with the salt being the trailing 16 hex characters.
pub struct SqliteGateway {
    conn: Mutex<Connection>,
}

impl SqliteGateway {
    /// Opens (or creates) the credential database at `path`.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| CoreError::GatewayUnavailable(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS auth (
                username TEXT NOT NULL PRIMARY KEY,
                hash     TEXT NOT NULL,
                user_key TEXT NOT NULL
            )",
        )
        .map_err(|e| CoreError::GatewayUnavailable(e.to_string()))?;
        Ok(SqliteGateway {
            conn: Mutex::new(conn),
        })
    }

    /// Provisions (or re-keys) a user, returning their stable key.
    pub fn add_user(&self, username: &str, password: &str) -> CoreResult<String> {
        let mut salt_bytes = [0u8; SALT_LEN / 2];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = hex::encode(salt_bytes);
        let hash = Self::digest(username, password, &salt) + &salt;

        let conn = self.conn.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT user_key FROM auth WHERE username = ?1",
                params![username],
                |r| r.get(0),
            )
            .optional()?;
        let user_key = existing.unwrap_or_else(|| Uuid::new_v4().to_string());
        conn.execute(
            "INSERT OR REPLACE INTO auth (username, hash, user_key) VALUES (?1, ?2, ?3)",
            params![username, hash, user_key],
        )?;
        Ok(user_key)
    }

    /// Removes a user's credentials.
    pub fn remove_user(&self, username: &str) -> CoreResult<bool> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM auth WHERE username = ?1", params![username])?;
        Ok(removed > 0)
    }

    fn digest(username: &str, password: &str, salt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update(password.as_bytes());
        hasher.update(salt.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl IdentityGateway for SqliteGateway {
    fn authenticate(&self, username: &str, password: &str) -> CoreResult<Option<String>> {
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT hash, user_key FROM auth WHERE username = ?1",
                params![username],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| CoreError::GatewayUnavailable(e.to_string()))?;

        let Some((stored, user_key)) = row else {
            return Ok(None);
        };
        if stored.len() <= SALT_LEN {
            return Ok(None);
        }
        let salt = &stored[stored.len() - SALT_LEN..];
        let expected = Self::digest(username, password, salt) + salt;
        if expected == stored {
            Ok(Some(user_key))
        } else {
            Ok(None)
        }
    }
}
