//! The persistent session registry.
//!
//! Sessions live in a small SQLite database adjacent to the user data so a
//! server restart does not log every client out. A session binds a random
//! key to a user and the host identifier the client chose for the device.

use crate::error::CoreResult;
use crate::now_secs;
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// One authenticated client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// The session key presented on every request.
    pub skey: String,
    /// Stable user key from the identity gateway.
    pub user: String,
    /// Display name the user logged in with.
    pub name: String,
    /// Client-chosen host identifier.
    pub host: String,
    /// Creation time, Unix seconds.
    pub created_at: i64,
}

/// Durable session storage.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Opens (or creates) the session database at `path`.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS session (
                skey       TEXT NOT NULL PRIMARY KEY,
                user       TEXT NOT NULL,
                name       TEXT NOT NULL,
                host       TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )?;
        Ok(SessionStore {
            conn: Mutex::new(conn),
        })
    }

    /// Mints a fresh session key: 128 bits of OS randomness, hex-encoded.
    pub fn mint_key() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Creates and persists a session for `user` on `host`.
    pub fn create(&self, user: &str, name: &str, host: &str) -> CoreResult<Session> {
        let session = Session {
            skey: Self::mint_key(),
            user: user.to_string(),
            name: name.to_string(),
            host: host.to_string(),
            created_at: now_secs(),
        };
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO session (skey, user, name, host, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.skey,
                session.user,
                session.name,
                session.host,
                session.created_at
            ],
        )?;
        Ok(session)
    }

    /// Looks a session up by key.
    pub fn resolve(&self, skey: &str) -> CoreResult<Option<Session>> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                "SELECT skey, user, name, host, created_at FROM session WHERE skey = ?1",
                params![skey],
                |r| {
                    Ok(Session {
                        skey: r.get(0)?,
                        user: r.get(1)?,
                        name: r.get(2)?,
                        host: r.get(3)?,
                        created_at: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    /// Deletes one session.
    pub fn delete(&self, skey: &str) -> CoreResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM session WHERE skey = ?1", params![skey])?;
        Ok(())
    }

    /// Deletes every session bound to `user`. Used by external purge
    /// tooling through the library interface.
    pub fn delete_user(&self, user: &str) -> CoreResult<usize> {
        Ok(self
            .conn
            .lock()
            .execute("DELETE FROM session WHERE user = ?1", params![user])?)
    }
}
