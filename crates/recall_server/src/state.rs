//! Shared server state: session registry, collection cache, per-user
//! locks and active sync contexts.
//!
//! Concurrency model: the HTTP layer runs many users in parallel, but
//! within one user everything is single-writer. Each request takes the
//! user's operation lock with `try_lock` — a second simultaneous request
//! for the same user is refused as busy instead of queueing. The sync
//! context spans several requests; it is keyed by session so a different
//! device of the same user cannot interleave with an open transaction.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use parking_lot::{Mutex, MutexGuard};
use recall_core::{
    AcceptAll, CollectionHandle, CoreResult, IdentityGateway, Session, SessionStore,
    SqliteGateway, UserStore,
};
use recall_proto::{Changes, Row, SyncHeader, TableKind};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

/// A sync context abandoned for this long is discarded when another
/// device of the same user wants in.
pub const SYNC_CONTEXT_TIMEOUT_SECS: u64 = 300;

/// Where the sync transaction currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Rows and graves are being exchanged.
    Streaming,
    /// The sanity check passed; only `finish` or `abort` may follow.
    Checked,
}

/// Server-side state of one in-flight sync transaction.
pub struct SyncContext {
    /// The session that opened the context.
    pub skey: String,
    /// Current phase.
    pub phase: SyncPhase,
    /// Lowest server USN the client has not seen.
    pub min_usn: i64,
    /// USN stamped onto every record written in this transaction.
    pub max_usn: i64,
    /// True when the server collection `mod` was the newer side.
    pub server_newer: bool,
    /// `(grave kind code, object id)` pairs tombstoned in this
    /// transaction; these ids must not be re-created before commit.
    pub graved: HashSet<(i64, i64)>,
    /// Snapshot of server rows pending download, drained chunk by chunk.
    pub pending: VecDeque<(TableKind, VecDeque<Row>)>,
    /// Snapshot of the server's small-object bundle, taken at `start`.
    pub server_changes: Option<Changes>,
    /// When the context was opened.
    pub opened: Instant,
}

impl SyncContext {
    /// True when the owning client has gone quiet past the timeout.
    pub fn is_stale(&self) -> bool {
        self.opened.elapsed().as_secs() > SYNC_CONTEXT_TIMEOUT_SECS
    }
}

/// Per-user serialization state.
pub struct UserState {
    /// Operation lock: held for the duration of one request's engine work.
    pub op_lock: Mutex<()>,
    /// The active sync context, if any.
    pub sync: Mutex<Option<SyncContext>>,
    handle: Mutex<Option<CollectionHandle>>,
}

/// Shared application state.
pub struct ServerState {
    /// Active configuration.
    pub config: ServerConfig,
    /// Durable session registry.
    pub sessions: SessionStore,
    /// The identity gateway in use.
    pub gateway: Box<dyn IdentityGateway>,
    /// Per-user data root.
    pub store: UserStore,
    users: Mutex<HashMap<String, Arc<UserState>>>,
}

impl ServerState {
    /// Builds the state from configuration, opening the data root and the
    /// session store.
    pub fn new(config: ServerConfig) -> CoreResult<Self> {
        let store = UserStore::open(&config.data_root)?;
        let sessions = SessionStore::open(&config.session_db_path())?;
        let gateway: Box<dyn IdentityGateway> = match &config.auth_db {
            Some(path) => Box::new(SqliteGateway::open(path)?),
            None => {
                tracing::warn!(
                    "no credential database configured; accepting any password"
                );
                Box::new(AcceptAll)
            }
        };
        Ok(ServerState {
            config,
            sessions,
            gateway,
            store,
            users: Mutex::new(HashMap::new()),
        })
    }

    /// Returns (creating on first use) the per-user state.
    pub fn user_state(&self, user: &str) -> Arc<UserState> {
        self.users
            .lock()
            .entry(user.to_string())
            .or_insert_with(|| {
                Arc::new(UserState {
                    op_lock: Mutex::new(()),
                    sync: Mutex::new(None),
                    handle: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Takes the user's operation lock, refusing with busy when another
    /// request for the same user is in flight.
    pub fn try_lock_user<'a>(
        &self,
        user_state: &'a UserState,
    ) -> ServerResult<MutexGuard<'a, ()>> {
        user_state.op_lock.try_lock().ok_or(ServerError::Busy)
    }

    /// Returns a cached collection handle for `user`, opening the slot on
    /// first use. The cache keeps the collection open across requests;
    /// the last handle to drop checkpoints and closes it.
    pub fn collection(&self, user: &str) -> CollectionHandle {
        let user_state = self.user_state(user);
        let mut cached = user_state.handle.lock();
        cached
            .get_or_insert_with(|| self.store.handle(user))
            .clone()
    }

    /// Resolves the session key in `header`.
    pub fn resolve_session(&self, header: &SyncHeader) -> ServerResult<Session> {
        if header.k.is_empty() {
            return Err(ServerError::Unauthorized);
        }
        match self.sessions.resolve(&header.k)? {
            Some(session) => Ok(session),
            None => Err(ServerError::Unauthorized),
        }
    }

    /// Ensures no other device's sync transaction is active, discarding
    /// this session's own leftover context or a stale foreign one.
    pub fn claim_exclusive(
        &self,
        user_state: &UserState,
        handle: &CollectionHandle,
        skey: &str,
    ) -> ServerResult<()> {
        let foreign_fresh = {
            let slot = user_state.sync.lock();
            matches!(slot.as_ref(), Some(ctx) if ctx.skey != skey && !ctx.is_stale())
        };
        if foreign_fresh {
            return Err(ServerError::Busy);
        }
        self.discard_sync(user_state, handle);
        Ok(())
    }

    /// Discards the user's sync context, rolling back any staged work.
    pub fn discard_sync(&self, user_state: &UserState, handle: &CollectionHandle) {
        let mut slot = user_state.sync.lock();
        if slot.take().is_some() {
            let _ = handle.with(|col| {
                col.rollback_sync();
                Ok(())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_state() -> (Arc<ServerState>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = ServerConfig::new(dir.path());
        (Arc::new(ServerState::new(config).unwrap()), dir)
    }

    #[test]
    fn user_state_is_shared() {
        let (state, _dir) = test_state();
        let a = state.user_state("u");
        let b = state.user_state("u");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn op_lock_refuses_second_holder() {
        let (state, _dir) = test_state();
        let us = state.user_state("u");
        let guard = state.try_lock_user(&us).unwrap();
        assert!(matches!(state.try_lock_user(&us), Err(ServerError::Busy)));
        drop(guard);
        assert!(state.try_lock_user(&us).is_ok());
    }

    #[test]
    fn resolve_session_rejects_unknown_keys() {
        let (state, _dir) = test_state();
        let header = SyncHeader {
            v: 11,
            k: "no-such-key".into(),
            ..Default::default()
        };
        assert!(matches!(
            state.resolve_session(&header),
            Err(ServerError::Unauthorized)
        ));

        let empty = SyncHeader::default();
        assert!(matches!(
            state.resolve_session(&empty),
            Err(ServerError::Unauthorized)
        ));
    }

    #[test]
    fn resolve_session_finds_created_session() {
        let (state, _dir) = test_state();
        let session = state.sessions.create("u", "alice", "laptop").unwrap();
        let header = SyncHeader {
            v: 11,
            k: session.skey.clone(),
            ..Default::default()
        };
        let found = state.resolve_session(&header).unwrap();
        assert_eq!(found.user, "u");
    }
}
