//! Full sync: whole-collection upload and download.
//!
//! Both paths take the per-user lock briefly, discard any open sync
//! context, and obey the checkpoint discipline: the WAL is fully
//! checkpointed before the database file is copied out or swapped, and
//! checkpointed auxiliaries are removed before a replacement lands.

use crate::error::{ServerError, ServerResult};
use crate::state::ServerState;
use recall_core::{now_millis, Collection, Session, UserStore};
use recall_proto::UploadResponse;

/// Handles `upload`: validates the received file and atomically swaps it
/// in as the new collection.
pub fn upload(state: &ServerState, session: &Session, body: &[u8]) -> ServerResult<UploadResponse> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let handle = state.collection(&session.user);
    state.claim_exclusive(&user_state, &handle, &session.skey)?;

    if body.len() > state.config.max_upload_bytes {
        return Err(ServerError::BadRequest(format!(
            "collection exceeds the upload limit of {} bytes",
            state.config.max_upload_bytes
        )));
    }
    if body.is_empty() {
        return Err(ServerError::BadRequest("empty collection upload".into()));
    }

    let path = state.store.collection_path(&session.user);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(recall_core::CoreError::from)?;
    }
    let temp = path.with_extension("db.upload");
    std::fs::write(&temp, body).map_err(recall_core::CoreError::from)?;

    // Reject broken files while the old collection is still untouched.
    if let Err(err) = Collection::validate_file(&temp) {
        let _ = std::fs::remove_file(&temp);
        tracing::warn!(user = %session.user, "rejected uploaded collection: {err}");
        return Err(err.into());
    }

    // Close our connection (checkpointing), clear the checkpointed WAL
    // auxiliaries, then swap.
    handle.close_now()?;
    UserStore::remove_wal_files(&path)?;
    std::fs::rename(&temp, &path).map_err(recall_core::CoreError::from)?;

    handle.with(|col| col.set_last_sync_millis(now_millis()))?;
    tracing::info!(user = %session.user, bytes = body.len(), "full upload accepted");
    Ok(UploadResponse {
        status: "OK".into(),
    })
}

/// Handles `download`: returns the collection file bytes after a full
/// WAL checkpoint so no committed state hides in auxiliary files.
pub fn download(state: &ServerState, session: &Session) -> ServerResult<Vec<u8>> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let handle = state.collection(&session.user);
    state.claim_exclusive(&user_state, &handle, &session.skey)?;

    handle.with(|col| {
        col.set_last_sync_millis(now_millis())?;
        col.checkpoint()
    })?;

    let bytes =
        std::fs::read(state.store.collection_path(&session.user)).map_err(recall_core::CoreError::from)?;
    tracing::info!(user = %session.user, bytes = bytes.len(), "full download served");
    Ok(bytes)
}
