//! The media sync engine: the `/msync/` endpoints.
//!
//! Media sync is independent of the collection state machine but runs
//! under the same per-user lock. Failures here never invalidate the
//! collection-level session; upload errors roll the media log back and
//! surface in the `{data, err}` envelope for the client to retry.

use crate::error::ServerResult;
use crate::state::ServerState;
use recall_core::media::{
    self, normalize_filename, sha1_hex, MediaDb, MediaStore, ARCHIVE_TARGET_BYTES,
    MAX_FILES_PER_ARCHIVE,
};
use recall_core::{CoreResult, Session};
use recall_proto::{
    BeginData, DownloadFilesRequest, MediaChange, MediaChangesRequest, MediaEnvelope,
    MediaSanityRequest, UploadChangesData,
};

fn open_media(state: &ServerState, session: &Session) -> ServerResult<(MediaDb, MediaStore)> {
    let db = MediaDb::open(&state.store.media_db_path(&session.user))?;
    let store = MediaStore::open(&state.store.media_dir(&session.user))?;
    Ok((db, store))
}

/// Handles `begin`: opens a media sync session. Idempotent.
pub fn begin(state: &ServerState, session: &Session) -> ServerResult<MediaEnvelope<BeginData>> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let (db, _) = open_media(state, session)?;
    Ok(MediaEnvelope::ok(BeginData {
        usn: db.last_usn()?,
        sk: session.skey.clone(),
    }))
}

/// Handles `mediaChanges`: log entries past the client's last USN, as a
/// bare array in ascending USN order.
pub fn media_changes(
    state: &ServerState,
    session: &Session,
    req: &MediaChangesRequest,
) -> ServerResult<Vec<MediaChange>> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let (db, _) = open_media(state, session)?;
    Ok(db.changes_since(req.last_usn)?)
}

/// Handles `uploadChanges`: applies a batch archive to the media log and
/// file bag in one transaction.
pub fn upload_changes(
    state: &ServerState,
    session: &Session,
    body: &[u8],
) -> ServerResult<MediaEnvelope<UploadChangesData>> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let (db, store) = open_media(state, session)?;

    let entries = match media::unpack(body) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(user = %session.user, "bad media archive: {err}");
            return Ok(MediaEnvelope::fail(err.to_string()));
        }
    };

    db.begin()?;
    let applied = (|| -> CoreResult<i64> {
        let mut processed = 0i64;
        for entry in &entries {
            let name = match normalize_filename(&entry.fname) {
                Ok(name) => name,
                Err(err) => {
                    tracing::warn!(user = %session.user, "skipping media entry: {err}");
                    continue;
                }
            };
            match &entry.data {
                None => {
                    // Deletion: drop the file, always record the tombstone.
                    store.delete(&name)?;
                    db.append(&name, "", 0)?;
                    processed += 1;
                }
                Some(data) => {
                    let sha1 = sha1_hex(data);
                    if let Some(declared) = &entry.declared_sha1 {
                        if declared != &sha1 {
                            tracing::warn!(
                                user = %session.user,
                                file = %name,
                                "checksum mismatch on uploaded file, skipping"
                            );
                            continue;
                        }
                    }
                    // Replaying a byte-identical file is a no-op.
                    if db
                        .latest_entry(&name)?
                        .map(|(csum, _)| csum == sha1)
                        .unwrap_or(false)
                    {
                        processed += 1;
                        continue;
                    }
                    store.write(&name, data)?;
                    db.append(&name, &sha1, data.len() as i64)?;
                    processed += 1;
                }
            }
        }
        Ok(processed)
    })();

    match applied {
        Ok(processed) => {
            db.commit()?;
            let current_usn = db.last_usn()?;
            tracing::debug!(user = %session.user, processed, current_usn, "media upload applied");
            Ok(MediaEnvelope::ok(UploadChangesData {
                processed,
                current_usn,
            }))
        }
        Err(err) => {
            db.rollback();
            tracing::warn!(user = %session.user, "media upload failed: {err}");
            Ok(MediaEnvelope::fail(err.to_string()))
        }
    }
}

/// Handles `downloadFiles`: packages requested files into an archive.
pub fn download_files(
    state: &ServerState,
    session: &Session,
    req: &DownloadFilesRequest,
) -> ServerResult<Vec<u8>> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let (_, store) = open_media(state, session)?;

    let mut files = Vec::new();
    let mut total: u64 = 0;
    for raw in &req.files {
        let name = match normalize_filename(raw) {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!(user = %session.user, "skipping requested file: {err}");
                continue;
            }
        };
        let Some(data) = store.read(&name)? else {
            tracing::warn!(user = %session.user, file = %name, "requested media file missing");
            continue;
        };
        total += data.len() as u64;
        files.push((name, data));
        if files.len() >= MAX_FILES_PER_ARCHIVE || total > ARCHIVE_TARGET_BYTES {
            break;
        }
    }
    Ok(media::pack(&files)?)
}

/// Handles `mediaSanity`: compares the client's live-file count with the
/// log's view. A mismatch directs the client to a full media reset.
pub fn media_sanity(
    state: &ServerState,
    session: &Session,
    req: &MediaSanityRequest,
) -> ServerResult<MediaEnvelope<String>> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let (db, _) = open_media(state, session)?;

    let server = db.nonempty_count()?;
    if server == req.local {
        Ok(MediaEnvelope::ok("OK".into()))
    } else {
        tracing::info!(
            user = %session.user,
            client = req.local,
            server,
            "media sanity mismatch"
        );
        Ok(MediaEnvelope {
            data: Some("FAILED".into()),
            err: format!("server has {server} files, client reported {}", req.local),
        })
    }
}
