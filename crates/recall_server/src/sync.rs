//! The collection sync engine.
//!
//! One sync transaction walks the state machine
//!
//! ```text
//! IDLE → meta → start → (applyGraves | applyChanges | chunk | applyChunk)*
//!      → sanityCheck2 → finish → IDLE
//! ```
//!
//! `start` opens a database transaction and snapshots everything the
//! server will send — later steps all observe that snapshot, and rows the
//! client uploads mid-stream are never echoed back. Any failure along the
//! way rolls the transaction back and destroys the context; nothing
//! partial ever becomes visible.

use crate::error::{ServerError, ServerResult};
use crate::state::{ServerState, SyncContext, SyncPhase};
use recall_core::media::MediaDb;
use recall_core::{now_millis, now_secs, CollectionHandle, CoreError, CoreResult, Session};
use recall_proto::{
    ApplyChangesRequest, ApplyChangesResponse, ApplyChunkRequest, ApplyChunkResponse,
    ApplyGravesRequest, Changes, Chunk, ChunkResponse, FinishResponse, MetaRequest, MetaResponse,
    Row, SanityCheckRequest, SanityCheckResponse, StartRequest, StartResponse, TableKind,
};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::time::Instant;

/// Largest tolerated difference between client and server wall clocks.
const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Rows per streamed chunk.
const CHUNK_ROW_LIMIT: usize = 250;

/// Handles `meta`: the handshake that decides whether incremental sync
/// may proceed.
pub fn meta(state: &ServerState, session: &Session, req: &MetaRequest) -> ServerResult<MetaResponse> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let handle = state.collection(&session.user);

    let mut refusal: Option<String> = None;
    if !recall_proto::version_supported(req.v) {
        refusal = Some(format!("unsupported sync protocol version {}", req.v));
    } else if client_too_old(&req.cv) {
        refusal = Some("your client is too old for this server; please upgrade".into());
    } else if req.ts != 0 && (now_secs() - req.ts).abs() > MAX_CLOCK_SKEW_SECS {
        refusal = Some(
            "your device clock is off by more than 5 minutes; correct it and retry".into(),
        );
    }

    // A context opened by another device blocks incremental sync until it
    // finishes or goes stale.
    if refusal.is_none() {
        let foreign = {
            let slot = user_state.sync.lock();
            match slot.as_ref() {
                Some(ctx) if ctx.skey != session.skey => Some(ctx.is_stale()),
                _ => None,
            }
        };
        match foreign {
            Some(true) => state.discard_sync(&user_state, &handle),
            Some(false) => {
                refusal = Some("another device is currently syncing this collection".into())
            }
            None => {}
        }
    }

    let (mod_, scm, usn, empty) = handle.with(|col| {
        Ok((
            col.mod_millis()?,
            col.scm_millis()?,
            col.usn()?,
            col.is_empty()?,
        ))
    })?;
    let musn = MediaDb::open(&state.store.media_db_path(&session.user))?.last_usn()?;

    Ok(MetaResponse {
        mod_,
        scm,
        usn,
        ts: now_secs(),
        musn,
        uname: session.name.clone(),
        msg: refusal.clone().unwrap_or_default(),
        cont: refusal.is_none(),
        empty,
        host_num: 0,
    })
}

/// Handles `start`: opens the sync context and exchanges graves.
pub fn start(
    state: &ServerState,
    session: &Session,
    req: &StartRequest,
) -> ServerResult<StartResponse> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let handle = state.collection(&session.user);

    // A leftover context — ours from an interrupted attempt, or a stale
    // one from another device — is rolled back before starting over; a
    // live foreign context refuses with busy.
    state.claim_exclusive(&user_state, &handle, &session.skey)?;

    type StartSnapshot = (
        i64,
        recall_proto::Graves,
        HashSet<(i64, i64)>,
        VecDeque<(TableKind, VecDeque<Row>)>,
        Changes,
    );

    let min_usn = req.min_usn;
    let (max_usn, server_graves, graved, pending, server_changes): StartSnapshot = handle
        .with(|col| {
            col.begin_sync()?;
            let snapshot = (|| -> CoreResult<StartSnapshot> {
                let max_usn = col.usn()?;
                let server_graves = col.graves_since(min_usn)?;
                let mut graved: HashSet<(i64, i64)> = server_graves
                    .entries()
                    .map(|(kind, id)| (kind.code(), id))
                    .collect();
                if let Some(client_graves) = &req.graves {
                    col.apply_graves(client_graves, max_usn)?;
                    graved.extend(
                        client_graves
                            .entries()
                            .map(|(kind, id)| (kind.code(), id)),
                    );
                }

                let mut pending = VecDeque::new();
                for kind in TableKind::STREAMED {
                    let rows = col.pending_rows(kind, min_usn)?;
                    if !rows.is_empty() {
                        pending.push_back((kind, VecDeque::from(rows)));
                    }
                }

                let mut changes = Changes {
                    decks: col.pending_rows(TableKind::Decks, min_usn)?,
                    deck_configs: col.pending_rows(TableKind::DeckConfigs, min_usn)?,
                    notetypes: col.pending_rows(TableKind::Notetypes, min_usn)?,
                    tags: col.pending_rows(TableKind::Tags, min_usn)?,
                    config: None,
                    crt: None,
                };
                if !req.lnewer {
                    changes.config = Some(col.read_config()?);
                    changes.crt = Some(col.crt_secs()?);
                }
                Ok((max_usn, server_graves, graved, pending, changes))
            })();
            match snapshot {
                Ok(value) => Ok(value),
                Err(err) => {
                    col.rollback_sync();
                    Err(err)
                }
            }
        })?;

    tracing::debug!(
        user = %session.user,
        min_usn,
        max_usn,
        pending_tables = pending.len(),
        "sync context opened"
    );

    *user_state.sync.lock() = Some(SyncContext {
        skey: session.skey.clone(),
        phase: SyncPhase::Streaming,
        min_usn,
        max_usn,
        server_newer: !req.lnewer,
        graved,
        pending,
        server_changes: Some(server_changes),
        opened: Instant::now(),
    });

    Ok(StartResponse {
        graves: server_graves,
    })
}

/// Runs `f` under the user lock against the active sync context. Any
/// error destroys the context and rolls the transaction back.
fn with_context<T>(
    state: &ServerState,
    session: &Session,
    f: impl FnOnce(&mut SyncContext, &CollectionHandle) -> ServerResult<T>,
) -> ServerResult<T> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let handle = state.collection(&session.user);

    let mut slot = user_state.sync.lock();
    let Some(ctx) = slot.as_mut() else {
        return Err(ServerError::BadRequest("no sync in progress".into()));
    };
    if ctx.skey != session.skey {
        return Err(ServerError::Busy);
    }
    match f(ctx, &handle) {
        Ok(value) => Ok(value),
        Err(err) => {
            slot.take();
            let _ = handle.with(|col| {
                col.rollback_sync();
                Ok(())
            });
            Err(err)
        }
    }
}

fn require_streaming(ctx: &SyncContext) -> ServerResult<()> {
    if ctx.phase != SyncPhase::Streaming {
        return Err(ServerError::BadRequest(
            "operation not valid after the sanity check".into(),
        ));
    }
    Ok(())
}

/// Handles `applyGraves`: tombstones sent mid-stream.
pub fn apply_graves(
    state: &ServerState,
    session: &Session,
    req: &ApplyGravesRequest,
) -> ServerResult<serde_json::Value> {
    with_context(state, session, |ctx, handle| {
        require_streaming(ctx)?;
        handle.with(|col| col.apply_graves(&req.chunk, ctx.max_usn))?;
        ctx.graved
            .extend(req.chunk.entries().map(|(kind, id)| (kind.code(), id)));
        Ok(json!({}))
    })
}

/// Handles `applyChanges`: merges the client's small-object bundle and
/// returns the server's counterpart, snapshotted at `start`.
pub fn apply_changes(
    state: &ServerState,
    session: &Session,
    req: &ApplyChangesRequest,
) -> ServerResult<ApplyChangesResponse> {
    with_context(state, session, |ctx, handle| {
        require_streaming(ctx)?;
        let now = now_millis();
        handle.with(|col| {
            col.apply_rows(TableKind::Decks, &req.changes.decks, ctx.max_usn, &ctx.graved)?;
            col.apply_rows(
                TableKind::DeckConfigs,
                &req.changes.deck_configs,
                ctx.max_usn,
                &ctx.graved,
            )?;
            col.apply_rows(
                TableKind::Notetypes,
                &req.changes.notetypes,
                ctx.max_usn,
                &ctx.graved,
            )?;
            col.apply_rows(TableKind::Tags, &req.changes.tags, ctx.max_usn, &ctx.graved)?;
            if let Some(config) = &req.changes.config {
                col.merge_config(config, ctx.max_usn, now)?;
            }
            if let Some(crt) = req.changes.crt {
                col.set_crt_secs(crt)?;
            }
            Ok(())
        })?;
        let changes = ctx.server_changes.take().unwrap_or_default();
        Ok(ApplyChangesResponse { changes })
    })
}

/// Handles `chunk`: the next batch of server rows.
pub fn chunk(state: &ServerState, session: &Session) -> ServerResult<ChunkResponse> {
    with_context(state, session, |ctx, _handle| {
        require_streaming(ctx)?;
        let mut out = Chunk::default();
        let mut remaining = CHUNK_ROW_LIMIT;
        while remaining > 0 {
            let (name, batch, exhausted) = {
                let Some((kind, rows)) = ctx.pending.front_mut() else {
                    break;
                };
                let take = remaining.min(rows.len());
                let batch: Vec<Row> = rows.drain(..take).collect();
                (kind.wire_name().to_string(), batch, rows.is_empty())
            };
            remaining -= batch.len();
            out.tables.entry(name).or_default().extend(batch);
            if exhausted {
                ctx.pending.pop_front();
            }
        }
        out.done = ctx.pending.is_empty();
        Ok(ChunkResponse { chunk: out })
    })
}

/// Handles `applyChunk`: one batch of client rows.
pub fn apply_chunk(
    state: &ServerState,
    session: &Session,
    req: &ApplyChunkRequest,
) -> ServerResult<ApplyChunkResponse> {
    with_context(state, session, |ctx, handle| {
        require_streaming(ctx)?;
        handle.with(|col| {
            for (name, rows) in &req.chunk.tables {
                let Some(kind) = TableKind::from_wire_name(name) else {
                    return Err(CoreError::InvalidData(format!("unknown table {name}")));
                };
                col.apply_rows(kind, rows, ctx.max_usn, &ctx.graved)?;
            }
            Ok(())
        })?;
        Ok(ApplyChunkResponse {
            chunk: Chunk {
                done: req.chunk.done,
                ..Chunk::default()
            },
        })
    })
}

/// Handles `sanityCheck2`: compares count vectors. A mismatch aborts the
/// transaction and tells the client to fall back to a full sync.
pub fn sanity_check(
    state: &ServerState,
    session: &Session,
    req: &SanityCheckRequest,
) -> ServerResult<SanityCheckResponse> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let handle = state.collection(&session.user);

    let mut slot = user_state.sync.lock();
    let Some(ctx) = slot.as_mut() else {
        return Err(ServerError::BadRequest("no sync in progress".into()));
    };
    if ctx.skey != session.skey {
        return Err(ServerError::Busy);
    }

    let server = match handle.with(|col| col.sanity_counts()) {
        Ok(counts) => counts,
        Err(err) => {
            slot.take();
            let _ = handle.with(|col| {
                col.rollback_sync();
                Ok(())
            });
            return Err(err.into());
        }
    };

    if server == req.client {
        ctx.phase = SyncPhase::Checked;
        Ok(SanityCheckResponse::ok())
    } else {
        tracing::info!(
            user = %session.user,
            client = ?req.client,
            server = ?server,
            "sanity check failed, discarding sync context"
        );
        slot.take();
        let _ = handle.with(|col| {
            col.rollback_sync();
            Ok(())
        });
        Ok(SanityCheckResponse::bad(req.client, server))
    }
}

/// Handles `finish`: commits the transaction and stamps the new
/// collection state.
pub fn finish(state: &ServerState, session: &Session) -> ServerResult<FinishResponse> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let handle = state.collection(&session.user);

    let mut slot = user_state.sync.lock();
    let Some(ctx) = slot.as_mut() else {
        return Err(ServerError::BadRequest("no sync in progress".into()));
    };
    if ctx.skey != session.skey {
        return Err(ServerError::Busy);
    }
    if ctx.phase != SyncPhase::Checked {
        slot.take();
        let _ = handle.with(|col| {
            col.rollback_sync();
            Ok(())
        });
        return Err(ServerError::BadRequest(
            "finish requested before the sanity check passed".into(),
        ));
    }

    let now = now_millis();
    let new_usn = ctx.max_usn + 1;
    match handle.with(|col| col.commit_sync(now, new_usn)) {
        Ok(()) => {
            slot.take();
            tracing::debug!(user = %session.user, new_usn, "sync committed");
            Ok(FinishResponse { mod_: now })
        }
        Err(err) => {
            slot.take();
            let _ = handle.with(|col| {
                col.rollback_sync();
                Ok(())
            });
            Err(err.into())
        }
    }
}

/// Handles `abort`: discards the context without committing.
pub fn abort(state: &ServerState, session: &Session) -> ServerResult<serde_json::Value> {
    let user_state = state.user_state(&session.user);
    let _guard = state.try_lock_user(&user_state)?;
    let handle = state.collection(&session.user);

    let discard = {
        let slot = user_state.sync.lock();
        matches!(slot.as_ref(), Some(ctx) if ctx.skey == session.skey || ctx.is_stale())
    };
    if discard {
        state.discard_sync(&user_state, &handle);
    }
    Ok(json!({}))
}

/// True when the client build string identifies a client below the
/// modern-protocol floor.
fn client_too_old(cv: &str) -> bool {
    let mut parts = cv.split(',');
    let client = parts.next().unwrap_or("").trim();
    let version_field = parts.next().unwrap_or("").trim();
    // Strip a trailing build hash: "2.1.60 (abcdef12)".
    let version = version_field.split(' ').next().unwrap_or("");

    let mut numbers = Vec::new();
    for piece in version.split('.') {
        let digits: String = piece.chars().take_while(|c| c.is_ascii_digit()).collect();
        match digits.parse::<u32>() {
            Ok(n) => numbers.push(n),
            Err(_) => break,
        }
        if digits.len() != piece.len() {
            break;
        }
    }
    if numbers.is_empty() {
        return false;
    }

    let floor: &[u32] = match client {
        "anki" | "ankidesktop" => &[2, 1, 57],
        "ankidroid" => &[2, 16],
        _ => return false,
    };
    version_below(&numbers, floor)
}

fn version_below(version: &[u32], floor: &[u32]) -> bool {
    for i in 0..version.len().max(floor.len()) {
        let have = version.get(i).copied().unwrap_or(0);
        let want = floor.get(i).copied().unwrap_or(0);
        if have != want {
            return have < want;
        }
    }
    false
}
