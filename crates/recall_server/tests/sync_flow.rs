//! End-to-end collection sync scenarios, driven at the engine level.

use recall_core::{Collection, Session};
use recall_proto::{
    ApplyChangesRequest, ApplyChunkRequest, Chunk, Graves, MetaRequest, SanityCheckRequest,
    StartRequest, TableKind,
};
use recall_server::{full_sync, sync, ServerConfig, ServerState};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

fn test_state() -> (Arc<ServerState>, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig::new(dir.path().join("data"));
    (Arc::new(ServerState::new(config).unwrap()), dir)
}

fn login(state: &ServerState, host: &str) -> Session {
    state.sessions.create("alice-key", "alice", host).unwrap()
}

fn meta_req() -> MetaRequest {
    MetaRequest {
        v: 11,
        cv: "anki,2.1.60 (abcdef12),linux".into(),
        ..Default::default()
    }
}

fn note_row(id: i64, mod_: i64, usn: i64, field: &str) -> recall_proto::Row {
    vec![
        json!(id),
        json!(format!("guid{id}")),
        json!(1),
        json!(mod_),
        json!(usn),
        json!(""),
        json!(field),
        json!(field),
        json!("12345"),
        json!(0),
        json!(""),
    ]
}

fn card_row(id: i64, nid: i64, mod_: i64, usn: i64) -> recall_proto::Row {
    vec![
        json!(id),
        json!(nid),
        json!(1),
        json!(0),
        json!(mod_),
        json!(usn),
        json!(0),
        json!(0),
        json!(0),
        json!(0),
        json!(2500),
        json!(0),
        json!(0),
        json!(0),
        json!(0),
        json!(0),
        json!(0),
        json!(""),
    ]
}

fn deck_row(id: i64, name: &str, mod_: i64, usn: i64) -> recall_proto::Row {
    vec![
        json!(id),
        json!(name),
        json!(mod_),
        json!(usn),
        json!("{}"),
        json!("{}"),
    ]
}

/// Builds a standalone collection file with the given content and returns
/// its bytes, checkpointed.
fn build_collection_file(
    dir: &TempDir,
    name: &str,
    notes: &[recall_proto::Row],
    cards: &[recall_proto::Row],
    decks: &[recall_proto::Row],
) -> Vec<u8> {
    let path = dir.path().join(name);
    let col = Collection::open(&path).unwrap();
    let none = HashSet::new();
    col.apply_rows(TableKind::Notes, notes, 0, &none).unwrap();
    col.apply_rows(TableKind::Cards, cards, 0, &none).unwrap();
    col.apply_rows(TableKind::Decks, decks, 0, &none).unwrap();
    col.close().unwrap();
    std::fs::read(&path).unwrap()
}

/// Runs one full incremental sync pushing `notes`/`cards` to the server.
fn push_changes(
    state: &ServerState,
    session: &Session,
    min_usn: i64,
    notes: Vec<recall_proto::Row>,
    cards: Vec<recall_proto::Row>,
) -> i64 {
    sync::start(
        state,
        session,
        &StartRequest {
            min_usn,
            max_usn: 0,
            lnewer: true,
            graves: Some(Graves::default()),
        },
    )
    .unwrap();
    sync::apply_changes(state, session, &ApplyChangesRequest::default()).unwrap();
    // Drain server chunks.
    loop {
        let resp = sync::chunk(state, session).unwrap();
        if resp.chunk.done {
            break;
        }
    }
    let mut chunk = Chunk::finished();
    if !notes.is_empty() {
        chunk.tables.insert("notes".into(), notes);
    }
    if !cards.is_empty() {
        chunk.tables.insert("cards".into(), cards);
    }
    sync::apply_chunk(state, session, &ApplyChunkRequest { chunk }).unwrap();

    let server_counts = state
        .collection(&session.user)
        .with(|col| col.sanity_counts())
        .unwrap();
    let resp = sync::sanity_check(
        state,
        session,
        &SanityCheckRequest {
            client: server_counts,
        },
    )
    .unwrap();
    assert_eq!(resp.status, "ok");
    sync::finish(state, session).unwrap().mod_
}

#[test]
fn fresh_client_empty_server_full_upload() {
    let (state, dir) = test_state();
    let session = login(&state, "laptop");

    // The server side starts empty.
    let meta = sync::meta(&state, &session, &meta_req()).unwrap();
    assert!(meta.cont);
    assert!(meta.empty);
    assert_eq!(meta.host_num, 0);

    // Client uploads a collection of 3 notes, 6 cards, 2 decks.
    let notes: Vec<_> = (1..=3).map(|i| note_row(i, 1000 + i, 0, "front")).collect();
    let cards: Vec<_> = (1..=6).map(|i| card_row(i, (i + 1) / 2, 1000, 0)).collect();
    let decks = vec![deck_row(1, "Default", 1000, 0), deck_row(2, "Extra", 1000, 0)];
    let bytes = build_collection_file(&dir, "client.db", &notes, &cards, &decks);

    let resp = full_sync::upload(&state, &session, &bytes).unwrap();
    assert_eq!(resp.status, "OK");

    // A second session sees the uploaded content.
    let other = login(&state, "phone");
    let meta = sync::meta(&state, &other, &meta_req()).unwrap();
    assert!(!meta.empty);

    // Download returns a valid collection holding the same records.
    let downloaded = full_sync::download(&state, &other).unwrap();
    let check_path = dir.path().join("downloaded.db");
    std::fs::write(&check_path, &downloaded).unwrap();
    Collection::validate_file(&check_path).unwrap();
    let col = Collection::open(&check_path).unwrap();
    assert_eq!(col.pending_rows(TableKind::Notes, 0).unwrap().len(), 3);
    assert_eq!(col.pending_rows(TableKind::Cards, 0).unwrap().len(), 6);
    assert_eq!(col.pending_rows(TableKind::Decks, 0).unwrap().len(), 2);
}

#[test]
fn upload_rejects_garbage_and_keeps_old_collection() {
    let (state, dir) = test_state();
    let session = login(&state, "laptop");

    let notes = vec![note_row(1, 1000, 0, "keep me")];
    let cards = vec![card_row(1, 1, 1000, 0)];
    let bytes = build_collection_file(&dir, "client.db", &notes, &cards, &[]);
    full_sync::upload(&state, &session, &bytes).unwrap();

    assert!(full_sync::upload(&state, &session, b"not a database").is_err());

    // The earlier collection is still being served.
    let meta = sync::meta(&state, &session, &meta_req()).unwrap();
    assert!(!meta.empty);
}

#[test]
fn two_clients_disjoint_edits_converge() {
    let (state, dir) = test_state();
    let session_a = login(&state, "laptop");
    let session_b = login(&state, "phone");

    // Seed the server.
    let bytes = build_collection_file(
        &dir,
        "seed.db",
        &[note_row(1, 1000, 0, "seed")],
        &[card_row(1, 1, 1000, 0)],
        &[],
    );
    full_sync::upload(&state, &session_a, &bytes).unwrap();
    let base_usn = sync::meta(&state, &session_a, &meta_req()).unwrap().usn;

    // A pushes note 100, B pushes note 200 starting from the same state.
    push_changes(
        &state,
        &session_a,
        base_usn,
        vec![note_row(100, 2000, -1, "from A")],
        vec![card_row(100, 100, 2000, -1)],
    );
    push_changes(
        &state,
        &session_b,
        base_usn,
        vec![note_row(200, 3000, -1, "from B")],
        vec![card_row(200, 200, 3000, -1)],
    );

    // All three notes present, no duplicates, USNs strictly increasing
    // across the two transactions.
    let handle = state.collection("alice-key");
    let notes = handle
        .with(|col| col.pending_rows(TableKind::Notes, 0))
        .unwrap();
    assert_eq!(notes.len(), 3);
    let ids: HashSet<i64> = notes.iter().map(|r| r[0].as_i64().unwrap()).collect();
    assert_eq!(ids, HashSet::from([1, 100, 200]));

    let usn_of = |id: i64| {
        notes
            .iter()
            .find(|r| r[0] == json!(id))
            .unwrap()[4]
            .as_i64()
            .unwrap()
    };
    assert!(usn_of(200) > usn_of(100));
}

#[test]
fn conflicting_note_edit_newer_mod_wins() {
    let (state, dir) = test_state();
    let session_a = login(&state, "laptop");
    let session_b = login(&state, "phone");

    let bytes = build_collection_file(
        &dir,
        "seed.db",
        &[note_row(1, 1000, 0, "original")],
        &[card_row(1, 1, 1000, 0)],
        &[],
    );
    full_sync::upload(&state, &session_a, &bytes).unwrap();
    let base_usn = sync::meta(&state, &session_a, &meta_req()).unwrap().usn;

    // A edits the note to "X" at t=2000 and syncs first.
    push_changes(
        &state,
        &session_a,
        base_usn,
        vec![note_row(1, 2000, -1, "X")],
        vec![],
    );
    // B edits the same note to "Y" at t=3000 and syncs later.
    let b_base = sync::meta(&state, &session_b, &meta_req()).unwrap().usn;
    push_changes(
        &state,
        &session_b,
        b_base,
        vec![note_row(1, 3000, -1, "Y")],
        vec![],
    );

    let handle = state.collection("alice-key");
    let notes = handle
        .with(|col| col.pending_rows(TableKind::Notes, 0))
        .unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0][6], json!("Y"));
    assert_eq!(notes[0][3], json!(3000));
}

#[test]
fn meta_refuses_bad_versions_and_old_clients() {
    let (state, _dir) = test_state();
    let session = login(&state, "laptop");

    let old_proto = MetaRequest {
        v: 10,
        ..meta_req()
    };
    let meta = sync::meta(&state, &session, &old_proto).unwrap();
    assert!(!meta.cont);
    assert!(!meta.msg.is_empty());

    let old_client = MetaRequest {
        cv: "ankidesktop,2.1.40,linux".into(),
        ..meta_req()
    };
    let meta = sync::meta(&state, &session, &old_client).unwrap();
    assert!(!meta.cont);

    let skewed = MetaRequest {
        ts: recall_core::now_secs() - 3600,
        ..meta_req()
    };
    let meta = sync::meta(&state, &session, &skewed).unwrap();
    assert!(!meta.cont);
    assert!(meta.msg.contains("clock"));
}

#[test]
fn second_device_is_refused_while_sync_in_progress() {
    let (state, _dir) = test_state();
    let session_a = login(&state, "laptop");
    let session_b = login(&state, "phone");

    sync::start(
        &state,
        &session_a,
        &StartRequest {
            min_usn: 0,
            max_usn: 0,
            lnewer: true,
            graves: None,
        },
    )
    .unwrap();

    // B's handshake reports the collection as busy.
    let meta = sync::meta(&state, &session_b, &meta_req()).unwrap();
    assert!(!meta.cont);
    assert!(meta.msg.contains("another device"));

    // B cannot open a second context.
    let err = sync::start(
        &state,
        &session_b,
        &StartRequest {
            min_usn: 0,
            max_usn: 0,
            lnewer: true,
            graves: None,
        },
    )
    .unwrap_err();
    assert!(matches!(err, recall_server::ServerError::Busy));

    // A can finish its transaction unimpeded.
    sync::abort(&state, &session_a).unwrap();
    let meta = sync::meta(&state, &session_b, &meta_req()).unwrap();
    assert!(meta.cont);
}

#[test]
fn sanity_mismatch_discards_staged_changes() {
    let (state, _dir) = test_state();
    let session = login(&state, "laptop");

    sync::start(
        &state,
        &session,
        &StartRequest {
            min_usn: 0,
            max_usn: 0,
            lnewer: true,
            graves: None,
        },
    )
    .unwrap();
    let mut chunk = Chunk::finished();
    chunk
        .tables
        .insert("notes".into(), vec![note_row(1, 1000, -1, "staged")]);
    sync::apply_chunk(&state, &session, &ApplyChunkRequest { chunk }).unwrap();

    // A wrong client vector aborts the transaction.
    let resp = sync::sanity_check(
        &state,
        &session,
        &SanityCheckRequest {
            client: recall_proto::SanityVec([9, 9, 9, 9, 9, 9, 9, 9, 9]),
        },
    )
    .unwrap();
    assert_eq!(resp.status, "bad");
    assert!(resp.s.is_some());

    // Nothing was committed, and the context is gone.
    let handle = state.collection("alice-key");
    let notes = handle
        .with(|col| col.pending_rows(TableKind::Notes, 0))
        .unwrap();
    assert!(notes.is_empty());
    assert!(sync::finish(&state, &session).is_err());
}

#[test]
fn finish_before_sanity_check_is_rejected() {
    let (state, _dir) = test_state();
    let session = login(&state, "laptop");

    sync::start(
        &state,
        &session,
        &StartRequest {
            min_usn: 0,
            max_usn: 0,
            lnewer: true,
            graves: None,
        },
    )
    .unwrap();
    assert!(sync::finish(&state, &session).is_err());
    // The violation destroyed the context.
    assert!(sync::chunk(&state, &session).is_err());
}

#[test]
fn graves_are_exchanged_and_block_resurrection() {
    let (state, dir) = test_state();
    let session = login(&state, "laptop");

    let bytes = build_collection_file(
        &dir,
        "seed.db",
        &[note_row(1, 1000, 0, "a"), note_row(2, 1000, 0, "b")],
        &[card_row(1, 1, 1000, 0), card_row(2, 2, 1000, 0)],
        &[],
    );
    full_sync::upload(&state, &session, &bytes).unwrap();
    let base_usn = sync::meta(&state, &session, &meta_req()).unwrap().usn;

    // The client deleted note 2 offline and reports the grave at start.
    let mut graves = Graves::default();
    graves.push(recall_proto::GraveKind::Note, 2);
    let start = sync::start(
        &state,
        &session,
        &StartRequest {
            min_usn: base_usn,
            max_usn: 0,
            lnewer: true,
            graves: Some(graves),
        },
    )
    .unwrap();
    assert!(start.graves.is_empty());

    sync::apply_changes(&state, &session, &ApplyChangesRequest::default()).unwrap();
    loop {
        if sync::chunk(&state, &session).unwrap().chunk.done {
            break;
        }
    }
    // The client also (incorrectly) re-sends the tombstoned note; it must
    // not come back.
    let mut chunk = Chunk::finished();
    chunk
        .tables
        .insert("notes".into(), vec![note_row(2, 5000, -1, "zombie")]);
    sync::apply_chunk(&state, &session, &ApplyChunkRequest { chunk }).unwrap();

    let server_counts = state
        .collection(&session.user)
        .with(|col| col.sanity_counts())
        .unwrap();
    sync::sanity_check(
        &state,
        &session,
        &SanityCheckRequest {
            client: server_counts,
        },
    )
    .unwrap();
    sync::finish(&state, &session).unwrap();

    let handle = state.collection("alice-key");
    let notes = handle
        .with(|col| col.pending_rows(TableKind::Notes, 0))
        .unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0][0], json!(1));

    // A later sync reports the grave to other clients.
    let listed = handle.with(|col| col.graves_since(base_usn)).unwrap();
    assert_eq!(listed.notes, vec!["2".to_string()]);
}

#[test]
fn small_object_bundle_travels_via_apply_changes() {
    let (state, _dir) = test_state();
    let session = login(&state, "laptop");

    sync::start(
        &state,
        &session,
        &StartRequest {
            min_usn: 0,
            max_usn: 0,
            lnewer: true,
            graves: None,
        },
    )
    .unwrap();

    let mut changes = recall_proto::Changes::default();
    changes.decks = vec![deck_row(7, "Uploaded", 1234, -1)];
    changes.tags = vec![vec![json!("marked"), json!(-1), json!(0), json!("")]];
    let mut config = serde_json::Map::new();
    config.insert("curDeck".into(), json!(7));
    changes.config = Some(config);

    let resp = sync::apply_changes(&state, &session, &ApplyChangesRequest { changes }).unwrap();
    // Client was newer, so the server does not send its config back.
    assert!(resp.changes.config.is_none());

    loop {
        if sync::chunk(&state, &session).unwrap().chunk.done {
            break;
        }
    }
    let server_counts = state
        .collection(&session.user)
        .with(|col| col.sanity_counts())
        .unwrap();
    sync::sanity_check(
        &state,
        &session,
        &SanityCheckRequest {
            client: server_counts,
        },
    )
    .unwrap();
    sync::finish(&state, &session).unwrap();

    let handle = state.collection("alice-key");
    let decks = handle
        .with(|col| col.pending_rows(TableKind::Decks, 0))
        .unwrap();
    assert_eq!(decks.len(), 1);
    assert_eq!(decks[0][1], json!("Uploaded"));
    let config = handle.with(|col| col.read_config()).unwrap();
    assert_eq!(config.get("curDeck"), Some(&json!(7)));
}

#[test]
fn schema_reset_through_full_upload() {
    let (state, dir) = test_state();
    let session = login(&state, "laptop");

    let before = sync::meta(&state, &session, &meta_req()).unwrap().scm;

    // The client's collection carries its own schema timestamp; after the
    // upload the server serves that value.
    std::thread::sleep(std::time::Duration::from_millis(5));
    let bytes = build_collection_file(
        &dir,
        "client.db",
        &[note_row(1, 1000, 0, "x")],
        &[card_row(1, 1, 1000, 0)],
        &[],
    );
    let check_path = dir.path().join("client.db");
    let client_scm = Collection::open(&check_path)
        .unwrap()
        .scm_millis()
        .unwrap();

    full_sync::upload(&state, &session, &bytes).unwrap();
    let after = sync::meta(&state, &session, &meta_req()).unwrap().scm;
    assert_eq!(after, client_scm);
    assert_ne!(after, before);
}
