//! Per-user directory layout and the reference-counted collection cache.
//!
//! File system layout under the data root:
//!
//! ```text
//! <root>/
//! ├─ LOCK                    # advisory lock, one server process at a time
//! ├─ session.db              # session registry (see session.rs)
//! └─ <user-key>/
//!    ├─ collection.db        # the collection database
//!    ├─ collection.db-wal    # WAL auxiliaries, managed by SQLite
//!    ├─ collection.db-shm
//!    ├─ media/               # media file bag
//!    └─ media.server.db      # media change log
//! ```
//!
//! Collections are opened lazily and shared through [`CollectionHandle`]s.
//! Dropping the last handle for a user checkpoints the write-ahead log and
//! closes the connection.

use crate::collection::Collection;
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const LOCK_FILE: &str = "LOCK";
const COLLECTION_FILE: &str = "collection.db";
const MEDIA_DIR: &str = "media";
const MEDIA_DB_FILE: &str = "media.server.db";
const SESSION_DB_FILE: &str = "session.db";

struct Slot {
    path: PathBuf,
    col: Mutex<Option<Collection>>,
    refs: AtomicUsize,
}

/// A shared, lazily opened reference to one user's collection.
///
/// Cloning bumps the reference count; dropping the last clone checkpoints
/// and closes the underlying connection.
pub struct CollectionHandle {
    slot: Arc<Slot>,
}

impl CollectionHandle {
    /// Runs `f` against the opened collection, opening it on first use.
    pub fn with<T>(&self, f: impl FnOnce(&mut Collection) -> CoreResult<T>) -> CoreResult<T> {
        let mut guard = self.slot.col.lock();
        if guard.is_none() {
            *guard = Some(Collection::open(&self.slot.path)?);
        }
        f(guard.as_mut().expect("collection opened above"))
    }

    /// Checkpoints and closes the underlying connection immediately,
    /// leaving the handle reusable. Required before the database file is
    /// replaced or copied wholesale.
    pub fn close_now(&self) -> CoreResult<()> {
        if let Some(col) = self.slot.col.lock().take() {
            col.close()?;
        }
        Ok(())
    }

    /// Path of the collection file this handle serves.
    pub fn path(&self) -> &Path {
        &self.slot.path
    }
}

impl Clone for CollectionHandle {
    fn clone(&self) -> Self {
        self.slot.refs.fetch_add(1, Ordering::SeqCst);
        CollectionHandle {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl Drop for CollectionHandle {
    fn drop(&mut self) {
        if self.slot.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(col) = self.slot.col.lock().take() {
                if let Err(err) = col.close() {
                    tracing::warn!("closing collection failed: {err}");
                }
            }
        }
    }
}

/// The data root: one directory per user, guarded by an advisory lock so a
/// second server process cannot open the same tree.
pub struct UserStore {
    root: PathBuf,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    _lock: File,
}

impl UserStore {
    /// Opens the data root, creating it if missing.
    ///
    /// Returns [`CoreError::RootLocked`] when another process holds the
    /// advisory lock.
    pub fn open(root: &Path) -> CoreResult<Self> {
        std::fs::create_dir_all(root)?;
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::RootLocked);
        }
        Ok(UserStore {
            root: root.to_path_buf(),
            slots: Mutex::new(HashMap::new()),
            _lock: lock_file,
        })
    }

    /// The data root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one user's data.
    pub fn user_dir(&self, user: &str) -> PathBuf {
        self.root.join(user)
    }

    /// Path of a user's collection file.
    pub fn collection_path(&self, user: &str) -> PathBuf {
        self.user_dir(user).join(COLLECTION_FILE)
    }

    /// Path of a user's media directory.
    pub fn media_dir(&self, user: &str) -> PathBuf {
        self.user_dir(user).join(MEDIA_DIR)
    }

    /// Path of a user's media change log database.
    pub fn media_db_path(&self, user: &str) -> PathBuf {
        self.user_dir(user).join(MEDIA_DB_FILE)
    }

    /// Default path of the session registry database.
    pub fn session_db_path(&self) -> PathBuf {
        self.root.join(SESSION_DB_FILE)
    }

    /// Returns a counted handle for `user`'s collection.
    pub fn handle(&self, user: &str) -> CollectionHandle {
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(user.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    path: self.collection_path(user),
                    col: Mutex::new(None),
                    refs: AtomicUsize::new(0),
                })
            })
            .clone();
        slot.refs.fetch_add(1, Ordering::SeqCst);
        CollectionHandle { slot }
    }

    /// Removes the checkpointed WAL auxiliaries next to a collection file.
    ///
    /// Only call after the owning connection was closed through
    /// [`Collection::close`] (which checkpoints); deleting a live WAL
    /// loses committed data.
    pub fn remove_wal_files(path: &Path) -> CoreResult<()> {
        for suffix in ["-wal", "-shm"] {
            let mut name = path.as_os_str().to_owned();
            name.push(suffix);
            let aux = PathBuf::from(name);
            if aux.exists() {
                std::fs::remove_file(aux)?;
            }
        }
        Ok(())
    }

    /// Closes every cached collection. Used on shutdown.
    pub fn close_all(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.lock().values().cloned().collect();
        for slot in slots {
            if let Some(col) = slot.col.lock().take() {
                if let Err(err) = col.close() {
                    tracing::warn!("closing collection failed: {err}");
                }
            }
        }
    }

    #[cfg(test)]
    fn open_count(&self, user: &str) -> usize {
        let slots = self.slots.lock();
        slots
            .get(user)
            .map(|s| s.refs.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}
