//! Durable job state document.
//!
//! The store persists `job id → { "state": ... }` as a single JSON object on
//! disk. The document is read fully and rewritten fully on every update; each
//! write goes to a uniquely named temp file in the same directory and is then
//! renamed into place, so a reader never observes a truncated document.
//!
//! Mutations are serialized two ways: an internal mutex orders threads within
//! one process, and an exclusive advisory `flock` on a sidecar lockfile orders
//! separate processes sharing the document (a staging `enqueue` next to a
//! long-lived `run`, for instance). Both are held across the whole
//! load-modify-persist cycle.
//!
//! A missing document behaves as an empty store (created on first write).
//! A document that exists but does not parse is a fatal condition: the store
//! cannot silently lose track of in-progress jobs.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::JobState;

/// One entry in the state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateEntry {
    state: JobState,
}

/// Errors from state store operations.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("state document at {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("state document serialization failed: {0}")]
    Serialize(serde_json::Error),

    #[error("invalid state transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobState,
        to: JobState,
    },
}

/// Durable mapping from job id to lifecycle state.
///
/// All operations are read-modify-write cycles on the whole document,
/// serialized by an internal mutex plus a cross-process advisory lock so
/// concurrent per-job updates cannot drop each other's writes, no matter
/// which process they come from.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock: Mutex<()>,
}

/// Exclusive hold on the document for one read-modify-write cycle.
///
/// Closing the descriptor on drop releases the flock.
struct DocumentGuard<'a> {
    _process: MutexGuard<'a, ()>,
    _file: fs::File,
}

impl StateStore {
    /// Open a store backed by the document at `path`.
    ///
    /// The document is not created until the first write; a missing file
    /// reads as an empty store. The sidecar `<path>.lock` file appears as
    /// soon as the store is first used.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the persisted state for `id`.
    pub fn get(&self, id: &str) -> Result<Option<JobState>, StateStoreError> {
        let _doc = self.lock_document()?;
        Ok(self.load()?.get(id).map(|entry| entry.state))
    }

    /// Overwrite the state for `id` unconditionally.
    pub fn set(&self, id: &str, state: JobState) -> Result<(), StateStoreError> {
        let _doc = self.lock_document()?;
        let mut entries = self.load()?;
        entries.insert(id.to_string(), StateEntry { state });
        self.persist(&entries)
    }

    /// Advance the state for `id`, enforcing the transition table.
    ///
    /// Absence of an entry means "never admitted", so a job with no entry may
    /// enter any state; existing entries must follow
    /// [`JobState::can_transition_to`].
    pub fn advance(&self, id: &str, state: JobState) -> Result<(), StateStoreError> {
        let _doc = self.lock_document()?;
        let mut entries = self.load()?;
        if let Some(entry) = entries.get(id) {
            if !entry.state.can_transition_to(state) {
                return Err(StateStoreError::InvalidTransition {
                    id: id.to_string(),
                    from: entry.state,
                    to: state,
                });
            }
        }
        entries.insert(id.to_string(), StateEntry { state });
        self.persist(&entries)
    }

    /// Full snapshot of the document. Used for recovery and queue scans.
    pub fn all(&self) -> Result<BTreeMap<String, JobState>, StateStoreError> {
        let _doc = self.lock_document()?;
        Ok(self
            .load()?
            .into_iter()
            .map(|(id, entry)| (id, entry.state))
            .collect())
    }

    /// Startup recovery: rewrite every `compressing` entry back to `queued`.
    ///
    /// `compressing` can only be observed mid-flight; after a restart no
    /// worker is running for those jobs, so they must be re-admitted rather
    /// than left stuck forever. Idempotent. Returns the ids demoted.
    pub fn reset_in_flight(&self) -> Result<Vec<String>, StateStoreError> {
        let _doc = self.lock_document()?;
        let mut entries = self.load()?;
        let demoted: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.state == JobState::Compressing)
            .map(|(id, _)| id.clone())
            .collect();
        if demoted.is_empty() {
            return Ok(demoted);
        }
        for id in &demoted {
            entries.insert(
                id.clone(),
                StateEntry {
                    state: JobState::Queued,
                },
            );
        }
        self.persist(&entries)?;
        Ok(demoted)
    }

    /// Take the internal mutex, then an exclusive `flock` on the sidecar
    /// lockfile. Blocks until any other process releases its hold.
    fn lock_document(&self) -> Result<DocumentGuard<'_>, StateStoreError> {
        let process = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        // A missing document reads as empty, so reads must work before any
        // write has created the directory
        if let Some(parent) = self
            .lock_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(DocumentGuard {
            _process: process,
            _file: file,
        })
    }

    fn load(&self) -> Result<BTreeMap<String, StateEntry>, StateStoreError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&json).map_err(|source| StateStoreError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the whole document atomically (write-to-temp-then-rename).
    fn persist(&self, entries: &BTreeMap<String, StateEntry>) -> Result<(), StateStoreError> {
        let json = serde_json::to_string_pretty(entries).map_err(StateStoreError::Serialize)?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let temp_path = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&temp_path, &json)?;
        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }
}
