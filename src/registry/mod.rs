//! Queued-job discovery.
//!
//! Reconciles what the state store says is `queued` with what bytes actually
//! exist in the queue directory. A state entry without staged bytes (crash
//! between state write and move) is skipped; a file without a `queued` entry
//! (crash before the state write, or a job already in flight) is likewise
//! ignored. The filesystem locates bytes; the store decides state.

use std::path::Path;

use walkdir::WalkDir;

use crate::job::Job;
use crate::state::{JobState, StateStore, StateStoreError};

/// In-memory view of admittable jobs, rebuilt on every scan.
#[derive(Debug)]
pub struct JobRegistry {
    queue_dir: std::path::PathBuf,
}

impl JobRegistry {
    pub fn new(queue_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            queue_dir: queue_dir.into(),
        }
    }

    /// List jobs that may be admitted right now, FIFO by id.
    ///
    /// Lower-cased ULIDs sort lexicographically by creation time, so sorting
    /// by id yields arrival order without any extra bookkeeping.
    pub fn list_admittable(&self, store: &StateStore) -> Result<Vec<Job>, StateStoreError> {
        let states = store.all()?;

        let mut jobs: Vec<Job> = WalkDir::new(&self.queue_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| split_file_name(entry.path()))
            .filter(|job| states.get(&job.id) == Some(&JobState::Queued))
            .collect();

        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }
}

/// Split `<id>.<ext>` into a [`Job`]; anything else is not ours.
fn split_file_name(path: &Path) -> Option<Job> {
    let id = path.file_stem()?.to_str()?;
    let extension = path.extension()?.to_str()?;
    Some(Job {
        id: id.to_string(),
        extension: extension.to_string(),
    })
}
