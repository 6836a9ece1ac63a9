//! Artifact retrieval.
//!
//! Only `finished` jobs are retrievable. The identifier is validated before
//! the state store or the filesystem is touched, and the artifact path is
//! resolved from the images directory alone, so partial bytes sitting in the
//! queue are never served.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use walkdir::WalkDir;

use crate::job::{self, JobError};
use crate::state::{JobState, StateStore, StateStoreError};
use crate::storage::Layout;

/// Errors from retrieval.
#[derive(Debug, Error)]
pub enum EgressError {
    #[error(transparent)]
    Reject(#[from] JobError),

    #[error("no finished artifact for identifier {0}")]
    NotFound(String),

    #[error(transparent)]
    State(#[from] StateStoreError),
}

/// Retrieval surface: looks up finished artifacts by identifier.
pub struct Egress {
    layout: Layout,
    store: Arc<StateStore>,
}

impl Egress {
    pub fn new(layout: Layout, store: Arc<StateStore>) -> Self {
        Self { layout, store }
    }

    /// Current lifecycle state for a valid identifier, if any.
    pub fn status(&self, id: &str) -> Result<Option<JobState>, EgressError> {
        job::validate_identifier(id)?;
        Ok(self.store.get(id)?)
    }

    /// Resolve the artifact path for a finished job.
    pub fn retrieve(&self, id: &str) -> Result<PathBuf, EgressError> {
        job::validate_identifier(id)?;

        match self.store.get(id)? {
            Some(JobState::Finished) => {}
            // Queued, compressing, error, or unknown all read as not found;
            // the caller learns nothing about jobs that are not ready
            _ => return Err(EgressError::NotFound(id.to_string())),
        }

        // The extension is not part of the identifier, so match on file stem
        WalkDir::new(self.layout.images())
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.into_path())
            .find(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .is_some_and(|stem| stem == id)
            })
            .ok_or_else(|| EgressError::NotFound(id.to_string()))
    }
}
