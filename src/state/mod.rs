//! Job lifecycle state machine
//!
//! Job states: TEMPORARY → QUEUED → COMPRESSING → {FINISHED | ERROR},
//! with the single recovery edge COMPRESSING → QUEUED applied at startup
//! when no worker can actually be running for the job.

use serde::{Deserialize, Serialize};

mod store;

pub use store::{StateStore, StateStoreError};

/// Lifecycle state of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Bytes written to the temporary directory, not yet staged
    Temporary,
    /// Staged in the queue directory, waiting for admission
    Queued,
    /// A worker is running the external compressor for this job
    Compressing,
    /// Artifact published to the images directory
    Finished,
    /// Compression or publishing failed; bytes left in place for an operator
    Error,
}

impl JobState {
    /// Check whether a transition from this state to `target` is valid.
    ///
    /// The recovery edge COMPRESSING → QUEUED is legal only because a
    /// restarted process cannot have a live worker; callers apply it via
    /// [`StateStore::reset_in_flight`], never ad hoc.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        match (self, target) {
            (JobState::Temporary, JobState::Queued) => true,
            // Pass-through uploads skip the queue entirely
            (JobState::Temporary, JobState::Finished) => true,

            (JobState::Queued, JobState::Compressing) => true,

            (JobState::Compressing, JobState::Finished) => true,
            (JobState::Compressing, JobState::Error) => true,
            // Startup recovery: demote a stale in-flight entry
            (JobState::Compressing, JobState::Queued) => true,

            // Terminal states never advance
            _ => false,
        }
    }

    /// True for states no job ever leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Error)
    }

    /// The state name as it appears in the state document.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Temporary => "temporary",
            JobState::Queued => "queued",
            JobState::Compressing => "compressing",
            JobState::Finished => "finished",
            JobState::Error => "error",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
