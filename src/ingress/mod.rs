//! Upload admission.
//!
//! Accepts `(bytes, filename)` and hands the job to the core. The operation
//! order is what makes a crash recoverable: bytes are staged before state is
//! written, and the queue move happens before the `queued` state write. A
//! crash can therefore leave bytes with no state (a lost upload, safely
//! ignored by the registry) but never a `queued` entry pointing at bytes that
//! were never staged.

use std::fs;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::job::{self, Job, JobError};
use crate::state::{JobState, StateStore, StateStoreError};
use crate::storage::Layout;

/// Result of a successful admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub id: String,
    /// Jobs queued or compressing at admission time, this one included.
    /// Zero for pass-through uploads.
    pub queue_position: usize,
    /// False when the extension is permitted but not compressible and the
    /// file went straight to its final location.
    pub queued: bool,
}

/// Errors reported synchronously to the uploader.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error(transparent)]
    Reject(#[from] JobError),

    #[error("failed to stage upload: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Admission surface: validates, stages, and records uploads.
pub struct Ingress {
    config: Config,
    layout: Layout,
    store: Arc<StateStore>,
    dispatcher: Arc<Dispatcher>,
}

impl Ingress {
    pub fn new(
        config: Config,
        store: Arc<StateStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let layout = config.layout();
        Self {
            config,
            layout,
            store,
            dispatcher,
        }
    }

    /// Admit an upload and trigger dispatch for compressible types.
    pub fn ingest(&self, bytes: &[u8], filename: &str) -> Result<Admission, IngressError> {
        let admission = self.stage(bytes, filename)?;
        if admission.queued {
            self.dispatcher.admit()?;
        }
        Ok(admission)
    }

    /// Admit an upload without dispatching; a separate `run` process picks
    /// the job up from the queue directory.
    pub fn stage(&self, bytes: &[u8], filename: &str) -> Result<Admission, IngressError> {
        // Everything that can be rejected is rejected before any state exists
        let extension = job::parse_extension(filename)?;
        if !self.config.is_permitted(&extension) {
            return Err(JobError::ExtensionNotPermitted(extension).into());
        }

        let job = Job {
            id: job::generate_job_id(),
            extension,
        };

        let temporary_path = job.path_in(&self.layout.temporary());
        let queue_path = job.path_in(&self.layout.queue());

        fs::write(&temporary_path, bytes)?;
        self.store.advance(&job.id, JobState::Temporary)?;

        fs::rename(&temporary_path, &queue_path)?;

        if !self.config.is_compressible(&job.extension) {
            // Pass-through: publish immediately, no dispatcher involvement
            fs::rename(&queue_path, job.path_in(&self.layout.images()))?;
            self.store.advance(&job.id, JobState::Finished)?;
            tracing::info!(job_id = %job.id, extension = %job.extension, "upload passed through");
            return Ok(Admission {
                id: job.id,
                queue_position: 0,
                queued: false,
            });
        }

        self.store.advance(&job.id, JobState::Queued)?;

        let queue_position = self
            .store
            .all()?
            .values()
            .filter(|s| matches!(s, JobState::Queued | JobState::Compressing))
            .count();

        tracing::info!(
            job_id = %job.id,
            extension = %job.extension,
            queue_position,
            "upload queued for compression",
        );

        Ok(Admission {
            id: job.id,
            queue_position,
            queued: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Compressor;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Ingress, Arc<StateStore>) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage_root = dir.path().join("storage");
        let layout = config.layout();
        layout.ensure().unwrap();

        let store = Arc::new(StateStore::open(layout.state_file()));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            &layout,
            Compressor::new(&config.compressor, config.timeout()),
            config.max_concurrent,
        );
        let ingress = Ingress::new(config, Arc::clone(&store), dispatcher);
        (dir, ingress, store)
    }

    #[test]
    fn rejects_unpermitted_extension_without_creating_state() {
        let (_dir, ingress, store) = fixture();
        let err = ingress.stage(b"bytes", "malware.exe").unwrap_err();
        assert!(matches!(
            err,
            IngressError::Reject(JobError::ExtensionNotPermitted(_))
        ));
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn rejects_filename_without_extension() {
        let (_dir, ingress, store) = fixture();
        assert!(ingress.stage(b"bytes", "noextension").is_err());
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn staged_upload_lands_in_queue_as_queued() {
        let (dir, ingress, store) = fixture();
        let admission = ingress.stage(b"image bytes", "photo.PNG").unwrap();

        assert!(admission.queued);
        assert_eq!(admission.queue_position, 1);
        assert_eq!(
            store.get(&admission.id).unwrap(),
            Some(JobState::Queued)
        );

        // Extension is lower-cased in the staged file name
        let queue_file = dir
            .path()
            .join("storage/queue")
            .join(format!("{}.png", admission.id));
        assert_eq!(std::fs::read(queue_file).unwrap(), b"image bytes");

        // Nothing left behind in the temporary directory
        let leftovers = std::fs::read_dir(dir.path().join("storage/temporary"))
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn queue_position_counts_queued_and_compressing() {
        let (_dir, ingress, store) = fixture();
        store.set("00-already-running", JobState::Compressing).unwrap();
        store.set("00-finished-long-ago", JobState::Finished).unwrap();

        let admission = ingress.stage(b"bytes", "a.png").unwrap();
        assert_eq!(admission.queue_position, 2);

        let admission = ingress.stage(b"bytes", "b.jpg").unwrap();
        assert_eq!(admission.queue_position, 3);
    }

    #[test]
    fn gif_passes_through_to_images() {
        let (dir, ingress, store) = fixture();
        let admission = ingress.ingest(b"gif bytes", "anim.gif").unwrap();

        assert!(!admission.queued);
        assert_eq!(admission.queue_position, 0);
        assert_eq!(
            store.get(&admission.id).unwrap(),
            Some(JobState::Finished)
        );

        let image = dir
            .path()
            .join("storage/images")
            .join(format!("{}.gif", admission.id));
        assert_eq!(std::fs::read(image).unwrap(), b"gif bytes");

        // Neither temporary nor queue kept a copy
        assert_eq!(
            std::fs::read_dir(dir.path().join("storage/queue")).unwrap().count(),
            0
        );
    }
}
