//! Compression worker: external tool invocation and artifact publishing.
//!
//! The compressor is an opaque executable invoked with the file path as its
//! sole positional argument; it mutates the file in place and signals success
//! with a zero exit status. On any failure the original bytes are left at the
//! queue path untouched so an operator can inspect or re-stage them. There is
//! no internal retry.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::job::Job;

/// How often a worker polls a running tool for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors from a single job execution. Every variant maps to the terminal
/// `error` state; none of them escapes the worker boundary.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("compressor {program:?} failed to start: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("compressor exited with status {code:?}")]
    NonZeroExit { code: Option<i32> },

    #[error("compressor exceeded {limit:?} and was killed")]
    Timeout { limit: Duration },

    #[error("failed to publish artifact: {0}")]
    Publish(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle for invoking the external compression tool.
#[derive(Debug, Clone)]
pub struct Compressor {
    program: String,
    timeout: Option<Duration>,
}

impl Compressor {
    pub fn new(program: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Run the tool against `path` and wait for it to exit.
    ///
    /// Polls rather than blocking in `wait` so a configured timeout can kill
    /// a hung tool; a killed tool reports `Timeout`, never silent success.
    pub fn run(&self, path: &Path) -> Result<(), WorkerError> {
        let started = Instant::now();

        let mut child = Command::new(&self.program)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(WorkerError::Timeout { limit });
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            return Err(WorkerError::NonZeroExit {
                code: status.code(),
            });
        }
        Ok(())
    }
}

/// Execute one job: compress in place, then publish.
///
/// The rename into the images directory is the step that makes the artifact
/// retrievable; compression success without a successful publish is still a
/// job failure.
pub fn execute(
    compressor: &Compressor,
    job: &Job,
    queue_dir: &Path,
    images_dir: &Path,
) -> Result<(), WorkerError> {
    let current_path = job.path_in(queue_dir);
    let final_path = job.path_in(images_dir);

    compressor.run(&current_path)?;

    std::fs::rename(&current_path, &final_path).map_err(WorkerError::Publish)?;
    Ok(())
}
