//! Bounded-concurrency job dispatch.
//!
//! The dispatcher owns the `in_flight` counter outright: every admission
//! decision and every completion runs under its mutex, so concurrent worker
//! completions cannot race past each other and jointly over-admit. Workers
//! are detached threads; each finishing worker persists its terminal state,
//! releases its slot, and re-invokes `admit`, which is how the queue stays
//! saturated without a polling loop.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, Weak};

use thiserror::Error;

use crate::job::Job;
use crate::registry::JobRegistry;
use crate::state::{JobState, StateStore, StateStoreError};
use crate::storage::Layout;
use crate::worker::{self, Compressor};

/// Errors from admission and completion handling.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error("in-flight count {in_flight} exceeds budget {max_concurrent}")]
    BudgetExceeded {
        in_flight: usize,
        max_concurrent: usize,
    },

    #[error("dispatcher entered a fatal state: {0}")]
    Fatal(String),
}

#[derive(Debug)]
struct Inner {
    in_flight: usize,
    /// First structural failure observed on a worker thread. Once set, the
    /// dispatcher refuses further admissions; the process cannot keep
    /// operating on a state store it failed to write.
    fatal: Option<String>,
}

/// Decides which queued jobs may start compressing right now.
#[derive(Debug)]
pub struct Dispatcher {
    store: Arc<StateStore>,
    registry: JobRegistry,
    compressor: Compressor,
    queue_dir: PathBuf,
    images_dir: PathBuf,
    max_concurrent: usize,
    inner: Mutex<Inner>,
    idle: Condvar,
    /// Handle to ourselves for worker threads; workers must outlive the
    /// caller's borrow, so they carry an owned `Arc`.
    self_ref: Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<StateStore>,
        layout: &Layout,
        compressor: Compressor,
        max_concurrent: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            registry: JobRegistry::new(layout.queue()),
            compressor,
            queue_dir: layout.queue(),
            images_dir: layout.images(),
            max_concurrent,
            inner: Mutex::new(Inner {
                in_flight: 0,
                fatal: None,
            }),
            idle: Condvar::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Jobs currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).in_flight
    }

    /// Admit queued jobs up to the remaining capacity.
    ///
    /// Re-entrant: called at startup after recovery, by ingress after each
    /// staging, and by every completing worker. With no capacity or nothing
    /// admittable this is a no-op. Returns the number of workers launched.
    pub fn admit(&self) -> Result<usize, DispatchError> {
        let this = self
            .self_ref
            .upgrade()
            .ok_or_else(|| DispatchError::Fatal("dispatcher handle dropped".to_string()))?;

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(reason) = &inner.fatal {
            return Err(DispatchError::Fatal(reason.clone()));
        }
        if inner.in_flight > self.max_concurrent {
            return Err(DispatchError::BudgetExceeded {
                in_flight: inner.in_flight,
                max_concurrent: self.max_concurrent,
            });
        }

        let capacity = self.max_concurrent - inner.in_flight;
        if capacity == 0 {
            return Ok(0);
        }

        let admittable = self.registry.list_admittable(&self.store)?;
        if admittable.is_empty() {
            return Ok(0);
        }

        let mut launched = 0;
        for job in admittable.into_iter().take(capacity) {
            self.store.advance(&job.id, JobState::Compressing)?;
            inner.in_flight += 1;
            launched += 1;

            tracing::info!(
                job_id = %job.id,
                in_flight = inner.in_flight,
                max_concurrent = self.max_concurrent,
                "job admitted",
            );

            let dispatcher = Arc::clone(&this);
            std::thread::spawn(move || dispatcher.run_worker(job));
        }

        Ok(launched)
    }

    /// Block until every in-flight worker has completed.
    pub fn drain(&self) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // A fatal worker never returns its slot, so waiting on the counter
        // alone would hang forever
        while inner.in_flight > 0 && inner.fatal.is_none() {
            inner = self.idle.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
        match &inner.fatal {
            Some(reason) => Err(DispatchError::Fatal(reason.clone())),
            None => Ok(()),
        }
    }

    /// Worker thread body: run the job, then hand back the slot.
    ///
    /// Per-job failures are converted into the persisted `error` state here;
    /// nothing a single job does may crash the process.
    fn run_worker(self: Arc<Self>, job: Job) {
        let outcome = worker::execute(&self.compressor, &job, &self.queue_dir, &self.images_dir);

        let terminal = match &outcome {
            Ok(()) => {
                tracing::info!(job_id = %job.id, "compression finished");
                JobState::Finished
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "compression failed");
                JobState::Error
            }
        };

        self.complete(&job, terminal);
    }

    /// Persist the terminal state, release the slot, re-evaluate the queue.
    fn complete(&self, job: &Job, terminal: JobState) {
        if let Err(e) = self.store.advance(&job.id, terminal) {
            self.record_fatal(format!("failed to persist terminal state for {}: {e}", job.id));
            return;
        }

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.in_flight.checked_sub(1) {
                Some(remaining) => inner.in_flight = remaining,
                None => {
                    inner.fatal = Some("in-flight counter underflow".to_string());
                }
            }
            self.idle.notify_all();
        }

        if let Err(e) = self.admit() {
            match e {
                // Fatal is already recorded; anything else becomes fatal now,
                // because a failed re-admission would strand queued jobs.
                DispatchError::Fatal(_) => {}
                other => self.record_fatal(format!("queue re-evaluation failed: {other}")),
            }
        }
    }

    fn record_fatal(&self, reason: String) {
        tracing::error!(reason = %reason, "dispatcher fatal");
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.fatal.is_none() {
            inner.fatal = Some(reason);
        }
        self.idle.notify_all();
    }
}
