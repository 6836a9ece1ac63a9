//! imgpress - queued image compression service
//!
//! Uploaded files are staged through temporary → queue → compressing →
//! finished, with compression delegated to an external tool under a bounded
//! concurrency budget. Per-job lifecycle state is persisted in a single JSON
//! document, which is the sole source of truth for crash recovery.

pub mod config;
pub mod dispatcher;
pub mod egress;
pub mod ingress;
pub mod job;
pub mod registry;
pub mod state;
pub mod storage;
pub mod worker;

pub use config::Config;
pub use dispatcher::{DispatchError, Dispatcher};
pub use egress::{Egress, EgressError};
pub use ingress::{Admission, Ingress, IngressError};
pub use job::{Job, JobError};
pub use registry::JobRegistry;
pub use state::{JobState, StateStore, StateStoreError};
pub use storage::Layout;
pub use worker::{Compressor, WorkerError};
