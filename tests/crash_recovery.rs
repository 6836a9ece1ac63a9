//! Crash recovery integration tests
//!
//! A `compressing` entry in the state document can only be observed
//! mid-flight; after a restart no worker is running for it, so recovery must
//! demote it to `queued` and the next admission must pick it back up.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use imgpress::{
    Compressor, Config, Dispatcher, Ingress, JobState, Layout, StateStore, StateStoreError,
};
use tempfile::TempDir;

fn script(dir: &Path, body: &str) -> String {
    let path = dir.join("compress.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn wait_terminal(store: &StateStore, id: &str) -> JobState {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(state) = store.get(id).unwrap() {
            if state.is_terminal() {
                return state;
            }
        }
        assert!(Instant::now() < deadline, "job {id} never finished");
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn stale_in_flight_job_is_demoted_and_readmitted() {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path().join("storage"));
    layout.ensure().unwrap();
    let store = Arc::new(StateStore::open(layout.state_file()));

    // Simulate the crash: state says compressing, bytes still staged,
    // but no worker exists
    fs::write(layout.queue().join("01-wedged.png"), b"image").unwrap();
    store.set("01-wedged", JobState::Compressing).unwrap();

    let demoted = store.reset_in_flight().unwrap();
    assert_eq!(demoted, vec!["01-wedged".to_string()]);
    assert_eq!(store.get("01-wedged").unwrap(), Some(JobState::Queued));

    let tool = script(dir.path(), "exit 0");
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        &layout,
        Compressor::new(tool, None),
        1,
    );

    assert_eq!(dispatcher.admit().unwrap(), 1);
    assert_eq!(wait_terminal(&store, "01-wedged"), JobState::Finished);
    dispatcher.drain().unwrap();
    assert!(layout.images().join("01-wedged.png").exists());
}

#[test]
fn recovery_is_idempotent_and_leaves_other_states_alone() {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path().join("storage"));
    layout.ensure().unwrap();
    let store = StateStore::open(layout.state_file());

    store.set("01-running", JobState::Compressing).unwrap();
    store.set("02-done", JobState::Finished).unwrap();
    store.set("03-broken", JobState::Error).unwrap();
    store.set("04-waiting", JobState::Queued).unwrap();

    store.reset_in_flight().unwrap();
    assert!(store.reset_in_flight().unwrap().is_empty());

    let states = store.all().unwrap();
    assert_eq!(states.get("01-running"), Some(&JobState::Queued));
    assert_eq!(states.get("02-done"), Some(&JobState::Finished));
    assert_eq!(states.get("03-broken"), Some(&JobState::Error));
    assert_eq!(states.get("04-waiting"), Some(&JobState::Queued));
}

#[test]
fn demoted_entry_without_staged_bytes_is_not_admittable() {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path().join("storage"));
    layout.ensure().unwrap();
    let store = Arc::new(StateStore::open(layout.state_file()));

    // Crash left state behind but the queue file is gone; the registry must
    // not wedge on the dangling entry
    store.set("01-ghost", JobState::Compressing).unwrap();
    store.reset_in_flight().unwrap();

    let tool = script(dir.path(), "exit 0");
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        &layout,
        Compressor::new(tool, None),
        1,
    );

    assert_eq!(dispatcher.admit().unwrap(), 0);
    assert_eq!(store.get("01-ghost").unwrap(), Some(JobState::Queued));
}

#[test]
fn ingest_leaves_another_process_in_flight_job_alone() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage_root = dir.path().join("storage");
    config.compressor = script(dir.path(), "printf smaller > \"$1\"");
    let layout = config.layout();
    layout.ensure().unwrap();

    let store = Arc::new(StateStore::open(layout.state_file()));

    // A worker in some other process owns this job right now; the recovery
    // edge applies only at that process's own startup, never from here
    fs::write(layout.queue().join("00-elsewhere.png"), b"live bytes").unwrap();
    store.set("00-elsewhere", JobState::Compressing).unwrap();

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        &layout,
        Compressor::new(&config.compressor, None),
        2,
    );
    let ingress = Ingress::new(config, Arc::clone(&store), Arc::clone(&dispatcher));

    let admission = ingress.ingest(b"photo bytes", "photo.png").unwrap();
    assert_eq!(wait_terminal(&store, &admission.id), JobState::Finished);
    dispatcher.drain().unwrap();

    assert_eq!(
        store.get("00-elsewhere").unwrap(),
        Some(JobState::Compressing)
    );
    assert_eq!(
        fs::read(layout.queue().join("00-elsewhere.png")).unwrap(),
        b"live bytes"
    );
}

#[test]
fn malformed_state_document_blocks_recovery() {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path().join("storage"));
    layout.ensure().unwrap();
    fs::write(layout.state_file(), "][ not json").unwrap();

    let store = StateStore::open(layout.state_file());
    assert!(matches!(
        store.reset_in_flight().unwrap_err(),
        StateStoreError::Malformed { .. }
    ));
}
