//! Application directory layout and idempotent bootstrap.
//!
//! Four directories live under the storage root:
//! - `temporary` — upload staging, pre-queue
//! - `queue` — awaiting or ready for compression
//! - `images` — final, retrievable artifacts
//! - `errors` — reserved sink for operator-driven recovery of failed jobs
//!
//! The rename from `queue` into `images` is the publish step; renames within
//! one volume are the only cross-component synchronization primitive for
//! "is this artifact ready".

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directory layout rooted at the configured storage path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temporary(&self) -> PathBuf {
        self.root.join("temporary")
    }

    pub fn queue(&self) -> PathBuf {
        self.root.join("queue")
    }

    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn errors(&self) -> PathBuf {
        self.root.join("errors")
    }

    /// Path of the state document.
    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// Create every application directory, idempotently.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            self.root.clone(),
            self.temporary(),
            self.queue(),
            self.images(),
            self.errors(),
        ] {
            fs::create_dir_all(&dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&dir, fs::Permissions::from_mode(0o777))?;
            }
        }
        Ok(())
    }
}
