use std::io;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};

pub const DEFAULT_MARKER_PATH: &str = "/var/run/idshift.ran";

#[derive(Debug, thiserror::Error)]
#[error("can't write run-once marker {}: {source}", path.display())]
pub struct MarkerError {
    pub path: PathBuf,
    pub source: io::Error,
}

/// Empty file whose presence means the transition already happened on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOnceMarker {
    path: PathBuf,
}

impl RunOnceMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Anything but a clean "not found" counts as present, so an unreadable marker never causes
    /// a second rewrite.
    pub fn is_present(&self) -> bool {
        match std::fs::symlink_metadata(&self.path) {
            Ok(_) => true,
            Err(e) => e.kind() != io::ErrorKind::NotFound,
        }
    }

    pub fn mark(&self) -> Result<(), MarkerError> {
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&self.path)
            .map(drop)
            .map_err(|source| MarkerError {
                path: self.path.clone(),
                source,
            })
    }
}
