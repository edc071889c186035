//! Configuration store errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::format::FormatError;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Bootstrap was re-run for a cluster that already has a committed
    /// configuration, without asking to overwrite it.
    #[error("cluster {0} is already bootstrapped")]
    AlreadyBootstrapped(u32),

    #[error("cluster {0} not found")]
    NotFound(u32),

    /// The cluster is in the index but its committed version couldn't be
    /// loaded. Only reported when the store was opened in degraded mode.
    #[error("cluster {cluster_id} is unavailable: {reason}")]
    Unavailable { cluster_id: u32, reason: String },

    /// The index references a version that isn't on disk, or whose file
    /// doesn't decode to what the index says.
    #[error("index references cluster {cluster_id} version {version}, which is unusable: {reason}")]
    DanglingReference {
        cluster_id: u32,
        version: u32,
        reason: String,
    },

    /// Index files exist but none of them could be decoded.
    #[error("no readable central index in {0}")]
    NoIndex(PathBuf),

    /// Another store (usually another server process) holds the directory.
    #[error("configuration directory {0} is in use by another process")]
    Locked(PathBuf),

    #[error("invalid configuration payload: {0}")]
    InvalidPayload(String),

    #[error("invalid cluster name '{0}'")]
    InvalidName(String),

    /// Version numbers are u32 and the cluster has used them all.
    #[error("cluster {0} has no version numbers left")]
    VersionOverflow(u32),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Whether this error means the on-disk state can't be trusted, as
    /// opposed to a bad request or a transient I/O failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::DanglingReference { .. }
                | StoreError::NoIndex(_)
                | StoreError::Unavailable { .. }
        )
    }
}
