//! Recovery: rebuilding the store's state from its directory on startup.
//!
//! The recovery sequence is:
//! 1. List index files, newest first.
//! 2. Take the newest one that decodes and checksums cleanly. Torn or
//!    corrupt index files are skipped with a warning.
//! 3. Load every version the index references and check it is the
//!    version the index says it is.
//! 4. A reference that doesn't resolve is corruption. Strict recovery
//!    fails the whole load; degraded recovery marks that one cluster
//!    unavailable and keeps the rest.
//! 5. An empty (or missing) directory is a fresh store with an empty
//!    index. Index files that exist but all fail to decode are fatal.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::StoreError;
use crate::index::{self, CentralIndex, IndexEntry};
use crate::version::{self, ConfigVersion};

/// How to treat an index entry whose version can't be loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Fail the load with [`StoreError::DanglingReference`].
    #[default]
    Strict,
    /// Load everything else and report the cluster as unavailable.
    Degraded,
}

/// What a load found, for logging and operator tooling.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// The index file that was loaded, if any.
    pub index_path: Option<PathBuf>,
    pub index_version: u32,
    /// Newer index files that were skipped because they didn't decode.
    pub skipped_indexes: Vec<PathBuf>,
    /// Clusters loaded successfully.
    pub loaded: usize,
    /// Clusters left unavailable, with the reason. Always empty under
    /// [`RecoveryPolicy::Strict`].
    pub unavailable: Vec<(u32, String)>,
}

/// Everything the store serves from, as rebuilt from disk.
#[derive(Debug, Default)]
pub struct LoadedState {
    pub index: CentralIndex,
    pub versions: HashMap<u32, Arc<ConfigVersion>>,
    pub unavailable: HashMap<u32, String>,
    pub report: LoadReport,
}

/// Rebuilds the store state from the files in `dir`.
pub fn load_from_files(dir: &Path, policy: RecoveryPolicy) -> Result<LoadedState, StoreError> {
    let candidates = match index::list_index_files(dir) {
        Ok(found) => found,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut report = LoadReport::default();
    let mut chosen = None;
    for (n, path) in candidates.iter() {
        match index::read_index_file(path) {
            Ok(idx) if idx.index_version == *n => {
                chosen = Some((idx, path.clone()));
                break;
            }
            Ok(idx) => {
                warn!(
                    path = %path.display(),
                    "index file claims version {}, skipping",
                    idx.index_version
                );
                report.skipped_indexes.push(path.clone());
            }
            Err(e) => {
                warn!(path = %path.display(), "unreadable index file, trying an older one: {e}");
                report.skipped_indexes.push(path.clone());
            }
        }
    }

    let Some((index, index_path)) = chosen else {
        if candidates.is_empty() {
            info!(dir = %dir.display(), "no central index found, starting empty");
            return Ok(LoadedState {
                report,
                ..LoadedState::default()
            });
        }
        return Err(StoreError::NoIndex(dir.to_path_buf()));
    };

    report.index_version = index.index_version;
    report.index_path = Some(index_path);

    let mut versions = HashMap::with_capacity(index.len());
    let mut unavailable = HashMap::new();
    for entry in index.entries() {
        match load_entry(dir, entry) {
            Ok(version) => {
                versions.insert(entry.cluster_id, Arc::new(version));
            }
            Err(reason) => match policy {
                RecoveryPolicy::Strict => {
                    return Err(StoreError::DanglingReference {
                        cluster_id: entry.cluster_id,
                        version: entry.version,
                        reason,
                    });
                }
                RecoveryPolicy::Degraded => {
                    warn!(
                        cluster_id = entry.cluster_id,
                        version = entry.version,
                        "cluster unavailable: {reason}"
                    );
                    report.unavailable.push((entry.cluster_id, reason.clone()));
                    unavailable.insert(entry.cluster_id, reason);
                }
            },
        }
    }

    report.loaded = versions.len();
    info!(
        index_version = index.index_version,
        loaded = report.loaded,
        unavailable = report.unavailable.len(),
        "configuration index loaded"
    );

    Ok(LoadedState {
        index,
        versions,
        unavailable,
        report,
    })
}

/// Loads and cross-checks one referenced version. The error is a
/// human-readable reason.
fn load_entry(dir: &Path, entry: &IndexEntry) -> Result<ConfigVersion, String> {
    let path = dir.join(&entry.file);
    let loaded = version::read_version_file(&path).map_err(|e| format!("{}: {e}", entry.file))?;
    if loaded.cluster_id != entry.cluster_id || loaded.version != entry.version {
        return Err(format!(
            "{} holds cluster {} version {}",
            entry.file, loaded.cluster_id, loaded.version
        ));
    }
    Ok(loaded)
}
