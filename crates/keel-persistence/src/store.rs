//! The versioned configuration store.
//!
//! [`FileConfigStore`] keeps the committed state in memory behind an
//! `RwLock` and on disk as immutable version files plus a versioned
//! central index. A commit always writes the new version durably before
//! any index references it:
//!
//! 1. take the cluster's commit lock (commits to other clusters proceed)
//! 2. write `cluster-{id}.v{n+1}.cfg` via tmp + fsync + rename
//! 3. take the index lock, write `index.v{m+1}.idx` the same way
//! 4. publish the new index and version in memory
//!
//! A crash between 2 and 3 leaves an unreferenced version file, which
//! the next commit overwrites and garbage collection removes. The old
//! committed version is never touched.
//!
//! Lock order is always cluster lock, then index lock, then state lock.
//! Across processes, the directory is held with an exclusive lock on its
//! `LOCK` file for as long as the store is open.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use bytes::{BufMut, Bytes, BytesMut};
use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::format::{self, TMP_SUFFIX};
use crate::index::{self, CentralIndex, IndexEntry};
use crate::recovery::{load_from_files, LoadReport, RecoveryPolicy};
use crate::version::{self, ConfigVersion, VersionInfo};

/// A cluster as listed by [`ConfigStore::clusters`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSummary {
    pub cluster_id: u32,
    pub name: String,
    /// The committed version.
    pub version: u32,
    /// False when the committed version couldn't be loaded.
    pub available: bool,
}

/// Read and commit access to per-cluster configuration. Shared by every
/// session of a server.
pub trait ConfigStore: Send + Sync {
    /// The committed configuration of a cluster.
    fn get_configuration(&self, cluster_id: u32) -> Result<Arc<ConfigVersion>, StoreError>;

    /// Commits `payload` as the next version of an existing cluster and
    /// returns the new version number.
    fn commit_update(&self, cluster_id: u32, payload: Bytes) -> Result<u32, StoreError>;

    /// Every cluster in the index, ordered by id.
    fn clusters(&self) -> Vec<ClusterSummary>;
}

/// Checks that a payload can travel as protocol lines and be read back
/// from a version file: UTF-8 text without carriage returns, no longer
/// than a stored field.
pub fn validate_payload(payload: &[u8]) -> Result<(), StoreError> {
    if payload.len() > format::MAX_FIELD_LEN {
        return Err(StoreError::InvalidPayload(format!(
            "{} bytes exceeds the limit of {}",
            payload.len(),
            format::MAX_FIELD_LEN
        )));
    }
    if std::str::from_utf8(payload).is_err() {
        return Err(StoreError::InvalidPayload("not valid utf-8".into()));
    }
    if payload.contains(&b'\r') {
        return Err(StoreError::InvalidPayload(
            "carriage returns are not allowed".into(),
        ));
    }
    Ok(())
}

/// Gives a payload the form it has on the wire: every line ends in `\n`.
/// A payload without a final newline gets one; an empty payload stays
/// empty. The result is validated.
pub fn normalize_payload(payload: Bytes) -> Result<Bytes, StoreError> {
    let payload = match payload.last().copied() {
        None | Some(b'\n') => payload,
        Some(_) => {
            let mut buf = BytesMut::with_capacity(payload.len() + 1);
            buf.extend_from_slice(&payload);
            buf.put_u8(b'\n');
            buf.freeze()
        }
    };
    validate_payload(&payload)?;
    Ok(payload)
}

/// Cluster names are single protocol tokens.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(StoreError::InvalidName(name.to_owned()));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct StoreState {
    index: CentralIndex,
    versions: HashMap<u32, Arc<ConfigVersion>>,
    unavailable: HashMap<u32, String>,
}

/// What [`FileConfigStore::garbage_collect`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub removed_versions: usize,
    pub removed_indexes: usize,
    pub removed_tmp: usize,
}

/// Name of the file a store locks to claim its directory.
pub const LOCK_FILE: &str = "LOCK";

/// Directory-backed configuration store.
#[derive(Debug)]
pub struct FileConfigStore {
    dir: PathBuf,
    // released when the store drops
    _lock: File,
    state: RwLock<StoreState>,
    cluster_locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
    index_lock: Mutex<()>,
}

impl FileConfigStore {
    /// Opens the store in `dir`, creating the directory if needed, and
    /// loads the current index.
    pub fn open(
        dir: impl Into<PathBuf>,
        policy: RecoveryPolicy,
    ) -> Result<(Self, LoadReport), StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let lock = lock_dir(&dir)?;
        let loaded = load_from_files(&dir, policy)?;

        let store = Self {
            dir,
            _lock: lock,
            state: RwLock::new(StoreState {
                index: loaded.index,
                versions: loaded.versions,
                unavailable: loaded.unavailable,
            }),
            cluster_locks: Mutex::new(HashMap::new()),
            index_lock: Mutex::new(()),
        };
        Ok((store, loaded.report))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The current central index version.
    pub fn index_version(&self) -> u32 {
        self.read_state().index.index_version
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn cluster_lock(&self, cluster_id: u32) -> Arc<Mutex<()>> {
        let mut locks = self.cluster_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(cluster_id).or_default())
    }

    /// Writes the next index built by `edit` and publishes it together
    /// with `publish`. Holds the index lock throughout so concurrent
    /// commits to different clusters can't drop each other's entries.
    fn advance_index<E, P>(&self, edit: E, publish: P) -> Result<u32, StoreError>
    where
        E: FnOnce(&CentralIndex) -> Result<CentralIndex, StoreError>,
        P: FnOnce(&mut StoreState),
    {
        let _index = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let next = {
            let state = self.read_state();
            edit(&state.index)?
        };
        index::write_index_file(&self.dir, &next)?;

        let index_version = next.index_version;
        let mut state = self.write_state();
        state.index = next;
        publish(&mut state);
        Ok(index_version)
    }

    /// Installs `payload` as version 1 of `cluster_id`.
    ///
    /// Fails with [`StoreError::AlreadyBootstrapped`] if the cluster is
    /// already in the index, unless `overwrite` is set, in which case the
    /// cluster is removed first and starts over.
    pub fn bootstrap_cluster(
        &self,
        cluster_id: u32,
        name: &str,
        payload: Bytes,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        validate_name(name)?;
        let payload = normalize_payload(payload)?;

        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.read_state().index.contains(cluster_id) {
            if !overwrite {
                return Err(StoreError::AlreadyBootstrapped(cluster_id));
            }
            warn!(cluster_id, "overwriting existing cluster configuration");
            self.remove_locked(cluster_id)?;
        }

        let version = Arc::new(ConfigVersion::new(cluster_id, 1, name, payload));
        version::write_version_file(&self.dir, &version)?;

        let entry = IndexEntry::new(cluster_id, 1, name);
        let index_version = self.advance_index(
            |index| Ok(index.with_entry(entry)?),
            |state| {
                state.unavailable.remove(&cluster_id);
                state.versions.insert(cluster_id, version);
            },
        )?;

        info!(cluster_id, name, index_version, "cluster bootstrapped");
        Ok(())
    }

    /// Removes a cluster: the index stops referencing it first, then its
    /// version files are deleted. Returns the number of files deleted.
    pub fn remove_cluster(&self, cluster_id: u32) -> Result<usize, StoreError> {
        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.read_state().index.contains(cluster_id) {
            return Err(StoreError::NotFound(cluster_id));
        }
        self.remove_locked(cluster_id)
    }

    fn remove_locked(&self, cluster_id: u32) -> Result<usize, StoreError> {
        let index_version = self.advance_index(
            |index| Ok(index.without(cluster_id)?),
            |state| {
                state.versions.remove(&cluster_id);
                state.unavailable.remove(&cluster_id);
            },
        )?;

        let mut removed = 0;
        for (version, path) in self.version_files(cluster_id)? {
            fs::remove_file(&path)?;
            debug!(cluster_id, version, "removed version file");
            removed += 1;
        }
        format::sync_dir(&self.dir)?;

        info!(cluster_id, index_version, removed, "cluster removed");
        Ok(removed)
    }

    /// Version files of one cluster present on disk, by version.
    fn version_files(&self, cluster_id: u32) -> Result<BTreeMap<u32, PathBuf>, StoreError> {
        let mut found = BTreeMap::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            if let Some((id, v)) = name.to_str().and_then(version::parse_version_file_name) {
                if id == cluster_id {
                    found.insert(v, dirent.path());
                }
            }
        }
        Ok(found)
    }

    /// Metadata for every version file of a cluster still on disk.
    pub fn history(&self, cluster_id: u32) -> Result<Vec<VersionInfo>, StoreError> {
        let committed = match self.read_state().index.get(cluster_id) {
            Some(entry) => entry.version,
            None => return Err(StoreError::NotFound(cluster_id)),
        };

        let mut history = Vec::new();
        for (v, path) in self.version_files(cluster_id)? {
            match version::read_version_file(&path) {
                Ok(loaded) => history.push(VersionInfo {
                    version: v,
                    created_ms: loaded.created_ms,
                    payload_len: loaded.payload.len(),
                    committed: v <= committed,
                }),
                Err(e) => warn!(cluster_id, version = v, "unreadable version file: {e}"),
            }
        }
        Ok(history)
    }

    /// Deletes files no index will reference again: version files newer
    /// than their cluster's committed version (or of clusters not in the
    /// index), leftover temp files, and all but the newest
    /// `keep_indexes` index files (at least one is always kept).
    pub fn garbage_collect(&self, keep_indexes: usize) -> Result<GcReport, StoreError> {
        let mut report = GcReport::default();

        let mut by_cluster: BTreeMap<u32, Vec<(u32, PathBuf)>> = BTreeMap::new();
        let mut tmp_files = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(base) = name.strip_suffix(TMP_SUFFIX) {
                tmp_files.push((base.to_owned(), dirent.path()));
            } else if let Some((id, v)) = version::parse_version_file_name(name) {
                by_cluster.entry(id).or_default().push((v, dirent.path()));
            }
        }

        for (cluster_id, files) in by_cluster {
            // a commit in flight holds this lock between writing its
            // version file and publishing the index that references it
            let lock = self.cluster_lock(cluster_id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            let committed = self.read_state().index.get(cluster_id).map(|e| e.version);

            for (v, path) in files {
                if committed.map_or(true, |c| v > c) {
                    fs::remove_file(&path)?;
                    debug!(cluster_id, version = v, "collected orphaned version file");
                    report.removed_versions += 1;
                }
            }
        }

        for (base, path) in tmp_files {
            let guard_cluster = version::parse_version_file_name(&base).map(|(id, _)| id);
            let lock = guard_cluster.map(|id| self.cluster_lock(id));
            let _cluster = lock.as_ref().map(|l| l.lock().unwrap_or_else(|e| e.into_inner()));
            let _index = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
            if path.exists() {
                fs::remove_file(&path)?;
                report.removed_tmp += 1;
            }
        }

        {
            let _index = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
            let current = self.read_state().index.index_version;
            let keep = keep_indexes.max(1);
            let mut kept = 0;
            // anything newer than the loaded index failed to decode at open
            for (n, path) in index::list_index_files(&self.dir)? {
                if n <= current && kept < keep {
                    kept += 1;
                    continue;
                }
                fs::remove_file(&path)?;
                report.removed_indexes += 1;
            }
        }

        format::sync_dir(&self.dir)?;
        info!(
            removed_versions = report.removed_versions,
            removed_indexes = report.removed_indexes,
            removed_tmp = report.removed_tmp,
            "garbage collection finished"
        );
        Ok(report)
    }
}

fn lock_dir(dir: &Path) -> Result<File, StoreError> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;
    file.try_lock_exclusive()
        .map_err(|_| StoreError::Locked(dir.to_path_buf()))?;
    Ok(file)
}

impl ConfigStore for FileConfigStore {
    fn get_configuration(&self, cluster_id: u32) -> Result<Arc<ConfigVersion>, StoreError> {
        let state = self.read_state();
        if let Some(version) = state.versions.get(&cluster_id) {
            return Ok(Arc::clone(version));
        }
        match state.unavailable.get(&cluster_id) {
            Some(reason) => Err(StoreError::Unavailable {
                cluster_id,
                reason: reason.clone(),
            }),
            None => Err(StoreError::NotFound(cluster_id)),
        }
    }

    fn commit_update(&self, cluster_id: u32, payload: Bytes) -> Result<u32, StoreError> {
        let payload = normalize_payload(payload)?;

        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let current = self.get_configuration(cluster_id)?;
        let next = current
            .version
            .checked_add(1)
            .ok_or(StoreError::VersionOverflow(cluster_id))?;

        // an orphan from a crashed commit may already hold this number;
        // the atomic write replaces it
        let version = Arc::new(ConfigVersion::new(
            cluster_id,
            next,
            current.name.clone(),
            payload,
        ));
        version::write_version_file(&self.dir, &version)?;

        let entry = IndexEntry::new(cluster_id, next, current.name.clone());
        let index_version = self.advance_index(
            |index| Ok(index.with_entry(entry)?),
            |state| {
                state.versions.insert(cluster_id, version);
            },
        )?;

        info!(cluster_id, version = next, index_version, "configuration committed");
        Ok(next)
    }

    fn clusters(&self) -> Vec<ClusterSummary> {
        let state = self.read_state();
        state
            .index
            .entries()
            .map(|entry| ClusterSummary {
                cluster_id: entry.cluster_id,
                name: entry.name.clone(),
                version: entry.version,
                available: state.versions.contains_key(&entry.cluster_id),
            })
            .collect()
    }
}

/// Reads `config_file` and installs it as version 1 of `cluster_id` in
/// the store at `config_dir`.
pub fn bootstrap(
    config_file: &Path,
    config_dir: &Path,
    cluster_id: u32,
    name: &str,
    overwrite: bool,
) -> Result<(), StoreError> {
    let payload = fs::read(config_file)?;
    let (store, _) = FileConfigStore::open(config_dir, RecoveryPolicy::Strict)?;
    store.bootstrap_cluster(cluster_id, name, Bytes::from(payload), overwrite)
}
