//! Central index files.
//!
//! The central index maps every known cluster to its committed version
//! and the file that holds it. The index is itself versioned: each
//! rewrite produces `index.v{n+1}.idx` next to the previous ones, and
//! the newest file that decodes cleanly is the current index. Older
//! index files are only removed by garbage collection.
//!
//! File layout:
//! ```text
//! [KIDX magic: 4B][format: 1B]
//! [index_version: 4B][entry_count: 4B]
//! [entries...]
//! [footer_crc32: 4B]
//! ```
//!
//! Each entry:
//! ```text
//! [cluster_id: 4B][version: 4B][name_len: 4B][name][file_len: 4B][file]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use crate::format::{self, FormatError};
use crate::version::version_file_name;

/// Where one cluster's committed configuration lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub cluster_id: u32,
    pub version: u32,
    pub name: String,
    /// File name relative to the configuration directory.
    pub file: String,
}

impl IndexEntry {
    pub fn new(cluster_id: u32, version: u32, name: impl Into<String>) -> Self {
        Self {
            cluster_id,
            version,
            name: name.into(),
            file: version_file_name(cluster_id, version),
        }
    }
}

/// One version of the central index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CentralIndex {
    /// 0 for a store that has never written an index.
    pub index_version: u32,
    entries: BTreeMap<u32, IndexEntry>,
}

impl CentralIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cluster_id: u32) -> Option<&IndexEntry> {
        self.entries.get(&cluster_id)
    }

    pub fn contains(&self, cluster_id: u32) -> bool {
        self.entries.contains_key(&cluster_id)
    }

    /// Entries ordered by cluster id.
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The next index version with `entry` added or replaced.
    pub fn with_entry(&self, entry: IndexEntry) -> Result<CentralIndex, FormatError> {
        let mut next = self.successor()?;
        next.entries.insert(entry.cluster_id, entry);
        Ok(next)
    }

    /// The next index version without `cluster_id`.
    pub fn without(&self, cluster_id: u32) -> Result<CentralIndex, FormatError> {
        let mut next = self.successor()?;
        next.entries.remove(&cluster_id);
        Ok(next)
    }

    fn successor(&self) -> Result<CentralIndex, FormatError> {
        let index_version = self
            .index_version
            .checked_add(1)
            .ok_or_else(|| FormatError::InvalidData("index version overflow".into()))?;
        Ok(CentralIndex {
            index_version,
            entries: self.entries.clone(),
        })
    }

    pub fn file_name(&self) -> String {
        index_file_name(self.index_version)
    }
}

/// `index.v{n}.idx`
pub fn index_file_name(index_version: u32) -> String {
    format!("index.v{index_version}.idx")
}

pub fn parse_index_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("index.v")?
        .strip_suffix(".idx")?
        .parse()
        .ok()
}

/// Encodes an index into a complete file image.
pub fn encode(index: &CentralIndex) -> Result<Vec<u8>, FormatError> {
    let mut buf = Vec::with_capacity(16 + index.len() * 48);
    format::write_header(&mut buf, format::INDEX_MAGIC)?;
    format::write_u32(&mut buf, index.index_version)?;
    format::write_len(&mut buf, index.len())?;
    for entry in index.entries() {
        format::write_u32(&mut buf, entry.cluster_id)?;
        format::write_u32(&mut buf, entry.version)?;
        format::write_bytes(&mut buf, entry.name.as_bytes())?;
        format::write_bytes(&mut buf, entry.file.as_bytes())?;
    }
    format::seal(&mut buf);
    Ok(buf)
}

/// Decodes a complete file image, checksum first.
pub fn decode(data: &[u8]) -> Result<CentralIndex, FormatError> {
    let body = format::unseal(data, format::INDEX_MAGIC)?;
    let mut r = Cursor::new(body);

    let index_version = format::read_u32(&mut r)?;
    let count = format::read_u32(&mut r)?;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let cluster_id = format::read_u32(&mut r)?;
        let version = format::read_u32(&mut r)?;
        let name = format::read_string(&mut r, "cluster name")?;
        let file = format::read_string(&mut r, "file name")?;
        if file.contains('/') || file.contains('\\') {
            return Err(FormatError::InvalidData(format!(
                "file name '{file}' is not a plain name"
            )));
        }
        let entry = IndexEntry {
            cluster_id,
            version,
            name,
            file,
        };
        if entries.insert(cluster_id, entry).is_some() {
            return Err(FormatError::InvalidData(format!(
                "cluster {cluster_id} listed twice"
            )));
        }
    }

    if r.position() as usize != body.len() {
        return Err(FormatError::InvalidData("trailing bytes after entries".into()));
    }

    Ok(CentralIndex {
        index_version,
        entries,
    })
}

/// Durably writes an index file into `dir` and returns its path.
pub fn write_index_file(dir: &Path, index: &CentralIndex) -> Result<PathBuf, FormatError> {
    let path = dir.join(index.file_name());
    let data = encode(index)?;
    format::write_atomic(&path, &data)?;
    Ok(path)
}

pub fn read_index_file(path: &Path) -> Result<CentralIndex, FormatError> {
    let data = fs::read(path)?;
    decode(&data)
}

/// Index files in `dir`, newest first.
pub fn list_index_files(dir: &Path) -> io::Result<Vec<(u32, PathBuf)>> {
    let mut found = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        if let Some(n) = name.to_str().and_then(parse_index_file_name) {
            found.push((n, dirent.path()));
        }
    }
    found.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(found)
}
