//! Configuration version files.
//!
//! Each committed (or about to be committed) configuration lives in its
//! own immutable file, `cluster-{id}.v{version}.cfg`. A version file is
//! written once and never rewritten in place.
//!
//! File layout:
//! ```text
//! [KCFG magic: 4B][format: 1B]
//! [cluster_id: 4B][version: 4B][created_ms: 8B]
//! [name_len: 4B][name][payload_len: 4B][payload]
//! [footer_crc32: 4B]
//! ```

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::format::{self, FormatError};

/// One immutable configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigVersion {
    pub cluster_id: u32,
    /// Starts at 1 and grows by exactly 1 per commit.
    pub version: u32,
    pub name: String,
    /// Milliseconds since the unix epoch.
    pub created_ms: u64,
    /// Opaque configuration text, served byte for byte.
    pub payload: Bytes,
}

impl ConfigVersion {
    /// A new version stamped with the current time.
    pub fn new(cluster_id: u32, version: u32, name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            cluster_id,
            version,
            name: name.into(),
            created_ms: now_ms(),
            payload,
        }
    }

    pub fn file_name(&self) -> String {
        version_file_name(self.cluster_id, self.version)
    }
}

/// Version metadata, as reported by store history queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: u32,
    pub created_ms: u64,
    pub payload_len: usize,
    /// Whether the version is at or below the committed one.
    pub committed: bool,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `cluster-{id}.v{version}.cfg`
pub fn version_file_name(cluster_id: u32, version: u32) -> String {
    format!("cluster-{cluster_id}.v{version}.cfg")
}

/// Parses a version file name back into `(cluster_id, version)`.
pub fn parse_version_file_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("cluster-")?.strip_suffix(".cfg")?;
    let (id, version) = rest.split_once(".v")?;
    Some((id.parse().ok()?, version.parse().ok()?))
}

/// Encodes a version into a complete file image.
pub fn encode(version: &ConfigVersion) -> Result<Vec<u8>, FormatError> {
    let mut buf = Vec::with_capacity(64 + version.name.len() + version.payload.len());
    format::write_header(&mut buf, format::CONFIG_MAGIC)?;
    format::write_u32(&mut buf, version.cluster_id)?;
    format::write_u32(&mut buf, version.version)?;
    format::write_u64(&mut buf, version.created_ms)?;
    format::write_bytes(&mut buf, version.name.as_bytes())?;
    format::write_bytes(&mut buf, &version.payload)?;
    format::seal(&mut buf);
    Ok(buf)
}

/// Decodes a complete file image, checksum first.
pub fn decode(data: &[u8]) -> Result<ConfigVersion, FormatError> {
    let body = format::unseal(data, format::CONFIG_MAGIC)?;
    let mut r = Cursor::new(body);

    let cluster_id = format::read_u32(&mut r)?;
    let version = format::read_u32(&mut r)?;
    let created_ms = format::read_u64(&mut r)?;
    let name = format::read_string(&mut r, "cluster name")?;
    let payload = format::read_bytes(&mut r)?;

    if r.position() as usize != body.len() {
        return Err(FormatError::InvalidData(
            "trailing bytes after payload".into(),
        ));
    }
    if version == 0 {
        return Err(FormatError::InvalidData("version 0".into()));
    }

    Ok(ConfigVersion {
        cluster_id,
        version,
        name,
        created_ms,
        payload: Bytes::from(payload),
    })
}

/// Durably writes a version file into `dir` and returns its path.
pub fn write_version_file(dir: &Path, version: &ConfigVersion) -> Result<PathBuf, FormatError> {
    let path = dir.join(version.file_name());
    let data = encode(version)?;
    format::write_atomic(&path, &data)?;
    Ok(path)
}

pub fn read_version_file(path: &Path) -> Result<ConfigVersion, FormatError> {
    let data = fs::read(path)?;
    decode(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigVersion {
        ConfigVersion {
            cluster_id: 7,
            version: 3,
            name: "alpha".into(),
            created_ms: 1_700_000_000_000,
            payload: Bytes::from_static(b"nodes=4\nreplicas=2\n"),
        }
    }

    #[test]
    fn file_names() {
        assert_eq!(version_file_name(7, 3), "cluster-7.v3.cfg");
        assert_eq!(parse_version_file_name("cluster-7.v3.cfg"), Some((7, 3)));
        assert_eq!(parse_version_file_name("cluster-7.v3.cfg.tmp"), None);
        assert_eq!(parse_version_file_name("cluster-x.v3.cfg"), None);
        assert_eq!(parse_version_file_name("index.v3.idx"), None);
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let version = sample();
        let path = write_version_file(dir.path(), &version).unwrap();
        assert_eq!(path, dir.path().join("cluster-7.v3.cfg"));
        assert_eq!(read_version_file(&path).unwrap(), version);
    }

    #[test]
    fn torn_file_is_rejected() {
        let data = encode(&sample()).unwrap();
        let torn = &data[..data.len() - 6];
        assert!(decode(torn).is_err());
    }

    #[test]
    fn corrupt_payload_is_rejected() {
        let mut data = encode(&sample()).unwrap();
        let i = data.len() - 8;
        data[i] ^= 0x20;
        assert!(matches!(
            decode(&data),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn empty_payload() {
        let mut version = sample();
        version.payload = Bytes::new();
        let data = encode(&version).unwrap();
        assert!(decode(&data).unwrap().payload.is_empty());
    }
}
