//! Binary format helpers shared by configuration version files and
//! central index files.
//!
//! Provides length-prefixed encoding primitives, CRC32 checksums, magic
//! byte constants and the atomic file replace used for every write. All
//! multi-byte integers are stored in little-endian.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use thiserror::Error;

/// Magic bytes for a configuration version file.
pub const CONFIG_MAGIC: &[u8; 4] = b"KCFG";

/// Magic bytes for a central index file.
pub const INDEX_MAGIC: &[u8; 4] = b"KIDX";

/// Current format version.
pub const FORMAT_VERSION: u8 = 1;

/// Bytes taken by the header: magic plus version byte.
pub const HEADER_LEN: usize = 5;

/// Suffix of in-progress files. They only become visible under their
/// final name after a successful [`write_atomic`].
pub const TMP_SUFFIX: &str = ".tmp";

/// Errors that can occur when reading or writing store files.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("invalid magic bytes")]
    InvalidMagic,

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),

    #[error("crc32 mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Computes a CRC32 checksum over a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

// ---------------------------------------------------------------------------
// write helpers
// ---------------------------------------------------------------------------

/// Writes a `u8` to the writer.
pub fn write_u8(w: &mut impl Write, val: u8) -> io::Result<()> {
    w.write_all(&[val])
}

/// Writes a `u32` in little-endian.
pub fn write_u32(w: &mut impl Write, val: u32) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

/// Writes a `u64` in little-endian.
pub fn write_u64(w: &mut impl Write, val: u64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

/// Writes a collection length as u32, returning an error if it exceeds `u32::MAX`.
pub fn write_len(w: &mut impl Write, len: usize) -> io::Result<()> {
    let len = u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("collection length {len} exceeds u32::MAX"),
        )
    })?;
    write_u32(w, len)
}

/// Writes a length-prefixed byte slice: `[len: u32][data]`.
pub fn write_bytes(w: &mut impl Write, data: &[u8]) -> io::Result<()> {
    write_len(w, data.len())?;
    w.write_all(data)
}

/// Writes a file header: magic bytes + version byte.
pub fn write_header(w: &mut impl Write, magic: &[u8; 4]) -> io::Result<()> {
    w.write_all(magic)?;
    write_u8(w, FORMAT_VERSION)
}

/// Appends the CRC32 of everything after the header.
///
/// `buf` must start with a header written by [`write_header`].
pub fn seal(buf: &mut Vec<u8>) {
    let checksum = crc32(&buf[HEADER_LEN..]);
    buf.extend_from_slice(&checksum.to_le_bytes());
}

// ---------------------------------------------------------------------------
// read helpers
// ---------------------------------------------------------------------------

/// Reads a `u8` from the reader.
pub fn read_u8(r: &mut impl Read) -> Result<u8, FormatError> {
    let mut buf = [0u8; 1];
    read_exact(r, &mut buf)?;
    Ok(buf[0])
}

/// Reads a `u32` in little-endian.
pub fn read_u32(r: &mut impl Read) -> Result<u32, FormatError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Reads a `u64` in little-endian.
pub fn read_u64(r: &mut impl Read) -> Result<u64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Maximum length we'll allocate when reading a length-prefixed field.
/// A corrupt length prefix won't cause a multi-gigabyte allocation.
pub const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

/// Reads a length-prefixed byte vector: `[len: u32][data]`.
pub fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>, FormatError> {
    let len = read_u32(r)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(FormatError::InvalidData(format!(
            "field length {len} exceeds maximum of {MAX_FIELD_LEN}"
        )));
    }
    let mut buf = vec![0u8; len];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_string(r: &mut impl Read, label: &str) -> Result<String, FormatError> {
    String::from_utf8(read_bytes(r)?)
        .map_err(|_| FormatError::InvalidData(format!("{label} is not valid utf-8")))
}

/// Reads exactly `buf.len()` bytes, returning `UnexpectedEof` on short read.
fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), FormatError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FormatError::UnexpectedEof
        } else {
            FormatError::Io(e)
        }
    })
}

/// Reads and validates a file header.
pub fn read_header(r: &mut impl Read, expected_magic: &[u8; 4]) -> Result<u8, FormatError> {
    let mut magic = [0u8; 4];
    read_exact(r, &mut magic)?;
    if &magic != expected_magic {
        return Err(FormatError::InvalidMagic);
    }
    let version = read_u8(r)?;
    if version == 0 || version > FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    Ok(version)
}

/// Checks the trailing CRC32 of a whole file image and returns the body
/// between header and footer.
pub fn unseal<'a>(data: &'a [u8], expected_magic: &[u8; 4]) -> Result<&'a [u8], FormatError> {
    let mut header = &data[..data.len().min(HEADER_LEN)];
    read_header(&mut header, expected_magic)?;
    if data.len() < HEADER_LEN + 4 {
        return Err(FormatError::UnexpectedEof);
    }
    let (body, footer) = data[HEADER_LEN..].split_at(data.len() - HEADER_LEN - 4);
    let mut stored = [0u8; 4];
    stored.copy_from_slice(footer);
    verify_crc32_values(crc32(body), u32::from_le_bytes(stored))?;
    Ok(body)
}

/// Verifies that two CRC32 values match.
pub fn verify_crc32_values(computed: u32, stored: u32) -> Result<(), FormatError> {
    if computed != stored {
        return Err(FormatError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// atomic replace
// ---------------------------------------------------------------------------

/// The temporary path a write to `path` goes through.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

/// Removes the temp file unless the write completed.
struct TmpGuard<'a> {
    path: &'a Path,
    done: bool,
}

impl Drop for TmpGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            // best-effort cleanup of the incomplete temp file
            let _ = fs::remove_file(self.path);
        }
    }
}

/// Durably replaces `path` with `data`.
///
/// Writes `<path>.tmp`, fsyncs it, renames it over `path` and fsyncs the
/// parent directory so the rename itself survives a crash. Readers see
/// either the old file or the complete new one, never a torn write.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);
    let mut guard = TmpGuard {
        path: &tmp,
        done: false,
    };

    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    guard.done = true;

    if let Some(dir) = path.parent() {
        sync_dir(dir)?;
    }
    Ok(())
}

/// Flushes directory metadata (new names, renames, unlinks) to disk.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    File::open(dir)?.sync_all()
}

/// Directory handles can't be fsynced here; renames are durable once the
/// file data is.
#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
