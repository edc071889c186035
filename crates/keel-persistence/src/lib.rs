//! keel-persistence: durable per-cluster configuration.
//!
//! Every commit writes a new immutable version file and then a new
//! central index that points at it. Nothing is rewritten in place, so a
//! crash at any point leaves either the old or the new committed state,
//! never a mix. On startup [`recovery::load_from_files`] picks the newest
//! index that decodes cleanly and loads what it references.

pub mod error;
pub mod format;
pub mod index;
pub mod memory;
pub mod recovery;
pub mod store;
pub mod version;

pub use error::StoreError;
pub use format::FormatError;
pub use index::{CentralIndex, IndexEntry};
pub use memory::MemoryConfigStore;
pub use recovery::{load_from_files, LoadReport, LoadedState, RecoveryPolicy};
pub use store::{
    bootstrap, normalize_payload, validate_name, validate_payload, ClusterSummary, ConfigStore,
    FileConfigStore, GcReport, LOCK_FILE,
};
pub use version::{ConfigVersion, VersionInfo};
