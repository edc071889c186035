//! keel-core: low-level memory infrastructure for the control plane.
//!
//! Two allocators sit under the protocol and store code:
//!
//! - [`ArenaContainer`]: a bump-pointer arena owned by one session, reset
//!   between protocol parses instead of freeing objects one by one.
//! - [`PagePool`]: a fixed set of two-region I/O pages shared by every
//!   connection in the process, handed out under a single mutex.
//!
//! # quick start
//!
//! ```
//! use keel_core::{ArenaContainer, ByteArena, PagePool, PoolConfig, Priority};
//!
//! let pool = PagePool::new(PoolConfig::default()).unwrap();
//! let mut page = pool.acquire().unwrap();
//! assert!(page.append(Priority::High, b"ok\n"));
//!
//! let mut arena = ArenaContainer::with_defaults().unwrap();
//! let name = arena.copy_from_slice(b"gridA").unwrap();
//! assert_eq!(arena.get(name), Some(&b"gridA"[..]));
//! ```

pub mod arena;
pub mod pool;

pub use arena::{ArenaConfig, ArenaContainer, ArenaError, ArenaRef, ByteArena, SharedArena};
pub use pool::{
    BufferPage, PagePool, PoolConfig, PoolConfigError, PoolExhausted, PooledPage, Priority,
};
