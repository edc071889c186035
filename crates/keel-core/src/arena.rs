//! Bump-pointer arena for transient per-session state.
//!
//! An [`ArenaContainer`] owns a chain of fixed-size blocks. Allocations
//! are carved off the current block by advancing a cursor; nothing is
//! ever freed individually. Between independent parses the owner calls
//! [`ByteArena::reset`], which drops every block but the first, zeroes
//! the first block and rewinds the cursor.
//!
//! Allocations are handed out as opaque [`ArenaRef`] handles rather than
//! slices so several allocations can be alive at once without tying up
//! a mutable borrow of the container. Resolve a handle with
//! [`ByteArena::get`] / [`ByteArena::get_mut`].
//!
//! The container is `Send` but not shared: `&mut self` on every mutating
//! call means two threads can only use one container through
//! [`SharedArena`], which serializes every access.

use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Default size of each chained block, in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 8180;

/// Smallest block size a container accepts.
pub const MIN_BLOCK_SIZE: usize = 128;

/// Allocation granularity. Every allocation starts on this boundary.
const ALIGN: usize = 8;

/// Errors returned by arena allocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// The allocation would exceed the container's byte limit, or the
    /// system allocator refused the block. Never partially satisfied.
    #[error("arena out of memory: requested {requested} bytes with {reserved} of {limit} reserved")]
    OutOfMemory {
        requested: usize,
        reserved: usize,
        limit: usize,
    },

    /// The configured block size is below [`MIN_BLOCK_SIZE`].
    #[error("arena block size {0} is below the minimum of {MIN_BLOCK_SIZE} bytes")]
    InvalidBlockSize(usize),
}

/// Construction parameters for an [`ArenaContainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Size of each size-class block.
    pub block_size: usize,
    /// Upper bound on the total bytes of all blocks in the chain.
    /// `None` means limited only by the system allocator.
    pub max_bytes: Option<usize>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_bytes: None,
        }
    }
}

/// Handle to a region allocated from an arena.
///
/// Only meaningful for the container that produced it, and only until
/// the next `reset()` or `release()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaRef {
    block: usize,
    offset: usize,
    len: usize,
}

impl ArenaRef {
    /// Length of the allocated region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for zero-sized allocations.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Byte-oriented bump allocator.
///
/// Implemented by [`ArenaContainer`]; kept as a trait so session code can
/// be exercised against an instrumented arena in tests.
pub trait ByteArena {
    /// Allocates `size` bytes. Fails with [`ArenaError::OutOfMemory`]
    /// instead of returning a short region.
    fn allocate(&mut self, size: usize) -> Result<ArenaRef, ArenaError>;

    /// Allocates `size` bytes that are guaranteed to read as zero.
    fn allocate_zeroed(&mut self, size: usize) -> Result<ArenaRef, ArenaError>;

    /// Resolves a handle to its bytes. Returns `None` for handles that
    /// don't belong to the current generation of blocks.
    fn get(&self, handle: ArenaRef) -> Option<&[u8]>;

    /// Mutable variant of [`ByteArena::get`].
    fn get_mut(&mut self, handle: ArenaRef) -> Option<&mut [u8]>;

    /// Drops every block but the first, zeroes it and rewinds the cursor.
    fn reset(&mut self);

    /// Frees every block, including the first.
    fn release(&mut self);

    /// Copies `src` into a fresh allocation.
    fn copy_from_slice(&mut self, src: &[u8]) -> Result<ArenaRef, ArenaError> {
        let handle = self.allocate(src.len())?;
        if let Some(dst) = self.get_mut(handle) {
            dst.copy_from_slice(src);
        }
        Ok(handle)
    }
}

#[derive(Debug)]
struct Block {
    data: Box<[u8]>,
    used: usize,
}

impl Block {
    fn remaining(&self) -> usize {
        self.data.len() - self.used
    }
}

/// Chain of blocks with a bump cursor in the current block.
#[derive(Debug)]
pub struct ArenaContainer {
    config: ArenaConfig,
    blocks: Vec<Block>,
    /// Index of the block the cursor lives in. Oversized blocks are
    /// appended behind it without moving the cursor.
    current: usize,
    /// Sum of all block lengths in the chain.
    reserved: usize,
}

impl ArenaContainer {
    /// Creates a container and reserves its first block.
    pub fn new(config: ArenaConfig) -> Result<Self, ArenaError> {
        if config.block_size < MIN_BLOCK_SIZE {
            return Err(ArenaError::InvalidBlockSize(config.block_size));
        }
        let mut arena = Self {
            config,
            blocks: Vec::new(),
            current: 0,
            reserved: 0,
        };
        arena.push_block(config.block_size)?;
        Ok(arena)
    }

    /// Creates a container with the default 8180-byte blocks.
    pub fn with_defaults() -> Result<Self, ArenaError> {
        Self::new(ArenaConfig::default())
    }

    /// Returns the configuration this container was built with.
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Number of blocks in the chain, oversized blocks included.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total bytes reserved across all blocks.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved
    }

    /// Appends a block of `len` bytes, enforcing the byte limit.
    fn push_block(&mut self, len: usize) -> Result<usize, ArenaError> {
        let limit = self.config.max_bytes.unwrap_or(usize::MAX);
        let oom = ArenaError::OutOfMemory {
            requested: len,
            reserved: self.reserved,
            limit,
        };
        let total = self.reserved.checked_add(len).ok_or_else(|| oom.clone())?;
        if total > limit {
            return Err(oom);
        }

        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| oom)?;
        data.resize(len, 0);

        self.blocks.push(Block {
            data: data.into_boxed_slice(),
            used: 0,
        });
        self.reserved = total;
        Ok(self.blocks.len() - 1)
    }

    fn bump(&mut self, block: usize, size: usize, aligned: usize) -> ArenaRef {
        let b = &mut self.blocks[block];
        let offset = b.used;
        b.used += aligned;
        ArenaRef {
            block,
            offset,
            len: size,
        }
    }
}

/// Rounds `size` up to the allocation granularity.
fn align_up(size: usize) -> Option<usize> {
    size.checked_add(ALIGN - 1).map(|n| n & !(ALIGN - 1))
}

impl ByteArena for ArenaContainer {
    fn allocate(&mut self, size: usize) -> Result<ArenaRef, ArenaError> {
        let limit = self.config.max_bytes.unwrap_or(usize::MAX);
        let aligned = align_up(size).ok_or(ArenaError::OutOfMemory {
            requested: size,
            reserved: self.reserved,
            limit,
        })?;

        // a released container starts over with a fresh first block
        if self.blocks.is_empty() {
            self.push_block(self.config.block_size)?;
            self.current = 0;
        }

        if self.blocks[self.current].remaining() >= aligned {
            return Ok(self.bump(self.current, size, aligned));
        }

        if aligned > self.config.block_size {
            // oversized requests get a dedicated block; the cursor stays put
            let block = self.push_block(aligned)?;
            return Ok(self.bump(block, size, aligned));
        }

        let block = self.push_block(self.config.block_size)?;
        self.current = block;
        Ok(self.bump(block, size, aligned))
    }

    fn allocate_zeroed(&mut self, size: usize) -> Result<ArenaRef, ArenaError> {
        let handle = self.allocate(size)?;
        if let Some(bytes) = self.get_mut(handle) {
            bytes.fill(0);
        }
        Ok(handle)
    }

    fn get(&self, handle: ArenaRef) -> Option<&[u8]> {
        let block = self.blocks.get(handle.block)?;
        let end = handle.offset.checked_add(handle.len)?;
        if end > block.used {
            return None;
        }
        Some(&block.data[handle.offset..end])
    }

    fn get_mut(&mut self, handle: ArenaRef) -> Option<&mut [u8]> {
        let block = self.blocks.get_mut(handle.block)?;
        let end = handle.offset.checked_add(handle.len)?;
        if end > block.used {
            return None;
        }
        Some(&mut block.data[handle.offset..end])
    }

    fn reset(&mut self) {
        self.blocks.truncate(1);
        match self.blocks.first_mut() {
            Some(first) => {
                first.data.fill(0);
                first.used = 0;
                self.reserved = first.data.len();
            }
            None => self.reserved = 0,
        }
        self.current = 0;
    }

    fn release(&mut self) {
        self.blocks = Vec::new();
        self.current = 0;
        self.reserved = 0;
    }
}

/// A container that several threads may allocate from, each access
/// serialized through one mutex. Clones share the same chain.
#[derive(Debug, Clone)]
pub struct SharedArena {
    inner: Arc<Mutex<ArenaContainer>>,
}

impl SharedArena {
    pub fn new(config: ArenaConfig) -> Result<Self, ArenaError> {
        Ok(Self {
            inner: Arc::new(Mutex::new(ArenaContainer::new(config)?)),
        })
    }

    /// Runs `f` with exclusive access to the container. Handles obtained
    /// inside stay valid across calls until someone resets the arena.
    pub fn with<R>(&self, f: impl FnOnce(&mut ArenaContainer) -> R) -> R {
        let mut arena = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_arena() -> ArenaContainer {
        ArenaContainer::new(ArenaConfig {
            block_size: 256,
            max_bytes: None,
        })
        .unwrap()
    }

    #[test]
    fn rejects_tiny_blocks() {
        let err = ArenaContainer::new(ArenaConfig {
            block_size: 64,
            max_bytes: None,
        })
        .unwrap_err();
        assert_eq!(err, ArenaError::InvalidBlockSize(64));
    }

    #[test]
    fn default_block_size() {
        let arena = ArenaContainer::with_defaults().unwrap();
        assert_eq!(arena.config().block_size, 8180);
        assert_eq!(arena.block_count(), 1);
        assert_eq!(arena.reserved_bytes(), 8180);
    }

    #[test]
    fn allocations_are_disjoint() {
        let mut arena = small_arena();
        let a = arena.copy_from_slice(b"hello").unwrap();
        let b = arena.copy_from_slice(b"world").unwrap();
        assert_eq!(arena.get(a).unwrap(), b"hello");
        assert_eq!(arena.get(b).unwrap(), b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn overflow_chains_a_new_block() {
        let mut arena = small_arena();
        for _ in 0..5 {
            arena.allocate(100).unwrap();
        }
        // 5 x 104 aligned bytes can't fit in one 256-byte block
        assert!(arena.block_count() > 1);
    }

    #[test]
    fn oversized_request_gets_own_block() {
        let mut arena = small_arena();
        let small = arena.copy_from_slice(b"abc").unwrap();
        let big = arena.allocate_zeroed(1000).unwrap();
        assert_eq!(arena.block_count(), 2);
        assert_eq!(arena.get(big).unwrap().len(), 1000);

        // cursor stayed in the first block
        let next = arena.allocate(8).unwrap();
        assert_eq!(next.block, small.block);
    }

    #[test]
    fn reset_matches_fresh_container() {
        let mut used = small_arena();
        used.copy_from_slice(&[0xAB; 200]).unwrap();
        used.allocate(4000).unwrap();
        used.allocate(200).unwrap();
        used.reset();

        assert_eq!(used.block_count(), 1);
        assert_eq!(used.reserved_bytes(), 256);

        let mut fresh = small_arena();
        let a = used.allocate(32).unwrap();
        let b = fresh.allocate(32).unwrap();
        assert_eq!(a, b);
        assert_eq!(used.get(a).unwrap(), fresh.get(b).unwrap());
        assert!(used.get(a).unwrap().iter().all(|&byte| byte == 0));
    }

    #[test]
    fn stale_handle_after_reset() {
        let mut arena = small_arena();
        let handle = arena.copy_from_slice(b"transient").unwrap();
        arena.reset();
        assert!(arena.get(handle).is_none());
    }

    #[test]
    fn byte_limit_reports_out_of_memory() {
        let mut arena = ArenaContainer::new(ArenaConfig {
            block_size: 128,
            max_bytes: Some(256),
        })
        .unwrap();
        arena.allocate(128).unwrap();
        arena.allocate(128).unwrap();
        let err = arena.allocate(8).unwrap_err();
        assert!(matches!(err, ArenaError::OutOfMemory { limit: 256, .. }));
    }

    #[test]
    fn release_then_allocate_starts_over() {
        let mut arena = small_arena();
        arena.allocate(64).unwrap();
        arena.release();
        assert_eq!(arena.block_count(), 0);
        assert_eq!(arena.reserved_bytes(), 0);

        let handle = arena.copy_from_slice(b"again").unwrap();
        assert_eq!(arena.get(handle).unwrap(), b"again");
        assert_eq!(arena.block_count(), 1);
    }

    #[test]
    fn zero_sized_allocation() {
        let mut arena = small_arena();
        let handle = arena.allocate(0).unwrap();
        assert!(handle.is_empty());
        assert_eq!(arena.get(handle).unwrap(), b"");
    }

    #[test]
    fn shared_arena_across_threads() {
        let shared = SharedArena::new(ArenaConfig {
            block_size: 256,
            max_bytes: None,
        })
        .unwrap();

        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    (0..32)
                        .map(|_| shared.with(|a| a.copy_from_slice(&[i; 24]).unwrap()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            for r in handle.join().unwrap() {
                shared.with(|a| assert_eq!(a.get(r), Some(&[i as u8; 24][..])));
            }
        }
    }
}
