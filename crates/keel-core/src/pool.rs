//! Fixed-capacity pool of I/O pages shared by every connection in a
//! process.
//!
//! Each [`BufferPage`] is one contiguous block split into a high-priority
//! region (the first `high_priority_size` bytes) and a low-priority
//! region (the rest), each with its own fill size. All pages are
//! allocated when the pool is built; the pool never grows.
//!
//! The free list is an index stack behind a single `Mutex`. Acquire and
//! release are O(1) pushes/pops and do no I/O while the lock is held.
//! An empty pool is reported as [`PoolExhausted`], a backpressure signal
//! the caller should answer by retrying later or shedding the request.
//!
//! Pages come back automatically when the [`PooledPage`] handle drops,
//! so every exit path of a connection returns its pages exactly once.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Default size of the high-priority region at the front of each page.
pub const DEFAULT_HIGH_PRIORITY_SIZE: usize = 2048;

/// Default number of pages in a pool.
pub const DEFAULT_PAGE_COUNT: usize = 256;

/// The pool had no free page. Not an error condition: callers retry or
/// shed load.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("buffer page pool exhausted ({capacity} pages in use)")]
pub struct PoolExhausted {
    pub capacity: usize,
}

/// Invalid pool dimensions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid page pool config: {0}")]
pub struct PoolConfigError(String);

/// Selects one of the two regions of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

/// Pool dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub page_size: usize,
    pub page_count: usize,
    pub high_priority_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_count: DEFAULT_PAGE_COUNT,
            high_priority_size: DEFAULT_HIGH_PRIORITY_SIZE,
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), PoolConfigError> {
        if self.page_count == 0 {
            return Err(PoolConfigError("page_count must be at least 1".into()));
        }
        if self.high_priority_size == 0 || self.high_priority_size >= self.page_size {
            return Err(PoolConfigError(format!(
                "high_priority_size {} must be between 1 and page_size {} (exclusive)",
                self.high_priority_size, self.page_size
            )));
        }
        Ok(())
    }
}

/// One fixed-size I/O page with two independently filled regions.
pub struct BufferPage {
    id: usize,
    data: Box<[u8]>,
    high_priority_size: usize,
    high_fill: usize,
    low_fill: usize,
}

impl fmt::Debug for BufferPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPage")
            .field("id", &self.id)
            .field("size", &self.data.len())
            .field("high_fill", &self.high_fill)
            .field("low_fill", &self.low_fill)
            .finish()
    }
}

impl BufferPage {
    fn new(id: usize, page_size: usize, high_priority_size: usize) -> Self {
        Self {
            id,
            data: vec![0u8; page_size].into_boxed_slice(),
            high_priority_size,
            high_fill: 0,
            low_fill: 0,
        }
    }

    /// Zeroes both fill sizes.
    fn reset(&mut self) {
        self.high_fill = 0;
        self.low_fill = 0;
    }

    /// Stable identifier of this page within its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Address of the first byte of the page.
    pub fn base_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// Address of the first byte of a region.
    pub fn region_ptr(&self, priority: Priority) -> *const u8 {
        self.region(priority).as_ptr()
    }

    /// Total size of a region.
    pub fn capacity(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high_priority_size,
            Priority::Low => self.data.len() - self.high_priority_size,
        }
    }

    /// Bytes currently filled in a region.
    pub fn fill(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high_fill,
            Priority::Low => self.low_fill,
        }
    }

    /// Unfilled bytes left in a region.
    pub fn remaining(&self, priority: Priority) -> usize {
        self.capacity(priority) - self.fill(priority)
    }

    fn region(&self, priority: Priority) -> &[u8] {
        match priority {
            Priority::High => &self.data[..self.high_priority_size],
            Priority::Low => &self.data[self.high_priority_size..],
        }
    }

    fn region_mut(&mut self, priority: Priority) -> &mut [u8] {
        match priority {
            Priority::High => &mut self.data[..self.high_priority_size],
            Priority::Low => &mut self.data[self.high_priority_size..],
        }
    }

    fn fill_mut(&mut self, priority: Priority) -> &mut usize {
        match priority {
            Priority::High => &mut self.high_fill,
            Priority::Low => &mut self.low_fill,
        }
    }

    /// The filled prefix of a region.
    pub fn filled(&self, priority: Priority) -> &[u8] {
        &self.region(priority)[..self.fill(priority)]
    }

    /// The unfilled suffix of a region, for reading into.
    pub fn spare_mut(&mut self, priority: Priority) -> &mut [u8] {
        let fill = self.fill(priority);
        &mut self.region_mut(priority)[fill..]
    }

    /// Marks `n` more bytes of the region as filled, after writing them
    /// through [`BufferPage::spare_mut`].
    pub fn advance(&mut self, priority: Priority, n: usize) {
        let fill = self.fill(priority) + n;
        assert!(
            fill <= self.capacity(priority),
            "advance past end of page region"
        );
        *self.fill_mut(priority) = fill;
    }

    /// Appends `bytes` to a region. Returns `false` without writing
    /// anything when they don't fit.
    pub fn append(&mut self, priority: Priority, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining(priority) {
            return false;
        }
        self.spare_mut(priority)[..bytes.len()].copy_from_slice(bytes);
        self.advance(priority, bytes.len());
        true
    }

    /// Drops the first `n` filled bytes of a region, shifting the rest
    /// to the front.
    pub fn consume(&mut self, priority: Priority, n: usize) {
        let fill = self.fill(priority);
        let n = n.min(fill);
        self.region_mut(priority).copy_within(n..fill, 0);
        *self.fill_mut(priority) = fill - n;
    }

    /// Empties a region.
    pub fn clear(&mut self, priority: Priority) {
        *self.fill_mut(priority) = 0;
    }
}

struct PoolInner {
    config: PoolConfig,
    free: Mutex<Vec<BufferPage>>,
}

impl PoolInner {
    fn put_back(&self, mut page: BufferPage) {
        page.reset();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(page);
    }
}

/// Handle to the shared page pool. Cheap to clone.
#[derive(Clone)]
pub struct PagePool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("config", &self.inner.config)
            .field("available", &self.available())
            .finish()
    }
}

impl PagePool {
    /// Allocates every page up front.
    pub fn new(config: PoolConfig) -> Result<Self, PoolConfigError> {
        config.validate()?;
        let free = (0..config.page_count)
            .rev()
            .map(|id| BufferPage::new(id, config.page_size, config.high_priority_size))
            .collect();
        debug!(
            page_size = config.page_size,
            page_count = config.page_count,
            "buffer page pool allocated"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                free: Mutex::new(free),
            }),
        })
    }

    /// Takes a page off the free list. The page comes back with both
    /// fill sizes zeroed.
    pub fn acquire(&self) -> Result<PooledPage, PoolExhausted> {
        let page = {
            let mut free = self.inner.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        };
        match page {
            Some(mut page) => {
                page.reset();
                Ok(PooledPage {
                    page: Some(page),
                    pool: Arc::clone(&self.inner),
                })
            }
            None => Err(PoolExhausted {
                capacity: self.inner.config.page_count,
            }),
        }
    }

    /// Returns a page to the pool. Equivalent to dropping the handle.
    pub fn release(&self, page: PooledPage) {
        drop(page);
    }

    /// Pool dimensions.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Total number of pages.
    pub fn capacity(&self) -> usize {
        self.inner.config.page_count
    }

    /// Pages currently on the free list.
    pub fn available(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Pages currently held by callers.
    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }
}

/// Exclusive ownership of one page. Returns it to the pool on drop.
pub struct PooledPage {
    page: Option<BufferPage>,
    pool: Arc<PoolInner>,
}

impl fmt::Debug for PooledPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledPage").field(&self.page).finish()
    }
}

impl Deref for PooledPage {
    type Target = BufferPage;

    fn deref(&self) -> &BufferPage {
        // only `drop` takes the page out
        self.page.as_ref().expect("page present until drop")
    }
}

impl DerefMut for PooledPage {
    fn deref_mut(&mut self) -> &mut BufferPage {
        self.page.as_mut().expect("page present until drop")
    }
}

impl Drop for PooledPage {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            self.pool.put_back(page);
        }
    }
}
