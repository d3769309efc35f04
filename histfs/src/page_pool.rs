//! Fixed-size page allocation and recycling.
//!
//! Every block a file structure touches lives in a [`PageBuf`] handed out by a
//! [`PagePool`]. Pages are recycled through a free list instead of going back
//! to the allocator, so a long-running historian settles on a steady set of
//! pages.
//!
//! # Key types
//!
//! - [`PageBuf`]: owned, page-sized buffer. Dropping it returns the memory to
//!   the originating pool.
//! - [`PagePool`]: thread-safe pool for one page size. Grows on demand and
//!   never blocks.
//!
//! Pools are passed around as `Arc<PagePool>`. [`default_pool`] provides one
//! process-wide pool per page size, created on first use and torn down with
//! [`shutdown_default_pools`].

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{HistError, Result};
use crate::state::StateCoordinator;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 128;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

const POOL_RUNNING: i32 = 0;
const POOL_SHUT_DOWN: i32 = 1;

/// Check that `page_size` is a power of two within the supported range.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(HistError::InvalidArgument(format!(
            "page size {} must be a power of two between {} and {}",
            page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// PageBuf
// ---------------------------------------------------------------------------

/// An exclusively owned page of `page_size` bytes.
pub struct PageBuf {
    /// `None` only transiently during `Drop`.
    data: Option<Box<[u8]>>,
    pool: Arc<PagePool>,
}

impl PageBuf {
    pub fn len(&self) -> usize {
        self.pool.page_size
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for PageBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.return_page(data);
        }
    }
}

impl fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuf")
            .field("page_size", &self.pool.page_size)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// PagePool
// ---------------------------------------------------------------------------

/// Thread-safe pool of fixed-size pages.
pub struct PagePool {
    page_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    /// Pages owned by the pool: idle plus handed out.
    total_pages: AtomicUsize,
    in_use: AtomicUsize,
    state: StateCoordinator,
}

impl PagePool {
    pub fn new(page_size: usize) -> Result<Arc<PagePool>> {
        validate_page_size(page_size)?;
        Ok(Arc::new(PagePool {
            page_size,
            free: Mutex::new(Vec::new()),
            total_pages: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            state: StateCoordinator::new(POOL_RUNNING),
        }))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Hand out a page. A recycled page keeps whatever content it had; a
    /// freshly grown page is zeroed.
    pub fn allocate(self: &Arc<Self>) -> Result<PageBuf> {
        if self.is_shut_down() {
            return Err(HistError::PoolShutdown);
        }

        let recycled = self.free.lock().pop();
        let data = match recycled {
            Some(data) => data,
            None => {
                self.total_pages.fetch_add(1, Ordering::SeqCst);
                vec![0u8; self.page_size].into_boxed_slice()
            }
        };
        self.in_use.fetch_add(1, Ordering::SeqCst);

        Ok(PageBuf {
            data: Some(data),
            pool: Arc::clone(self),
        })
    }

    /// Hand out a page whose content is all zeros.
    pub fn allocate_zeroed(self: &Arc<Self>) -> Result<PageBuf> {
        let mut page = self.allocate()?;
        page.fill(0);
        Ok(page)
    }

    /// Return a page to the pool. Equivalent to dropping it.
    pub fn release(&self, page: PageBuf) {
        drop(page);
    }

    fn return_page(&self, data: Box<[u8]>) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        if self.is_shut_down() {
            self.total_pages.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        self.free.lock().push(data);
    }

    /// Bytes held by the pool, whether idle or handed out.
    pub fn allocated_bytes(&self) -> usize {
        self.total_pages.load(Ordering::SeqCst) * self.page_size
    }

    pub fn in_use_pages(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn free_pages(&self) -> usize {
        self.free.lock().len()
    }

    /// Give idle pages back to the allocator. Returns the number released.
    pub fn trim(&self) -> usize {
        let released = {
            let mut free = self.free.lock();
            let n = free.len();
            free.clear();
            free.shrink_to_fit();
            n
        };
        self.total_pages.fetch_sub(released, Ordering::SeqCst);
        released
    }

    /// Stop handing out pages. Idle pages are released immediately; pages
    /// still in use are freed as they come back.
    pub fn shutdown(&self) {
        if self.state.try_change(POOL_RUNNING, POOL_SHUT_DOWN) {
            self.trim();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.read() == POOL_SHUT_DOWN
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("page_size", &self.page_size)
            .field("allocated_bytes", &self.allocated_bytes())
            .field("in_use_pages", &self.in_use_pages())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Process-wide default pools
// ---------------------------------------------------------------------------

static DEFAULT_POOLS: OnceLock<Mutex<HashMap<usize, Arc<PagePool>>>> = OnceLock::new();

/// The process-wide pool for `page_size`, created on first use.
pub fn default_pool(page_size: usize) -> Result<Arc<PagePool>> {
    validate_page_size(page_size)?;
    let pools = DEFAULT_POOLS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut pools = pools.lock();
    if let Some(pool) = pools.get(&page_size) {
        return Ok(Arc::clone(pool));
    }
    let pool = PagePool::new(page_size)?;
    pools.insert(page_size, Arc::clone(&pool));
    Ok(pool)
}

/// Shut down every default pool. A later [`default_pool`] call starts a new
/// pool.
pub fn shutdown_default_pools() {
    let Some(pools) = DEFAULT_POOLS.get() else {
        return;
    };
    let drained: Vec<Arc<PagePool>> = pools.lock().drain().map(|(_, pool)| pool).collect();
    for pool in drained {
        pool.shutdown();
    }
}
