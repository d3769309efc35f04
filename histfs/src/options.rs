use std::sync::Arc;

use crate::page_pool::PagePool;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default memory budget (in bytes) for the committed-page cache of a file
/// on disk.
pub const DEFAULT_CACHE_BUDGET_BYTES: usize = 2 * 1024 * 1024;

/// Default number of disk I/O sessions one sub-file I/O session may hold.
pub const DEFAULT_SESSIONS_PER_IO_SESSION: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Options used when creating or opening a file structure.
#[derive(Debug, Clone)]
pub struct FileStructureOptions {
    /// Block size in bytes; a power of two in `128..=65536`. Ignored when
    /// opening an existing file, whose header records its own.
    pub block_size: usize,
    /// Pool the pages come from. `None` = the process-wide pool for the
    /// block size.
    pub page_pool: Option<Arc<PagePool>>,
    /// Byte budget of the clean-page LRU of a file on disk.
    pub cache_budget_bytes: usize,
    /// Disk I/O sessions per sub-file I/O session. A read-only session uses
    /// two, an editable one three.
    pub sessions_per_io_session: usize,
}

impl Default for FileStructureOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            page_pool: None,
            cache_budget_bytes: DEFAULT_CACHE_BUDGET_BYTES,
            sessions_per_io_session: DEFAULT_SESSIONS_PER_IO_SESSION,
        }
    }
}

impl FileStructureOptions {
    /// Default options with a different block size.
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size,
            ..Default::default()
        }
    }
}
