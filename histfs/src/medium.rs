use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::header::FileHeaderBlock;
use crate::page_pool::{PageBuf, PagePool};

/// A page bound to one physical block. Readers of committed blocks share it;
/// the lock is held only while bytes are copied in or out.
pub type SharedPage = Arc<RwLock<PageBuf>>;

/// Physical block storage beneath a file structure.
///
/// Provides numbered fixed-size blocks to the disk I/O sessions and keeps the
/// committed header. Blocks at or above the committed watermark belong to the
/// in-flight edit until [`commit`](Self::commit) publishes them or
/// [`rollback`](Self::rollback) drops them.
///
/// All methods take `&self` so a single medium can be shared across threads.
/// Implementations use interior mutability to protect their bookkeeping.
pub trait DiskMedium: Send + Sync + 'static {
    /// Block size in bytes.
    fn block_size(&self) -> usize;

    /// Pool every page of this medium comes from.
    fn page_pool(&self) -> &Arc<PagePool>;

    /// True if the medium was opened without write access.
    fn is_read_only(&self) -> bool;

    /// The header of the most recent commit.
    fn committed_header(&self) -> Arc<FileHeaderBlock>;

    /// The page holding an existing block.
    fn read_block(&self, block: u32) -> Result<SharedPage>;

    /// Bind a fresh zeroed page to `block`, which must be at or above the
    /// committed watermark. Replaces any page previously created for it.
    fn create_block(&self, block: u32) -> Result<SharedPage>;

    /// Forget a block created by the in-flight edit.
    fn discard_block(&self, block: u32);

    /// Make every block created since the last commit durable, then publish
    /// `header` as the committed header.
    fn commit(&self, header: FileHeaderBlock) -> Result<()>;

    /// Drop every block created since the last commit.
    fn rollback(&self);

    /// Medium-level integrity checks. Returns a list of issues found.
    fn verify(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
