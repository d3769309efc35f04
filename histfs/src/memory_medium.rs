use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::HEADER_BLOCK_COUNT;
use crate::error::{HistError, Result};
use crate::header::FileHeaderBlock;
use crate::medium::{DiskMedium, SharedPage};
use crate::page_pool::PagePool;

/// Medium that keeps every block in pool pages. Nothing survives the process.
pub struct MemoryMedium {
    block_size: usize,
    pool: Arc<PagePool>,
    /// Indexed by physical block; `None` for header slots and discarded blocks.
    pages: RwLock<Vec<Option<SharedPage>>>,
    committed: RwLock<Arc<FileHeaderBlock>>,
}

impl MemoryMedium {
    pub fn new(pool: Arc<PagePool>) -> Self {
        let block_size = pool.page_size();
        MemoryMedium {
            block_size,
            pool,
            pages: RwLock::new(Vec::new()),
            committed: RwLock::new(Arc::new(FileHeaderBlock::new(block_size as u32))),
        }
    }

    /// Number of blocks currently holding a page.
    pub fn resident_blocks(&self) -> usize {
        self.pages.read().iter().filter(|p| p.is_some()).count()
    }
}

impl DiskMedium for MemoryMedium {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn page_pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn committed_header(&self) -> Arc<FileHeaderBlock> {
        Arc::clone(&self.committed.read())
    }

    fn read_block(&self, block: u32) -> Result<SharedPage> {
        self.pages
            .read()
            .get(block as usize)
            .and_then(|page| page.as_ref().map(Arc::clone))
            .ok_or_else(|| HistError::CorruptBlock {
                block,
                reason: "block was never written".to_string(),
            })
    }

    fn create_block(&self, block: u32) -> Result<SharedPage> {
        let watermark = self.committed.read().watermark();
        if block < watermark {
            return Err(HistError::InvalidArgument(format!(
                "block {} is below the watermark {}",
                block, watermark
            )));
        }
        let page: SharedPage = Arc::new(RwLock::new(self.pool.allocate_zeroed()?));
        let mut pages = self.pages.write();
        let index = block as usize;
        if pages.len() <= index {
            pages.resize(index + 1, None);
        }
        pages[index] = Some(Arc::clone(&page));
        Ok(page)
    }

    fn discard_block(&self, block: u32) {
        let mut pages = self.pages.write();
        if let Some(slot) = pages.get_mut(block as usize) {
            *slot = None;
        }
    }

    fn commit(&self, header: FileHeaderBlock) -> Result<()> {
        let watermark = header.watermark() as usize;
        *self.committed.write() = Arc::new(header);
        let mut pages = self.pages.write();
        while pages.len() > watermark && matches!(pages.last(), Some(None)) {
            pages.pop();
        }
        Ok(())
    }

    fn rollback(&self) {
        let watermark = self.committed.read().watermark() as usize;
        let mut pages = self.pages.write();
        pages.truncate(watermark);
    }

    /// Every committed block must hold a page. Pages past the watermark
    /// belong to an open edit and are not part of the snapshot.
    fn verify(&self) -> Result<Vec<String>> {
        let header = self.committed_header();
        let pages = self.pages.read();
        let missing: Vec<u32> = (HEADER_BLOCK_COUNT..header.watermark())
            .filter(|&block| !matches!(pages.get(block as usize), Some(Some(_))))
            .collect();
        let mut issues = Vec::new();
        if let Some(first) = missing.first() {
            issues.push(format!(
                "memory: {} committed blocks are not resident, first is block {}",
                missing.len(),
                first
            ));
        }
        Ok(issues)
    }
}
