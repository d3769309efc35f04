use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::block::{self, HEADER_BLOCK_COUNT};
use crate::error::{HistError, Result};
use crate::header::{FileHeaderBlock, HEADER_FIXED_SIZE};
use crate::medium::{DiskMedium, SharedPage};
use crate::options::{FileStructureOptions, OpenMode};
use crate::page_pool::{self, PagePool, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Maximum entry count for the committed-page cache.
/// Prevents excessive LRU overhead when block sizes are very small.
const BLOCK_CACHE_MAX_ENTRIES: usize = 4096;

/// Medium backed by a single file.
///
/// Block `n` lives at file offset `n * block_size`; blocks 0 and 1 are the two
/// header slots. Committed blocks are read on demand and kept in an LRU of
/// shared pages. Blocks created by the in-flight edit stay pinned in a dirty
/// table and reach the file only on commit, so a crash before the header
/// write leaves the previous snapshot intact.
///
/// The file is locked for the lifetime of the medium: shared for
/// [`OpenMode::Read`], exclusive for [`OpenMode::Write`].
pub struct FileMedium {
    path: PathBuf,
    file: Mutex<fs::File>,
    mode: OpenMode,
    block_size: usize,
    pool: Arc<PagePool>,
    committed: RwLock<Arc<FileHeaderBlock>>,
    clean: Mutex<LruCache<u32, SharedPage>>,
    dirty: Mutex<BTreeMap<u32, SharedPage>>,
}

impl FileMedium {
    /// Create a new, empty file structure at `path`.
    pub fn create(path: &Path, options: &FileStructureOptions) -> Result<Self> {
        if path.exists() {
            return Err(HistError::AlreadyExists(path.display().to_string()));
        }
        let pool = Self::pool_for(options, options.block_size)?;

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|e| {
            HistError::LockConflict(format!("{} is locked by another process: {}", path.display(), e))
        })?;

        let header = FileHeaderBlock::new(options.block_size as u32);
        let medium = FileMedium {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            mode: OpenMode::Write,
            block_size: options.block_size,
            pool,
            committed: RwLock::new(Arc::new(header.clone())),
            clean: Mutex::new(LruCache::new(Self::cache_capacity(options, options.block_size))),
            dirty: Mutex::new(BTreeMap::new()),
        };
        for slot in 0..HEADER_BLOCK_COUNT {
            medium.write_header(&header, slot)?;
        }
        medium.file.lock().sync_data()?;

        debug!(path = %path.display(), block_size = options.block_size, "created file structure");
        Ok(medium)
    }

    /// Open an existing file structure. The block size is taken from the file.
    pub fn open(path: &Path, mode: OpenMode, options: &FileStructureOptions) -> Result<Self> {
        let mut file = match mode {
            OpenMode::Read => fs::OpenOptions::new().read(true).open(path)?,
            OpenMode::Write => fs::OpenOptions::new().read(true).write(true).open(path)?,
        };

        let locked = match mode {
            OpenMode::Read => FileExt::try_lock_shared(&file),
            OpenMode::Write => file.try_lock_exclusive(),
        };
        locked.map_err(|e| {
            HistError::LockConflict(format!("{} is locked by another process: {}", path.display(), e))
        })?;

        let block_size = Self::probe_block_size(&mut file)?;
        let header = Self::load_newest_header(&mut file, block_size)?;
        let pool = Self::pool_for(options, block_size)?;

        debug!(
            path = %path.display(),
            block_size,
            snapshot = header.snapshot_sequence,
            files = header.files.len(),
            "opened file structure"
        );

        Ok(FileMedium {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            mode,
            block_size,
            pool,
            committed: RwLock::new(Arc::new(header)),
            clean: Mutex::new(LruCache::new(Self::cache_capacity(options, block_size))),
            dirty: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pool_for(options: &FileStructureOptions, block_size: usize) -> Result<Arc<PagePool>> {
        match &options.page_pool {
            Some(pool) if pool.page_size() != block_size => Err(HistError::InvalidArgument(format!(
                "page pool serves {}-byte pages, file uses {}-byte blocks",
                pool.page_size(),
                block_size
            ))),
            Some(pool) => Ok(Arc::clone(pool)),
            None => page_pool::default_pool(block_size),
        }
    }

    /// Compute cache entry count from the byte budget.
    fn cache_capacity(options: &FileStructureOptions, block_size: usize) -> NonZeroUsize {
        let entries = (options.cache_budget_bytes / block_size).clamp(1, BLOCK_CACHE_MAX_ENTRIES);
        NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Find the block size from whichever header slot is readable. Slot 1
    /// sits at `block_size`, so when slot 0 is damaged every supported size
    /// is tried.
    fn probe_block_size(file: &mut fs::File) -> Result<usize> {
        let mut fixed = [0u8; HEADER_FIXED_SIZE];
        if read_exact_at(file, 0, &mut fixed).is_ok() {
            if let Some(block_size) = FileHeaderBlock::peek_block_size(&fixed) {
                return Ok(block_size);
            }
        }
        let mut candidate = MIN_PAGE_SIZE;
        while candidate <= MAX_PAGE_SIZE {
            if read_exact_at(file, candidate as u64, &mut fixed).is_ok()
                && FileHeaderBlock::peek_block_size(&fixed) == Some(candidate)
            {
                warn!("header slot 0 is unreadable, block size taken from slot 1");
                return Ok(candidate);
            }
            candidate *= 2;
        }
        Err(HistError::CorruptBlock {
            block: 0,
            reason: "no readable header slot".to_string(),
        })
    }

    /// Read both header slots and keep the valid one with the highest
    /// snapshot sequence.
    fn load_newest_header(file: &mut fs::File, block_size: usize) -> Result<FileHeaderBlock> {
        let mut newest: Option<FileHeaderBlock> = None;
        let mut buf = vec![0u8; block_size];
        for slot in 0..HEADER_BLOCK_COUNT {
            let parsed = read_exact_at(file, slot as u64 * block_size as u64, &mut buf)
                .map_err(HistError::from)
                .and_then(|_| FileHeaderBlock::from_block(&buf, slot));
            match parsed {
                Ok(header) => {
                    let newer = newest
                        .as_ref()
                        .is_none_or(|h| header.snapshot_sequence > h.snapshot_sequence);
                    if newer {
                        newest = Some(header);
                    }
                }
                Err(e) => warn!(slot, error = %e, "ignoring invalid header slot"),
            }
        }
        newest.ok_or_else(|| HistError::CorruptBlock {
            block: 0,
            reason: "neither header slot is valid".to_string(),
        })
    }

    fn block_offset(&self, block: u32) -> u64 {
        block as u64 * self.block_size as u64
    }

    fn write_header(&self, header: &FileHeaderBlock, slot: u32) -> Result<()> {
        let mut page = self.pool.allocate()?;
        header.to_block(&mut page, slot)?;
        self.write_raw(slot, &page)
    }

    fn write_raw(&self, block: u32, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.block_offset(block)))?;
        file.write_all(data)?;
        Ok(())
    }

    fn load_block(&self, block: u32) -> Result<SharedPage> {
        let mut page = self.pool.allocate()?;
        {
            let mut file = self.file.lock();
            read_exact_at(&mut file, self.block_offset(block), &mut page)?;
        }
        block::verify_checksum(&page, block)?;
        Ok(Arc::new(RwLock::new(page)))
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode == OpenMode::Read {
            return Err(HistError::ReadOnly(self.path.display().to_string()));
        }
        Ok(())
    }

    /// Number of committed pages currently cached.
    pub fn cached_blocks(&self) -> usize {
        self.clean.lock().len()
    }
}

fn read_exact_at(file: &mut fs::File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

impl DiskMedium for FileMedium {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn page_pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    fn is_read_only(&self) -> bool {
        self.mode == OpenMode::Read
    }

    fn committed_header(&self) -> Arc<FileHeaderBlock> {
        Arc::clone(&self.committed.read())
    }

    fn read_block(&self, block: u32) -> Result<SharedPage> {
        if let Some(page) = self.dirty.lock().get(&block) {
            return Ok(Arc::clone(page));
        }
        if let Some(page) = self.clean.lock().get(&block) {
            return Ok(Arc::clone(page));
        }

        let last = self.committed.read().last_allocated_block;
        if block < HEADER_BLOCK_COUNT || block > last {
            return Err(HistError::CorruptBlock {
                block,
                reason: format!("outside the committed range 2..={}", last),
            });
        }
        let page = self.load_block(block)?;
        self.clean.lock().put(block, Arc::clone(&page));
        Ok(page)
    }

    fn create_block(&self, block: u32) -> Result<SharedPage> {
        self.ensure_writable()?;
        let watermark = self.committed.read().watermark();
        if block < watermark {
            return Err(HistError::InvalidArgument(format!(
                "block {} is below the watermark {}",
                block, watermark
            )));
        }
        let page: SharedPage = Arc::new(RwLock::new(self.pool.allocate_zeroed()?));
        self.dirty.lock().insert(block, Arc::clone(&page));
        Ok(page)
    }

    fn discard_block(&self, block: u32) {
        self.dirty.lock().remove(&block);
    }

    fn commit(&self, header: FileHeaderBlock) -> Result<()> {
        self.ensure_writable()?;
        let dirty = std::mem::take(&mut *self.dirty.lock());

        for (&block, page) in &dirty {
            let mut page = page.write();
            block::seal_checksum(&mut page);
            self.write_raw(block, &page)?;
        }
        {
            let file = self.file.lock();
            let needed = (header.last_allocated_block as u64 + 1) * self.block_size as u64;
            if file.metadata()?.len() < needed {
                file.set_len(needed)?;
            }
            file.sync_data()?;
        }

        let slot = header.snapshot_sequence % HEADER_BLOCK_COUNT;
        self.write_header(&header, slot)?;
        self.file.lock().sync_data()?;

        {
            let mut clean = self.clean.lock();
            for (block, page) in dirty {
                clean.put(block, page);
            }
        }
        *self.committed.write() = Arc::new(header);
        Ok(())
    }

    fn rollback(&self) {
        self.dirty.lock().clear();
    }

    fn verify(&self) -> Result<Vec<String>> {
        let mut issues = Vec::new();
        let header = self.committed_header();

        let needed = header.watermark() as u64 * self.block_size as u64;
        let len = self.file.lock().metadata()?.len();
        if len < needed {
            issues.push(format!(
                "file: length {} is shorter than {} committed blocks",
                len,
                header.watermark()
            ));
        }

        let mut file = self.file.lock();
        let mut buf = vec![0u8; self.block_size];
        let slot = header.snapshot_sequence % HEADER_BLOCK_COUNT;
        let reread = read_exact_at(&mut file, self.block_offset(slot), &mut buf)
            .map_err(HistError::from)
            .and_then(|_| FileHeaderBlock::from_block(&buf, slot));
        match reread {
            Ok(on_disk) if on_disk != *header => {
                issues.push(format!("file: header slot {} differs from the committed header", slot))
            }
            Ok(_) => {}
            Err(e) => issues.push(format!("file: header slot {}: {}", slot, e)),
        }
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockFooter, BlockType};

    fn temp_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("histfs_medium_{}_{}.hfs", name, std::process::id()));
        let _ = fs::remove_file(&path);
        path
    }

    fn options() -> FileStructureOptions {
        FileStructureOptions {
            page_pool: Some(PagePool::new(512).unwrap()),
            ..FileStructureOptions::with_block_size(512)
        }
    }

    #[test]
    fn test_create_then_open() {
        let path = temp_path("create_open");
        {
            let medium = FileMedium::create(&path, &options()).unwrap();
            assert_eq!(medium.committed_header().watermark(), 2);
            assert!(FileMedium::create(&path, &options()).is_err());
        }
        let medium = FileMedium::open(&path, OpenMode::Read, &options()).unwrap();
        assert_eq!(medium.block_size(), 512);
        assert!(medium.is_read_only());
        assert!(matches!(medium.create_block(2), Err(HistError::ReadOnly(_))));
        assert!(medium.verify().unwrap().is_empty());
        drop(medium);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_commit_persists_blocks() {
        let path = temp_path("commit");
        {
            let medium = FileMedium::create(&path, &options()).unwrap();
            let page = medium.create_block(2).unwrap();
            {
                let mut page = page.write();
                page[0..4].copy_from_slice(b"data");
                BlockFooter {
                    block_type: BlockType::Data,
                    level: 0,
                    file_id: 0,
                    index_value: 0,
                    snapshot_sequence: 1,
                }
                .write_to(&mut page);
            }
            let mut header = (*medium.committed_header()).clone();
            header.snapshot_sequence = 1;
            header.last_allocated_block = 2;
            medium.commit(header).unwrap();
        }
        {
            let medium = FileMedium::open(&path, OpenMode::Write, &options()).unwrap();
            assert_eq!(medium.committed_header().snapshot_sequence, 1);
            let page = medium.read_block(2).unwrap();
            assert_eq!(&page.read()[0..4], b"data");
            assert_eq!(medium.cached_blocks(), 1);
            assert!(medium.read_block(3).is_err());
        }
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_rollback_leaves_file_untouched() {
        let path = temp_path("rollback");
        {
            let medium = FileMedium::create(&path, &options()).unwrap();
            medium.create_block(2).unwrap();
            medium.rollback();
            assert!(medium.read_block(2).is_err());
        }
        assert_eq!(fs::metadata(&path).unwrap().len(), 2 * 512);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_open_survives_damaged_slot_zero() {
        let path = temp_path("damaged");
        {
            let medium = FileMedium::create(&path, &options()).unwrap();
            let mut header = (*medium.committed_header()).clone();
            header.snapshot_sequence = 1;
            medium.commit(header).unwrap();
        }
        {
            let mut file = fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.write_all(&[0u8; 64]).unwrap();
        }
        let medium = FileMedium::open(&path, OpenMode::Read, &options()).unwrap();
        assert_eq!(medium.committed_header().snapshot_sequence, 1);
        drop(medium);
        fs::remove_file(&path).unwrap();
    }
}
