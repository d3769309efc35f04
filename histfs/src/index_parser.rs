use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::block::BlockType;
use crate::disk_io::DiskIoSession;
use crate::error::{HistError, Result};
use crate::header::{FileHeaderBlock, SubFileHeader};
use crate::index_mapper::{IndexMapper, IndexPath, MAX_LEVEL};

/// The index nodes visited by the last resolution of a parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathCache {
    pub level: u8,
    /// Root pointer the path was walked from.
    pub root: u32,
    /// `(first covered virtual block, physical block)` of the node at each
    /// depth; only the first `depth` entries are meaningful.
    pub nodes: [(u32, u32); MAX_LEVEL],
    pub depth: usize,
}

impl PathCache {
    fn new(level: u8, root: u32) -> Self {
        PathCache {
            level,
            root,
            nodes: [(0, 0); MAX_LEVEL],
            depth: 0,
        }
    }

    /// Deepest cached node that also lies on `path`, as `(depth, physical)`.
    pub(crate) fn deepest_shared(&self, path: &IndexPath, root: u32) -> Option<(usize, u32)> {
        if self.level != path.level || self.root != root {
            return None;
        }
        // Bases nest, so a match at depth d implies matches above it.
        (0..self.depth)
            .rev()
            .find(|&d| self.nodes[d].0 == path.bases[d])
            .map(|d| (d, self.nodes[d].1))
    }
}

/// Change counter for the index tree of one sub-file within an edit.
///
/// Every shadow copy bumps the generation and publishes the writer's fresh
/// path; parsers compare their last seen generation before each resolution
/// and adopt the published path when it moved. The writer lock serializes
/// shadow copies of the sub-file.
#[derive(Debug, Default)]
pub struct IndexGeneration {
    generation: AtomicU64,
    published: Mutex<Option<PathCache>>,
    writer: Mutex<()>,
}

impl IndexGeneration {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn publish(&self, path: Option<PathCache>) -> u64 {
        let mut published = self.published.lock();
        *published = path;
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn latest(&self) -> (u64, Option<PathCache>) {
        let published = self.published.lock();
        (self.generation.load(Ordering::SeqCst), *published)
    }

    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock()
    }
}

/// Where a parser finds the root pointers of its sub-file.
#[derive(Clone)]
pub(crate) enum HeaderSource {
    /// A committed header; never changes.
    Snapshot {
        header: Arc<FileHeaderBlock>,
        file_index: usize,
    },
    /// The editable header of an in-flight edit.
    Edit {
        header: Arc<Mutex<FileHeaderBlock>>,
        file_index: usize,
    },
}

impl HeaderSource {
    pub(crate) fn sub_file(&self) -> Result<SubFileHeader> {
        let found = match self {
            HeaderSource::Snapshot { header, file_index } => header.files.get(*file_index).copied(),
            HeaderSource::Edit { header, file_index } => header.lock().files.get(*file_index).copied(),
        };
        found.ok_or_else(|| HistError::NotFound("sub-file descriptor".to_string()))
    }
}

/// Read-only virtual → physical translation for one sub-file.
pub struct IndexParser {
    io: DiskIoSession,
    source: HeaderSource,
    mapper: IndexMapper,
    cache: Option<PathCache>,
    generation: Option<Arc<IndexGeneration>>,
    seen_generation: u64,
}

impl IndexParser {
    pub(crate) fn new(
        io: DiskIoSession,
        source: HeaderSource,
        mapper: IndexMapper,
        generation: Option<Arc<IndexGeneration>>,
    ) -> Self {
        let seen_generation = generation.as_ref().map_or(0, |g| g.current());
        IndexParser {
            io,
            source,
            mapper,
            cache: None,
            generation,
            seen_generation,
        }
    }

    pub fn mapper(&self) -> &IndexMapper {
        &self.mapper
    }

    pub fn cached_path(&self) -> Option<&PathCache> {
        self.cache.as_ref()
    }

    /// Generation of the published path this parser last adopted.
    pub fn seen_generation(&self) -> u64 {
        self.seen_generation
    }

    pub(crate) fn source(&self) -> &HeaderSource {
        &self.source
    }

    pub(crate) fn io_mut(&mut self) -> &mut DiskIoSession {
        &mut self.io
    }

    pub(crate) fn io(&self) -> &DiskIoSession {
        &self.io
    }

    pub(crate) fn store_path(&mut self, path: PathCache, generation: u64) {
        self.cache = Some(path);
        self.seen_generation = generation;
    }

    /// Adopt the most recently published path if another session shadow
    /// copied part of this sub-file since the last resolution.
    pub fn refresh(&mut self) {
        let Some(generation) = &self.generation else {
            return;
        };
        if generation.current() == self.seen_generation {
            return;
        }
        let (current, published) = generation.latest();
        trace!(
            from = self.seen_generation,
            to = current,
            "index cache refreshed from published path"
        );
        self.cache = published;
        self.seen_generation = current;
    }

    /// Replace this parser's cached path with `fresher`'s.
    pub fn clear_index_cache(&mut self, fresher: &IndexParser) {
        self.cache = fresher.cache;
        self.seen_generation = fresher.seen_generation;
    }

    /// Drop the cached path entirely.
    pub fn forget_index_cache(&mut self) {
        self.cache = None;
        self.io.clear();
    }

    /// Physical block of `virtual_block`, or 0 if it does not exist.
    pub fn virtual_to_physical(&mut self, virtual_block: u32) -> Result<u32> {
        self.refresh();
        let Some(path) = self.mapper.map(virtual_block) else {
            return Ok(0);
        };
        let file = self.source.sub_file()?;
        let root = file.roots[path.level as usize];
        if root == 0 || path.level == 0 {
            return Ok(root);
        }

        let mut fresh = PathCache::new(path.level, root);
        let hit = self
            .cache
            .and_then(|c| c.deepest_shared(&path, root).map(|shared| (c, shared)));
        let (mut depth, mut node) = match hit {
            Some((cached, (depth, physical))) => {
                fresh.nodes[..depth].copy_from_slice(&cached.nodes[..depth]);
                (depth, physical)
            }
            None => (0, root),
        };

        loop {
            self.io
                .read(node, BlockType::IndexIndirect, path.bases[depth], path.node_level(depth))?;
            fresh.nodes[depth] = (path.bases[depth], node);
            fresh.depth = depth + 1;
            let child = self.io.read_pointer(path.offsets[depth])?;
            if child == 0 || depth + 1 == path.depth() {
                self.cache = Some(fresh);
                return Ok(child);
            }
            node = child;
            depth += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_io::SessionContext;
    use crate::header::SubFileName;
    use crate::medium::DiskMedium;
    use crate::memory_medium::MemoryMedium;
    use crate::page_pool::PagePool;

    /// Hand-build a single-indirect tree: root node at 2 pointing at data
    /// blocks 3 (virtual 1) and 4 (virtual 2).
    fn single_indirect_tree() -> (Arc<dyn DiskMedium>, Arc<FileHeaderBlock>) {
        let medium: Arc<dyn DiskMedium> = Arc::new(MemoryMedium::new(PagePool::new(128).unwrap()));
        let context = SessionContext {
            file_id: 0,
            snapshot_sequence: 1,
            watermark: 2,
            read_only: false,
        };
        let mut io = DiskIoSession::new(Arc::clone(&medium), context);
        io.write_to_new_block(3, BlockType::Data, 1, 0).unwrap();
        io.write_to_new_block(4, BlockType::Data, 2, 0).unwrap();
        io.write_to_new_block(2, BlockType::IndexIndirect, 1, 1).unwrap();
        io.write_pointer(0, 3).unwrap();
        io.write_pointer(1, 4).unwrap();

        let mut header = FileHeaderBlock::new(128);
        header.snapshot_sequence = 1;
        header.last_allocated_block = 4;
        let mut file = SubFileHeader::new(0, SubFileName::from_label("t"));
        file.roots[1] = 2;
        header.files.push(file);
        medium.commit(header.clone()).unwrap();
        (medium, Arc::new(header))
    }

    fn parser(medium: &Arc<dyn DiskMedium>, header: &Arc<FileHeaderBlock>) -> IndexParser {
        let context = SessionContext {
            file_id: 0,
            snapshot_sequence: header.snapshot_sequence,
            watermark: header.watermark(),
            read_only: true,
        };
        IndexParser::new(
            DiskIoSession::new(Arc::clone(medium), context),
            HeaderSource::Snapshot {
                header: Arc::clone(header),
                file_index: 0,
            },
            IndexMapper::new(128),
            None,
        )
    }

    #[test]
    fn test_resolves_through_single_indirect_node() {
        let (medium, header) = single_indirect_tree();
        let mut parser = parser(&medium, &header);
        assert_eq!(parser.virtual_to_physical(0).unwrap(), 0, "no direct block");
        assert_eq!(parser.virtual_to_physical(1).unwrap(), 3);
        assert_eq!(parser.virtual_to_physical(2).unwrap(), 4);
        assert_eq!(parser.virtual_to_physical(3).unwrap(), 0);
        assert_eq!(parser.virtual_to_physical(200).unwrap(), 0, "double level unset");
        assert_eq!(parser.virtual_to_physical(u32::MAX).unwrap(), 0, "beyond capacity");

        assert_eq!(parser.virtual_to_physical(2).unwrap(), 4);
        let path = parser.cached_path().unwrap();
        assert_eq!(path.level, 1);
        assert_eq!(path.depth, 1);
        assert_eq!(path.nodes[0], (1, 2));
    }

    #[test]
    fn test_clear_index_cache_copies_fresher_path() {
        let (medium, header) = single_indirect_tree();
        let mut fresh = parser(&medium, &header);
        let mut stale = parser(&medium, &header);
        fresh.virtual_to_physical(1).unwrap();
        assert!(stale.cached_path().is_none());
        stale.clear_index_cache(&fresh);
        assert_eq!(stale.cached_path(), fresh.cached_path());
        stale.forget_index_cache();
        assert!(stale.cached_path().is_none());
    }

    #[test]
    fn test_generation_refresh_adopts_published_path() {
        let (medium, header) = single_indirect_tree();
        let generation = IndexGeneration::new();
        let mut p = parser(&medium, &header);
        p.generation = Some(Arc::clone(&generation));
        p.virtual_to_physical(1).unwrap();

        let published = PathCache::new(1, 2);
        let next = generation.publish(Some(published));
        assert_eq!(next, 1);
        p.refresh();
        assert_eq!(p.seen_generation(), 1);
        assert_eq!(p.cached_path(), Some(&published));
    }
}
