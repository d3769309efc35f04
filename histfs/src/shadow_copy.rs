//! Write-path translation with copy-on-write of data blocks and index nodes.
//!
//! Resolving a virtual block for writing walks the same path as
//! [`IndexParser`], but every block on that path must end up at or above the
//! watermark. Blocks already there are reused in place; missing blocks are
//! created zeroed; older blocks are copied to a new physical block. The new
//! blocks are linked bottom-up, so the tree only changes at the single final
//! pointer write that attaches the new branch.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::block::{BlockType, HEADER_BLOCK_COUNT};
use crate::disk_io::DiskIoSession;
use crate::error::{HistError, Result};
use crate::header::FileHeaderBlock;
use crate::index_mapper::{IndexMapper, IndexPath, MAX_LEVEL};
use crate::index_parser::{IndexGeneration, IndexParser, PathCache};

/// Result of [`ShadowCopyAllocator::virtual_to_shadow_physical`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowResolution {
    pub physical: u32,
    /// True when any block on the path was created or copied by this call.
    pub was_newly_shadow_copied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Already owned by the edit.
    Reuse,
    /// Never allocated.
    Fresh,
    /// Committed block that must be copied.
    Copy(u32),
}

/// Positions on a path: index nodes at depths `0..depth`, then the data block.
const PATH_LEN: usize = MAX_LEVEL + 1;

/// Editable counterpart of [`IndexParser`].
pub struct ShadowCopyAllocator {
    parser: IndexParser,
    writer: DiskIoSession,
    header: Arc<Mutex<FileHeaderBlock>>,
    file_index: usize,
    generation: Arc<IndexGeneration>,
}

impl ShadowCopyAllocator {
    pub(crate) fn new(
        parser: IndexParser,
        writer: DiskIoSession,
        header: Arc<Mutex<FileHeaderBlock>>,
        file_index: usize,
        generation: Arc<IndexGeneration>,
    ) -> Self {
        ShadowCopyAllocator {
            parser,
            writer,
            header,
            file_index,
            generation,
        }
    }

    pub fn as_parser(&self) -> &IndexParser {
        &self.parser
    }

    pub fn as_parser_mut(&mut self) -> &mut IndexParser {
        &mut self.parser
    }

    pub fn mapper(&self) -> &IndexMapper {
        self.parser.mapper()
    }

    /// Physical block of `virtual_block` as the edit currently sees it, or 0.
    pub fn virtual_to_physical(&mut self, virtual_block: u32) -> Result<u32> {
        self.parser.virtual_to_physical(virtual_block)
    }

    pub fn clear_index_cache(&mut self, fresher: &IndexParser) {
        self.parser.clear_index_cache(fresher);
    }

    pub fn refresh(&mut self) {
        self.parser.refresh();
    }

    fn watermark(&self) -> u32 {
        self.writer.context().watermark
    }

    /// Resolve `virtual_block` to a physical block the edit may write,
    /// shadow copying every block on the path that predates the edit.
    pub fn virtual_to_shadow_physical(&mut self, virtual_block: u32) -> Result<ShadowResolution> {
        let path = self.parser.mapper().map(virtual_block).ok_or_else(|| {
            HistError::OutOfRange(format!(
                "virtual block {} is beyond the index capacity of {} blocks",
                virtual_block,
                self.parser.mapper().capacity()
            ))
        })?;

        let generation = Arc::clone(&self.generation);
        let _writer = generation.lock_writer();
        self.parser.refresh();

        let header = Arc::clone(&self.header);
        let mut header = header.lock();
        let root = header
            .files
            .get(self.file_index)
            .map(|f| f.roots[path.level as usize])
            .ok_or_else(|| HistError::NotFound("sub-file descriptor".to_string()))?;

        let existing = self.plan(&path, root)?;
        let watermark = self.watermark();
        let len = path.depth() + 1;
        let mut steps = [Step::Reuse; PATH_LEN];
        for i in 0..len {
            steps[i] = match existing[i] {
                0 => Step::Fresh,
                b if b >= watermark => Step::Reuse,
                b => Step::Copy(b),
            };
        }

        if steps[..len].iter().all(|s| *s == Step::Reuse) {
            return Ok(ShadowResolution {
                physical: existing[path.depth()],
                was_newly_shadow_copied: false,
            });
        }

        let saved_last = header.last_allocated_block;
        let saved_file = header.files[self.file_index];
        let created = match self.allocate(&path, &steps[..len], &mut header) {
            Ok(created) => created,
            Err(e) => {
                header.last_allocated_block = saved_last;
                return Err(HistError::ShadowCopyFailed(e.to_string()));
            }
        };

        let linked = self
            .fill_and_link(&path, &steps[..len], &created)
            .and_then(|()| self.attach(&path, &steps[..len], &existing, &created, &mut header));
        if let Err(e) = linked {
            self.discard(&created[..len]);
            header.last_allocated_block = saved_last;
            header.files[self.file_index] = saved_file;
            return Err(HistError::ShadowCopyFailed(e.to_string()));
        }

        let mut final_blocks = [0u32; PATH_LEN];
        for i in 0..len {
            final_blocks[i] = if created[i] != 0 { created[i] } else { existing[i] };
        }
        let file = &mut header.files[self.file_index];
        for (i, step) in steps[..len].iter().enumerate() {
            if *step == Step::Fresh {
                file.total_block_count += 1;
                if i == path.depth() {
                    file.data_block_count += 1;
                }
            }
        }
        drop(header);

        let mut cache = PathCache {
            level: path.level,
            root: final_blocks[0],
            nodes: [(0, 0); MAX_LEVEL],
            depth: path.depth(),
        };
        for d in 0..path.depth() {
            cache.nodes[d] = (path.bases[d], final_blocks[d]);
        }
        let next = self.generation.publish(Some(cache));
        self.parser.store_path(cache, next);

        trace!(
            virtual_block,
            physical = final_blocks[path.depth()],
            level = path.level,
            copied = steps[..len].iter().filter(|s| matches!(s, Step::Copy(_))).count(),
            created = steps[..len].iter().filter(|s| **s == Step::Fresh).count(),
            generation = next,
            "shadow copy"
        );

        Ok(ShadowResolution {
            physical: final_blocks[path.depth()],
            was_newly_shadow_copied: true,
        })
    }

    /// Read the pointers on `path`: `existing[0]` is the root, `existing[d + 1]`
    /// the pointer found in the node at depth `d`. Stops at the first 0.
    /// Nodes shared with the parser's cached path are taken from the cache;
    /// the walk starts at the deepest of them.
    fn plan(&mut self, path: &IndexPath, root: u32) -> Result<[u32; PATH_LEN]> {
        let mut existing = [0u32; PATH_LEN];
        existing[0] = root;
        let mut start = 0;
        if let Some(cached) = self.parser.cached_path() {
            if let Some((depth, _)) = cached.deepest_shared(path, root) {
                for d in 0..=depth {
                    existing[d] = cached.nodes[d].1;
                }
                start = depth;
            }
        }
        let io = self.parser.io_mut();
        for d in start..path.depth() {
            if existing[d] == 0 {
                break;
            }
            io.read(
                existing[d],
                BlockType::IndexIndirect,
                path.bases[d],
                path.node_level(d),
            )?;
            existing[d + 1] = io.read_pointer(path.offsets[d])?;
        }
        Ok(existing)
    }

    /// Footer identity of position `i` on `path`.
    fn identity(path: &IndexPath, i: usize) -> (BlockType, u32, u8) {
        if i < path.depth() {
            (BlockType::IndexIndirect, path.bases[i], path.node_level(i))
        } else {
            (BlockType::Data, path.virtual_block, 0)
        }
    }

    /// Reserve physical numbers and pages for every non-reused position.
    /// On failure every page obtained so far is discarded.
    fn allocate(
        &mut self,
        path: &IndexPath,
        steps: &[Step],
        header: &mut FileHeaderBlock,
    ) -> Result<[u32; PATH_LEN]> {
        let mut created = [0u32; PATH_LEN];
        for (i, step) in steps.iter().enumerate() {
            if *step == Step::Reuse {
                continue;
            }
            let next = header
                .last_allocated_block
                .checked_add(1)
                .filter(|&b| b >= HEADER_BLOCK_COUNT && b != u32::MAX)
                .ok_or_else(|| HistError::OutOfRange("physical block space exhausted".to_string()));
            let (block_type, index_value, level) = Self::identity(path, i);
            let result = next.and_then(|block| {
                self.writer
                    .write_to_new_block(block, block_type, index_value, level)
                    .map(|()| block)
            });
            match result {
                Ok(block) => {
                    header.last_allocated_block = block;
                    created[i] = block;
                }
                Err(e) => {
                    self.discard(&created);
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    /// Copy committed content into the new blocks and point each new index
    /// node at its new child. Nothing reachable from the tree changes.
    fn fill_and_link(
        &mut self,
        path: &IndexPath,
        steps: &[Step],
        created: &[u32; PATH_LEN],
    ) -> Result<()> {
        for (i, step) in steps.iter().enumerate() {
            if let Step::Copy(old) = *step {
                let (block_type, index_value, level) = Self::identity(path, i);
                self.parser.io_mut().read(old, block_type, index_value, level)?;
                self.writer
                    .write_to_existing_block(created[i], block_type, index_value, level)?;
                self.writer.copy_from(self.parser.io())?;
            }
        }
        for i in (1..steps.len()).rev() {
            if created[i] == 0 || created[i - 1] == 0 {
                continue;
            }
            let (block_type, index_value, level) = Self::identity(path, i - 1);
            self.writer
                .write_to_existing_block(created[i - 1], block_type, index_value, level)?;
            self.writer.write_pointer(path.offsets[i - 1], created[i])?;
        }
        Ok(())
    }

    /// Hook the topmost new block into the tree: either the root pointer in
    /// the editable header or a pointer inside a node the edit already owns.
    fn attach(
        &mut self,
        path: &IndexPath,
        steps: &[Step],
        existing: &[u32; PATH_LEN],
        created: &[u32; PATH_LEN],
        header: &mut FileHeaderBlock,
    ) -> Result<()> {
        let Some(top) = steps.iter().position(|s| *s != Step::Reuse) else {
            return Ok(());
        };
        if top == 0 {
            header.files[self.file_index].roots[path.level as usize] = created[0];
            return Ok(());
        }
        let parent = existing[top - 1];
        let (block_type, index_value, level) = Self::identity(path, top - 1);
        self.writer
            .write_to_existing_block(parent, block_type, index_value, level)?;
        self.writer.write_pointer(path.offsets[top - 1], created[top])
    }

    fn discard(&mut self, created: &[u32]) {
        self.writer.clear();
        self.parser.io_mut().clear();
        let medium = Arc::clone(self.parser.io().medium());
        for &block in created.iter().filter(|&&b| b != 0) {
            medium.discard_block(block);
        }
    }
}
