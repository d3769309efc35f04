use std::collections::HashSet;
use std::sync::Arc;

use crate::block::{BlockFooter, BlockType, FIRST_DATA_BLOCK};
use crate::error::Result;
use crate::header::{FileHeaderBlock, SubFileHeader};
use crate::index_mapper::IndexMapper;
use crate::medium::DiskMedium;

struct Walk<'a> {
    medium: &'a Arc<dyn DiskMedium>,
    header: &'a FileHeaderBlock,
    mapper: &'a IndexMapper,
    seen: HashSet<u32>,
    issues: Vec<String>,
}

#[derive(Default)]
struct Counts {
    data: u32,
    total: u32,
}

impl Walk<'_> {
    /// Check that `block` is a plausible, unclaimed address. Returns false if
    /// it must not be read.
    fn claim(&mut self, file: &SubFileHeader, block: u32) -> bool {
        if block < FIRST_DATA_BLOCK || block > self.header.last_allocated_block {
            self.issues.push(format!(
                "file {}: block {} is outside {}..={}",
                file.file_id, block, FIRST_DATA_BLOCK, self.header.last_allocated_block
            ));
            return false;
        }
        if !self.seen.insert(block) {
            self.issues
                .push(format!("file {}: block {} is referenced twice", file.file_id, block));
            return false;
        }
        true
    }

    /// Read `block` and check its footer. Returns the pointer slots for index
    /// nodes, an empty list for data blocks, `None` if the block is unusable.
    fn load(
        &mut self,
        file: &SubFileHeader,
        block: u32,
        block_type: BlockType,
        index_value: u32,
        level: u8,
    ) -> Option<Vec<u32>> {
        let page = match self.medium.read_block(block) {
            Ok(page) => page,
            Err(e) => {
                self.issues.push(format!("file {}: {}", file.file_id, e));
                return None;
            }
        };
        let page = page.read();
        let checked = BlockFooter::read_from(&page, block).and_then(|footer| {
            footer.expect(
                block,
                block_type,
                file.file_id,
                index_value,
                level,
                self.header.snapshot_sequence,
            )
        });
        if let Err(e) = checked {
            self.issues.push(format!("file {}: {}", file.file_id, e));
            return None;
        }
        if block_type == BlockType::Data {
            return Some(Vec::new());
        }
        let slots = self.mapper.pointers_per_node() as usize;
        Some(
            page[..slots * 4]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    fn walk_data(&mut self, file: &SubFileHeader, block: u32, virtual_block: u32, counts: &mut Counts) {
        if !self.claim(file, block) {
            return;
        }
        counts.data += 1;
        counts.total += 1;
        self.load(file, block, BlockType::Data, virtual_block, 0);
    }

    fn walk_node(&mut self, file: &SubFileHeader, block: u32, base: u64, level: u8, counts: &mut Counts) {
        if !self.claim(file, block) {
            return;
        }
        counts.total += 1;
        let Some(pointers) = self.load(file, block, BlockType::IndexIndirect, base as u32, level) else {
            return;
        };
        let child_span = self.mapper.node_span(level - 1);
        for (slot, &child) in pointers.iter().enumerate() {
            if child == 0 {
                continue;
            }
            let child_base = base + slot as u64 * child_span;
            if level == 1 {
                self.walk_data(file, child, child_base as u32, counts);
            } else {
                self.walk_node(file, child, child_base, level - 1, counts);
            }
        }
    }
}

/// Walk every sub-file of a committed header. Returns one message per issue.
pub(crate) fn verify_snapshot(
    medium: &Arc<dyn DiskMedium>,
    header: &FileHeaderBlock,
    mapper: &IndexMapper,
) -> Result<Vec<String>> {
    let mut walk = Walk {
        medium,
        header,
        mapper,
        seen: HashSet::new(),
        issues: Vec::new(),
    };

    let mut names = HashSet::new();
    for (index, file) in header.files.iter().enumerate() {
        if file.file_id as usize != index {
            walk.issues
                .push(format!("file {}: stored at descriptor index {}", file.file_id, index));
        }
        if !names.insert(file.file_name) {
            walk.issues
                .push(format!("file {}: duplicate name {}", file.file_id, file.file_name));
        }

        let mut counts = Counts::default();
        for (level, &root) in file.roots.iter().enumerate() {
            if root == 0 {
                continue;
            }
            if level == 0 {
                walk.walk_data(file, root, 0, &mut counts);
            } else {
                let base = mapper.level_start(level);
                walk.walk_node(file, root, base, level as u8, &mut counts);
            }
        }

        if counts.data != file.data_block_count {
            walk.issues.push(format!(
                "file {}: descriptor claims {} data blocks, found {}",
                file.file_id, file.data_block_count, counts.data
            ));
        }
        if counts.total != file.total_block_count {
            walk.issues.push(format!(
                "file {}: descriptor claims {} blocks, found {}",
                file.file_id, file.total_block_count, counts.total
            ));
        }
    }
    Ok(walk.issues)
}
