//! Virtual block → index path arithmetic.
//!
//! A sub-file addresses its blocks through an inode-style tree: one direct
//! pointer, then single, double, triple and quadruple indirect trees. Each
//! index node holds `A = usable_length / 4` little-endian `u32` pointers.
//!
//! ```text
//! level 0: [0, 1)                  direct block
//! level 1: [1, 1 + A)              root -> data
//! level 2: [1 + A, 1 + A + A^2)    root -> node -> data
//! level 3: ... + A^3
//! level 4: ... + A^4
//! ```

use crate::block;
use crate::header::ROOT_COUNT;

/// Deepest indirection level.
pub const MAX_LEVEL: usize = ROOT_COUNT - 1;

/// The route from a sub-file's root pointer to one virtual block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexPath {
    pub virtual_block: u32,
    /// Indirection level: 0 = direct block, `n` = `n` index nodes on the path.
    pub level: u8,
    /// `offsets[d]` is the pointer slot taken in the node at depth `d`
    /// (depth 0 = root node).
    pub offsets: [u32; MAX_LEVEL],
    /// `bases[d]` is the first virtual block covered by the node at depth
    /// `d`; it is also the `index_value` in that node's footer.
    pub bases: [u32; MAX_LEVEL],
}

impl IndexPath {
    /// Number of index nodes on the path.
    pub fn depth(&self) -> usize {
        self.level as usize
    }

    /// Footer level of the node at `depth`: indirection levels at and below it.
    pub fn node_level(&self, depth: usize) -> u8 {
        self.level - depth as u8
    }
}

/// Maps virtual blocks to index paths for one block size.
#[derive(Debug, Clone, Copy)]
pub struct IndexMapper {
    pointers_per_node: u64,
    /// `level_starts[n]` = first virtual block of level `n`; the last entry is
    /// the tree capacity.
    level_starts: [u64; ROOT_COUNT + 1],
}

impl IndexMapper {
    pub fn new(block_size: usize) -> Self {
        let pointers_per_node = (block::usable_length(block_size) / 4) as u64;
        let mut level_starts = [0u64; ROOT_COUNT + 1];
        level_starts[1] = 1;
        for level in 1..ROOT_COUNT {
            let span = pointers_per_node.saturating_pow(level as u32);
            level_starts[level + 1] = level_starts[level].saturating_add(span);
        }
        IndexMapper {
            pointers_per_node,
            level_starts,
        }
    }

    pub fn pointers_per_node(&self) -> u32 {
        self.pointers_per_node as u32
    }

    /// Number of virtual blocks the tree can address.
    pub fn capacity(&self) -> u64 {
        self.level_starts[ROOT_COUNT]
    }

    /// First virtual block of indirection level `level`.
    pub fn level_start(&self, level: usize) -> u64 {
        self.level_starts[level]
    }

    /// The path to `virtual_block`, or `None` past the tree capacity.
    pub fn map(&self, virtual_block: u32) -> Option<IndexPath> {
        let v = virtual_block as u64;
        if v >= self.capacity() {
            return None;
        }
        let level = (0..ROOT_COUNT)
            .rev()
            .find(|&l| v >= self.level_starts[l])
            .unwrap_or(0);

        let mut path = IndexPath {
            virtual_block,
            level: level as u8,
            offsets: [0; MAX_LEVEL],
            bases: [0; MAX_LEVEL],
        };
        let start = self.level_starts[level];
        let relative = v - start;
        let a = self.pointers_per_node;
        for depth in 0..level {
            // A node at depth d covers A^(level - d) blocks; each of its
            // slots covers A^(level - d - 1).
            let node_span = a.pow((level - depth) as u32);
            let slot_span = a.pow((level - depth - 1) as u32);
            path.bases[depth] = (start + (relative / node_span) * node_span) as u32;
            path.offsets[depth] = ((relative / slot_span) % a) as u32;
        }
        Some(path)
    }

    /// Blocks covered by one node at `node_level`.
    pub fn node_span(&self, node_level: u8) -> u64 {
        self.pointers_per_node.saturating_pow(node_level as u32)
    }
}
