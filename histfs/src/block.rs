//! Block layout shared by every medium.
//!
//! Each block ends with a fixed 32-byte footer; the rest is the usable data
//! region handed to index nodes and data blocks.
//!
//! ```text
//! | usable data (block_size - 32) | footer (32) |
//!
//! footer:
//! | block_type: u8 | level: u8 | file_id: u16 | index_value: u32 |
//! | snapshot_sequence: u32 | reserved: [u8; 12] | checksum: u64 |
//! ```

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{HistError, Result};

/// Bytes reserved at the end of every block.
pub const BLOCK_FOOTER_LENGTH: usize = 32;

/// Physical blocks 0 and 1 hold the two alternating header copies.
pub const HEADER_BLOCK_COUNT: u32 = 2;

/// First physical block available to index nodes and data blocks.
pub const FIRST_DATA_BLOCK: u32 = HEADER_BLOCK_COUNT;

const F_TYPE_OFFSET: usize = 0;
const F_LEVEL_OFFSET: usize = 1;
const F_FILE_ID_OFFSET: usize = 2;
const F_INDEX_VALUE_OFFSET: usize = 4;
const F_SNAPSHOT_OFFSET: usize = 8;
const F_CHECKSUM_OFFSET: usize = 24;

/// Usable data bytes of a block of `block_size` bytes.
pub fn usable_length(block_size: usize) -> usize {
    block_size - BLOCK_FOOTER_LENGTH
}

/// The role of a block, recorded in its footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    Header = 1,
    IndexIndirect = 2,
    Data = 3,
}

impl BlockType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Header),
            2 => Some(Self::IndexIndirect),
            3 => Some(Self::Data),
            _ => None,
        }
    }
}

/// Decoded block footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFooter {
    pub block_type: BlockType,
    /// 0 for data and header blocks; indirection levels at and below an
    /// index node (1 = its entries point at data blocks).
    pub level: u8,
    pub file_id: u16,
    /// Virtual block index for data blocks, first covered virtual block for
    /// index nodes, slot number for header blocks.
    pub index_value: u32,
    pub snapshot_sequence: u32,
}

impl BlockFooter {
    /// Write this footer at the end of `block`. The checksum field is zeroed;
    /// see [`seal_checksum`].
    pub fn write_to(&self, block: &mut [u8]) {
        let footer = footer_mut(block);
        footer.fill(0);
        footer[F_TYPE_OFFSET] = self.block_type as u8;
        footer[F_LEVEL_OFFSET] = self.level;
        footer[F_FILE_ID_OFFSET..F_FILE_ID_OFFSET + 2].copy_from_slice(&self.file_id.to_le_bytes());
        footer[F_INDEX_VALUE_OFFSET..F_INDEX_VALUE_OFFSET + 4]
            .copy_from_slice(&self.index_value.to_le_bytes());
        footer[F_SNAPSHOT_OFFSET..F_SNAPSHOT_OFFSET + 4]
            .copy_from_slice(&self.snapshot_sequence.to_le_bytes());
    }

    /// Decode the footer of `block`. `physical` is only used for the error.
    pub fn read_from(block: &[u8], physical: u32) -> Result<Self> {
        let footer = &block[block.len() - BLOCK_FOOTER_LENGTH..];
        let block_type = BlockType::from_u8(footer[F_TYPE_OFFSET]).ok_or_else(|| {
            HistError::CorruptBlock {
                block: physical,
                reason: format!("unknown block type {}", footer[F_TYPE_OFFSET]),
            }
        })?;
        Ok(BlockFooter {
            block_type,
            level: footer[F_LEVEL_OFFSET],
            file_id: u16::from_le_bytes([footer[F_FILE_ID_OFFSET], footer[F_FILE_ID_OFFSET + 1]]),
            index_value: read_u32(footer, F_INDEX_VALUE_OFFSET),
            snapshot_sequence: read_u32(footer, F_SNAPSHOT_OFFSET),
        })
    }

    /// Check that the footer describes the block the caller walked to.
    pub fn expect(
        &self,
        physical: u32,
        block_type: BlockType,
        file_id: u16,
        index_value: u32,
        level: u8,
        snapshot_sequence: u32,
    ) -> Result<()> {
        let mismatch = |reason: String| {
            Err(HistError::CorruptBlock {
                block: physical,
                reason,
            })
        };
        if self.block_type != block_type {
            return mismatch(format!(
                "expected {:?} block, found {:?}",
                block_type, self.block_type
            ));
        }
        if self.file_id != file_id {
            return mismatch(format!(
                "belongs to file {}, expected file {}",
                self.file_id, file_id
            ));
        }
        if self.index_value != index_value || self.level != level {
            return mismatch(format!(
                "index value {} level {}, expected {} level {}",
                self.index_value, self.level, index_value, level
            ));
        }
        if self.snapshot_sequence > snapshot_sequence {
            return mismatch(format!(
                "written by snapshot {} which is newer than {}",
                self.snapshot_sequence, snapshot_sequence
            ));
        }
        Ok(())
    }
}

fn footer_mut(block: &mut [u8]) -> &mut [u8] {
    let start = block.len() - BLOCK_FOOTER_LENGTH;
    &mut block[start..]
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn compute_checksum(block: &[u8]) -> u64 {
    let checksum_start = block.len() - BLOCK_FOOTER_LENGTH + F_CHECKSUM_OFFSET;
    // Hash everything but the checksum field itself.
    let head = xxh3_64(&block[..checksum_start]);
    // A zero checksum means "never sealed", so never produce one.
    head.max(1)
}

/// Compute and store the checksum of a full block.
pub fn seal_checksum(block: &mut [u8]) {
    let checksum = compute_checksum(block);
    let start = block.len() - BLOCK_FOOTER_LENGTH + F_CHECKSUM_OFFSET;
    block[start..start + 8].copy_from_slice(&checksum.to_le_bytes());
}

/// Verify the checksum stored in a full block.
pub fn verify_checksum(block: &[u8], physical: u32) -> Result<()> {
    let start = block.len() - BLOCK_FOOTER_LENGTH + F_CHECKSUM_OFFSET;
    let stored = u64::from_le_bytes(
        block[start..start + 8]
            .try_into()
            .map_err(|_| HistError::CorruptBlock {
                block: physical,
                reason: "truncated footer".to_string(),
            })?,
    );
    let actual = compute_checksum(block);
    if stored != actual {
        return Err(HistError::CorruptBlock {
            block: physical,
            reason: format!("checksum mismatch: stored {:#x}, computed {:#x}", stored, actual),
        });
    }
    Ok(())
}
