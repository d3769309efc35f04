//! File header block and sub-file descriptors.
//!
//! The header is the root of a file structure: it names every sub-file, holds
//! each sub-file's index roots and records the last allocated physical block
//! at commit time. On disk it occupies one of the two header slots (physical
//! blocks 0 and 1), alternating by snapshot sequence.
//!
//! ```text
//! | magic "HISTFS01" (8) | version: u16 | file_count: u16 | block_size: u32 |
//! | snapshot_sequence: u32 | last_allocated_block: u32 | archive_id: [u8; 16] |
//! | sub-file descriptors: file_count * 46 bytes | ... | footer (32) |
//! ```

use std::fmt;

use rand::Rng;
use xxhash_rust::xxh3::xxh3_128;

use crate::block::{self, BlockFooter, BlockType, HEADER_BLOCK_COUNT};
use crate::error::{HistError, Result};

/// Magic bytes at the start of every header block.
pub const HEADER_MAGIC: &[u8; 8] = b"HISTFS01";

/// Current header format version.
pub const HEADER_VERSION: u16 = 1;

const H_MAGIC_OFFSET: usize = 0;
const H_VERSION_OFFSET: usize = H_MAGIC_OFFSET + 8;
const H_FILE_COUNT_OFFSET: usize = H_VERSION_OFFSET + 2;
const H_BLOCK_SIZE_OFFSET: usize = H_FILE_COUNT_OFFSET + 2;
const H_SNAPSHOT_OFFSET: usize = H_BLOCK_SIZE_OFFSET + 4;
const H_LAST_ALLOCATED_OFFSET: usize = H_SNAPSHOT_OFFSET + 4;
const H_ARCHIVE_ID_OFFSET: usize = H_LAST_ALLOCATED_OFFSET + 4;

/// Size of the fixed part of the header before the descriptors.
pub const HEADER_FIXED_SIZE: usize = H_ARCHIVE_ID_OFFSET + 16; // = 40

/// Serialized size of one [`SubFileHeader`].
pub const SUB_FILE_HEADER_SIZE: usize = 46;

/// Number of root pointers in a descriptor: direct plus four indirection
/// levels.
pub const ROOT_COUNT: usize = 5;

// ---------------------------------------------------------------------------
// SubFileName
// ---------------------------------------------------------------------------

/// GUID-like 16-byte sub-file name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SubFileName(pub [u8; 16]);

impl SubFileName {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill(&mut bytes);
        SubFileName(bytes)
    }

    /// Derive a stable name from a label, e.g. `"points"`.
    pub fn from_label(label: &str) -> Self {
        SubFileName(xxh3_128(label.as_bytes()).to_le_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SubFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SubFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubFileName({})", self)
    }
}

// ---------------------------------------------------------------------------
// SubFileHeader
// ---------------------------------------------------------------------------

/// Inode-style descriptor of one sub-file.
///
/// `roots[0]` is the direct block (virtual block 0); `roots[n]` for
/// `n = 1..=4` is the root of the n-level indirect tree. 0 means unallocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubFileHeader {
    pub file_id: u16,
    pub file_name: SubFileName,
    pub data_block_count: u32,
    /// Data blocks plus index nodes.
    pub total_block_count: u32,
    pub roots: [u32; ROOT_COUNT],
}

impl SubFileHeader {
    pub fn new(file_id: u16, file_name: SubFileName) -> Self {
        SubFileHeader {
            file_id,
            file_name,
            data_block_count: 0,
            total_block_count: 0,
            roots: [0; ROOT_COUNT],
        }
    }

    pub fn direct_block(&self) -> u32 {
        self.roots[0]
    }

    pub fn single_indirect_block(&self) -> u32 {
        self.roots[1]
    }

    pub fn double_indirect_block(&self) -> u32 {
        self.roots[2]
    }

    pub fn triple_indirect_block(&self) -> u32 {
        self.roots[3]
    }

    pub fn quadruple_indirect_block(&self) -> u32 {
        self.roots[4]
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.file_id.to_le_bytes());
        buf[2..18].copy_from_slice(&self.file_name.0);
        buf[18..22].copy_from_slice(&self.data_block_count.to_le_bytes());
        buf[22..26].copy_from_slice(&self.total_block_count.to_le_bytes());
        for (i, root) in self.roots.iter().enumerate() {
            let at = 26 + i * 4;
            buf[at..at + 4].copy_from_slice(&root.to_le_bytes());
        }
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut name = [0u8; 16];
        name.copy_from_slice(&buf[2..18]);
        let mut roots = [0u32; ROOT_COUNT];
        for (i, root) in roots.iter_mut().enumerate() {
            *root = read_u32(buf, 26 + i * 4);
        }
        SubFileHeader {
            file_id: u16::from_le_bytes([buf[0], buf[1]]),
            file_name: SubFileName(name),
            data_block_count: read_u32(buf, 18),
            total_block_count: read_u32(buf, 22),
            roots,
        }
    }
}

// ---------------------------------------------------------------------------
// FileHeaderBlock
// ---------------------------------------------------------------------------

/// A committed (or in-progress) file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeaderBlock {
    pub block_size: u32,
    pub snapshot_sequence: u32,
    /// Highest physical block in use. Blocks above it at commit time do not
    /// exist for readers.
    pub last_allocated_block: u32,
    pub archive_id: [u8; 16],
    pub files: Vec<SubFileHeader>,
}

impl FileHeaderBlock {
    /// Header of a brand new, empty file structure.
    pub fn new(block_size: u32) -> Self {
        let mut archive_id = [0u8; 16];
        rand::rng().fill(&mut archive_id);
        FileHeaderBlock {
            block_size,
            snapshot_sequence: 0,
            last_allocated_block: HEADER_BLOCK_COUNT - 1,
            archive_id,
            files: Vec::new(),
        }
    }

    /// First physical block a new edit may allocate; everything below it is
    /// immutable for the duration of that edit.
    pub fn watermark(&self) -> u32 {
        self.last_allocated_block + 1
    }

    /// Maximum number of sub-files one header can describe.
    pub fn max_files(block_size: usize) -> usize {
        (block::usable_length(block_size) - HEADER_FIXED_SIZE) / SUB_FILE_HEADER_SIZE
    }

    /// Block size recorded in the fixed part of a header, if `fixed` starts
    /// with the header magic and the size is plausible.
    pub fn peek_block_size(fixed: &[u8]) -> Option<usize> {
        if fixed.len() < HEADER_FIXED_SIZE || &fixed[H_MAGIC_OFFSET..H_VERSION_OFFSET] != HEADER_MAGIC
        {
            return None;
        }
        let block_size = read_u32(fixed, H_BLOCK_SIZE_OFFSET) as usize;
        crate::page_pool::validate_page_size(block_size)
            .ok()
            .map(|_| block_size)
    }

    pub fn find_file(&self, name: &SubFileName) -> Option<usize> {
        self.files.iter().position(|f| f.file_name == *name)
    }

    /// Serialize into a full block buffer, including footer and checksum.
    /// `slot` is the header block index this copy is destined for.
    pub fn to_block(&self, buf: &mut [u8], slot: u32) -> Result<()> {
        if buf.len() != self.block_size as usize {
            return Err(HistError::InvalidArgument(format!(
                "header buffer is {} bytes, block size is {}",
                buf.len(),
                self.block_size
            )));
        }
        if self.files.len() > Self::max_files(buf.len()) {
            return Err(HistError::InvalidArgument(format!(
                "{} sub-files exceed the header capacity of {}",
                self.files.len(),
                Self::max_files(buf.len())
            )));
        }

        buf.fill(0);
        buf[H_MAGIC_OFFSET..H_VERSION_OFFSET].copy_from_slice(HEADER_MAGIC);
        buf[H_VERSION_OFFSET..H_FILE_COUNT_OFFSET].copy_from_slice(&HEADER_VERSION.to_le_bytes());
        buf[H_FILE_COUNT_OFFSET..H_BLOCK_SIZE_OFFSET]
            .copy_from_slice(&(self.files.len() as u16).to_le_bytes());
        buf[H_BLOCK_SIZE_OFFSET..H_SNAPSHOT_OFFSET].copy_from_slice(&self.block_size.to_le_bytes());
        buf[H_SNAPSHOT_OFFSET..H_LAST_ALLOCATED_OFFSET]
            .copy_from_slice(&self.snapshot_sequence.to_le_bytes());
        buf[H_LAST_ALLOCATED_OFFSET..H_ARCHIVE_ID_OFFSET]
            .copy_from_slice(&self.last_allocated_block.to_le_bytes());
        buf[H_ARCHIVE_ID_OFFSET..HEADER_FIXED_SIZE].copy_from_slice(&self.archive_id);

        for (i, file) in self.files.iter().enumerate() {
            let at = HEADER_FIXED_SIZE + i * SUB_FILE_HEADER_SIZE;
            file.write_to(&mut buf[at..at + SUB_FILE_HEADER_SIZE]);
        }

        BlockFooter {
            block_type: BlockType::Header,
            level: 0,
            file_id: 0,
            index_value: slot,
            snapshot_sequence: self.snapshot_sequence,
        }
        .write_to(buf);
        block::seal_checksum(buf);
        Ok(())
    }

    /// Parse a header block read from `slot`.
    pub fn from_block(buf: &[u8], slot: u32) -> Result<Self> {
        let corrupt = |reason: String| HistError::CorruptBlock { block: slot, reason };

        if buf.len() < HEADER_FIXED_SIZE + block::BLOCK_FOOTER_LENGTH {
            return Err(corrupt(format!("header block too short: {}", buf.len())));
        }
        if &buf[H_MAGIC_OFFSET..H_VERSION_OFFSET] != HEADER_MAGIC {
            return Err(corrupt("bad header magic".to_string()));
        }
        block::verify_checksum(buf, slot)?;

        let version = u16::from_le_bytes([buf[H_VERSION_OFFSET], buf[H_VERSION_OFFSET + 1]]);
        if version != HEADER_VERSION {
            return Err(corrupt(format!("unsupported header version {}", version)));
        }
        let block_size = read_u32(buf, H_BLOCK_SIZE_OFFSET);
        if block_size as usize != buf.len() {
            return Err(corrupt(format!(
                "header records block size {}, read {} bytes",
                block_size,
                buf.len()
            )));
        }

        let footer = BlockFooter::read_from(buf, slot)?;
        let snapshot_sequence = read_u32(buf, H_SNAPSHOT_OFFSET);
        footer.expect(slot, BlockType::Header, 0, slot, 0, snapshot_sequence)?;

        let file_count =
            u16::from_le_bytes([buf[H_FILE_COUNT_OFFSET], buf[H_FILE_COUNT_OFFSET + 1]]) as usize;
        if file_count > Self::max_files(buf.len()) {
            return Err(corrupt(format!("file count {} exceeds capacity", file_count)));
        }
        let files = (0..file_count)
            .map(|i| {
                let at = HEADER_FIXED_SIZE + i * SUB_FILE_HEADER_SIZE;
                SubFileHeader::read_from(&buf[at..at + SUB_FILE_HEADER_SIZE])
            })
            .collect();

        let mut archive_id = [0u8; 16];
        archive_id.copy_from_slice(&buf[H_ARCHIVE_ID_OFFSET..HEADER_FIXED_SIZE]);

        Ok(FileHeaderBlock {
            block_size,
            snapshot_sequence,
            last_allocated_block: read_u32(buf, H_LAST_ALLOCATED_OFFSET),
            archive_id,
            files,
        })
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}
