//! Per-sub-file streams and their I/O sessions.
//!
//! A [`SubFileStream`] opened from a [`ReadSnapshot`](crate::ReadSnapshot) is
//! read-only and resolves blocks through an [`IndexParser`]; one opened from a
//! [`TransactionalEdit`](crate::TransactionalEdit) is editable and resolves
//! writes through a [`ShadowCopyAllocator`]. Either way, byte access goes
//! through [`SubFileIoSession::get_block`], which maps a byte position to the
//! physical block holding it.

use std::sync::Arc;

use crate::binary_stream::BinaryStream;
use crate::block::{self, BlockType};
use crate::disk_io::{DiskIoSession, SessionContext};
use crate::error::{HistError, Result};
use crate::header::{FileHeaderBlock, SubFileHeader, SubFileName};
use crate::index_parser::{HeaderSource, IndexGeneration, IndexParser};
use crate::medium::DiskMedium;
use crate::session_pool::{DiskIoSessionPool, SessionLimit};
use crate::shadow_copy::ShadowCopyAllocator;
use crate::state::{lifecycle, StateCoordinator};
use crate::transaction::{EditShared, StructureShared};

/// Number of virtual blocks a byte position may address: physical indexes
/// 0 and `u32::MAX` are never valid.
const MAX_VIRTUAL_BLOCKS: i64 = u32::MAX as i64 - 1;

/// Implemented by anything that hands out block-level I/O sessions.
pub trait BinarySessionFactory {
    fn create_io_session(&self) -> Result<SubFileIoSession>;
    fn create_binary_stream(&self) -> Result<BinaryStream>;
    /// How many more sessions may be created.
    fn remaining_supported_io_sessions(&self) -> usize;
    fn is_read_only(&self) -> bool;
    fn block_size(&self) -> usize;
}

#[derive(Clone)]
pub(crate) enum StreamOrigin {
    Snapshot {
        structure: Arc<StructureShared>,
        header: Arc<FileHeaderBlock>,
    },
    Edit {
        edit: Arc<EditShared>,
        generation: Arc<IndexGeneration>,
    },
}

impl StreamOrigin {
    fn structure(&self) -> &StructureShared {
        match self {
            StreamOrigin::Snapshot { structure, .. } => structure,
            StreamOrigin::Edit { edit, .. } => &edit.structure,
        }
    }

    fn medium(&self) -> &Arc<dyn DiskMedium> {
        &self.structure().medium
    }

    fn check_live(&self) -> Result<()> {
        match self {
            StreamOrigin::Snapshot { structure, .. } => structure.check_open(),
            StreamOrigin::Edit { edit, .. } => edit.check_active(),
        }
    }

    fn is_editable(&self) -> bool {
        matches!(self, StreamOrigin::Edit { .. })
    }

    /// Index generation of the sub-file; always 0 for snapshots, whose
    /// trees never change.
    fn generation(&self) -> u64 {
        match self {
            StreamOrigin::Snapshot { .. } => 0,
            StreamOrigin::Edit { generation, .. } => generation.current(),
        }
    }

    fn context(&self, file_id: u16) -> SessionContext {
        match self {
            StreamOrigin::Snapshot { header, .. } => SessionContext {
                file_id,
                snapshot_sequence: header.snapshot_sequence,
                watermark: header.watermark(),
                read_only: true,
            },
            StreamOrigin::Edit { edit, .. } => edit.context(file_id),
        }
    }

    fn header_source(&self, file_index: usize) -> HeaderSource {
        match self {
            StreamOrigin::Snapshot { header, .. } => HeaderSource::Snapshot {
                header: Arc::clone(header),
                file_index,
            },
            StreamOrigin::Edit { edit, .. } => HeaderSource::Edit {
                header: Arc::clone(&edit.header),
                file_index,
            },
        }
    }
}

/// An open sub-file.
pub struct SubFileStream {
    origin: StreamOrigin,
    file_index: usize,
    file_id: u16,
    file_name: SubFileName,
    state: Arc<StateCoordinator>,
}

impl SubFileStream {
    pub(crate) fn new(origin: StreamOrigin, file_index: usize, file: &SubFileHeader) -> Self {
        SubFileStream {
            origin,
            file_index,
            file_id: file.file_id,
            file_name: file.file_name,
            state: Arc::new(StateCoordinator::new(lifecycle::OPEN)),
        }
    }

    pub fn file_id(&self) -> u16 {
        self.file_id
    }

    pub fn file_name(&self) -> SubFileName {
        self.file_name
    }

    pub fn usable_block_length(&self) -> usize {
        block::usable_length(self.origin.medium().block_size())
    }

    /// Current descriptor: committed for read-only streams, in progress for
    /// editable ones.
    pub fn descriptor(&self) -> Result<SubFileHeader> {
        self.origin.header_source(self.file_index).sub_file()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.read() == lifecycle::DISPOSED
    }

    fn check_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(HistError::Disposed("sub-file stream"));
        }
        self.origin.check_live()
    }

    /// Close the stream. Sessions created from it report `Disposed` from then
    /// on; an editable stream gives up its writer slot. A second call is a
    /// no-op.
    pub fn dispose(&self) {
        if self.state.try_change(lifecycle::OPEN, lifecycle::DISPOSED) {
            if let StreamOrigin::Edit { edit, .. } = &self.origin {
                edit.release_writer(self.file_id);
            }
        }
    }
}

impl BinarySessionFactory for SubFileStream {
    fn create_io_session(&self) -> Result<SubFileIoSession> {
        self.check_live()?;
        let structure = self.origin.structure();
        let context = self.origin.context(self.file_id);
        let pool = DiskIoSessionPool::new(
            Arc::clone(self.origin.medium()),
            context,
            SessionLimit::Bounded(structure.sessions_per_io_session),
        );
        let source = self.origin.header_source(self.file_index);
        let role = match &self.origin {
            StreamOrigin::Snapshot { .. } => {
                SessionRole::ReadOnly(IndexParser::new(pool.acquire()?, source, structure.mapper, None))
            }
            StreamOrigin::Edit { edit, generation } => {
                let parser = IndexParser::new(
                    pool.acquire()?,
                    source,
                    structure.mapper,
                    Some(Arc::clone(generation)),
                );
                SessionRole::Editable(ShadowCopyAllocator::new(
                    parser,
                    pool.acquire()?,
                    Arc::clone(&edit.header),
                    self.file_index,
                    Arc::clone(generation),
                ))
            }
        };
        let data = pool.acquire()?;
        Ok(SubFileIoSession {
            origin: self.origin.clone(),
            stream_state: Arc::clone(&self.state),
            usable: data.usable_length(),
            pool,
            role: Some(role),
            data: Some(data),
            current: None,
            bound_generation: 0,
            state: StateCoordinator::new(lifecycle::OPEN),
        })
    }

    fn create_binary_stream(&self) -> Result<BinaryStream> {
        Ok(BinaryStream::new(self.create_io_session()?))
    }

    fn remaining_supported_io_sessions(&self) -> usize {
        usize::MAX
    }

    fn is_read_only(&self) -> bool {
        !self.origin.is_editable()
    }

    fn block_size(&self) -> usize {
        self.origin.medium().block_size()
    }
}

impl Drop for SubFileStream {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// The block a byte position maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockArgs {
    /// Byte position of the first usable byte of the block.
    pub first_position: i64,
    /// Usable bytes in the block.
    pub length: usize,
    pub physical_block: u32,
    pub supports_writing: bool,
}

impl BlockArgs {
    pub fn virtual_block(&self) -> u32 {
        (self.first_position / self.length as i64) as u32
    }

    pub fn contains(&self, position: i64) -> bool {
        position >= self.first_position && position < self.first_position + self.length as i64
    }
}

/// How a session resolves virtual blocks; fixed at construction.
pub enum SessionRole {
    ReadOnly(IndexParser),
    Editable(ShadowCopyAllocator),
}

impl SessionRole {
    pub fn parser(&self) -> &IndexParser {
        match self {
            SessionRole::ReadOnly(parser) => parser,
            SessionRole::Editable(allocator) => allocator.as_parser(),
        }
    }

    fn virtual_to_physical(&mut self, virtual_block: u32) -> Result<u32> {
        match self {
            SessionRole::ReadOnly(parser) => parser.virtual_to_physical(virtual_block),
            SessionRole::Editable(allocator) => allocator.virtual_to_physical(virtual_block),
        }
    }
}

/// Block-level access to one sub-file.
pub struct SubFileIoSession {
    origin: StreamOrigin,
    stream_state: Arc<StateCoordinator>,
    usable: usize,
    pool: DiskIoSessionPool,
    role: Option<SessionRole>,
    data: Option<DiskIoSession>,
    current: Option<BlockArgs>,
    /// Index generation observed when `current` was mapped.
    bound_generation: u64,
    state: StateCoordinator,
}

impl SubFileIoSession {
    pub fn is_read_only(&self) -> bool {
        !self.origin.is_editable()
    }

    pub fn usable_block_length(&self) -> usize {
        self.usable
    }

    /// The mapping returned by the last successful `get_block`.
    pub fn current(&self) -> Option<BlockArgs> {
        self.current
    }

    /// True when the mapped block predates the edit and a sibling session
    /// has shadow copied part of this sub-file since it was mapped; the edit
    /// may no longer use that block. Blocks the edit owns never move.
    pub fn is_mapping_stale(&self) -> bool {
        self.current.is_some_and(|c| !c.supports_writing)
            && self.origin.generation() != self.bound_generation
    }

    pub fn role(&self) -> Option<&SessionRole> {
        self.role.as_ref()
    }

    pub fn role_mut(&mut self) -> Option<&mut SessionRole> {
        self.role.as_mut()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.read() == lifecycle::DISPOSED
    }

    fn check_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(HistError::Disposed("sub-file I/O session"));
        }
        if self.stream_state.read() == lifecycle::DISPOSED {
            return Err(HistError::Disposed("sub-file stream"));
        }
        self.origin.check_live()
    }

    /// Map `position` to its block and bind the session to it.
    pub fn get_block(&mut self, position: i64, is_writing: bool) -> Result<BlockArgs> {
        self.check_live()?;
        self.current = None;
        let usable = self.usable as i64;
        if position < 0 || position >= usable * MAX_VIRTUAL_BLOCKS {
            return Err(HistError::OutOfRange(format!(
                "position {} is outside 0..{}",
                position,
                usable * MAX_VIRTUAL_BLOCKS
            )));
        }
        let virtual_block = (position / usable) as u32;
        let first_position = virtual_block as i64 * usable;
        let generation = self.origin.generation();

        let editable = self.origin.is_editable();
        let (Some(role), Some(data)) = (self.role.as_mut(), self.data.as_mut()) else {
            return Err(HistError::Disposed("sub-file I/O session"));
        };
        let watermark = data.context().watermark;

        let args = if is_writing {
            let SessionRole::Editable(allocator) = role else {
                return Err(HistError::ReadOnly(
                    "sub-file stream was opened from a read snapshot".to_string(),
                ));
            };
            let resolution = allocator.virtual_to_shadow_physical(virtual_block)?;
            data.write_to_existing_block(resolution.physical, BlockType::Data, virtual_block, 0)?;
            BlockArgs {
                first_position,
                length: self.usable,
                physical_block: resolution.physical,
                supports_writing: true,
            }
        } else {
            let physical = role.virtual_to_physical(virtual_block)?;
            if physical == 0 {
                return Err(HistError::MissingBlock { virtual_block });
            }
            let supports_writing = editable && physical >= watermark;
            if supports_writing {
                data.write_to_existing_block(physical, BlockType::Data, virtual_block, 0)?;
            } else {
                data.read(physical, BlockType::Data, virtual_block, 0)?;
            }
            BlockArgs {
                first_position,
                length: self.usable,
                physical_block: physical,
                supports_writing,
            }
        };
        self.current = Some(args);
        self.bound_generation = generation;
        Ok(args)
    }

    fn bound_data(&self) -> Result<&DiskIoSession> {
        self.check_live()?;
        match (&self.current, &self.data) {
            (Some(_), Some(data)) => Ok(data),
            _ => Err(HistError::InvalidArgument(
                "no block mapped; call get_block first".to_string(),
            )),
        }
    }

    /// Read from the mapped block at `offset` within its usable region.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.bound_data()?.read_at(offset, buf)
    }

    /// Write into the mapped block. The mapping must support writing.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let session = self.bound_data()?;
        if !self.current.is_some_and(|c| c.supports_writing) {
            return Err(HistError::ReadOnly(
                "mapped block does not support writing".to_string(),
            ));
        }
        session.write_at(offset, data)
    }

    /// Run `f` over the usable region of the mapped block.
    pub fn with_block<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.bound_data()?.with_data(f)
    }

    /// Unbind every cursor and drop cached index paths.
    pub fn clear(&mut self) {
        self.current = None;
        if let Some(data) = self.data.as_mut() {
            data.clear();
        }
        match self.role.as_mut() {
            Some(SessionRole::ReadOnly(parser)) => parser.forget_index_cache(),
            Some(SessionRole::Editable(allocator)) => allocator.as_parser_mut().forget_index_cache(),
            None => {}
        }
        self.pool.clear();
    }

    /// Release every cursor. A second call is a no-op.
    pub fn dispose(&mut self) {
        if self.state.try_change(lifecycle::OPEN, lifecycle::DISPOSED) {
            self.current = None;
            self.role = None;
            if let Some(data) = self.data.take() {
                self.pool.release(data);
            }
            self.pool.dispose();
        }
    }

    /// Cursors currently checked out of this session's pool.
    pub fn outstanding_disk_sessions(&self) -> usize {
        self.pool.outstanding()
    }
}

impl Drop for SubFileIoSession {
    fn drop(&mut self) {
        self.dispose();
    }
}
