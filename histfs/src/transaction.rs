//! Transaction boundary: file structures, read snapshots and edits.
//!
//! A [`TransactionalFileStructure`] owns a medium and its committed header.
//! Readers take a [`ReadSnapshot`], which pins one committed header for as
//! long as it lives. A single [`TransactionalEdit`] at a time works on a
//! private copy of the header; every block it creates lies at or above the
//! watermark, so readers never observe it until [`TransactionalEdit::commit`]
//! publishes the new header.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::disk_io::SessionContext;
use crate::error::{HistError, Result};
use crate::file_medium::FileMedium;
use crate::header::{FileHeaderBlock, SubFileHeader, SubFileName};
use crate::index_mapper::IndexMapper;
use crate::index_parser::IndexGeneration;
use crate::medium::DiskMedium;
use crate::memory_medium::MemoryMedium;
use crate::options::{FileStructureOptions, OpenMode};
use crate::page_pool::{self, PagePool};
use crate::state::{lifecycle, StateCoordinator};
use crate::sub_file_stream::{StreamOrigin, SubFileStream};
use crate::verify;

const IDLE: i32 = 0;
const EDITING: i32 = 1;

const ACTIVE: i32 = 0;
const COMMITTED: i32 = 1;
const ROLLED_BACK: i32 = 2;

/// State shared by a file structure and everything opened from it.
pub(crate) struct StructureShared {
    pub(crate) medium: Arc<dyn DiskMedium>,
    pub(crate) mapper: IndexMapper,
    pub(crate) sessions_per_io_session: usize,
    state: StateCoordinator,
    editing: StateCoordinator,
}

impl StructureShared {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.state.read() == lifecycle::DISPOSED {
            return Err(HistError::Disposed("file structure"));
        }
        Ok(())
    }
}

/// State shared by an edit and its streams.
pub(crate) struct EditShared {
    pub(crate) structure: Arc<StructureShared>,
    pub(crate) header: Arc<Mutex<FileHeaderBlock>>,
    base: Arc<FileHeaderBlock>,
    state: StateCoordinator,
    generations: Mutex<HashMap<u16, Arc<IndexGeneration>>>,
    writers: Mutex<HashSet<u16>>,
}

impl EditShared {
    pub(crate) fn check_active(&self) -> Result<()> {
        self.structure.check_open()?;
        if self.state.read() != ACTIVE {
            return Err(HistError::Disposed("transactional edit"));
        }
        Ok(())
    }

    pub(crate) fn context(&self, file_id: u16) -> SessionContext {
        SessionContext {
            file_id,
            snapshot_sequence: self.base.snapshot_sequence + 1,
            watermark: self.base.watermark(),
            read_only: false,
        }
    }

    fn generation_for(&self, file_id: u16) -> Arc<IndexGeneration> {
        Arc::clone(
            self.generations
                .lock()
                .entry(file_id)
                .or_insert_with(IndexGeneration::new),
        )
    }

    /// Give up the writer slot of `file_id`.
    pub(crate) fn release_writer(&self, file_id: u16) {
        self.writers.lock().remove(&file_id);
    }

    fn open_writer(self: &Arc<Self>, file_id: u16) -> Result<SubFileStream> {
        self.check_active()?;
        let (file_index, file) = {
            let header = self.header.lock();
            let index = header
                .files
                .iter()
                .position(|f| f.file_id == file_id)
                .ok_or_else(|| HistError::NotFound(format!("sub-file {}", file_id)))?;
            (index, header.files[index])
        };
        if !self.writers.lock().insert(file_id) {
            return Err(HistError::LockConflict(format!(
                "sub-file {} already has an editable stream",
                file_id
            )));
        }
        let origin = StreamOrigin::Edit {
            edit: Arc::clone(self),
            generation: self.generation_for(file_id),
        };
        Ok(SubFileStream::new(origin, file_index, &file))
    }

    fn finish(&self, outcome: i32) -> bool {
        if !self.state.try_change(ACTIVE, outcome) {
            return false;
        }
        self.writers.lock().clear();
        true
    }

    fn rollback(&self) -> bool {
        if !self.finish(ROLLED_BACK) {
            return false;
        }
        self.structure.medium.rollback();
        self.structure.editing.set(IDLE);
        debug!(snapshot = self.base.snapshot_sequence + 1, "rolled back edit");
        true
    }
}

/// A transactional, shadow-paged file structure.
///
/// `M` is the medium holding the blocks; see [`InMemoryFileStructure`] and
/// [`FileStructureOnDisk`].
pub struct TransactionalFileStructure<M: DiskMedium> {
    medium: Arc<M>,
    shared: Arc<StructureShared>,
}

/// A file structure that lives only in pool pages.
pub type InMemoryFileStructure = TransactionalFileStructure<MemoryMedium>;

/// A file structure backed by a file on disk.
pub type FileStructureOnDisk = TransactionalFileStructure<FileMedium>;

impl TransactionalFileStructure<MemoryMedium> {
    pub fn create_in_memory(options: FileStructureOptions) -> Result<Self> {
        let pool = match &options.page_pool {
            Some(pool) if pool.page_size() != options.block_size => {
                return Err(HistError::InvalidArgument(format!(
                    "page pool serves {}-byte pages, requested {}-byte blocks",
                    pool.page_size(),
                    options.block_size
                )))
            }
            Some(pool) => Arc::clone(pool),
            None => page_pool::default_pool(options.block_size)?,
        };
        debug!(block_size = options.block_size, "created in-memory file structure");
        Ok(Self::from_medium(Arc::new(MemoryMedium::new(pool)), &options))
    }
}

impl TransactionalFileStructure<FileMedium> {
    pub fn create_file(path: impl AsRef<Path>, options: FileStructureOptions) -> Result<Self> {
        let medium = FileMedium::create(path.as_ref(), &options)?;
        Ok(Self::from_medium(Arc::new(medium), &options))
    }

    pub fn open_file(
        path: impl AsRef<Path>,
        mode: OpenMode,
        options: FileStructureOptions,
    ) -> Result<Self> {
        let medium = FileMedium::open(path.as_ref(), mode, &options)?;
        Ok(Self::from_medium(Arc::new(medium), &options))
    }
}

impl<M: DiskMedium> TransactionalFileStructure<M> {
    fn from_medium(medium: Arc<M>, options: &FileStructureOptions) -> Self {
        let block_size = medium.block_size();
        let dyn_medium: Arc<dyn DiskMedium> = Arc::clone(&medium) as Arc<dyn DiskMedium>;
        TransactionalFileStructure {
            medium,
            shared: Arc::new(StructureShared {
                medium: dyn_medium,
                mapper: IndexMapper::new(block_size),
                sessions_per_io_session: options.sessions_per_io_session,
                state: StateCoordinator::new(lifecycle::OPEN),
                editing: StateCoordinator::new(IDLE),
            }),
        }
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    pub fn page_pool(&self) -> &Arc<PagePool> {
        self.medium.page_pool()
    }

    pub fn block_size(&self) -> usize {
        self.medium.block_size()
    }

    pub fn committed_header(&self) -> Arc<FileHeaderBlock> {
        self.medium.committed_header()
    }

    pub fn is_editing(&self) -> bool {
        self.shared.editing.read() == EDITING
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.read() == lifecycle::DISPOSED
    }

    /// Pin the current committed header for reading.
    pub fn snapshot(&self) -> Result<ReadSnapshot> {
        self.shared.check_open()?;
        Ok(ReadSnapshot {
            structure: Arc::clone(&self.shared),
            header: self.medium.committed_header(),
        })
    }

    /// Start the edit. Fails with `LockConflict` while another edit is active.
    pub fn begin_edit(&self) -> Result<TransactionalEdit> {
        self.shared.check_open()?;
        if self.medium.is_read_only() {
            return Err(HistError::ReadOnly("file structure opened for reading".to_string()));
        }
        if !self.shared.editing.try_change(IDLE, EDITING) {
            return Err(HistError::LockConflict("another edit is active".to_string()));
        }

        let base = self.medium.committed_header();
        let Some(next_sequence) = base.snapshot_sequence.checked_add(1) else {
            self.shared.editing.set(IDLE);
            return Err(HistError::OutOfRange("snapshot sequence exhausted".to_string()));
        };
        let mut header = (*base).clone();
        header.snapshot_sequence = next_sequence;
        debug!(
            snapshot = next_sequence,
            watermark = base.watermark(),
            "began edit"
        );

        Ok(TransactionalEdit {
            shared: Arc::new(EditShared {
                structure: Arc::clone(&self.shared),
                header: Arc::new(Mutex::new(header)),
                base,
                state: StateCoordinator::new(ACTIVE),
                generations: Mutex::new(HashMap::new()),
                writers: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Walk the committed snapshot and report integrity issues.
    pub fn verify(&self) -> Result<Vec<String>> {
        self.shared.check_open()?;
        let header = self.medium.committed_header();
        let mut issues = self.medium.verify()?;
        issues.extend(verify::verify_snapshot(&self.shared.medium, &header, &self.shared.mapper)?);
        Ok(issues)
    }

    /// Refuse further use. Open snapshots, edits and streams report
    /// `Disposed` from then on. A second call is a no-op.
    pub fn dispose(&self) {
        if self.shared.state.try_change(lifecycle::OPEN, lifecycle::DISPOSED) {
            debug!("disposed file structure");
        }
    }
}

impl<M: DiskMedium> Drop for TransactionalFileStructure<M> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A committed header pinned for reading.
pub struct ReadSnapshot {
    structure: Arc<StructureShared>,
    header: Arc<FileHeaderBlock>,
}

impl ReadSnapshot {
    pub fn snapshot_sequence(&self) -> u32 {
        self.header.snapshot_sequence
    }

    pub fn header(&self) -> &Arc<FileHeaderBlock> {
        &self.header
    }

    pub fn files(&self) -> &[SubFileHeader] {
        &self.header.files
    }

    pub fn find_file(&self, name: &SubFileName) -> Option<&SubFileHeader> {
        self.header.files.iter().find(|f| f.file_name == *name)
    }

    /// Open a read-only stream on sub-file `file_id`.
    pub fn open_file(&self, file_id: u16) -> Result<SubFileStream> {
        self.structure.check_open()?;
        let index = self
            .header
            .files
            .iter()
            .position(|f| f.file_id == file_id)
            .ok_or_else(|| HistError::NotFound(format!("sub-file {}", file_id)))?;
        let origin = StreamOrigin::Snapshot {
            structure: Arc::clone(&self.structure),
            header: Arc::clone(&self.header),
        };
        Ok(SubFileStream::new(origin, index, &self.header.files[index]))
    }

    pub fn open_file_by_name(&self, name: &SubFileName) -> Result<SubFileStream> {
        let file_id = self
            .find_file(name)
            .map(|f| f.file_id)
            .ok_or_else(|| HistError::NotFound(format!("sub-file {}", name)))?;
        self.open_file(file_id)
    }
}

/// The single writer transaction of a file structure.
///
/// Dropping an edit that was neither committed nor rolled back rolls it back.
pub struct TransactionalEdit {
    shared: Arc<EditShared>,
}

impl TransactionalEdit {
    /// Sequence number the edit commits as.
    pub fn snapshot_sequence(&self) -> u32 {
        self.shared.base.snapshot_sequence + 1
    }

    /// Blocks below this predate the edit and are never written.
    pub fn watermark(&self) -> u32 {
        self.shared.base.watermark()
    }

    /// Highest physical block handed out so far, including this edit's.
    pub fn last_allocated_block(&self) -> u32 {
        self.shared.header.lock().last_allocated_block
    }

    /// The editable header's view of every sub-file.
    pub fn files(&self) -> Vec<SubFileHeader> {
        self.shared.header.lock().files.clone()
    }

    pub fn find_file(&self, name: &SubFileName) -> Option<SubFileHeader> {
        let header = self.shared.header.lock();
        header.find_file(name).map(|i| header.files[i])
    }

    /// Add a sub-file and open it for editing.
    pub fn create_file(&self, name: SubFileName) -> Result<SubFileStream> {
        self.shared.check_active()?;
        let file_id = {
            let mut header = self.shared.header.lock();
            if header.find_file(&name).is_some() {
                return Err(HistError::AlreadyExists(format!("sub-file {}", name)));
            }
            let max = FileHeaderBlock::max_files(header.block_size as usize);
            if header.files.len() >= max {
                return Err(HistError::InvalidArgument(format!(
                    "a file structure with {}-byte blocks holds at most {} sub-files",
                    header.block_size, max
                )));
            }
            let file_id = header.files.len() as u16;
            header.files.push(SubFileHeader::new(file_id, name));
            file_id
        };
        debug!(file_id, name = %name, "created sub-file");
        self.shared.open_writer(file_id)
    }

    /// Open sub-file `file_id` for editing. Only one editable stream per
    /// sub-file may be open at a time.
    pub fn open_file(&self, file_id: u16) -> Result<SubFileStream> {
        self.shared.open_writer(file_id)
    }

    pub fn open_file_by_name(&self, name: &SubFileName) -> Result<SubFileStream> {
        let file_id = self
            .find_file(name)
            .map(|f| f.file_id)
            .ok_or_else(|| HistError::NotFound(format!("sub-file {}", name)))?;
        self.open_file(file_id)
    }

    /// Publish everything written by this edit to new readers.
    pub fn commit(self) -> Result<()> {
        let shared = &self.shared;
        shared.structure.check_open()?;
        if !shared.finish(COMMITTED) {
            return Err(HistError::Disposed("transactional edit"));
        }
        let header = shared.header.lock().clone();
        let sequence = header.snapshot_sequence;
        let last_allocated = header.last_allocated_block;
        let result = shared.structure.medium.commit(header);
        if let Err(e) = &result {
            warn!(snapshot = sequence, error = %e, "commit failed, edit rolled back");
            shared.structure.medium.rollback();
        } else {
            debug!(snapshot = sequence, last_allocated, "committed edit");
        }
        shared.structure.editing.set(IDLE);
        result
    }

    /// Discard everything written by this edit.
    pub fn rollback(self) {
        self.shared.rollback();
    }
}

impl Drop for TransactionalEdit {
    fn drop(&mut self) {
        if self.shared.state.read() == ACTIVE {
            warn!(
                snapshot = self.shared.base.snapshot_sequence + 1,
                "edit dropped without commit, rolling back"
            );
            self.shared.rollback();
        }
    }
}
