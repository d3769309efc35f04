mod binary_stream;
pub mod block;
mod disk_io;
mod error;
mod file_medium;
pub mod header;
mod index_mapper;
mod index_parser;
mod medium;
mod memory_medium;
mod options;
pub mod page_pool;
mod session_pool;
mod shadow_copy;
pub mod state;
mod sub_file_stream;
mod transaction;
mod verify;

pub use binary_stream::BinaryStream;
pub use disk_io::{DiskIoSession, SessionContext};
pub use error::{HistError, Result};
pub use file_medium::FileMedium;
pub use header::{FileHeaderBlock, SubFileHeader, SubFileName};
pub use index_mapper::{IndexMapper, IndexPath};
pub use index_parser::{IndexGeneration, IndexParser, PathCache};
pub use medium::{DiskMedium, SharedPage};
pub use memory_medium::MemoryMedium;
pub use options::{
    FileStructureOptions, OpenMode, DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_BUDGET_BYTES,
    DEFAULT_SESSIONS_PER_IO_SESSION,
};
pub use page_pool::{PageBuf, PagePool};
pub use session_pool::{DiskIoSessionPool, SessionLimit};
pub use shadow_copy::{ShadowCopyAllocator, ShadowResolution};
pub use state::StateCoordinator;
pub use sub_file_stream::{
    BinarySessionFactory, BlockArgs, SessionRole, SubFileIoSession, SubFileStream,
};
pub use transaction::{
    FileStructureOnDisk, InMemoryFileStructure, ReadSnapshot, TransactionalEdit,
    TransactionalFileStructure,
};
