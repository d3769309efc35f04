//! Page-cache cursors.
//!
//! A [`DiskIoSession`] binds to one physical block at a time and exposes only
//! the usable region of that block. Binding checks the block footer, so a
//! cursor that walked to the wrong block fails with `CorruptBlock` instead of
//! handing out foreign bytes.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::block::{self, BlockFooter, BlockType};
use crate::error::{HistError, Result};
use crate::medium::{DiskMedium, SharedPage};
use crate::state::{lifecycle, StateCoordinator};

/// What every cursor of one I/O session is allowed to see and do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub file_id: u16,
    /// Snapshot the session reads (or, for an edit, writes).
    pub snapshot_sequence: u32,
    /// Blocks below this are immutable.
    pub watermark: u32,
    pub read_only: bool,
}

/// Outstanding-session accounting token; dropping it frees one slot.
pub(crate) struct Lease {
    outstanding: Arc<AtomicUsize>,
}

impl Lease {
    pub(crate) fn new(outstanding: Arc<AtomicUsize>) -> Self {
        Lease { outstanding }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Binding {
    block: u32,
    page: SharedPage,
    writable: bool,
}

/// Cursor over one physical block at a time.
pub struct DiskIoSession {
    medium: Arc<dyn DiskMedium>,
    context: SessionContext,
    usable: usize,
    binding: Option<Binding>,
    lease: Option<Lease>,
    state: StateCoordinator,
}

impl DiskIoSession {
    pub(crate) fn new(medium: Arc<dyn DiskMedium>, context: SessionContext) -> Self {
        let usable = block::usable_length(medium.block_size());
        DiskIoSession {
            medium,
            context,
            usable,
            binding: None,
            lease: None,
            state: StateCoordinator::new(lifecycle::OPEN),
        }
    }

    pub(crate) fn set_lease(&mut self, lease: Option<Lease>) {
        self.lease = lease;
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn medium(&self) -> &Arc<dyn DiskMedium> {
        &self.medium
    }

    /// Usable bytes of every block.
    pub fn usable_length(&self) -> usize {
        self.usable
    }

    /// The bound physical block, if any.
    pub fn block(&self) -> Option<u32> {
        self.binding.as_ref().map(|b| b.block)
    }

    pub fn is_writable(&self) -> bool {
        self.binding.as_ref().is_some_and(|b| b.writable)
    }

    pub fn is_disposed(&self) -> bool {
        self.state.read() == lifecycle::DISPOSED
    }

    fn check_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(HistError::Disposed("disk I/O session"));
        }
        Ok(())
    }

    fn check_writable_block(&self, block: u32) -> Result<()> {
        if self.context.read_only {
            return Err(HistError::ReadOnly(format!(
                "block {} requested for writing through a read-only session",
                block
            )));
        }
        if block < self.context.watermark {
            return Err(HistError::ReadOnly(format!(
                "block {} is below the watermark {} and cannot be modified",
                block, self.context.watermark
            )));
        }
        Ok(())
    }

    fn footer(&self, block_type: BlockType, index_value: u32, level: u8) -> BlockFooter {
        BlockFooter {
            block_type,
            level,
            file_id: self.context.file_id,
            index_value,
            snapshot_sequence: self.context.snapshot_sequence,
        }
    }

    fn validate(
        &self,
        page: &SharedPage,
        block: u32,
        block_type: BlockType,
        index_value: u32,
        level: u8,
    ) -> Result<()> {
        let page = page.read();
        BlockFooter::read_from(&page, block)?.expect(
            block,
            block_type,
            self.context.file_id,
            index_value,
            level,
            self.context.snapshot_sequence,
        )
    }

    /// Bind to an existing block for reading.
    pub fn read(&mut self, block: u32, block_type: BlockType, index_value: u32, level: u8) -> Result<()> {
        self.check_open()?;
        if self.block() == Some(block) {
            return Ok(());
        }
        self.binding = None;
        let page = self.medium.read_block(block)?;
        self.validate(&page, block, block_type, index_value, level)?;
        self.binding = Some(Binding {
            block,
            page,
            writable: false,
        });
        Ok(())
    }

    /// Bind a fresh zeroed page to `block` and stamp its footer.
    pub fn write_to_new_block(
        &mut self,
        block: u32,
        block_type: BlockType,
        index_value: u32,
        level: u8,
    ) -> Result<()> {
        self.check_open()?;
        self.check_writable_block(block)?;
        self.binding = None;
        let page = self.medium.create_block(block)?;
        self.footer(block_type, index_value, level)
            .write_to(&mut page.write());
        self.binding = Some(Binding {
            block,
            page,
            writable: true,
        });
        Ok(())
    }

    /// Bind to a block created earlier in this edit for writing.
    pub fn write_to_existing_block(
        &mut self,
        block: u32,
        block_type: BlockType,
        index_value: u32,
        level: u8,
    ) -> Result<()> {
        self.check_open()?;
        self.check_writable_block(block)?;
        if self.block() == Some(block) && self.is_writable() {
            return Ok(());
        }
        self.binding = None;
        let page = self.medium.read_block(block)?;
        self.validate(&page, block, block_type, index_value, level)?;
        self.binding = Some(Binding {
            block,
            page,
            writable: true,
        });
        Ok(())
    }

    fn bound(&self) -> Result<&Binding> {
        self.check_open()?;
        self.binding
            .as_ref()
            .ok_or_else(|| HistError::InvalidArgument("disk I/O session is not bound".to_string()))
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.usable) {
            return Err(HistError::OutOfRange(format!(
                "{} bytes at offset {} exceed the usable block length {}",
                len, offset, self.usable
            )));
        }
        Ok(())
    }

    /// Run `f` over the usable region of the bound block.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let binding = self.bound()?;
        let page = binding.page.read();
        Ok(f(&page[..self.usable]))
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let binding = self.bound()?;
        let page = binding.page.read();
        buf.copy_from_slice(&page[offset..offset + buf.len()]);
        Ok(())
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let binding = self.bound()?;
        if !binding.writable {
            return Err(HistError::ReadOnly(format!(
                "block {} is bound for reading",
                binding.block
            )));
        }
        let mut page = binding.page.write();
        page[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Pointer `slot` of the bound index node.
    pub fn read_pointer(&self, slot: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_at(slot as usize * 4, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_pointer(&self, slot: u32, value: u32) -> Result<()> {
        self.write_at(slot as usize * 4, &value.to_le_bytes())
    }

    /// Copy the usable region of `source`'s block into this session's block.
    pub fn copy_from(&self, source: &DiskIoSession) -> Result<()> {
        let from = source.bound()?;
        let to = self.bound()?;
        if !to.writable {
            return Err(HistError::ReadOnly(format!("block {} is bound for reading", to.block)));
        }
        if Arc::ptr_eq(&from.page, &to.page) {
            return Ok(());
        }
        let src = from.page.read();
        let mut dst = to.page.write();
        dst[..self.usable].copy_from_slice(&src[..self.usable]);
        Ok(())
    }

    /// Drop the current binding.
    pub fn clear(&mut self) {
        self.binding = None;
    }

    /// Release the binding and refuse further use. A second call is a no-op.
    pub fn dispose(&mut self) {
        if self.state.try_change(lifecycle::OPEN, lifecycle::DISPOSED) {
            self.binding = None;
            self.lease = None;
        }
    }
}

impl fmt::Debug for DiskIoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskIoSession")
            .field("context", &self.context)
            .field("block", &self.block())
            .field("writable", &self.is_writable())
            .finish()
    }
}
