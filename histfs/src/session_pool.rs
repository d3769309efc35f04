use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::disk_io::{DiskIoSession, Lease, SessionContext};
use crate::error::{HistError, Result};
use crate::medium::DiskMedium;
use crate::state::{lifecycle, StateCoordinator};

/// How many disk I/O sessions a pool may have outstanding at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLimit {
    Bounded(usize),
    Unbounded,
}

impl SessionLimit {
    fn max(self) -> usize {
        match self {
            SessionLimit::Bounded(n) => n,
            SessionLimit::Unbounded => usize::MAX,
        }
    }
}

/// Bounded supply of [`DiskIoSession`]s sharing one [`SessionContext`].
///
/// Each sub-file I/O session owns one pool. Released sessions are kept idle
/// and handed out again; capacity is counted by leases, so a session that is
/// simply dropped gives its slot back too.
pub struct DiskIoSessionPool {
    medium: Arc<dyn DiskMedium>,
    context: SessionContext,
    limit: SessionLimit,
    idle: Mutex<Vec<DiskIoSession>>,
    outstanding: Arc<AtomicUsize>,
    state: StateCoordinator,
}

impl DiskIoSessionPool {
    pub fn new(medium: Arc<dyn DiskMedium>, context: SessionContext, limit: SessionLimit) -> Self {
        DiskIoSessionPool {
            medium,
            context,
            limit,
            idle: Mutex::new(Vec::new()),
            outstanding: Arc::new(AtomicUsize::new(0)),
            state: StateCoordinator::new(lifecycle::OPEN),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn medium(&self) -> &Arc<dyn DiskMedium> {
        &self.medium
    }

    pub fn limit(&self) -> SessionLimit {
        self.limit
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Sessions that can still be acquired.
    pub fn remaining(&self) -> usize {
        match self.limit {
            SessionLimit::Bounded(n) => n.saturating_sub(self.outstanding()),
            SessionLimit::Unbounded => usize::MAX,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.read() == lifecycle::DISPOSED
    }

    pub fn acquire(&self) -> Result<DiskIoSession> {
        if self.is_disposed() {
            return Err(HistError::Disposed("disk I/O session pool"));
        }
        let max = self.limit.max();
        self.outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map_err(|_| HistError::SessionLimit { limit: max })?;

        let recycled = self.idle.lock().pop();
        let mut session = recycled
            .unwrap_or_else(|| DiskIoSession::new(Arc::clone(&self.medium), self.context));
        session.set_lease(Some(Lease::new(Arc::clone(&self.outstanding))));
        Ok(session)
    }

    /// Return a session. Its binding is cleared and its slot freed.
    pub fn release(&self, mut session: DiskIoSession) {
        session.clear();
        session.set_lease(None);
        if session.is_disposed() || self.is_disposed() {
            return;
        }
        self.idle.lock().push(session);
    }

    /// Unbind every idle session without giving up capacity.
    pub fn clear(&self) {
        for session in self.idle.lock().iter_mut() {
            session.clear();
        }
    }

    /// Drop idle sessions and refuse further acquisitions. Sessions still out
    /// keep working until they are released.
    pub fn dispose(&self) {
        if self.state.try_change(lifecycle::OPEN, lifecycle::DISPOSED) {
            self.idle.lock().clear();
        }
    }
}

impl Drop for DiskIoSessionPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockType;
    use crate::memory_medium::MemoryMedium;
    use crate::page_pool::PagePool;

    fn pool(limit: SessionLimit) -> DiskIoSessionPool {
        let medium: Arc<dyn DiskMedium> = Arc::new(MemoryMedium::new(PagePool::new(128).unwrap()));
        let context = SessionContext {
            file_id: 0,
            snapshot_sequence: 1,
            watermark: 2,
            read_only: false,
        };
        DiskIoSessionPool::new(medium, context, limit)
    }

    #[test]
    fn test_bounded_pool_limits_outstanding() {
        let pool = pool(SessionLimit::Bounded(2));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.remaining(), 0);
        assert!(matches!(pool.acquire(), Err(HistError::SessionLimit { limit: 2 })));

        pool.release(a);
        assert_eq!(pool.outstanding(), 1);
        let c = pool.acquire().unwrap();
        drop(b);
        drop(c);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.remaining(), 2);
    }

    #[test]
    fn test_release_clears_binding() {
        let pool = pool(SessionLimit::Bounded(1));
        let mut session = pool.acquire().unwrap();
        session.write_to_new_block(2, BlockType::Data, 0, 0).unwrap();
        pool.release(session);
        let session = pool.acquire().unwrap();
        assert_eq!(session.block(), None);
    }

    #[test]
    fn test_unbounded_and_dispose() {
        let pool = pool(SessionLimit::Unbounded);
        let sessions: Vec<_> = (0..64).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.remaining(), usize::MAX);
        assert_eq!(pool.outstanding(), 64);

        pool.dispose();
        pool.dispose();
        assert!(matches!(pool.acquire(), Err(HistError::Disposed(_))));
        for s in sessions {
            pool.release(s);
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
