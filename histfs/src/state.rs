//! Lock-free lifecycle state.

use std::sync::atomic::{AtomicI32, Ordering};

/// Integer state with sequentially consistent transitions.
///
/// Guards lifecycle flags (open/disposed, idle/editing, ...) of pools,
/// sessions, streams and edits. `try_change` is a compare-and-swap, so among
/// callers racing on the same transition exactly one observes `true`.
///
/// No conversion to `i32` is provided: every observation goes through
/// [`read`](Self::read).
#[derive(Debug)]
pub struct StateCoordinator {
    value: AtomicI32,
}

impl StateCoordinator {
    pub const fn new(initial: i32) -> Self {
        StateCoordinator {
            value: AtomicI32::new(initial),
        }
    }

    pub fn read(&self) -> i32 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: i32) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Move from `expected` to `next`. Returns false (and changes nothing) if
    /// the current value is not `expected`.
    pub fn try_change(&self, expected: i32, next: i32) -> bool {
        self.value
            .compare_exchange(expected, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// States shared by every disposable object in the crate.
pub(crate) mod lifecycle {
    pub const OPEN: i32 = 0;
    pub const DISPOSED: i32 = 1;
}
