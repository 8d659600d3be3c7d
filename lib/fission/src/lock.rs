use std::sync::atomic::{AtomicBool, Ordering};

/// The three per-connection lock classes.
///
/// `Task` guards protocol-mutating callbacks (`on_data`, `on_shutdown`,
/// `on_close` and user task-class work). `Write` guards the write path
/// (`on_ready`, `ping`, the flusher). `State` guards short reads and
/// mutations of slot bookkeeping and is held only for brief critical
/// sections. `Task` and `Write` are orthogonal and may be held by different
/// threads at the same time.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LockClass {
    Task,
    Write,
    State,
}

/// A one-bit try-only lock.
///
/// Acquisition never blocks: a busy lock is reported to the caller, which
/// re-defers its task to the queue instead of spinning.
pub(crate) struct BitLock {
    held: AtomicBool,
}

impl BitLock {
    #[inline]
    pub fn new() -> BitLock {
        BitLock {
            held: AtomicBool::new(false),
        }
    }

    /// Attempts to take the lock. Returns true when acquired.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock. Releasing an unheld lock is a logic error and
    /// panics in debug builds.
    #[inline]
    pub fn release(&self) {
        let was_held = self.held.swap(false, Ordering::Release);
        debug_assert!(was_held, "released an unheld lock");
    }

    #[inline]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}
