use crate::identity::ConnId;
use crate::lock::LockClass;
use crate::proto::Protocol;
use crate::runtime::Runtime;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

pub(crate) type FreeFn = Box<dyn FnOnce(&Arc<Runtime>) + Send>;
pub(crate) type IoFn = Box<dyn FnOnce(&Arc<Runtime>, ConnId, &Arc<dyn Protocol>) + Send>;
pub(crate) type FallbackFn = Box<dyn FnOnce(&Arc<Runtime>, ConnId) + Send>;

/// A connection-scoped task. It runs under the requested lock class once
/// the lock is available; if the connection died first, the fallback runs
/// instead.
pub(crate) struct IoTask {
    pub uuid: ConnId,
    pub class: LockClass,
    pub attempts: u8,
    pub run: IoFn,
    pub fallback: Option<FallbackFn>,
}

/// A task bound to a descriptor's TASK lock after its connection id went
/// stale. Carries everything it needs; used for `on_close` delivery.
pub(crate) struct DetachedTask {
    pub fd: RawFd,
    pub attempts: u8,
    pub run: FreeFn,
}

pub(crate) enum Task {
    /// Runs unconditionally.
    Free(FreeFn),
    /// Runs under a connection lock, or falls back when the id is stale.
    Io(IoTask),
    /// Runs under a descriptor's TASK lock regardless of slot state.
    Detached(DetachedTask),
}

/// Idle throttle: an empty poll sleeps `BASE << rounds` microseconds, the
/// exponent capped so a worker never naps longer than ~16ms. A hot worker
/// keeps draining without ever reaching the wait path, which keeps quiet
/// periods on one warm cache.
const THROTTLE_BASE_US: u64 = 250;
const THROTTLE_MAX_SHIFT: u32 = 6;

/// The shared multi-producer task queue. All reactor work flows through
/// here: IO events, timers, user deferrals and pub/sub deliveries.
pub(crate) struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    signal: Condvar,
}

impl TaskQueue {
    pub fn new() -> TaskQueue {
        TaskQueue {
            tasks: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        }
    }

    fn guard(&self) -> MutexGuard<VecDeque<Task>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, task: Task) {
        self.guard().push_back(task);
        self.signal.notify_one();
    }

    /// Non-blocking pop, used by the reactor thread between polls.
    pub fn pop(&self) -> Option<Task> {
        self.guard().pop_front()
    }

    /// Blocking pop with progressive throttling. `idle_rounds` counts the
    /// caller's consecutive empty polls and stretches the nap accordingly.
    /// Returns `None` on timeout or shutdown.
    pub fn pop_wait(&self, idle_rounds: u32, shutdown: &AtomicBool) -> Option<Task> {
        let mut guard = self.guard();

        if let Some(task) = guard.pop_front() {
            return Some(task);
        }

        if shutdown.load(Ordering::Relaxed) {
            return None;
        }

        let nap = Duration::from_micros(THROTTLE_BASE_US << idle_rounds.min(THROTTLE_MAX_SHIFT));

        let (mut guard, _timeout) = match self.signal.wait_timeout(guard, nap) {
            Ok(result) => result,
            Err(poisoned) => {
                let result = poisoned.into_inner();
                (result.0, result.1)
            }
        };

        guard.pop_front()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Wakes every waiter, used when shutdown is flagged.
    pub fn wake_all(&self) {
        self.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    fn free_task() -> Task {
        Task::Free(Box::new(|_| ()))
    }

    #[test]
    fn test_fifo() {
        let queue = TaskQueue::new();

        for uuid in [ConnId::new(1, 1), ConnId::new(2, 1)] {
            queue.push(Task::Io(IoTask {
                uuid,
                class: LockClass::Task,
                attempts: 0,
                run: Box::new(|_, _, _| ()),
                fallback: None,
            }));
        }

        match queue.pop() {
            Some(Task::Io(task)) => assert_eq!(task.uuid, ConnId::new(1, 1)),
            _ => panic!("Expected the first IO task"),
        }
        match queue.pop() {
            Some(Task::Io(task)) => assert_eq!(task.uuid, ConnId::new(2, 1)),
            _ => panic!("Expected the second IO task"),
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_pop_wait_times_out_when_empty() {
        let queue = TaskQueue::new();
        let shutdown = AtomicBool::new(false);

        let started = Instant::now();
        assert!(queue.pop_wait(0, &shutdown).is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_pop_wait_returns_immediately_on_shutdown() {
        let queue = TaskQueue::new();
        let shutdown = AtomicBool::new(true);

        assert!(queue.pop_wait(10, &shutdown).is_none());
    }

    #[test]
    fn test_throttle_grows_with_idle_rounds() {
        let queue = TaskQueue::new();
        let shutdown = AtomicBool::new(false);

        let started = Instant::now();
        queue.pop_wait(0, &shutdown);
        let short_nap = started.elapsed();

        let started = Instant::now();
        queue.pop_wait(THROTTLE_MAX_SHIFT, &shutdown);
        let long_nap = started.elapsed();

        assert!(long_nap > short_nap, "throttle interval did not grow");
    }

    #[test]
    fn test_push_wakes_waiter() {
        let queue = Arc::new(TaskQueue::new());
        let drained = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                let drained = drained.clone();

                thread::spawn(move || {
                    let shutdown = AtomicBool::new(false);
                    let mut idle = 0;

                    loop {
                        match queue.pop_wait(idle, &shutdown) {
                            Some(_) => {
                                drained.fetch_add(1, Ordering::Relaxed);
                                return;
                            }
                            None => idle += 1,
                        }
                    }
                })
            })
            .collect();

        for _ in 0..2 {
            queue.push(free_task());
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(drained.load(Ordering::Relaxed), 2);
    }
}
