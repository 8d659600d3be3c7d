use crate::runtime::Runtime;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub(crate) type TimerFn = Arc<dyn Fn(&Arc<Runtime>) + Send + Sync>;
pub(crate) type FinishFn = Box<dyn FnOnce(&Arc<Runtime>) + Send>;

/// Configuration record for `run_every`.
pub struct RunEveryArgs {
    pub interval_ms: u64,
    /// Number of firings; 0 repeats until reactor shutdown.
    pub repetitions: usize,
    pub task: Arc<dyn Fn(&Arc<Runtime>) + Send + Sync>,
    /// Always called exactly once, after the last repetition or at
    /// shutdown, whichever comes first.
    pub on_finish: Option<Box<dyn FnOnce(&Arc<Runtime>) + Send>>,
}

struct Timer {
    interval_ms: u64,
    /// Remaining firings; `None` repeats forever.
    remaining: Option<usize>,
    task: TimerFn,
    on_finish: Option<FinishFn>,
}

/// One expiry produced by `fire_due`: the task to run and, when the timer
/// finished, its completion callback.
pub(crate) struct Expiry {
    pub task: TimerFn,
    pub on_finish: Option<FinishFn>,
}

struct WheelState {
    /// Keyed by `(absolute deadline in ms, insertion sequence)`; the
    /// sequence keeps timers with equal deadlines distinct and FIFO.
    timers: BTreeMap<(u64, u64), Timer>,
    seq: u64,
}

/// A sorted timer structure. The reactor asks it for the next deadline to
/// bound the poll timeout, then collects due expiries after each wakeup.
/// All deadlines are milliseconds on the runtime's monotonic clock.
pub(crate) struct TimerWheel {
    state: Mutex<WheelState>,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            state: Mutex::new(WheelState {
                timers: BTreeMap::new(),
                seq: 0,
            }),
        }
    }

    fn guard(&self) -> MutexGuard<WheelState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn schedule(&self, args: RunEveryArgs, now_ms: u64) {
        let mut state = self.guard();
        let seq = state.seq;
        state.seq += 1;

        state.timers.insert(
            (now_ms + args.interval_ms, seq),
            Timer {
                interval_ms: args.interval_ms,
                remaining: match args.repetitions {
                    0 => None,
                    count => Some(count),
                },
                task: args.task,
                on_finish: args.on_finish,
            },
        );
    }

    /// Delta to the earliest deadline, or `None` when no timers exist.
    pub fn next_deadline(&self, now_ms: u64) -> Option<Duration> {
        let state = self.guard();

        state
            .timers
            .keys()
            .next()
            .map(|(deadline, _)| Duration::from_millis(deadline.saturating_sub(now_ms)))
    }

    /// Pops every due timer, rescheduling the ones with firings left. The
    /// next deadline counts from the current tick, so firings are spaced no
    /// less than one interval apart.
    pub fn fire_due(&self, now_ms: u64) -> Vec<Expiry> {
        let mut state = self.guard();
        let mut due = Vec::new();

        loop {
            let key = match state.timers.keys().next() {
                Some(&(deadline, seq)) if deadline <= now_ms => (deadline, seq),
                _ => break,
            };

            let mut timer = state.timers.remove(&key).expect("due timer vanished");

            let finished = match timer.remaining.as_mut() {
                Some(remaining) => {
                    *remaining -= 1;
                    *remaining == 0
                }
                None => false,
            };

            due.push(Expiry {
                task: timer.task.clone(),
                on_finish: if finished { timer.on_finish.take() } else { None },
            });

            if !finished {
                let seq = state.seq;
                state.seq += 1;
                state.timers.insert((now_ms + timer.interval_ms, seq), timer);
            }
        }

        due
    }

    /// Cancels every timer, returning the completion callbacks. Used at
    /// reactor shutdown so each `on_finish` still fires exactly once.
    pub fn drain(&self) -> Vec<FinishFn> {
        let mut state = self.guard();
        let timers = std::mem::take(&mut state.timers);

        timers
            .into_iter()
            .filter_map(|(_, timer)| timer.on_finish)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.guard().timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_args(interval_ms: u64, repetitions: usize) -> RunEveryArgs {
        RunEveryArgs {
            interval_ms,
            repetitions,
            task: Arc::new(|_| ()),
            on_finish: Some(Box::new(|_| ())),
        }
    }

    #[test]
    fn test_next_deadline() {
        let wheel = TimerWheel::new();
        assert!(wheel.next_deadline(0).is_none());

        wheel.schedule(noop_args(100, 1), 0);
        wheel.schedule(noop_args(50, 1), 0);

        assert_eq!(wheel.next_deadline(0), Some(Duration::from_millis(50)));
        assert_eq!(wheel.next_deadline(60), Some(Duration::from_millis(0)));
    }

    #[test]
    fn test_fires_exact_repetitions() {
        let wheel = TimerWheel::new();
        wheel.schedule(noop_args(100, 3), 0);

        let mut fired = 0;
        let mut finishes = 0;
        let mut now = 0;

        for _ in 0..10 {
            now += 100;
            for expiry in wheel.fire_due(now) {
                fired += 1;
                if expiry.on_finish.is_some() {
                    finishes += 1;
                }
            }
        }

        assert_eq!(fired, 3);
        assert_eq!(finishes, 1);
        assert_eq!(wheel.len(), 0);
    }

    #[test]
    fn test_zero_repetitions_run_forever() {
        let wheel = TimerWheel::new();
        wheel.schedule(noop_args(10, 0), 0);

        let mut fired = 0;
        let mut now = 0;

        for _ in 0..100 {
            now += 10;
            fired += wheel.fire_due(now).len();
        }

        assert_eq!(fired, 100);
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn test_spacing_is_at_least_one_interval() {
        let wheel = TimerWheel::new();
        wheel.schedule(noop_args(100, 2), 0);

        // Fire late: the reschedule counts from the firing tick.
        assert_eq!(wheel.fire_due(150).len(), 1);
        assert!(wheel.fire_due(249).is_empty());
        assert_eq!(wheel.fire_due(250).len(), 1);
    }

    #[test]
    fn test_equal_deadlines_all_fire() {
        let wheel = TimerWheel::new();
        wheel.schedule(noop_args(100, 1), 0);
        wheel.schedule(noop_args(100, 1), 0);
        wheel.schedule(noop_args(100, 1), 0);

        assert_eq!(wheel.fire_due(100).len(), 3);
        assert_eq!(wheel.len(), 0);
    }

    #[test]
    fn test_drain_returns_all_finish_callbacks() {
        let wheel = TimerWheel::new();
        wheel.schedule(noop_args(100, 5), 0);
        wheel.schedule(noop_args(200, 0), 0);

        let finishes = wheel.drain();
        assert_eq!(finishes.len(), 2);
        assert_eq!(wheel.len(), 0);
    }
}
