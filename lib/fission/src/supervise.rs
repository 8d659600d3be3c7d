use crate::net::listen::ListenArgs;
use crate::net::sock;
use crate::runtime::{lock_or_recover, Runtime, RuntimeConfig};
use crate::shared::{SockError, SockResult};
use crate::timer::RunEveryArgs;
use quark::logging;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Lifecycle tags. Registered callbacks run in reverse registration order
/// when their tag fires.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Lifecycle {
    /// Once, before anything else.
    OnInitialize,
    /// Once, immediately before the reactor starts.
    PreStart,
    /// Before each worker fork.
    BeforeFork,
    /// After each fork, in parent and child alike.
    AfterFork,
    /// After each fork, in the child only.
    InChild,
    /// Every time a worker process starts.
    OnStart,
    /// When the reactor finds itself with nothing to do.
    OnIdle,
    /// Before the shutdown drain begins.
    OnShutdown,
    /// After the reactor stopped, before exit.
    OnFinish,
    /// In a worker, upon noticing the root process died.
    OnParentCrush,
    /// In the root, after reaping a crashed worker.
    OnChildCrush,
    /// The last callbacks to run before the process exits.
    AtExit,
}

pub type CallbackFn = Arc<dyn Fn(&Arc<Runtime>) + Send + Sync>;

/// The lifecycle callback list. Entries are keyed by tag and replayed in
/// reverse registration order; mutations during a replay are ignored (the
/// list is snapshotted first).
pub struct CallbackRegistry {
    entries: Mutex<Vec<(Lifecycle, u64, CallbackFn)>>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> CallbackRegistry {
        CallbackRegistry {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a callback for the tag, returning a removal id.
    pub fn add(&self, tag: Lifecycle, callback: CallbackFn) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock_or_recover(&self.entries).push((tag, id, callback));
        id
    }

    /// Removes a callback by the id `add` returned.
    pub fn remove(&self, id: u64) -> bool {
        let mut entries = lock_or_recover(&self.entries);
        let before = entries.len();
        entries.retain(|(_, existing, _)| *existing != id);
        entries.len() != before
    }

    /// Drops every callback registered for the tag.
    pub fn clear(&self, tag: Lifecycle) {
        lock_or_recover(&self.entries).retain(|(existing, _, _)| *existing != tag);
    }

    /// Runs the tag's callbacks, last registered first.
    pub fn force(&self, tag: Lifecycle, rt: &Arc<Runtime>) {
        let snapshot: Vec<CallbackFn> = {
            let entries = lock_or_recover(&self.entries);
            entries
                .iter()
                .filter(|(existing, _, _)| *existing == tag)
                .map(|(_, _, callback)| callback.clone())
                .collect()
        };

        for callback in snapshot.into_iter().rev() {
            callback(rt);
        }
    }

    /// Copies another registry's entries; used to carry user callbacks
    /// into a freshly forked worker's runtime.
    pub fn adopt(&self, other: &CallbackRegistry) {
        let copied: Vec<_> = lock_or_recover(&other.entries).clone();
        let mut entries = lock_or_recover(&self.entries);

        for entry in copied {
            entries.push(entry);
        }
    }
}

// ----------------------------------------------------------------------
// Signals: handlers write one byte into a self-pipe, which the reactor
// polls like any other descriptor.
// ----------------------------------------------------------------------

pub(crate) const SIG_SHUTDOWN: u8 = b'S';
pub(crate) const SIG_CHILD: u8 = b'C';

static SIGNAL_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(sig: libc::c_int) {
    let fd = SIGNAL_PIPE_WRITE.load(Ordering::Relaxed);

    if fd < 0 {
        return;
    }

    let byte = if sig == libc::SIGCHLD { SIG_CHILD } else { SIG_SHUTDOWN };

    unsafe {
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
    }
}

/// Installs INT/TERM (and optionally CHLD) forwarding into a fresh
/// self-pipe, returning `(read_end, write_end)`. SIGPIPE is ignored.
/// Safe to call again after a fork; the previous pipe is abandoned.
fn install_signals(reap_children: bool) -> SockResult<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];

    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };

    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    SIGNAL_PIPE_WRITE.store(fds[1], Ordering::SeqCst);

    unsafe {
        let handler: extern "C" fn(libc::c_int) = forward_signal;

        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);

        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());

        if reap_children {
            libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut());
        }

        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    Ok((fds[0], fds[1]))
}

// ----------------------------------------------------------------------
// Supervisor
// ----------------------------------------------------------------------

/// Named arguments for `Supervisor::start`.
///
/// Positive values are literal counts. Negative values take a fraction of
/// the CPU count (`-2` = half the cores). A zero borrows the other
/// option's absolute value, defaulting to 1.
#[derive(Debug, Copy, Clone)]
pub struct StartArgs {
    pub threads: i16,
    pub workers: i16,
}

struct ChildRecord {
    pid: libc::pid_t,
}

/// Root/worker process supervision.
///
/// The supervisor owns the root runtime, binds listeners before forking
/// (workers inherit and accept on the shared descriptors), wires the
/// cluster links and respawns workers that exit non-zero until shutdown
/// is flagged. With a single worker, root and worker collapse into one
/// process and there is no respawn.
pub struct Supervisor {
    rt: Arc<Runtime>,
    capacity: usize,
    log: logging::Logger,
    listeners: Mutex<Vec<(RawFd, ListenArgs)>>,
    link_fds: Mutex<Vec<RawFd>>,
    children: Mutex<Vec<ChildRecord>>,
    sig_fds: Mutex<(RawFd, RawFd)>,
    reap_requested: Mutex<bool>,
    root_pid: libc::pid_t,
}

impl Supervisor {
    pub fn new(config: RuntimeConfig) -> SockResult<Supervisor> {
        let log = config.log.clone().unwrap_or_else(logging::discard);
        let capacity = config.capacity;
        let rt = Runtime::new(config)?;

        Ok(Supervisor {
            rt,
            capacity,
            log,
            listeners: Mutex::new(Vec::new()),
            link_fds: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            sig_fds: Mutex::new((-1, -1)),
            reap_requested: Mutex::new(false),
            root_pid: unsafe { libc::getpid() },
        })
    }

    /// The calling process's runtime (the root's, before forking).
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    /// Registers a lifecycle callback. Returns a removal id.
    pub fn callback(
        &self,
        tag: Lifecycle,
        callback: impl Fn(&Arc<Runtime>) + Send + Sync + 'static,
    ) -> u64 {
        self.rt.callbacks.add(tag, Arc::new(callback))
    }

    /// Opts into zombie reaping even in single-process mode.
    pub fn reap_children(&self) {
        *lock_or_recover(&self.reap_requested) = true;
    }

    /// Binds a listening socket now; the accept protocol is attached in
    /// every worker when it starts.
    pub fn listen(&self, args: ListenArgs) -> SockResult<()> {
        let addr = sock::parse_addr(&args.address, &args.port)?;
        let fd = sock::listen(&addr).map_err(SockError::from)?;

        logging::info!(self.log, "listener bound";
                       "address" => %args.address, "port" => %args.port, "fd" => fd);

        lock_or_recover(&self.listeners).push((fd, args));
        Ok(())
    }

    /// Runs the reactor fleet. Blocks until shutdown completes in the
    /// calling (root) process.
    pub fn start(self, args: StartArgs) {
        let (threads, workers) = expected_concurrency(args.threads, args.workers);
        let sup = Arc::new(self);
        let rt = sup.rt.clone();

        rt.callbacks.force(Lifecycle::OnInitialize, &rt);
        rt.callbacks.force(Lifecycle::PreStart, &rt);

        let reap = workers > 1 || *lock_or_recover(&sup.reap_requested);

        match install_signals(reap) {
            Ok(fds) => {
                *lock_or_recover(&sup.sig_fds) = fds;
                if let Err(err) = rt.set_signal_fd(fds.0) {
                    logging::error!(sup.log, "signal pipe registration failed"; "error" => ?err);
                }
            }
            Err(err) => {
                logging::error!(sup.log, "signal installation failed"; "error" => ?err);
            }
        }

        if workers <= 1 {
            // Root and worker collapse; no respawn.
            let pending: Vec<_> = lock_or_recover(&sup.listeners).drain(..).collect();

            for (fd, largs) in pending {
                if let Err(err) = rt.attach_listener_fd(fd, largs) {
                    logging::error!(sup.log, "listener attach failed"; "error" => ?err);
                }
            }

            rt.callbacks.force(Lifecycle::OnStart, &rt);
            rt.start(threads);
            rt.callbacks.force(Lifecycle::OnFinish, &rt);
            rt.callbacks.force(Lifecycle::AtExit, &rt);
            return;
        }

        rt.cluster.set_root();

        {
            let sup = sup.clone();
            rt.set_signal_handler(Box::new(move |rt, byte| match byte {
                SIG_CHILD => sup.reap_and_respawn(rt, threads),
                _ => rt.stop(),
            }));
        }

        logging::info!(sup.log, "supervising workers";
                       "workers" => workers, "threads" => threads);

        for _ in 0..workers {
            sup.spawn_worker(&rt, threads);
        }

        rt.start(threads);

        sup.shutdown_children();

        rt.callbacks.force(Lifecycle::OnFinish, &rt);
        rt.callbacks.force(Lifecycle::AtExit, &rt);
    }

    fn spawn_worker(self: &Arc<Self>, rt: &Arc<Runtime>, threads: usize) {
        rt.callbacks.force(Lifecycle::BeforeFork, rt);

        let (root_end, worker_end) = match UnixStream::pair() {
            Ok((left, right)) => {
                drop(left.set_nonblocking(true));
                drop(right.set_nonblocking(true));
                (left.into_raw_fd(), right.into_raw_fd())
            }
            Err(err) => {
                logging::error!(self.log, "link socketpair failed"; "error" => %err);
                return;
            }
        };

        match unsafe { libc::fork() } {
            0 => {
                unsafe { libc::close(root_end) };
                self.worker_main(worker_end, threads);
            }
            pid if pid > 0 => {
                unsafe { libc::close(worker_end) };

                rt.callbacks.force(Lifecycle::AfterFork, rt);

                lock_or_recover(&self.children).push(ChildRecord { pid });
                lock_or_recover(&self.link_fds).push(root_end);

                if let Err(err) = rt.cluster.attach_link(rt, root_end) {
                    logging::error!(self.log, "root link attach failed";
                                    "pid" => pid, "error" => ?err);
                }

                logging::info!(self.log, "worker spawned"; "pid" => pid);
            }
            _ => {
                logging::error!(self.log, "fork failed";
                                "error" => %std::io::Error::last_os_error());
                unsafe {
                    libc::close(root_end);
                    libc::close(worker_end);
                }
            }
        }
    }

    /// The child side of a fork. Builds a fresh runtime over the inherited
    /// descriptors and runs it to completion. Never returns.
    fn worker_main(&self, link_fd: RawFd, threads: usize) -> ! {
        // Resources that belong to the root's reactor are dead weight in
        // this process; release the copies we inherited.
        for fd in lock_or_recover(&self.link_fds).drain(..) {
            unsafe { libc::close(fd) };
        }
        {
            let (read_fd, write_fd) = *lock_or_recover(&self.sig_fds);
            if read_fd >= 0 {
                unsafe {
                    libc::close(read_fd);
                    libc::close(write_fd);
                }
            }
        }

        let rt = match Runtime::new(RuntimeConfig {
            capacity: self.capacity,
            log: Some(self.log.clone()),
        }) {
            Ok(rt) => rt,
            Err(err) => {
                logging::crit!(self.log, "worker runtime construction failed"; "error" => ?err);
                std::process::exit(1);
            }
        };

        rt.callbacks.adopt(&self.rt.callbacks);
        rt.cluster.set_worker();

        rt.callbacks.force(Lifecycle::AfterFork, &rt);
        rt.callbacks.force(Lifecycle::InChild, &rt);

        match install_signals(false) {
            Ok(fds) => drop(rt.set_signal_fd(fds.0)),
            Err(err) => {
                logging::error!(self.log, "worker signal installation failed"; "error" => ?err);
            }
        }

        if let Err(err) = rt.cluster.attach_link(&rt, link_fd) {
            logging::crit!(self.log, "worker link attach failed"; "error" => ?err);
            std::process::exit(1);
        }

        let pending: Vec<_> = lock_or_recover(&self.listeners)
            .iter()
            .map(|(fd, largs)| (*fd, largs.clone()))
            .collect();

        for (fd, largs) in pending {
            if let Err(err) = rt.attach_listener_fd(fd, largs) {
                logging::error!(self.log, "worker listener attach failed"; "error" => ?err);
            }
        }

        // Parent watchdog: the root never re-parents while alive.
        let root_pid = self.root_pid;
        rt.run_every(RunEveryArgs {
            interval_ms: 500,
            repetitions: 0,
            task: Arc::new(move |rt: &Arc<Runtime>| {
                if unsafe { libc::getppid() } != root_pid {
                    logging::warn!(rt.log(), "root process vanished");
                    rt.callbacks.force(Lifecycle::OnParentCrush, rt);
                    rt.stop();
                }
            }),
            on_finish: None,
        });

        rt.callbacks.force(Lifecycle::OnStart, &rt);
        rt.start(threads);
        rt.callbacks.force(Lifecycle::OnFinish, &rt);
        rt.callbacks.force(Lifecycle::AtExit, &rt);

        std::process::exit(0);
    }

    /// SIGCHLD arrived: reap every finished worker, respawning the ones
    /// that died without a clean exit while the fleet is still running.
    fn reap_and_respawn(self: &Arc<Self>, rt: &Arc<Runtime>, threads: usize) {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };

            if pid <= 0 {
                return;
            }

            let known = {
                let mut children = lock_or_recover(&self.children);
                let before = children.len();
                children.retain(|child| child.pid != pid);
                children.len() != before
            };

            if !known {
                continue;
            }

            let clean = libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;

            if clean || rt.is_stopping() {
                logging::info!(self.log, "worker exited"; "pid" => pid, "status" => status);
                continue;
            }

            logging::warn!(self.log, "worker crashed, respawning";
                           "pid" => pid, "status" => status);

            rt.callbacks.force(Lifecycle::OnChildCrush, rt);
            self.spawn_worker(rt, threads);
        }
    }

    fn shutdown_children(&self) {
        let children: Vec<_> = lock_or_recover(&self.children)
            .drain(..)
            .map(|child| child.pid)
            .collect();

        for pid in &children {
            unsafe { libc::kill(*pid, libc::SIGTERM) };
        }

        for pid in children {
            let mut status: libc::c_int = 0;
            unsafe { libc::waitpid(pid, &mut status, 0) };
            logging::info!(self.log, "worker reaped"; "pid" => pid, "status" => status);
        }
    }
}

/// Resolves the `threads`/`workers` shorthand: negatives are fractions of
/// the CPU count, zero borrows the other option's absolute value.
pub fn expected_concurrency(threads: i16, workers: i16) -> (usize, usize) {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let resolve = |own: i16, other: i16| -> usize {
        match own {
            n if n > 0 => n as usize,
            0 => match other {
                0 => 1,
                m => (m.unsigned_abs() as usize).max(1),
            },
            n => (cores / (n.unsigned_abs() as usize).max(1)).max(1),
        }
    };

    (resolve(threads, workers), resolve(workers, threads))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_runtime() -> Arc<Runtime> {
        Runtime::new(RuntimeConfig {
            capacity: 64,
            log: None,
        })
        .unwrap()
    }

    #[test]
    fn test_callbacks_run_in_reverse_order() {
        let rt = test_runtime();
        let registry = CallbackRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag_value in 0..3usize {
            let order = order.clone();
            registry.add(
                Lifecycle::OnStart,
                Arc::new(move |_| lock_or_recover(&order).push(tag_value)),
            );
        }

        registry.force(Lifecycle::OnStart, &rt);

        assert_eq!(*lock_or_recover(&order), vec![2, 1, 0]);
    }

    #[test]
    fn test_callback_remove() {
        let rt = test_runtime();
        let registry = CallbackRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let id = {
            let fired = fired.clone();
            registry.add(
                Lifecycle::AtExit,
                Arc::new(move |_| {
                    fired.fetch_add(1, Ordering::Relaxed);
                }),
            )
        };

        assert!(registry.remove(id));
        assert!(!registry.remove(id));

        registry.force(Lifecycle::AtExit, &rt);
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_callbacks_fire_only_their_tag() {
        let rt = test_runtime();
        let registry = CallbackRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let fired = fired.clone();
            registry.add(
                Lifecycle::OnShutdown,
                Arc::new(move |_| {
                    fired.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }

        registry.force(Lifecycle::OnStart, &rt);
        assert_eq!(fired.load(Ordering::Relaxed), 0);

        registry.force(Lifecycle::OnShutdown, &rt);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_adopt_copies_entries() {
        let rt = test_runtime();
        let source = CallbackRegistry::new();
        let target = CallbackRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let fired = fired.clone();
            source.add(
                Lifecycle::InChild,
                Arc::new(move |_| {
                    fired.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }

        target.adopt(&source);
        target.force(Lifecycle::InChild, &rt);

        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_single_process_lifecycle_order() {
        let sup = Supervisor::new(RuntimeConfig {
            capacity: 64,
            log: None,
        })
        .unwrap();

        let rt = sup.runtime().clone();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (tag, name) in [
            (Lifecycle::OnInitialize, "initialize"),
            (Lifecycle::PreStart, "pre-start"),
            (Lifecycle::OnStart, "start"),
            (Lifecycle::OnShutdown, "shutdown"),
            (Lifecycle::OnFinish, "finish"),
            (Lifecycle::AtExit, "at-exit"),
        ] {
            let order = order.clone();
            sup.callback(tag, move |_| lock_or_recover(&order).push(name));
        }

        let handle = std::thread::spawn(move || {
            sup.start(StartArgs {
                threads: 1,
                workers: 1,
            })
        });

        for _ in 0..400 {
            if lock_or_recover(&order).contains(&"start") {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        rt.stop();
        handle.join().unwrap();

        assert_eq!(
            *lock_or_recover(&order),
            vec![
                "initialize",
                "pre-start",
                "start",
                "shutdown",
                "finish",
                "at-exit"
            ]
        );
    }

    #[test]
    fn test_expected_concurrency() {
        // Positive values pass through.
        assert_eq!(expected_concurrency(4, 2), (4, 2));

        // Zero borrows the other option's absolute value.
        assert_eq!(expected_concurrency(0, 3), (3, 3));
        assert_eq!(expected_concurrency(2, 0), (2, 2));
        assert_eq!(expected_concurrency(0, 0), (1, 1));

        // Negatives derive from the core count and never hit zero.
        let (threads, workers) = expected_concurrency(-1, -1);
        assert!(threads >= 1);
        assert!(workers >= 1);

        let (threads, _) = expected_concurrency(i16::MIN, 1);
        assert_eq!(threads, 1);
    }
}
