use crate::cluster::ClusterHub;
use crate::identity::ConnId;
use crate::lock::LockClass;
use crate::net::hooks::{RwHooks, SocketHooks};
use crate::net::poll::{PollDriver, Poller, Readiness};
use crate::packet::{Chunk, Packet, BLOCK_SIZE};
use crate::proto::{Protocol, ShutdownPolicy};
use crate::pubsub::PubSub;
use crate::shared::{ErrorType, SockError, SockResult};
use crate::slot::{Link, Slot, SlotState};
use crate::supervise::{CallbackRegistry, Lifecycle};
use crate::task::{DetachedTask, IoTask, Task, TaskQueue};
use crate::timer::{RunEveryArgs, TimerWheel};
use bytes::Bytes;
use quark::logging;
use std::any::Any;
use std::cell::RefCell;
use std::fs::File;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Ceiling on the per-worker descriptor table, mirroring the soft
/// `RLIMIT_NOFILE` cap applied when no explicit capacity is configured.
const MAX_CAPACITY: usize = 131_072;

/// Seconds granted to a closing connection (and to the whole shutdown
/// drain) before the remaining traffic is cut off.
const GRACE_SECS: u64 = 8;

/// Poll timeout ceiling; keeps the timeout sweep and shutdown checks live
/// even when no timers are due.
const TICK_CAP: Duration = Duration::from_millis(500);

/// Busy IO tasks are re-queued immediately a few times, then pushed out
/// through the timer wheel with this exponential cap (milliseconds).
const REQUEUE_IMMEDIATE: u8 = 3;
const REQUEUE_SHIFT_CAP: u8 = 7;

thread_local! {
    static SCRATCH: RefCell<Box<[u8; BLOCK_SIZE]>> = RefCell::new(Box::new([0u8; BLOCK_SIZE]));
}

/// The payload argument of `write2`.
pub enum WriteData {
    Memory(Bytes),
    File(File),
}

/// Named arguments for `write2`. A memory packet with `length == 0` sends
/// the whole buffer past `offset`; a file packet with `length == 0` sends
/// to end-of-file.
pub struct WriteArgs {
    pub data: WriteData,
    pub offset: u64,
    pub length: u64,
    pub urgent: bool,
}

impl WriteArgs {
    pub fn memory(bytes: impl Into<Bytes>) -> WriteArgs {
        WriteArgs {
            data: WriteData::Memory(bytes.into()),
            offset: 0,
            length: 0,
            urgent: false,
        }
    }

    pub fn file(file: File) -> WriteArgs {
        WriteArgs {
            data: WriteData::File(file),
            offset: 0,
            length: 0,
            urgent: false,
        }
    }

    pub fn urgent(mut self) -> WriteArgs {
        self.urgent = true;
        self
    }
}

/// Named arguments for `defer_io_task`.
pub struct DeferIoArgs {
    /// `Task` or `Write`; `State` is not schedulable.
    pub class: LockClass,
    pub task: Box<dyn FnOnce(&Arc<Runtime>, ConnId, &Arc<dyn Protocol>) + Send>,
    /// Runs instead of `task` when the connection died first.
    pub fallback: Option<Box<dyn FnOnce(&Arc<Runtime>, ConnId) + Send>>,
}

/// An IO event that can be forced even when it did not occur.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Event {
    OnData,
    OnReady,
    OnTimeout,
}

/// Reactor construction options.
pub struct RuntimeConfig {
    /// Maximum descriptor number handled; 0 derives it from
    /// `RLIMIT_NOFILE` (capped at 131072).
    pub capacity: usize,
    pub log: Option<logging::Logger>,
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig {
            capacity: 0,
            log: None,
        }
    }
}

/// The per-worker reactor context.
///
/// Owns the connection table, the readiness poller, the deferred task
/// queue, the timer wheel and the pub/sub registry. All connection
/// operations take the generational `ConnId`; operations on a stale id fail
/// with `SockError::Stale` and never touch a recycled descriptor.
pub struct Runtime {
    log: logging::Logger,
    slots: Box<[Slot]>,
    poller: Poller,
    driver: Mutex<Option<PollDriver>>,
    waker: mio::Waker,
    pub(crate) queue: TaskQueue,
    pub(crate) timers: TimerWheel,
    epoch: Instant,
    tick_secs: AtomicU64,
    tick_nanos: AtomicU32,
    shutdown: AtomicBool,
    draining: AtomicBool,
    terminated: AtomicBool,
    open_conns: AtomicUsize,
    max_fd: AtomicUsize,
    signal_fd: AtomicI32,
    signal_handler: Mutex<Option<Box<dyn Fn(&Arc<Runtime>, u8) + Send + Sync>>>,
    default_hooks: Arc<dyn RwHooks>,
    idle_protocol: Arc<dyn Protocol>,
    pub(crate) pubsub: PubSub,
    pub(crate) cluster: ClusterHub,
    pub(crate) callbacks: CallbackRegistry,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> SockResult<Arc<Runtime>> {
        let capacity = match config.capacity {
            0 => rlimit_capacity(),
            explicit => explicit.min(MAX_CAPACITY),
        };

        let driver = PollDriver::new(4096).map_err(SockError::from)?;
        let poller = driver.handle().map_err(SockError::from)?;
        let waker = driver.waker().map_err(SockError::from)?;

        let slots: Vec<Slot> = (0..capacity).map(|_| Slot::new()).collect();

        let log = config.log.unwrap_or_else(logging::discard);

        logging::debug!(log, "runtime created"; "capacity" => capacity);

        Ok(Arc::new(Runtime {
            log,
            slots: slots.into_boxed_slice(),
            poller,
            driver: Mutex::new(Some(driver)),
            waker,
            queue: TaskQueue::new(),
            timers: TimerWheel::new(),
            epoch: Instant::now(),
            tick_secs: AtomicU64::new(quark::time::timestamp_secs()),
            tick_nanos: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            open_conns: AtomicUsize::new(0),
            max_fd: AtomicUsize::new(0),
            signal_fd: AtomicI32::new(-1),
            signal_handler: Mutex::new(None),
            default_hooks: Arc::new(SocketHooks),
            idle_protocol: Arc::new(crate::proto::NoopProtocol),
            pubsub: PubSub::new(),
            cluster: ClusterHub::new(),
            callbacks: CallbackRegistry::new(),
        }))
    }

    #[inline]
    pub fn log(&self) -> &logging::Logger {
        &self.log
    }

    /// Maximum number of descriptors this runtime can handle.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The most recent poller return time as `(seconds, nanoseconds)`.
    #[inline]
    pub fn last_tick(&self) -> (u64, u32) {
        (
            self.tick_secs.load(Ordering::Relaxed),
            self.tick_nanos.load(Ordering::Relaxed),
        )
    }

    /// Number of open connections in this runtime.
    #[inline]
    pub fn open_connections(&self) -> usize {
        self.open_conns.load(Ordering::Relaxed)
    }

    /// The lifecycle callback registry. Callbacks registered here fire at
    /// their tag, last registered first.
    #[inline]
    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    /// Flags the reactor for shutdown and wakes it.
    pub fn stop(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            logging::info!(self.log, "shutdown requested");
        }
        self.queue.wake_all();
        drop(self.waker.wake());
    }

    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Milliseconds since the runtime was created; the timer clock.
    #[inline]
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    // ------------------------------------------------------------------
    // Connection registry
    // ------------------------------------------------------------------

    /// Registers a non-blocking descriptor with the reactor, attaching the
    /// protocol. Returns the connection's generational id.
    pub fn attach_fd(&self, fd: RawFd, protocol: Arc<dyn Protocol>) -> SockResult<ConnId> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return Err(SockError::Fatal(ErrorType::Capacity));
        }

        let peer = crate::net::sock::peer_name(fd);
        let now = quark::time::timestamp_secs();

        let generation = {
            let mut state = self.slots[fd as usize].state();

            if state.open {
                return Err(SockError::Fatal(ErrorType::Capacity));
            }

            state.open(protocol, self.default_hooks.clone(), peer, now)
        };

        let uuid = ConnId::new(fd, generation);

        if let Err(err) = self.poller.watch(fd) {
            self.slots[fd as usize].state().shut();
            return Err(err.into());
        }

        self.open_conns.fetch_add(1, Ordering::Relaxed);
        self.max_fd.fetch_max(fd as usize, Ordering::Relaxed);

        logging::debug!(self.log, "connection attached"; "uuid" => %uuid, "fd" => fd);

        Ok(uuid)
    }

    /// The placeholder protocol carried by a freshly accepted connection
    /// until `on_open` attaches the real one.
    #[inline]
    pub(crate) fn idle_protocol(&self) -> Arc<dyn Protocol> {
        self.idle_protocol.clone()
    }

    /// Replaces the connection's protocol. The old protocol's `on_close`
    /// is scheduled, exactly as if its connection had died.
    pub fn attach(self: &Arc<Self>, uuid: ConnId, protocol: Arc<dyn Protocol>) -> SockResult<()> {
        let old = self.with_slot(uuid, |state| {
            Ok(state.protocol.replace(protocol))
        })?;

        if let Some(old) = old {
            // The accept placeholder has no close behaviour to honour.
            if !Arc::ptr_eq(&old, &self.idle_protocol) {
                self.schedule_detached_close(uuid, old);
            }
        }

        Ok(())
    }

    /// Installs read/write hooks for the connection.
    pub fn set_rw_hooks(&self, uuid: ConnId, hooks: Arc<dyn RwHooks>) -> SockResult<()> {
        self.with_slot(uuid, |state| {
            state.hooks = Some(hooks);
            Ok(())
        })
    }

    /// True while the id refers to an open, not-yet-closing connection.
    pub fn is_open(&self, uuid: ConnId) -> bool {
        self.with_slot(uuid, |state| Ok(!state.closing)).unwrap_or(false)
    }

    /// The cached stringified peer address, when known.
    pub fn peer_addr(&self, uuid: ConnId) -> Option<String> {
        self.with_slot(uuid, |state| Ok(state.peer_addr.clone()))
            .unwrap_or(None)
    }

    /// Number of packets waiting in the connection's write queue.
    pub fn pending(&self, uuid: ConnId) -> usize {
        self.with_slot(uuid, |state| Ok(state.queue.len())).unwrap_or(0)
    }

    /// Sets the inactivity timeout in seconds; 0 disables it.
    pub fn timeout_set(&self, uuid: ConnId, seconds: u8) {
        drop(self.with_slot(uuid, |state| {
            state.timeout = seconds;
            Ok(())
        }));
    }

    pub fn timeout_get(&self, uuid: ConnId) -> u8 {
        self.with_slot(uuid, |state| Ok(state.timeout)).unwrap_or(0)
    }

    /// Resets the connection's inactivity clock.
    pub fn touch(&self, uuid: ConnId) {
        let now = quark::time::timestamp_secs();
        drop(self.with_slot(uuid, |state| {
            state.last_activity = now;
            Ok(())
        }));
    }

    /// Stops `on_data` events until the write queue drains to empty (or a
    /// forced `OnData` event).
    pub fn suspend(&self, uuid: ConnId) -> SockResult<()> {
        self.with_slot(uuid, |state| {
            state.suspended = true;
            Ok(())
        })
    }

    /// Schedules an IO event even if it did not occur.
    pub fn force_event(self: &Arc<Self>, uuid: ConnId, event: Event) {
        match event {
            Event::OnData => {
                let fresh = self.with_slot(uuid, |state| {
                    state.suspended = false;
                    if state.data_scheduled {
                        Ok(false)
                    } else {
                        state.data_scheduled = true;
                        Ok(true)
                    }
                });

                if let Ok(true) = fresh {
                    self.schedule_on_data(uuid);
                }
            }
            Event::OnReady => {
                self.queue.push(Task::Io(IoTask {
                    uuid,
                    class: LockClass::Write,
                    attempts: 0,
                    run: Box::new(|rt, uuid, proto| proto.on_ready(rt, uuid)),
                    fallback: None,
                }));
            }
            Event::OnTimeout => {
                self.queue.push(Task::Io(IoTask {
                    uuid,
                    class: LockClass::Write,
                    attempts: 0,
                    run: Box::new(|rt, uuid, proto| proto.ping(rt, uuid)),
                    fallback: None,
                }));
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifetime links
    // ------------------------------------------------------------------

    /// Ties an object to the connection's lifetime. All linked callbacks
    /// fire in reverse insertion order, before the protocol's `on_close`.
    pub fn uuid_link(
        &self,
        uuid: ConnId,
        key: u64,
        obj: Box<dyn Any + Send>,
        on_close: Box<dyn FnOnce(Box<dyn Any + Send>) + Send>,
    ) -> SockResult<()> {
        self.with_slot(uuid, |state| {
            state.links.push(Link { key, obj, on_close });
            Ok(())
        })
    }

    /// Detaches a linked object, returning it without running its
    /// callback. `Stale` and `NotFound` are reported distinctly.
    pub fn uuid_unlink(&self, uuid: ConnId, key: u64) -> SockResult<Box<dyn Any + Send>> {
        self.with_slot(uuid, |state| {
            match state.links.iter().position(|link| link.key == key) {
                Some(at) => Ok(state.links.remove(at).obj),
                None => Err(SockError::NotFound),
            }
        })
    }

    // ------------------------------------------------------------------
    // Reading and writing
    // ------------------------------------------------------------------

    /// Reads available bytes through the connection's hooks. Returns 0 when
    /// no data is available; end-of-stream schedules closure and reports
    /// `Fatal(Eof)`.
    pub fn read(self: &Arc<Self>, uuid: ConnId, buf: &mut [u8]) -> SockResult<usize> {
        let hooks = self.with_slot(uuid, |state| {
            Ok(state.hooks.clone().expect("open slot without hooks"))
        })?;

        match hooks.read(uuid, uuid.fd(), buf) {
            Ok(0) if !buf.is_empty() => {
                self.close(uuid);
                Err(SockError::Fatal(ErrorType::Eof))
            }
            Ok(count) => {
                self.touch(uuid);
                Ok(count)
            }
            Err(err) => match SockError::from(err) {
                SockError::Wait => Ok(0),
                fatal => {
                    self.schedule_force_close(uuid);
                    Err(fatal)
                }
            },
        }
    }

    /// Copies `data` and schedules it for transmission.
    pub fn write(self: &Arc<Self>, uuid: ConnId, data: impl Into<Bytes>) -> SockResult<()> {
        self.write2(uuid, WriteArgs::memory(data.into()))
    }

    /// Streams a file range as a single packet; the descriptor is closed
    /// once the packet completes (or the connection dies).
    pub fn send_file(
        self: &Arc<Self>,
        uuid: ConnId,
        file: File,
        offset: u64,
        length: u64,
    ) -> SockResult<()> {
        self.write2(
            uuid,
            WriteArgs {
                data: WriteData::File(file),
                offset,
                length,
                urgent: false,
            },
        )
    }

    /// Enqueues a packet. The packet is queued in full or not at all; FIFO
    /// order is preserved per connection, with urgent packets inserted
    /// ahead of every packet not yet in flight.
    pub fn write2(self: &Arc<Self>, uuid: ConnId, args: WriteArgs) -> SockResult<()> {
        let urgent = args.urgent;
        let packet = match args.data {
            WriteData::Memory(bytes) => Packet::memory(bytes, args.offset, args.length)?,
            WriteData::File(file) => {
                let length = match args.length {
                    0 => file
                        .metadata()
                        .map_err(SockError::from)?
                        .len()
                        .saturating_sub(args.offset),
                    explicit => explicit,
                };
                Packet::file(file, args.offset, length)
            }
        };

        let schedule = self.with_slot(uuid, |state| {
            if state.closing {
                return Err(SockError::Fatal(ErrorType::Closed));
            }

            state.queue.push(packet, urgent)?;

            if state.flush_scheduled {
                Ok(false)
            } else {
                state.flush_scheduled = true;
                Ok(true)
            }
        })?;

        if schedule {
            self.schedule_flush(uuid);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Marks the connection for closure once its write queue drains. The
    /// drain is guarded: a stall is cut off after a few seconds.
    pub fn close(self: &Arc<Self>, uuid: ConnId) {
        let schedule = self.with_slot(uuid, |state| {
            if state.closing {
                return Ok(false);
            }

            state.closing = true;
            state.close_deadline = quark::time::timestamp_secs() + GRACE_SECS;

            if state.flush_scheduled {
                Ok(false)
            } else {
                state.flush_scheduled = true;
                Ok(true)
            }
        });

        if let Ok(true) = schedule {
            self.schedule_flush(uuid);
        }
    }

    /// Closes immediately, discarding any queued packets.
    pub fn force_close(self: &Arc<Self>, uuid: ConnId) {
        let valid = self.with_slot(uuid, |state| {
            state.closing = true;
            state.close_forced = true;
            Ok(())
        });

        if valid.is_ok() {
            self.schedule_force_close(uuid);
        }
    }

    // ------------------------------------------------------------------
    // Deferred work
    // ------------------------------------------------------------------

    /// Defers a task to the worker pool.
    pub fn defer(&self, task: impl FnOnce(&Arc<Runtime>) + Send + 'static) {
        self.queue.push(Task::Free(Box::new(task)));
    }

    /// Defers a connection task under the requested lock class. If the
    /// connection died first, the fallback runs instead.
    pub fn defer_io_task(&self, uuid: ConnId, args: DeferIoArgs) {
        debug_assert!(
            args.class != LockClass::State,
            "STATE tasks are not schedulable"
        );

        self.queue.push(Task::Io(IoTask {
            uuid,
            class: args.class,
            attempts: 0,
            run: args.task,
            fallback: args.fallback,
        }));
    }

    /// Creates a repeating timer. See `RunEveryArgs`.
    pub fn run_every(&self, args: RunEveryArgs) {
        self.timers.schedule(args, self.now_ms());
    }

    /// Drains the task queue on the calling thread.
    pub fn defer_perform(self: &Arc<Self>) {
        while let Some(task) = self.queue.pop() {
            self.execute(task);
        }
    }

    /// True when deferred tasks are waiting for execution.
    pub fn has_queue(&self) -> bool {
        !self.queue.is_empty()
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    /// Registers the read end of the signal self-pipe with the poller.
    pub(crate) fn set_signal_fd(&self, fd: RawFd) -> SockResult<()> {
        self.signal_fd.store(fd, Ordering::SeqCst);
        self.poller.watch(fd).map_err(SockError::from)
    }

    /// Installs the byte handler for the signal pipe. Without one, any
    /// signal byte requests shutdown.
    pub(crate) fn set_signal_handler(
        &self,
        handler: Box<dyn Fn(&Arc<Runtime>, u8) + Send + Sync>,
    ) {
        *lock_or_recover(&self.signal_handler) = Some(handler);
    }

    // ------------------------------------------------------------------
    // Slot access
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn with_slot<R>(
        &self,
        uuid: ConnId,
        f: impl FnOnce(&mut SlotState) -> SockResult<R>,
    ) -> SockResult<R> {
        if uuid.is_reserved() {
            return Err(SockError::Stale);
        }

        let fd = uuid.fd();

        if fd < 0 || fd as usize >= self.slots.len() {
            return Err(SockError::Stale);
        }

        let mut state = self.slots[fd as usize].state();

        if !state.open || state.generation != uuid.generation() {
            return Err(SockError::Stale);
        }

        f(&mut state)
    }

    // ------------------------------------------------------------------
    // Scheduling internals
    // ------------------------------------------------------------------

    pub(crate) fn schedule_on_data(&self, uuid: ConnId) {
        self.queue.push(Task::Io(IoTask {
            uuid,
            class: LockClass::Task,
            attempts: 0,
            run: Box::new(|rt, uuid, proto| {
                drop(rt.with_slot(uuid, |state| {
                    state.data_scheduled = false;
                    Ok(())
                }));
                proto.on_data(rt, uuid);
            }),
            fallback: None,
        }));
    }

    pub(crate) fn schedule_flush(&self, uuid: ConnId) {
        self.queue.push(Task::Io(IoTask {
            uuid,
            class: LockClass::Write,
            attempts: 0,
            run: Box::new(|rt, uuid, _proto| rt.flush_locked(uuid)),
            fallback: None,
        }));
    }

    fn schedule_force_close(&self, uuid: ConnId) {
        self.queue.push(Task::Io(IoTask {
            uuid,
            class: LockClass::Write,
            attempts: 0,
            run: Box::new(|rt, uuid, _proto| rt.close_locked(uuid, true)),
            fallback: None,
        }));
    }

    fn schedule_detached_close(&self, uuid: ConnId, protocol: Arc<dyn Protocol>) {
        let fd = uuid.fd();

        self.queue.push(Task::Detached(DetachedTask {
            fd,
            attempts: 0,
            run: Box::new(move |rt| protocol.on_close(rt, uuid)),
        }));
    }

    // ------------------------------------------------------------------
    // Task execution
    // ------------------------------------------------------------------

    pub(crate) fn execute(self: &Arc<Self>, task: Task) {
        match task {
            Task::Free(run) => run(self),
            Task::Detached(task) => self.execute_detached(task),
            Task::Io(task) => self.execute_io(task),
        }
    }

    fn execute_detached(self: &Arc<Self>, task: DetachedTask) {
        let fd = task.fd;

        if fd < 0 || fd as usize >= self.slots.len() {
            return;
        }

        let slot = &self.slots[fd as usize];

        if slot.task.try_acquire() {
            (task.run)(self);
            slot.task.release();
        } else {
            self.requeue_detached(task);
        }
    }

    fn execute_io(self: &Arc<Self>, task: IoTask) {
        let fd = task.uuid.fd();

        if fd < 0 || fd as usize >= self.slots.len() {
            self.run_fallback(task);
            return;
        }

        let slot = &self.slots[fd as usize];
        let lock = match task.class {
            LockClass::Task | LockClass::State => &slot.task,
            LockClass::Write => &slot.write,
        };

        if !lock.try_acquire() {
            self.requeue_io(task);
            return;
        }

        // Resolve after the lock is held, so the callback cannot race the
        // close path bumping the generation.
        let protocol = {
            let state = slot.state();

            if state.open && state.generation == task.uuid.generation() {
                state.protocol.clone()
            } else {
                None
            }
        };

        match protocol {
            Some(protocol) => {
                let uuid = task.uuid;
                (task.run)(self, uuid, &protocol);
                lock.release();
            }
            None => {
                lock.release();
                self.run_fallback(task);
            }
        }
    }

    fn run_fallback(self: &Arc<Self>, task: IoTask) {
        if let Some(fallback) = task.fallback {
            fallback(self, task.uuid);
        }
    }

    /// Busy lock: retry soon. A few immediate re-queues usually suffice;
    /// a persistently busy slot backs off through the timer wheel so the
    /// queue does not spin on it.
    fn requeue_io(&self, mut task: IoTask) {
        task.attempts = task.attempts.saturating_add(1);

        if task.attempts <= REQUEUE_IMMEDIATE {
            self.queue.push(Task::Io(task));
            return;
        }

        let delay_ms = 1u64 << task.attempts.min(REQUEUE_SHIFT_CAP);
        self.delay_task(Task::Io(task), delay_ms);
    }

    fn requeue_detached(&self, mut task: DetachedTask) {
        task.attempts = task.attempts.saturating_add(1);

        if task.attempts <= REQUEUE_IMMEDIATE {
            self.queue.push(Task::Detached(task));
            return;
        }

        let delay_ms = 1u64 << task.attempts.min(REQUEUE_SHIFT_CAP);
        self.delay_task(Task::Detached(task), delay_ms);
    }

    fn delay_task(&self, task: Task, delay_ms: u64) {
        let parked = Arc::new(Mutex::new(Some(task)));
        let released = parked.clone();

        // on_finish re-pushes as well: if the reactor shuts down before
        // the timer fires, the task still reaches the queue so a stale
        // connection task can run its fallback.
        self.timers.schedule(
            RunEveryArgs {
                interval_ms: delay_ms.max(1),
                repetitions: 1,
                task: Arc::new(move |rt: &Arc<Runtime>| {
                    if let Some(task) = lock_or_recover(&parked).take() {
                        rt.queue.push(task);
                    }
                }),
                on_finish: Some(Box::new(move |rt: &Arc<Runtime>| {
                    if let Some(task) = lock_or_recover(&released).take() {
                        rt.queue.push(task);
                    }
                })),
            },
            self.now_ms(),
        );
    }

    // ------------------------------------------------------------------
    // Write scheduler
    // ------------------------------------------------------------------

    /// Drains the write queue. Runs under the connection's WRITE lock.
    pub(crate) fn flush_locked(self: &Arc<Self>, uuid: ConnId) {
        drop(self.with_slot(uuid, |state| {
            state.flush_scheduled = false;
            Ok(())
        }));

        let mut wrote_any = false;

        loop {
            match self.flush_step(uuid) {
                FlushStep::Wrote => wrote_any = true,
                FlushStep::Retry => (),
                FlushStep::Blocked | FlushStep::Dead => return,
                FlushStep::Fatal => {
                    self.close_locked(uuid, true);
                    return;
                }
                FlushStep::CloseNow => {
                    self.close_locked(uuid, false);
                    return;
                }
                FlushStep::Drained => {
                    self.after_drain(uuid, wrote_any);
                    return;
                }
            }
        }
    }

    fn flush_step(self: &Arc<Self>, uuid: ConnId) -> FlushStep {
        SCRATCH.with(|cell| {
            let mut guard = cell.borrow_mut();
            let scratch: &mut [u8; BLOCK_SIZE] = &mut **guard;

            // Phase 1, under STATE: produce the next chunk.
            let prep = self.with_slot(uuid, |state| {
                if state.queue.is_empty() {
                    return Ok(Prep::Empty {
                        closing: state.closing,
                        hooks: state.hooks.clone().expect("open slot without hooks"),
                    });
                }

                if state.close_forced {
                    return Ok(Prep::CloseNow);
                }

                let hooks = state.hooks.clone().expect("open slot without hooks");
                let head = state.queue.head().expect("non-empty queue without head");

                match head.chunk(&mut *scratch) {
                    Ok(Chunk::Memory(bytes)) => Ok(Prep::Memory(hooks, bytes)),
                    Ok(Chunk::File(slice)) => {
                        let len = slice.len();
                        Ok(Prep::FileChunk(hooks, len))
                    }
                    Err(SockError::Fatal(ErrorType::Eof)) => {
                        // File shorter than requested: the packet is done.
                        state.queue.pop_head();
                        Ok(Prep::Retry)
                    }
                    Err(err) => Err(err),
                }
            });

            // Phase 2, outside STATE: push the chunk through the hook.
            let written = match prep {
                Ok(Prep::Empty { closing, hooks }) => {
                    // A transport hook may still hold buffered bytes; the
                    // connection is not drained until those leave too.
                    let buffered = hooks.flush(uuid, uuid.fd()).unwrap_or(0);

                    return if buffered > 0 {
                        FlushStep::Blocked
                    } else if closing {
                        FlushStep::CloseNow
                    } else {
                        FlushStep::Drained
                    };
                }
                Ok(Prep::CloseNow) => return FlushStep::CloseNow,
                Ok(Prep::Retry) => return FlushStep::Retry,
                Ok(Prep::Memory(hooks, bytes)) => hooks.write(uuid, uuid.fd(), &bytes[..]),
                Ok(Prep::FileChunk(hooks, len)) => hooks.write(uuid, uuid.fd(), &scratch[..len]),
                Err(SockError::Stale) => return FlushStep::Dead,
                Err(_) => return FlushStep::Fatal,
            };

            // Phase 3, under STATE: account for the transmission.
            match written {
                Ok(0) => FlushStep::Blocked,
                Ok(count) => {
                    self.touch(uuid);

                    let advanced = self.with_slot(uuid, |state| {
                        let head = match state.queue.head() {
                            Some(head) => head,
                            None => return Ok(()),
                        };

                        head.advance(count as u64);

                        if head.is_complete() {
                            state.queue.pop_head();
                        } else {
                            state.queue.mark_head_started();
                        }

                        Ok(())
                    });

                    match advanced {
                        Ok(()) => FlushStep::Wrote,
                        Err(_) => FlushStep::Dead,
                    }
                }
                Err(err) => match SockError::from(err) {
                    // The poller re-arms write interest on the next edge.
                    SockError::Wait => FlushStep::Blocked,
                    _ => FlushStep::Fatal,
                },
            }
        })
    }

    /// The queue went empty: lift suspension and notify the protocol.
    fn after_drain(self: &Arc<Self>, uuid: ConnId, wrote_any: bool) {
        let resume = self.with_slot(uuid, |state| {
            if state.suspended {
                state.suspended = false;

                if !state.data_scheduled {
                    state.data_scheduled = true;
                    return Ok(true);
                }
            }

            Ok(false)
        });

        if let Ok(true) = resume {
            self.schedule_on_data(uuid);
        }

        if wrote_any {
            let protocol = self
                .with_slot(uuid, |state| Ok(state.protocol.clone()))
                .unwrap_or(None);

            if let Some(protocol) = protocol {
                // Still under WRITE: on_ready is a write-class callback.
                protocol.on_ready(self, uuid);
            }
        }
    }

    // ------------------------------------------------------------------
    // Close path
    // ------------------------------------------------------------------

    /// Closes the descriptor and retires the slot. Runs under the
    /// connection's WRITE lock. `forced` discards any queued packets.
    pub(crate) fn close_locked(self: &Arc<Self>, uuid: ConnId, forced: bool) {
        let fd = uuid.fd();

        let hooks = match self.with_slot(uuid, |state| {
            if forced {
                state.queue.clear();
            }

            state.closing = true;
            Ok(state.hooks.clone().expect("open slot without hooks"))
        }) {
            Ok(hooks) => hooks,
            Err(_) => return,
        };

        self.poller.unwatch(fd);

        match hooks.close(uuid, fd) {
            Ok(lingering) if lingering > 0 && !forced => {
                // The hook asked for another flush pass (e.g. a TLS
                // shutdown record). The close deadline bounds the loop.
                let fresh = self.with_slot(uuid, |state| {
                    if state.flush_scheduled {
                        Ok(false)
                    } else {
                        state.flush_scheduled = true;
                        Ok(true)
                    }
                });

                if let Ok(true) = fresh {
                    self.schedule_flush(uuid);
                }

                return;
            }
            _ => (),
        }

        self.finalize(uuid);
    }

    /// Retires the slot: bumps the generation, fires lifetime links in
    /// reverse order and schedules the protocol's `on_close`.
    fn finalize(self: &Arc<Self>, uuid: ConnId) {
        let fd = uuid.fd();
        let slot = &self.slots[fd as usize];

        let (protocol, links) = {
            let mut state = slot.state();

            if !state.open || state.generation != uuid.generation() {
                return;
            }

            state.shut()
        };

        self.open_conns.fetch_sub(1, Ordering::Relaxed);

        logging::debug!(self.log, "connection closed"; "uuid" => %uuid, "fd" => fd);

        for link in links.into_iter().rev() {
            (link.on_close)(link.obj);
        }

        if let Some(protocol) = protocol {
            self.schedule_detached_close(uuid, protocol);
        }
    }

    // ------------------------------------------------------------------
    // Reactor loop
    // ------------------------------------------------------------------

    /// Runs the reactor on the calling thread with `threads - 1` extra
    /// workers, returning after shutdown completes.
    pub fn start(self: &Arc<Self>, threads: usize) {
        let mut driver = match lock_or_recover(&self.driver).take() {
            Some(driver) => driver,
            None => panic!("reactor is already running"),
        };

        let workers: Vec<_> = (1..threads.max(1))
            .map(|index| {
                let rt = self.clone();

                thread::Builder::new()
                    .name(format!("fission-worker-{}", index))
                    .spawn(move || rt.worker_loop())
                    .expect("worker thread spawn failed")
            })
            .collect();

        self.reactor_loop(&mut driver);
        self.terminated.store(true, Ordering::SeqCst);
        self.queue.wake_all();

        for worker in workers {
            drop(worker.join());
        }

        // Leftover callbacks scheduled by the last worker tasks.
        self.defer_perform();
    }

    fn worker_loop(self: Arc<Self>) {
        let mut idle = 0u32;

        loop {
            match self.queue.pop_wait(idle, &self.terminated) {
                Some(task) => {
                    idle = 0;
                    self.execute(task);
                }
                None => {
                    if self.terminated.load(Ordering::SeqCst) && self.queue.is_empty() {
                        return;
                    }
                    idle = idle.saturating_add(1);
                }
            }
        }
    }

    fn reactor_loop(self: &Arc<Self>, driver: &mut PollDriver) {
        let mut readiness: Vec<Readiness> = Vec::with_capacity(1024);
        let mut last_sweep = 0u64;
        let mut drain_deadline = 0u64;
        let mut final_sweep_done = false;

        logging::info!(self.log, "reactor running";
                       "capacity" => self.slots.len(),
                       "pid" => std::process::id());

        loop {
            // The reactor doubles as a worker while it is awake.
            self.defer_perform();

            let now_ms = self.now_ms();
            for expiry in self.timers.fire_due(now_ms) {
                self.queue.push(Task::Free(Box::new(move |rt| {
                    (expiry.task)(rt);
                    if let Some(finish) = expiry.on_finish {
                        finish(rt);
                    }
                })));
            }

            if self.shutdown.load(Ordering::SeqCst) && !self.draining.swap(true, Ordering::SeqCst) {
                drain_deadline = quark::time::timestamp_secs() + GRACE_SECS;
                self.begin_drain();
            }

            if self.draining.load(Ordering::SeqCst) {
                let now = quark::time::timestamp_secs();

                if now >= drain_deadline && !final_sweep_done {
                    final_sweep_done = true;
                    self.force_close_all();
                }

                if self.open_conns.load(Ordering::Relaxed) == 0 && self.queue.is_empty() {
                    break;
                }
            }

            let timeout = self
                .timers
                .next_deadline(self.now_ms())
                .unwrap_or(TICK_CAP)
                .min(if self.draining.load(Ordering::Relaxed) {
                    Duration::from_millis(20)
                } else {
                    TICK_CAP
                });

            readiness.clear();
            if let Err(err) = driver.wait(Some(timeout), &mut readiness) {
                logging::error!(self.log, "poll failed"; "error" => %err);
                break;
            }

            let (secs, nanos) = quark::time::timestamp();
            self.tick_secs.store(secs, Ordering::Relaxed);
            self.tick_nanos.store(nanos, Ordering::Relaxed);

            for ready in readiness.iter() {
                self.dispatch(*ready);
            }

            if readiness.is_empty() && self.queue.is_empty() && !self.draining.load(Ordering::Relaxed)
            {
                self.callbacks.force(Lifecycle::OnIdle, self);
            }

            if secs != last_sweep {
                self.sweep(secs);
                last_sweep = secs;
            }
        }

        // Stragglers: queued callbacks and timer completions still run.
        self.defer_perform();
        for finish in self.timers.drain() {
            finish(self);
        }
        self.defer_perform();

        logging::info!(self.log, "reactor stopped");
    }

    fn dispatch(self: &Arc<Self>, ready: Readiness) {
        if ready.fd < 0 {
            // Waker token; nothing to do beyond waking up.
            return;
        }

        if ready.fd == self.signal_fd.load(Ordering::Relaxed) {
            self.drain_signals();
            return;
        }

        if ready.fd as usize >= self.slots.len() {
            return;
        }

        let slot = &self.slots[ready.fd as usize];

        let (uuid, want_data, want_flush, want_ready, want_close) = {
            let mut state = slot.state();

            if !state.open {
                return;
            }

            let uuid = ConnId::new(ready.fd, state.generation);

            let want_close = ready.error;

            let want_data = (ready.readable || ready.hangup)
                && !state.suspended
                && !state.data_scheduled
                && !want_close;
            if want_data {
                state.data_scheduled = true;
            }

            let pending = !state.queue.is_empty() || state.closing;

            let want_flush = ready.writable && pending && !state.flush_scheduled;
            if want_flush {
                state.flush_scheduled = true;
            }

            // Writability with nothing queued surfaces as on_ready; the
            // dialer relies on this edge to learn its connect resolved.
            let want_ready = ready.writable && !pending && !want_close;

            (uuid, want_data, want_flush, want_ready, want_close)
        };

        if want_close {
            self.force_close(uuid);
            return;
        }

        if want_data {
            self.schedule_on_data(uuid);
        }

        if want_flush {
            self.schedule_flush(uuid);
        }

        if want_ready {
            self.queue.push(Task::Io(IoTask {
                uuid,
                class: LockClass::Write,
                attempts: 0,
                run: Box::new(|rt, uuid, proto| proto.on_ready(rt, uuid)),
                fallback: None,
            }));
        }
    }

    fn drain_signals(self: &Arc<Self>) {
        let fd = self.signal_fd.load(Ordering::Relaxed);
        let mut buf = [0u8; 64];

        loop {
            let count =
                unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };

            if count <= 0 {
                return;
            }

            for byte in &buf[..count as usize] {
                let handled = {
                    let guard = lock_or_recover(&self.signal_handler);
                    match guard.as_ref() {
                        Some(handler) => {
                            handler(self, *byte);
                            true
                        }
                        None => false,
                    }
                };

                if !handled {
                    self.stop();
                }
            }
        }
    }

    /// Once-per-second housekeeping: inactivity pings and stalled drains.
    fn sweep(self: &Arc<Self>, now_secs: u64) {
        let top = self.max_fd.load(Ordering::Relaxed);

        for fd in 0..=top {
            enum Action {
                Ping(ConnId),
                Cutoff(ConnId),
            }

            let action = {
                let mut state = self.slots[fd].state();

                if !state.open {
                    continue;
                }

                let uuid = ConnId::new(fd as RawFd, state.generation);

                if state.closing {
                    if state.close_deadline != 0 && now_secs >= state.close_deadline {
                        state.close_deadline = 0;
                        Some(Action::Cutoff(uuid))
                    } else {
                        None
                    }
                } else if state.timeout > 0
                    && now_secs.saturating_sub(state.last_activity) >= u64::from(state.timeout)
                {
                    // Re-arm so a slow ping does not fire again every sweep.
                    state.last_activity = now_secs;
                    Some(Action::Ping(uuid))
                } else {
                    None
                }
            };

            match action {
                Some(Action::Ping(uuid)) => {
                    self.queue.push(Task::Io(IoTask {
                        uuid,
                        class: LockClass::Write,
                        attempts: 0,
                        run: Box::new(|rt, uuid, proto| proto.ping(rt, uuid)),
                        fallback: None,
                    }));
                }
                Some(Action::Cutoff(uuid)) => self.schedule_force_close(uuid),
                None => (),
            }
        }
    }

    /// Kicks off graceful shutdown: every open connection gets its
    /// `on_shutdown` say, then closure per the returned policy.
    fn begin_drain(self: &Arc<Self>) {
        logging::info!(self.log, "draining connections";
                       "open" => self.open_conns.load(Ordering::Relaxed));

        self.callbacks.force(Lifecycle::OnShutdown, self);
        self.cluster.notify_shutdown(self);

        let top = self.max_fd.load(Ordering::Relaxed);

        for fd in 0..=top {
            let uuid = {
                let state = self.slots[fd].state();

                if !state.open || state.closing {
                    continue;
                }

                ConnId::new(fd as RawFd, state.generation)
            };

            self.queue.push(Task::Io(IoTask {
                uuid,
                class: LockClass::Task,
                attempts: 0,
                run: Box::new(|rt, uuid, proto| match proto.on_shutdown(rt, uuid) {
                    ShutdownPolicy::Close => rt.close(uuid),
                    ShutdownPolicy::Linger(seconds) => {
                        rt.timers.schedule(
                            RunEveryArgs {
                                interval_ms: u64::from(seconds) * 1000,
                                repetitions: 1,
                                task: Arc::new(move |rt: &Arc<Runtime>| rt.close(uuid)),
                                on_finish: None,
                            },
                            rt.now_ms(),
                        );
                    }
                    ShutdownPolicy::Abandon => {
                        drop(rt.with_slot(uuid, |state| {
                            state.abandoned = true;
                            Ok(())
                        }));
                    }
                }),
                fallback: None,
            }));
        }
    }

    /// The drain deadline passed: cut every remaining connection off,
    /// abandoned ones included.
    fn force_close_all(self: &Arc<Self>) {
        let top = self.max_fd.load(Ordering::Relaxed);

        for fd in 0..=top {
            let uuid = {
                let state = self.slots[fd].state();

                if !state.open {
                    continue;
                }

                ConnId::new(fd as RawFd, state.generation)
            };

            self.force_close(uuid);
        }
    }
}

enum Prep {
    Empty {
        closing: bool,
        hooks: Arc<dyn RwHooks>,
    },
    CloseNow,
    Retry,
    Memory(Arc<dyn RwHooks>, Bytes),
    FileChunk(Arc<dyn RwHooks>, usize),
}

enum FlushStep {
    Wrote,
    Retry,
    Blocked,
    Drained,
    CloseNow,
    Fatal,
    Dead,
}

fn rlimit_capacity() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };

    if rc != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
        return MAX_CAPACITY;
    }

    (limit.rlim_cur as usize).min(MAX_CAPACITY)
}

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
