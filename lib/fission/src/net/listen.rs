use crate::identity::ConnId;
use crate::net::sock;
use crate::proto::{Protocol, ShutdownPolicy};
use crate::runtime::{lock_or_recover, Runtime};
use crate::shared::{SockError, SockResult};
use quark::logging;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

pub type OpenFn = Arc<dyn Fn(&Arc<Runtime>, ConnId) + Send + Sync>;
pub type LifetimeFn = Arc<dyn Fn(&Arc<Runtime>, ConnId) + Send + Sync>;
pub type ConnectFn = Box<dyn FnOnce(&Arc<Runtime>, ConnId) + Send>;

/// Named arguments for `listen`.
///
/// `on_open` runs for every accepted connection and should attach a
/// protocol (or close the connection). `on_start` and `on_finish` fire per
/// worker, when the listener goes live and when it dies.
#[derive(Clone)]
pub struct ListenArgs {
    pub address: String,
    pub port: String,
    pub on_open: OpenFn,
    pub on_start: Option<LifetimeFn>,
    pub on_finish: Option<LifetimeFn>,
}

/// Named arguments for `connect`.
///
/// On a successful non-blocking connect, `on_connect` runs and should
/// attach a protocol. On connection error or after `timeout` seconds,
/// `on_fail` runs and the connection is closed.
pub struct ConnectArgs {
    pub address: String,
    pub port: String,
    pub on_connect: ConnectFn,
    pub on_fail: Option<ConnectFn>,
    /// Seconds before the attempt is abandoned; 0 disables the timeout.
    pub timeout: u8,
}

impl Runtime {
    /// Sets up a network service: binds, listens and attaches the accept
    /// protocol. Returns the listening connection's id.
    pub fn listen(self: &Arc<Self>, args: ListenArgs) -> SockResult<ConnId> {
        let addr = sock::parse_addr(&args.address, &args.port)?;
        let fd = sock::listen(&addr).map_err(SockError::from)?;

        match self.attach_listener_fd(fd, args) {
            Ok(uuid) => Ok(uuid),
            Err(err) => {
                unsafe { libc::close(fd) };
                Err(err)
            }
        }
    }

    /// Attaches an accept protocol to an already bound and listening
    /// descriptor. Used directly by the supervisor, which binds listeners
    /// in the root before forking workers.
    pub(crate) fn attach_listener_fd(
        self: &Arc<Self>,
        fd: std::os::unix::io::RawFd,
        args: ListenArgs,
    ) -> SockResult<ConnId> {
        let on_start = args.on_start.clone();

        let uuid = self.attach_fd(
            fd,
            Arc::new(ListenerProtocol {
                on_open: args.on_open,
                on_finish: args.on_finish,
            }),
        )?;

        logging::info!(self.log(), "listening"; "uuid" => %uuid, "fd" => fd);

        if let Some(on_start) = on_start {
            on_start(self, uuid);
        }

        Ok(uuid)
    }

    /// The local address of a listening TCP connection; recovers the
    /// ephemeral port after binding port 0.
    pub fn listener_addr(&self, uuid: ConnId) -> SockResult<SocketAddr> {
        self.with_slot(uuid, |_| Ok(()))?;
        sock::local_addr(uuid.fd()).map_err(SockError::from)
    }

    /// Creates a client connection. The returned id refers to the
    /// half-open connection until `on_connect` fires.
    pub fn connect(self: &Arc<Self>, args: ConnectArgs) -> SockResult<ConnId> {
        let addr = sock::parse_addr(&args.address, &args.port)?;
        let fd = sock::connect(&addr).map_err(SockError::from)?;

        let timeout = args.timeout;

        let uuid = match self.attach_fd(
            fd,
            Arc::new(DialerProtocol {
                state: Mutex::new(DialState::Pending {
                    on_connect: args.on_connect,
                    on_fail: args.on_fail,
                }),
            }),
        ) {
            Ok(uuid) => uuid,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };

        if timeout > 0 {
            self.timeout_set(uuid, timeout);
        }

        Ok(uuid)
    }
}

/// The accept pseudo-protocol: `on_data` accepts until the listener would
/// block, handing each new connection to the user's `on_open`.
struct ListenerProtocol {
    on_open: OpenFn,
    on_finish: Option<LifetimeFn>,
}

impl Protocol for ListenerProtocol {
    fn on_data(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        let listener_fd = uuid.fd();

        loop {
            match sock::accept(listener_fd) {
                Ok((fd, peer)) => {
                    match rt.attach_fd(fd, rt.idle_protocol()) {
                        Ok(conn) => {
                            logging::debug!(rt.log(), "connection accepted";
                                            "uuid" => %conn, "peer" => %peer);
                            (self.on_open)(rt, conn);
                        }
                        Err(err) => {
                            logging::warn!(rt.log(), "accepted socket rejected";
                                           "error" => ?err);
                            unsafe { libc::close(fd) };
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
                Err(err) => {
                    logging::error!(rt.log(), "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn on_shutdown(&self, _rt: &Arc<Runtime>, _uuid: ConnId) -> ShutdownPolicy {
        // Listeners close first so the drain sees no new connections.
        ShutdownPolicy::Close
    }

    fn on_close(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        if let Some(on_finish) = &self.on_finish {
            on_finish(rt, uuid);
        }
    }

    fn ping(&self, _rt: &Arc<Runtime>, _uuid: ConnId) {
        // Listeners never time out.
    }
}

enum DialState {
    Pending {
        on_connect: ConnectFn,
        on_fail: Option<ConnectFn>,
    },
    Done,
}

/// The dialer pseudo-protocol: waits for the non-blocking connect to
/// resolve, then hands the connection over exactly once.
struct DialerProtocol {
    state: Mutex<DialState>,
}

impl DialerProtocol {
    fn take(&self) -> Option<(ConnectFn, Option<ConnectFn>)> {
        let mut state = lock_or_recover(&self.state);

        match std::mem::replace(&mut *state, DialState::Done) {
            DialState::Pending { on_connect, on_fail } => Some((on_connect, on_fail)),
            DialState::Done => None,
        }
    }

    fn resolve(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        let (on_connect, on_fail) = match self.take() {
            Some(pending) => pending,
            None => return,
        };

        match sock::take_error(uuid.fd()) {
            Ok(()) => {
                rt.timeout_set(uuid, 0);
                on_connect(rt, uuid);
            }
            Err(err) => {
                logging::debug!(rt.log(), "connect failed"; "uuid" => %uuid, "error" => %err);

                if let Some(on_fail) = on_fail {
                    on_fail(rt, uuid);
                }

                rt.force_close(uuid);
            }
        }
    }
}

impl Protocol for DialerProtocol {
    fn on_ready(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        self.resolve(rt, uuid);
    }

    fn on_data(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        // A refused connect often surfaces as readable-with-error.
        self.resolve(rt, uuid);
    }

    fn ping(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        if let Some((_, on_fail)) = self.take() {
            logging::debug!(rt.log(), "connect timed out"; "uuid" => %uuid);

            if let Some(on_fail) = on_fail {
                on_fail(rt, uuid);
            }

            rt.force_close(uuid);
        }
    }

    fn on_close(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        // Died before resolving: report the failure.
        if let Some((_, on_fail)) = self.take() {
            if let Some(on_fail) = on_fail {
                on_fail(rt, uuid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::NoopProtocol;
    use crate::runtime::RuntimeConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn start_runtime() -> (Arc<Runtime>, thread::JoinHandle<()>) {
        let rt = Runtime::new(RuntimeConfig {
            capacity: 128,
            log: None,
        })
        .unwrap();

        let handle = {
            let rt = rt.clone();
            thread::spawn(move || rt.start(2))
        };

        (rt, handle)
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn test_listener_lifecycle_callbacks() {
        let (rt, handle) = start_runtime();

        let starts = Arc::new(AtomicUsize::new(0));
        let finishes = Arc::new(AtomicUsize::new(0));

        {
            let starts = starts.clone();
            let finishes = finishes.clone();

            rt.listen(ListenArgs {
                address: "127.0.0.1".into(),
                port: "0".into(),
                on_open: Arc::new(|_, _| ()),
                on_start: Some(Arc::new(move |_, _| {
                    starts.fetch_add(1, Ordering::Relaxed);
                })),
                on_finish: Some(Arc::new(move |_, _| {
                    finishes.fetch_add(1, Ordering::Relaxed);
                })),
            })
            .unwrap();
        }

        assert_eq!(starts.load(Ordering::Relaxed), 1);
        assert_eq!(finishes.load(Ordering::Relaxed), 0);

        rt.stop();
        handle.join().unwrap();

        assert_eq!(finishes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_connect_resolves_on_connect() {
        let (rt, handle) = start_runtime();

        let opened = Arc::new(AtomicUsize::new(0));
        let connected = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let listener = {
            let opened = opened.clone();
            rt.listen(ListenArgs {
                address: "127.0.0.1".into(),
                port: "0".into(),
                on_open: Arc::new(move |rt, uuid| {
                    opened.fetch_add(1, Ordering::Relaxed);
                    rt.attach(uuid, Arc::new(NoopProtocol)).unwrap();
                }),
                on_start: None,
                on_finish: None,
            })
            .unwrap()
        };

        let addr = rt.listener_addr(listener).unwrap();

        {
            let connected = connected.clone();
            let failed = failed.clone();

            rt.connect(ConnectArgs {
                address: addr.ip().to_string(),
                port: addr.port().to_string(),
                on_connect: Box::new(move |rt, uuid| {
                    connected.fetch_add(1, Ordering::Relaxed);
                    rt.attach(uuid, Arc::new(NoopProtocol)).unwrap();
                }),
                on_fail: Some(Box::new(move |_, _| {
                    failed.fetch_add(1, Ordering::Relaxed);
                })),
                timeout: 5,
            })
            .unwrap();
        }

        wait_until("the dialer resolution", || {
            connected.load(Ordering::Relaxed) == 1
        });
        wait_until("the accept side", || opened.load(Ordering::Relaxed) == 1);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(connected.load(Ordering::Relaxed), 1);
        assert_eq!(failed.load(Ordering::Relaxed), 0);

        rt.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_connect_refused_reports_failure() {
        let (rt, handle) = start_runtime();

        // Bind and immediately drop a listener to learn a free port.
        let free_port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let connected = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        {
            let connected = connected.clone();
            let failed = failed.clone();

            rt.connect(ConnectArgs {
                address: "127.0.0.1".into(),
                port: free_port.to_string(),
                on_connect: Box::new(move |_, _| {
                    connected.fetch_add(1, Ordering::Relaxed);
                }),
                on_fail: Some(Box::new(move |_, _| {
                    failed.fetch_add(1, Ordering::Relaxed);
                })),
                timeout: 5,
            })
            .unwrap();
        }

        wait_until("the dialer failure", || failed.load(Ordering::Relaxed) == 1);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(connected.load(Ordering::Relaxed), 0);
        assert_eq!(failed.load(Ordering::Relaxed), 1);

        rt.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_unix_socket_listener() {
        let (rt, handle) = start_runtime();

        let path = format!(
            "{}/fission-listen-test-{}.sock",
            std::env::temp_dir().display(),
            std::process::id()
        );

        let opened = Arc::new(AtomicUsize::new(0));

        {
            let opened = opened.clone();
            rt.listen(ListenArgs {
                address: path.clone(),
                port: String::new(),
                on_open: Arc::new(move |rt, uuid| {
                    opened.fetch_add(1, Ordering::Relaxed);
                    rt.attach(uuid, Arc::new(NoopProtocol)).unwrap();
                }),
                on_start: None,
                on_finish: None,
            })
            .unwrap();
        }

        let _client = std::os::unix::net::UnixStream::connect(&path).unwrap();

        wait_until("the unix accept", || opened.load(Ordering::Relaxed) == 1);

        rt.stop();
        handle.join().unwrap();

        drop(std::fs::remove_file(&path));
    }
}
