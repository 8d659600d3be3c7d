use crate::identity::ConnId;
use crate::runtime::Runtime;
use std::sync::Arc;

/// What a protocol wants done with its connection when the reactor shuts
/// down.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ShutdownPolicy {
    /// Close now (after the write queue drains).
    Close,
    /// Delay closure by the given number of seconds, counted from the
    /// callback's return.
    Linger(u8),
    /// Leave the connection untouched; it is terminated abruptly once all
    /// other connections finished their graceful shutdown.
    Abandon,
}

/// The per-connection event handler.
///
/// Callbacks receive the connection id rather than any slot reference, so a
/// callback that fires after its connection died turns into a clean no-op.
/// The runtime guarantees that for one connection, task-class callbacks
/// (`on_data`, `on_shutdown`, `on_close`) never run concurrently with each
/// other, and write-class callbacks (`on_ready`, `ping`) never run
/// concurrently with each other. The two classes may overlap, so `on_ready`
/// must treat protocol data as read-only.
///
/// Handlers keep their own mutable state behind interior mutability; the
/// lock discipline above makes task-class access uncontended in practice.
pub trait Protocol: Send + Sync {
    /// Data is available for reading. Will not run concurrently with other
    /// task-class callbacks for the same connection.
    fn on_data(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        let _ = (rt, uuid);
    }

    /// The write queue drained to empty.
    fn on_ready(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        let _ = (rt, uuid);
    }

    /// The reactor is shutting down and this connection is still open.
    fn on_shutdown(&self, rt: &Arc<Runtime>, uuid: ConnId) -> ShutdownPolicy {
        let _ = (rt, uuid);
        ShutdownPolicy::Close
    }

    /// The connection was closed. Runs exactly once, after every queued
    /// task-class callback and after the uuid went stale.
    fn on_close(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        let _ = (rt, uuid);
    }

    /// The inactivity timeout was reached. The default drops the
    /// connection; protocols that want keep-alives override this.
    fn ping(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        rt.close(uuid);
    }
}

/// A protocol that reacts to nothing. Useful as a placeholder and in tests.
pub struct NoopProtocol;

impl Protocol for NoopProtocol {}
