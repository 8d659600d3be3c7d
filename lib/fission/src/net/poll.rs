use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness reported for one descriptor in a wait batch. No ordering is
/// guaranteed between descriptors within a batch.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// Thread-safe registration handle. Watching is edge-triggered and a
/// descriptor is always watched for both read and write readiness; the
/// reactor decides which edges it cares about per event.
pub(crate) struct Poller {
    registry: Registry,
}

impl Poller {
    /// Registers the descriptor. Falls back to re-registration when the
    /// descriptor is already known (protocol re-attach on a live fd).
    pub fn watch(&self, fd: RawFd) -> io::Result<()> {
        let interest = Interest::READABLE | Interest::WRITABLE;

        match self.registry.register(&mut SourceFd(&fd), Token(fd as usize), interest) {
            Ok(()) => Ok(()),
            Err(_) => self
                .registry
                .reregister(&mut SourceFd(&fd), Token(fd as usize), interest),
        }
    }

    /// Stops watching the descriptor. Errors are ignored: the kernel drops
    /// the registration automatically when the descriptor closes.
    pub fn unwatch(&self, fd: RawFd) {
        drop(self.registry.deregister(&mut SourceFd(&fd)));
    }
}

/// The wait side of the poller, owned by the reactor thread.
pub(crate) struct PollDriver {
    poll: Poll,
    events: Events,
}

impl PollDriver {
    pub fn new(event_capacity: usize) -> io::Result<PollDriver> {
        Ok(PollDriver {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity),
        })
    }

    /// Produces a registration handle that can be shared across threads.
    pub fn handle(&self) -> io::Result<Poller> {
        Ok(Poller {
            registry: self.poll.registry().try_clone()?,
        })
    }

    /// Builds a cross-thread waker. Wakeups surface in a batch as the
    /// reserved token, which maps to a negative descriptor.
    pub fn waker(&self) -> io::Result<mio::Waker> {
        mio::Waker::new(self.poll.registry(), Token(usize::MAX))
    }

    /// Waits for readiness events, appending them to `out`. Returns the
    /// number of descriptors reported. Spurious wakeups simply produce an
    /// empty batch.
    pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Readiness>) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => (),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        }

        let mut count = 0;

        for event in self.events.iter() {
            out.push(Readiness {
                fd: event.token().0 as RawFd,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
                error: event.is_error(),
                hangup: event.is_read_closed() || event.is_write_closed(),
            });
            count += 1;
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn wait_for(
        driver: &mut PollDriver,
        fd: RawFd,
        check: impl Fn(&Readiness) -> bool,
    ) -> Option<Readiness> {
        let mut batch = Vec::new();

        for _ in 0..50 {
            batch.clear();
            driver
                .wait(Some(Duration::from_millis(100)), &mut batch)
                .unwrap();

            if let Some(hit) = batch.iter().find(|r| r.fd == fd && check(r)) {
                return Some(*hit);
            }
        }

        None
    }

    #[test]
    fn test_readable_event() {
        let mut driver = PollDriver::new(64).unwrap();
        let poller = driver.handle().unwrap();

        let (mut left, right) = UnixStream::pair().unwrap();
        right.set_nonblocking(true).unwrap();

        poller.watch(right.as_raw_fd()).unwrap();

        left.write_all(b"ping").unwrap();

        let hit = wait_for(&mut driver, right.as_raw_fd(), |r| r.readable);
        assert!(hit.is_some(), "no readable event for the watched fd");
    }

    #[test]
    fn test_writable_on_registration() {
        let mut driver = PollDriver::new(64).unwrap();
        let poller = driver.handle().unwrap();

        let (_left, right) = UnixStream::pair().unwrap();
        right.set_nonblocking(true).unwrap();

        poller.watch(right.as_raw_fd()).unwrap();

        // A fresh socket has an empty send buffer, so the first edge
        // reports writability.
        let hit = wait_for(&mut driver, right.as_raw_fd(), |r| r.writable);
        assert!(hit.is_some(), "no writable event for the watched fd");
    }

    #[test]
    fn test_hangup_event() {
        let mut driver = PollDriver::new(64).unwrap();
        let poller = driver.handle().unwrap();

        let (left, right) = UnixStream::pair().unwrap();
        right.set_nonblocking(true).unwrap();

        poller.watch(right.as_raw_fd()).unwrap();
        drop(left);

        let hit = wait_for(&mut driver, right.as_raw_fd(), |r| r.hangup || r.readable);
        assert!(hit.is_some(), "no hangup event for the watched fd");
    }

    #[test]
    fn test_unwatch_stops_events() {
        let mut driver = PollDriver::new(64).unwrap();
        let poller = driver.handle().unwrap();

        let (mut left, right) = UnixStream::pair().unwrap();
        right.set_nonblocking(true).unwrap();

        poller.watch(right.as_raw_fd()).unwrap();
        poller.unwatch(right.as_raw_fd());

        left.write_all(b"ping").unwrap();

        let mut batch = Vec::new();
        driver
            .wait(Some(Duration::from_millis(100)), &mut batch)
            .unwrap();

        assert!(batch.iter().all(|r| r.fd != right.as_raw_fd()));
    }
}
