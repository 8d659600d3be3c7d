use crate::lock::BitLock;
use crate::net::hooks::RwHooks;
use crate::packet::PacketQueue;
use crate::proto::Protocol;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

/// An object tied to a connection's lifetime. The callback fires with the
/// object when the connection dies; entries fire in reverse insertion order
/// before the protocol's `on_close`.
pub(crate) struct Link {
    pub key: u64,
    pub obj: Box<dyn Any + Send>,
    pub on_close: Box<dyn FnOnce(Box<dyn Any + Send>) + Send>,
}

/// Mutable per-connection bookkeeping, guarded by the slot's STATE lock.
/// Critical sections must stay short: STATE never blocks TASK or WRITE
/// progress for longer than a field copy or a queue operation.
pub(crate) struct SlotState {
    /// Bumped on every open and every close; never zero.
    pub generation: u8,
    pub open: bool,
    pub closing: bool,
    pub close_forced: bool,
    /// Left untouched during graceful shutdown, reaped by the final sweep.
    pub abandoned: bool,
    pub suspended: bool,
    /// Dedupe flags for reactor-scheduled events.
    pub data_scheduled: bool,
    pub flush_scheduled: bool,
    pub protocol: Option<Arc<dyn Protocol>>,
    pub hooks: Option<Arc<dyn RwHooks>>,
    /// Seconds of inactivity before `ping` fires; 0 disables the timeout.
    pub timeout: u8,
    /// Unix seconds of the most recent read, write or explicit touch.
    pub last_activity: u64,
    /// Unix seconds deadline for a stalled drain; 0 when unset.
    pub close_deadline: u64,
    pub peer_addr: Option<String>,
    pub queue: PacketQueue,
    pub links: Vec<Link>,
}

impl SlotState {
    fn new() -> SlotState {
        SlotState {
            generation: 0,
            open: false,
            closing: false,
            close_forced: false,
            abandoned: false,
            suspended: false,
            data_scheduled: false,
            flush_scheduled: false,
            protocol: None,
            hooks: None,
            timeout: 0,
            last_activity: 0,
            close_deadline: 0,
            peer_addr: None,
            queue: PacketQueue::new(),
            links: Vec::new(),
        }
    }

    /// Prepares the slot for a new connection, bumping the generation.
    /// Returns the new generation value.
    pub fn open(
        &mut self,
        protocol: Arc<dyn Protocol>,
        hooks: Arc<dyn RwHooks>,
        peer_addr: Option<String>,
        now_secs: u64,
    ) -> u8 {
        debug_assert!(!self.open, "opened a slot that is already open");

        self.bump_generation();
        self.open = true;
        self.closing = false;
        self.close_forced = false;
        self.abandoned = false;
        self.suspended = false;
        self.data_scheduled = false;
        self.flush_scheduled = false;
        self.protocol = Some(protocol);
        self.hooks = Some(hooks);
        self.timeout = 0;
        self.last_activity = now_secs;
        self.close_deadline = 0;
        self.peer_addr = peer_addr;
        self.queue.clear();
        self.links.clear();

        self.generation
    }

    /// Tears the slot down after its descriptor was closed, bumping the
    /// generation again so stale ids cannot alias the next connection.
    /// Returns the parts the caller still has to run callbacks on.
    pub fn shut(&mut self) -> (Option<Arc<dyn Protocol>>, Vec<Link>) {
        self.bump_generation();
        self.open = false;
        self.closing = false;
        self.close_forced = false;
        self.abandoned = false;
        self.suspended = false;
        self.data_scheduled = false;
        self.flush_scheduled = false;
        self.hooks = None;
        self.timeout = 0;
        self.close_deadline = 0;
        self.peer_addr = None;
        self.queue.clear();

        (self.protocol.take(), std::mem::take(&mut self.links))
    }

    /// The generation counter wraps within a byte and skips zero, so that
    /// fd 0 can never produce the reserved id value 0.
    fn bump_generation(&mut self) {
        self.generation = match self.generation.wrapping_add(1) {
            0 => 1,
            gen => gen,
        };
    }
}

/// One entry of the fixed-capacity connection table, indexed by descriptor
/// number. TASK and WRITE are one-bit try-locks; STATE is the short-section
/// mutex around the bookkeeping.
pub(crate) struct Slot {
    pub task: BitLock,
    pub write: BitLock,
    state: Mutex<SlotState>,
}

impl Slot {
    pub fn new() -> Slot {
        Slot {
            task: BitLock::new(),
            write: BitLock::new(),
            state: Mutex::new(SlotState::new()),
        }
    }

    /// Locks the STATE mutex. A poisoned lock is recovered: slot state is
    /// plain bookkeeping and every transition is valid to resume from.
    #[inline]
    pub fn state(&self) -> MutexGuard<SlotState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ConnId;
    use crate::net::hooks::SocketHooks;
    use crate::proto::NoopProtocol;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn open_slot(slot: &Slot) -> u8 {
        slot.state()
            .open(Arc::new(NoopProtocol), Arc::new(SocketHooks), None, 100)
    }

    #[test]
    fn test_open_shut_generations_differ() {
        let slot = Slot::new();

        let gen_open = open_slot(&slot);
        assert!(slot.state().open);

        let (proto, links) = slot.state().shut();
        assert!(proto.is_some());
        assert!(links.is_empty());
        assert!(!slot.state().open);

        let gen_reopened = open_slot(&slot);

        assert_ne!(gen_open, gen_reopened);
        assert_ne!(ConnId::new(3, gen_open), ConnId::new(3, gen_reopened));
    }

    #[test]
    fn test_generation_skips_zero() {
        let slot = Slot::new();
        slot.state().generation = 255;

        let gen = open_slot(&slot);
        assert_eq!(gen, 1);
    }

    #[test]
    fn test_shut_returns_links_in_insertion_order() {
        let slot = Slot::new();
        open_slot(&slot);

        let fired = Arc::new(AtomicUsize::new(0));

        for key in 0..3u64 {
            let fired = fired.clone();
            slot.state().links.push(Link {
                key,
                obj: Box::new(key),
                on_close: Box::new(move |_| {
                    fired.fetch_add(1, Ordering::Relaxed);
                }),
            });
        }

        let (_, links) = slot.state().shut();
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].key, 0);
        assert_eq!(links[2].key, 2);

        // Close fires them in reverse order.
        for link in links.into_iter().rev() {
            (link.on_close)(link.obj);
        }
        assert_eq!(fired.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_reopen_resets_flags() {
        let slot = Slot::new();
        open_slot(&slot);

        {
            let mut state = slot.state();
            state.closing = true;
            state.suspended = true;
            state.timeout = 30;
        }

        slot.state().shut();
        open_slot(&slot);

        let state = slot.state();
        assert!(!state.closing);
        assert!(!state.suspended);
        assert_eq!(state.timeout, 0);
    }
}
