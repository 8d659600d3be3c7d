use crate::identity::ConnId;
use crate::proto::{Protocol, ShutdownPolicy};
use crate::pubsub::{Message, Scope};
use crate::runtime::{lock_or_recover, Runtime};
use crate::shared::{SockError, SockResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use hashbrown::HashMap;
use quark::logging;
use std::io::Cursor;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

/// Control frame filters; regular traffic uses the publisher's own filter.
pub(crate) const FILTER_SUBSCRIBE: i32 = -1;
pub(crate) const FILTER_UNSUBSCRIBE: i32 = -2;
pub(crate) const FILTER_SHUTDOWN: i32 = -3;
pub(crate) const FILTER_PING: i32 = -4;

const FLAG_JSON: u8 = 0b0000_0001;
const FLAG_PATTERN: u8 = 0b0000_0010;
/// Internal: the message is addressed to the root process only.
const FLAG_ROOT_ONLY: u8 = 0b0000_0100;

/// Fixed header size, the leading length field included.
const HEADER_SIZE: usize = 24;

/// Hard cap on one frame's channel + payload, so a corrupt length field
/// cannot balloon the reassembly buffer.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One cluster IPC frame. Little-endian fixed header, then the channel
/// bytes followed by the payload bytes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Frame {
    pub filter: i32,
    pub channel: Bytes,
    pub payload: Bytes,
    pub is_json: bool,
    pub pattern: bool,
    pub root_only: bool,
}

impl Frame {
    pub fn encode(&self) -> Bytes {
        let body_len = 20 + self.channel.len() + self.payload.len();
        let mut buf = Vec::with_capacity(4 + body_len);

        buf.write_u32::<LittleEndian>(body_len as u32)
            .expect("vec write cannot fail");
        buf.write_i32::<LittleEndian>(self.filter)
            .expect("vec write cannot fail");
        buf.write_u32::<LittleEndian>(self.channel.len() as u32)
            .expect("vec write cannot fail");
        buf.write_u32::<LittleEndian>(self.payload.len() as u32)
            .expect("vec write cannot fail");

        let mut flags = 0u8;
        if self.is_json {
            flags |= FLAG_JSON;
        }
        if self.pattern {
            flags |= FLAG_PATTERN;
        }
        if self.root_only {
            flags |= FLAG_ROOT_ONLY;
        }
        buf.push(flags);
        buf.extend_from_slice(&[0u8; 7]);

        buf.extend_from_slice(&self.channel[..]);
        buf.extend_from_slice(&self.payload[..]);

        Bytes::from(buf)
    }
}

/// Incremental frame reassembly over a stream of reads.
pub(crate) struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder { buf: Vec::new() }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete frame off the buffer, if any. A malformed
    /// header surfaces as a fatal error so the link can be dropped.
    pub fn next(&mut self) -> SockResult<Option<Frame>> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&self.buf[..HEADER_SIZE]);
        let body_len = cursor.read_u32::<LittleEndian>()? as usize;
        let filter = cursor.read_i32::<LittleEndian>()?;
        let channel_len = cursor.read_u32::<LittleEndian>()? as usize;
        let payload_len = cursor.read_u32::<LittleEndian>()? as usize;
        let flags = cursor.read_u8()?;

        if body_len != 20 + channel_len + payload_len || body_len > MAX_FRAME_SIZE {
            return Err(SockError::Fatal(crate::shared::ErrorType::Capacity));
        }

        let total = 4 + body_len;

        if self.buf.len() < total {
            return Ok(None);
        }

        let channel = Bytes::copy_from_slice(&self.buf[HEADER_SIZE..HEADER_SIZE + channel_len]);
        let payload = Bytes::copy_from_slice(
            &self.buf[HEADER_SIZE + channel_len..HEADER_SIZE + channel_len + payload_len],
        );

        self.buf.drain(..total);

        Ok(Some(Frame {
            filter,
            channel,
            payload,
            is_json: flags & FLAG_JSON != 0,
            pattern: flags & FLAG_PATTERN != 0,
            root_only: flags & FLAG_ROOT_ONLY != 0,
        }))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Role {
    Standalone,
    Root,
    Worker,
}

struct HubState {
    role: Role,
    /// Root: one link per live worker.
    links: Vec<ConnId>,
    /// Worker: the single link to root.
    uplink: Option<ConnId>,
    /// Root only: fleet-wide channel reference counts, aggregated from
    /// worker subscribe frames. Feeds engine (re)attachment.
    remote_channels: HashMap<(Bytes, bool), usize>,
}

/// The cross-worker pub/sub hub. The root process fans published messages
/// out to every sibling; workers keep a single framed link to root.
pub(crate) struct ClusterHub {
    state: Mutex<HubState>,
}

impl ClusterHub {
    pub fn new() -> ClusterHub {
        ClusterHub {
            state: Mutex::new(HubState {
                role: Role::Standalone,
                links: Vec::new(),
                uplink: None,
                remote_channels: HashMap::new(),
            }),
        }
    }

    pub fn set_root(&self) {
        lock_or_recover(&self.state).role = Role::Root;
    }

    pub fn set_worker(&self) {
        let mut state = lock_or_recover(&self.state);
        state.role = Role::Worker;
        state.links.clear();
        state.remote_channels.clear();
    }

    pub fn is_root_or_standalone(&self) -> bool {
        lock_or_recover(&self.state).role != Role::Worker
    }

    /// Attaches one end of a root/worker socket pair to this runtime.
    pub fn attach_link(&self, rt: &Arc<Runtime>, fd: RawFd) -> SockResult<ConnId> {
        let uuid = rt.attach_fd(
            fd,
            Arc::new(LinkProtocol {
                decoder: Mutex::new(FrameDecoder::new()),
            }),
        )?;

        let mut state = lock_or_recover(&self.state);

        match state.role {
            Role::Root => state.links.push(uuid),
            Role::Worker => state.uplink = Some(uuid),
            Role::Standalone => {
                return Err(SockError::Fatal(crate::shared::ErrorType::Closed));
            }
        }

        logging::debug!(rt.log(), "cluster link attached"; "uuid" => %uuid);

        Ok(uuid)
    }

    fn drop_link(&self, uuid: ConnId) {
        let mut state = lock_or_recover(&self.state);
        state.links.retain(|link| *link != uuid);

        if state.uplink == Some(uuid) {
            state.uplink = None;
        }
    }

    fn peers(&self, except: Option<ConnId>) -> Vec<ConnId> {
        let state = lock_or_recover(&self.state);

        match state.role {
            Role::Root => state
                .links
                .iter()
                .filter(|link| Some(**link) != except)
                .cloned()
                .collect(),
            Role::Worker => state.uplink.into_iter().collect(),
            Role::Standalone => Vec::new(),
        }
    }

    /// Channels known only through worker subscriptions; the root process
    /// uses these to act as the fleet's engine aggregator.
    pub fn remote_channels(&self) -> Vec<(Bytes, bool)> {
        lock_or_recover(&self.state)
            .remote_channels
            .keys()
            .cloned()
            .collect()
    }

    /// Ships a locally published message onto the cluster, per scope.
    pub fn forward(&self, rt: &Arc<Runtime>, message: &Arc<Message>, scope: Scope) -> SockResult<()> {
        let peers = self.peers(None);

        if peers.is_empty() {
            return Ok(());
        }

        let frame = Frame {
            filter: message.filter,
            channel: message.channel.clone(),
            payload: message.payload.clone(),
            is_json: message.is_json,
            pattern: false,
            root_only: scope == Scope::Root,
        }
        .encode();

        let root_local = {
            let state = lock_or_recover(&self.state);
            state.role == Role::Root
        };

        for peer in peers {
            // Root-scoped traffic from the root itself never leaves.
            if root_local && scope == Scope::Root {
                break;
            }

            if let Err(err) = rt.write(peer, frame.clone()) {
                logging::warn!(rt.log(), "cluster forward failed";
                               "uuid" => %peer, "error" => ?err);
            }
        }

        Ok(())
    }

    /// Announces a new local channel to the hub. Only workers report:
    /// the root is the aggregator and already sees its own channels.
    pub fn send_subscribe(&self, rt: &Arc<Runtime>, channel: &Bytes, pattern: bool) {
        if lock_or_recover(&self.state).role != Role::Worker {
            return;
        }

        self.send_control(rt, FILTER_SUBSCRIBE, channel, pattern);
    }

    pub fn send_unsubscribe(&self, rt: &Arc<Runtime>, channel: &Bytes, pattern: bool) {
        if lock_or_recover(&self.state).role != Role::Worker {
            return;
        }

        self.send_control(rt, FILTER_UNSUBSCRIBE, channel, pattern);
    }

    /// Tells the peers this process is leaving the cluster.
    pub fn notify_shutdown(&self, rt: &Arc<Runtime>) {
        self.send_control(rt, FILTER_SHUTDOWN, &Bytes::new(), false);
    }

    fn send_control(&self, rt: &Arc<Runtime>, filter: i32, channel: &Bytes, pattern: bool) {
        let peers = self.peers(None);

        if peers.is_empty() {
            return;
        }

        let frame = Frame {
            filter,
            channel: channel.clone(),
            payload: Bytes::new(),
            is_json: false,
            pattern,
            root_only: false,
        }
        .encode();

        for peer in peers {
            if let Err(err) = rt.write(peer, frame.clone()) {
                logging::warn!(rt.log(), "cluster control send failed";
                               "uuid" => %peer, "filter" => filter, "error" => ?err);
            }
        }
    }

    /// Handles one frame arriving on a link.
    fn handle_frame(&self, rt: &Arc<Runtime>, from: ConnId, frame: Frame) {
        match frame.filter {
            FILTER_SUBSCRIBE => self.remote_subscribe(rt, frame),
            FILTER_UNSUBSCRIBE => self.remote_unsubscribe(rt, frame),
            FILTER_SHUTDOWN => {
                logging::debug!(rt.log(), "peer announced shutdown"; "uuid" => %from);
            }
            FILTER_PING => rt.touch(from),
            _ => self.route_message(rt, from, frame),
        }
    }

    fn route_message(&self, rt: &Arc<Runtime>, from: ConnId, frame: Frame) {
        let is_root = {
            let state = lock_or_recover(&self.state);
            state.role == Role::Root
        };

        let message = Arc::new(Message::assemble(
            frame.filter,
            frame.channel,
            frame.payload,
            frame.is_json,
            Vec::new(),
        ));

        rt.deliver_local(&message);

        // Root fans out to every sibling except the origin; workers are
        // leaves and deliver locally only.
        if is_root && !frame.root_only {
            let frame = Frame {
                filter: message.filter,
                channel: message.channel.clone(),
                payload: message.payload.clone(),
                is_json: message.is_json,
                pattern: false,
                root_only: false,
            }
            .encode();

            for peer in self.peers(Some(from)) {
                if let Err(err) = rt.write(peer, frame.clone()) {
                    logging::warn!(rt.log(), "cluster fan-out failed";
                                   "uuid" => %peer, "error" => ?err);
                }
            }
        }
    }

    fn remote_subscribe(&self, rt: &Arc<Runtime>, frame: Frame) {
        let key = (frame.channel.clone(), frame.pattern);

        let first = {
            let mut state = lock_or_recover(&self.state);
            let count = state.remote_channels.entry(key).or_insert(0);
            *count += 1;
            *count == 1
        };

        if first {
            for engine in rt.pubsub.engines() {
                engine.subscribe(&frame.channel[..], frame.pattern);
            }
        }
    }

    fn remote_unsubscribe(&self, rt: &Arc<Runtime>, frame: Frame) {
        let key = (frame.channel.clone(), frame.pattern);

        let died = {
            let mut state = lock_or_recover(&self.state);

            match state.remote_channels.get_mut(&key) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    state.remote_channels.remove(&key);
                    true
                }
                None => false,
            }
        };

        if died {
            for engine in rt.pubsub.engines() {
                engine.unsubscribe(&frame.channel[..], frame.pattern);
            }
        }
    }
}

/// The framed protocol spoken on root/worker links.
struct LinkProtocol {
    decoder: Mutex<FrameDecoder>,
}

impl Protocol for LinkProtocol {
    fn on_data(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        let mut buf = [0u8; 16 * 1024];

        loop {
            match rt.read(uuid, &mut buf) {
                Ok(0) => break,
                Ok(count) => {
                    let mut decoder = lock_or_recover(&self.decoder);
                    decoder.feed(&buf[..count]);

                    loop {
                        match decoder.next() {
                            Ok(Some(frame)) => rt.cluster.handle_frame(rt, uuid, frame),
                            Ok(None) => break,
                            Err(err) => {
                                logging::error!(rt.log(), "malformed cluster frame";
                                                "uuid" => %uuid, "error" => ?err);
                                rt.force_close(uuid);
                                return;
                            }
                        }
                    }
                }
                Err(_) => break,
            }
        }
    }

    fn on_shutdown(&self, _rt: &Arc<Runtime>, _uuid: ConnId) -> ShutdownPolicy {
        // The link drains its queued frames like any other connection.
        ShutdownPolicy::Close
    }

    fn on_close(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        logging::debug!(rt.log(), "cluster link closed"; "uuid" => %uuid);
        rt.cluster.drop_link(uuid);
    }

    fn ping(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        // Keep the link warm rather than dropping it.
        let frame = Frame {
            filter: FILTER_PING,
            channel: Bytes::new(),
            payload: Bytes::new(),
            is_json: false,
            pattern: false,
            root_only: false,
        };

        drop(rt.write(uuid, frame.encode()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{PublishArgs, SubscribeArgs};
    use crate::runtime::{Runtime, RuntimeConfig};
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn frame(filter: i32, channel: &'static [u8], payload: &'static [u8]) -> Frame {
        Frame {
            filter,
            channel: Bytes::from_static(channel),
            payload: Bytes::from_static(payload),
            is_json: false,
            pattern: false,
            root_only: false,
        }
    }

    #[test]
    fn test_encode_layout() {
        let encoded = frame(7, b"chan", b"payload").encode();

        assert_eq!(encoded.len(), HEADER_SIZE + 4 + 7);

        let mut cursor = Cursor::new(&encoded[..]);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 20 + 4 + 7);
        assert_eq!(cursor.read_i32::<LittleEndian>().unwrap(), 7);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 4);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 7);
        assert_eq!(cursor.read_u8().unwrap(), 0);

        assert_eq!(&encoded[HEADER_SIZE..HEADER_SIZE + 4], b"chan");
        assert_eq!(&encoded[HEADER_SIZE + 4..], b"payload");
    }

    #[test]
    fn test_flags() {
        let mut subject = frame(0, b"c", b"p");
        subject.is_json = true;
        subject.pattern = true;
        subject.root_only = true;

        let encoded = subject.encode();
        assert_eq!(encoded[16], FLAG_JSON | FLAG_PATTERN | FLAG_ROOT_ONLY);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded[..]);

        let decoded = decoder.next().unwrap().unwrap();
        assert!(decoded.is_json);
        assert!(decoded.pattern);
        assert!(decoded.root_only);
    }

    #[test]
    fn test_decoder_handles_split_input() {
        let encoded = frame(0, b"channel", b"payload-bytes").encode();

        let mut decoder = FrameDecoder::new();

        for chunk in encoded.chunks(3) {
            decoder.feed(chunk);
        }

        let decoded = decoder.next().unwrap().unwrap();
        assert_eq!(&decoded.channel[..], b"channel");
        assert_eq!(&decoded.payload[..], b"payload-bytes");
        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn test_decoder_handles_back_to_back_frames() {
        let mut decoder = FrameDecoder::new();

        let first = frame(1, b"a", b"1").encode();
        let second = frame(2, b"b", b"2").encode();

        decoder.feed(&first[..]);
        decoder.feed(&second[..]);

        assert_eq!(decoder.next().unwrap().unwrap().filter, 1);
        assert_eq!(decoder.next().unwrap().unwrap().filter, 2);
        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn test_decoder_waits_for_partial_header() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[1, 2, 3]);

        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn test_decoder_rejects_inconsistent_lengths() {
        let encoded = frame(0, b"chan", b"payload").encode();
        let mut corrupt = encoded.to_vec();
        corrupt[0] = corrupt[0].wrapping_add(1);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&corrupt);

        assert!(decoder.next().is_err());
    }

    #[test]
    fn test_control_frame_has_empty_payload() {
        let control = Frame {
            filter: FILTER_SUBSCRIBE,
            channel: Bytes::from_static(b"chan"),
            payload: Bytes::new(),
            is_json: false,
            pattern: true,
            root_only: false,
        };

        let mut decoder = FrameDecoder::new();
        decoder.feed(&control.encode()[..]);

        let decoded = decoder.next().unwrap().unwrap();
        assert_eq!(decoded.filter, FILTER_SUBSCRIBE);
        assert!(decoded.pattern);
        assert!(decoded.payload.is_empty());
    }

    fn runtime() -> Arc<Runtime> {
        Runtime::new(RuntimeConfig {
            capacity: 128,
            log: None,
        })
        .unwrap()
    }

    fn link_pair() -> (RawFd, RawFd) {
        let (left, right) = UnixStream::pair().unwrap();
        left.set_nonblocking(true).unwrap();
        right.set_nonblocking(true).unwrap();
        (left.into_raw_fd(), right.into_raw_fd())
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

    fn counting_sub(channel: &'static [u8], counter: Arc<AtomicUsize>) -> SubscribeArgs {
        SubscribeArgs {
            filter: 0,
            channel: Bytes::from_static(channel),
            matcher: None,
            on_message: Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            on_unsubscribe: None,
        }
    }

    #[test]
    fn test_cluster_fan_out() {
        // Three runtimes bridged by socket pairs stand in for the forked
        // fleet; the framed link protocol is identical under fork.
        let root = runtime();
        let worker0 = runtime();
        let worker1 = runtime();

        root.cluster.set_root();
        worker0.cluster.set_worker();
        worker1.cluster.set_worker();

        let (root_end0, worker_end0) = link_pair();
        let (root_end1, worker_end1) = link_pair();

        root.cluster.attach_link(&root, root_end0).unwrap();
        root.cluster.attach_link(&root, root_end1).unwrap();
        worker0.cluster.attach_link(&worker0, worker_end0).unwrap();
        worker1.cluster.attach_link(&worker1, worker_end1).unwrap();

        let fleet = [root.clone(), worker0.clone(), worker1.clone()];
        let handles: Vec<_> = fleet
            .iter()
            .map(|rt| {
                let rt = rt.clone();
                thread::spawn(move || rt.start(2))
            })
            .collect();

        let w0_chan = Arc::new(AtomicUsize::new(0));
        let w0_payloads = Arc::new(Mutex::new(Vec::new()));
        let w1_other = Arc::new(AtomicUsize::new(0));
        let w0_filtered = Arc::new(AtomicUsize::new(0));

        let _w0_sub = {
            let w0_chan = w0_chan.clone();
            let w0_payloads = w0_payloads.clone();

            worker0.subscribe(SubscribeArgs {
                filter: 0,
                channel: Bytes::from_static(b"chan"),
                matcher: None,
                on_message: Box::new(move |_, message| {
                    w0_chan.fetch_add(1, Ordering::SeqCst);
                    lock_or_recover(&w0_payloads).push(message.payload.clone());
                }),
                on_unsubscribe: None,
            })
        };

        let _w1_sub = worker1.subscribe(counting_sub(b"other", w1_other.clone()));

        // Typed IPC subscriptions never see pub/sub traffic.
        let _w0_filter_sub = {
            let w0_filtered = w0_filtered.clone();
            worker0.subscribe(SubscribeArgs {
                filter: 9,
                channel: Bytes::new(),
                matcher: None,
                on_message: Box::new(move |_, _| {
                    w0_filtered.fetch_add(1, Ordering::SeqCst);
                }),
                on_unsubscribe: None,
            })
        };

        worker1
            .publish(PublishArgs::channel(&b"chan"[..], &b"hello"[..]))
            .unwrap();

        wait_until("the cluster delivery", || w0_chan.load(Ordering::SeqCst) == 1);

        assert_eq!(lock_or_recover(&w0_payloads)[0], Bytes::from_static(b"hello"));
        assert_eq!(w1_other.load(Ordering::SeqCst), 0);
        assert_eq!(w0_filtered.load(Ordering::SeqCst), 0);

        // Exactly once: no duplicate arrives later.
        thread::sleep(Duration::from_millis(300));
        assert_eq!(w0_chan.load(Ordering::SeqCst), 1);

        // SIBLINGS skips the publisher's own process.
        let w1_chan = Arc::new(AtomicUsize::new(0));
        let _w1_chan_sub = worker1.subscribe(counting_sub(b"chan", w1_chan.clone()));

        worker1
            .publish(PublishArgs {
                scope: Scope::Siblings,
                filter: 0,
                channel: Bytes::from_static(b"chan"),
                payload: Bytes::from_static(b"to-siblings"),
                is_json: false,
            })
            .unwrap();

        wait_until("the siblings delivery", || w0_chan.load(Ordering::SeqCst) == 2);
        assert_eq!(w1_chan.load(Ordering::SeqCst), 0);

        // CLUSTER reaches the publisher's process too.
        worker1
            .publish(PublishArgs::channel(&b"chan"[..], &b"to-all"[..]))
            .unwrap();

        wait_until("the full fan-out", || {
            w0_chan.load(Ordering::SeqCst) == 3 && w1_chan.load(Ordering::SeqCst) == 1
        });

        // PROCESS stays local to the publisher.
        worker1
            .publish(PublishArgs {
                scope: Scope::Process,
                filter: 0,
                channel: Bytes::from_static(b"chan"),
                payload: Bytes::from_static(b"local"),
                is_json: false,
            })
            .unwrap();

        wait_until("the local delivery", || w1_chan.load(Ordering::SeqCst) == 2);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(w0_chan.load(Ordering::SeqCst), 3);

        // Typed IPC reaches only the matching filter.
        worker0
            .publish(PublishArgs {
                scope: Scope::Process,
                filter: 9,
                channel: Bytes::new(),
                payload: Bytes::from_static(b"typed"),
                is_json: false,
            })
            .unwrap();

        wait_until("the typed delivery", || w0_filtered.load(Ordering::SeqCst) == 1);
        assert_eq!(w0_chan.load(Ordering::SeqCst), 3);

        for rt in fleet.iter() {
            rt.stop();
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_root_aggregates_worker_channels() {
        let root = runtime();
        let worker = runtime();

        root.cluster.set_root();
        worker.cluster.set_worker();

        let (root_end, worker_end) = link_pair();
        root.cluster.attach_link(&root, root_end).unwrap();
        worker.cluster.attach_link(&worker, worker_end).unwrap();

        let fleet = [root.clone(), worker.clone()];
        let handles: Vec<_> = fleet
            .iter()
            .map(|rt| {
                let rt = rt.clone();
                thread::spawn(move || rt.start(2))
            })
            .collect();

        let ignored = Arc::new(AtomicUsize::new(0));
        let _sub = worker.subscribe(counting_sub(b"fleet-chan", ignored.clone()));

        wait_until("the subscribe frame", || {
            root.cluster
                .remote_channels()
                .iter()
                .any(|(name, _)| &name[..] == b"fleet-chan")
        });

        for rt in fleet.iter() {
            rt.stop();
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
