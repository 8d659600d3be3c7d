use crate::lock::BitLock;
use crate::runtime::{lock_or_recover, Runtime};
use crate::shared::SockResult;
use bytes::Bytes;
use hashbrown::HashMap;
use indexmap::IndexMap;
use quark::logging;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Pattern matcher: `matcher(pattern, channel)` returns true when the
/// channel name matches the pattern.
pub type Matcher = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

pub type MessageFn = Box<dyn Fn(&Arc<Runtime>, &Message) + Send + Sync>;
pub type UnsubscribeFn = Box<dyn FnOnce() + Send>;
pub type MetadataFn = Arc<dyn Fn(&Bytes, &Bytes, bool) -> Option<Metadata> + Send + Sync>;

/// Where a publish is delivered.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Scope {
    /// Every process in the cluster, the publisher's included.
    Cluster,
    /// The publishing process only.
    Process,
    /// Every process except the publisher's.
    Siblings,
    /// The root process only.
    Root,
}

/// A typed blob attached to a message by a registered metadata callback.
/// Typical use: encoding an outgoing frame once per publish and re-using
/// it across every subscriber.
#[derive(Clone)]
pub struct Metadata {
    pub type_id: i64,
    pub data: Arc<dyn Any + Send + Sync>,
}

/// A published message as seen by subscription callbacks.
pub struct Message {
    /// 0 is pub/sub; any other value addresses the typed IPC namespace.
    pub filter: i32,
    pub channel: Bytes,
    pub payload: Bytes,
    pub is_json: bool,
    metadata: Vec<Metadata>,
}

impl Message {
    pub(crate) fn assemble(
        filter: i32,
        channel: Bytes,
        payload: Bytes,
        is_json: bool,
        metadata: Vec<Metadata>,
    ) -> Message {
        Message {
            filter,
            channel,
            payload,
            is_json,
            metadata,
        }
    }

    /// Finds attached metadata by its type id.
    pub fn metadata(&self, type_id: i64) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.metadata
            .iter()
            .find(|meta| meta.type_id == type_id)
            .map(|meta| &meta.data)
    }
}

/// Named arguments for `publish`.
pub struct PublishArgs {
    pub scope: Scope,
    pub filter: i32,
    pub channel: Bytes,
    pub payload: Bytes,
    pub is_json: bool,
}

impl PublishArgs {
    pub fn channel(channel: impl Into<Bytes>, payload: impl Into<Bytes>) -> PublishArgs {
        PublishArgs {
            scope: Scope::Cluster,
            filter: 0,
            channel: channel.into(),
            payload: payload.into(),
            is_json: false,
        }
    }
}

/// Named arguments for `subscribe`. A subscription matches either a filter
/// (non-zero) or a channel, never both; supplying a matcher makes the
/// channel a pattern.
pub struct SubscribeArgs {
    pub filter: i32,
    pub channel: Bytes,
    pub matcher: Option<Matcher>,
    pub on_message: MessageFn,
    pub on_unsubscribe: Option<UnsubscribeFn>,
}

/// An external pub/sub backend. Only filter-0 traffic reaches engines.
pub trait PubSubEngine: Send + Sync {
    fn subscribe(&self, channel: &[u8], pattern: bool);
    fn unsubscribe(&self, channel: &[u8], pattern: bool);
    fn publish(&self, channel: &[u8], payload: &[u8], is_json: bool);
}

pub(crate) struct Subscription {
    id: u64,
    filter: i32,
    channel: Bytes,
    matcher: Option<Matcher>,
    on_message: MessageFn,
    on_unsubscribe: Mutex<Option<UnsubscribeFn>>,
    cancelled: AtomicBool,
    /// FIFO of undelivered messages; drained by at most one task at a
    /// time, which keeps deliveries serial and ordered per subscription.
    pending: Mutex<VecDeque<Arc<Message>>>,
    drain_scheduled: AtomicBool,
    delivering: BitLock,
}

impl Subscription {
    fn enqueue(self: &Arc<Self>, rt: &Arc<Runtime>, message: Arc<Message>) {
        lock_or_recover(&self.pending).push_back(message);

        if !self.drain_scheduled.swap(true, Ordering::AcqRel) {
            let sub = self.clone();
            rt.defer(move |rt| sub.drain(rt));
        }
    }

    fn drain(self: Arc<Self>, rt: &Arc<Runtime>) {
        if !self.delivering.try_acquire() {
            // A previous drain is still on its way out; try again.
            let sub = self.clone();
            rt.defer(move |rt| sub.drain(rt));
            return;
        }

        loop {
            if self.cancelled.load(Ordering::Acquire) {
                lock_or_recover(&self.pending).clear();
                self.finish_unsubscribe();
                self.drain_scheduled.store(false, Ordering::Release);
                break;
            }

            let message = lock_or_recover(&self.pending).pop_front();

            match message {
                Some(message) => (self.on_message)(rt, &message),
                None => {
                    self.drain_scheduled.store(false, Ordering::Release);

                    if self.cancelled.load(Ordering::Acquire) {
                        self.finish_unsubscribe();
                        break;
                    }

                    // A publisher may have pushed between the empty pop
                    // and the flag reset; reclaim the slot if so.
                    if !lock_or_recover(&self.pending).is_empty()
                        && !self.drain_scheduled.swap(true, Ordering::AcqRel)
                    {
                        continue;
                    }

                    break;
                }
            }
        }

        self.delivering.release();
    }

    fn finish_unsubscribe(&self) {
        if let Some(on_unsubscribe) = lock_or_recover(&self.on_unsubscribe).take() {
            on_unsubscribe();
        }
    }
}

/// Keeps a subscription alive; pass it back to `unsubscribe` to cancel.
pub struct SubscriptionHandle {
    pub(crate) sub: Arc<Subscription>,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &Bytes {
        &self.sub.channel
    }

    pub fn filter(&self) -> i32 {
        self.sub.filter
    }
}

#[derive(Hash, Eq, PartialEq, Clone)]
struct ChannelKey {
    name: Bytes,
    pattern: bool,
}

/// The process-local subscription registry. Channels are created lazily on
/// first subscription and dropped with their last one. The maps are
/// read-mostly: publish collects matching subscriptions under the lock and
/// delivers outside it.
pub(crate) struct PubSub {
    channels: Mutex<HashMap<ChannelKey, IndexMap<u64, Arc<Subscription>>>>,
    filters: Mutex<HashMap<i32, IndexMap<u64, Arc<Subscription>>>>,
    engines: Mutex<Vec<Arc<dyn PubSubEngine>>>,
    metadata_fns: Mutex<Vec<MetadataFn>>,
    next_id: AtomicU64,
}

impl PubSub {
    pub fn new() -> PubSub {
        PubSub {
            channels: Mutex::new(HashMap::new()),
            filters: Mutex::new(HashMap::new()),
            engines: Mutex::new(Vec::new()),
            metadata_fns: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn subscribe(&self, args: SubscribeArgs) -> Arc<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let sub = Arc::new(Subscription {
            id,
            filter: args.filter,
            channel: args.channel,
            matcher: args.matcher,
            on_message: args.on_message,
            on_unsubscribe: Mutex::new(args.on_unsubscribe),
            cancelled: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            drain_scheduled: AtomicBool::new(false),
            delivering: BitLock::new(),
        });

        if sub.filter != 0 {
            lock_or_recover(&self.filters)
                .entry(sub.filter)
                .or_insert_with(IndexMap::new)
                .insert(id, sub.clone());
        } else {
            let key = ChannelKey {
                name: sub.channel.clone(),
                pattern: sub.matcher.is_some(),
            };

            lock_or_recover(&self.channels)
                .entry(key)
                .or_insert_with(IndexMap::new)
                .insert(id, sub.clone());
        }

        sub
    }

    /// Removes the subscription from the registry. Returns true when it
    /// was still present, along with whether its channel died with it.
    fn unsubscribe(&self, sub: &Arc<Subscription>) -> (bool, bool) {
        if sub.filter != 0 {
            let mut filters = lock_or_recover(&self.filters);

            if let Some(subs) = filters.get_mut(&sub.filter) {
                let removed = subs.shift_remove(&sub.id).is_some();

                if subs.is_empty() {
                    filters.remove(&sub.filter);
                }

                return (removed, false);
            }

            (false, false)
        } else {
            let key = ChannelKey {
                name: sub.channel.clone(),
                pattern: sub.matcher.is_some(),
            };

            let mut channels = lock_or_recover(&self.channels);

            if let Some(subs) = channels.get_mut(&key) {
                let removed = subs.shift_remove(&sub.id).is_some();

                if subs.is_empty() {
                    channels.remove(&key);
                    return (removed, true);
                }

                return (removed, false);
            }

            (false, false)
        }
    }

    /// Collects every subscription a message should reach: the literal
    /// channel entry plus each pattern entry whose matcher accepts the
    /// name. Filtered messages resolve purely through the filter map.
    fn collect(&self, filter: i32, channel: &Bytes) -> Vec<Arc<Subscription>> {
        if filter != 0 {
            return lock_or_recover(&self.filters)
                .get(&filter)
                .map(|subs| subs.values().cloned().collect())
                .unwrap_or_default();
        }

        let channels = lock_or_recover(&self.channels);
        let mut hits = Vec::new();

        if let Some(subs) = channels.get(&ChannelKey {
            name: channel.clone(),
            pattern: false,
        }) {
            hits.extend(subs.values().cloned());
        }

        for (key, subs) in channels.iter() {
            if !key.pattern {
                continue;
            }

            for sub in subs.values() {
                let matcher = sub.matcher.as_ref().expect("pattern entry without matcher");

                if matcher(&key.name[..], &channel[..]) {
                    hits.push(sub.clone());
                }
            }
        }

        hits
    }

    fn build_metadata(&self, channel: &Bytes, payload: &Bytes, is_json: bool) -> Vec<Metadata> {
        let transformers = lock_or_recover(&self.metadata_fns);

        transformers
            .iter()
            .filter_map(|transform| transform(channel, payload, is_json))
            .collect()
    }

    pub(crate) fn engines(&self) -> Vec<Arc<dyn PubSubEngine>> {
        lock_or_recover(&self.engines).clone()
    }

    /// Every distinct channel with a live local subscription.
    pub(crate) fn local_channels(&self) -> Vec<(Bytes, bool)> {
        lock_or_recover(&self.channels)
            .keys()
            .map(|key| (key.name.clone(), key.pattern))
            .collect()
    }
}

impl Runtime {
    /// Subscribes to a filter or a channel. The subscription lives until
    /// `unsubscribe` is called with the returned handle.
    pub fn subscribe(self: &Arc<Self>, args: SubscribeArgs) -> SubscriptionHandle {
        let sub = self.pubsub.subscribe(args);

        if sub.filter == 0 {
            let pattern = sub.matcher.is_some();

            for engine in self.pubsub.engines() {
                engine.subscribe(&sub.channel[..], pattern);
            }

            self.cluster.send_subscribe(self, &sub.channel, pattern);
        }

        logging::debug!(self.log(), "subscribed";
                        "filter" => sub.filter,
                        "channel" => ?String::from_utf8_lossy(&sub.channel[..]));

        SubscriptionHandle { sub }
    }

    /// Cancels a subscription. Delivery already in flight completes first;
    /// `on_unsubscribe` then fires exactly once.
    pub fn unsubscribe(self: &Arc<Self>, handle: SubscriptionHandle) {
        let sub = handle.sub;
        let (removed, channel_died) = self.pubsub.unsubscribe(&sub);

        sub.cancelled.store(true, Ordering::Release);

        if !sub.drain_scheduled.load(Ordering::Acquire) {
            sub.finish_unsubscribe();
        }

        if removed && sub.filter == 0 {
            let pattern = sub.matcher.is_some();

            for engine in self.pubsub.engines() {
                engine.unsubscribe(&sub.channel[..], pattern);
            }

            if channel_died {
                self.cluster.send_unsubscribe(self, &sub.channel, pattern);
            }
        }
    }

    /// Publishes a message to the relevant subscribers. See `PublishArgs`.
    pub fn publish(self: &Arc<Self>, args: PublishArgs) -> SockResult<()> {
        let metadata = if args.filter == 0 {
            self.pubsub
                .build_metadata(&args.channel, &args.payload, args.is_json)
        } else {
            Vec::new()
        };

        let message = Arc::new(Message {
            filter: args.filter,
            channel: args.channel,
            payload: args.payload,
            is_json: args.is_json,
            metadata,
        });

        let local = match args.scope {
            Scope::Cluster | Scope::Process => true,
            Scope::Siblings => false,
            Scope::Root => self.cluster.is_root_or_standalone(),
        };

        if local {
            self.deliver_local(&message);
        }

        if args.scope != Scope::Process {
            self.cluster.forward(self, &message, args.scope)?;
        }

        if args.scope == Scope::Cluster && message.filter == 0 {
            for engine in self.pubsub.engines() {
                engine.publish(&message.channel[..], &message.payload[..], message.is_json);
            }
        }

        Ok(())
    }

    /// Hands a message to every matching local subscription.
    pub(crate) fn deliver_local(self: &Arc<Self>, message: &Arc<Message>) {
        for sub in self.pubsub.collect(message.filter, &message.channel) {
            sub.enqueue(self, message.clone());
        }
    }

    /// Registers (or removes) a metadata transformer run at publish time.
    pub fn message_metadata_callback(&self, transform: MetadataFn, enable: bool) {
        let mut transformers = lock_or_recover(&self.pubsub.metadata_fns);

        if enable {
            transformers.push(transform);
        } else {
            transformers.retain(|existing| !Arc::ptr_eq(existing, &transform));
        }
    }

    /// Attaches an external engine. The engine is immediately told about
    /// every known channel (fleet-wide in the root process).
    pub fn pubsub_attach(self: &Arc<Self>, engine: Arc<dyn PubSubEngine>) {
        lock_or_recover(&self.pubsub.engines).push(engine.clone());
        self.pubsub_reattach(&engine);
    }

    /// Detaches an engine so it can be destroyed.
    pub fn pubsub_detach(&self, engine: &Arc<dyn PubSubEngine>) {
        lock_or_recover(&self.pubsub.engines).retain(|existing| !Arc::ptr_eq(existing, engine));
    }

    /// Replays every active channel into the engine, e.g. after the engine
    /// reconnected to its backend. The root process replays the channels
    /// of the whole fleet; workers replay their own.
    pub fn pubsub_reattach(self: &Arc<Self>, engine: &Arc<dyn PubSubEngine>) {
        for (channel, pattern) in self.pubsub.local_channels() {
            engine.subscribe(&channel[..], pattern);
        }

        for (channel, pattern) in self.cluster.remote_channels() {
            engine.subscribe(&channel[..], pattern);
        }
    }

    pub fn pubsub_is_attached(&self, engine: &Arc<dyn PubSubEngine>) -> bool {
        lock_or_recover(&self.pubsub.engines)
            .iter()
            .any(|existing| Arc::ptr_eq(existing, engine))
    }
}

/// Glob matching over bytes: `*` spans any run, `?` one byte, `[...]`
/// a class with ranges and leading-`^` negation.
pub fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    let mut px = 0;
    let mut nx = 0;
    let mut star_px = usize::MAX;
    let mut star_nx = 0;

    while nx < name.len() {
        if px < pattern.len() {
            match pattern[px] {
                b'*' => {
                    star_px = px;
                    star_nx = nx;
                    px += 1;
                    continue;
                }
                b'?' => {
                    px += 1;
                    nx += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = class_match(&pattern[px..], name[nx]) {
                        if matched {
                            px += next;
                            nx += 1;
                            continue;
                        }
                    }
                }
                byte if byte == name[nx] => {
                    px += 1;
                    nx += 1;
                    continue;
                }
                _ => (),
            }
        }

        // Mismatch: backtrack to the last star, letting it span one more.
        if star_px != usize::MAX {
            px = star_px + 1;
            star_nx += 1;
            nx = star_nx;
            continue;
        }

        return false;
    }

    while px < pattern.len() && pattern[px] == b'*' {
        px += 1;
    }

    px == pattern.len()
}

/// Matches one byte against the class starting at `pattern[0] == b'['`.
/// Returns `(matched, pattern bytes consumed)`, or `None` when the class
/// is unterminated.
fn class_match(pattern: &[u8], byte: u8) -> Option<(bool, usize)> {
    debug_assert_eq!(pattern[0], b'[');

    let mut at = 1;
    let negated = pattern.get(at) == Some(&b'^');

    if negated {
        at += 1;
    }

    let mut matched = false;
    let mut first = true;

    while at < pattern.len() {
        match pattern[at] {
            b']' if !first => {
                return Some((matched != negated, at + 1));
            }
            low => {
                if pattern.get(at + 1) == Some(&b'-')
                    && at + 2 < pattern.len()
                    && pattern[at + 2] != b']'
                {
                    if low <= byte && byte <= pattern[at + 2] {
                        matched = true;
                    }
                    at += 3;
                } else {
                    if low == byte {
                        matched = true;
                    }
                    at += 1;
                }
            }
        }

        first = false;
    }

    None
}

/// The default pattern matcher, usable in `SubscribeArgs::matcher`.
pub fn glob_matcher() -> Matcher {
    Arc::new(|pattern: &[u8], channel: &[u8]| glob_match(pattern, channel))
}
