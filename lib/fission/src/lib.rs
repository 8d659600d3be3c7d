//! An evented I/O reactor: edge-triggered readiness polling, a
//! generational connection registry, a per-connection tri-level lock
//! discipline, a packet-based write scheduler with file streaming, a
//! deferred task queue with timers, process supervision and a
//! cluster-wide publish/subscribe fabric.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod cluster;
pub mod identity;
pub mod lock;
pub mod net;
pub mod packet;
pub mod proto;
pub mod pubsub;
pub mod runtime;
pub mod shared;
pub mod supervise;
pub mod timer;

pub(crate) mod slot;
pub(crate) mod task;

pub use crate::identity::ConnId;
pub use crate::lock::LockClass;
pub use crate::net::hooks::RwHooks;
pub use crate::net::listen::{ConnectArgs, ListenArgs};
pub use crate::proto::{NoopProtocol, Protocol, ShutdownPolicy};
pub use crate::pubsub::{
    glob_match, glob_matcher, Matcher, Message, Metadata, PubSubEngine, PublishArgs, Scope,
    SubscribeArgs, SubscriptionHandle,
};
pub use crate::runtime::{DeferIoArgs, Event, Runtime, RuntimeConfig, WriteArgs, WriteData};
pub use crate::shared::{ErrorType, ErrorUtils, SockError, SockResult};
pub use crate::supervise::{
    expected_concurrency, CallbackRegistry, Lifecycle, StartArgs, Supervisor,
};
pub use crate::timer::RunEveryArgs;
