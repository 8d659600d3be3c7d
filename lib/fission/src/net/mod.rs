//! The networking modules handle readiness notification, raw socket
//! plumbing and the listener/dialer pseudo-protocols.

pub mod hooks;
pub mod listen;
pub mod poll;
pub mod sock;
