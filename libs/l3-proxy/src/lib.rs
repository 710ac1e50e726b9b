//! User-space TCP proxying on IP level.
//!
//! This crate bridges two worlds that never share a file descriptor: local
//! TCP sockets owned by an event loop, and TCP flows that exist only inside a
//! raw IP stream exchanged with a VPN peer. An embedded TCP/IP engine
//! terminates the tunnel-side flows; the [`Proxy`] glues its sockets to the
//! local ones, speaking SOCKS5 for dynamic destinations and forwarding
//! verbatim for static ones.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod connection;
mod interface;
mod proxy;
mod socks;
mod stub_device;
mod time;

pub use connection::{ConnId, Listener};
pub use proxy::{Config, DEFAULT_MAX_CONNECTIONS, Event, Flush, Proxy};
