use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;

use smoltcp::iface::SocketHandle;
use smoltcp::socket::dns::QueryHandle;

/// Scratch space for accumulating a SOCKS handshake across reads.
///
/// Also the unit in which the data plane reads from local sockets; a single
/// read never hands the engine more than this many bytes.
pub(crate) const SOCKS_BUF_SIZE: usize = 2048;

/// Identifies one proxied connection for the lifetime of the process.
///
/// Ids are never reused, so a stale id held by the event loop can at worst
/// name a slot that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a listening socket turns an accepted connection into.
#[derive(Debug, Clone)]
pub enum Listener {
    /// SOCKS5 endpoint; the client names the destination in-band.
    Socks,
    /// Static port-forward to a fixed destination.
    Redir { host: String, port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnKind {
    Socks,
    Redir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// Waiting for the SOCKS greeting.
    SocksAuth,
    /// Method selected; waiting for the CONNECT request.
    SocksCmd,
    /// Name resolution is in flight.
    Dns,
    /// The engine is performing the TCP handshake.
    Connecting,
    /// Bytes flow in both directions.
    Data,
    /// Torn down; the slot lives on only until pending work drains
    /// (an unanswerable resolver query, or reply bytes not yet flushed).
    Dead,
}

pub(crate) struct Connection {
    pub kind: ConnKind,
    pub state: State,

    /// Engine socket, once the TCP handshake has been initiated.
    pub handle: Option<SocketHandle>,
    /// Engine-side ephemeral port; reserved until the socket is fully closed.
    pub local_port: Option<u16>,

    pub dest_host: Option<String>,
    pub dest_addr: Option<Ipv4Addr>,
    pub dest_port: u16,

    /// In-flight resolver query. While set, the slot must not be freed.
    pub query: Option<QueryHandle>,

    sockbuf: [u8; SOCKS_BUF_SIZE],
    filled: usize,

    /// Control bytes (SOCKS replies) awaiting delivery to the local socket.
    pub local_tx: VecDeque<u8>,

    /// Set while the engine's send buffer had no room on the last attempt;
    /// suppresses local reads until room reappears.
    pub engine_blocked: bool,
}

impl Connection {
    pub(crate) fn socks() -> Self {
        Self::new(ConnKind::Socks, State::SocksAuth, None, 0)
    }

    pub(crate) fn redir(host: String, port: u16) -> Self {
        Self::new(ConnKind::Redir, State::Dns, Some(host), port)
    }

    fn new(kind: ConnKind, state: State, dest_host: Option<String>, dest_port: u16) -> Self {
        Self {
            kind,
            state,
            handle: None,
            local_port: None,
            dest_host,
            dest_addr: None,
            dest_port,
            query: None,
            sockbuf: [0u8; SOCKS_BUF_SIZE],
            filled: 0,
            local_tx: VecDeque::default(),
            engine_blocked: false,
        }
    }

    /// Appends handshake bytes; `false` if they don't fit.
    pub(crate) fn push_handshake(&mut self, bytes: &[u8]) -> bool {
        if self.filled + bytes.len() > SOCKS_BUF_SIZE {
            return false;
        }

        self.sockbuf[self.filled..self.filled + bytes.len()].copy_from_slice(bytes);
        self.filled += bytes.len();

        true
    }

    pub(crate) fn handshake(&self) -> &[u8] {
        &self.sockbuf[..self.filled]
    }

    /// Drops the first `n` handshake bytes, keeping any pipelined remainder.
    pub(crate) fn consume_handshake(&mut self, n: usize) {
        debug_assert!(n <= self.filled);

        self.sockbuf.copy_within(n..self.filled, 0);
        self.filled -= n;
    }

    /// Takes whatever the client sent beyond the handshake.
    pub(crate) fn take_handshake_remainder(&mut self) -> Vec<u8> {
        let remainder = self.sockbuf[..self.filled].to_vec();
        self.filled = 0;

        remainder
    }

    pub(crate) fn handshake_space(&self) -> usize {
        SOCKS_BUF_SIZE - self.filled
    }

    pub(crate) fn queue_local(&mut self, bytes: &[u8]) {
        self.local_tx.extend(bytes);
    }
}

/// All live connection slots, bounded by a fixed capacity.
pub(crate) struct ConnectionTable {
    slots: BTreeMap<ConnId, Connection>,
    capacity: usize,
    next_id: u64,
}

impl ConnectionTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: BTreeMap::default(),
            capacity,
            next_id: 0,
        }
    }

    /// `None` when the table is at capacity; the caller refuses the accept.
    pub(crate) fn insert(&mut self, conn: Connection) -> Option<ConnId> {
        if self.slots.len() >= self.capacity {
            return None;
        }

        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.slots.insert(id, conn);

        Some(id)
    }

    pub(crate) fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slots.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: ConnId) -> Option<Connection> {
        self.slots.remove(&id)
    }

    pub(crate) fn ids(&self) -> Vec<ConnId> {
        self.slots.keys().copied().collect()
    }

    pub(crate) fn conns_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.slots.values_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
