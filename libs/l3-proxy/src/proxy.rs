use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, bail};
use ip_packet::IpPacket;
use rand::{Rng as _, SeedableRng as _, rngs::StdRng};
use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::socket::dns::{self, GetQueryResultError};
use smoltcp::socket::tcp;
use smoltcp::storage::RingBuffer;
use smoltcp::wire::{DnsQueryType, IpAddress, IpEndpoint};

use crate::connection::{ConnId, ConnKind, Connection, ConnectionTable, Listener, SOCKS_BUF_SIZE, State};
use crate::interface::create_interface;
use crate::socks::{self, Dest, Greeting, Reply, Request};
use crate::stub_device::InMemoryDevice;
use crate::time::smol_now;

/// Per-direction ring size of one engine socket.
///
/// A full receive window per connection; inbound bytes sit here until the
/// local consumer takes them, so this also bounds how far the tunnel side can
/// run ahead of a slow local client.
const TCP_BUFFER_SIZE: usize = u16::MAX as usize;

const MIN_LOCAL_PORT: u16 = 49152;
const MAX_LOCAL_PORT: u16 = 65535;

pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the VPN concentrator assigned to us.
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mtu: usize,
    pub dns_server: Ipv4Addr,
    /// Engine-side TCP keepalive probe interval, if any.
    pub keepalive: Option<Duration>,
    pub max_connections: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// The slot is gone; the event loop should drop the local socket.
    ConnectionClosed(ConnId),
}

/// Outcome of flushing pending bytes towards a local socket.
#[derive(Debug, PartialEq, Eq)]
pub enum Flush {
    /// Everything deliverable has been delivered.
    Idle,
    /// The local socket would block; retry on write-readiness.
    Blocked,
    /// The connection is gone; drop the local socket.
    Closed,
}

/// A sans-IO user-space TCP proxy.
///
/// Local TCP clients on one side, a raw IP stream to a VPN peer on the other,
/// and an embedded TCP/IP engine in between. The proxy owns no file
/// descriptors: the event loop feeds it datagrams ([`Proxy::handle_inbound`]),
/// local bytes ([`Proxy::handle_local_input`]) and time
/// ([`Proxy::handle_timeout`]), and drains datagrams
/// ([`Proxy::poll_outbound`]), local bytes ([`Proxy::flush_local`]) and
/// events ([`Proxy::poll_event`]).
///
/// Everything runs on the caller's single thread; a callback that cannot make
/// progress records back-pressure state and returns instead of blocking.
pub struct Proxy {
    device: InMemoryDevice,
    interface: Interface,
    sockets: SocketSet<'static>,
    dns_handle: SocketHandle,

    table: ConnectionTable,
    /// Engine sockets still finishing their close handshake, with the
    /// ephemeral port each one keeps reserved.
    draining: Vec<(SocketHandle, Option<u16>)>,
    used_ports: HashSet<u16>,

    events: VecDeque<Event>,

    ip: Ipv4Addr,
    keepalive: Option<Duration>,

    rng: StdRng,
    created_at: Instant,
    last_now: Instant,
}

impl Proxy {
    pub fn new(config: Config, now: Instant, seed: [u8; 32]) -> Self {
        let mut device = InMemoryDevice::new(config.mtu);
        let interface = create_interface(
            &mut device,
            config.ip,
            config.netmask,
            config.gateway,
            smol_now(now, now),
        );

        let mut sockets = SocketSet::new(Vec::default());
        let dns_handle = sockets.add(dns::Socket::new(
            &[IpAddress::from(config.dns_server)],
            vec![],
        ));

        tracing::info!(
            ip = %config.ip,
            gateway = %config.gateway,
            dns = %config.dns_server,
            mtu = %config.mtu,
            "Interface up"
        );

        Self {
            device,
            interface,
            sockets,
            dns_handle,
            table: ConnectionTable::new(config.max_connections),
            draining: Vec::default(),
            used_ports: HashSet::default(),
            events: VecDeque::default(),
            ip: config.ip,
            keepalive: config.keepalive,
            rng: StdRng::from_seed(seed),
            created_at: now,
            last_now: now,
        }
    }

    /// Registers a connection just accepted on a local listener.
    ///
    /// `None` means the table is full and the caller must close the socket.
    pub fn accept_local(&mut self, listener: Listener) -> Option<ConnId> {
        let conn = match &listener {
            Listener::Socks => Connection::socks(),
            Listener::Redir { host, port } => Connection::redir(host.clone(), *port),
        };
        let is_redir = matches!(listener, Listener::Redir { .. });

        let id = self.table.insert(conn)?;

        tracing::debug!(%id, "New local connection");

        if is_redir {
            self.start_resolution(id);
        }

        Some(id)
    }

    /// How many bytes the event loop may read from the local socket.
    ///
    /// Zero means "do not read" — either the slot is not in a byte-accepting
    /// state, or the engine's send buffer is full. In the latter case the
    /// back-pressure flag is set and cleared again once the peer acknowledges
    /// data; arming read-readiness despite a zero budget would spin the loop.
    pub fn read_budget(&mut self, id: ConnId) -> usize {
        let Some(conn) = self.table.get_mut(id) else {
            return 0;
        };

        match conn.state {
            State::SocksAuth | State::SocksCmd => conn.handshake_space(),
            State::Data => {
                if conn.engine_blocked {
                    return 0;
                }

                let handle = conn.handle.expect("data state always has an engine socket");
                let socket = self.sockets.get::<tcp::Socket>(handle);
                let budget = (socket.send_capacity() - socket.send_queue()).min(SOCKS_BUF_SIZE);

                if budget == 0 {
                    conn.engine_blocked = true;
                }

                budget
            }
            State::Dns | State::Connecting | State::Dead => 0,
        }
    }

    /// Hands the proxy bytes read from the local socket.
    ///
    /// The caller must not exceed the budget reported by
    /// [`Proxy::read_budget`]; within it, the engine accepts every byte.
    pub fn handle_local_input(&mut self, id: ConnId, bytes: &[u8]) {
        let Some(conn) = self.table.get_mut(id) else {
            return;
        };

        match conn.state {
            State::SocksAuth | State::SocksCmd => {
                if !conn.push_handshake(bytes) {
                    tracing::debug!(%id, "SOCKS handshake exceeds buffer");
                    self.destroy(id);
                    return;
                }

                self.advance_handshake(id);
            }
            State::Data => {
                let handle = conn.handle.expect("data state always has an engine socket");
                let socket = self.sockets.get_mut::<tcp::Socket>(handle);

                match socket.send_slice(bytes) {
                    Ok(accepted) => {
                        debug_assert_eq!(
                            accepted,
                            bytes.len(),
                            "caller must respect the read budget"
                        );

                        if accepted < bytes.len() {
                            tracing::warn!(
                                %id,
                                accepted,
                                len = bytes.len(),
                                "Engine accepted fewer bytes than budgeted; dropping the rest"
                            );
                        }
                    }
                    Err(tcp::SendError::InvalidState) => {
                        tracing::debug!(%id, "Engine connection is gone");
                        self.destroy(id);
                    }
                }
            }
            State::Dns | State::Connecting | State::Dead => {
                debug_assert!(bytes.is_empty(), "caller must respect the read budget");
            }
        }
    }

    /// The local peer closed its socket (EOF or error).
    pub fn handle_local_closed(&mut self, id: ConnId) {
        tracing::debug!(%id, "Local socket closed");

        self.destroy(id);
    }

    /// Delivers pending bytes (SOCKS replies, then tunnel data) to the local
    /// socket via `write`.
    ///
    /// `write` reports how many bytes it accepted; only those are consumed
    /// from the engine's receive buffer — and thereby acknowledged to the
    /// tunnel side — so a short write redelivers the remainder later and no
    /// byte is ever written twice.
    pub fn flush_local(
        &mut self,
        id: ConnId,
        write: &mut dyn FnMut(&[u8]) -> io::Result<usize>,
    ) -> Flush {
        loop {
            let Some(conn) = self.table.get_mut(id) else {
                return Flush::Closed;
            };

            if conn.local_tx.is_empty() {
                break;
            }

            let (front, _) = conn.local_tx.as_slices();
            match write(front) {
                Ok(0) => {
                    self.destroy(id);
                    return Flush::Closed;
                }
                Ok(n) => {
                    conn.local_tx.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flush::Blocked,
                Err(e) => {
                    tracing::debug!(%id, "Local write failed: {e}");
                    self.destroy(id);
                    return Flush::Closed;
                }
            }
        }

        let Some(conn) = self.table.get(id) else {
            return Flush::Closed;
        };

        match conn.state {
            State::Dead => {
                // Any goodbye reply has drained; tear the slot down for real.
                self.destroy(id);

                Flush::Closed
            }
            State::Data => self.flush_engine_rx(id, write),
            State::SocksAuth | State::SocksCmd | State::Dns | State::Connecting => Flush::Idle,
        }
    }

    /// Feeds one datagram from the tunnel into the engine.
    pub fn handle_inbound(&mut self, packet: IpPacket) {
        self.device.receive(packet);
    }

    /// Datagrams the engine wants on the tunnel.
    pub fn poll_outbound(&mut self) -> Option<IpPacket> {
        self.device.next_send()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Inform the proxy that time advanced.
    ///
    /// Typical for a sans-IO design, `handle_timeout` works through all local
    /// buffers and processes them as much as possible: it runs the engine
    /// (TCP timers, resolver retransmissions), completes name resolutions and
    /// connection attempts, releases back-pressure and reaps closed sockets.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.last_now = now;

        let _ = self.interface.poll(
            smol_now(self.created_at, now),
            &mut self.device,
            &mut self.sockets,
        );

        self.drive_dns();
        self.drive_connecting();
        self.release_backpressure();
        self.reap_draining();
    }

    /// When [`Proxy::handle_timeout`] wants to be called, engine-internal
    /// timers (retransmits, keepalive, resolver retries) included.
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        let now = smol_now(self.created_at, self.last_now);

        let poll_in = self.interface.poll_delay(now, &self.sockets)?;

        Some(self.last_now + Duration::from(poll_in))
    }

    pub fn num_connections(&self) -> usize {
        self.table.len()
    }

    fn advance_handshake(&mut self, id: ConnId) {
        loop {
            let Some(conn) = self.table.get_mut(id) else {
                return;
            };

            match conn.state {
                State::SocksAuth => match socks::parse_greeting(conn.handshake()) {
                    Greeting::Incomplete => return,
                    Greeting::Malformed => {
                        tracing::debug!(%id, "Malformed SOCKS greeting");
                        self.destroy(id);
                        return;
                    }
                    Greeting::Ok { consumed } => {
                        conn.consume_handshake(consumed);
                        conn.queue_local(&socks::METHOD_SELECT);
                        conn.state = State::SocksCmd;

                        // The client may have pipelined the request; try it now.
                    }
                },
                State::SocksCmd => {
                    match socks::parse_request(conn.handshake()) {
                        Request::Incomplete => {}
                        Request::Malformed => {
                            tracing::debug!(%id, "Malformed SOCKS request");
                            self.destroy(id);
                        }
                        Request::UnsupportedCommand => {
                            self.reject(id, Reply::CommandNotSupported);
                        }
                        Request::UnsupportedAddressType => {
                            self.reject(id, Reply::AddressTypeNotSupported);
                        }
                        Request::Connect {
                            dest,
                            port,
                            consumed,
                        } => {
                            conn.consume_handshake(consumed);
                            conn.dest_port = port;

                            match dest {
                                Dest::Ip(addr) => {
                                    conn.dest_addr = Some(addr);
                                    self.start_connection(id);
                                }
                                Dest::Name(name) => {
                                    conn.dest_host = Some(name);
                                    self.start_resolution(id);
                                }
                            }
                        }
                    }

                    return;
                }
                State::Dns | State::Connecting | State::Data | State::Dead => return,
            }
        }
    }

    /// Resolves the slot's destination name, connecting immediately for IP
    /// literals (nothing to look up).
    fn start_resolution(&mut self, id: ConnId) {
        let Some(conn) = self.table.get_mut(id) else {
            return;
        };
        let name = conn
            .dest_host
            .clone()
            .expect("resolution requires a destination name");

        if let Ok(addr) = name.parse::<Ipv4Addr>() {
            conn.dest_addr = Some(addr);
            self.start_connection(id);
            return;
        }

        conn.state = State::Dns;

        let result = self
            .sockets
            .get_mut::<dns::Socket>(self.dns_handle)
            .start_query(self.interface.context(), &name, DnsQueryType::A);

        match result {
            Ok(query) => {
                tracing::debug!(%id, %name, "Resolving");

                let conn = self.table.get_mut(id).expect("slot exists");
                conn.query = Some(query);
            }
            Err(e) => {
                tracing::warn!(%id, %name, "Failed to start name resolution: {e}");
                self.fail_resolution(id);
            }
        }
    }

    /// Initiates the engine-side TCP handshake towards the resolved address.
    fn start_connection(&mut self, id: ConnId) {
        if let Err(e) = self.try_connect(id) {
            tracing::warn!(%id, "Failed to connect: {e:#}");
            self.fail_connect(id);
        }
    }

    fn try_connect(&mut self, id: ConnId) -> Result<()> {
        let Some(conn) = self.table.get(id) else {
            return Ok(());
        };
        let addr = conn.dest_addr.context("no resolved destination address")?;
        let port = conn.dest_port;

        let local_port = self.sample_unique_port()?;

        let mut socket = tcp::Socket::new(
            RingBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
            RingBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
        );
        socket.set_nagle_enabled(false);

        if let Some(interval) = self.keepalive {
            socket.set_keep_alive(Some(interval.into()));
            // Give up after the conventional nine missed probes.
            socket.set_timeout(Some((interval * 10).into()));
        }

        socket
            .connect(
                self.interface.context(),
                (IpAddress::from(addr), port),
                IpEndpoint::new(self.ip.into(), local_port),
            )
            .context("Failed to initiate connection")?;

        let handle = self.sockets.add(socket);
        self.used_ports.insert(local_port);

        let conn = self.table.get_mut(id).expect("slot exists");
        conn.handle = Some(handle);
        conn.local_port = Some(local_port);
        conn.state = State::Connecting;

        tracing::debug!(%id, remote = %format_args!("{addr}:{port}"), "Connecting");

        Ok(())
    }

    fn flush_engine_rx(
        &mut self,
        id: ConnId,
        write: &mut dyn FnMut(&[u8]) -> io::Result<usize>,
    ) -> Flush {
        let Some(conn) = self.table.get(id) else {
            return Flush::Closed;
        };
        let handle = conn.handle.expect("data state always has an engine socket");

        loop {
            let socket = self.sockets.get_mut::<tcp::Socket>(handle);

            if !socket.can_recv() {
                if socket.may_recv() {
                    return Flush::Idle;
                }

                // Receive half closed and everything delivered.
                tracing::debug!(%id, "Remote closed");
                self.destroy(id);
                return Flush::Closed;
            }

            let result = socket.recv(|buf| match write(buf) {
                Ok(n) => (n, Ok(n)),
                Err(e) => (0, Err(e)),
            });

            match result {
                Ok(Ok(0)) => {
                    // A zero-byte write of a non-empty buffer: writer is gone.
                    self.destroy(id);
                    return Flush::Closed;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => return Flush::Blocked,
                Ok(Err(e)) => {
                    tracing::debug!(%id, "Local write failed: {e}");
                    self.destroy(id);
                    return Flush::Closed;
                }
                Err(tcp::RecvError::Finished) => {
                    tracing::debug!(%id, "Remote closed");
                    self.destroy(id);
                    return Flush::Closed;
                }
                Err(tcp::RecvError::InvalidState) => {
                    tracing::debug!(%id, "Connection reset");
                    self.destroy(id);
                    return Flush::Closed;
                }
            }
        }
    }

    fn drive_dns(&mut self) {
        for id in self.table.ids() {
            enum Outcome {
                ZombieDone,
                Resolved(Ipv4Addr),
                NoAddress,
                Failed,
            }

            let outcome = {
                let Some(conn) = self.table.get_mut(id) else {
                    continue;
                };
                let Some(query) = conn.query else {
                    continue;
                };

                let result = self
                    .sockets
                    .get_mut::<dns::Socket>(self.dns_handle)
                    .get_query_result(query);

                match result {
                    Err(GetQueryResultError::Pending) => continue,
                    Ok(addrs) => {
                        conn.query = None;

                        if conn.state == State::Dead {
                            Outcome::ZombieDone
                        } else {
                            match addrs.iter().find_map(|a| ipv4_of(*a)) {
                                Some(addr) => Outcome::Resolved(addr),
                                None => Outcome::NoAddress,
                            }
                        }
                    }
                    Err(GetQueryResultError::Failed) => {
                        conn.query = None;

                        if conn.state == State::Dead {
                            Outcome::ZombieDone
                        } else {
                            Outcome::Failed
                        }
                    }
                }
            };

            match outcome {
                Outcome::ZombieDone => {
                    // The slot only lived on for this answer.
                    self.destroy(id);
                }
                Outcome::Resolved(addr) => {
                    let conn = self.table.get_mut(id).expect("slot exists");
                    conn.dest_addr = Some(addr);

                    tracing::debug!(%id, %addr, "Resolved");

                    self.start_connection(id);
                }
                Outcome::NoAddress | Outcome::Failed => {
                    tracing::debug!(%id, "Name resolution failed");
                    self.fail_resolution(id);
                }
            }
        }
    }

    fn drive_connecting(&mut self) {
        for id in self.table.ids() {
            let Some(conn) = self.table.get(id) else {
                continue;
            };

            if conn.state != State::Connecting {
                continue;
            }

            let handle = conn.handle.expect("connecting state always has an engine socket");
            let socket = self.sockets.get::<tcp::Socket>(handle);

            if socket.may_send() {
                self.handle_established(id);
            } else if socket.state() == tcp::State::Closed {
                tracing::debug!(%id, "Connection attempt failed");
                self.fail_connect(id);
            }
        }
    }

    fn handle_established(&mut self, id: ConnId) {
        let Some(conn) = self.table.get_mut(id) else {
            return;
        };
        let handle = conn.handle.expect("connecting state always has an engine socket");
        let socket = self.sockets.get::<tcp::Socket>(handle);

        tracing::debug!(%id, "Connected");

        if conn.kind == ConnKind::Socks {
            let bind = socket
                .local_endpoint()
                .and_then(|ep| Some((ipv4_of(ep.addr)?, ep.port)));

            conn.queue_local(&socks::reply(Reply::Succeeded, bind));
        }

        conn.state = State::Data;

        // Anything the client pipelined behind the handshake goes out first.
        let early_data = conn.take_handshake_remainder();
        if !early_data.is_empty() {
            self.handle_local_input(id, &early_data);
        }
    }

    /// Clears back-pressure for slots whose engine socket has room again;
    /// the event loop then resumes reading from the local socket.
    fn release_backpressure(&mut self) {
        for conn in self.table.conns_mut() {
            if conn.state != State::Data || !conn.engine_blocked {
                continue;
            }

            let handle = conn.handle.expect("data state always has an engine socket");
            let socket = self.sockets.get::<tcp::Socket>(handle);

            if socket.send_capacity() > socket.send_queue() {
                conn.engine_blocked = false;
            }
        }
    }

    /// Removes engine sockets whose close handshake has finished and returns
    /// their ephemeral ports to the pool.
    fn reap_draining(&mut self) {
        let mut i = 0;
        while i < self.draining.len() {
            let (handle, port) = self.draining[i];

            if self.sockets.get::<tcp::Socket>(handle).state() == tcp::State::Closed {
                self.sockets.remove(handle);
                if let Some(port) = port {
                    self.used_ports.remove(&port);
                }
                self.draining.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn fail_resolution(&mut self, id: ConnId) {
        let Some(conn) = self.table.get(id) else {
            return;
        };

        match conn.kind {
            ConnKind::Socks => self.reject(id, Reply::HostUnreachable),
            ConnKind::Redir => self.destroy(id),
        }
    }

    fn fail_connect(&mut self, id: ConnId) {
        let Some(conn) = self.table.get(id) else {
            return;
        };

        match conn.kind {
            ConnKind::Socks => self.reject(id, Reply::ConnectionRefused),
            ConnKind::Redir => self.destroy(id),
        }
    }

    /// Queues a failure reply and marks the slot dead; the actual teardown
    /// happens once the reply has drained to the local socket.
    fn reject(&mut self, id: ConnId, code: Reply) {
        let Some(conn) = self.table.get_mut(id) else {
            return;
        };

        tracing::debug!(%id, ?code, "Rejecting");

        conn.queue_local(&socks::reply(code, None));
        conn.state = State::Dead;

        if let Some(handle) = conn.handle.take() {
            let port = conn.local_port.take();
            self.release_engine_socket(handle, port);
        }
    }

    /// Tears the slot down.
    ///
    /// A slot with a resolver query in flight is only marked dead: the query
    /// cannot be abandoned without risking a handle mix-up, so the slot stays
    /// as a zombie until [`Proxy::drive_dns`] sees the answer and frees it —
    /// exactly once.
    fn destroy(&mut self, id: ConnId) {
        let Some(conn) = self.table.get_mut(id) else {
            return;
        };

        if conn.query.is_some() {
            conn.state = State::Dead;
            conn.local_tx.clear();
            return;
        }

        let conn = self.table.remove(id).expect("slot exists");

        if let Some(handle) = conn.handle {
            self.release_engine_socket(handle, conn.local_port);
        }

        tracing::debug!(%id, "Destroyed");

        self.events.push_back(Event::ConnectionClosed(id));
    }

    /// Closes an engine socket gracefully, keeping it around (port reserved)
    /// until the close handshake finishes.
    fn release_engine_socket(&mut self, handle: SocketHandle, port: Option<u16>) {
        let socket = self.sockets.get_mut::<tcp::Socket>(handle);
        socket.close();

        if socket.state() == tcp::State::Closed {
            self.sockets.remove(handle);
            if let Some(port) = port {
                self.used_ports.remove(&port);
            }
        } else {
            self.draining.push((handle, port));
        }
    }

    fn sample_unique_port(&mut self) -> Result<u16> {
        let range = MIN_LOCAL_PORT..=MAX_LOCAL_PORT;

        if self.used_ports.len() == range.len() {
            bail!("All ephemeral ports are in use")
        }

        loop {
            let port = self.rng.gen_range(range.clone());

            if !self.used_ports.contains(&port) {
                return Ok(port);
            }
        }
    }
}

#[allow(unreachable_patterns, clippy::wildcard_enum_match_arm)] // Exhaustive only for the protocols compiled in.
fn ipv4_of(addr: IpAddress) -> Option<Ipv4Addr> {
    match addr {
        IpAddress::Ipv4(addr) => Some(addr),
        _ => None,
    }
}
