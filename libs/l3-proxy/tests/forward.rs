use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use ip_packet::{IpPacket, IpPacketBuf, PacketBuilder};
use l3_proxy::{Config, Event, Flush, Listener, Proxy};

const PROXY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
const DNS_SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 53);
const HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

#[test]
fn socks_connect_ipv4_end_to_end() {
    let mut net = TestNet::new(HOST_IP, 80);
    let id = net.proxy.accept_local(Listener::Socks).unwrap();

    net.input(id, &[0x05, 0x01, 0x00]);
    assert_eq!(net.flush(id), vec![0x05, 0x00]);

    net.input(id, &[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 5, 0x00, 0x50]);
    net.progress();

    let reply = net.flush(id);
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&reply[4..8], &PROXY_IP.octets());
    assert_eq!(reply.len(), 10);

    net.input(id, b"GET /\r\n");
    net.progress();
    assert_eq!(net.host.take_received(), b"GET /\r\n");

    net.host.send(b"HTTP/1.0 200\r\n");
    net.progress();
    assert_eq!(net.flush(id), b"HTTP/1.0 200\r\n");

    net.host.close();
    net.progress();
    assert_eq!(net.flush_outcome(id), Flush::Closed);
    assert_eq!(net.proxy.poll_event(), Some(Event::ConnectionClosed(id)));

    net.progress();
    assert_eq!(net.proxy.num_connections(), 0);
}

#[test]
fn socks_connect_domain_resolves_over_tunnel() {
    let remote = Ipv4Addr::new(93, 184, 216, 34);
    let mut net = TestNet::new(remote, 80);
    let id = net.proxy.accept_local(Listener::Socks).unwrap();

    net.input(id, &[0x05, 0x01, 0x00]);
    assert_eq!(net.flush(id), vec![0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
    request.extend(b"example.com");
    request.extend([0x00, 0x50]);
    net.input(id, &request);

    net.progress();

    let reply = net.flush(id);
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

    net.input(id, b"ping");
    net.progress();
    assert_eq!(net.host.take_received(), b"ping");
}

#[test]
fn socks_greeting_and_request_in_one_segment() {
    let mut net = TestNet::new(HOST_IP, 80);
    let id = net.proxy.accept_local(Listener::Socks).unwrap();

    let mut bytes = vec![0x05, 0x01, 0x00];
    bytes.extend([0x05, 0x01, 0x00, 0x01, 10, 0, 0, 5, 0x00, 0x50]);
    net.input(id, &bytes);
    net.progress();

    let flushed = net.flush(id);
    assert_eq!(&flushed[..2], &[0x05, 0x00]);
    assert_eq!(&flushed[2..6], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(flushed.len(), 12);
}

#[test]
fn socks_greeting_one_byte_at_a_time() {
    let mut net = TestNet::new(HOST_IP, 80);
    let id = net.proxy.accept_local(Listener::Socks).unwrap();

    for byte in [0x05, 0x01, 0x00] {
        net.input(id, &[byte]);
    }

    assert_eq!(net.flush(id), vec![0x05, 0x00]);
}

#[test]
fn malformed_greeting_closes_without_reply() {
    let mut net = TestNet::new(HOST_IP, 80);
    let id = net.proxy.accept_local(Listener::Socks).unwrap();

    net.input(id, &[0x04, 0x01]);

    assert_eq!(net.proxy.poll_event(), Some(Event::ConnectionClosed(id)));
    assert_eq!(net.flush_outcome(id), Flush::Closed);
}

#[test]
fn unsupported_command_is_rejected_with_reply() {
    let mut net = TestNet::new(HOST_IP, 80);
    let id = net.proxy.accept_local(Listener::Socks).unwrap();

    net.input(id, &[0x05, 0x01, 0x00]);
    net.input(id, &[0x05, 0x02, 0x00, 0x01, 10, 0, 0, 5, 0x00, 0x50]);

    let flushed = net.flush_until_closed(id);
    assert_eq!(&flushed[..2], &[0x05, 0x00]);
    assert_eq!(flushed[2..4], [0x05, 0x07]);
}

#[test]
fn unsupported_address_type_is_rejected_with_reply() {
    let mut net = TestNet::new(HOST_IP, 80);
    let id = net.proxy.accept_local(Listener::Socks).unwrap();

    net.input(id, &[0x05, 0x01, 0x00]);
    net.input(id, &[0x05, 0x01, 0x00, 0x04]);

    let flushed = net.flush_until_closed(id);
    assert_eq!(flushed[2..4], [0x05, 0x08]);
}

#[test]
fn connect_refused_replies_and_frees_the_slot() {
    // The host only listens on port 80; port 81 draws a reset.
    let mut net = TestNet::new(HOST_IP, 80);
    let id = net.proxy.accept_local(Listener::Socks).unwrap();

    net.input(id, &[0x05, 0x01, 0x00]);
    net.input(id, &[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 5, 0x00, 0x51]);
    net.progress();

    let flushed = net.flush_until_closed(id);
    assert_eq!(&flushed[2..], &[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    assert_eq!(net.proxy.num_connections(), 0);
}

#[test]
fn failed_resolution_replies_host_unreachable() {
    let mut net = TestNet::new(HOST_IP, 80);
    net.host.refuse_dns = true;
    let id = net.proxy.accept_local(Listener::Socks).unwrap();

    net.input(id, &[0x05, 0x01, 0x00]);
    let mut request = vec![0x05, 0x01, 0x00, 0x03, 7];
    request.extend(b"no.such");
    request.extend([0x00, 0x50]);
    net.input(id, &request);
    net.progress();

    let flushed = net.flush_until_closed(id);
    assert_eq!(flushed[2..4], [0x05, 0x04]);
}

#[test]
fn redir_forwards_transparently() {
    let mut net = TestNet::new(HOST_IP, 80);
    let id = net
        .proxy
        .accept_local(Listener::Redir {
            host: "10.0.0.5".to_owned(),
            port: 80,
        })
        .unwrap();

    net.progress();

    // No SOCKS framing in either direction.
    assert_eq!(net.flush(id), Vec::<u8>::new());

    net.input(id, b"hello");
    net.progress();
    assert_eq!(net.host.take_received(), b"hello");

    net.host.send(b"world");
    net.progress();
    assert_eq!(net.flush(id), b"world");
}

#[test]
fn redir_resolves_name_before_connecting() {
    let mut net = TestNet::new(HOST_IP, 8080);
    let id = net
        .proxy
        .accept_local(Listener::Redir {
            host: "internal.host".to_owned(),
            port: 8080,
        })
        .unwrap();

    net.progress();

    net.input(id, b"payload");
    net.progress();
    assert_eq!(net.host.take_received(), b"payload");
}

#[test]
fn redir_with_unresolvable_name_is_destroyed_silently() {
    let mut net = TestNet::new(HOST_IP, 80);
    net.host.refuse_dns = true;
    let id = net
        .proxy
        .accept_local(Listener::Redir {
            host: "no.such".to_owned(),
            port: 80,
        })
        .unwrap();

    net.progress();

    assert_eq!(net.proxy.poll_event(), Some(Event::ConnectionClosed(id)));
    assert_eq!(net.proxy.num_connections(), 0);
}

#[test]
fn table_capacity_bounds_live_connections() {
    let mut net = TestNet::with_capacity(HOST_IP, 80, 2);

    assert!(net.proxy.accept_local(Listener::Socks).is_some());
    assert!(net.proxy.accept_local(Listener::Socks).is_some());
    assert!(net.proxy.accept_local(Listener::Socks).is_none());
}

#[test]
fn zero_send_room_blocks_local_reads_until_acked() {
    let mut net = TestNet::new(HOST_IP, 80);
    let id = net.connect_socks(&[10, 0, 0, 5], 80);

    // Stuff the engine's send buffer without letting the peer acknowledge.
    let chunk = [0u8; 2048];
    let mut submitted = 0;
    loop {
        let budget = net.proxy.read_budget(id);
        if budget == 0 {
            break;
        }

        net.proxy.handle_local_input(id, &chunk[..budget.min(chunk.len())]);
        submitted += budget.min(chunk.len());

        assert!(submitted < 1024 * 1024, "send buffer never filled up");
    }

    // Blocked stays blocked until the peer acknowledges data.
    assert_eq!(net.proxy.read_budget(id), 0);

    net.progress();

    assert!(net.proxy.read_budget(id) > 0);
    assert_eq!(net.host.take_received().len(), submitted);
}

#[test]
fn short_local_writes_redeliver_remainder_exactly_once() {
    let mut net = TestNet::new(HOST_IP, 80);
    let id = net.connect_socks(&[10, 0, 0, 5], 80);

    let payload = (0..16 * 1024).map(|i| i as u8).collect::<Vec<_>>();
    net.host.send(&payload);
    net.progress();

    let mut collected = Vec::new();
    loop {
        // The local socket only takes a kilobyte per readiness round.
        let mut quota = 1000usize;
        let outcome = net.proxy.flush_local(id, &mut |buf: &[u8]| {
            if quota == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }

            let n = quota.min(buf.len());
            collected.extend_from_slice(&buf[..n]);
            quota -= n;

            Ok(n)
        });

        net.progress();

        if collected.len() == payload.len() && outcome == Flush::Idle {
            break;
        }
    }

    assert_eq!(collected, payload);
}

#[test]
fn slot_dead_during_resolution_is_freed_exactly_once() {
    let mut net = TestNet::new(HOST_IP, 80);
    let id = net.proxy.accept_local(Listener::Socks).unwrap();

    net.input(id, &[0x05, 0x01, 0x00]);
    let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
    request.extend(b"example.com");
    request.extend([0x00, 0x50]);
    net.input(id, &request);

    // Let the query go out but hold the answer back.
    net.host.hold_dns = true;
    net.progress();

    net.proxy.handle_local_closed(id);

    // The slot lives on until the resolver answers.
    assert_eq!(net.proxy.poll_event(), None);
    assert_eq!(net.proxy.num_connections(), 1);

    net.host.hold_dns = false;
    net.host.release_dns();
    net.progress();

    assert_eq!(net.proxy.poll_event(), Some(Event::ConnectionClosed(id)));
    assert_eq!(net.proxy.poll_event(), None);
    assert_eq!(net.proxy.num_connections(), 0);
}

/// A proxy wired up to a scripted remote host, packets pumped in-memory.
struct TestNet {
    proxy: Proxy,
    host: FakeHost,
    now: Instant,
}

impl TestNet {
    fn new(host_ip: Ipv4Addr, host_port: u16) -> Self {
        Self::with_capacity(host_ip, host_port, l3_proxy::DEFAULT_MAX_CONNECTIONS)
    }

    fn with_capacity(host_ip: Ipv4Addr, host_port: u16, max_connections: usize) -> Self {
        let now = Instant::now();

        let proxy = Proxy::new(
            Config {
                ip: PROXY_IP,
                netmask: NETMASK,
                gateway: GATEWAY,
                mtu: 1400,
                dns_server: DNS_SERVER,
                keepalive: None,
                max_connections,
            },
            now,
            [0u8; 32],
        );

        Self {
            proxy,
            host: FakeHost::new(host_ip, host_port, now),
            now,
        }
    }

    /// Feeds bytes from the local client, respecting the read budget.
    fn input(&mut self, id: l3_proxy::ConnId, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let budget = self.proxy.read_budget(id);
            assert!(budget > 0, "no read budget for {id}");

            let n = budget.min(bytes.len());
            self.proxy.handle_local_input(id, &bytes[..n]);
            bytes = &bytes[n..];
        }
    }

    /// Drains everything the proxy has for the local socket.
    fn flush(&mut self, id: l3_proxy::ConnId) -> Vec<u8> {
        let mut out = Vec::new();
        let _ = self.proxy.flush_local(id, &mut |buf: &[u8]| {
            out.extend_from_slice(buf);
            Ok(buf.len())
        });

        out
    }

    fn flush_outcome(&mut self, id: l3_proxy::ConnId) -> Flush {
        self.proxy
            .flush_local(id, &mut |buf: &[u8]| Ok(buf.len()))
    }

    /// Flushes until the slot is gone, returning everything delivered.
    fn flush_until_closed(&mut self, id: l3_proxy::ConnId) -> Vec<u8> {
        let mut out = Vec::new();

        for _ in 0..100 {
            let outcome = self.proxy.flush_local(id, &mut |buf: &[u8]| {
                out.extend_from_slice(buf);
                Ok(buf.len())
            });

            if outcome == Flush::Closed {
                return out;
            }

            self.progress();
        }

        panic!("connection never closed");
    }

    /// Runs a complete SOCKS handshake to `addr:port` and returns the slot.
    fn connect_socks(&mut self, addr: &[u8; 4], port: u16) -> l3_proxy::ConnId {
        let id = self.proxy.accept_local(Listener::Socks).unwrap();

        self.input(id, &[0x05, 0x01, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend(addr);
        request.extend(port.to_be_bytes());
        self.input(id, &request);

        self.progress();

        let reply = self.flush(id);
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

        id
    }

    /// Pumps packets between proxy and host until the network is quiet.
    ///
    /// Bounded so that a deliberately unanswered query (see the zombie test)
    /// doesn't keep the pump alive until the resolver gives up internally.
    fn progress(&mut self) {
        for _ in 0..50 {
            let mut advanced = false;

            while let Some(packet) = self.proxy.poll_outbound() {
                self.host.handle_inbound(packet);
                advanced = true;
            }

            while let Some(packet) = self.host.poll_outbound() {
                self.proxy.handle_inbound(packet);
                advanced = true;
            }

            self.now += Duration::from_millis(25);
            self.proxy.handle_timeout(self.now);
            self.host.handle_timeout(self.now);

            if !advanced {
                break;
            }
        }
    }
}

/// The VPN side of the tunnel: one TCP server plus the DNS resolver,
/// implemented on its own in-memory network stack.
struct FakeHost {
    device: Pipe,
    interface: smoltcp::iface::Interface,
    sockets: smoltcp::iface::SocketSet<'static>,
    received: Vec<u8>,
    /// Answer all names with NXDOMAIN.
    refuse_dns: bool,
    /// Park DNS queries instead of answering.
    hold_dns: bool,
    held_dns: VecDeque<IpPacket>,
    addr: Ipv4Addr,
    created_at: Instant,
}

impl FakeHost {
    fn new(addr: Ipv4Addr, port: u16, now: Instant) -> Self {
        use smoltcp::iface::{Config, Interface};
        use smoltcp::wire::{HardwareAddress, IpCidr};

        let mut device = Pipe::default();

        let mut interface = Interface::new(
            Config::new(HardwareAddress::Ip),
            &mut device,
            smoltcp::time::Instant::from_millis(0),
        );
        interface.set_any_ip(true);
        interface.update_ip_addrs(|ips| {
            ips.push(IpCidr::new(HOST_IP.into(), 24)).unwrap();
        });
        interface
            .routes_mut()
            .add_default_ipv4_route(PROXY_IP)
            .unwrap();

        let mut sockets = smoltcp::iface::SocketSet::new(Vec::default());
        for _ in 0..4 {
            let mut socket = smoltcp::socket::tcp::Socket::new(
                smoltcp::storage::RingBuffer::new(vec![0u8; 65535]),
                smoltcp::storage::RingBuffer::new(vec![0u8; 65535]),
            );
            socket
                .listen(smoltcp::wire::IpListenEndpoint {
                    addr: Some(addr.into()),
                    port,
                })
                .unwrap();
            sockets.add(socket);
        }

        Self {
            device,
            interface,
            sockets,
            received: Vec::default(),
            refuse_dns: false,
            hold_dns: false,
            held_dns: VecDeque::default(),
            addr,
            created_at: now,
        }
    }

    fn handle_inbound(&mut self, packet: IpPacket) {
        if let Some(udp) = packet.as_udp() {
            if udp.destination_port() == 53 {
                if self.hold_dns {
                    self.held_dns.push_back(packet);
                } else {
                    let response = self.answer_dns(&packet);
                    self.device.outbound.push_back(response);
                }

                return;
            }
        }

        self.device.inbound.push_back(packet);
    }

    fn release_dns(&mut self) {
        while let Some(packet) = self.held_dns.pop_front() {
            let response = self.answer_dns(&packet);
            self.device.outbound.push_back(response);
        }
    }

    fn poll_outbound(&mut self) -> Option<IpPacket> {
        self.device.outbound.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) {
        let millis = now.duration_since(self.created_at).as_millis();
        self.interface.poll(
            smoltcp::time::Instant::from_millis(millis as i64),
            &mut self.device,
            &mut self.sockets,
        );

        for (_, socket) in self.sockets.iter_mut() {
            let smoltcp::socket::Socket::Tcp(socket) = socket else {
                continue;
            };

            while socket.can_recv() {
                socket
                    .recv(|buf| {
                        self.received.extend_from_slice(buf);
                        (buf.len(), ())
                    })
                    .unwrap();
            }
        }
    }

    fn take_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.received)
    }

    fn send(&mut self, bytes: &[u8]) {
        for (_, socket) in self.sockets.iter_mut() {
            let smoltcp::socket::Socket::Tcp(socket) = socket else {
                continue;
            };

            if socket.may_send() {
                let sent = socket.send_slice(bytes).unwrap();
                assert_eq!(sent, bytes.len());
                return;
            }
        }

        panic!("no established socket to send on");
    }

    fn close(&mut self) {
        for (_, socket) in self.sockets.iter_mut() {
            let smoltcp::socket::Socket::Tcp(socket) = socket else {
                continue;
            };

            socket.close();
        }
    }

    /// Synthesizes an A answer (or NXDOMAIN) for the query in `packet`.
    fn answer_dns(&self, packet: &IpPacket) -> IpPacket {
        let udp = packet.as_udp().expect("DNS query is UDP");
        let query = udp.payload();

        let question_end = {
            let mut i = 12;
            while query[i] != 0 {
                i += 1 + usize::from(query[i]);
            }
            i + 1 + 4
        };

        let mut response = Vec::new();
        response.extend(&query[..2]); // ID
        if self.refuse_dns {
            response.extend([0x81, 0x83, 0, 1, 0, 0, 0, 0, 0, 0]); // NXDOMAIN
            response.extend(&query[12..question_end]);
        } else {
            response.extend([0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0]);
            response.extend(&query[12..question_end]);
            response.extend([0xc0, 0x0c]); // name: pointer to the question
            response.extend([0, 1, 0, 1]); // TYPE A, CLASS IN
            response.extend([0, 0, 0, 60]); // TTL
            response.extend([0, 4]);
            response.extend(self.addr.octets());
        }

        let builder = PacketBuilder::ipv4(DNS_SERVER.octets(), packet.source().octets(), 64)
            .udp(53, udp.source_port());

        let mut serialized = Vec::new();
        builder.write(&mut serialized, &response).unwrap();

        let mut buf = IpPacketBuf::new();
        buf.buf()[..serialized.len()].copy_from_slice(&serialized);

        IpPacket::new(buf, serialized.len()).unwrap()
    }
}

/// An in-memory packet queue pair implementing [`smoltcp::phy::Device`].
#[derive(Default)]
struct Pipe {
    inbound: VecDeque<IpPacket>,
    outbound: VecDeque<IpPacket>,
}

impl smoltcp::phy::Device for Pipe {
    type RxToken<'a> = PipeRxToken;
    type TxToken<'a> = PipeTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let rx_token = PipeRxToken {
            packet: self.inbound.pop_front()?,
        };
        let tx_token = PipeTxToken {
            outbound: &mut self.outbound,
        };

        Some((rx_token, tx_token))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(PipeTxToken {
            outbound: &mut self.outbound,
        })
    }

    fn capabilities(&self) -> smoltcp::phy::DeviceCapabilities {
        let mut caps = smoltcp::phy::DeviceCapabilities::default();
        caps.medium = smoltcp::phy::Medium::Ip;
        caps.max_transmission_unit = 1400;

        caps
    }
}

struct PipeRxToken {
    packet: IpPacket,
}

impl smoltcp::phy::RxToken for PipeRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(self.packet.packet_mut())
    }
}

struct PipeTxToken<'a> {
    outbound: &'a mut VecDeque<IpPacket>,
}

impl smoltcp::phy::TxToken for PipeTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = IpPacketBuf::new();
        let result = f(&mut buf.buf()[..len]);

        let mut packet = IpPacket::new(buf, len).expect("engine emits valid packets");
        packet.update_checksum();
        self.outbound.push_back(packet);

        result
    }
}
