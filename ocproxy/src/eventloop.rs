//! The single-threaded readiness loop gluing everything together: the tunnel
//! descriptor, the proxy core, the local listeners and sockets, the periodic
//! ticks and the signal flags.
//!
//! One manually-polled future; every callback runs on this thread, so the
//! core needs no locks. Anything that cannot make progress registers a waker
//! and the loop parks at a single suspension point.

use std::collections::{HashMap, VecDeque};
use std::future::{Future as _, poll_fn};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use ip_packet::{Chain, IpPacket};
use l3_proxy::{ConnId, Event, Flush, Proxy};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{Signal, SignalKind, signal};

use crate::capture::PacketCapture;
use crate::vpn::{Probe, SendOutcome, VpnEndpoint};

/// Engine timer cadence.
const TCP_TICK: Duration = Duration::from_millis(250);
/// Resolver timer cadence.
const DNS_TICK: Duration = Duration::from_secs(1);
/// Liveness probe cadence for the tunnel descriptor.
const HOUSEKEEPING_TICK: Duration = Duration::from_secs(1);

/// How much we read from a local socket in one go.
const READ_CHUNK: usize = 2048;

#[derive(Debug)]
pub enum Exit {
    /// The peer closed the tunnel (zero-byte read).
    VpnClosed,
    /// The VPN client is gone (probe or write failed).
    VpnGone,
    /// `SIGHUP` asked us to leave.
    Hangup,
}

pub struct ListenerSocket {
    pub socket: TcpListener,
    pub spec: l3_proxy::Listener,
}

pub struct Eventloop {
    vpn: VpnEndpoint,
    proxy: Proxy,
    listeners: Vec<ListenerSocket>,
    streams: HashMap<ConnId, TcpStream>,
    outbound: VecDeque<IpPacket>,
    capture: Option<PacketCapture>,

    tcp_tick: tokio::time::Interval,
    dns_tick: tokio::time::Interval,
    housekeeping_tick: tokio::time::Interval,
    /// The engine's own next deadline (retransmits etc.), finer than the ticks.
    engine_deadline: Option<Pin<Box<tokio::time::Sleep>>>,

    sighup: Signal,
    sigusr1: Signal,

    scratch: [u8; READ_CHUNK],
}

impl Eventloop {
    pub fn new(
        vpn: VpnEndpoint,
        proxy: Proxy,
        listeners: Vec<ListenerSocket>,
        capture: Option<PacketCapture>,
    ) -> Result<Self> {
        Ok(Self {
            vpn,
            proxy,
            listeners,
            streams: HashMap::default(),
            outbound: VecDeque::default(),
            capture,
            tcp_tick: tokio::time::interval(TCP_TICK),
            dns_tick: tokio::time::interval(DNS_TICK),
            housekeeping_tick: tokio::time::interval(HOUSEKEEPING_TICK),
            engine_deadline: None,
            sighup: signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?,
            sigusr1: signal(SignalKind::user_defined1())
                .context("Failed to install SIGUSR1 handler")?,
            scratch: [0u8; READ_CHUNK],
        })
    }

    pub async fn run(mut self) -> Result<Exit> {
        let exit = poll_fn(|cx| self.poll(cx)).await;

        tracing::info!(stats = %self.vpn.stats(), "Link statistics");

        exit
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Result<Exit>> {
        loop {
            if let Poll::Ready(Some(())) = self.sighup.poll_recv(cx) {
                return Poll::Ready(Ok(Exit::Hangup));
            }

            if let Poll::Ready(Some(())) = self.sigusr1.poll_recv(cx) {
                tracing::info!(stats = %self.vpn.stats(), "Link statistics");
                continue;
            }

            if self.housekeeping_tick.poll_tick(cx).is_ready() {
                if self.vpn.probe() == Probe::Gone {
                    return Poll::Ready(Ok(Exit::VpnGone));
                }

                continue;
            }

            if self.tcp_tick.poll_tick(cx).is_ready() {
                self.advance();
                continue;
            }

            if self.dns_tick.poll_tick(cx).is_ready() {
                self.advance();
                continue;
            }

            if let Some(deadline) = self.engine_deadline.as_mut() {
                if deadline.as_mut().poll(cx).is_ready() {
                    self.engine_deadline = None;
                    self.advance();
                    continue;
                }
            }

            // Outbound datagrams drain to the tunnel before anything new is
            // produced, preserving the engine's emission order.
            if let Some(packet) = self.outbound.front() {
                match self.vpn.poll_send(cx, &Chain::from(packet)) {
                    Poll::Ready(Ok(SendOutcome::Sent)) | Poll::Ready(Ok(SendOutcome::Dropped)) => {
                        self.outbound.pop_front();
                        continue;
                    }
                    Poll::Ready(Ok(SendOutcome::PeerGone)) => {
                        return Poll::Ready(Ok(Exit::VpnGone));
                    }
                    Poll::Ready(Err(e)) => {
                        return Poll::Ready(Err(e).context("Failed to write to tunnel"));
                    }
                    Poll::Pending => {}
                }
            }

            match self.vpn.poll_recv(cx) {
                Poll::Ready(Ok(Some(packet))) => {
                    if let Some(capture) = &mut self.capture {
                        capture.record(&packet);
                    }

                    self.proxy.handle_inbound(packet);
                    self.advance();
                    continue;
                }
                Poll::Ready(Ok(None)) => return Poll::Ready(Ok(Exit::VpnClosed)),
                Poll::Ready(Err(e)) => {
                    return Poll::Ready(Err(e).context("Failed to read from tunnel"));
                }
                Poll::Pending => {}
            }

            if self.poll_accepts(cx) {
                self.advance();
                continue;
            }

            if self.drive_connections(cx) {
                self.advance();
                continue;
            }

            return Poll::Pending;
        }
    }

    /// Accepts everything that is pending; `true` if anything came in.
    fn poll_accepts(&mut self, cx: &mut Context<'_>) -> bool {
        let mut accepted = false;

        for index in 0..self.listeners.len() {
            while let Poll::Ready(result) = self.listeners[index].socket.poll_accept(cx) {
                match result {
                    Ok((stream, addr)) => {
                        accepted = true;

                        let spec = self.listeners[index].spec.clone();
                        match self.proxy.accept_local(spec) {
                            Some(id) => {
                                tracing::debug!(%addr, %id, "Accepted local connection");
                                self.streams.insert(id, stream);
                            }
                            None => {
                                tracing::warn!(%addr, "Connection table full; refusing");
                                drop(stream);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept: {e}");
                        break;
                    }
                }
            }
        }

        accepted
    }

    /// One pass of socket I/O over all connections; `true` if any progressed.
    fn drive_connections(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;

        let ids = self.streams.keys().copied().collect::<Vec<_>>();
        for id in ids {
            let Some(stream) = self.streams.get(&id) else {
                continue;
            };

            // Deliver pending bytes; only what the socket accepts is consumed
            // (and thereby acknowledged towards the tunnel).
            let mut wrote = false;
            let outcome = self.proxy.flush_local(id, &mut |buf| {
                let result = stream.try_write(buf);

                if matches!(result, Ok(n) if n > 0) {
                    wrote = true;
                }

                result
            });
            progress |= wrote;

            match outcome {
                Flush::Closed => {
                    self.streams.remove(&id);
                    progress = true;
                    continue;
                }
                Flush::Blocked => {
                    // Re-polled once the socket can take more.
                    let _ = stream.poll_write_ready(cx);
                }
                Flush::Idle => {}
            }

            // Read only within budget; a zero budget is back-pressure and
            // leaves readiness unarmed so the loop doesn't spin.
            let budget = self.proxy.read_budget(id);
            if budget == 0 {
                continue;
            }

            match stream.poll_read_ready(cx) {
                Poll::Ready(Ok(())) => {
                    match stream.try_read(&mut self.scratch[..budget.min(READ_CHUNK)]) {
                        Ok(0) => {
                            self.proxy.handle_local_closed(id);
                            self.streams.remove(&id);
                            progress = true;
                        }
                        Ok(n) => {
                            self.proxy.handle_local_input(id, &self.scratch[..n]);
                            progress = true;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            tracing::debug!(%id, "Failed to read from local socket: {e}");
                            self.proxy.handle_local_closed(id);
                            self.streams.remove(&id);
                            progress = true;
                        }
                    }
                }
                Poll::Ready(Err(e)) => {
                    tracing::debug!(%id, "Local socket failed: {e}");
                    self.proxy.handle_local_closed(id);
                    self.streams.remove(&id);
                    progress = true;
                }
                Poll::Pending => {}
            }
        }

        progress
    }

    /// Advances the proxy core and drains whatever it produced.
    fn advance(&mut self) {
        self.proxy.handle_timeout(Instant::now());

        while let Some(packet) = self.proxy.poll_outbound() {
            if let Some(capture) = &mut self.capture {
                capture.record(&packet);
            }

            self.outbound.push_back(packet);
        }

        while let Some(event) = self.proxy.poll_event() {
            match event {
                Event::ConnectionClosed(id) => {
                    self.streams.remove(&id);
                }
            }
        }

        self.engine_deadline = self
            .proxy
            .poll_timeout()
            .map(|deadline| Box::pin(tokio::time::sleep_until(deadline.into())));
    }
}
