//! The tunnel endpoint: a file descriptor inherited from the VPN client,
//! carrying one raw IP datagram per read or write.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd as _, OwnedFd, RawFd};
use std::task::{Context, Poll, ready};

use anyhow::{Context as _, Result};
use ip_packet::{Chain, IpPacket, IpPacketBuf, MAX_SEGMENTS};
use tokio::io::unix::AsyncFd;

/// Counters for the tunnel link, dumped on `SIGUSR1` and at exit.
#[derive(Debug, Default)]
pub struct LinkStats {
    pub recv: u64,
    pub xmit: u64,
    pub dropped: u64,
    pub lenerr: u64,
}

impl std::fmt::Display for LinkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "recv {} xmit {} drop {} lenerr {}",
            self.recv, self.xmit, self.dropped, self.lenerr
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The datagram could not be sent and was discarded; the link lives on.
    Dropped,
    /// The peer no longer answers; time to shut down.
    PeerGone,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Probe {
    Alive,
    Gone,
}

pub struct VpnEndpoint {
    fd: AsyncFd<OwnedFd>,
    stats: LinkStats,
}

impl VpnEndpoint {
    /// Adopts the descriptor named by `$VPNFD`.
    pub fn from_env() -> Result<Self> {
        let vpnfd = std::env::var("VPNFD")
            .context("VPNFD is not set; this process expects a VPN client to hand it the tunnel descriptor")?;
        let raw: RawFd = vpnfd
            .parse()
            .with_context(|| format!("Failed to parse VPNFD (`{vpnfd}`)"))?;

        // Safety: the parent opened this descriptor for us and nothing else
        // in this process knows about it.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        Self::new(fd)
    }

    pub fn new(fd: OwnedFd) -> Result<Self> {
        set_nonblocking(&fd)?;

        Ok(Self {
            fd: AsyncFd::new(fd).context("Failed to register tunnel descriptor")?,
            stats: LinkStats::default(),
        })
    }

    /// Reads the next datagram; `None` signals the peer closed the tunnel.
    ///
    /// Datagrams that don't parse as IPv4 are dropped and counted, never
    /// surfaced.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<IpPacket>>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;

            let mut buf = IpPacketBuf::new();
            match guard.try_io(|fd| read(fd.get_ref().as_raw_fd(), buf.buf())) {
                Ok(Ok(0)) => return Poll::Ready(Ok(None)),
                Ok(Ok(len)) => match IpPacket::new(buf, len) {
                    Ok(packet) => {
                        self.stats.recv += 1;
                        return Poll::Ready(Ok(Some(packet)));
                    }
                    Err(e) => {
                        self.stats.dropped += 1;
                        tracing::debug!("Dropping inbound datagram: {e:#}");
                    }
                },
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => {}
            }
        }
    }

    /// Gathered write of one datagram.
    ///
    /// A chain of more than [`MAX_SEGMENTS`] segments is dropped outright:
    /// flattening it would mean copying, which this path exists to avoid.
    /// Short writes discard the datagram too; there is no partial-retry for
    /// datagram framing.
    pub fn poll_send(&mut self, cx: &mut Context<'_>, chain: &Chain) -> Poll<io::Result<SendOutcome>> {
        if chain.num_segments() > MAX_SEGMENTS {
            tracing::warn!(
                segments = chain.num_segments(),
                "Dropping datagram with too many segments"
            );
            self.stats.dropped += 1;

            return Poll::Ready(Ok(SendOutcome::Dropped));
        }

        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;

            match guard.try_io(|fd| writev(fd.get_ref().as_raw_fd(), chain)) {
                Ok(Ok(written)) if written == chain.total_len() => {
                    self.stats.xmit += 1;
                    return Poll::Ready(Ok(SendOutcome::Sent));
                }
                Ok(Ok(written)) => {
                    self.stats.lenerr += 1;
                    tracing::warn!(
                        written,
                        len = chain.total_len(),
                        "Short write on tunnel descriptor"
                    );
                    return Poll::Ready(Ok(SendOutcome::Dropped));
                }
                Ok(Err(e)) if peer_gone(&e) => return Poll::Ready(Ok(SendOutcome::PeerGone)),
                Ok(Err(e)) => {
                    self.stats.dropped += 1;
                    tracing::warn!("Failed to write datagram: {e}");
                    return Poll::Ready(Ok(SendOutcome::Dropped));
                }
                Err(_would_block) => {}
            }
        }
    }

    /// Zero-byte liveness probe; the VPN client's death shows up here as a
    /// connection error on the inherited descriptor.
    pub fn probe(&self) -> Probe {
        let rc = unsafe { libc::write(self.fd.get_ref().as_raw_fd(), std::ptr::null(), 0) };

        if rc < 0 && peer_gone(&io::Error::last_os_error()) {
            return Probe::Gone;
        }

        Probe::Alive
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }
}

fn peer_gone(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ECONNREFUSED) | Some(libc::ENOTCONN)
    )
}

fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // Safety: `buf` is valid for writes of its full length.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

fn writev(fd: RawFd, chain: &Chain) -> io::Result<usize> {
    let slices = chain.io_slices();

    // Safety: `IoSlice` is ABI-compatible with `iovec`, and the slices stay
    // alive for the duration of the call.
    let n = unsafe {
        libc::writev(
            fd,
            slices.as_ptr().cast(),
            slices.len() as libc::c_int,
        )
    };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    // Safety: `fd` is owned and valid.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error()).context("Failed to read descriptor flags");
    }

    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("Failed to set descriptor non-blocking");
    }

    Ok(())
}
