#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod chain;

pub use chain::{Chain, MAX_SEGMENTS};
pub use etherparse::*;

use anyhow::{Context as _, Result, bail};
use std::net::Ipv4Addr;

/// The size of the buffer one datagram is read into.
///
/// One `read` on the tunnel descriptor yields at most one IP datagram,
/// so this also caps the MTU we can be configured with.
pub const PACKET_SIZE: usize = 2048;

/// A buffer for reading a new [`IpPacket`] from the tunnel.
pub struct IpPacketBuf {
    inner: Box<[u8; PACKET_SIZE]>,
}

impl Default for IpPacketBuf {
    fn default() -> Self {
        Self {
            inner: Box::new([0u8; PACKET_SIZE]),
        }
    }
}

impl IpPacketBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buf(&mut self) -> &mut [u8] {
        self.inner.as_mut_slice()
    }
}

/// A validated IPv4 datagram, owning its buffer.
#[derive(Clone)]
pub struct IpPacket {
    buf: Box<[u8; PACKET_SIZE]>,
    len: usize,
}

impl IpPacket {
    pub fn new(buf: IpPacketBuf, len: usize) -> Result<Self> {
        anyhow::ensure!(len <= PACKET_SIZE, "Packet too large (len: {len})");
        anyhow::ensure!(len > 0, "Empty packet");

        let this = Self {
            buf: buf.inner,
            len,
        };

        match this.packet()[0] >> 4 {
            4 => {
                Ipv4Slice::from_slice(this.packet()).context("Invalid IPv4 packet")?;
            }
            v => bail!("Unsupported IP version: {v}"),
        }

        Ok(this)
    }

    pub fn packet(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn packet_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn header(&self) -> Ipv4HeaderSlice<'_> {
        Ipv4HeaderSlice::from_slice(self.packet()).expect("we checked this during `new`")
    }

    pub fn source(&self) -> Ipv4Addr {
        self.header().source_addr()
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.header().destination_addr()
    }

    fn payload(&self) -> &[u8] {
        Ipv4Slice::from_slice(self.packet())
            .expect("we checked this during `new`")
            .payload()
            .payload
    }

    pub fn as_tcp(&self) -> Option<TcpSlice<'_>> {
        (self.header().protocol() == IpNumber::TCP)
            .then(|| TcpSlice::from_slice(self.payload()).ok())
            .flatten()
    }

    pub fn as_udp(&self) -> Option<UdpSlice<'_>> {
        (self.header().protocol() == IpNumber::UDP)
            .then(|| UdpSlice::from_slice(self.payload()).ok())
            .flatten()
    }

    /// Recomputes all checksums in place.
    ///
    /// Needed after the engine fills a TX buffer: the synthetic device has no
    /// hardware offload, so nothing else writes them.
    #[inline]
    pub fn update_checksum(&mut self) {
        self.set_udp_checksum();
        self.set_tcp_checksum();
        // Note: Ipv4 checksum should be set after the others,
        // since it's in an upper layer.
        self.set_ipv4_checksum();
    }

    fn set_ipv4_checksum(&mut self) {
        let checksum = self.header().to_header().calc_header_checksum();

        // The header checksum field sits at a fixed offset, options or not.
        self.packet_mut()[10..12].copy_from_slice(&checksum.to_be_bytes());
    }

    fn set_udp_checksum(&mut self) {
        let Some(udp) = self.as_udp() else {
            return;
        };

        let checksum = udp
            .to_header()
            .calc_checksum_ipv4(&self.header().to_header(), udp.payload())
            .expect("size of payload was previously checked to be okay");

        let at = self.transport_offset() + 6;
        self.packet_mut()[at..at + 2].copy_from_slice(&checksum.to_be_bytes());
    }

    fn set_tcp_checksum(&mut self) {
        let Some(tcp) = self.as_tcp() else {
            return;
        };

        let checksum = tcp
            .to_header()
            .calc_checksum_ipv4(&self.header().to_header(), tcp.payload())
            .expect("size of payload was previously checked to be okay");

        let at = self.transport_offset() + 16;
        self.packet_mut()[at..at + 2].copy_from_slice(&checksum.to_be_bytes());
    }

    fn transport_offset(&self) -> usize {
        usize::from(self.header().ihl()) * 4
    }
}

impl std::fmt::Debug for IpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("Packet");

        dbg.field("src", &self.source())
            .field("dst", &self.destination())
            .field(
                "protocol",
                &self.header().protocol().keyword_str().unwrap_or("unknown"),
            );

        if let Some(tcp) = self.as_tcp() {
            dbg.field("src_port", &tcp.source_port())
                .field("dst_port", &tcp.destination_port())
                .field("seq", &tcp.sequence_number())
                .field("len", &tcp.payload().len());

            if tcp.syn() {
                dbg.field("syn", &true);
            }

            if tcp.rst() {
                dbg.field("rst", &true);
            }

            if tcp.fin() {
                dbg.field("fin", &true);
            }
        }

        if let Some(udp) = self.as_udp() {
            dbg.field("src_port", &udp.source_port())
                .field("dst_port", &udp.destination_port())
                .field("len", &udp.payload().len());
        }

        dbg.finish()
    }
}
