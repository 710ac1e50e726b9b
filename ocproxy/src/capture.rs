//! Optional pcap tap: every datagram crossing the synthetic interface goes
//! into a per-run capture file, readable by any pcap tool.

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};
use ip_packet::IpPacket;

const MAGIC: u32 = 0xa1b2_c3d4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const SNAPLEN: u32 = 65535;
/// Raw IP, no link-layer framing.
const LINKTYPE_RAW: u32 = 101;

pub struct PacketCapture {
    writer: BufWriter<File>,
}

impl PacketCapture {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create capture file `{}`", path.display()))?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&MAGIC.to_le_bytes())?;
        writer.write_all(&VERSION_MAJOR.to_le_bytes())?;
        writer.write_all(&VERSION_MINOR.to_le_bytes())?;
        writer.write_all(&0i32.to_le_bytes())?; // timezone offset
        writer.write_all(&0u32.to_le_bytes())?; // timestamp accuracy
        writer.write_all(&SNAPLEN.to_le_bytes())?;
        writer.write_all(&LINKTYPE_RAW.to_le_bytes())?;
        writer.flush()?;

        tracing::info!(path = %path.display(), "Capturing tunnel traffic");

        Ok(Self { writer })
    }

    /// Purely observational; a failing tap must never affect the data path.
    pub fn record(&mut self, packet: &IpPacket) {
        if let Err(e) = self.try_record(packet.packet()) {
            tracing::debug!("Failed to record packet: {e}");
        }
    }

    fn try_record(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let captured = bytes.len().min(SNAPLEN as usize);

        self.writer.write_all(&(ts.as_secs() as u32).to_le_bytes())?;
        self.writer.write_all(&ts.subsec_micros().to_le_bytes())?;
        self.writer.write_all(&(captured as u32).to_le_bytes())?;
        self.writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.writer.write_all(&bytes[..captured])?;

        // Keep the file usable even if we die mid-run.
        self.writer.flush()
    }
}
