// Classic libpcap capture files.
//
// Packets on a tunnel carry no link-layer header, so captures are written
// with LINKTYPE_RAW. Reading accepts raw, IPv4 and Ethernet captures and
// strips the Ethernet header when present.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, Linktype, PcapBlockOwned, PcapError};

use crate::error::GuardError;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
pub const SNAPLEN: u32 = 65535;
pub const LINKTYPE_RAW: u32 = 101;

const ETHERNET_HLEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const READ_BUFFER: usize = 65536;

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub struct PcapWriter {
    out: Box<dyn Write + Send>,
    packets: u64,
}

impl PcapWriter {
    /// Wrap `out` and write the global header.
    pub fn new(out: impl Write + Send + 'static) -> Result<Self, GuardError> {
        let mut out: Box<dyn Write + Send> = Box::new(out);
        write_global_header(&mut out).map_err(|e| GuardError::Pcap(format!("header: {e}")))?;
        Ok(Self { out, packets: 0 })
    }

    pub fn create(path: &Path) -> Result<Self, GuardError> {
        let file = File::create(path)
            .map_err(|e| GuardError::Pcap(format!("create {}: {e}", path.display())))?;
        log::info!("capturing packets to {}", path.display());
        Self::new(BufWriter::new(file))
    }

    /// Append one packet stamped with the current time.
    pub fn write_packet(&mut self, data: &[u8]) -> Result<(), GuardError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.write_packet_at(now.as_secs() as u32, now.subsec_micros(), data)
    }

    pub fn write_packet_at(
        &mut self,
        ts_sec: u32,
        ts_usec: u32,
        data: &[u8],
    ) -> Result<(), GuardError> {
        write_record(&mut self.out, ts_sec, ts_usec, data)
            .map_err(|e| GuardError::Pcap(format!("record {}: {e}", self.packets + 1)))?;
        self.packets += 1;
        Ok(())
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn flush(&mut self) -> Result<(), GuardError> {
        self.out
            .flush()
            .map_err(|e| GuardError::Pcap(format!("flush: {e}")))
    }
}

fn write_global_header(w: &mut impl Write) -> io::Result<()> {
    w.write_all(&PCAP_MAGIC.to_le_bytes())?;
    w.write_all(&VERSION_MAJOR.to_le_bytes())?;
    w.write_all(&VERSION_MINOR.to_le_bytes())?;
    w.write_all(&0i32.to_le_bytes())?; // thiszone
    w.write_all(&0u32.to_le_bytes())?; // sigfigs
    w.write_all(&SNAPLEN.to_le_bytes())?;
    w.write_all(&LINKTYPE_RAW.to_le_bytes())?;
    Ok(())
}

fn write_record(w: &mut impl Write, ts_sec: u32, ts_usec: u32, data: &[u8]) -> io::Result<()> {
    let orig_len = data.len() as u32;
    let captured = &data[..data.len().min(SNAPLEN as usize)];
    w.write_all(&ts_sec.to_le_bytes())?;
    w.write_all(&ts_usec.to_le_bytes())?;
    w.write_all(&(captured.len() as u32).to_le_bytes())?;
    w.write_all(&orig_len.to_le_bytes())?;
    w.write_all(captured)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Load every IP packet from a legacy pcap file.
pub fn read_packets(path: &Path) -> Result<Vec<Vec<u8>>, GuardError> {
    let file =
        File::open(path).map_err(|e| GuardError::Pcap(format!("open {}: {e}", path.display())))?;
    read_packets_from(BufReader::new(file))
}

pub fn read_packets_from(input: impl Read) -> Result<Vec<Vec<u8>>, GuardError> {
    let mut reader = LegacyPcapReader::new(READ_BUFFER, input)
        .map_err(|e| GuardError::Pcap(format!("not a legacy pcap file: {e:?}")))?;
    let mut linktype = Linktype::RAW;
    let mut packets = Vec::new();
    let mut skipped = 0usize;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    PcapBlockOwned::LegacyHeader(ref hdr) => {
                        linktype = hdr.network;
                        if !is_supported(linktype) {
                            return Err(GuardError::Pcap(format!(
                                "unsupported link type {}",
                                linktype.0
                            )));
                        }
                    }
                    PcapBlockOwned::Legacy(ref pkt) => match strip_link_layer(linktype, pkt.data) {
                        Some(ip) => packets.push(ip.to_vec()),
                        None => skipped += 1,
                    },
                    PcapBlockOwned::NG(_) => {
                        log::warn!("pcapng block encountered, only legacy pcap is supported");
                    }
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete { .. }) => {
                reader
                    .refill()
                    .map_err(|e| GuardError::Pcap(format!("refill: {e:?}")))?;
            }
            Err(e) => return Err(GuardError::Pcap(format!("parse: {e:?}"))),
        }
    }

    if skipped > 0 {
        log::debug!("skipped {skipped} non-IP frames");
    }
    Ok(packets)
}

fn is_supported(linktype: Linktype) -> bool {
    linktype == Linktype::RAW
        || linktype == Linktype::IPV4
        || linktype == Linktype::IPV6
        || linktype == Linktype::ETHERNET
}

/// The IP packet inside a captured frame, or `None` for non-IP Ethernet
/// frames.
fn strip_link_layer(linktype: Linktype, frame: &[u8]) -> Option<&[u8]> {
    if linktype != Linktype::ETHERNET {
        return Some(frame);
    }
    if frame.len() < ETHERNET_HLEN {
        return None;
    }
    match u16::from_be_bytes([frame[12], frame[13]]) {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => Some(&frame[ETHERNET_HLEN..]),
        _ => None,
    }
}
