// Per-packet policy: TCP admission on the read path, DNS malware inspection
// on the write path.
//
// Both filters take `buf` trimmed to the end of the packet and the shared
// batch `offset`. Neither touches packet bytes; the read side reports a drop
// and the batch adapter zeroes the slot.

use crate::classify::{self, Classification};
use crate::diag::{self, Diagnostics, Direction};
use crate::oracle::{AdmissionOracle, DnsMalwareOracle};
use crate::packet;
use crate::recorder::MalwareBlockRecorder;

pub const MSG_TOO_SHORT: &str = "Skipping invalid packet, too short";
pub const MSG_BAD_IPV4_READ: &str = "Skipping bad IPv4 pkt";
pub const MSG_BAD_IPV4_WRITE: &str = "Skipping bad IPv4 packet";
pub const MSG_BLOCKING: &str = "Blocking connection";

/// What the pipeline did with one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOutcome {
    /// No bytes after the offset.
    Empty,
    /// Not IPv4. Always forwarded.
    Unsupported,
    /// Claimed IPv4 but the header did not fit.
    Malformed,
    /// Not subject to this direction's filter.
    Passed,
    /// TCP the admission oracle allowed.
    Admitted,
    /// TCP the admission oracle denied.
    Denied,
    /// DNS the malware oracle found clean.
    Clean,
    /// DNS the malware oracle flagged. Still forwarded.
    Flagged(String),
    /// The oracle gave no answer; the packet went through.
    OracleFailed,
}

impl PacketOutcome {
    /// Whether a read-side slot must be zeroed.
    pub fn drops_on_read(&self) -> bool {
        matches!(self, Self::Empty | Self::Malformed | Self::Denied)
    }
}

/// Decide whether an inbound packet reaches the application stack.
pub fn admit_inbound(
    buf: &[u8],
    offset: usize,
    oracle: &dyn AdmissionOracle,
    diag: &dyn Diagnostics,
) -> PacketOutcome {
    match classify::classify(buf, offset) {
        Classification::Empty => {
            diag.emit(Direction::Read, MSG_TOO_SHORT);
            PacketOutcome::Empty
        }
        Classification::Unsupported { version } => {
            diag.emit(
                Direction::Read,
                &diag::unsupported_message(version, &buf[offset..]),
            );
            PacketOutcome::Unsupported
        }
        Classification::Malformed(detail) => {
            diag.emit(Direction::Read, &format!("{MSG_BAD_IPV4_READ}: {detail}"));
            PacketOutcome::Malformed
        }
        Classification::Tcp(_) => match oracle.is_packet_allowed(&buf[offset..]) {
            Ok(true) => PacketOutcome::Admitted,
            Ok(false) => {
                diag.emit(Direction::Read, MSG_BLOCKING);
                PacketOutcome::Denied
            }
            Err(e) => {
                diag.emit(
                    Direction::Read,
                    &format!("Admission check failed, allowing packet: {e}"),
                );
                log::warn!("admission oracle failed: {e}");
                PacketOutcome::OracleFailed
            }
        },
        Classification::Dns { .. } | Classification::Udp { .. } | Classification::Other(_) => {
            PacketOutcome::Passed
        }
    }
}

/// Inspect an outbound packet. Never asks for a drop.
pub fn inspect_outbound(
    buf: &[u8],
    offset: usize,
    oracle: &dyn DnsMalwareOracle,
    recorder: &dyn MalwareBlockRecorder,
    diag: &dyn Diagnostics,
) -> PacketOutcome {
    match classify::classify(buf, offset) {
        Classification::Empty => {
            diag.emit(Direction::Write, MSG_TOO_SHORT);
            PacketOutcome::Empty
        }
        Classification::Unsupported { version } => {
            diag.emit(
                Direction::Write,
                &diag::unsupported_message(version, &buf[offset..]),
            );
            PacketOutcome::Unsupported
        }
        Classification::Malformed(detail) => {
            diag.emit(Direction::Write, &format!("{MSG_BAD_IPV4_WRITE}: {detail}"));
            PacketOutcome::Malformed
        }
        Classification::Dns { header, .. } => {
            let payload = match packet::dns_payload(buf, offset, header.header_len) {
                Ok(p) => p,
                Err(e) => {
                    diag.emit(Direction::Write, &format!("{MSG_TOO_SHORT}: {e}"));
                    return PacketOutcome::Malformed;
                }
            };
            match oracle.check_dns_malware(payload) {
                Ok(verdict) if verdict.flagged => {
                    diag.emit(
                        Direction::Write,
                        &format!("DNS malware was blocked for domain: {}", verdict.domain),
                    );
                    recorder.record_malware_block(&verdict.domain);
                    PacketOutcome::Flagged(verdict.domain)
                }
                Ok(_) => PacketOutcome::Clean,
                Err(e) => {
                    diag.emit(
                        Direction::Write,
                        &format!("DNS malware check failed, forwarding packet: {e}"),
                    );
                    log::warn!("DNS malware oracle failed: {e}");
                    PacketOutcome::OracleFailed
                }
            }
        }
        Classification::Tcp(_) | Classification::Udp { .. } | Classification::Other(_) => {
            PacketOutcome::Passed
        }
    }
}
