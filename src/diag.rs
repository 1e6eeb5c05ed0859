// Diagnostic sink for the filtering pipeline.
//
// Diagnostics are single lines tagged by direction. The default sink writes
// them through `log` with `<tag>/Read` or `<tag>/Write` as the target, so
// they can be filtered per direction with RUST_LOG.

use std::fmt::Write as _;

use serde::Serialize;

/// Default tag prefix, matching the Android backend's log tag.
pub const DEFAULT_LOG_TAG: &str = "WireGuard/GoBackend";

/// Bytes shown in the hex preview of an unsupported packet.
pub const PREVIEW_BYTES: usize = 20;

/// Which side of the tunnel a batch is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Device to application stack.
    Read,
    /// Application stack to device.
    Write,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "Read",
            Self::Write => "Write",
        }
    }
}

/// Receives one line per pipeline event worth reporting.
pub trait Diagnostics: Send + Sync {
    fn emit(&self, direction: Direction, message: &str);
}

/// Writes diagnostics at debug level under a per-direction log target.
pub struct LogDiagnostics {
    read_target: String,
    write_target: String,
}

impl LogDiagnostics {
    pub fn new(tag: &str) -> Self {
        Self {
            read_target: format!("{tag}/{}", Direction::Read.as_str()),
            write_target: format!("{tag}/{}", Direction::Write.as_str()),
        }
    }

    pub fn target(&self, direction: Direction) -> &str {
        match direction {
            Direction::Read => &self.read_target,
            Direction::Write => &self.write_target,
        }
    }
}

impl Default for LogDiagnostics {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_TAG)
    }
}

impl Diagnostics for LogDiagnostics {
    fn emit(&self, direction: Direction, message: &str) {
        log::debug!(target: self.target(direction), "{message}");
    }
}

/// Space-separated lowercase hex of at most `max` leading bytes.
pub fn hex_preview(data: &[u8], max: usize) -> String {
    let shown = &data[..data.len().min(max)];
    let mut out = String::with_capacity(shown.len() * 3);
    for (i, b) in shown.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Line emitted for a packet that is not IPv4.
pub fn unsupported_message(version: u8, packet: &[u8]) -> String {
    format!(
        "Invalid IP: version={} size={} first_byte=0x{:02x} preview=[{}]",
        version,
        packet.len(),
        packet.first().copied().unwrap_or(0),
        hex_preview(packet, PREVIEW_BYTES)
    )
}
