// Per-packet routing decision: which policy path applies.

use crate::packet::{self, DNS_PORT, IPV4_VERSION, Ipv4Header, PROTO_TCP, PROTO_UDP, TransportPorts};

/// Where a packet goes in the filtering pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// No bytes at or after the offset.
    Empty,
    /// Not IPv4. IPv6 lands here too.
    Unsupported { version: u8 },
    /// Version nibble says IPv4 but the header does not fit.
    Malformed(String),
    /// IPv4/TCP, subject to admission on read.
    Tcp(Ipv4Header),
    /// IPv4/UDP with port 53 on either side, subject to DNS inspection on write.
    Dns {
        header: Ipv4Header,
        ports: TransportPorts,
    },
    /// Any other UDP datagram. `ports` is `None` when the datagram is too short
    /// to carry them.
    Udp {
        header: Ipv4Header,
        ports: Option<TransportPorts>,
    },
    /// IPv4 with a protocol we pass through untouched.
    Other(Ipv4Header),
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Unsupported { .. } => "unsupported",
            Self::Malformed(_) => "malformed",
            Self::Tcp(_) => "tcp",
            Self::Dns { .. } => "dns",
            Self::Udp { .. } => "udp",
            Self::Other(_) => "other",
        }
    }
}

/// Classify the packet starting at `offset` in `buf`.
///
/// `buf` must end where the packet ends; on the read path the caller trims
/// it to `offset + size` first.
pub fn classify(buf: &[u8], offset: usize) -> Classification {
    if buf.len() <= offset {
        return Classification::Empty;
    }

    let version = match packet::ip_version(buf, offset) {
        Ok(v) => v,
        Err(_) => return Classification::Empty,
    };
    if version != IPV4_VERSION {
        return Classification::Unsupported { version };
    }

    let header = match packet::parse_ipv4_header(buf, offset) {
        Ok(h) => h,
        Err(e) => return Classification::Malformed(e.to_string()),
    };

    match header.protocol {
        PROTO_TCP => Classification::Tcp(header),
        PROTO_UDP => match packet::transport_ports(buf, offset, header.header_len) {
            Ok(ports) if ports.involves(DNS_PORT) => Classification::Dns { header, ports },
            Ok(ports) => Classification::Udp {
                header,
                ports: Some(ports),
            },
            Err(_) => Classification::Udp {
                header,
                ports: None,
            },
        },
        _ => Classification::Other(header),
    }
}
