// Header parsers for raw IPv4 packets as they cross the tunnel.
//
// Every function takes the whole buffer plus the offset at which the IP
// header starts, and checks lengths before indexing. A short buffer yields
// `GuardError::MalformedPacket`, never a panic.

use std::net::Ipv4Addr;

use crate::error::GuardError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const IPV4_VERSION: u8 = 4;
pub const IPV4_MIN_HLEN: usize = 20;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;

pub const PROTO_TCP: u8 = 0x06;
pub const PROTO_UDP: u8 = 0x11;

pub const UDP_HLEN: usize = 8;
pub const TCP_MIN_HLEN: usize = 20;
const TCP_DOFF_OFFSET: usize = 12;
pub const DNS_PORT: u16 = 53;

// src_port + dst_port
const L4_PORT_HLEN: usize = 4;

// ---------------------------------------------------------------------------
// Parsed views
// ---------------------------------------------------------------------------

/// Fields of an IPv4 header that the filters care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes, as announced by IHL. Not validated here; the
    /// transport parsers reject anything below 20.
    pub header_len: usize,
    /// Transport protocol number.
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// Source and destination ports of a TCP or UDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportPorts {
    pub src: u16,
    pub dst: u16,
}

impl TransportPorts {
    /// True if either side uses `port`.
    pub fn involves(&self, port: u16) -> bool {
        self.src == port || self.dst == port
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// IP version nibble of the packet starting at `offset`.
pub fn ip_version(buf: &[u8], offset: usize) -> Result<u8, GuardError> {
    match buf.get(offset) {
        Some(b) => Ok(b >> 4),
        None => Err(GuardError::malformed(
            "IP header",
            offset.saturating_add(1),
            buf.len(),
        )),
    }
}

/// Parse the IPv4 header starting at `offset`.
///
/// The caller is expected to have checked the version nibble. The only
/// failure is fewer than 20 bytes after `offset`. A bogus IHL is carried
/// through in `header_len` and surfaces later in [`transport_ports`] or
/// [`dns_payload`].
pub fn parse_ipv4_header(buf: &[u8], offset: usize) -> Result<Ipv4Header, GuardError> {
    let needed = offset.saturating_add(IPV4_MIN_HLEN);
    if buf.len() < needed {
        return Err(GuardError::malformed("IPv4 header", needed, buf.len()));
    }
    let hdr = &buf[offset..];

    Ok(Ipv4Header {
        header_len: ((hdr[0] & 0x0F) as usize) * 4,
        protocol: hdr[IPV4_PROTO_OFFSET],
        src: Ipv4Addr::new(
            hdr[IPV4_SRC_OFFSET],
            hdr[IPV4_SRC_OFFSET + 1],
            hdr[IPV4_SRC_OFFSET + 2],
            hdr[IPV4_SRC_OFFSET + 3],
        ),
        dst: Ipv4Addr::new(
            hdr[IPV4_DST_OFFSET],
            hdr[IPV4_DST_OFFSET + 1],
            hdr[IPV4_DST_OFFSET + 2],
            hdr[IPV4_DST_OFFSET + 3],
        ),
    })
}

fn check_ihl(header_len: usize) -> Result<(), GuardError> {
    if header_len < IPV4_MIN_HLEN {
        return Err(GuardError::malformed("IPv4 IHL", IPV4_MIN_HLEN, header_len));
    }
    Ok(())
}

/// Read the big-endian port pair right after an IPv4 header of `header_len`
/// bytes. Works for both TCP and UDP, which share the layout.
pub fn transport_ports(
    buf: &[u8],
    offset: usize,
    header_len: usize,
) -> Result<TransportPorts, GuardError> {
    check_ihl(header_len)?;
    let start = offset.saturating_add(header_len);
    let needed = start.saturating_add(L4_PORT_HLEN);
    if buf.len() < needed {
        return Err(GuardError::malformed("transport ports", needed, buf.len()));
    }
    Ok(TransportPorts {
        src: u16::from_be_bytes([buf[start], buf[start + 1]]),
        dst: u16::from_be_bytes([buf[start + 2], buf[start + 3]]),
    })
}

/// Slice the TCP segment payload, skipping the header and its options as
/// announced by the data offset.
pub fn tcp_payload(buf: &[u8], offset: usize, header_len: usize) -> Result<&[u8], GuardError> {
    check_ihl(header_len)?;
    let start = offset.saturating_add(header_len);
    let needed = start.saturating_add(TCP_MIN_HLEN);
    if buf.len() < needed {
        return Err(GuardError::malformed("TCP header", needed, buf.len()));
    }
    let doff = ((buf[start + TCP_DOFF_OFFSET] >> 4) as usize) * 4;
    if doff < TCP_MIN_HLEN {
        return Err(GuardError::malformed("TCP data offset", TCP_MIN_HLEN, doff));
    }
    let data = start + doff;
    if buf.len() < data {
        return Err(GuardError::malformed("TCP options", data, buf.len()));
    }
    Ok(&buf[data..])
}

/// Slice the DNS message carried after the IPv4 and UDP headers.
///
/// The returned slice may be empty when the UDP datagram has no payload.
pub fn dns_payload(buf: &[u8], offset: usize, header_len: usize) -> Result<&[u8], GuardError> {
    check_ihl(header_len)?;
    let start = offset.saturating_add(header_len).saturating_add(UDP_HLEN);
    if buf.len() < start {
        return Err(GuardError::malformed("UDP header", start, buf.len()));
    }
    Ok(&buf[start..])
}

// ===========================================================================
// Test packets
// ===========================================================================
