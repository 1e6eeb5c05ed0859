// DNS wire format parser (RFC 1035 §4), scoped to what the malware
// detector reads: header flags, the question section (with name
// decompression) and answer records, including TXT character-strings.
// Authority and additional sections are not walked.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::GuardError;

/// Pointer hops followed before a name is rejected as a loop.
const MAX_COMPRESSION_HOPS: usize = 256;

/// Maximum allowed label length per RFC 1035 §2.3.4.
const MAX_LABEL_LENGTH: usize = 63;

const HEADER_SIZE: usize = 12;

const TYPE_A: u16 = 1;
const TYPE_CNAME: u16 = 5;
const TYPE_TXT: u16 = 16;
const TYPE_AAAA: u16 = 28;

/// Decoded record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    /// One entry per character-string, lossily decoded as UTF-8.
    Txt(Vec<String>),
    /// Any other type: raw type code and rdata bytes.
    Opaque(u16, Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rclass: u16,
    pub ttl: u32,
    pub data: RData,
}

#[derive(Debug, Clone)]
pub struct DnsMessage {
    pub id: u16,
    pub is_response: bool,
    pub rcode: u8,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

impl DnsMessage {
    /// First question name without the trailing root dot.
    pub fn query_name(&self) -> Option<&str> {
        self.questions
            .first()
            .map(|q| q.name.strip_suffix('.').unwrap_or(&q.name))
    }

    /// All TXT character-strings in the answer section.
    pub fn txt_strings(&self) -> impl Iterator<Item = &str> {
        self.answers
            .iter()
            .filter_map(|a| match &a.data {
                RData::Txt(strings) => Some(strings),
                _ => None,
            })
            .flatten()
            .map(String::as_str)
    }
}

fn parse_err(offset: usize, detail: impl Into<String>) -> GuardError {
    GuardError::DnsParse {
        offset,
        detail: detail.into(),
    }
}

/// Parse a DNS message starting at its 12-byte header.
pub fn parse_dns(payload: &[u8]) -> Result<DnsMessage, GuardError> {
    if payload.len() < HEADER_SIZE {
        return Err(parse_err(0, "truncated DNS header"));
    }

    let id = u16::from_be_bytes([payload[0], payload[1]]);
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let ancount = u16::from_be_bytes([payload[6], payload[7]]) as usize;

    let mut offset = HEADER_SIZE;

    // Counts come off the wire; cap the preallocation.
    let mut questions = Vec::with_capacity(qdcount.min(16));
    for _ in 0..qdcount {
        let (name, next) = decompress_name(payload, offset)?;
        offset = next;
        if offset + 4 > payload.len() {
            return Err(parse_err(offset, "truncated question section"));
        }
        questions.push(DnsQuestion {
            name,
            qtype: u16::from_be_bytes([payload[offset], payload[offset + 1]]),
            qclass: u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]),
        });
        offset += 4;
    }

    let mut answers = Vec::with_capacity(ancount.min(16));
    for _ in 0..ancount {
        let (record, next) = parse_record(payload, offset)?;
        offset = next;
        answers.push(record);
    }

    Ok(DnsMessage {
        id,
        is_response: (flags >> 15) & 1 == 1,
        rcode: (flags & 0x0F) as u8,
        questions,
        answers,
    })
}

/// Parse one resource record at `offset`; returns it and the offset after it.
fn parse_record(buf: &[u8], offset: usize) -> Result<(DnsRecord, usize), GuardError> {
    let (name, mut offset) = decompress_name(buf, offset)?;

    if offset + 10 > buf.len() {
        return Err(parse_err(offset, "truncated resource record header"));
    }
    let rtype = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
    let rclass = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]);
    let ttl = u32::from_be_bytes([
        buf[offset + 4],
        buf[offset + 5],
        buf[offset + 6],
        buf[offset + 7],
    ]);
    let rdlength = u16::from_be_bytes([buf[offset + 8], buf[offset + 9]]) as usize;
    offset += 10;

    if offset + rdlength > buf.len() {
        return Err(parse_err(offset, "truncated resource record rdata"));
    }
    let data = parse_rdata(buf, offset, rdlength, rtype)?;

    Ok((
        DnsRecord {
            name,
            rclass,
            ttl,
            data,
        },
        offset + rdlength,
    ))
}

fn parse_rdata(buf: &[u8], offset: usize, rdlength: usize, rtype: u16) -> Result<RData, GuardError> {
    let rdata = &buf[offset..offset + rdlength];
    match rtype {
        TYPE_A => {
            let octets: [u8; 4] = rdata
                .try_into()
                .map_err(|_| parse_err(offset, format!("A record rdata length {rdlength} != 4")))?;
            Ok(RData::A(Ipv4Addr::from(octets)))
        }
        TYPE_AAAA => {
            let octets: [u8; 16] = rdata.try_into().map_err(|_| {
                parse_err(offset, format!("AAAA record rdata length {rdlength} != 16"))
            })?;
            Ok(RData::Aaaa(Ipv6Addr::from(octets)))
        }
        TYPE_CNAME => {
            let (name, _) = decompress_name(buf, offset)?;
            Ok(RData::Cname(name))
        }
        TYPE_TXT => parse_txt(rdata, offset).map(RData::Txt),
        other => Ok(RData::Opaque(other, rdata.to_vec())),
    }
}

/// TXT rdata is a sequence of length-prefixed character-strings.
fn parse_txt(rdata: &[u8], base: usize) -> Result<Vec<String>, GuardError> {
    let mut strings = Vec::new();
    let mut pos = 0;
    while pos < rdata.len() {
        let len = rdata[pos] as usize;
        pos += 1;
        if pos + len > rdata.len() {
            return Err(parse_err(base + pos, "truncated TXT character-string"));
        }
        strings.push(String::from_utf8_lossy(&rdata[pos..pos + len]).into_owned());
        pos += len;
    }
    Ok(strings)
}

/// Decompress a DNS name starting at `offset` in `buf`.
///
/// Returns the fully qualified name (with trailing dot) and the offset just
/// past the name field. When the name uses compression, that offset points
/// past the first pointer, not past its target.
fn decompress_name(buf: &[u8], mut offset: usize) -> Result<(String, usize), GuardError> {
    let mut name = String::new();
    let mut end_offset = None;
    let mut hops = 0usize;

    loop {
        if hops > MAX_COMPRESSION_HOPS {
            return Err(parse_err(offset, "compression loop"));
        }
        let Some(&len) = buf.get(offset) else {
            return Err(parse_err(offset, "truncated name"));
        };
        let len = len as usize;

        if len == 0 {
            if end_offset.is_none() {
                end_offset = Some(offset + 1);
            }
            break;
        }

        if len & 0xC0 == 0xC0 {
            let Some(&low) = buf.get(offset + 1) else {
                return Err(parse_err(offset, "truncated compression pointer"));
            };
            if end_offset.is_none() {
                end_offset = Some(offset + 2);
            }
            offset = ((len & 0x3F) << 8) | low as usize;
            hops += 1;
            continue;
        }

        if len > MAX_LABEL_LENGTH {
            return Err(parse_err(
                offset,
                format!("label length {len} exceeds maximum of {MAX_LABEL_LENGTH}"),
            ));
        }

        offset += 1;
        if offset + len > buf.len() {
            return Err(parse_err(offset, "truncated label"));
        }
        let label = std::str::from_utf8(&buf[offset..offset + len])
            .map_err(|_| parse_err(offset, "invalid UTF-8 in label"))?;
        name.push_str(label);
        name.push('.');
        offset += len;
        hops += 1;
    }

    if name.is_empty() {
        name.push('.');
    }
    Ok((name, end_offset.unwrap_or(offset + 1)))
}

// ===========================================================================
// Test messages
// ===========================================================================

#[cfg(test)]
pub(crate) mod test_messages {
    pub(crate) const TYPE_A: u16 = super::TYPE_A;
    pub(crate) const TYPE_TXT: u16 = super::TYPE_TXT;

    /// "example.com" -> [7]example[3]com[0]
    pub(crate) fn encode_name(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        let stripped = name.strip_suffix('.').unwrap_or(name);
        if !stripped.is_empty() {
            for label in stripped.split('.') {
                out.push(label.len() as u8);
                out.extend_from_slice(label.as_bytes());
            }
        }
        out.push(0);
        out
    }

    pub(crate) fn txt_rdata(strings: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for s in strings {
            out.push(s.len() as u8);
            out.extend_from_slice(s.as_bytes());
        }
        out
    }

    pub(crate) fn query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&id.to_be_bytes());
        pkt.extend_from_slice(&[0x01, 0x00]); // RD
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        pkt.extend_from_slice(&encode_name(name));
        pkt.extend_from_slice(&qtype.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt
    }

    /// Response echoing one question, with answers given as
    /// `(name, rtype, rdata)`.
    pub(crate) fn response(id: u16, question: (&str, u16), answers: &[(&str, u16, &[u8])]) -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&id.to_be_bytes());
        pkt.extend_from_slice(&0x8180u16.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&(answers.len() as u16).to_be_bytes());
        pkt.extend_from_slice(&[0, 0, 0, 0]);
        pkt.extend_from_slice(&encode_name(question.0));
        pkt.extend_from_slice(&question.1.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());
        for (name, rtype, rdata) in answers {
            pkt.extend_from_slice(&encode_name(name));
            pkt.extend_from_slice(&rtype.to_be_bytes());
            pkt.extend_from_slice(&1u16.to_be_bytes());
            pkt.extend_from_slice(&300u32.to_be_bytes());
            pkt.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            pkt.extend_from_slice(rdata);
        }
        pkt
    }
}
