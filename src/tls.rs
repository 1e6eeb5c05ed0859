// TLS ClientHello parser (RFC 8446 §4.1.2, RFC 6066 §3), scoped to the
// server_name extension. Works on the first TCP segment of a connection;
// a ClientHello split across segments fails as truncated.

use crate::error::GuardError;

const CONTENT_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: u16 = 0;
const NAME_TYPE_HOST: u8 = 0;

const RECORD_HEADER_LEN: usize = 5;
// client_version + random
const HELLO_FIXED_LEN: usize = 2 + 32;

/// Longest host name accepted, as a DNS name.
const MAX_HOST_NAME: usize = 255;

fn parse_err(offset: usize, detail: impl Into<String>) -> GuardError {
    GuardError::TlsParse {
        offset,
        detail: detail.into(),
    }
}

/// Bounds-checked big-endian reader over one TLS structure.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Offset of `buf[0]` in the record, for error messages.
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], base: usize) -> Self {
        Self { buf, pos: 0, base }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], GuardError> {
        let end = self.pos.saturating_add(n);
        if end > self.buf.len() {
            return Err(parse_err(self.base + self.pos, format!("truncated {what}")));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> Result<u8, GuardError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, GuardError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, what: &str) -> Result<usize, GuardError> {
        let b = self.take(3, what)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    /// A sub-reader over the next `len`-prefixed vector.
    fn vec8(&mut self, what: &str) -> Result<Reader<'a>, GuardError> {
        let len = self.u8(what)? as usize;
        let base = self.base + self.pos;
        Ok(Reader::new(self.take(len, what)?, base))
    }

    fn vec16(&mut self, what: &str) -> Result<Reader<'a>, GuardError> {
        let len = self.u16(what)? as usize;
        let base = self.base + self.pos;
        Ok(Reader::new(self.take(len, what)?, base))
    }
}

/// Server name announced by the ClientHello at the start of `segment`.
///
/// `Ok(None)` covers everything that is not a ClientHello carrying SNI:
/// other record types, pre-TLS versions, other handshake messages and hellos
/// without the extension. Structural damage inside a ClientHello is an error.
pub fn server_name(segment: &[u8]) -> Result<Option<String>, GuardError> {
    match segment.first() {
        Some(&CONTENT_HANDSHAKE) => {}
        _ => return Ok(None),
    }
    if segment.len() < RECORD_HEADER_LEN {
        return Err(parse_err(0, "truncated record header"));
    }
    // SSL 2.0 and older cannot carry extensions.
    if segment[1] < 3 {
        return Ok(None);
    }
    let record_len = u16::from_be_bytes([segment[3], segment[4]]) as usize;
    let body = &segment[RECORD_HEADER_LEN..];
    let body = &body[..record_len.min(body.len())];

    let mut rd = Reader::new(body, RECORD_HEADER_LEN);
    if rd.u8("handshake type")? != HANDSHAKE_CLIENT_HELLO {
        return Ok(None);
    }
    let hello_len = rd.u24("handshake length")?;
    let base = rd.base + rd.pos;
    let avail = rd.buf.len() - rd.pos;
    let mut hello = Reader::new(rd.take(hello_len.min(avail), "client hello")?, base);

    hello.take(HELLO_FIXED_LEN, "client random")?;
    hello.vec8("session id")?;
    hello.vec16("cipher suites")?;
    hello.vec8("compression methods")?;
    if hello.is_empty() {
        // SSL 3.0 style hello without extensions.
        return Ok(None);
    }

    let mut extensions = hello.vec16("extensions")?;
    while !extensions.is_empty() {
        let ext_type = extensions.u16("extension type")?;
        let mut data = extensions.vec16("extension data")?;
        if ext_type == EXTENSION_SERVER_NAME {
            return host_name(&mut data);
        }
    }
    Ok(None)
}

fn host_name(ext: &mut Reader<'_>) -> Result<Option<String>, GuardError> {
    let mut list = ext.vec16("server name list")?;
    while !list.is_empty() {
        let name_type = list.u8("name type")?;
        let at = list.base + list.pos;
        let name = list.vec16("server name")?;
        if name_type != NAME_TYPE_HOST {
            continue;
        }
        if name.buf.is_empty() || name.buf.len() > MAX_HOST_NAME {
            return Err(parse_err(at, format!("host name of {} bytes", name.buf.len())));
        }
        return match std::str::from_utf8(name.buf) {
            Ok(s) => Ok(Some(s.to_string())),
            Err(_) => Err(parse_err(at, "host name is not UTF-8")),
        };
    }
    Ok(None)
}

// ===========================================================================
// Test hellos
// ===========================================================================

#[cfg(test)]
pub(crate) mod test_hellos {
    fn vec16(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn extension(ext_type: u16, data: &[u8]) -> Vec<u8> {
        let mut out = ext_type.to_be_bytes().to_vec();
        out.extend_from_slice(&vec16(data));
        out
    }

    pub(crate) fn sni_extension(host: &str) -> Vec<u8> {
        let mut entry = vec![0u8];
        entry.extend_from_slice(&vec16(host.as_bytes()));
        extension(0, &vec16(&entry))
    }

    /// A TLS 1.2 record holding one ClientHello with `extensions` as given.
    pub(crate) fn client_hello_with(extensions: &[Vec<u8>]) -> Vec<u8> {
        let mut hello = vec![0x03, 0x03];
        hello.extend_from_slice(&[0x5A; 32]);
        hello.push(32);
        hello.extend_from_slice(&[0x11; 32]);
        hello.extend_from_slice(&vec16(&[0x13, 0x01, 0xC0, 0x2F]));
        hello.extend_from_slice(&[1, 0]);
        hello.extend_from_slice(&vec16(&extensions.concat()));

        let mut handshake = vec![1];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![22, 0x03, 0x01];
        record.extend_from_slice(&vec16(&handshake));
        record
    }

    /// ClientHello announcing `host`, after a GREASE-like unknown extension.
    pub(crate) fn client_hello(host: &str) -> Vec<u8> {
        client_hello_with(&[extension(0x0A0A, &[]), sni_extension(host)])
    }
}
