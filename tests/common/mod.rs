//! Shared builders and fakes for the integration tests.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tunguard::diag::{Diagnostics, Direction};
use tunguard::error::GuardError;
use tunguard::oracle::{AdmissionOracle, DnsMalwareOracle, DnsMalwareVerdict};
use tunguard::recorder::MalwareBlockRecorder;

pub const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const RESOLVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const SERVER: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

pub const TYPE_A: u16 = 1;
pub const TYPE_TXT: u16 = 16;

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

fn ipv4(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, l4: &[u8]) -> Vec<u8> {
    let total = (20 + l4.len()) as u16;
    let mut pkt = vec![0x45, 0x00];
    pkt.extend_from_slice(&total.to_be_bytes());
    pkt.extend_from_slice(&[0, 0, 0x40, 0, 64, protocol, 0, 0]);
    pkt.extend_from_slice(&src.octets());
    pkt.extend_from_slice(&dst.octets());
    pkt.extend_from_slice(l4);
    pkt
}

pub fn tcp_syn(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16) -> Vec<u8> {
    let mut l4 = Vec::new();
    l4.extend_from_slice(&sport.to_be_bytes());
    l4.extend_from_slice(&dport.to_be_bytes());
    l4.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x02, 0xff, 0xff, 0, 0, 0, 0]);
    ipv4(0x06, src, dst, &l4)
}

/// TCP segment carrying `payload` after a bare 20-byte header.
pub fn tcp_data(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = tcp_syn(src, dst, sport, dport);
    pkt[33] = 0x18; // PSH|ACK
    pkt.extend_from_slice(payload);
    let total = pkt.len() as u16;
    pkt[2..4].copy_from_slice(&total.to_be_bytes());
    pkt
}

pub fn udp(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut l4 = Vec::new();
    l4.extend_from_slice(&sport.to_be_bytes());
    l4.extend_from_slice(&dport.to_be_bytes());
    l4.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    l4.extend_from_slice(&[0, 0]);
    l4.extend_from_slice(payload);
    ipv4(0x11, src, dst, &l4)
}

pub fn ipv6_stub(len: usize) -> Vec<u8> {
    let mut pkt = vec![0u8; len.max(1)];
    pkt[0] = 0x60;
    pkt
}

/// Prepend `offset` bytes of headroom.
pub fn with_headroom(pkt: &[u8], offset: usize) -> Vec<u8> {
    let mut buf = vec![0u8; offset];
    buf.extend_from_slice(pkt);
    buf
}

/// TLS 1.2 record with a ClientHello whose only extension is SNI `host`.
pub fn client_hello(host: &str) -> Vec<u8> {
    let prefixed = |body: &[u8]| {
        let mut out = (body.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    };
    let mut entry = vec![0u8];
    entry.extend_from_slice(&prefixed(host.as_bytes()));
    let mut sni = 0u16.to_be_bytes().to_vec();
    sni.extend_from_slice(&prefixed(&prefixed(&entry)));

    let mut hello = vec![0x03, 0x03];
    hello.extend_from_slice(&[7; 32]);
    hello.push(0);
    hello.extend_from_slice(&prefixed(&[0x13, 0x01]));
    hello.extend_from_slice(&[1, 0]);
    hello.extend_from_slice(&prefixed(&sni));

    let mut handshake = vec![1];
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);
    let mut record = vec![22, 0x03, 0x01];
    record.extend_from_slice(&prefixed(&handshake));
    record
}

// ---------------------------------------------------------------------------
// DNS messages
// ---------------------------------------------------------------------------

fn encode_name(name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for label in name.split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

/// A response to `name`/`qtype` carrying one answer per TXT string, each
/// pointing back at the question name.
pub fn txt_response(id: u16, name: &str, texts: &[&str]) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&0x8180u16.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&(texts.len() as u16).to_be_bytes());
    msg.extend_from_slice(&[0, 0, 0, 0]);
    msg.extend_from_slice(&encode_name(name));
    msg.extend_from_slice(&TYPE_TXT.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    for text in texts {
        msg.extend_from_slice(&[0xC0, 0x0C]);
        msg.extend_from_slice(&TYPE_TXT.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&300u32.to_be_bytes());
        msg.extend_from_slice(&((text.len() + 1) as u16).to_be_bytes());
        msg.push(text.len() as u8);
        msg.extend_from_slice(text.as_bytes());
    }
    msg
}

pub fn a_query(id: u16, name: &str) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&0x0100u16.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    msg.extend_from_slice(&encode_name(name));
    msg.extend_from_slice(&TYPE_A.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CountingDiag {
    pub lines: Mutex<Vec<(Direction, String)>>,
}

impl CountingDiag {
    pub fn count(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, l)| l.contains(needle))
            .count()
    }
}

impl Diagnostics for CountingDiag {
    fn emit(&self, direction: Direction, message: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((direction, message.to_string()));
    }
}

/// Denies TCP to one destination port; errors when `fail` is set.
pub struct PortDeny {
    pub port: u16,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl PortDeny {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AdmissionOracle for PortDeny {
    fn is_packet_allowed(&self, packet: &[u8]) -> Result<bool, GuardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(GuardError::OracleUnavailable("policy engine down".into()));
        }
        let dport = u16::from_be_bytes([packet[22], packet[23]]);
        Ok(dport != self.port)
    }
}

/// Counts calls and delegates to an inner oracle.
pub struct CountingMalware<O> {
    pub inner: O,
    pub calls: AtomicUsize,
    pub payloads: Mutex<Vec<Vec<u8>>>,
}

impl<O> CountingMalware<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<O: DnsMalwareOracle> DnsMalwareOracle for CountingMalware<O> {
    fn check_dns_malware(&self, payload: &[u8]) -> Result<DnsMalwareVerdict, GuardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(payload.to_vec());
        self.inner.check_dns_malware(payload)
    }
}

pub struct FailingMalware;

impl DnsMalwareOracle for FailingMalware {
    fn check_dns_malware(&self, _payload: &[u8]) -> Result<DnsMalwareVerdict, GuardError> {
        Err(GuardError::OracleUnavailable("detector down".into()))
    }
}

#[derive(Default)]
pub struct ListRecorder {
    pub domains: Mutex<Vec<String>>,
}

impl MalwareBlockRecorder for ListRecorder {
    fn record_malware_block(&self, domain: &str) {
        self.domains.lock().unwrap().push(domain.to_string());
    }
}
