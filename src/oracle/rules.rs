// Admission rules: deny TCP by destination port, destination address or
// the TLS server name a ClientHello announces.
//
// The active rule set sits behind an ArcSwap so a control thread can
// replace it while the read path keeps consulting the old one lock-free.

use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashSet;
use serde::Deserialize;

use super::AdmissionOracle;
use crate::error::GuardError;
use crate::packet;
use crate::tls;

/// Rules as they appear in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdmissionRules {
    pub blocked_ports: Vec<u16>,
    pub blocked_addresses: Vec<Ipv4Addr>,
    /// Server names denied at the ClientHello. An entry also covers its
    /// subdomains.
    pub blocked_domains: Vec<String>,
}

impl AdmissionRules {
    pub fn is_empty(&self) -> bool {
        self.blocked_ports.is_empty()
            && self.blocked_addresses.is_empty()
            && self.blocked_domains.is_empty()
    }
}

/// Lowercase, without the trailing root dot.
fn normalize_domain(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[derive(Debug, Default)]
struct RuleSet {
    ports: FxHashSet<u16>,
    addresses: FxHashSet<Ipv4Addr>,
    domains: FxHashSet<String>,
}

impl RuleSet {
    /// `name` or any parent of it is listed.
    fn domain_blocked(&self, name: &str) -> bool {
        let name = normalize_domain(name);
        let mut rest = name.as_str();
        loop {
            if self.domains.contains(rest) {
                return true;
            }
            match rest.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => rest = parent,
                _ => return false,
            }
        }
    }

    fn server_name_blocked(&self, packet: &[u8], header_len: usize) -> bool {
        let Ok(segment) = packet::tcp_payload(packet, 0, header_len) else {
            return false;
        };
        match tls::server_name(segment) {
            Ok(Some(name)) => {
                let blocked = self.domain_blocked(&name);
                log::debug!("TLS server {name} found, blocked={blocked}");
                blocked
            }
            Ok(None) => false,
            Err(e) => {
                log::debug!("TLS server name not found: {e}");
                false
            }
        }
    }
}

impl From<&AdmissionRules> for RuleSet {
    fn from(rules: &AdmissionRules) -> Self {
        Self {
            ports: rules.blocked_ports.iter().copied().collect(),
            addresses: rules.blocked_addresses.iter().copied().collect(),
            domains: rules
                .blocked_domains
                .iter()
                .map(|d| normalize_domain(d))
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }
}

pub struct RuleAdmissionOracle {
    rules: ArcSwap<RuleSet>,
}

impl RuleAdmissionOracle {
    pub fn new(rules: &AdmissionRules) -> Self {
        Self {
            rules: ArcSwap::from_pointee(RuleSet::from(rules)),
        }
    }

    /// Swap in a new rule set. Packets already being checked finish against
    /// the old one.
    pub fn replace(&self, rules: &AdmissionRules) {
        self.rules.store(Arc::new(RuleSet::from(rules)));
        log::info!(
            "admission rules replaced: {} ports, {} addresses, {} domains",
            rules.blocked_ports.len(),
            rules.blocked_addresses.len(),
            rules.blocked_domains.len()
        );
    }
}

impl AdmissionOracle for RuleAdmissionOracle {
    fn is_packet_allowed(&self, packet: &[u8]) -> Result<bool, GuardError> {
        let rules = self.rules.load();
        // Nothing to match against in a header we cannot read.
        let Ok(header) = packet::parse_ipv4_header(packet, 0) else {
            return Ok(true);
        };
        if rules.addresses.contains(&header.dst) {
            return Ok(false);
        }
        let port_blocked = packet::transport_ports(packet, 0, header.header_len)
            .is_ok_and(|ports| rules.ports.contains(&ports.dst));
        if port_blocked {
            return Ok(false);
        }
        if !rules.domains.is_empty()
            && header.protocol == packet::PROTO_TCP
            && rules.server_name_blocked(packet, header.header_len)
        {
            return Ok(false);
        }
        Ok(true)
    }
}
