// Policy oracles consulted by the filters.
//
// Both oracles are capabilities injected at construction. Production hosts
// back them with whatever crosses into their policy engine; tests use
// in-process fakes. An `Err` from either oracle means "no answer" and the
// filters fail open on it.

pub mod bounded;
pub mod rules;
pub mod txt_marker;

use std::sync::Arc;

use crate::error::GuardError;

/// Outcome of a DNS malware check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsMalwareVerdict {
    pub flagged: bool,
    /// Domain the verdict refers to. Empty when not flagged.
    pub domain: String,
}

impl DnsMalwareVerdict {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn flagged(domain: impl Into<String>) -> Self {
        Self {
            flagged: true,
            domain: domain.into(),
        }
    }
}

/// Decides whether a TCP packet may proceed.
pub trait AdmissionOracle: Send + Sync {
    /// `packet` is the whole IP packet, header included.
    fn is_packet_allowed(&self, packet: &[u8]) -> Result<bool, GuardError>;
}

/// Inspects a DNS message (the UDP payload) for malware indicators.
pub trait DnsMalwareOracle: Send + Sync {
    fn check_dns_malware(&self, payload: &[u8]) -> Result<DnsMalwareVerdict, GuardError>;
}

impl<T: AdmissionOracle + ?Sized> AdmissionOracle for Arc<T> {
    fn is_packet_allowed(&self, packet: &[u8]) -> Result<bool, GuardError> {
        (**self).is_packet_allowed(packet)
    }
}

impl<T: DnsMalwareOracle + ?Sized> DnsMalwareOracle for Arc<T> {
    fn check_dns_malware(&self, payload: &[u8]) -> Result<DnsMalwareVerdict, GuardError> {
        (**self).check_dns_malware(payload)
    }
}

/// Admits every packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AdmissionOracle for AllowAll {
    fn is_packet_allowed(&self, _packet: &[u8]) -> Result<bool, GuardError> {
        Ok(true)
    }
}

/// Never flags anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverFlag;

impl DnsMalwareOracle for NeverFlag {
    fn check_dns_malware(&self, _payload: &[u8]) -> Result<DnsMalwareVerdict, GuardError> {
        Ok(DnsMalwareVerdict::clean())
    }
}
