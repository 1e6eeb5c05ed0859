// DNS malware detection by TXT marker.
//
// The filtering resolver answers a blocked lookup with a TXT record whose
// text is a fixed marker ("blocked:m" for malware). Seeing that marker in a
// response means the resolver classified the queried domain as malware.

use super::{DnsMalwareOracle, DnsMalwareVerdict};
use crate::dns;
use crate::error::GuardError;

pub const DEFAULT_MARKER: &str = "blocked:m";

pub struct TxtMarkerOracle {
    marker: String,
}

impl TxtMarkerOracle {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl Default for TxtMarkerOracle {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER)
    }
}

impl DnsMalwareOracle for TxtMarkerOracle {
    fn check_dns_malware(&self, payload: &[u8]) -> Result<DnsMalwareVerdict, GuardError> {
        let msg = match dns::parse_dns(payload) {
            Ok(m) => m,
            Err(e) => {
                log::trace!("DNS payload not parsed: {e}");
                return Ok(DnsMalwareVerdict::clean());
            }
        };
        if !msg.is_response || !msg.txt_strings().any(|s| s == self.marker) {
            return Ok(DnsMalwareVerdict::clean());
        }

        let domain = msg
            .query_name()
            .or_else(|| msg.answers.first().map(|a| a.name.trim_end_matches('.')))
            .unwrap_or_default();
        Ok(DnsMalwareVerdict::flagged(domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::test_messages::*;

    #[test]
    fn flags_marker_response() {
        let rdata = txt_rdata(&["blocked:m"]);
        let pkt = response(1, ("evil.test", TYPE_TXT), &[("evil.test", TYPE_TXT, &rdata)]);
        let verdict = TxtMarkerOracle::default().check_dns_malware(&pkt).unwrap();
        assert_eq!(verdict, DnsMalwareVerdict::flagged("evil.test"));
    }

    #[test]
    fn other_txt_is_clean() {
        let rdata = txt_rdata(&["blocked:t"]);
        let pkt = response(1, ("ads.test", TYPE_TXT), &[("ads.test", TYPE_TXT, &rdata)]);
        let verdict = TxtMarkerOracle::default().check_dns_malware(&pkt).unwrap();
        assert!(!verdict.flagged);
    }

    #[test]
    fn query_is_never_flagged() {
        let pkt = query(1, "evil.test", TYPE_TXT);
        let verdict = TxtMarkerOracle::default().check_dns_malware(&pkt).unwrap();
        assert!(!verdict.flagged);
    }

    #[test]
    fn a_only_response_is_clean() {
        let pkt = response(1, ("ok.test", TYPE_A), &[("ok.test", TYPE_A, &[1, 1, 1, 1])]);
        assert!(!TxtMarkerOracle::default().check_dns_malware(&pkt).unwrap().flagged);
    }

    #[test]
    fn garbage_is_clean_not_error() {
        let verdict = TxtMarkerOracle::default()
            .check_dns_malware(&[0xff, 0x00, 0x13])
            .unwrap();
        assert!(!verdict.flagged);
    }

    #[test]
    fn custom_marker() {
        let rdata = txt_rdata(&["malware"]);
        let pkt = response(1, ("evil.test", TYPE_TXT), &[("evil.test", TYPE_TXT, &rdata)]);
        let oracle = TxtMarkerOracle::new("malware");
        assert!(oracle.check_dns_malware(&pkt).unwrap().flagged);
    }
}
