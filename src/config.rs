// Runtime configuration, loaded from an optional JSON file.
//
// Every field has a default so an empty object (or no file at all) yields a
// working permissive setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::diag::DEFAULT_LOG_TAG;
use crate::error::GuardError;
use crate::oracle::bounded::{BoundedAdmission, BoundedDnsMalware};
use crate::oracle::rules::{AdmissionRules, RuleAdmissionOracle};
use crate::oracle::txt_marker::{DEFAULT_MARKER, TxtMarkerOracle};
use crate::oracle::{AdmissionOracle, DnsMalwareOracle};

pub const DEFAULT_RECORDER_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    /// Prefix of the per-direction diagnostic log targets.
    pub log_tag: String,
    pub admission: AdmissionRules,
    pub dns: DnsConfig,
    /// When set, oracles run behind a worker with this deadline.
    pub oracle_timeout_ms: Option<u64>,
    pub recorder_queue: usize,
    pub pcap_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DnsConfig {
    /// TXT text that marks a malware block.
    pub marker: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            log_tag: DEFAULT_LOG_TAG.to_string(),
            admission: AdmissionRules::default(),
            dns: DnsConfig::default(),
            oracle_timeout_ms: None,
            recorder_queue: DEFAULT_RECORDER_QUEUE,
            pcap_path: None,
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
        }
    }
}

impl GuardConfig {
    /// Load from `path`, or return the defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, GuardError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| GuardError::Config(format!("read {}: {e}", path.display())))?;
        let config = Self::from_json(&text).map_err(|e| match e {
            GuardError::Config(msg) => GuardError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })?;
        log::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, GuardError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| GuardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GuardError> {
        if self.log_tag.is_empty() {
            return Err(GuardError::Config("log_tag must not be empty".into()));
        }
        if self.dns.marker.is_empty() {
            return Err(GuardError::Config("dns.marker must not be empty".into()));
        }
        if self.recorder_queue == 0 {
            return Err(GuardError::Config("recorder_queue must be at least 1".into()));
        }
        if self.oracle_timeout_ms == Some(0) {
            return Err(GuardError::Config("oracle_timeout_ms must be at least 1".into()));
        }
        for domain in &self.admission.blocked_domains {
            let name = domain.trim_end_matches('.');
            if name.is_empty() || name.len() > 253 {
                return Err(GuardError::Config(format!(
                    "admission.blocked_domains: invalid domain '{domain}'"
                )));
            }
        }
        Ok(())
    }

    pub fn oracle_timeout(&self) -> Option<Duration> {
        self.oracle_timeout_ms.map(Duration::from_millis)
    }

    /// The rule oracle alone, for callers that replace its rules later.
    pub fn rule_oracle(&self) -> Arc<RuleAdmissionOracle> {
        Arc::new(RuleAdmissionOracle::new(&self.admission))
    }

    /// Admission oracle described by this configuration.
    pub fn admission_oracle(&self) -> Result<Arc<dyn AdmissionOracle>, GuardError> {
        self.wrap_admission(self.rule_oracle())
    }

    /// Put `rules` behind the configured deadline, if any.
    pub fn wrap_admission(
        &self,
        rules: Arc<RuleAdmissionOracle>,
    ) -> Result<Arc<dyn AdmissionOracle>, GuardError> {
        let oracle: Arc<dyn AdmissionOracle> = match self.oracle_timeout() {
            Some(timeout) => Arc::new(BoundedAdmission::spawn(rules, timeout)?),
            None => rules,
        };
        Ok(oracle)
    }

    /// Re-read `path`, fold in `overrides` and swap the resulting admission
    /// rules into `oracle`. On error the current rules stay active.
    pub fn reload_admission(
        path: &Path,
        overrides: impl FnOnce(&mut GuardConfig),
        oracle: &RuleAdmissionOracle,
    ) -> Result<(), GuardError> {
        let mut config = Self::load(Some(path))?;
        overrides(&mut config);
        config.validate()?;
        oracle.replace(&config.admission);
        Ok(())
    }

    /// DNS malware oracle described by this configuration.
    pub fn malware_oracle(&self) -> Result<Arc<dyn DnsMalwareOracle>, GuardError> {
        let marker = TxtMarkerOracle::new(self.dns.marker.clone());
        let oracle: Arc<dyn DnsMalwareOracle> = match self.oracle_timeout() {
            Some(timeout) => Arc::new(BoundedDnsMalware::spawn(marker, timeout)?),
            None => Arc::new(marker),
        };
        Ok(oracle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn empty_object_is_default() {
        let c = GuardConfig::from_json("{}").unwrap();
        assert_eq!(c, GuardConfig::default());
        assert_eq!(c.log_tag, "WireGuard/GoBackend");
        assert_eq!(c.dns.marker, "blocked:m");
        assert_eq!(c.recorder_queue, 64);
        assert!(c.oracle_timeout().is_none());
    }

    #[test]
    fn full_document() {
        let c = GuardConfig::from_json(
            r#"{
                "log_tag": "Guard",
                "admission": {
                    "blocked_ports": [25],
                    "blocked_addresses": ["203.0.113.9"],
                    "blocked_domains": ["tracker.example"]
                },
                "dns": {"marker": "malware"},
                "oracle_timeout_ms": 50,
                "recorder_queue": 8,
                "pcap_path": "/tmp/out.pcap"
            }"#,
        )
        .unwrap();
        assert_eq!(c.log_tag, "Guard");
        assert_eq!(c.admission.blocked_ports, vec![25]);
        assert_eq!(
            c.admission.blocked_addresses,
            vec![Ipv4Addr::new(203, 0, 113, 9)]
        );
        assert_eq!(c.admission.blocked_domains, vec!["tracker.example"]);
        assert_eq!(c.dns.marker, "malware");
        assert_eq!(c.oracle_timeout(), Some(Duration::from_millis(50)));
        assert_eq!(c.pcap_path, Some(PathBuf::from("/tmp/out.pcap")));
    }

    #[test]
    fn unknown_field_rejected() {
        let err = GuardConfig::from_json(r#"{"log_tga": "x"}"#).unwrap_err();
        assert!(matches!(err, GuardError::Config(_)));
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(GuardConfig::from_json(r#"{"recorder_queue": 0}"#).is_err());
        assert!(GuardConfig::from_json(r#"{"dns": {"marker": ""}}"#).is_err());
        assert!(GuardConfig::from_json(r#"{"oracle_timeout_ms": 0}"#).is_err());
        assert!(GuardConfig::from_json(r#"{"admission": {"blocked_ports": [70000]}}"#).is_err());
        assert!(GuardConfig::from_json(r#"{"admission": {"blocked_domains": ["."]}}"#).is_err());
    }

    #[test]
    fn reload_swaps_rules_and_keeps_them_on_error() {
        let path = std::env::temp_dir().join(format!("tunguard-reload-{}.json", std::process::id()));
        let smtp = crate::packet::test_packets::PacketBuilder::tcp()
            .ports(40000, 25)
            .build();
        let oracle = GuardConfig::default().rule_oracle();
        assert!(oracle.is_packet_allowed(&smtp).unwrap());

        std::fs::write(&path, r#"{"admission": {"blocked_ports": [25]}}"#).unwrap();
        GuardConfig::reload_admission(&path, |_| {}, &oracle).unwrap();
        assert!(!oracle.is_packet_allowed(&smtp).unwrap());

        std::fs::write(&path, r#"{"admission": {"blocked_ports": "#).unwrap();
        assert!(GuardConfig::reload_admission(&path, |_| {}, &oracle).is_err());
        assert!(!oracle.is_packet_allowed(&smtp).unwrap());

        std::fs::write(&path, "{}").unwrap();
        GuardConfig::reload_admission(&path, |c| c.admission.blocked_ports = vec![25], &oracle)
            .unwrap();
        assert!(!oracle.is_packet_allowed(&smtp).unwrap());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn wrapped_rules_see_replacements() {
        let mut c = GuardConfig::default();
        c.oracle_timeout_ms = Some(1000);
        let rules = c.rule_oracle();
        let admission = c.wrap_admission(rules.clone()).unwrap();
        let smtp = crate::packet::test_packets::PacketBuilder::tcp()
            .ports(40000, 25)
            .build();
        assert!(admission.is_packet_allowed(&smtp).unwrap());
        rules.replace(&AdmissionRules {
            blocked_ports: vec![25],
            ..AdmissionRules::default()
        });
        assert!(!admission.is_packet_allowed(&smtp).unwrap());
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = GuardConfig::load(Some(Path::new("/nonexistent/tunguard.json"))).unwrap_err();
        assert!(matches!(err, GuardError::Config(_)));
        assert!(GuardConfig::load(None).is_ok());
    }

    #[test]
    fn builds_oracles() {
        let mut c = GuardConfig::default();
        c.admission.blocked_ports = vec![25];
        let admission = c.admission_oracle().unwrap();
        let smtp = crate::packet::test_packets::PacketBuilder::tcp()
            .ports(40000, 25)
            .build();
        assert!(!admission.is_packet_allowed(&smtp).unwrap());

        c.oracle_timeout_ms = Some(1000);
        let bounded = c.admission_oracle().unwrap();
        assert!(!bounded.is_packet_allowed(&smtp).unwrap());
        assert!(!c.malware_oracle().unwrap().check_dns_malware(&[]).unwrap().flagged);
    }
}
