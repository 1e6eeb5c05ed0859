use std::io::Write;

use crate::error::GuardError;
use crate::replay::ReplayReport;

/// Write the replay report as JSON to the given writer.
pub fn write_json(report: &ReplayReport, writer: &mut impl Write) -> Result<(), GuardError> {
    serde_json::to_writer_pretty(&mut *writer, report)
        .map_err(|e| GuardError::Serialization(std::io::Error::other(e.to_string())))?;
    writeln!(writer).map_err(GuardError::Serialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::StatsSnapshot;

    fn sample() -> ReplayReport {
        ReplayReport {
            packets: 3,
            stats: StatsSnapshot {
                packets_read: 3,
                packets_written: 3,
                tcp_denied: 1,
                dns_flagged: 1,
                ..StatsSnapshot::default()
            },
            dropped: vec![1],
            flagged: vec!["evil.test".to_string()],
        }
    }

    #[test]
    fn json_is_valid() {
        let mut buf = Vec::new();
        write_json(&sample(), &mut buf).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed["packets"], 3);
        assert_eq!(parsed["stats"]["tcp_denied"], 1);
        assert_eq!(parsed["dropped"][0], 1);
        assert_eq!(parsed["flagged"][0], "evil.test");
    }

    #[test]
    fn empty_report() {
        let mut buf = Vec::new();
        write_json(&ReplayReport::default(), &mut buf).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert!(parsed["dropped"].as_array().unwrap().is_empty());
        assert!(parsed["flagged"].as_array().unwrap().is_empty());
    }
}
