use std::io::Write;

use crate::error::GuardError;
use crate::replay::ReplayReport;

/// Write the replay report as TSV.
///
/// Output: header row, one `stat` row per counter, then one `dropped` row
/// per dropped capture index and one `flagged` row per reported domain.
/// Columns are tab-separated: kind, key, value.
pub fn write_tsv(report: &ReplayReport, writer: &mut impl Write) -> Result<(), GuardError> {
    let s = &report.stats;
    let counters = [
        ("packets", report.packets as u64),
        ("packets_read", s.packets_read),
        ("packets_written", s.packets_written),
        ("tcp_denied", s.tcp_denied),
        ("dns_flagged", s.dns_flagged),
        ("empty", s.empty),
        ("malformed", s.malformed),
        ("unsupported", s.unsupported),
        ("oracle_failures", s.oracle_failures),
    ];

    writeln!(writer, "kind\tkey\tvalue").map_err(GuardError::Serialization)?;
    for (key, value) in counters {
        writeln!(writer, "stat\t{key}\t{value}").map_err(GuardError::Serialization)?;
    }
    for index in &report.dropped {
        writeln!(writer, "dropped\tindex\t{index}").map_err(GuardError::Serialization)?;
    }
    for domain in &report.flagged {
        writeln!(writer, "flagged\tdomain\t{}", escape_tsv(domain))
            .map_err(GuardError::Serialization)?;
    }

    Ok(())
}

/// Escape tabs and newlines in a string for TSV output.
fn escape_tsv(s: &str) -> String {
    s.replace(['\t', '\n', '\r'], " ")
}
