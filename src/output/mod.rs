pub mod json;
pub mod tsv;

use std::io::Write;

use crate::cli::OutputFormat;
use crate::error::GuardError;
use crate::replay::ReplayReport;

/// Write a replay report in the specified format.
pub fn write_report(
    report: &ReplayReport,
    format: OutputFormat,
    writer: &mut impl Write,
) -> Result<(), GuardError> {
    match format {
        OutputFormat::Tsv => tsv::write_tsv(report, writer),
        OutputFormat::Json => json::write_json(report, writer),
    }
}
