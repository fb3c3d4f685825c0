pub mod text;
pub mod json;
pub mod csv;

use std::time::Duration;

use crate::core::report::Report;
use crate::core::runner::RunContext;
use crate::core::summary::HistogramRow;

/// Reporter trait for operator-facing output of a run
pub trait Reporter {
    /// Report that the measured portion of a run has begun
    fn report_start(&self, run: &RunContext, loads: &[&str], measurements: &[&str]);

    /// Report elapsed time of the measured portion
    fn report_progress(&self, elapsed: Duration, total: Duration);

    /// Render a finished (or re-loaded) report
    fn report_summary(&self, report: &Report);

    /// Render flattened latency histograms
    fn report_histogram(&self, rows: &[HistogramRow]);

    /// Report a warning message
    fn report_warning(&self, message: &str);

    /// Report an informational message
    fn report_info(&self, message: &str);
}

/// Output format selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

/// Build the reporter for `format`.
pub fn create(
    format: OutputFormat,
    output_file: Option<String>,
    verbose: bool,
    quiet: bool,
) -> Box<dyn Reporter + Send + Sync> {
    match format {
        OutputFormat::Text => Box::new(text::TextReporter::new(verbose, quiet)),
        OutputFormat::Json => Box::new(json::JsonReporter::new(output_file, verbose)),
        OutputFormat::Csv => Box::new(csv::CsvReporter::new(output_file)),
    }
}
