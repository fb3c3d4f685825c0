use std::fs::File;
use std::io::{self, Write};
use std::time::Duration;
use csv::Writer;

use crate::core::report::Report;
use crate::core::runner::RunContext;
use crate::core::summary::{raw_histogram, HistogramRow};
use crate::reporters::Reporter;

/// CSV reporter for spreadsheet-compatible output
pub struct CsvReporter {
    output_file: Option<String>,
}

impl CsvReporter {
    /// Create a new CSV reporter
    pub fn new(output_file: Option<String>) -> Self {
        Self { output_file }
    }

    /// Create a CSV writer
    fn create_writer(&self) -> io::Result<Writer<Box<dyn Write>>> {
        match &self.output_file {
            Some(path) => {
                let file = File::create(path)?;
                Ok(csv::Writer::from_writer(Box::new(file) as Box<dyn Write>))
            }
            None => {
                Ok(csv::Writer::from_writer(Box::new(io::stdout()) as Box<dyn Write>))
            }
        }
    }

    /// Write one row per histogram bucket, `module,cpu,latency_us,samples`.
    pub fn write_rows<W: Write>(writer: &mut Writer<W>, rows: &[HistogramRow]) -> csv::Result<()> {
        writer.write_record(["module", "cpu", "latency_us", "samples"])?;
        for row in rows {
            let latency = row.latency_us.to_string();
            let samples = row.samples.to_string();
            writer.write_record([row.module.as_str(), row.cpu.as_str(), latency.as_str(), samples.as_str()])?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl Reporter for CsvReporter {
    fn report_start(&self, _run: &RunContext, _loads: &[&str], _measurements: &[&str]) {
        // CSV reporter doesn't output anything at start
    }

    fn report_progress(&self, _elapsed: Duration, _total: Duration) {}

    fn report_summary(&self, report: &Report) {
        self.report_histogram(&raw_histogram(report));
    }

    fn report_histogram(&self, rows: &[HistogramRow]) {
        let mut writer = match self.create_writer() {
            Ok(w) => w,
            Err(e) => {
                eprintln!("Error creating CSV writer: {}", e);
                return;
            }
        };
        if let Err(e) = Self::write_rows(&mut writer, rows) {
            eprintln!("Error writing CSV record: {}", e);
        }
    }

    fn report_warning(&self, message: &str) {
        eprintln!("WARNING: {}", message);
    }

    fn report_info(&self, _message: &str) {
        // CSV reporter doesn't output info messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_layout() {
        let rows = vec![
            HistogramRow { module: "cyclic".into(), cpu: "2".into(), latency_us: 3, samples: 120 },
            HistogramRow { module: "cyclic".into(), cpu: "3".into(), latency_us: 5, samples: 1 },
        ];
        let mut writer = csv::Writer::from_writer(Vec::new());
        CsvReporter::write_rows(&mut writer, &rows).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(text, "module,cpu,latency_us,samples\ncyclic,2,3,120\ncyclic,3,5,1\n");
    }
}
