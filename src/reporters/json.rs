use std::io::{self, Write};
use std::fs::File;
use std::time::Duration;
use serde_json::{json, Value};

use crate::core::report::{Report, ReportNode};
use crate::core::runner::RunContext;
use crate::core::summary::HistogramRow;
use crate::reporters::Reporter;

/// JSON reporter for machine-readable output
pub struct JsonReporter {
    output_file: Option<String>,
    verbose: bool,
}

impl JsonReporter {
    /// Create a new JSON reporter
    pub fn new(output_file: Option<String>, verbose: bool) -> Self {
        Self { output_file, verbose }
    }

    /// Report node as a JSON object: attributes as fields, text under
    /// `value`, children grouped by element name.
    pub fn node_to_json(node: &ReportNode) -> Value {
        let mut object = serde_json::Map::new();
        for (key, value) in &node.attributes {
            object.insert(key.clone(), Value::String(value.clone()));
        }
        if let Some(text) = &node.text {
            object.insert("value".to_string(), Value::String(text.clone()));
        }
        for child in &node.children {
            let rendered = Self::node_to_json(child);
            match object.get_mut(&child.name) {
                Some(Value::Array(items)) => items.push(rendered),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, rendered]);
                }
                None => {
                    object.insert(child.name.clone(), rendered);
                }
            }
        }
        Value::Object(object)
    }

    /// Write JSON to file or stdout
    fn write_json(&self, json_value: Value) -> io::Result<()> {
        let json_string = serde_json::to_string_pretty(&json_value)?;

        match &self.output_file {
            Some(path) => {
                let mut file = File::create(path)?;
                file.write_all(json_string.as_bytes())?;
            }
            None => {
                println!("{}", json_string);
            }
        }

        Ok(())
    }

    /// Emit a progress event; never written to the output file.
    fn event(&self, value: Value) {
        if self.verbose && self.output_file.is_none() {
            let _ = self.write_json(value);
        }
    }
}

impl Reporter for JsonReporter {
    fn report_start(&self, run: &RunContext, loads: &[&str], measurements: &[&str]) {
        self.event(json!({
            "event": "run_start",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "run": run,
            "loads": loads,
            "measurement": measurements,
        }));
    }

    fn report_progress(&self, _elapsed: Duration, _total: Duration) {
        // progress is only meaningful on a terminal
    }

    fn report_summary(&self, report: &Report) {
        let mut document = serde_json::Map::new();
        document.insert(report.root().name.clone(), Self::node_to_json(report.root()));
        if !report.warnings().is_empty() {
            document.insert("warnings".to_string(), json!(report.warnings()));
        }
        if let Err(e) = self.write_json(Value::Object(document)) {
            eprintln!("Error writing JSON output: {}", e);
        }
    }

    fn report_histogram(&self, rows: &[HistogramRow]) {
        if let Err(e) = self.write_json(json!({ "histogram": rows })) {
            eprintln!("Error writing JSON output: {}", e);
        }
    }

    fn report_warning(&self, message: &str) {
        self.event(json!({
            "event": "warning",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "message": message,
        }));
    }

    fn report_info(&self, message: &str) {
        self.event(json!({
            "event": "info",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "message": message,
        }));
    }
}
