use std::io::{self, Write};
use std::time::Duration;
use colored::*;
use chrono::Local;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::core::report::{Report, ReportNode};
use crate::core::runner::RunContext;
use crate::core::summary::HistogramRow;
use crate::reporters::Reporter;

/// Text reporter for console output
pub struct TextReporter {
    verbose: bool,
    quiet: bool,
    progress: ProgressBar,
}

impl TextReporter {
    /// Create a new text reporter
    pub fn new(verbose: bool, quiet: bool) -> Self {
        let progress = ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden());
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len}s {msg}")
        {
            progress.set_style(style.progress_chars("##-"));
        }
        Self { verbose, quiet, progress }
    }

    /// Format a duration in a human-readable format
    fn format_duration(&self, seconds: f64) -> String {
        let total_secs = seconds.round() as u64;
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    /// Format a module status with color
    fn format_status(&self, status: Option<&str>) -> ColoredString {
        match status {
            Some("reported") => "✓ REPORTED".green().bold(),
            Some("failed") => "✗ FAILED".red().bold(),
            Some("malformed") => "⚠ MALFORMED".yellow().bold(),
            Some("did_not_run") => "⏸ DID NOT RUN".blue().bold(),
            _ => "⋯ UNKNOWN".normal(),
        }
    }

    fn attributes(node: &ReportNode) -> String {
        node.attributes
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn print_family(&self, report: &Report, family: &str) {
        let modules: Vec<&ReportNode> = report.modules(family).collect();
        if modules.is_empty() {
            return;
        }
        println!("\n{}", family.to_uppercase().bold());
        let width = modules
            .iter()
            .filter_map(|m| m.attribute("name"))
            .map(str::len)
            .max()
            .unwrap_or(10);

        for module in modules {
            let name = module.attribute("name").unwrap_or("?");
            println!("{}: {}{}",
                name.cyan().bold(),
                " ".repeat(width - name.len() + 2),
                self.format_status(module.attribute("status")));
            if let Some(reason) = module.child_text("reason") {
                println!("    {}", reason);
            }
            if let Some(error) = module.find("error") {
                println!("    {}", error.attribute("reason").unwrap_or_default());
            }
            for fragment in module.children.iter().filter(|c| c.name != "reason" && c.name != "error") {
                for entry in &fragment.children {
                    let is_cpu = entry.name == "cpu";
                    if is_cpu && !self.verbose {
                        continue;
                    }
                    let label = match entry.attribute("id") {
                        Some(id) => format!("{} {}", entry.name, id),
                        None => entry.name.clone(),
                    };
                    let attrs: Vec<String> = entry
                        .attributes
                        .iter()
                        .filter(|(k, _)| k != "id")
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect();
                    match &entry.text {
                        Some(text) => println!("    {}: {}", label, text),
                        None => println!("    {}: {}", label, attrs.join(" ")),
                    }
                }
            }
        }
    }
}

impl Reporter for TextReporter {
    fn report_start(&self, run: &RunContext, loads: &[&str], measurements: &[&str]) {
        if self.quiet {
            return;
        }

        println!("{}", "RTEVAL RUN STARTING".bold());
        println!("===================");
        let now = Local::now();
        println!("Started: {}", now.format("%Y-%m-%d %H:%M:%S %Z"));
        println!("Duration: {}", self.format_duration(run.duration));
        println!("Loads: {}", loads.join(", ").cyan());
        if !measurements.is_empty() {
            println!("Measurement: {}", measurements.join(", ").cyan());
        }

        if self.verbose {
            println!("\nRun Configuration:");
            println!("  Work directory: {}", run.workdir.display());
            println!("  Report directory: {}", run.reportdir.display());
            let show = |cpus: &crate::core::cpus::CpuList| {
                if cpus.is_empty() { "unrestricted".to_string() } else { cpus.to_string() }
            };
            println!("  Load CPUs: {}", show(&run.partition.loads));
            println!("  Measurement CPUs: {}", show(&run.partition.measurement));
            if let Some(annotation) = &run.annotation {
                println!("  Annotation: {}", annotation);
            }
        }

        println!();
        let _ = io::stdout().flush();
        self.progress.set_length(run.duration.ceil() as u64);
        self.progress.set_position(0);
        self.progress.set_draw_target(ProgressDrawTarget::stderr());
    }

    fn report_progress(&self, elapsed: Duration, total: Duration) {
        if self.quiet {
            return;
        }
        self.progress.set_position(elapsed.as_secs());
        if elapsed >= total {
            self.progress.finish_and_clear();
        }
    }

    fn report_summary(&self, report: &Report) {
        if !self.progress.is_finished() {
            self.progress.finish_and_clear();
        }
        let run = report.run_info();
        let exit_code = run.and_then(|r| r.attribute("exit_code")).unwrap_or("?");
        let aborted = run.and_then(|r| r.attribute("aborted")) == Some("true");

        if self.quiet {
            println!("{} exit code {}",
                if exit_code == "0" { "✓ PASS".green().bold() } else { "✗ FAIL".red().bold() },
                exit_code);
            return;
        }

        let system = report.root().find("SystemInfo");
        println!("\n{}", "RTEVAL RESULTS".bold());
        println!("==============");
        println!("System: {}", system.and_then(|s| s.child_text("hostname")).unwrap_or("Unknown"));
        if let Some(kernel) = system.and_then(|s| s.child_text("kernel")) {
            println!("Kernel: {}", kernel);
        }
        if let Some(run) = run {
            if let Some(start) = run.child_text("start") {
                println!("Started: {}", start);
            }
            if let Some(duration) = run.child_text("duration").and_then(|d| d.parse::<f64>().ok()) {
                println!("Duration: {}", self.format_duration(duration));
            }
            if let Some(annotation) = run.child_text("annotate") {
                println!("Annotation: {}", annotation);
            }
            if self.verbose {
                println!("Run: {}", Self::attributes(run));
            }
        }

        self.print_family(report, crate::core::config::LOADS_SECTION);
        self.print_family(report, crate::core::config::MEASUREMENT_SECTION);

        println!();
        if aborted {
            println!("{}", "Run was interrupted; results cover a partial duration.".yellow().bold());
        }
        let verdict = if exit_code == "0" { "PASS".green().bold() } else { "FAIL".red().bold() };
        println!("{} {} (exit code {})", "OVERALL RESULT:".bold(), verdict, exit_code);
        let _ = io::stdout().flush();
    }

    fn report_histogram(&self, rows: &[HistogramRow]) {
        if rows.is_empty() {
            if !self.quiet {
                println!("No histogram data in report");
            }
            return;
        }
        println!("{:<12} {:>5} {:>12} {:>12}", "MODULE", "CPU", "LATENCY(us)", "SAMPLES");
        for row in rows {
            println!("{:<12} {:>5} {:>12} {:>12}", row.module, row.cpu, row.latency_us, row.samples);
        }
    }

    fn report_warning(&self, message: &str) {
        if self.quiet {
            return;
        }

        self.progress.suspend(|| eprintln!("{}: {}", "WARNING".yellow().bold(), message));
    }

    fn report_info(&self, message: &str) {
        if self.quiet {
            return;
        }

        if self.verbose {
            self.progress.suspend(|| println!("{}: {}", "INFO".blue().bold(), message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        let reporter = TextReporter::new(false, true);
        assert_eq!(reporter.format_duration(42.0), "42s");
        assert_eq!(reporter.format_duration(125.0), "2m 5s");
        assert_eq!(reporter.format_duration(3725.4), "1h 2m 5s");
    }

    #[test]
    fn test_quiet_progress_stays_hidden() {
        let reporter = TextReporter::new(false, true);
        reporter.report_start(&RunContext::default(), &["stress"], &["cyclic"]);
        reporter.report_progress(Duration::from_secs(1), Duration::from_secs(2));
        assert!(reporter.progress.is_hidden());
    }
}
