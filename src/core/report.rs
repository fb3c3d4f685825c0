//! The report tree and the merge of per-module fragments into it.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Deserialize};

use crate::core::group::{ModuleOutcome, ModuleReport};
use crate::core::hardware::SystemInfo;
use crate::core::runner::RunContext;

/// Root element of every report document.
pub const REPORT_ROOT: &str = "rteval";

/// One element of the report tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ReportNode>,
}

/// Structured output one module contributes to the report.
pub type ResultFragment = ReportNode;

impl ReportNode {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), attributes: Vec::new(), text: None, children: Vec::new() }
    }

    /// Leaf element holding `value` as text.
    pub fn value(name: &str, value: impl ToString) -> Self {
        Self::new(name).with_text(value.to_string())
    }

    pub fn attr(mut self, key: &str, value: impl ToString) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn child(mut self, child: ReportNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn push(&mut self, child: ReportNode) {
        self.children.push(child);
    }

    pub fn set_attr(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// First direct child called `name`.
    pub fn find(&self, name: &str) -> Option<&ReportNode> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ReportNode> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Text of the direct child `name`, if any.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.find(name).and_then(|child| child.text.as_deref())
    }

    /// Basic well-formedness: element and attribute names are XML names,
    /// attribute keys are unique per element and no text carries control
    /// characters that cannot be represented in a document.
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_name(&self.name) {
            return Err(format!("invalid element name '{}'", self.name));
        }
        for (index, (key, value)) in self.attributes.iter().enumerate() {
            if !is_valid_name(key) {
                return Err(format!("invalid attribute name '{}' on <{}>", key, self.name));
            }
            if self.attributes[..index].iter().any(|(k, _)| k == key) {
                return Err(format!("duplicate attribute '{}' on <{}>", key, self.name));
            }
            check_text(value).map_err(|c| {
                format!("attribute '{}' on <{}> contains control character {:#04x}", key, self.name, c)
            })?;
        }
        if let Some(text) = &self.text {
            check_text(text).map_err(|c| {
                format!("text of <{}> contains control character {:#04x}", self.name, c)
            })?;
        }
        self.children.iter().try_for_each(ReportNode::validate)
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    first_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.to_ascii_lowercase().starts_with("xml")
}

fn check_text(text: &str) -> Result<(), u32> {
    match text.chars().find(|c| (*c as u32) < 0x20 && !matches!(c, '\t' | '\n' | '\r')) {
        Some(c) => Err(c as u32),
        None => Ok(()),
    }
}

/// A finished, immutable report.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    root: ReportNode,
    warnings: Vec<String>,
}

impl Report {
    /// Wrap an existing tree, e.g. one read back from disk.
    pub fn from_root(root: ReportNode) -> Self {
        Self { root, warnings: Vec::new() }
    }

    pub fn root(&self) -> &ReportNode {
        &self.root
    }

    /// Merge warnings raised while assembling.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn run_info(&self) -> Option<&ReportNode> {
        self.root.find("run_info")
    }

    /// Module nodes of one family section, in group order.
    pub fn modules<'a>(&'a self, family: &'a str) -> impl Iterator<Item = &'a ReportNode> + 'a {
        self.root.find(family).into_iter().flat_map(|f| f.children_named("module"))
    }
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct ReportAssembler;

impl ReportAssembler {
    /// Merge system identity, run metadata and module fragments into one
    /// tree. Performs no I/O. Malformed fragments are replaced by an `error`
    /// placeholder and noted in the report's warnings.
    pub fn assemble(
        system: Result<&SystemInfo, String>,
        run: &RunContext,
        loads: &[ModuleReport],
        measurements: &[ModuleReport],
    ) -> Report {
        let mut warnings = Vec::new();
        let mut root = ReportNode::new(REPORT_ROOT).attr("version", env!("CARGO_PKG_VERSION"));

        root.push(match system {
            Ok(info) => info.to_report_node(),
            Err(reason) => {
                warnings.push(format!("System information unavailable: {}", reason));
                ReportNode::new("SystemInfo").attr("status", "unavailable").attr("reason", reason)
            }
        });
        root.push(Self::run_node(run));
        root.push(Self::family_node(crate::core::config::LOADS_SECTION, loads, &mut warnings));
        if !measurements.is_empty() {
            root.push(Self::family_node(
                crate::core::config::MEASUREMENT_SECTION,
                measurements,
                &mut warnings,
            ));
        }

        Report { root, warnings }
    }

    fn run_node(run: &RunContext) -> ReportNode {
        let mut node = ReportNode::new("run_info")
            .attr("aborted", run.aborted)
            .attr("exit_code", run.exit_code)
            .child(ReportNode::value("duration", run.duration))
            .child(ReportNode::value("workdir", run.workdir.display()))
            .child(ReportNode::value("reportdir", run.reportdir.display()))
            .child(ReportNode::value("loads_cpulist", &run.partition.loads))
            .child(ReportNode::value("measurement_cpulist", &run.partition.measurement));
        if let Some(annotation) = &run.annotation {
            node.push(ReportNode::value("annotate", annotation));
        }
        if let Some(start) = &run.start {
            node.push(ReportNode::value("start", timestamp(start)));
        }
        if let Some(end) = &run.end {
            node.push(ReportNode::value("end", timestamp(end)));
        }
        node
    }

    fn family_node(family: &str, reports: &[ModuleReport], warnings: &mut Vec<String>) -> ReportNode {
        let mut node = ReportNode::new(family).attr("count", reports.len());
        for report in reports {
            let mut module = ReportNode::new("module").attr("name", &report.name);
            if let Some(started) = &report.started_at {
                module.set_attr("started", timestamp(started));
            }
            if let Some(stopped) = &report.stopped_at {
                module.set_attr("stopped", timestamp(stopped));
            }
            match &report.outcome {
                ModuleOutcome::Reported(fragment) => match fragment.validate() {
                    Ok(()) => {
                        module.set_attr("status", "reported");
                        module.push(fragment.clone());
                    }
                    Err(reason) => {
                        warnings.push(format!("Malformed report fragment from {}: {}", report.name, reason));
                        module.set_attr("status", "malformed");
                        module.push(
                            ReportNode::new("error").attr("module", &report.name).attr("reason", reason),
                        );
                    }
                },
                ModuleOutcome::DidNotRun(reason) => {
                    module.set_attr("status", "did_not_run");
                    module.push(ReportNode::value("reason", reason));
                }
                ModuleOutcome::Failed(reason) => {
                    module.set_attr("status", "failed");
                    module.push(ReportNode::value("reason", reason));
                }
            }
            node.push(module);
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::module::ModuleKind;
    use crate::core::cpus::{CpuList, CpuPartition};
    use std::path::PathBuf;

    fn run_context() -> RunContext {
        RunContext {
            workdir: PathBuf::from("/tmp"),
            reportdir: PathBuf::from("/tmp/rteval-test"),
            duration: 60.0,
            annotation: Some("nightly".to_string()),
            start: Some(Utc::now()),
            end: Some(Utc::now()),
            exit_code: 0,
            aborted: false,
            partition: CpuPartition {
                loads: CpuList::new([0, 1]),
                measurement: CpuList::new([2, 3]),
            },
        }
    }

    fn reported(name: &str, kind: ModuleKind, fragment: ReportNode) -> ModuleReport {
        ModuleReport {
            name: name.to_string(),
            kind,
            outcome: ModuleOutcome::Reported(fragment),
            started_at: Some(Utc::now()),
            stopped_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(ReportNode::new("cyclic").validate().is_ok());
        assert!(ReportNode::new("1cyclic").validate().is_err());
        assert!(ReportNode::new("with space").validate().is_err());
        assert!(ReportNode::new("xmlthing").validate().is_err());
        assert!(ReportNode::new("ok").attr("bad key", 1).validate().is_err());
        assert!(ReportNode::new("ok").child(ReportNode::new("")).validate().is_err());
        assert!(ReportNode::value("ok", "bell\u{7}").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_attributes() {
        let mut node = ReportNode::new("ok");
        node.attributes.push(("a".into(), "1".into()));
        node.attributes.push(("a".into(), "2".into()));
        assert!(node.validate().is_err());
    }

    #[test]
    fn test_assemble_orders_sections() {
        let loads = vec![
            reported("stress", ModuleKind::Load, ReportNode::new("stress")),
            reported("hackbench", ModuleKind::Load, ReportNode::new("hackbench")),
        ];
        let measurements = vec![reported("cyclic", ModuleKind::Measurement, ReportNode::new("cyclic"))];

        let report = ReportAssembler::assemble(Err("no sysfs".into()), &run_context(), &loads, &measurements);
        let names: Vec<&str> = report.root().children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["SystemInfo", "run_info", "loads", "measurement"]);

        let load_names: Vec<&str> = report.modules("loads").filter_map(|m| m.attribute("name")).collect();
        assert_eq!(load_names, vec!["stress", "hackbench"]);
        assert_eq!(report.root().attribute("version"), Some(env!("CARGO_PKG_VERSION")));
        assert_eq!(report.warnings().len(), 1);
    }

    #[test]
    fn test_malformed_fragment_becomes_placeholder() {
        let loads = vec![
            reported("stress", ModuleKind::Load, ReportNode::new("bad name")),
            reported("hackbench", ModuleKind::Load, ReportNode::new("hackbench")),
        ];
        let report = ReportAssembler::assemble(Err("n/a".into()), &run_context(), &loads, &[]);

        let modules: Vec<&ReportNode> = report.modules("loads").collect();
        assert_eq!(modules[0].attribute("status"), Some("malformed"));
        let placeholder = modules[0].find("error").unwrap();
        assert_eq!(placeholder.attribute("module"), Some("stress"));
        assert_eq!(modules[1].attribute("status"), Some("reported"));
        assert!(report.root().validate().is_ok());
        assert!(report.warnings().iter().any(|w| w.contains("stress")));
    }

    #[test]
    fn test_absent_modules_are_listed_with_reason() {
        let loads = vec![ModuleReport {
            name: "hackbench".into(),
            kind: ModuleKind::Load,
            outcome: ModuleOutcome::DidNotRun("hackbench not found in PATH".into()),
            started_at: None,
            stopped_at: None,
        }];
        let report = ReportAssembler::assemble(Err("n/a".into()), &run_context(), &loads, &[]);
        let module = report.modules("loads").next().unwrap();
        assert_eq!(module.attribute("status"), Some("did_not_run"));
        assert_eq!(module.child_text("reason"), Some("hackbench not found in PATH"));
        assert!(report.root().find("measurement").is_none());
    }

    #[test]
    fn test_run_info_carries_context() {
        let report = ReportAssembler::assemble(Err("n/a".into()), &run_context(), &[], &[]);
        let run = report.run_info().unwrap();
        assert_eq!(run.child_text("duration"), Some("60"));
        assert_eq!(run.child_text("annotate"), Some("nightly"));
        assert_eq!(run.child_text("loads_cpulist"), Some("0-1"));
        assert_eq!(run.child_text("measurement_cpulist"), Some("2-3"));
        assert_eq!(run.attribute("aborted"), Some("false"));
    }
}
