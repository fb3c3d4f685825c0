//! Scripted module used by the framework's own tests.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::config::ConfigStore;
use crate::core::cpus::CpuList;
use crate::core::error::{Result, RtevalError};
use crate::core::module::{Module, ModuleContext, ModuleKind};
use crate::core::registry::ModuleRegistry;
use crate::core::report::{ReportNode, ResultFragment};
use crate::core::signal::{CancelToken, StartSignal};

/// Which lifecycle calls fail or panic.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub fail_setup: bool,
    pub fail_start: bool,
    pub fail_unleash: bool,
    pub fail_stop: bool,
    pub panic_stop: bool,
    pub malformed_report: bool,
}

/// Shared, ordered record of `name:event` entries across modules.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, name: &str, event: &str) {
        self.0.lock().unwrap().push(format!("{}:{}", name, event));
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.events().iter().position(|e| e == entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }
}

pub struct MockModule {
    name: String,
    kind: ModuleKind,
    script: Script,
    journal: Journal,
    cpus: CpuList,
    signal: Option<StartSignal>,
}

impl MockModule {
    pub fn new(name: &str, kind: ModuleKind, script: Script, journal: Journal) -> Self {
        Self { name: name.to_string(), kind, script, journal, cpus: CpuList::empty(), signal: None }
    }

    fn step(&self, event: &str, fail: bool) -> Result<()> {
        self.journal.record(&self.name, event);
        if fail {
            return Err(RtevalError::runtime(&self.name, format!("scripted {} failure", event)));
        }
        Ok(())
    }
}

impl Module for MockModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ModuleKind {
        self.kind
    }

    fn setup(&mut self, ctx: ModuleContext) -> Result<()> {
        self.cpus = ctx.cpus;
        self.signal = Some(ctx.start_signal);
        self.journal.record(&self.name, "setup");
        if self.script.fail_setup {
            return Err(RtevalError::setup(&self.name, "scripted setup failure"));
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.step("start", self.script.fail_start)
    }

    fn unleash(&mut self, signal: &StartSignal) -> Result<()> {
        if let Some(own) = &self.signal {
            assert!(own.same_as(signal), "unleashed with a foreign start signal");
        }
        self.step("unleash", self.script.fail_unleash)
    }

    fn stop(&mut self, _grace: Duration) -> Result<()> {
        if self.script.panic_stop {
            self.journal.record(&self.name, "stop");
            panic!("scripted stop panic");
        }
        self.step("stop", self.script.fail_stop)
    }

    fn make_report(&mut self) -> Result<ResultFragment> {
        self.journal.record(&self.name, "report");
        let name = if self.script.malformed_report { "not valid" } else { self.name.as_str() };
        Ok(ReportNode::new(name).attr("cpus", &self.cpus))
    }

    fn cleanup(&mut self) -> Result<()> {
        self.step("cleanup", false)
    }
}

/// Context with an empty config section and no CPU restriction.
pub fn context() -> ModuleContext {
    ModuleContext {
        config: ConfigStore::new().section("mock"),
        cpus: CpuList::empty(),
        workdir: PathBuf::from("."),
        start_signal: StartSignal::new(),
        cancel: CancelToken::new(),
    }
}

/// Registry made only of scripted modules, all enabled by default.
pub fn registry(modules: &[(&str, ModuleKind, Script)], journal: &Journal) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    for (name, kind, script) in modules {
        let (name, kind, script, journal) = (name.to_string(), *kind, script.clone(), journal.clone());
        registry
            .register(&name.clone(), kind, "scripted test module", Vec::new(), true, move |_log| {
                Box::new(MockModule::new(&name, kind, script.clone(), journal.clone()))
            })
            .unwrap();
    }
    registry
}
