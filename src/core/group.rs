use std::time::Duration;
use chrono::{DateTime, Utc};

use crate::core::error::{Result, RtevalError};
use crate::core::logging::LogHandle;
use crate::core::module::{Module, ModuleContext, ModuleHandle, ModuleKind, ModuleState};
use crate::core::report::ResultFragment;
use crate::core::signal::StartSignal;

/// What a module contributed to the run.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleOutcome {
    Reported(ResultFragment),
    /// Excluded before starting, usually a setup failure.
    DidNotRun(String),
    /// Started but failed at runtime, or produced no report.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ModuleReport {
    pub name: String,
    pub kind: ModuleKind,
    pub outcome: ModuleOutcome,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ModuleReport {
    pub fn is_reported(&self) -> bool {
        matches!(self.outcome, ModuleOutcome::Reported(_))
    }
}

/// All modules of one family, driven through their lifecycle in lock-step.
///
/// Iteration follows insertion order except for [`ModuleGroup::stop_all`],
/// which walks the members in reverse.
#[derive(Debug)]
pub struct ModuleGroup {
    kind: ModuleKind,
    members: Vec<ModuleHandle>,
    signal: StartSignal,
    log: LogHandle,
}

impl ModuleGroup {
    pub fn new(kind: ModuleKind, log: &LogHandle) -> Self {
        Self {
            kind,
            members: Vec::new(),
            signal: StartSignal::new(),
            log: log.scoped(kind.section()),
        }
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.members.iter().map(ModuleHandle::name).collect()
    }

    pub fn state_of(&self, name: &str) -> Option<ModuleState> {
        self.members.iter().find(|m| m.name() == name).map(ModuleHandle::state)
    }

    pub fn start_signal(&self) -> &StartSignal {
        &self.signal
    }

    /// Logging handle for a member, scoped under this group.
    pub fn member_log(&self, name: &str) -> LogHandle {
        self.log.scoped(name)
    }

    pub fn add(&mut self, module: Box<dyn Module>) -> Result<()> {
        if module.kind() != self.kind {
            return Err(RtevalError::Config(format!(
                "Module {} is a {} module and cannot join the {} group",
                module.name(), module.kind(), self.kind
            )));
        }
        if self.members.iter().any(|m| m.name() == module.name()) {
            return Err(RtevalError::Config(format!(
                "Module {} is listed more than once", module.name()
            )));
        }
        let log = self.member_log(module.name());
        self.members.push(ModuleHandle::new(module, log));
        Ok(())
    }

    /// Members still able to run (set up and not failed).
    pub fn runnable(&self) -> usize {
        self.members
            .iter()
            .filter(|m| matches!(m.state(), ModuleState::Ready | ModuleState::Running))
            .count()
    }

    /// Set up every member. Individual failures are recorded and tolerated;
    /// a group left with no runnable member is a prepare error.
    pub fn setup_all<F>(&mut self, mut context_for: F) -> Result<usize>
    where
        F: FnMut(&str) -> ModuleContext,
    {
        let mut failures = Vec::new();
        for member in &mut self.members {
            let mut ctx = context_for(member.name());
            ctx.start_signal = self.signal.clone();
            if let Err(e) = member.setup(ctx) {
                self.log.warn(format!("{}; module excluded from this run", e));
                failures.push(format!("{}: {}", member.name(), member.failure().unwrap_or("unknown")));
            }
        }

        let runnable = self.runnable();
        if runnable == 0 {
            let detail = if failures.is_empty() {
                "none configured".to_string()
            } else {
                failures.join("; ")
            };
            return Err(RtevalError::Prepare(format!(
                "No runnable {} modules ({})", self.kind, detail
            )));
        }
        self.log.info(format!("{} of {} {} modules ready", runnable, self.members.len(), self.kind));
        Ok(runnable)
    }

    /// Start every ready member; returns how many reached `Running`.
    pub fn start_all(&mut self) -> usize {
        let mut started = 0;
        for member in self.members.iter_mut().filter(|m| m.state() == ModuleState::Ready) {
            self.log.debug(format!("starting {}", member.name()));
            match member.start() {
                Ok(()) => started += 1,
                Err(e) => self.log.error(e),
            }
        }
        started
    }

    /// Unleash every running member, then release the shared start signal.
    pub fn unleash_all(&mut self) -> usize {
        let mut unleashed = 0;
        for member in self.members.iter_mut().filter(|m| m.state() == ModuleState::Running) {
            match member.unleash(&self.signal) {
                Ok(()) => unleashed += 1,
                Err(e) => self.log.error(e),
            }
        }
        self.signal.release();
        unleashed
    }

    /// Stop members in reverse insertion order; returns how many stopped
    /// cleanly.
    pub fn stop_all(&mut self, grace: Duration) -> usize {
        let mut stopped = 0;
        for member in self.members.iter_mut().rev() {
            let running = member.state() == ModuleState::Running;
            let stranded = member.state() == ModuleState::Failed && member.start_attempted();
            if !running && !stranded {
                continue;
            }
            self.log.debug(format!("stopping {}", member.name()));
            match member.stop(grace) {
                Ok(()) if running => stopped += 1,
                Ok(()) => {}
                Err(e) => self.log.error(e),
            }
        }
        stopped
    }

    /// Collect fragments from stopped members, recording every other member
    /// as absent with the reason.
    pub fn collect_reports(&mut self) -> Vec<ModuleReport> {
        let mut reports = Vec::with_capacity(self.members.len());
        for member in &mut self.members {
            let outcome = match member.state() {
                ModuleState::Stopped => match member.make_report() {
                    Ok(fragment) => ModuleOutcome::Reported(fragment),
                    Err(e) => {
                        self.log.error(&e);
                        ModuleOutcome::Failed(member.failure().unwrap_or("report failed").to_string())
                    }
                },
                ModuleState::Failed if !member.was_prepared() => {
                    ModuleOutcome::DidNotRun(member.failure().unwrap_or("setup failed").to_string())
                }
                ModuleState::Failed => {
                    ModuleOutcome::Failed(member.failure().unwrap_or("failed").to_string())
                }
                other => ModuleOutcome::DidNotRun(format!("module left in state {:?}", other)),
            };
            reports.push(ModuleReport {
                name: member.name().to_string(),
                kind: member.kind(),
                outcome,
                started_at: member.started_at(),
                stopped_at: member.stopped_at(),
            });
        }
        reports
    }

    pub fn cleanup_all(&mut self) {
        for member in &mut self.members {
            if let Err(e) = member.cleanup() {
                self.log.warn(format!("cleanup of {} failed: {}", member.name(), e));
            }
        }
    }

    /// Whether every member reached `Reported`.
    pub fn all_reported(&self) -> bool {
        self.members.iter().all(|m| m.state() == ModuleState::Reported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{context, Journal, MockModule, Script};

    fn group(modules: &[(&str, Script)], journal: &Journal) -> ModuleGroup {
        let mut group = ModuleGroup::new(ModuleKind::Load, &LogHandle::silent());
        for (name, script) in modules {
            let module = MockModule::new(name, ModuleKind::Load, script.clone(), journal.clone());
            group.add(Box::new(module)).unwrap();
        }
        group
    }

    fn failing() -> Script {
        Script { fail_setup: true, ..Script::default() }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let journal = Journal::default();
        let mut g = group(&[("stress", Script::default())], &journal);
        let dup = MockModule::new("stress", ModuleKind::Load, Script::default(), journal.clone());
        assert!(matches!(g.add(Box::new(dup)), Err(RtevalError::Config(_))));
    }

    #[test]
    fn test_wrong_family_rejected() {
        let journal = Journal::default();
        let mut g = group(&[], &journal);
        let probe = MockModule::new("cyclic", ModuleKind::Measurement, Script::default(), journal);
        assert!(g.add(Box::new(probe)).is_err());
    }

    #[test]
    fn test_partial_setup_failure_tolerated() {
        let journal = Journal::default();
        let mut g = group(&[
            ("a", Script::default()),
            ("b", failing()),
            ("c", Script::default()),
            ("d", failing()),
        ], &journal);

        assert_eq!(g.setup_all(|_| context()).unwrap(), 2);
        assert_eq!(g.start_all(), 2);
        assert!(journal.contains("a:start"));
        assert!(journal.contains("c:start"));
        assert!(!journal.contains("b:start"));
        assert!(!journal.contains("d:start"));
    }

    #[test]
    fn test_all_setup_failures_is_prepare_error() {
        let journal = Journal::default();
        let mut g = group(&[("a", failing()), ("b", failing())], &journal);
        let err = g.setup_all(|_| context()).unwrap_err();
        assert!(matches!(err, RtevalError::Prepare(_)));
        assert!(err.to_string().contains("scripted setup failure"));
    }

    #[test]
    fn test_empty_group_is_prepare_error() {
        let mut g = group(&[], &Journal::default());
        assert!(matches!(g.setup_all(|_| context()), Err(RtevalError::Prepare(_))));
    }

    #[test]
    fn test_stop_runs_in_reverse_order() {
        let journal = Journal::default();
        let mut g = group(&[("a", Script::default()), ("b", Script::default()), ("c", Script::default())], &journal);
        g.setup_all(|_| context()).unwrap();
        g.start_all();
        g.unleash_all();
        assert!(g.start_signal().is_released());
        assert_eq!(g.stop_all(Duration::from_secs(1)), 3);

        let stops: Vec<String> = journal.events().into_iter().filter(|e| e.ends_with(":stop")).collect();
        assert_eq!(stops, vec!["c:stop", "b:stop", "a:stop"]);
    }

    #[test]
    fn test_collect_reports_records_absent_members() {
        let journal = Journal::default();
        let mut g = group(&[
            ("a", Script::default()),
            ("b", failing()),
            ("c", Script { fail_stop: true, ..Script::default() }),
        ], &journal);
        g.setup_all(|_| context()).unwrap();
        g.start_all();
        g.unleash_all();
        g.stop_all(Duration::from_secs(1));
        let reports = g.collect_reports();

        assert_eq!(reports.len(), 3);
        assert!(reports[0].is_reported());
        assert!(matches!(&reports[1].outcome, ModuleOutcome::DidNotRun(r) if r == "scripted setup failure"));
        assert!(matches!(&reports[2].outcome, ModuleOutcome::Failed(r) if r == "scripted stop failure"));
        assert!(!journal.contains("c:report"));
        assert!(!g.all_reported());
    }

    #[test]
    fn test_failed_unleash_still_stopped() {
        let journal = Journal::default();
        let mut g = group(&[("a", Script { fail_unleash: true, ..Script::default() })], &journal);
        g.setup_all(|_| context()).unwrap();
        g.start_all();
        assert_eq!(g.unleash_all(), 0);
        assert_eq!(g.state_of("a"), Some(ModuleState::Failed));
        g.stop_all(Duration::from_secs(1));
        assert!(journal.contains("a:stop"));
    }

    #[test]
    fn test_failed_start_still_stopped() {
        let journal = Journal::default();
        let mut g = group(&[
            ("a", Script::default()),
            ("b", Script { fail_start: true, ..Script::default() }),
        ], &journal);
        g.setup_all(|_| context()).unwrap();
        assert_eq!(g.start_all(), 1);
        assert!(journal.contains("b:start"));
        assert_eq!(g.unleash_all(), 1);
        assert_eq!(g.stop_all(Duration::from_secs(1)), 1);
        assert!(journal.contains("b:stop"));

        let reports = g.collect_reports();
        assert!(matches!(&reports[1].outcome, ModuleOutcome::Failed(r) if r == "scripted start failure"));
    }

    #[test]
    fn test_panic_in_stop_is_contained() {
        let journal = Journal::default();
        let mut g = group(&[
            ("a", Script::default()),
            ("b", Script { panic_stop: true, ..Script::default() }),
        ], &journal);
        g.setup_all(|_| context()).unwrap();
        g.start_all();
        g.unleash_all();
        assert_eq!(g.stop_all(Duration::from_secs(1)), 1);
        assert_eq!(journal.events().iter().filter(|e| e.ends_with(":stop")).count(), 2);
        assert_eq!(g.state_of("b"), Some(ModuleState::Failed));

        let reports = g.collect_reports();
        assert!(reports[0].is_reported());
        assert!(matches!(&reports[1].outcome, ModuleOutcome::Failed(r) if r.contains("scripted stop panic")));
    }

    #[test]
    fn test_cleanup_skips_members_that_never_set_up() {
        let journal = Journal::default();
        let mut g = group(&[("a", Script::default()), ("b", failing())], &journal);
        g.setup_all(|_| context()).unwrap();
        g.cleanup_all();
        assert!(journal.contains("a:cleanup"));
        assert!(!journal.contains("b:cleanup"));
    }
}
