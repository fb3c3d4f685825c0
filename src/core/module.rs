use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::config::{SectionView, LOADS_SECTION, MEASUREMENT_SECTION};
use crate::core::cpus::CpuList;
use crate::core::error::{Result, RtevalError};
use crate::core::logging::LogHandle;
use crate::core::report::ResultFragment;
use crate::core::signal::{CancelToken, StartSignal};

/// The two module families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    Load,
    Measurement,
}

impl ModuleKind {
    /// Config section listing the enabled modules of this family.
    pub fn section(&self) -> &'static str {
        match self {
            ModuleKind::Load => LOADS_SECTION,
            ModuleKind::Measurement => MEASUREMENT_SECTION,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Load => write!(f, "load"),
            ModuleKind::Measurement => write!(f, "measurement"),
        }
    }
}

/// Lifecycle state of a module. Transitions only move forward; `Failed` is
/// reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleState {
    Unstarted,
    Ready,
    Running,
    Stopped,
    Reported,
    Failed,
}

impl ModuleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModuleState::Reported | ModuleState::Failed)
    }

    fn successor(&self) -> Option<ModuleState> {
        match self {
            ModuleState::Unstarted => Some(ModuleState::Ready),
            ModuleState::Ready => Some(ModuleState::Running),
            ModuleState::Running => Some(ModuleState::Stopped),
            ModuleState::Stopped => Some(ModuleState::Reported),
            ModuleState::Reported | ModuleState::Failed => None,
        }
    }

    pub fn can_transition_to(&self, next: ModuleState) -> bool {
        match next {
            ModuleState::Failed => !self.is_terminal(),
            next => self.successor() == Some(next),
        }
    }
}

/// Everything a module receives at setup.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub config: SectionView,
    /// CPUs the module may use; empty means unconstrained.
    pub cpus: CpuList,
    pub workdir: PathBuf,
    pub start_signal: StartSignal,
    pub cancel: CancelToken,
}

/// Contract every load and measurement module implements.
///
/// `start` allocates resources and spawns workers; `unleash` is the second
/// gate before the measured portion begins, which for most modules means
/// handing their workers over to the group's [`StartSignal`]. `stop` must
/// return within roughly `grace`, forcing termination if needed.
pub trait Module: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> ModuleKind;

    /// Validate configuration and dependencies. Must not start background work.
    fn setup(&mut self, ctx: ModuleContext) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn unleash(&mut self, signal: &StartSignal) -> Result<()>;

    fn stop(&mut self, grace: Duration) -> Result<()>;

    fn make_report(&mut self) -> Result<ResultFragment>;

    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Owns one module and enforces its lifecycle.
pub struct ModuleHandle {
    module: Box<dyn Module>,
    state: ModuleState,
    failure: Option<String>,
    prepared: bool,
    start_attempted: bool,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    log: LogHandle,
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.module.name())
            .field("state", &self.state)
            .field("failure", &self.failure)
            .finish()
    }
}

impl ModuleHandle {
    pub fn new(module: Box<dyn Module>, log: LogHandle) -> Self {
        Self {
            module,
            state: ModuleState::Unstarted,
            failure: None,
            prepared: false,
            start_attempted: false,
            started_at: None,
            stopped_at: None,
            log,
        }
    }

    pub fn name(&self) -> &str {
        self.module.name()
    }

    pub fn kind(&self) -> ModuleKind {
        self.module.kind()
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Whether setup succeeded.
    pub fn was_prepared(&self) -> bool {
        self.prepared
    }

    /// Whether `start` was ever called, successful or not. Such a module
    /// may own workers and must be stopped.
    pub fn start_attempted(&self) -> bool {
        self.start_attempted
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.stopped_at
    }

    fn expect_state(&self, expected: ModuleState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RtevalError::lifecycle(
                self.name(),
                format!("{} requires state {:?}, module is {:?}", operation, expected, self.state),
            ))
        }
    }

    fn advance(&mut self, next: ModuleState) {
        debug_assert!(self.state.can_transition_to(next));
        self.log.debug(format!("{:?} -> {:?}", self.state, next));
        self.state = next;
    }

    fn fail(&mut self, reason: String) {
        self.log.warn(format!("module failed: {}", reason));
        self.failure = Some(reason);
        self.advance(ModuleState::Failed);
    }

    /// Run one module call, turning a panic into a runtime failure.
    fn guarded<T>(&mut self, step: &str, call: impl FnOnce(&mut dyn Module) -> Result<T>) -> Result<T> {
        let module = self.module.as_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| call(module))) {
            Ok(result) => result,
            Err(payload) => Err(RtevalError::runtime(
                self.module.name(),
                format!("panicked in {}: {}", step, panic_message(payload.as_ref())),
            )),
        }
    }

    pub fn setup(&mut self, ctx: ModuleContext) -> Result<()> {
        self.expect_state(ModuleState::Unstarted, "setup")?;
        match self.guarded("setup", |m| m.setup(ctx)) {
            Ok(()) => {
                self.prepared = true;
                self.advance(ModuleState::Ready);
                Ok(())
            }
            Err(e) => {
                let reason = failure_reason(&e);
                self.fail(reason.clone());
                Err(RtevalError::setup(self.name(), reason))
            }
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.expect_state(ModuleState::Ready, "start")?;
        self.start_attempted = true;
        match self.guarded("start", |m| m.start()) {
            Ok(()) => {
                self.started_at = Some(Utc::now());
                self.advance(ModuleState::Running);
                Ok(())
            }
            Err(e) => {
                let reason = failure_reason(&e);
                self.fail(reason.clone());
                Err(RtevalError::runtime(self.name(), reason))
            }
        }
    }

    pub fn unleash(&mut self, signal: &StartSignal) -> Result<()> {
        self.expect_state(ModuleState::Running, "unleash")?;
        self.guarded("unleash", |m| m.unleash(signal)).map_err(|e| {
            let reason = failure_reason(&e);
            self.fail(reason.clone());
            RtevalError::runtime(self.name(), reason)
        })
    }

    /// Stop a running module. A module that failed during or after `start`
    /// is still asked to stop so its workers do not outlive the run.
    pub fn stop(&mut self, grace: Duration) -> Result<()> {
        if self.state == ModuleState::Failed && self.start_attempted && self.stopped_at.is_none() {
            let result = self.guarded("stop", |m| m.stop(grace));
            self.stopped_at = Some(Utc::now());
            return result;
        }
        self.expect_state(ModuleState::Running, "stop")?;
        let result = self.guarded("stop", |m| m.stop(grace));
        self.stopped_at = Some(Utc::now());
        match result {
            Ok(()) => {
                self.advance(ModuleState::Stopped);
                Ok(())
            }
            Err(e) => {
                let reason = failure_reason(&e);
                self.fail(reason.clone());
                Err(RtevalError::runtime(self.name(), reason))
            }
        }
    }

    pub fn make_report(&mut self) -> Result<ResultFragment> {
        self.expect_state(ModuleState::Stopped, "make_report")?;
        match self.guarded("make_report", |m| m.make_report()) {
            Ok(fragment) => {
                self.advance(ModuleState::Reported);
                Ok(fragment)
            }
            Err(e) => {
                let reason = failure_reason(&e);
                self.fail(reason.clone());
                Err(RtevalError::runtime(self.name(), reason))
            }
        }
    }

    /// Release module resources; only meaningful once setup succeeded.
    pub fn cleanup(&mut self) -> Result<()> {
        if !self.prepared {
            return Ok(());
        }
        self.guarded("cleanup", |m| m.cleanup())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The module-supplied reason, without the wrapper text of our own variants.
fn failure_reason(error: &RtevalError) -> String {
    match error {
        RtevalError::SetupFailure { reason, .. } | RtevalError::RuntimeFailure { reason, .. } => {
            reason.clone()
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{MockModule, Script, Journal};

    fn handle(script: Script) -> ModuleHandle {
        let module = MockModule::new("probe", ModuleKind::Measurement, script, Journal::default());
        ModuleHandle::new(Box::new(module), LogHandle::silent())
    }

    #[test]
    fn test_state_transitions_only_forward() {
        use ModuleState::*;
        assert!(Unstarted.can_transition_to(Ready));
        assert!(Running.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Reported.can_transition_to(Stopped));
        assert!(!Ready.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Failed));
        assert!(!Reported.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_full_lifecycle() {
        let mut module = handle(Script::default());
        let ctx = crate::core::testing::context();
        let signal = ctx.start_signal.clone();
        module.setup(ctx).unwrap();
        assert_eq!(module.state(), ModuleState::Ready);
        module.start().unwrap();
        module.unleash(&signal).unwrap();
        assert_eq!(module.state(), ModuleState::Running);
        module.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(module.state(), ModuleState::Stopped);
        assert!(module.stopped_at().is_some());
        let fragment = module.make_report().unwrap();
        assert_eq!(fragment.name, "probe");
        assert_eq!(module.state(), ModuleState::Reported);
    }

    #[test]
    fn test_report_before_stop_is_lifecycle_error() {
        let mut module = handle(Script::default());
        assert!(matches!(module.make_report(), Err(RtevalError::Lifecycle { .. })));
        module.setup(crate::core::testing::context()).unwrap();
        assert!(matches!(module.make_report(), Err(RtevalError::Lifecycle { .. })));
        module.start().unwrap();
        assert!(matches!(module.make_report(), Err(RtevalError::Lifecycle { .. })));
        // the failed call does not move the module
        assert_eq!(module.state(), ModuleState::Running);
    }

    #[test]
    fn test_stopped_module_cannot_restart() {
        let mut module = handle(Script::default());
        module.setup(crate::core::testing::context()).unwrap();
        module.start().unwrap();
        module.stop(Duration::from_secs(1)).unwrap();
        assert!(module.start().is_err());
        assert!(module.unleash(&StartSignal::new()).is_err());
        assert_eq!(module.state(), ModuleState::Stopped);
    }

    #[test]
    fn test_setup_failure_marks_failed() {
        let mut module = handle(Script { fail_setup: true, ..Script::default() });
        let err = module.setup(crate::core::testing::context()).unwrap_err();
        assert!(matches!(err, RtevalError::SetupFailure { .. }));
        assert_eq!(module.state(), ModuleState::Failed);
        assert_eq!(module.failure(), Some("scripted setup failure"));
        assert!(module.start().is_err());
    }

    #[test]
    fn test_stop_failure_marks_failed() {
        let mut module = handle(Script { fail_stop: true, ..Script::default() });
        module.setup(crate::core::testing::context()).unwrap();
        module.start().unwrap();
        assert!(module.stop(Duration::from_secs(1)).is_err());
        assert_eq!(module.state(), ModuleState::Failed);
        assert!(module.start_attempted());
        assert!(module.make_report().is_err());
    }

    #[test]
    fn test_panic_becomes_failure() {
        let mut module = handle(Script { panic_stop: true, ..Script::default() });
        module.setup(crate::core::testing::context()).unwrap();
        module.start().unwrap();
        let err = module.stop(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RtevalError::RuntimeFailure { .. }));
        assert_eq!(module.state(), ModuleState::Failed);
        assert_eq!(module.failure(), Some("panicked in stop: scripted stop panic"));
        assert!(module.stopped_at().is_some());
    }

    #[test]
    fn test_failed_start_remains_stoppable() {
        let mut module = handle(Script { fail_start: true, ..Script::default() });
        module.setup(crate::core::testing::context()).unwrap();
        assert!(module.start().is_err());
        assert_eq!(module.state(), ModuleState::Failed);
        assert!(module.start_attempted());
        assert!(module.stop(Duration::from_secs(1)).is_ok());
        assert!(module.stopped_at().is_some());
    }
}
