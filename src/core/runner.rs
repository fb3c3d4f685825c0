use std::path::PathBuf;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::config::{ConfigStore, SectionView, RTEVAL_SECTION};
use crate::core::cpus::{self, CpuList, CpuPartition};
use crate::core::error::{Result, RtevalError};
use crate::core::group::{ModuleGroup, ModuleReport};
use crate::core::hardware::{HostInfo, SystemInfoSource};
use crate::core::logging::LogHandle;
use crate::core::module::{ModuleContext, ModuleKind};
use crate::core::registry::ModuleRegistry;
use crate::core::report::{Report, ReportAssembler};
use crate::core::signal::{CancelToken, StartSignal};
use crate::reporters::Reporter;

/// A load module did not reach `Reported`.
pub const EXIT_LOAD_FAILURE: i32 = 1;
/// A measurement module did not reach `Reported`.
pub const EXIT_MEASUREMENT_FAILURE: i32 = 2;
/// The run was interrupted before its duration elapsed.
pub const EXIT_ABORTED: i32 = 4;
pub const EXIT_CONFIG_ERROR: i32 = 64;
pub const EXIT_PREPARE_ERROR: i32 = 65;
pub const EXIT_SUMMARY_ERROR: i32 = 66;
pub const EXIT_INTERNAL_ERROR: i32 = 70;
/// Reported when the privilege check fails; the process exits with 255.
pub const EXIT_PRIVILEGE_ERROR: i32 = -1;

const PROGRESS_TICK: Duration = Duration::from_secs(1);

/// Identity and bookkeeping of one run. Only the orchestrator mutates it.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub workdir: PathBuf,
    pub reportdir: PathBuf,
    /// Requested duration in seconds.
    pub duration: f64,
    pub annotation: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub exit_code: i32,
    pub aborted: bool,
    pub partition: CpuPartition,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            reportdir: PathBuf::from("."),
            duration: 0.0,
            annotation: None,
            start: None,
            end: None,
            exit_code: 0,
            aborted: false,
            partition: CpuPartition::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrchestratorState {
    Idle,
    Prepared,
    Measuring,
    Finalized,
    Aborted,
}

/// Timing knobs read from `[rteval]` at prepare time.
#[derive(Debug, Clone, Copy)]
struct RunSettings {
    duration: Duration,
    warmup: Duration,
    stop_grace: Duration,
    report_interval: Duration,
}

fn seconds(view: &SectionView, key: &str) -> Result<Duration> {
    let value = view.get_float(key)?;
    Duration::try_from_secs_f64(value).map_err(|_| {
        RtevalError::Config(format!("[{}] {} must be a non-negative number of seconds, got {}", view.name(), key, value))
    })
}

/// Result of a full measurement run.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: Report,
    pub exit_code: i32,
    pub aborted: bool,
}

/// Top-level state machine sequencing the load and measurement groups.
pub struct Orchestrator {
    config: ConfigStore,
    registry: ModuleRegistry,
    reporter: Box<dyn Reporter + Send + Sync>,
    system: Box<dyn SystemInfoSource>,
    log: LogHandle,
    cancel: CancelToken,
    online: CpuList,
    state: OrchestratorState,
    run: RunContext,
    settings: Option<RunSettings>,
    loads: Option<ModuleGroup>,
    measurements: Option<ModuleGroup>,
}

impl Orchestrator {
    pub fn new(
        config: ConfigStore,
        registry: ModuleRegistry,
        reporter: Box<dyn Reporter + Send + Sync>,
        log: LogHandle,
    ) -> Self {
        Self {
            config,
            registry,
            reporter,
            system: Box::new(HostInfo),
            log,
            cancel: CancelToken::new(),
            online: cpus::online_cpus(),
            state: OrchestratorState::Idle,
            run: RunContext::default(),
            settings: None,
            loads: None,
            measurements: None,
        }
    }

    /// Replace the source of host identity facts.
    pub fn with_system_info(mut self, source: Box<dyn SystemInfoSource>) -> Self {
        self.system = source;
        self
    }

    /// Replace the detected online CPU set.
    pub fn with_online_cpus(mut self, online: CpuList) -> Self {
        self.online = online;
        self
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn run_context(&self) -> &RunContext {
        &self.run
    }

    pub fn reporter(&self) -> &(dyn Reporter + Send + Sync) {
        self.reporter.as_ref()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn loads(&self) -> Option<&ModuleGroup> {
        self.loads.as_ref()
    }

    pub fn measurements(&self) -> Option<&ModuleGroup> {
        self.measurements.as_ref()
    }

    /// Route SIGINT/SIGTERM into the run's cancellation token.
    pub fn install_interrupt_handler(&self) -> Result<()> {
        let cancel = self.cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nReceived interrupt signal...");
            eprintln!("Stopping modules and writing a partial report.");
            cancel.cancel();
        })
        .map_err(|e| RtevalError::Unexpected(format!("Failed to set interrupt handler: {}", e)))
    }

    fn expect_state(&self, expected: OrchestratorState, operation: &str) -> Result<()> {
        if self.state != expected {
            return Err(RtevalError::lifecycle(
                "orchestrator",
                format!("{} requires state {:?}, orchestrator is {:?}", operation, expected, self.state),
            ));
        }
        Ok(())
    }

    /// Build and set up the load group and, unless `only_load`, the
    /// measurement group.
    pub fn prepare(&mut self, only_load: bool) -> Result<()> {
        self.expect_state(OrchestratorState::Idle, "prepare")?;

        let rteval = self.config.section(RTEVAL_SECTION);
        let duration = rteval.get_float("duration")?;
        if !duration.is_finite() || duration <= 0.0 {
            return Err(RtevalError::Config(format!("Run duration must be positive, got {}", duration)));
        }
        let settings = RunSettings {
            duration: seconds(&rteval, "duration")?,
            warmup: seconds(&rteval, "warmup")?,
            stop_grace: seconds(&rteval, "stop_grace")?,
            report_interval: seconds(&rteval, "report_interval")?.max(PROGRESS_TICK),
        };

        let workdir = PathBuf::from(rteval.get_str("workdir")?);
        let reportdir = match rteval.get_opt_str("reportdir")? {
            Some(dir) => PathBuf::from(dir),
            None => workdir.join(format!("rteval-{}", Utc::now().format("%Y%m%d-%H%M%S"))),
        };
        let partition = cpus::partition(
            &self.online,
            &rteval.get_cpulist("loads_cpulist")?,
            &rteval.get_cpulist("measurement_cpulist")?,
        );
        self.log.info(format!(
            "loads on cpus [{}], measurement on cpus [{}]",
            if partition.loads.is_empty() { "all".to_string() } else { partition.loads.to_string() },
            if partition.measurement.is_empty() { "all".to_string() } else { partition.measurement.to_string() },
        ));

        self.run = RunContext {
            workdir,
            reportdir,
            duration,
            annotation: rteval.get_opt_str("annotate")?,
            partition,
            ..RunContext::default()
        };
        self.settings = Some(settings);

        let mut loads = self.build_group(ModuleKind::Load)?;
        if !only_load {
            match self.build_group(ModuleKind::Measurement) {
                Ok(measurements) => self.measurements = Some(measurements),
                Err(e) => {
                    loads.cleanup_all();
                    return Err(e);
                }
            }
        }
        self.loads = Some(loads);
        self.state = OrchestratorState::Prepared;
        Ok(())
    }

    fn build_group(&mut self, kind: ModuleKind) -> Result<ModuleGroup> {
        let mut group = ModuleGroup::new(kind, &self.log);
        for name in self.config.enabled_modules(kind.section()) {
            let descriptor = self.registry.get(&name).ok_or_else(|| {
                RtevalError::Config(format!("Unknown {} module '{}'", kind, name))
            })?;
            if descriptor.kind != kind {
                return Err(RtevalError::Config(format!(
                    "Module '{}' is a {} module, listed under [{}]", name, descriptor.kind, kind.section()
                )));
            }
            group.add(descriptor.create(group.member_log(&name)))?;
        }

        let cpus = match kind {
            ModuleKind::Load => self.run.partition.loads.clone(),
            ModuleKind::Measurement => self.run.partition.measurement.clone(),
        };
        let workdir = self.run.workdir.clone();
        let cancel = self.cancel.clone();
        let config = &mut self.config;
        group.setup_all(|name| ModuleContext {
            config: config.section(name),
            cpus: cpus.clone(),
            workdir: workdir.clone(),
            start_signal: StartSignal::new(),
            cancel: cancel.clone(),
        })?;
        Ok(group)
    }

    fn settings(&self) -> Result<RunSettings> {
        self.settings
            .ok_or_else(|| RtevalError::lifecycle("orchestrator", "run settings missing, prepare first"))
    }

    /// Run only the load group for `duration` seconds, without measuring or
    /// reporting. Returns how many load modules were unleashed.
    pub fn run_loads_only(&mut self, duration: f64) -> Result<usize> {
        self.expect_state(OrchestratorState::Prepared, "run_loads_only")?;
        let settings = self.settings()?;
        let total = Duration::try_from_secs_f64(duration).map_err(|_| {
            RtevalError::Config(format!("Run duration must be a positive number of seconds, got {}", duration))
        })?;
        let mut loads = self
            .loads
            .take()
            .ok_or_else(|| RtevalError::lifecycle("orchestrator", "no load group prepared"))?;

        self.state = OrchestratorState::Measuring;
        loads.start_all();
        let unleashed = loads.unleash_all();
        self.run.start = Some(Utc::now());
        self.reporter.report_start(&self.run, &loads.names(), &[]);

        let aborted = self.wait_for(total, settings.report_interval);

        loads.stop_all(settings.stop_grace);
        loads.cleanup_all();
        self.run.end = Some(Utc::now());
        self.run.aborted = aborted;
        self.loads = Some(loads);
        self.state = if aborted { OrchestratorState::Aborted } else { OrchestratorState::Finalized };
        Ok(unleashed)
    }

    /// Full run: loads, warm-up, measurement for the configured duration,
    /// ordered shutdown and report assembly. Once started this always
    /// finalizes, interrupted or not.
    pub fn measure(&mut self) -> Result<RunOutcome> {
        self.expect_state(OrchestratorState::Prepared, "measure")?;
        let settings = self.settings()?;
        let (mut loads, mut measurements) = match (self.loads.take(), self.measurements.take()) {
            (Some(loads), Some(measurements)) => (loads, measurements),
            (loads, measurements) => {
                self.loads = loads;
                self.measurements = measurements;
                return Err(RtevalError::lifecycle(
                    "orchestrator",
                    "measure requires both module groups, prepare without only_load",
                ));
            }
        };
        self.state = OrchestratorState::Measuring;

        let started = loads.start_all();
        self.log.info(format!("{} load modules started", started));
        if !settings.warmup.is_zero() {
            self.log.info(format!(
                "waiting {} for loads to stabilize",
                humantime::format_duration(settings.warmup)
            ));
            self.cancel.wait_timeout(settings.warmup);
        }
        loads.unleash_all();

        measurements.start_all();
        let probes = measurements.unleash_all();
        self.log.info(format!("{} measurement modules unleashed", probes));

        self.run.start = Some(Utc::now());
        self.reporter.report_start(&self.run, &loads.names(), &measurements.names());
        let aborted = self.wait_for(settings.duration, settings.report_interval);

        // measurement stops first so the load teardown is never sampled
        measurements.stop_all(settings.stop_grace);
        loads.stop_all(settings.stop_grace);
        self.run.end = Some(Utc::now());

        let load_reports = loads.collect_reports();
        let measurement_reports = measurements.collect_reports();
        loads.cleanup_all();
        measurements.cleanup_all();

        let exit_code = aggregate_exit_code(&load_reports, &measurement_reports, aborted);
        self.run.exit_code = exit_code;
        self.run.aborted = aborted;

        let system = self.system.collect().map_err(|e| {
            self.log.warn(format!("system information unavailable: {}", e));
            e.to_string()
        });
        let report = ReportAssembler::assemble(
            system.as_ref().map_err(Clone::clone),
            &self.run,
            &load_reports,
            &measurement_reports,
        );
        for warning in report.warnings() {
            self.reporter.report_warning(warning);
        }

        self.loads = Some(loads);
        self.measurements = Some(measurements);
        self.state = if aborted { OrchestratorState::Aborted } else { OrchestratorState::Finalized };
        Ok(RunOutcome { report, exit_code, aborted })
    }

    /// Wait for `total` or until cancelled, emitting progress. Returns
    /// whether the wait was cut short by cancellation.
    fn wait_for(&self, total: Duration, report_interval: Duration) -> bool {
        let begin = Instant::now();
        let deadline = begin + total;
        let mut last_logged = begin;
        loop {
            let now = Instant::now();
            if now >= deadline {
                self.reporter.report_progress(total, total);
                return false;
            }
            let remaining = deadline - now;
            if self.cancel.wait_timeout(remaining.min(PROGRESS_TICK)) {
                self.log.warn(format!(
                    "run interrupted with {} remaining",
                    humantime::format_duration(Duration::from_secs(remaining.as_secs()))
                ));
                return true;
            }

            let now = Instant::now();
            self.reporter.report_progress(now - begin, total);
            if now.duration_since(last_logged) >= report_interval && now < deadline {
                let left = Duration::from_secs((deadline - now).as_secs());
                self.log.info(format!("rteval time remaining: {}", humantime::format_duration(left)));
                last_logged = now;
            }
        }
    }
}

/// Bitmask of [`EXIT_LOAD_FAILURE`], [`EXIT_MEASUREMENT_FAILURE`] and
/// [`EXIT_ABORTED`]; zero only when every module reported.
pub fn aggregate_exit_code(loads: &[ModuleReport], measurements: &[ModuleReport], aborted: bool) -> i32 {
    let mut code = 0;
    if !loads.iter().all(ModuleReport::is_reported) {
        code |= EXIT_LOAD_FAILURE;
    }
    if !measurements.iter().all(ModuleReport::is_reported) {
        code |= EXIT_MEASUREMENT_FAILURE;
    }
    if aborted {
        code |= EXIT_ABORTED;
    }
    code
}
