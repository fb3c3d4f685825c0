use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use bytesize::ByteSize;
use sysinfo::System;

use crate::core::config::OptionSpec;
use crate::core::cpus::CpuList;
use crate::core::error::{Result, RtevalError};
use crate::core::logging::LogHandle;
use crate::core::module::{Module, ModuleContext, ModuleKind};
use crate::core::report::{ReportNode, ResultFragment};
use crate::core::signal::{CancelToken, StartSignal};
use super::{wait_for_start, RunningStats, WorkerPool};

pub const NAME: &str = "sysstat";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn options() -> Vec<OptionSpec> {
    vec![OptionSpec::float("interval", 1.0)]
}

#[derive(Debug, Clone, Copy, Default)]
struct Utilization {
    cpu_usage: RunningStats,
    load_average: RunningStats,
    memory_used: RunningStats,
}

/// Periodic whole-system utilization sampler.
pub struct SysstatProbe {
    log: LogHandle,
    cpus: CpuList,
    interval: Duration,
    start_signal: StartSignal,
    cancel: CancelToken,
    pool: WorkerPool<Utilization>,
    result: Utilization,
}

impl SysstatProbe {
    pub fn new(log: LogHandle) -> Self {
        Self {
            log,
            cpus: CpuList::empty(),
            interval: Duration::from_secs(1),
            start_signal: StartSignal::new(),
            cancel: CancelToken::new(),
            pool: WorkerPool::new(),
            result: Utilization::default(),
        }
    }
}

impl Module for SysstatProbe {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Measurement
    }

    fn setup(&mut self, ctx: ModuleContext) -> Result<()> {
        let interval = ctx.config.get_float("interval")?;
        self.interval = Duration::try_from_secs_f64(interval)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| RtevalError::setup(NAME, format!("interval must be a positive number of seconds, got {}", interval)))?;
        self.cpus = ctx.cpus;
        self.start_signal = ctx.start_signal;
        self.cancel = ctx.cancel;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let interval = self.interval;
        let signal = self.start_signal.clone();
        let cancel = self.cancel.clone();
        self.pool
            .spawn("sysstat".into(), self.cpus.clone(), &self.log, move |stop| {
                collect(interval, &signal, &cancel, stop)
            })
            .map_err(|e| RtevalError::runtime(NAME, format!("failed to spawn sampler: {}", e)))
    }

    fn unleash(&mut self, signal: &StartSignal) -> Result<()> {
        if !signal.same_as(&self.start_signal) {
            return Err(RtevalError::runtime(NAME, "unleashed with a different start signal than setup"));
        }
        Ok(())
    }

    fn stop(&mut self, grace: Duration) -> Result<()> {
        let mut joined = self.pool.stop(grace);
        if let Some(result) = joined.results.pop() {
            self.result = result;
        }
        if !joined.is_clean() {
            return Err(RtevalError::runtime(NAME, joined.describe()));
        }
        self.log.debug(format!("{} utilization samples", self.result.cpu_usage.count));
        Ok(())
    }

    fn make_report(&mut self) -> Result<ResultFragment> {
        let mut memory = self.result.memory_used.to_node("memory_used").attr("unit", "bytes");
        if self.result.memory_used.count > 0 {
            memory.set_attr("peak", ByteSize::b(self.result.memory_used.max as u64));
        }
        Ok(ReportNode::new(NAME)
            .attr("interval_s", self.interval.as_secs_f64())
            .child(self.result.cpu_usage.to_node("cpu_usage").attr("unit", "%"))
            .child(self.result.load_average.to_node("load_average"))
            .child(memory))
    }
}

fn collect(interval: Duration, signal: &StartSignal, cancel: &CancelToken, stop: &AtomicBool) -> Utilization {
    let mut utilization = Utilization::default();
    if !wait_for_start(signal, stop, cancel) {
        return utilization;
    }

    let mut system = System::new();
    // usage is computed between refreshes, so prime the first one
    system.refresh_cpu_usage();
    let mut next = Instant::now() + interval;
    loop {
        while Instant::now() < next {
            if stop.load(Ordering::Relaxed) || cancel.is_cancelled() {
                return utilization;
            }
            std::thread::sleep(POLL_INTERVAL.min(next.saturating_duration_since(Instant::now())));
        }
        system.refresh_cpu_usage();
        system.refresh_memory();
        utilization.cpu_usage.record(system.global_cpu_info().cpu_usage() as f64);
        utilization.load_average.record(System::load_average().one);
        utilization.memory_used.record(system.used_memory() as f64);
        next += interval;
    }
}
