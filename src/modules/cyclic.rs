use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::config::OptionSpec;
use crate::core::cpus::CpuList;
use crate::core::error::{Result, RtevalError};
use crate::core::logging::LogHandle;
use crate::core::module::{Module, ModuleContext, ModuleKind};
use crate::core::report::{ReportNode, ResultFragment};
use crate::core::signal::{CancelToken, StartSignal};
use super::{wait_for_start, worker_cpus, WorkerPool};

pub const NAME: &str = "cyclic";

const MAX_PRIORITY: i64 = 99;

pub fn options() -> Vec<OptionSpec> {
    vec![
        OptionSpec::int("priority", 0),
        OptionSpec::int("interval", 1000),
        OptionSpec::int("buckets", 2000),
    ]
}

/// Wake-up latency samples of one CPU, in microseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyHistogram {
    pub cpu: usize,
    buckets: Vec<u64>,
    pub overflows: u64,
    pub samples: u64,
    pub min: u64,
    pub max: u64,
    sum: u64,
}

impl LatencyHistogram {
    pub fn new(cpu: usize, buckets: usize) -> Self {
        Self { cpu, buckets: vec![0; buckets], overflows: 0, samples: 0, min: 0, max: 0, sum: 0 }
    }

    pub fn record(&mut self, latency_us: u64) {
        match self.buckets.get_mut(latency_us as usize) {
            Some(bucket) => *bucket += 1,
            None => self.overflows += 1,
        }
        if self.samples == 0 || latency_us < self.min {
            self.min = latency_us;
        }
        self.max = self.max.max(latency_us);
        self.sum = self.sum.saturating_add(latency_us);
        self.samples += 1;
    }

    /// Fold another CPU's samples into this one.
    pub fn merge(&mut self, other: &LatencyHistogram) {
        if self.buckets.len() < other.buckets.len() {
            self.buckets.resize(other.buckets.len(), 0);
        }
        for (mine, theirs) in self.buckets.iter_mut().zip(&other.buckets) {
            *mine += theirs;
        }
        if other.samples > 0 && (self.samples == 0 || other.min < self.min) {
            self.min = other.min;
        }
        self.max = self.max.max(other.max);
        self.sum = self.sum.saturating_add(other.sum);
        self.overflows += other.overflows;
        self.samples += other.samples;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.sum as f64 / self.samples as f64)
    }

    /// Non-empty buckets as `(latency_us, samples)`.
    pub fn populated(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.buckets.iter().copied().enumerate().filter(|(_, count)| *count > 0)
    }

    fn to_node(&self, name: &str, histogram: bool) -> ReportNode {
        let mut node = ReportNode::new(name)
            .attr("samples", self.samples)
            .attr("overflows", self.overflows);
        if let Some(mean) = self.mean() {
            node.set_attr("min", self.min);
            node.set_attr("mean", format!("{:.2}", mean));
            node.set_attr("max", self.max);
        }
        if histogram {
            let mut buckets = ReportNode::new("histogram");
            for (latency, count) in self.populated() {
                buckets.push(ReportNode::new("bucket").attr("latency_us", latency).attr("samples", count));
            }
            node.push(buckets);
        }
        node
    }
}

#[derive(Debug, Clone, Copy)]
struct Sampling {
    interval: Duration,
    buckets: usize,
    priority: i32,
}

/// Timer wake-up latency sampler: one thread per measurement CPU sleeps for
/// a fixed interval and records how late it woke up.
pub struct CyclicProbe {
    log: LogHandle,
    cpus: CpuList,
    sampling: Sampling,
    start_signal: StartSignal,
    cancel: CancelToken,
    pool: WorkerPool<LatencyHistogram>,
    histograms: Vec<LatencyHistogram>,
    /// Samplers left on the default policy because SCHED_FIFO was refused.
    priority_failures: Arc<AtomicUsize>,
}

impl CyclicProbe {
    pub fn new(log: LogHandle) -> Self {
        Self {
            log,
            cpus: CpuList::empty(),
            sampling: Sampling { interval: Duration::from_micros(1000), buckets: 2000, priority: 0 },
            start_signal: StartSignal::new(),
            cancel: CancelToken::new(),
            pool: WorkerPool::new(),
            histograms: Vec::new(),
            priority_failures: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Module for CyclicProbe {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Measurement
    }

    fn setup(&mut self, ctx: ModuleContext) -> Result<()> {
        let priority = ctx.config.get_int("priority")?;
        if !(0..=MAX_PRIORITY).contains(&priority) {
            return Err(RtevalError::setup(NAME, format!("priority must be within 0-{}, got {}", MAX_PRIORITY, priority)));
        }
        let interval = ctx.config.get_int("interval")?;
        if interval <= 0 {
            return Err(RtevalError::setup(NAME, format!("interval must be positive, got {}", interval)));
        }
        let buckets = ctx.config.get_int("buckets")?;
        if buckets <= 0 {
            return Err(RtevalError::setup(NAME, format!("buckets must be positive, got {}", buckets)));
        }

        self.sampling = Sampling {
            interval: Duration::from_micros(interval as u64),
            buckets: buckets as usize,
            priority: priority as i32,
        };
        self.cpus = worker_cpus(&ctx.cpus);
        if self.cpus.is_empty() {
            return Err(RtevalError::setup(NAME, "no CPUs to measure"));
        }
        self.start_signal = ctx.start_signal;
        self.cancel = ctx.cancel;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        for cpu in self.cpus.iter() {
            let sampling = self.sampling;
            let signal = self.start_signal.clone();
            let cancel = self.cancel.clone();
            let log = self.log.clone();
            let priority_failures = Arc::clone(&self.priority_failures);
            self.pool
                .spawn(format!("cyclic-{}", cpu), CpuList::new([cpu]), &self.log, move |stop| {
                    if sampling.priority > 0 {
                        if let Err(e) = set_fifo_priority(sampling.priority) {
                            log.warn(format!("cpu {}: SCHED_FIFO priority {} not applied: {}", cpu, sampling.priority, e));
                            priority_failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    sample(cpu, sampling, &signal, &cancel, stop)
                })
                .map_err(|e| RtevalError::runtime(NAME, format!("failed to spawn sampler: {}", e)))?;
        }
        self.log.debug(format!("{} samplers waiting for start", self.pool.len()));
        Ok(())
    }

    fn unleash(&mut self, signal: &StartSignal) -> Result<()> {
        if !signal.same_as(&self.start_signal) {
            return Err(RtevalError::runtime(NAME, "unleashed with a different start signal than setup"));
        }
        Ok(())
    }

    fn stop(&mut self, grace: Duration) -> Result<()> {
        let joined = self.pool.stop(grace);
        let clean = joined.is_clean();
        let failure = joined.describe();
        self.histograms = joined.results;
        self.histograms.sort_by_key(|h| h.cpu);
        if !clean {
            return Err(RtevalError::runtime(NAME, failure));
        }
        Ok(())
    }

    fn make_report(&mut self) -> Result<ResultFragment> {
        let mut system = LatencyHistogram::new(0, self.sampling.buckets);
        for histogram in &self.histograms {
            system.merge(histogram);
        }
        let mut node = ReportNode::new(NAME)
            .attr("interval_us", self.sampling.interval.as_micros())
            .attr("priority", self.sampling.priority)
            .attr("buckets", self.sampling.buckets)
            .attr("priority_failures", self.priority_failures.load(Ordering::Relaxed))
            .child(system.to_node("system", false));
        for histogram in &self.histograms {
            node.push(histogram.to_node("cpu", true).attr("id", histogram.cpu));
        }
        Ok(node)
    }
}

#[cfg(target_os = "linux")]
fn set_fifo_priority(priority: i32) -> std::io::Result<()> {
    let param = libc::sched_param { sched_priority: priority };
    // SAFETY: pid 0 addresses the calling thread and `param` outlives the call.
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_fifo_priority(_priority: i32) -> std::io::Result<()> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "SCHED_FIFO unavailable"))
}

fn sample(cpu: usize, sampling: Sampling, signal: &StartSignal, cancel: &CancelToken, stop: &AtomicBool) -> LatencyHistogram {
    let mut histogram = LatencyHistogram::new(cpu, sampling.buckets);
    if !wait_for_start(signal, stop, cancel) {
        return histogram;
    }

    let mut next = Instant::now() + sampling.interval;
    while !stop.load(Ordering::Relaxed) && !cancel.is_cancelled() {
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        }
        let woke = Instant::now();
        histogram.record(woke.saturating_duration_since(next).as_micros() as u64);
        next += sampling.interval;
        if next <= woke {
            next = woke + sampling.interval;
        }
    }
    histogram
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ConfigStore;
    use std::path::PathBuf;

    fn context(overrides: &[&str], signal: &StartSignal) -> ModuleContext {
        let mut store = ConfigStore::new();
        store.register_schema(NAME, &options());
        store.update_from_overrides(overrides).unwrap();
        ModuleContext {
            config: store.section(NAME),
            cpus: CpuList::new([0]),
            workdir: PathBuf::from("."),
            start_signal: signal.clone(),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn test_histogram_records_overflow() {
        let mut h = LatencyHistogram::new(1, 10);
        for v in [3, 3, 5, 42] {
            h.record(v);
        }
        assert_eq!(h.samples, 4);
        assert_eq!(h.overflows, 1);
        assert_eq!((h.min, h.max), (3, 42));
        assert_eq!(h.populated().collect::<Vec<_>>(), vec![(3, 2), (5, 1)]);
        assert_eq!(h.mean(), Some(13.25));
    }

    #[test]
    fn test_histogram_merge() {
        let mut a = LatencyHistogram::new(0, 10);
        let mut b = LatencyHistogram::new(1, 10);
        a.record(4);
        b.record(2);
        b.record(8);
        let mut empty = LatencyHistogram::new(2, 10);
        empty.merge(&a);
        empty.merge(&b);
        assert_eq!((empty.min, empty.max, empty.samples), (2, 8, 3));
    }

    #[test]
    fn test_setup_rejects_bad_options() {
        let signal = StartSignal::new();
        for bad in ["cyclic.interval=0", "cyclic.buckets=-3", "cyclic.priority=120"] {
            let mut probe = CyclicProbe::new(LogHandle::silent());
            assert!(probe.setup(context(&[bad], &signal)).is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_no_samples_before_start_signal() {
        let signal = StartSignal::new();
        let mut probe = CyclicProbe::new(LogHandle::silent());
        probe.setup(context(&["cyclic.interval=200"], &signal)).unwrap();
        probe.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        probe.stop(Duration::from_secs(2)).unwrap();
        let report = probe.make_report().unwrap();
        assert_eq!(report.find("system").unwrap().attribute("samples"), Some("0"));
    }

    #[test]
    fn test_samples_after_release() {
        let signal = StartSignal::new();
        let mut probe = CyclicProbe::new(LogHandle::silent());
        probe.setup(context(&["cyclic.interval=200"], &signal)).unwrap();
        probe.start().unwrap();
        probe.unleash(&signal).unwrap();
        signal.release();
        thread::sleep(Duration::from_millis(100));
        probe.stop(Duration::from_secs(2)).unwrap();

        let report = probe.make_report().unwrap();
        assert!(report.validate().is_ok());
        let cpu = report.find("cpu").unwrap();
        assert_eq!(cpu.attribute("id"), Some("0"));
        let samples: u64 = cpu.attribute("samples").unwrap().parse().unwrap();
        assert!(samples > 0);
        assert!(cpu.find("histogram").is_some());
        assert_eq!(report.find("system").unwrap().attribute("samples"), cpu.attribute("samples"));
    }

    #[test]
    fn test_foreign_signal_rejected() {
        let signal = StartSignal::new();
        let mut probe = CyclicProbe::new(LogHandle::silent());
        probe.setup(context(&[], &signal)).unwrap();
        assert!(probe.unleash(&StartSignal::new()).is_err());
    }
}
