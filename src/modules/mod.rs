//! Load and measurement modules shipped with the binary.

pub mod stress;
pub mod hackbench;
pub mod cyclic;
pub mod sysstat;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::cpus::{self, CpuList};
use crate::core::logging::LogHandle;
use crate::core::module::ModuleKind;
use crate::core::registry::ModuleRegistry;
use crate::core::report::ReportNode;
use crate::core::signal::{CancelToken, StartSignal};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Register every built-in module, loads first, in default run order.
pub fn register_builtin(registry: &mut ModuleRegistry) {
    let results = [
        registry.register(
            stress::NAME,
            ModuleKind::Load,
            "CPU and memory stressor threads",
            stress::options(),
            true,
            |log| Box::new(stress::StressLoad::new(log)),
        ),
        registry.register(
            hackbench::NAME,
            ModuleKind::Load,
            "Scheduler stress through a supervised hackbench process",
            hackbench::options(),
            true,
            |log| Box::new(hackbench::HackbenchLoad::new(log)),
        ),
        registry.register(
            cyclic::NAME,
            ModuleKind::Measurement,
            "Per-CPU timer wake-up latency sampler",
            cyclic::options(),
            true,
            |log| Box::new(cyclic::CyclicProbe::new(log)),
        ),
        registry.register(
            sysstat::NAME,
            ModuleKind::Measurement,
            "System utilization sampler",
            sysstat::options(),
            true,
            |log| Box::new(sysstat::SysstatProbe::new(log)),
        ),
    ];
    for result in results {
        if let Err(e) = result {
            log::error!("{}", e);
        }
    }
}

/// Block until `signal` is released. Returns `false` if the worker was
/// asked to finish first.
pub(crate) fn wait_for_start(signal: &StartSignal, stop: &AtomicBool, cancel: &CancelToken) -> bool {
    while !signal.wait_timeout(POLL_INTERVAL) {
        if stop.load(Ordering::Relaxed) || cancel.is_cancelled() {
            return false;
        }
    }
    true
}

/// Workers that did and did not finish within the stop grace period.
#[derive(Debug)]
pub(crate) struct Joined<T> {
    pub results: Vec<T>,
    pub stragglers: Vec<String>,
    pub panicked: Vec<String>,
}

impl<T> Joined<T> {
    pub fn is_clean(&self) -> bool {
        self.stragglers.is_empty() && self.panicked.is_empty()
    }

    /// Failure description for a module whose workers did not all finish.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.stragglers.is_empty() {
            parts.push(format!("did not stop in time: {}", self.stragglers.join(", ")));
        }
        if !self.panicked.is_empty() {
            parts.push(format!("panicked: {}", self.panicked.join(", ")));
        }
        parts.join("; ")
    }
}

/// Named threads sharing one cooperative stop flag.
pub(crate) struct WorkerPool<T> {
    stop: Arc<AtomicBool>,
    workers: Vec<(String, JoinHandle<T>)>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new() -> Self {
        Self { stop: Arc::new(AtomicBool::new(false)), workers: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spawn a worker restricted to `cpus` before running `work`.
    pub fn spawn<F>(&mut self, name: String, cpus: CpuList, log: &LogHandle, work: F) -> io::Result<()>
    where
        F: FnOnce(&AtomicBool) -> T + Send + 'static,
    {
        let stop = Arc::clone(&self.stop);
        let log = log.clone();
        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            if let Err(e) = cpus::pin_current_thread(&cpus) {
                log.warn(format!("{} not pinned to cpus {}: {}", thread_name, cpus, e));
            }
            work(&stop)
        })?;
        self.workers.push((name, handle));
        Ok(())
    }

    /// Raise the stop flag and join every worker that finishes within
    /// `grace`. Stragglers are detached.
    pub fn stop(&mut self, grace: Duration) -> Joined<T> {
        self.stop.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && self.workers.iter().any(|(_, h)| !h.is_finished()) {
            thread::sleep(POLL_INTERVAL);
        }

        let mut joined = Joined { results: Vec::new(), stragglers: Vec::new(), panicked: Vec::new() };
        for (name, handle) in self.workers.drain(..) {
            if !handle.is_finished() {
                joined.stragglers.push(name);
                continue;
            }
            match handle.join() {
                Ok(result) => joined.results.push(result),
                Err(_) => joined.panicked.push(name),
            }
        }
        joined
    }
}

/// Running min/mean/max of a sampled quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct RunningStats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    sum: f64,
}

impl RunningStats {
    pub fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// `<name samples min mean max/>`, bounds omitted when nothing was sampled.
    pub fn to_node(&self, name: &str) -> ReportNode {
        let mut node = ReportNode::new(name).attr("samples", self.count);
        if let Some(mean) = self.mean() {
            node.set_attr("min", format!("{:.2}", self.min));
            node.set_attr("mean", format!("{:.2}", mean));
            node.set_attr("max", format!("{:.2}", self.max));
        }
        node
    }
}

/// CPUs a module spreads its workers over: its assignment, or every online
/// CPU when unconstrained.
pub(crate) fn worker_cpus(assigned: &CpuList) -> CpuList {
    if assigned.is_empty() {
        cpus::online_cpus()
    } else {
        assigned.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_running_stats() {
        let mut stats = RunningStats::default();
        assert_eq!(stats.mean(), None);
        assert!(stats.to_node("x").attribute("min").is_none());
        for v in [4.0, 1.0, 7.0] {
            stats.record(v);
        }
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 7.0);
        assert_eq!(stats.mean(), Some(4.0));
        assert_eq!(stats.to_node("x").attribute("mean"), Some("4.00"));
    }

    #[test]
    fn test_pool_stops_cooperative_workers() {
        let mut pool = WorkerPool::new();
        let counter = Arc::new(AtomicU64::new(0));
        for i in 0..3 {
            let counter = Arc::clone(&counter);
            pool.spawn(format!("w{}", i), CpuList::empty(), &LogHandle::silent(), move |stop| {
                while !stop.load(Ordering::Relaxed) {
                    counter.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(1));
                }
                i
            })
            .unwrap();
        }
        assert_eq!(pool.len(), 3);
        let mut joined = pool.stop(Duration::from_secs(2));
        assert!(joined.is_clean());
        joined.results.sort();
        assert_eq!(joined.results, vec![0, 1, 2]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_detaches_stragglers() {
        let mut pool = WorkerPool::new();
        pool.spawn("stuck".into(), CpuList::empty(), &LogHandle::silent(), |_| {
            thread::sleep(Duration::from_millis(500));
        })
        .unwrap();
        let joined = pool.stop(Duration::from_millis(20));
        assert_eq!(joined.stragglers, vec!["stuck"]);
        assert!(joined.describe().contains("did not stop in time"));
    }

    #[test]
    fn test_wait_for_start_observes_stop() {
        let signal = StartSignal::new();
        let stop = AtomicBool::new(true);
        assert!(!wait_for_start(&signal, &stop, &CancelToken::new()));
        signal.release();
        assert!(wait_for_start(&signal, &AtomicBool::new(false), &CancelToken::new()));
    }

    #[test]
    fn test_builtin_modules_register() {
        let registry = ModuleRegistry::builtin();
        assert_eq!(registry.iter().count(), 4);
        assert!(registry.iter().all(|d| d.enabled_by_default));
    }
}
