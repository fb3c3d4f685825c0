use std::collections::TryReserveError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use bytesize::ByteSize;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::config::OptionSpec;
use crate::core::cpus::CpuList;
use crate::core::error::{Result, RtevalError};
use crate::core::logging::LogHandle;
use crate::core::module::{Module, ModuleContext, ModuleKind};
use crate::core::report::{ReportNode, ResultFragment};
use crate::core::signal::StartSignal;
use super::{worker_cpus, WorkerPool};

pub const NAME: &str = "stress";

/// How long already spawned workers get to exit when `start` gives up.
const ABANDON_GRACE: Duration = Duration::from_secs(1);

pub fn options() -> Vec<OptionSpec> {
    vec![
        OptionSpec::int("threads", 0),
        OptionSpec::string("memory", "16MB"),
    ]
}

/// Work one stressor thread got through.
#[derive(Debug, Clone, Copy, Default)]
struct WorkerTally {
    cpu: usize,
    rounds: u64,
    busy: Duration,
}

/// Synthetic CPU and memory load: one thread per assigned CPU cycling
/// through compute kernels and random writes over a private buffer.
pub struct StressLoad {
    log: LogHandle,
    cpus: CpuList,
    threads: usize,
    memory: ByteSize,
    pool: WorkerPool<WorkerTally>,
    tallies: Vec<WorkerTally>,
}

impl StressLoad {
    pub fn new(log: LogHandle) -> Self {
        Self {
            log,
            cpus: CpuList::empty(),
            threads: 0,
            memory: ByteSize::mb(16),
            pool: WorkerPool::new(),
            tallies: Vec::new(),
        }
    }
}

impl Module for StressLoad {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Load
    }

    fn setup(&mut self, ctx: ModuleContext) -> Result<()> {
        let threads = ctx.config.get_int("threads")?;
        if threads < 0 {
            return Err(RtevalError::setup(NAME, format!("threads must not be negative, got {}", threads)));
        }
        let memory = ctx.config.get_str("memory")?;
        self.memory = memory
            .parse::<ByteSize>()
            .map_err(|e| RtevalError::setup(NAME, format!("invalid memory size '{}': {}", memory, e)))?;

        self.cpus = worker_cpus(&ctx.cpus);
        if self.cpus.is_empty() {
            return Err(RtevalError::setup(NAME, "no CPUs available"));
        }
        self.threads = if threads == 0 { self.cpus.len() } else { threads as usize };
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let cpus = self.cpus.as_slice().to_vec();
        let buffer_len = usize::try_from(self.memory.as_u64())
            .map_err(|_| RtevalError::runtime(NAME, "memory size exceeds address space"))?;
        for id in 0..self.threads {
            let cpu = cpus[id % cpus.len()];
            let buffer = match allocate(buffer_len) {
                Ok(buffer) => buffer,
                Err(e) => {
                    self.pool.stop(ABANDON_GRACE);
                    return Err(RtevalError::runtime(
                        NAME,
                        format!("cannot allocate {} for worker {}: {}", self.memory, id, e),
                    ));
                }
            };
            let spawned = self.pool.spawn(format!("stress-{}", id), CpuList::new([cpu]), &self.log, move |stop| {
                stress_worker(id, cpu, buffer, stop)
            });
            if let Err(e) = spawned {
                self.pool.stop(ABANDON_GRACE);
                return Err(RtevalError::runtime(NAME, format!("failed to spawn worker: {}", e)));
            }
        }
        self.log.info(format!("{} stressor threads on cpus {}", self.threads, self.cpus));
        Ok(())
    }

    fn unleash(&mut self, _signal: &StartSignal) -> Result<()> {
        // stressors generate load from start
        Ok(())
    }

    fn stop(&mut self, grace: Duration) -> Result<()> {
        let joined = self.pool.stop(grace);
        let clean = joined.is_clean();
        let failure = joined.describe();
        self.tallies = joined.results;
        if !clean {
            return Err(RtevalError::runtime(NAME, failure));
        }
        Ok(())
    }

    fn make_report(&mut self) -> Result<ResultFragment> {
        let mut node = ReportNode::new(NAME)
            .attr("threads", self.threads)
            .attr("memory", self.memory)
            .child(ReportNode::value("cpus", &self.cpus));
        let mut tallies = self.tallies.clone();
        tallies.sort_by_key(|t| t.cpu);
        for tally in tallies {
            node.push(
                ReportNode::new("worker")
                    .attr("cpu", tally.cpu)
                    .attr("rounds", tally.rounds)
                    .attr("busy_s", format!("{:.3}", tally.busy.as_secs_f64())),
            );
        }
        Ok(node)
    }
}

fn allocate(len: usize) -> std::result::Result<Vec<u8>, TryReserveError> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len)?;
    buffer.resize(len, 0);
    Ok(buffer)
}

fn stress_worker(id: usize, cpu: usize, mut buffer: Vec<u8>, stop: &AtomicBool) -> WorkerTally {
    let began = Instant::now();
    let mut rng = StdRng::seed_from_u64(id as u64);
    let mut tally = WorkerTally { cpu, ..WorkerTally::default() };

    while !stop.load(Ordering::Relaxed) {
        match (id as u64 + tally.rounds) % 6 {
            0 => {
                std::hint::black_box((2..10_000u32).filter(|n| is_prime(*n)).count());
            }
            1 => matrix_multiply(),
            2 => floating_point_ops(),
            3 => integer_arithmetic(),
            4 => branch_prediction(),
            _ => touch_memory(&mut buffer, &mut rng),
        }
        tally.rounds += 1;
    }
    tally.busy = began.elapsed();
    tally
}

pub fn is_prime(n: u32) -> bool {
    if n <= 1 {
        return false;
    }
    if n <= 3 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }

    let mut i = 5;
    while i * i <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }

    true
}

pub fn matrix_multiply() {
    const SIZE: usize = 64;
    let a = vec![vec![1.0f64; SIZE]; SIZE];
    let b = vec![vec![2.0f64; SIZE]; SIZE];
    let mut c = vec![vec![0.0f64; SIZE]; SIZE];

    for i in 0..SIZE {
        for j in 0..SIZE {
            for k in 0..SIZE {
                c[i][j] += a[i][k] * b[k][j];
            }
        }
    }
    std::hint::black_box(&c);
}

pub fn floating_point_ops() {
    let mut x: f64 = 1.0;
    for _ in 0..20_000 {
        x = x.sin().cos().tan().exp().ln().sqrt();
    }
    std::hint::black_box(x);
}

pub fn integer_arithmetic() {
    let mut x = 1u64;
    for _ in 0..100_000 {
        x = x.wrapping_mul(7).wrapping_add(3).wrapping_div(2).wrapping_sub(1);
    }
    std::hint::black_box(x);
}

pub fn branch_prediction() {
    let v: Vec<usize> = (0..10_000).map(|i| (i * 17) % 2).collect();
    let mut sum: i64 = 0;
    for (i, bit) in v.iter().enumerate() {
        if *bit == 1 {
            sum += i as i64;
        } else {
            sum -= i as i64;
        }
    }
    std::hint::black_box(sum);
}

/// Scattered writes over `buffer` to keep the memory subsystem busy.
pub fn touch_memory<R: Rng>(buffer: &mut [u8], rng: &mut R) {
    if buffer.is_empty() {
        return;
    }
    for _ in 0..4096 {
        let index = rng.gen_range(0..buffer.len());
        buffer[index] = buffer[index].wrapping_add(1);
    }
}
