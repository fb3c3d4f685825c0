use std::env;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::config::OptionSpec;
use crate::core::cpus::CpuList;
use crate::core::error::{Result, RtevalError};
use crate::core::logging::LogHandle;
use crate::core::module::{Module, ModuleContext, ModuleKind};
use crate::core::report::{ReportNode, ResultFragment};
use crate::core::signal::StartSignal;
use super::WorkerPool;

pub const NAME: &str = "hackbench";

const LOOPS: &str = "1000";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

pub fn options() -> Vec<OptionSpec> {
    vec![
        OptionSpec::string("exe", "hackbench"),
        OptionSpec::int("groups", 20),
    ]
}

/// Locate an executable by name on `PATH`, or check an explicit path.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[derive(Debug, Clone, Copy, Default)]
struct SupervisorTally {
    launches: u64,
    failures: u64,
    spawn_errors: u64,
    forced_kills: u64,
}

/// Scheduler load through repeated runs of the external `hackbench`
/// benchmark. A supervisor thread pinned to the load CPUs relaunches it
/// whenever it exits; children inherit the supervisor's affinity.
pub struct HackbenchLoad {
    log: LogHandle,
    exe: PathBuf,
    groups: i64,
    cpus: CpuList,
    grace_ms: Arc<AtomicU64>,
    pool: WorkerPool<SupervisorTally>,
    tally: SupervisorTally,
}

impl HackbenchLoad {
    pub fn new(log: LogHandle) -> Self {
        Self {
            log,
            exe: PathBuf::from(NAME),
            groups: 20,
            cpus: CpuList::empty(),
            grace_ms: Arc::new(AtomicU64::new(10_000)),
            pool: WorkerPool::new(),
            tally: SupervisorTally::default(),
        }
    }
}

impl Module for HackbenchLoad {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Load
    }

    fn setup(&mut self, ctx: ModuleContext) -> Result<()> {
        let exe = ctx.config.get_str("exe")?;
        self.exe = find_executable(&exe)
            .ok_or_else(|| RtevalError::setup(NAME, format!("{} not found in PATH", exe)))?;
        self.groups = ctx.config.get_int("groups")?;
        if self.groups <= 0 {
            return Err(RtevalError::setup(NAME, format!("groups must be positive, got {}", self.groups)));
        }
        self.cpus = ctx.cpus;
        self.log.debug(format!("using {}", self.exe.display()));
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let exe = self.exe.clone();
        let args = vec!["-P".to_string(), "-g".to_string(), self.groups.to_string(), "-l".to_string(), LOOPS.to_string()];
        let grace_ms = Arc::clone(&self.grace_ms);
        let log = self.log.clone();
        self.pool
            .spawn("hackbench-supervisor".into(), self.cpus.clone(), &self.log, move |stop| {
                supervise(&exe, &args, &grace_ms, stop, &log)
            })
            .map_err(|e| RtevalError::runtime(NAME, format!("failed to spawn supervisor: {}", e)))
    }

    fn unleash(&mut self, _signal: &StartSignal) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self, grace: Duration) -> Result<()> {
        self.grace_ms.store(grace.as_millis() as u64, Ordering::Relaxed);
        let mut joined = self.pool.stop(grace + Duration::from_secs(1));
        if let Some(tally) = joined.results.pop() {
            self.tally = tally;
        }
        if !joined.is_clean() {
            return Err(RtevalError::runtime(NAME, joined.describe()));
        }
        Ok(())
    }

    fn make_report(&mut self) -> Result<ResultFragment> {
        Ok(ReportNode::new(NAME)
            .attr("groups", self.groups)
            .attr("launches", self.tally.launches)
            .attr("failures", self.tally.failures)
            .attr("spawn_errors", self.tally.spawn_errors)
            .attr("forced_kills", self.tally.forced_kills)
            .child(ReportNode::value("command", self.exe.display()))
            .child(ReportNode::value("cpus", &self.cpus)))
    }
}

fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
        thread::sleep(POLL_INTERVAL);
    }
}

fn launch(exe: &Path, args: &[String]) -> std::io::Result<Child> {
    let mut command = Command::new(exe);
    command.args(args).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.spawn()
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    // SAFETY: kill(2) with a negative pid targets the process group the
    // child leads; it has no memory-safety preconditions.
    unsafe {
        libc::kill(-(child.id() as libc::pid_t), signal);
    }
}

/// SIGTERM the child's process group, escalating to SIGKILL after `grace`.
/// Returns whether the kill was forced.
fn terminate(child: &mut Child, grace: Duration) -> bool {
    #[cfg(unix)]
    signal_group(child, libc::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return false;
        }
        thread::sleep(POLL_INTERVAL.min(grace));
    }
    #[cfg(unix)]
    signal_group(child, libc::SIGKILL);
    let _ = child.kill();
    let _ = child.wait();
    true
}

fn supervise(
    exe: &Path,
    args: &[String],
    grace_ms: &AtomicU64,
    stop: &AtomicBool,
    log: &LogHandle,
) -> SupervisorTally {
    let mut tally = SupervisorTally::default();
    'relaunch: while !stop.load(Ordering::Relaxed) {
        let mut child = match launch(exe, args) {
            Ok(child) => child,
            Err(e) => {
                log.error(format!("failed to launch {}: {}", exe.display(), e));
                tally.spawn_errors += 1;
                sleep_unless_stopped(RESPAWN_BACKOFF, stop);
                continue;
            }
        };
        tally.launches += 1;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if !status.success() {
                        tally.failures += 1;
                        log.debug(format!("hackbench exited with {}", status));
                    }
                    continue 'relaunch;
                }
                Ok(None) => {}
                Err(e) => {
                    log.warn(format!("lost track of hackbench: {}", e));
                    let _ = child.kill();
                    continue 'relaunch;
                }
            }
            if stop.load(Ordering::Relaxed) {
                let grace = Duration::from_millis(grace_ms.load(Ordering::Relaxed));
                if terminate(&mut child, grace) {
                    tally.forced_kills += 1;
                }
                break 'relaunch;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
    tally
}
