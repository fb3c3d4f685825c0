use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use clap::{Parser, Subcommand};
use anyhow::{Context, Result};
use bytesize::ByteSize;
use log::{info, error, LevelFilter};
use simple_logger::SimpleLogger;

use rteval::core::config::{self, ConfigStore, DEFAULT_CONFIG_FILE, RTEVAL_SECTION};
use rteval::core::error::RtevalError;
use rteval::core::hardware::{HostInfo, SystemInfoSource};
use rteval::core::logging::LogHandle;
use rteval::core::registry::ModuleRegistry;
use rteval::core::report::Report;
use rteval::core::runner::{self, Orchestrator};
use rteval::core::summary;
use rteval::reporters::{self, OutputFormat};


#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Output format of the console report
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Write the rendered report to a file instead of stdout
    #[arg(short, long, global = true)]
    output: Option<String>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (defaults to /etc/rteval.conf when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Measurement duration, e.g. 90, 30s, 15m, 12h, 1d
    #[arg(short, long, global = true)]
    duration: Option<String>,

    /// Free-form note stored in the report
    #[arg(short, long, global = true)]
    annotate: Option<String>,

    #[arg(short, long, global = true)]
    workdir: Option<PathBuf>,

    /// CPUs reserved for load modules, e.g. 0-3,8
    #[arg(long, global = true)]
    loads_cpulist: Option<String>,

    /// CPUs reserved for measurement modules
    #[arg(long, global = true)]
    measurement_cpulist: Option<String>,

    /// Override any config key, e.g. --set cyclic.priority=95
    #[arg(long = "set", value_name = "SECTION.KEY=VALUE", global = true)]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}


#[derive(Subcommand)]
enum Commands {
    /// Run loads and measurements, then report
    Run,

    /// Run only the load modules for the configured duration
    LoadsOnly,

    /// Render previously produced reports
    Summarize {
        /// summary.xml files or .tar.bz2 archives containing one
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Dump the latency histograms of previously produced reports
    RawHistogram {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List the available modules and their options
    Modules,

    /// Print host identity
    Sysinfo,
}


fn main() {
    let cli = Cli::parse();

    let code = match execute(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    };
    process::exit(code);
}


fn exit_code_for(e: &anyhow::Error) -> i32 {
    match e.chain().find_map(|cause| cause.downcast_ref::<RtevalError>()) {
        Some(RtevalError::Config(_)) => runner::EXIT_CONFIG_ERROR,
        Some(RtevalError::Prepare(_)) => runner::EXIT_PREPARE_ERROR,
        Some(RtevalError::Summary(_)) => runner::EXIT_SUMMARY_ERROR,
        Some(RtevalError::Privilege(_)) => runner::EXIT_PRIVILEGE_ERROR,
        _ => runner::EXIT_INTERNAL_ERROR,
    }
}


fn execute(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Commands::Modules => {
            print_modules(&ModuleRegistry::builtin());
            Ok(0)
        }

        Commands::Sysinfo => {
            print_system_info()?;
            Ok(0)
        }

        Commands::Summarize { files } => {
            init_logger(log_level(cli, false))?;
            let reporter = reporters::create(cli.format, cli.output.clone(), cli.verbose, cli.quiet);
            for file in files {
                let report = load(file)?;
                reporter.report_summary(&report);
            }
            Ok(0)
        }

        Commands::RawHistogram { files } => {
            init_logger(log_level(cli, false))?;
            let reporter = reporters::create(cli.format, cli.output.clone(), cli.verbose, cli.quiet);
            let mut rows = Vec::new();
            for file in files {
                rows.extend(summary::raw_histogram(&load(file)?));
            }
            reporter.report_histogram(&rows);
            Ok(0)
        }

        Commands::Run | Commands::LoadsOnly => {
            check_privilege()?;

            let registry = ModuleRegistry::builtin();
            let mut store = build_config(cli, &registry)?;
            let verbose = store.section(RTEVAL_SECTION).get_bool("verbose")?;
            let level = log_level(cli, verbose);
            init_logger(level)?;
            info!("rteval v{}", env!("CARGO_PKG_VERSION"));

            let log = LogHandle::new("rteval", level);
            let reporter = reporters::create(cli.format, cli.output.clone(), cli.verbose, cli.quiet);
            let mut orchestrator = Orchestrator::new(store, registry, reporter, log);
            orchestrator.install_interrupt_handler()?;

            if matches!(cli.command, Commands::LoadsOnly) {
                run_loads_only(&mut orchestrator)
            } else {
                run_measurement(&mut orchestrator)
            }
        }
    }
}


fn run_loads_only(orchestrator: &mut Orchestrator) -> Result<i32> {
    orchestrator.prepare(true)?;
    let duration = orchestrator.run_context().duration;
    let unleashed = orchestrator.run_loads_only(duration)?;
    let ran = Duration::try_from_secs_f64(duration).unwrap_or_default();
    info!("{} load module(s) ran for {}", unleashed, humantime::format_duration(ran));
    if orchestrator.run_context().aborted {
        Ok(runner::EXIT_ABORTED)
    } else {
        Ok(0)
    }
}


fn run_measurement(orchestrator: &mut Orchestrator) -> Result<i32> {
    orchestrator.prepare(false)?;
    let outcome = orchestrator.measure()?;

    let reportdir = orchestrator.run_context().reportdir.clone();
    match summary::write_report(&outcome.report, &reportdir) {
        Ok(path) => info!("Report written to {}", path.display()),
        Err(e) => error!("Failed to write report to {}: {}", reportdir.display(), e),
    }

    orchestrator.reporter().report_summary(&outcome.report);
    Ok(outcome.exit_code)
}


/// Any failure to produce a report from `path` is a summarize failure.
fn load(path: &Path) -> Result<Report> {
    summary::load_report(path)
        .map_err(|e| match e {
            RtevalError::Summary(_) => e,
            other => RtevalError::Summary(other.to_string()),
        })
        .with_context(|| format!("Failed to read report {}", path.display()))
}


/// Defaults, then the config file, then dedicated flags and `--set`.
fn build_config(cli: &Cli, registry: &ModuleRegistry) -> Result<ConfigStore> {
    let mut store = registry.default_config();

    match &cli.config {
        Some(path) => store.load_file(path)?,
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.is_file() {
                store.load_file(default)?;
            }
        }
    }

    if let Some(duration) = &cli.duration {
        let seconds = config::parse_duration(duration)?;
        store.set_override(RTEVAL_SECTION, "duration", &seconds.to_string())?;
    }
    if let Some(annotation) = &cli.annotate {
        store.set_override(RTEVAL_SECTION, "annotate", annotation)?;
    }
    if let Some(workdir) = &cli.workdir {
        store.set_override(RTEVAL_SECTION, "workdir", &workdir.display().to_string())?;
    }
    if let Some(cpus) = &cli.loads_cpulist {
        store.set_override(RTEVAL_SECTION, "loads_cpulist", cpus)?;
    }
    if let Some(cpus) = &cli.measurement_cpulist {
        store.set_override(RTEVAL_SECTION, "measurement_cpulist", cpus)?;
    }
    if cli.verbose {
        store.set_override(RTEVAL_SECTION, "verbose", "true")?;
    }
    store.update_from_overrides(&cli.overrides)?;

    Ok(store)
}


fn log_level(cli: &Cli, verbose: bool) -> LevelFilter {
    if cli.verbose || verbose {
        LevelFilter::Debug
    } else if cli.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    }
}


fn init_logger(level: LevelFilter) -> Result<()> {
    SimpleLogger::new()
        .with_level(level)
        .init()
        .context("Failed to initialize logger")
}


fn check_privilege() -> Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: geteuid(2) cannot fail and touches no memory.
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            return Err(RtevalError::Privilege("must be root to run rteval".to_string()).into());
        }
    }
    Ok(())
}


fn print_modules(registry: &ModuleRegistry) {
    println!("Available modules:");
    println!("==================");
    for entry in registry.iter() {
        let state = if entry.enabled_by_default { "enabled" } else { "disabled" };
        println!("\n{} ({}, {} by default)", entry.name, entry.kind, state);
        println!("  {}", entry.description);
        for option in &entry.options {
            match &option.default {
                Some(default) => println!("    {} ({:?}) = {}", option.key, option.kind, default),
                None => println!("    {} ({:?})", option.key, option.kind),
            }
        }
    }
}


fn print_system_info() -> Result<()> {
    let info = HostInfo.collect().context("Failed to collect host information")?;

    println!("System Information:");
    println!("===================");
    println!("  Hostname: {}", info.hostname);
    println!("  OS: {} {}", info.os_name, info.os_version);
    println!("  Kernel: {}", info.kernel_version);

    println!("\nCPU Information:");
    println!("  Model: {}", info.cpu.model_name);
    match info.cpu.physical_cores {
        Some(physical) => println!("  Cores: {} physical, {} logical", physical, info.cpu.logical_cores),
        None => println!("  Cores: {} logical", info.cpu.logical_cores),
    }
    println!("  Frequency: {:.2} GHz", info.cpu.frequency_mhz as f64 / 1000.0);
    println!("  Online: {}", info.cpu.online);
    if !info.isolated_cpus.is_empty() {
        println!("  Isolated: {}", info.isolated_cpus);
    }

    println!("\nMemory: {}", ByteSize::b(info.memory_bytes));
    if let Some(clocksource) = &info.clocksource {
        println!("Clocksource: {}", clocksource);
    }
    if let Some(cmdline) = &info.cmdline {
        println!("Kernel command line: {}", cmdline);
    }

    Ok(())
}
