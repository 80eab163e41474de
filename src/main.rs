//! RuleFlow CLI Entry Point
//!
//! Provides command-line interface for rule file execution.
//!
//! # Usage
//!
//! ```bash
//! # Build one target
//! ruleflow rules.yaml manifests/s1.fofn
//!
//! # Dry run mode (list jobs)
//! ruleflow rules.yaml manifests/s1.fofn --dry-run
//!
//! # Run in a data directory with 16 cores and 3 attempts per task
//! ruleflow rules.yaml manifests/s1.fofn --working-dir /data/run1 --cores 16 --attempts 3
//!
//! # Stop scheduling new tasks once /tmp/stop.flag appears
//! ruleflow rules.yaml manifests/s1.fofn --stop-flag /tmp/stop.flag
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use log::info;

use ruleflow::monitoring::LogObserver;
use ruleflow::workflow::parser::load_rules;
use ruleflow::{Engine, FsStore, APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    rules_path: Option<String>,
    targets: Vec<String>,
    dry_run: bool,
    working_dir: Option<PathBuf>,
    cores: Option<usize>,
    max_jobs: Option<usize>,
    mem_mb: Option<u64>,
    attempts: Option<u32>,
    report: Option<PathBuf>,
    stop_flag: Option<PathBuf>,
    timeline: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Checkpoint-Driven Pipeline Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: ruleflow [OPTIONS] <RULES_FILE> <TARGET>...");
    println!();
    println!("Arguments:");
    println!("  <RULES_FILE>        Path to the rule YAML file");
    println!("  <TARGET>...         Files to produce");
    println!();
    println!("Options:");
    println!("  --dry-run           List jobs without executing them");
    println!("  --working-dir PATH  Directory rule paths resolve against");
    println!("  --cores N           Thread budget (default: all cores)");
    println!("  --jobs N            Maximum concurrently running tasks");
    println!("  --mem-mb N          Memory budget in megabytes (default: system memory)");
    println!("  --attempts N        Attempts per task before it is fatal");
    println!("  --report PATH       Write a JSON run report");
    println!("  --stop-flag PATH    Stop the run once this file exists");
    println!("  --timeline          Print a Gantt chart of the run");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  ruleflow rules.yaml manifests/s1.fofn");
    println!("  ruleflow rules.yaml manifests/s1.fofn --dry-run");
    println!("  ruleflow rules.yaml manifests/s1.fofn --working-dir /data/run1 --cores 16");
}

/// Reads the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", option))
}

fn parse_number<T: std::str::FromStr>(value: &str, option: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", option, value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" | "-n" => config.dry_run = true,
            "--verbose" | "-v" => config.verbose = true,
            "--timeline" => config.timeline = true,
            "--working-dir" => {
                config.working_dir = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--cores" | "-c" => {
                config.cores = Some(parse_number(option_value(args, &mut i, arg)?, arg)?);
            }
            "--jobs" | "-j" => {
                config.max_jobs = Some(parse_number(option_value(args, &mut i, arg)?, arg)?);
            }
            "--mem-mb" => {
                config.mem_mb = Some(parse_number(option_value(args, &mut i, arg)?, arg)?);
            }
            "--attempts" => {
                config.attempts = Some(parse_number(option_value(args, &mut i, arg)?, arg)?);
            }
            "--report" => {
                config.report = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--stop-flag" => {
                config.stop_flag = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                if config.rules_path.is_none() {
                    config.rules_path = Some(arg.clone());
                } else {
                    config.targets.push(arg.clone());
                }
            }
        }
        i += 1;
    }

    if config.rules_path.is_none() {
        return Err("Missing rules file".to_string());
    }
    if config.targets.is_empty() {
        return Err("At least one target is required".to_string());
    }
    Ok(config)
}

/// Validates the working directory.
fn check_working_directory(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }
    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(cli.verbose);
    print_banner();

    let rules_path = cli.rules_path.unwrap_or_default();
    let (registry, settings) = load_rules(&rules_path)?.into_registry()?;
    info!("Loaded {} rule(s) from {}", registry.len(), rules_path);

    // Command-line flags override the file's settings
    let mut settings = settings;
    if let Some(dir) = cli.working_dir {
        settings = settings.with_working_dir(dir);
    }
    if let Some(cores) = cli.cores {
        settings = settings.with_cores(cores);
    }
    if let Some(jobs) = cli.max_jobs {
        settings = settings.with_max_jobs(jobs);
    }
    if let Some(mem_mb) = cli.mem_mb {
        settings = settings.with_max_mem_mb(mem_mb);
    }
    if let Some(attempts) = cli.attempts {
        settings = settings.with_max_attempts(attempts);
    }
    let dry_run = cli.dry_run || settings.dry_run;
    let settings = settings.with_dry_run(dry_run).with_detected_memory();

    let root = match &settings.working_dir {
        Some(dir) => {
            check_working_directory(dir)?;
            dir.clone()
        }
        None => env::current_dir()?,
    };
    info!("Working directory: {}", root.display());
    if settings.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
    }

    let store = Arc::new(FsStore::new(&root));
    let mut engine = Engine::new(registry, store, settings.with_working_dir(root.clone()))?
        .with_observer(Box::new(LogObserver));
    if let Some(flag) = cli.stop_flag {
        info!("Stop control: {}", flag.display());
        engine.set_stop_flag(flag);
    }

    let summary = engine.run(&cli.targets)?;

    println!();
    println!("{}", summary.render());
    if cli.timeline {
        println!("{}", engine.timeline().gantt_chart());
    }
    if let Some(path) = cli.report {
        summary.write_report(&path)?;
        info!("Run report written to {}", path.display());
    }

    summary.into_result()?;
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
