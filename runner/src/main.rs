mod catalog;
mod config;
mod jobs;
mod jobstatus;
mod manager;
mod runmanager;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod jobstatus_test;
#[cfg(test)]
mod runmanager_test;
#[cfg(test)]
mod testutil;

use crate::catalog::{Catalog, SharedCatalog};
use crate::config::Config;
use crate::manager::ResourceManager;
use crate::runmanager::{OrchestratorError, RunManager, RunStatus};
use clap::{Args, Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// pause between control loop iterations
const LOOP_DELAY: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "simflow",
    version,
    about = "Automated post-processing and diagnostics for simulation output on HPC clusters"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute the run described by a configuration file
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// path to the YAML run configuration
    config: PathBuf,
    /// cap on concurrently outstanding scheduler jobs
    #[arg(long)]
    max_jobs: Option<usize>,
    /// duplicate log output into this file
    #[arg(long)]
    log: Option<PathBuf>,
    /// refresh published diagnostic output even when already present
    #[arg(long)]
    always_copy: bool,
    /// directory holding batch environment loader scripts
    #[arg(long)]
    resource_path: Option<PathBuf>,
    /// verbose logging
    #[arg(long)]
    debug: bool,
    /// render scripts and mark jobs complete without submitting anything
    #[arg(long)]
    dryrun: bool,
    /// run scripts in-process instead of through a cluster scheduler
    #[arg(long)]
    serial: bool,
}

enum LoopOutcome {
    Finished(RunStatus),
    Interrupted,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_command(args),
    }
}

fn run_command(args: RunArgs) -> ExitCode {
    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("failed to load {}: {error}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    // command line flags win over the configuration file
    if let Some(max_jobs) = args.max_jobs {
        config.global.max_jobs = Some(max_jobs);
    }
    if let Some(resource_path) = args.resource_path {
        config.global.resource_path = Some(resource_path);
    }
    config.global.always_copy |= args.always_copy;
    config.global.debug |= args.debug;
    config.global.dryrun |= args.dryrun;
    config.global.serial |= args.serial;

    if let Err(error) = init_logging(config.global.debug, args.log.as_deref()) {
        eprintln!("failed to set up logging: {error}");
        return ExitCode::FAILURE;
    }

    if config.preflight_checks() {
        error!("configuration failed validation, see the errors above");
        return ExitCode::FAILURE;
    }

    let output = config.global.project_path.join("output");
    for dir in ["scripts", "temp"] {
        if let Err(error) = fs::create_dir_all(output.join(dir)) {
            error!("failed to create {}/{dir}: {error}", output.display());
            return ExitCode::FAILURE;
        }
    }

    let manager = match ResourceManager::load(&config.global) {
        Ok(manager) => manager,
        Err(error) => {
            error!("no usable scheduler backend: {error}");
            return ExitCode::FAILURE;
        }
    };
    info!(backend = manager.name(), "resource manager ready");
    if config.global.serial {
        info!("=== running in serial mode ===");
    }
    if config.global.dryrun {
        info!("=== dryrun mode, nothing will be submitted ===");
    }

    let catalog = match Catalog::open(&output.join("simflow.db"), &config) {
        Ok(catalog) => SharedCatalog::new(catalog),
        Err(error) => {
            error!("failed to open the file catalog: {error}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = catalog.populate(&config) {
        error!("failed to populate the file catalog: {error}");
        return ExitCode::FAILURE;
    }
    if let Err(error) = catalog.refresh_local_status() {
        error!("failed to refresh local file status: {error}");
        return ExitCode::FAILURE;
    }
    match catalog.all_present() {
        Ok(true) => info!("all expected input data is present"),
        Ok(false) => info!("some input data has not appeared yet"),
        Err(error) => {
            error!("failed to query the file catalog: {error}");
            return ExitCode::FAILURE;
        }
    }

    let mut run = RunManager::new(config, catalog.clone(), manager);
    if let Err(error) = run.build_graph() {
        error!("failed to build the job graph: {error}");
        return ExitCode::FAILURE;
    }
    if let Err(error) = run.resolve_dependencies() {
        error!("failed to resolve job dependencies: {error}");
        return ExitCode::FAILURE;
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        if let Err(error) = flag::register(signal, Arc::clone(&interrupted)) {
            warn!("failed to register a signal handler: {error}");
        }
    }

    let state_path = output.join("job_state.txt");
    let report_path = output.join("file_list.txt");
    info!("entering the main loop, state file: {}", state_path.display());

    let outcome = drive(&mut run, &catalog, &state_path, &interrupted);

    if let Err(error) = run.write_job_sets(&state_path) {
        warn!("failed to write the final state dump: {error}");
    }
    if let Err(error) = catalog.write_report(&report_path) {
        warn!("failed to write the catalog report: {error}");
    }
    run.report();
    drop(run);
    if let Err(error) = catalog.close() {
        warn!("failed to close the catalog cleanly: {error}");
    }

    match outcome {
        Ok(LoopOutcome::Finished(RunStatus::Success)) => {
            info!("all jobs completed successfully");
            ExitCode::SUCCESS
        }
        Ok(LoopOutcome::Finished(_)) => {
            error!("run finished with failed jobs, see the report above");
            ExitCode::FAILURE
        }
        Ok(LoopOutcome::Interrupted) => {
            warn!("interrupted, jobs already on the cluster keep running");
            ExitCode::from(130)
        }
        Err(error) => {
            error!("fatal error, aborting the run: {error}");
            ExitCode::from(2)
        }
    }
}

/// one iteration every LOOP_DELAY: refresh readiness, start what is
/// eligible, poll what is outstanding, persist the state dump
fn drive(
    run: &mut RunManager,
    catalog: &SharedCatalog,
    state_path: &Path,
    interrupted: &AtomicBool,
) -> Result<LoopOutcome, OrchestratorError> {
    loop {
        if interrupted.load(Ordering::Relaxed) {
            return Ok(LoopOutcome::Interrupted);
        }

        catalog.refresh_local_status()?;
        run.check_data_ready()?;
        run.start_ready_jobs()?;
        run.monitor_running_jobs()?;
        if let Err(error) = run.write_job_sets(state_path) {
            warn!("failed to write the state dump: {error}");
        }

        match run.is_all_done() {
            RunStatus::Running => sleep(LOOP_DELAY),
            status => return Ok(LoopOutcome::Finished(status)),
        }
    }
}

fn init_logging(debug: bool, log: Option<&Path>) -> Result<(), std::io::Error> {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match log {
        Some(path) => {
            let file = File::create(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
    Ok(())
}
