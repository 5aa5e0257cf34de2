//! `enose` — CLI for the experiment execution engine.
//!
//! Subcommands: `validate` (parse + validate a program), `run` (execute a
//! program against the configured links or the simulation backends) and
//! `status` (configuration and consumable overview). Ctrl-C during a run
//! maps to `abort()`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use enose_common::config::{ConfigLoader, EnoseConfig};
use enose_common::program::{validate, Program};
use enose_engine::runner::EngineState;
use enose_engine::{ControllerContext, ExperimentEngine, ProgressEvent};
use enose_hal::loadcell::SimWeightSource;
use enose_hal::motion::{SimMotionPort, TcpMotionPort};
use enose_hal::sensor::SimSensorPort;
use enose_store::MemoryStore;

#[derive(Parser)]
#[command(name = "enose", about = "E-nose experiment execution engine", version)]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = "config/enose.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate a program, printing errors and warnings.
    Validate {
        /// Program file (TOML).
        program: PathBuf,
    },
    /// Execute a program.
    Run {
        /// Program file (TOML).
        program: PathBuf,
        /// Use simulated links instead of hardware.
        #[arg(long)]
        sim: bool,
    },
    /// Print configuration and consumable overview.
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match EnoseConfig::load(&cli.config).and_then(|c| c.validate().map(|_| c)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ENOSE_LOG")
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Validate { program } => cmd_validate(&program),
        Command::Run { program, sim } => cmd_run(config, &program, sim),
        Command::Status => cmd_status(&config),
    }
}

fn load_program(path: &PathBuf) -> Result<Program, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    Program::from_toml(&text).map_err(|e| e.to_string())
}

fn cmd_validate(path: &PathBuf) -> ExitCode {
    let program = match load_program(path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("parse error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let report = validate(&program);
    for w in &report.warnings {
        println!("warning: {w}");
    }
    for e in &report.errors {
        println!("error: {e}");
    }
    if report.is_ok() {
        println!(
            "program ok: {} step(s), {} leaf step(s)",
            program.steps.len(),
            program.leaf_count()
        );
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn cmd_run(config: EnoseConfig, path: &PathBuf, sim: bool) -> ExitCode {
    let program = match load_program(path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("parse error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let store = Arc::new(MemoryStore::new());
    let ctx = if sim {
        let (motion, _motion_handle) = SimMotionPort::healthy();
        let (s0, _h0) = SimSensorPort::healthy("sim0");
        let (s1, _h1) = SimSensorPort::healthy("sim1");
        ControllerContext::assemble(
            config,
            Box::new(motion),
            Some(Box::new(SimWeightSource::constant(0.0))),
            Some((Box::new(s0), Box::new(s1))),
            store,
        )
    } else {
        let motion = match TcpMotionPort::connect(
            &config.motion.host,
            config.motion.port,
            Duration::from_secs(5),
        ) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "motion controller connection failed");
                return ExitCode::FAILURE;
            }
        };
        // The load-cell and sensor serial drivers are deployment
        // adapters; without them the engine runs motion-only programs.
        ControllerContext::assemble(config, Box::new(motion), None, None, store)
    };

    let engine = Arc::new(ExperimentEngine::new(ctx));
    let progress = engine.subscribe_progress();

    {
        let engine = engine.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("interrupt received, aborting run");
            let _ = engine.abort();
        }) {
            error!(error = %e, "interrupt handler not installed");
        }
    }

    if let Err(e) = engine.load(program) {
        eprintln!("load failed: {e}");
        if let enose_engine::EngineError::ProgramInvalid(report) = e {
            for issue in &report.errors {
                eprintln!("error: {issue}");
            }
        }
        return ExitCode::FAILURE;
    }
    let run_id = match engine.start() {
        Ok(id) => id,
        Err(e) => {
            eprintln!("start failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!("run {run_id} started");

    loop {
        while let Ok(event) = progress.try_recv() {
            print_event(&event);
        }
        let state = engine.wait_settled(Duration::from_millis(200));
        if !state.is_busy() {
            while let Ok(event) = progress.try_recv() {
                print_event(&event);
            }
            return match state {
                EngineState::Completed => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    }
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::StepStarted { index, name, phase } => match phase {
            Some(p) => println!("[{index}] {name} ({p}) ..."),
            None => println!("[{index}] {name} ..."),
        },
        ProgressEvent::StepCompleted {
            index,
            name,
            duration_ms,
        } => println!("[{index}] {name} done in {duration_ms} ms"),
        ProgressEvent::StepSkipped {
            index,
            name,
            reason,
        } => println!("[{index}] {name} skipped: {reason}"),
        ProgressEvent::PhaseStarted { name } => println!("--- phase {name} ---"),
        ProgressEvent::PhaseEnded { name } => println!("--- phase {name} end ---"),
        ProgressEvent::RunCompleted { run_id } => println!("run {run_id} completed"),
        ProgressEvent::RunAborted { run_id } => println!("run {run_id} aborted"),
        ProgressEvent::RunFailed { run_id, reason } => {
            println!("run {run_id} failed: {reason}")
        }
    }
}

fn cmd_status(config: &EnoseConfig) -> ExitCode {
    println!(
        "motion controller: {}:{} (ack {} ms)",
        config.motion.host, config.motion.port, config.motion.ack_timeout_ms
    );
    println!(
        "sensor link: {} / {} @ {} baud",
        config.sensor.primary_port, config.sensor.secondary_port, config.sensor.baud
    );
    println!("store: {} (pool {})", config.store.dsn, config.store.pool_size);
    println!(
        "bottle: {} ml capacity, {} ml max fill",
        config.bottle.capacity_ml, config.bottle.max_fill_ml
    );
    println!("consumables:");
    for spec in &config.consumables {
        println!(
            "  {:<16} lifetime {:>10.0}  warn {:.0}%  critical {:.0}%",
            spec.id,
            spec.lifetime,
            spec.warning_at * 100.0,
            spec.critical_at * 100.0
        );
    }
    ExitCode::SUCCESS
}
