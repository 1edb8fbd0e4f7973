//! CLI entry point for the buoy agent.
//!
//! # Usage
//!
//! Run the agent against the configured serial port and broker:
//! ```bash
//! buoy-agent run --config /etc/buoy/agent.toml
//! ```
//!
//! Dry run with a simulated current meter, in-memory store and broker:
//! ```bash
//! buoy-agent run --config config/agent.toml --mock
//! ```
//!
//! Check a configuration file (and `BUOY_*` overrides) without starting:
//! ```bash
//! buoy-agent check-config --config config/agent.toml
//! ```

use anyhow::{Context, Result};
use buoy_agent::broker::MemoryBroker;
use buoy_agent::config::AgentConfig;
use buoy_agent::daemon::{Daemon, ExitStatus};
use buoy_agent::device::mock::{MockControl, MockOpener, MockPort};
use buoy_agent::logging::{self, LoggingConfig};
use buoy_agent::network::AlwaysReachable;
use buoy_agent::orchestrator::{Collaborators, DeviceOrchestrator};
use buoy_agent::store::SqliteStore;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "buoy-agent")]
#[command(about = "Serial instrument to MQTT agent with a durable outbox", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until SIGINT/SIGTERM
    Run {
        /// Path to the TOML configuration file
        #[arg(long, default_value = "config/agent.toml")]
        config: PathBuf,

        /// Use a simulated instrument and an in-memory store and broker
        #[arg(long)]
        mock: bool,
    },

    /// Load and validate the configuration, then print it as JSON
    CheckConfig {
        /// Path to the TOML configuration file
        #[arg(long, default_value = "config/agent.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let status = match cli.command {
        Commands::Run { config, mock } => run(config, mock),
        Commands::CheckConfig { config } => check_config(config),
    };
    std::process::exit(status.code());
}

fn load_config(path: &Path) -> Result<AgentConfig> {
    let config = AgentConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check_config(path: PathBuf) -> ExitStatus {
    match load_config(&path).and_then(|c| Ok(serde_json::to_string_pretty(&c)?)) {
        Ok(json) => {
            println!("{json}");
            ExitStatus::Ok
        }
        Err(e) => {
            eprintln!("Invalid configuration: {e:#}");
            ExitStatus::Config
        }
    }
}

fn run(path: PathBuf, mock: bool) -> ExitStatus {
    let config = match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e:#}");
            return ExitStatus::Config;
        }
    };

    let logging = LoggingConfig::from_agent_config(&config).and_then(logging::init);
    if let Err(e) = logging {
        eprintln!("{e}");
        return ExitStatus::Config;
    }

    let daemon = Daemon::new(
        config.agent.device_name.clone(),
        &config.service.pid_dir,
        config.service.start_timeout,
    );
    if let Err(e) = daemon.install_signal_handler() {
        error!(error = %e, "Cannot install signal handler");
        return ExitStatus::OsError;
    }

    if mock {
        return run_mock(&config, &daemon);
    }

    let mut orchestrator = match DeviceOrchestrator::from_config(&config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "Cannot build the device pipeline");
            return ExitStatus::OsError;
        }
    };
    daemon.start(&mut orchestrator)
}

fn run_mock(config: &AgentConfig, daemon: &Daemon) -> ExitStatus {
    info!("Dry run: simulated current meter, in-memory store and broker");
    let store = match SqliteStore::open_in_memory() {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Cannot open in-memory store");
            return ExitStatus::OsError;
        }
    };
    let (port, control) = MockPort::new();
    let (broker, broker_handle) = MemoryBroker::new();
    broker_handle.set_auto_ack(true);

    let parts = Collaborators {
        opener: Box::new(MockOpener::new(port)),
        instrument: Arc::new(buoy_agent::instrument::AcmPlus::new()),
        store: Arc::new(store),
        broker: Box::new(broker),
        reachability: Box::new(AlwaysReachable),
    };
    let mut orchestrator =
        DeviceOrchestrator::new(config.agent.device_name.clone(), parts, config.into());

    let done = Arc::new(AtomicBool::new(false));
    let simulator = {
        let done = Arc::clone(&done);
        thread::Builder::new()
            .name("simulator".to_string())
            .spawn(move || simulate_current_meter(&control, &done))
    };

    let status = daemon.start(&mut orchestrator);
    done.store(true, Ordering::SeqCst);
    if let Ok(handle) = simulator {
        let _ = handle.join();
    }
    info!(published = broker_handle.published().len(), "Dry run finished");
    status
}

/// Prints one ACM-Plus style line per second into the mock port.
fn simulate_current_meter(control: &MockControl, done: &AtomicBool) {
    let mut step: u32 = 0;
    while !done.load(Ordering::SeqCst) {
        let phase = f64::from(step) / 10.0;
        let now = Utc::now();
        let line = format!(
            " {:.2},  {:.2}, {}, {}, {:.2}\n",
            10.0 * phase.sin(),
            10.0 * phase.cos(),
            now.format("%H:%M:%S"),
            now.format("%d-%m-%Y"),
            17.0 + phase.sin() / 2.0,
        );
        control.feed(line);
        step = step.wrapping_add(1);
        thread::sleep(Duration::from_secs(1));
    }
}
