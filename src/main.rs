//! CLI entry point for qt3_daq.
//!
//! Provides:
//! - `check`: load a lab configuration and resolve every controller
//! - `count`: stream count rates from an edge counter
//! - `scan`: sweep a voltage controller while sampling a counter
//!
//! Hardware is provided by the in-process simulator, so every command can be
//! run without a DAQ card attached.
//!
//! # Usage
//!
//! ```bash
//! qt3_daq check lab.yaml
//! qt3_daq check lab.toml --json
//! qt3_daq count lab.yaml --counter counter --batches 10 --edge-rate 5000
//! qt3_daq scan lab.yaml --counter counter --piezo piezo --lines 3
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use qt3_daq::controllers::{ControllerInstance, EdgeCounter, Lifecycle, VoltageController};
use qt3_daq::hardware::{EdgeSource, SessionManager, SimulatedDaq};
use qt3_daq::logging;
use qt3_daq::scanner::CounterAndScanner;
use qt3_daq::{ControllerRegistry, LabConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "qt3_daq")]
#[command(about = "Configuration-driven DAQ edge counter and voltage controllers", long_about = None)]
struct Cli {
    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a lab configuration and resolve every controller
    Check {
        /// Path to a .yaml/.yml/.toml lab configuration
        config: PathBuf,

        /// Print the merged configuration as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stream count rates from an edge counter
    Count {
        /// Path to the lab configuration
        config: PathBuf,

        /// Name of the edge counter controller
        #[arg(long, default_value = "counter")]
        counter: String,

        /// Number of batches to print
        #[arg(long, default_value_t = 10)]
        batches: usize,

        /// Simulated edge rate on the signal terminal (Hz)
        #[arg(long, default_value_t = 5_000.0)]
        edge_rate: f64,
    },

    /// Sweep a voltage controller while sampling counts
    Scan {
        /// Path to the lab configuration
        config: PathBuf,

        /// Name of the edge counter controller
        #[arg(long, default_value = "counter")]
        counter: String,

        /// Name of the voltage controller
        #[arg(long, default_value = "piezo")]
        piezo: String,

        /// Number of lines to scan
        #[arg(long, default_value_t = 1)]
        lines: u32,

        /// Step between positions
        #[arg(long)]
        step: Option<f64>,

        /// Simulated edge rate on the signal terminal (Hz)
        #[arg(long, default_value_t = 5_000.0)]
        edge_rate: f64,
    },
}

impl Commands {
    fn config_path(&self) -> &PathBuf {
        match self {
            Self::Check { config, .. } | Self::Count { config, .. } | Self::Scan { config, .. } => {
                config
            }
        }
    }
}

struct Lab {
    daq: Arc<SimulatedDaq>,
    controllers: BTreeMap<String, ControllerInstance>,
}

fn load_lab(config: &LabConfig) -> Result<Lab> {
    let daq = Arc::new(SimulatedDaq::new());
    let sessions = Arc::new(SessionManager::new(daq.clone()));
    let controllers = ControllerRegistry::with_defaults()
        .resolve_all(config, &sessions)
        .context("failed to resolve controllers")?;
    Ok(Lab { daq, controllers })
}

fn edge_counter(lab: &Lab, name: &str) -> Result<Arc<EdgeCounter>> {
    lab.controllers
        .get(name)
        .and_then(ControllerInstance::as_edge_counter)
        .cloned()
        .ok_or_else(|| anyhow!("'{}' is not an edge counter in this configuration", name))
}

fn voltage_controller(lab: &Lab, name: &str) -> Result<Arc<VoltageController>> {
    lab.controllers
        .get(name)
        .and_then(ControllerInstance::as_voltage)
        .cloned()
        .ok_or_else(|| anyhow!("'{}' is not a voltage controller in this configuration", name))
}

fn attach_edge_source(lab: &Lab, counter: &EdgeCounter, edge_rate: f64) {
    let config = counter.config();
    lab.daq.set_edge_source(
        config.device.name(),
        &config.signal_terminal,
        EdgeSource::Jittered { mean_hz: edge_rate },
    );
    if let Some(terminal) = &config.clock.terminal {
        lab.daq.connect_external_clock(
            config.device.name(),
            terminal,
            f64::from(config.clock.rate_hz),
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = LabConfig::load_from(cli.command.config_path())
        .with_context(|| format!("loading {}", cli.command.config_path().display()))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    logging::init(&config.logging).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Check { json, .. } => check(&config, json),
        Commands::Count {
            counter,
            batches,
            edge_rate,
            ..
        } => count(&config, &counter, batches, edge_rate).await,
        Commands::Scan {
            counter,
            piezo,
            lines,
            step,
            edge_rate,
            ..
        } => scan(&config, &counter, &piezo, lines, step, edge_rate).await,
    }
}

fn check(config: &LabConfig, json: bool) -> Result<()> {
    let lab = load_lab(config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }
    for (name, controller) in &lab.controllers {
        match controller {
            ControllerInstance::EdgeCounter(c) => {
                let cfg = c.config();
                println!(
                    "{name}: edge counter on {}/{} (signal {}, clock {} Hz{}, batch {})",
                    cfg.device,
                    cfg.signal_counter,
                    cfg.signal_terminal,
                    cfg.clock.rate_hz,
                    cfg.clock
                        .terminal
                        .as_ref()
                        .map(|t| format!(" external on {t}"))
                        .unwrap_or_default(),
                    cfg.num_data_samples_per_batch
                );
            }
            ControllerInstance::Voltage(v) => {
                let cfg = v.config();
                println!(
                    "{name}: voltage controller on {} ({} axes: {:?}, units {}, {:?} out of range)",
                    cfg.device,
                    v.n_axes(),
                    cfg.write_channels.qualified(&cfg.device),
                    cfg.units.symbol(),
                    cfg.out_of_range
                );
            }
        }
    }
    println!("{} controller(s) OK", lab.controllers.len());
    Ok(())
}

async fn count(config: &LabConfig, name: &str, batches: usize, edge_rate: f64) -> Result<()> {
    let lab = load_lab(config)?;
    let counter = edge_counter(&lab, name)?;
    attach_edge_source(&lab, &counter, edge_rate);

    counter.start()?;
    let mut stream = counter.spawn_stream(16)?;
    let mut received = 0;
    while let Some(item) = stream.next().await {
        match item {
            Ok(sample) => {
                println!("batch {:>4}: {:>12.1} counts/s", sample.sequence, sample.rate);
                received += 1;
                if received >= batches {
                    break;
                }
            }
            Err(e) if e.is_retryable() => eprintln!("warning: {e}"),
            Err(e) => {
                counter.close();
                return Err(e.into());
            }
        }
    }
    counter.stop()?;
    info!(batches = received, "Count finished");
    Ok(())
}

async fn scan(
    config: &LabConfig,
    counter: &str,
    piezo: &str,
    lines: u32,
    step: Option<f64>,
    edge_rate: f64,
) -> Result<()> {
    let lab = load_lab(config)?;
    let counter = edge_counter(&lab, counter)?;
    let piezo = voltage_controller(&lab, piezo)?;
    attach_edge_source(&lab, &counter, edge_rate);

    piezo.start()?;
    let mut scanner = CounterAndScanner::new(counter, piezo.clone());
    scanner.set_tmax(lines);
    if let Some(step) = step {
        scanner.set_step_size(step)?;
    }

    // The scan loop blocks on counter reads
    let scanner = tokio::task::spawn_blocking(move || -> qt3_daq::Result<CounterAndScanner> {
        scanner.start()?;
        scanner.set_to_starting_position()?;
        while scanner.still_scanning() {
            scanner.scan_v()?;
        }
        scanner.stop()?;
        Ok(scanner)
    })
    .await??;

    let (vmin, vmax) = scanner.scan_range();
    for (line, rates) in scanner.scanned_count_rate().iter().enumerate() {
        let mean = rates.iter().flatten().sum::<f64>() / rates.len().max(1) as f64;
        println!(
            "line {line}: {} positions over [{vmin}, {vmax}], mean {mean:.1} counts/s",
            rates.len()
        );
    }
    piezo.stop()?;
    Ok(())
}
