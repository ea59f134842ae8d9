mod sim;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use siren_dispatch::DispatchConfig;
use siren_dispatch::logging::init_logging;

use crate::sim::{BenchParams, DemoOptions};

#[derive(Parser)]
#[command(name = "siren_dispatch")]
#[command(about = "Emergency dispatch coordinator: demo and benchmark harness")]
#[command(version)]
struct Cli {
    /// TOML config file; SIREN_* environment variables override it
    #[arg(short, long, env = "SIREN_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Command-line overrides, applied after file and environment.
#[derive(Args, Default)]
struct Overrides {
    /// Dispatch worker threads
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Real milliseconds per abstract time unit
    #[arg(long, global = true)]
    time_unit_ms: Option<u64>,

    /// Drain window at shutdown, in time units
    #[arg(long, global = true)]
    drain_units: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Run producers, workers, and the status board, then shut down (default)
    Demo {
        /// Concurrent call operators
        #[arg(short, long, default_value = "2")]
        producers: usize,

        /// Requests per operator; without it operators run for --duration-units
        #[arg(short = 'n', long)]
        requests_per_producer: Option<usize>,

        #[arg(long, default_value = "30")]
        duration_units: u64,

        /// Dashboard period in time units (0 disables it)
        #[arg(long, default_value = "5")]
        dashboard_units: u64,

        #[arg(long)]
        seed: Option<u64>,
    },
    /// Single benchmark run printed as CSV
    Bench {
        #[command(flatten)]
        bench: BenchArgs,
    },
    /// Sweep worker and request counts, one CSV row each
    Stress {
        /// Comma-separated worker counts
        #[arg(long, value_delimiter = ',', default_value = "1,2,4,8")]
        worker_sets: Vec<usize>,

        /// Comma-separated request counts
        #[arg(long, value_delimiter = ',', default_value = "25,50,100")]
        request_sets: Vec<usize>,

        #[command(flatten)]
        bench: BenchArgs,
    },
}

#[derive(Args)]
struct BenchArgs {
    #[arg(short = 'r', long, default_value = "100")]
    requests: usize,

    #[arg(long, default_value = "10")]
    vehicles: usize,

    #[arg(long, default_value = "20")]
    responders: usize,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Report invariant violations on stderr
    #[arg(long)]
    validate: bool,
}

impl BenchArgs {
    fn params(&self, config: &DispatchConfig) -> BenchParams {
        BenchParams {
            workers: config.workers,
            requests: self.requests,
            vehicles: self.vehicles,
            responders: self.responders,
            time_unit_ms: config.time_unit_ms,
            seed: self.seed,
        }
    }
}

fn load_config(cli: &Cli) -> Result<DispatchConfig> {
    let mut config = match &cli.config {
        Some(path) => DispatchConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DispatchConfig::default(),
    };
    config.apply_env().context("applying SIREN_* overrides")?;
    let overrides = &cli.overrides;
    if let Some(workers) = overrides.workers {
        config.workers = workers;
    }
    if let Some(time_unit_ms) = overrides.time_unit_ms {
        config.time_unit_ms = time_unit_ms;
    }
    if let Some(drain_units) = overrides.drain_units {
        config.drain_window_units = drain_units;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.log);
    debug!(?config, "configuration loaded");

    match cli.command {
        None => sim::run_demo(config, DemoOptions::default()),
        Some(Command::Demo {
            producers,
            requests_per_producer,
            duration_units,
            dashboard_units,
            seed,
        }) => sim::run_demo(
            config,
            DemoOptions {
                producers,
                requests_per_producer,
                duration_units,
                dashboard_units,
                seed,
            },
        ),
        Some(Command::Bench { bench }) => {
            let params = bench.params(&config);
            sim::run_benchmark(&config, params, bench.validate)
        }
        Some(Command::Stress {
            worker_sets,
            request_sets,
            bench,
        }) => {
            let params = bench.params(&config);
            sim::run_stress(&config, params, &worker_sets, &request_sets, bench.validate)
        }
    }
}
