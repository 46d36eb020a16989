//! invtrack command-line driver.
//!
//! Provides two modes of operation:
//! - `run`: Step a tracking scenario and print the tracking error
//! - `info`: Print crate versions and the default scenario

mod scenario;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::scenario::{Scenario, ScenarioConfig, ScenarioError};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Inverse-dynamics tracking controller.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tracking scenario.
    Run {
        /// Scenario file (TOML). Uses the built-in planar reach if omitted.
        #[arg(short, long)]
        scenario: Option<PathBuf>,

        /// Number of steps, overriding the scenario.
        #[arg(short = 'n', long)]
        steps: Option<u32>,

        /// Print every n-th step.
        #[arg(short, long, default_value_t = 10)]
        every: u32,
    },

    /// Print crate information and the default scenario.
    Info,
}

// ---------------------------------------------------------------------------
// Mode implementations
// ---------------------------------------------------------------------------

fn run_scenario(
    path: Option<PathBuf>,
    steps: Option<u32>,
    every: u32,
) -> Result<(), ScenarioError> {
    let config = match path {
        Some(path) => ScenarioConfig::from_file(path)?,
        None => ScenarioConfig::default(),
    };
    let steps = steps.unwrap_or(config.steps);
    let mut scenario = Scenario::build(config)?;
    println!(
        "running {steps} steps with {} actuators",
        scenario.controller().num_excitations()
    );

    let every = every.max(1);
    let mut count = 0u32;
    let summary = scenario.run(steps, |report| {
        count += 1;
        if count % every == 0 {
            let excitations: Vec<String> = report
                .excitations
                .iter()
                .map(|e| format!("{e:.3}"))
                .collect();
            println!(
                "t={:.3}  error={:.2e}  excitations=[{}]{}",
                report.t,
                report.error,
                excitations.join(", "),
                if report.retained { "  (retained)" } else { "" }
            );
        }
    })?;

    println!(
        "\ntotal: steps={}, retained={}, max_error={:.3e}, final_error={:.3e}",
        summary.steps, summary.retained, summary.max_error, summary.final_error
    );
    Ok(())
}

fn run_info() -> Result<(), ScenarioError> {
    println!("invtrack v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("crates:");
    println!("  invtrack-core     {}", env!("CARGO_PKG_VERSION"));
    println!("  invtrack-qp       {}", env!("CARGO_PKG_VERSION"));
    println!("  invtrack-mech     {}", env!("CARGO_PKG_VERSION"));
    println!("  invtrack-control  {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("default scenario:");
    let text = toml::to_string_pretty(&ScenarioConfig::default())
        .map_err(|e| ScenarioError::Invalid(e.to_string()))?;
    println!("{text}");
    Ok(())
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Some(Commands::Run {
            scenario,
            steps,
            every,
        }) => run_scenario(scenario, steps, every),
        Some(Commands::Info) => run_info(),
        None => run_scenario(None, None, 10),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
