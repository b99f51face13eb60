//! Simulation harness CLI.
//!
//! Runs validation scenarios against the reconstruction and alignment
//! engine, optionally exports a JSON summary and a binary event record.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use beamline_sim::oracle::{Oracle, OracleConfig};
use beamline_sim::runner::{reconstruct_to_file, RunConfig};
use beamline_sim::scenarios::{ScenarioId, ScenarioRunner};
use beamline_sim::telescope::{telescope_device, TelescopeConfig};

#[derive(Parser, Debug)]
#[command(name = "beamline-sim")]
#[command(about = "Run telescope reconstruction and alignment scenarios", long_about = None)]
struct Args {
    /// Scenario name, or "all"
    #[arg(short, long, default_value = "all")]
    scenario: String,

    /// Seed for the deterministic event generation
    #[arg(long, default_value_t = 12345)]
    seed: u64,

    /// Number of events per scenario
    #[arg(short = 'n', long, default_value_t = 1000)]
    events: u64,

    /// Write a JSON summary of the scenario results
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Reconstruct a clean sample and write it as a binary event record
    #[arg(long)]
    write_events: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all().to_vec()
    } else {
        match ScenarioId::from_name(&args.scenario) {
            Some(scenario) => vec![scenario],
            None => {
                error!("unknown scenario '{}'", args.scenario);
                let names: Vec<_> = ScenarioId::all().iter().map(|s| s.name()).collect();
                error!("available: all, {}", names.join(", "));
                return ExitCode::from(2);
            }
        }
    };

    let runner = ScenarioRunner::new(args.seed).with_events(args.events);
    let mut results = Vec::new();
    for scenario in scenarios {
        let result = runner.run(scenario);
        if result.passed {
            info!("scenario {}: passed", scenario.name());
        } else {
            error!("scenario {}: FAILED", scenario.name());
            for failure in &result.failures {
                error!("  {}", failure);
            }
        }
        for note in &result.notes {
            info!("  {}", note);
        }
        results.push(result);
    }

    if let Some(path) = args.write_events.as_ref() {
        let device = telescope_device(&TelescopeConfig::default());
        let mut oracle = Oracle::new(args.seed, OracleConfig::default());
        let events = Arc::new(oracle.generate(&device, args.events));
        match reconstruct_to_file(&device, &events, &RunConfig::default(), path) {
            Ok(summary) => info!(
                "wrote {} events with {} tracks to {}",
                summary.events,
                summary.tracks,
                path.display()
            ),
            Err(e) => {
                error!("writing events failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    if let Some(path) = args.output.as_ref() {
        let summary: Vec<serde_json::Value> = results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "failures": r.failures,
                    "notes": r.notes,
                })
            })
            .collect();
        let text = serde_json::to_string_pretty(&summary).expect("summary is serializable");
        if let Err(e) = std::fs::write(path, text) {
            error!("writing summary failed: {e}");
            return ExitCode::FAILURE;
        }
        info!("wrote summary to {}", path.display());
    }

    if results.iter().all(|r| r.passed) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
