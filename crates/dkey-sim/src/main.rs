//! dkey-sim: run digital key scenarios against a simulated vehicle.

use clap::{Parser, Subcommand};
use dkey_metrics::metric_defs;
use dkey_sim::{Scenario, SimError, Simulation};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dkey-sim")]
#[command(version, about = "Run digital key scenarios against a simulated vehicle")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario file
    Run {
        /// Scenario YAML file
        scenario: PathBuf,
        /// Continue after a failed step
        #[arg(long)]
        keep_going: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        /// Override the vehicle's handshake result status
        #[arg(long)]
        result_status: Option<u8>,
        /// Corrupt this vehicle handshake reply (0-based)
        #[arg(long)]
        tamper_round: Option<usize>,
    },
    /// Validate a scenario file without running it
    Check {
        /// Scenario YAML file
        scenario: PathBuf,
    },
    /// List the metrics the engine records
    Metrics,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    dkey_metrics::describe_metrics();

    let cli = Cli::parse();
    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Commands) -> Result<(), SimError> {
    match command {
        Commands::Run {
            scenario,
            keep_going,
            json,
            result_status,
            tamper_round,
        } => {
            let mut scenario = Scenario::from_file(&scenario)?;
            if let Some(status) = result_status {
                scenario.vehicle.result_status = status;
            }
            if tamper_round.is_some() {
                scenario.vehicle.tamper_round = tamper_round;
            }

            let mut sim = Simulation::new(&scenario)?;
            let report = sim.run(&scenario.steps, keep_going)?;
            if json {
                let out = serde_json::to_string_pretty(&report)
                    .map_err(|e| SimError::Invalid(e.to_string()))?;
                println!("{}", out);
            } else {
                println!("Steps:            {} ok, {} failed", report.steps_run, report.steps_failed);
                println!(
                    "Handshakes:       {} ok, {} failed",
                    report.authentications, report.handshake_failures
                );
                println!(
                    "Commands:         {} sent, {} written",
                    report.commands_sent, report.commands_acknowledged
                );
                println!(
                    "Frames received:  {} ({} undecodable)",
                    report.frames_received, report.decode_errors
                );
                println!("Calibrations:     {}", report.calibrations_uploaded);
                println!("Wake-ups:         {}", report.wake_ups);
                println!("Final state:      {}", report.final_state);
            }
            Ok(())
        }
        Commands::Check { scenario } => {
            let scenario = Scenario::from_file(&scenario)?;
            println!(
                "{}: {} steps against {}",
                scenario.vehicle.vin,
                scenario.steps.len(),
                scenario.vehicle.name
            );
            Ok(())
        }
        Commands::Metrics => {
            for metric in metric_defs::ALL {
                println!(
                    "{:<36} {:<10} {}",
                    metric.name,
                    metric.kind.as_str(),
                    metric.description
                );
            }
            Ok(())
        }
    }
}
