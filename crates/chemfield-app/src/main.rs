use std::path::PathBuf;

use anyhow::Result;
use chemfield_app::{Preset, RunOptions, Scenario, run};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "chemfield",
    version,
    about = "Run hybrid diffusion and stochastic reaction simulations"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate a scenario file or a built-in preset.
    Run {
        /// Scenario JSON file; takes precedence over --preset.
        #[arg(short, long, env = "CHEMFIELD_SCENARIO")]
        config: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = Preset::Trail)]
        preset: Preset,
        #[arg(long, default_value_t = 100)]
        ticks: u64,
        /// Tick length; defaults to the scenario's max_time_step.
        #[arg(long)]
        dt: Option<f64>,
        #[arg(long)]
        seed: Option<u64>,
        /// Write every reaction event to this JSON-lines file.
        #[arg(long)]
        events: Option<PathBuf>,
        /// Log progress every N ticks (0 = final summary only).
        #[arg(long, default_value_t = 10)]
        summary_every: u64,
    },
    /// Print a preset as scenario JSON.
    Dump {
        #[arg(value_enum)]
        preset: Preset,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            preset,
            ticks,
            dt,
            seed,
            events,
            summary_every,
        } => {
            let scenario = match &config {
                Some(path) => Scenario::load(path)?,
                None => Scenario::preset(preset),
            };
            info!(
                source = config
                    .as_ref()
                    .map_or_else(|| format!("{preset:?}"), |p| p.display().to_string()),
                ticks,
                "starting chemfield run"
            );
            let summary = run(
                scenario,
                &RunOptions {
                    ticks,
                    dt,
                    seed,
                    events_path: events,
                    summary_every,
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Dump { preset } => {
            println!("{}", serde_json::to_string_pretty(&Scenario::preset(preset))?);
        }
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
