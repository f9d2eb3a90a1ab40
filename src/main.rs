mod analysis;
mod averager;
mod config;
mod counts;
mod data;
mod engine;
mod export;
mod manager;
mod model;
mod population;
mod rules;
mod slatkin;
mod stats;
mod topology;

use crate::config::Overrides;
use crate::manager::{Manager, RunRequest};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    #[arg(long)]
    sim_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Perform a new run.
    Run(RunArgs),

    /// Write the CSV tables of every run.
    Export,

    /// Remove every run and table.
    Clean,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    experiment: String,

    #[arg(long)]
    configuration: Option<PathBuf>,

    #[arg(long)]
    popsize: Option<usize>,

    #[arg(long)]
    numloci: Option<usize>,

    #[arg(long)]
    maxinittraits: Option<u64>,

    #[arg(long)]
    conformismstrength: Option<f64>,

    #[arg(long)]
    anticonformismstrength: Option<f64>,

    #[arg(long)]
    innovationrate: Option<f64>,

    /// Wrap the lattice around its edges (0 or 1).
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=1))]
    periodic: Option<u8>,

    #[arg(long)]
    kandlerinterval: Option<u64>,

    #[arg(long)]
    simulationendtime: Option<u64>,

    #[arg(long)]
    seed: Option<u64>,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            pop_size: self.popsize,
            num_loci: self.numloci,
            max_init_traits: self.maxinittraits,
            conformism_strength: self.conformismstrength,
            anticonformism_strength: self.anticonformismstrength,
            innovation_rate: self.innovationrate,
            periodic: self.periodic.map(|flag| flag == 1),
            kandler_interval: self.kandlerinterval,
            end_tick: self.simulationendtime,
            seed: self.seed,
        }
    }
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(&args.sim_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Run(run_args) => {
            let request = RunRequest {
                experiment: run_args.experiment.clone(),
                configuration: run_args.configuration.clone(),
                overrides: run_args.overrides(),
                command_line: std::env::args().collect::<Vec<_>>().join(" "),
            };
            mgr.run_simulation(&request)?
        }
        Command::Export => mgr.export_data()?,
        Command::Clean => mgr.clean_sim()?,
    }

    Ok(())
}
