use crate::config::{Config, Overrides};
use crate::data::{RecordWriter, SimulationRecord, read_records};
use crate::engine::{Engine, RunInfo};
use crate::export::Exporter;
use anyhow::{Context, Result, bail};
use glob::glob;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};
use uuid::Uuid;

const CSV_FILES: &[&str] = &[
    "simulation-data.csv",
    "population-data.csv",
    "sampled-data.csv",
    "tasampled-data.csv",
];

/// Options of a single run.
pub struct RunRequest {
    pub experiment: String,
    /// Configuration file, `config.toml` in the simulation directory by default.
    pub configuration: Option<PathBuf>,
    pub overrides: Overrides,
    pub command_line: String,
}

/// Runs simulations and exports their data inside a simulation directory.
pub struct Manager {
    sim_dir: PathBuf,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();
        if !sim_dir.is_dir() {
            bail!("{sim_dir:?} is not a directory");
        }
        Ok(Self { sim_dir })
    }

    pub fn run_simulation(&self, request: &RunRequest) -> Result<()> {
        let cfg_file = match &request.configuration {
            Some(file) => file.clone(),
            None => self.sim_dir.join("config.toml"),
        };
        let cfg = Config::from_file(&cfg_file, &request.overrides)
            .with_context(|| format!("failed to load {cfg_file:?}"))?;
        log::info!("{cfg:#?}");

        let mut engine = Engine::new(cfg.clone()).context("failed to construct engine")?;

        let run_idx = self.count_run_dirs().context("failed to count run dirs")?;
        let run_dir = self.run_dir(run_idx);
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");

        let run = RunInfo {
            simulation_id: Uuid::new_v4().urn().to_string(),
            experiment: request.experiment.clone(),
        };
        log::info!("simulation id = {}", run.simulation_id);

        let start = Instant::now();
        let mut writer = RecordWriter::create(self.samples_file(run_idx))?;
        engine
            .perform_simulation(&run, &mut writer)
            .context("failed to perform simulation")?;
        let n_records = writer.finish()?;
        let elapsed_secs = start.elapsed().as_secs_f64();
        log::info!("wrote {n_records} records in {elapsed_secs:.3} s");

        let pop = engine.population();
        let sim = SimulationRecord {
            simulation_id: run.simulation_id,
            experiment: run.experiment,
            command_line: request.command_line.clone(),
            seed: engine.seed(),
            config: cfg,
            final_tick: engine.tick(),
            elapsed_secs,
            interactions: pop.interactions().clone(),
            innovations: pop.innovations().clone(),
        };
        sim.save(self.simulation_file(run_idx))
            .context("failed to save simulation record")?;

        Ok(())
    }

    /// Write the CSV tables of every run in the simulation directory.
    pub fn export_data(&self) -> Result<()> {
        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;
        let mut exporter = Exporter::create(&self.sim_dir).context("failed to create tables")?;

        for run_idx in 0..n_runs {
            let sim_file = self.simulation_file(run_idx);
            let sim = SimulationRecord::load(&sim_file)
                .with_context(|| format!("failed to load {sim_file:?}"))?;
            let samples_file = self.samples_file(run_idx);
            let records = read_records(&samples_file)
                .with_context(|| format!("failed to read {samples_file:?}"))?;
            exporter
                .add_run(&sim, &records)
                .with_context(|| format!("failed to export run {run_idx}"))?;
        }

        let n_rows = exporter.finish()?;
        log::info!("exported {n_rows} rows from {n_runs} runs");

        Ok(())
    }

    /// Remove every run directory and exported table.
    pub fn clean_sim(&self) -> Result<()> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        for entry in glob(pattern).context("failed to glob run dirs")? {
            let run_dir = entry.context("failed to read glob entry")?;
            if run_dir.is_dir() {
                fs::remove_dir_all(&run_dir)
                    .with_context(|| format!("failed to remove {run_dir:?}"))?;
                log::info!("removed {run_dir:?}");
            }
        }

        for name in CSV_FILES {
            let file = self.sim_dir.join(name);
            if file.exists() {
                fs::remove_file(&file).with_context(|| format!("failed to remove {file:?}"))?;
                log::info!("removed {file:?}");
            }
        }

        Ok(())
    }

    fn count_run_dirs(&self) -> Result<usize> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let count = glob(pattern)
            .context("failed to glob run dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .count();
        Ok(count)
    }

    fn run_dir(&self, run_idx: usize) -> PathBuf {
        self.sim_dir.join(format!("run-{run_idx:04}"))
    }

    fn samples_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("samples.msgpack")
    }

    fn simulation_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("simulation.json")
    }
}
