use crate::analysis::KandlerSurvival;
use crate::config::{Config, Topology};
use crate::counts::DiversityReport;
use crate::data::{SampleRecord, SimulationRecord};
use crate::stats::Accumulator;
use anyhow::{Context, Result, ensure};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

const SIMULATION_HEADER: &[&str] = &[
    "simulation_id",
    "experiment",
    "seed",
    "final_tick",
    "interactions",
    "innovations",
    "elapsed_secs",
    "command_line",
];

const RECORD_HEADER: &[&str] = &["simulation_id", "experiment", "tick"];

const CONFIG_HEADER: &[&str] = &[
    "population_size",
    "num_loci",
    "max_init_traits",
    "topology",
    "rules",
    "conformism_strength",
    "anticonformism_strength",
    "innovation_rate",
    "kandler_interval",
    "end_tick",
];

const SAMPLE_HEADER: &[&str] = &["sample_size"];

const TA_SAMPLE_HEADER: &[&str] = &["ta_duration", "sample_size"];

const DIVERSITY_HEADER: &[&str] = &[
    "num_configurations",
    "configuration_slatkin",
    "configuration_entropy",
    "configuration_iqv",
    "slatkin_min",
    "slatkin_max",
    "slatkin_mean",
    "slatkin_std",
    "entropy_min",
    "entropy_max",
    "entropy_mean",
    "entropy_std",
    "iqv_min",
    "iqv_max",
    "iqv_mean",
    "iqv_std",
    "richness_min",
    "richness_max",
    "richness_mean",
    "richness_std",
    "neiman_tf_min",
    "neiman_tf_max",
    "neiman_tf_mean",
    "neiman_tf_std",
];

const KANDLER_HEADER: &[&str] = &[
    "kandler_interval_ticks",
    "kandler_remaining_min",
    "kandler_remaining_max",
    "kandler_remaining_mean",
    "kandler_remaining_std",
];

/// CSV file with every field quoted.
struct CsvWriter {
    writer: BufWriter<File>,
    n_cols: usize,
}

impl CsvWriter {
    fn create(file: &Path, header: &[&str]) -> Result<Self> {
        let handle = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut csv = Self {
            writer: BufWriter::new(handle),
            n_cols: header.len(),
        };
        let header: Vec<String> = header.iter().map(|col| col.to_string()).collect();
        csv.write_row(&header)?;
        Ok(csv)
    }

    fn write_row(&mut self, fields: &[String]) -> Result<()> {
        debug_assert_eq!(fields.len(), self.n_cols);
        let line: Vec<String> = fields.iter().map(|field| quote(field)).collect();
        writeln!(self.writer, "{}", line.join(",")).context("failed to write row")?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.writer
            .flush()
            .context("failed to flush writer stream")?;
        Ok(())
    }
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

/// Writer of the four summary tables of a simulation directory.
pub struct Exporter {
    simulation: CsvWriter,
    population: CsvWriter,
    sampled: CsvWriter,
    tasampled: CsvWriter,
    n_rows: usize,
}

impl Exporter {
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();

        let simulation = CsvWriter::create(
            &dir.join("simulation-data.csv"),
            &[SIMULATION_HEADER, CONFIG_HEADER].concat(),
        )?;

        let population = CsvWriter::create(
            &dir.join("population-data.csv"),
            &[RECORD_HEADER, CONFIG_HEADER, DIVERSITY_HEADER, KANDLER_HEADER].concat(),
        )?;
        let sampled = CsvWriter::create(
            &dir.join("sampled-data.csv"),
            &[RECORD_HEADER, CONFIG_HEADER, SAMPLE_HEADER, DIVERSITY_HEADER].concat(),
        )?;
        let tasampled = CsvWriter::create(
            &dir.join("tasampled-data.csv"),
            &[
                RECORD_HEADER,
                CONFIG_HEADER,
                TA_SAMPLE_HEADER,
                DIVERSITY_HEADER,
                KANDLER_HEADER,
            ]
            .concat(),
        )?;

        Ok(Self {
            simulation,
            population,
            sampled,
            tasampled,
            n_rows: 0,
        })
    }

    /// Add the rows of one run.
    pub fn add_run(&mut self, sim: &SimulationRecord, records: &[SampleRecord]) -> Result<()> {
        ensure!(
            records.last().is_some_and(SampleRecord::is_final),
            "run {} has no final record",
            sim.simulation_id
        );

        let mut row = vec![
            sim.simulation_id.clone(),
            sim.experiment.clone(),
            sim.seed.to_string(),
            sim.final_tick.to_string(),
            sim.interactions.total.to_string(),
            sim.innovations.total.to_string(),
            sim.elapsed_secs.to_string(),
            sim.command_line.clone(),
        ];
        row.extend(config_fields(&sim.config));
        self.simulation.write_row(&row)?;
        self.n_rows += 1;

        for record in records {
            self.add_record(record)
                .with_context(|| format!("failed to export record at tick {}", record.tick))?;
        }
        Ok(())
    }

    fn add_record(&mut self, record: &SampleRecord) -> Result<()> {
        let prefix: Vec<String> = [
            record.simulation_id.clone(),
            record.experiment.clone(),
            record.tick.to_string(),
        ]
        .into_iter()
        .chain(config_fields(&record.config))
        .collect();

        let mut row = prefix.clone();
        row.extend(diversity_fields(&record.population));
        row.extend(kandler_fields(record.kandler.as_ref()));
        self.population.write_row(&row)?;
        self.n_rows += 1;

        for (size, report) in &record.sampled {
            let mut row = prefix.clone();
            row.push(size.to_string());
            row.extend(diversity_fields(report));
            self.sampled.write_row(&row)?;
            self.n_rows += 1;
        }

        let Some(ta_sampled) = &record.ta_sampled else {
            return Ok(());
        };
        for (duration, by_size) in ta_sampled {
            for (size, report) in by_size {
                let kandler = record
                    .ta_sampled_kandler
                    .as_ref()
                    .and_then(|kandler| kandler.get(duration))
                    .and_then(|by_size| by_size.get(size));
                let mut row = prefix.clone();
                row.push(duration.to_string());
                row.push(size.to_string());
                row.extend(diversity_fields(report));
                row.extend(kandler_fields(kandler));
                self.tasampled.write_row(&row)?;
                self.n_rows += 1;
            }
        }
        Ok(())
    }

    /// Flush every table and return the number of rows written.
    pub fn finish(self) -> Result<usize> {
        self.simulation.finish()?;
        self.population.finish()?;
        self.sampled.finish()?;
        self.tasampled.finish()?;
        Ok(self.n_rows)
    }
}

fn config_fields(cfg: &Config) -> Vec<String> {
    let topology = match &cfg.population.topology {
        Topology::SquareLattice { periodic: true } => "periodic_lattice".to_string(),
        Topology::SquareLattice { periodic: false } => "lattice".to_string(),
        Topology::SmallWorld {
            neighbors,
            rewire_prob,
        } => format!("small_world({neighbors},{rewire_prob})"),
        Topology::Complete => "complete".to_string(),
    };
    let rules: Vec<String> = cfg
        .model
        .rules
        .iter()
        .map(|entry| format!("{:?}:{}", entry.rule, entry.weight))
        .collect();
    vec![
        cfg.population.size.to_string(),
        cfg.population.num_loci.to_string(),
        cfg.population.max_init_traits.to_string(),
        topology,
        rules.join(";"),
        cfg.model.conformism_strength.to_string(),
        cfg.model.anticonformism_strength.to_string(),
        cfg.model.innovation_rate.to_string(),
        cfg.sampling.kandler_interval.to_string(),
        cfg.sampling.end_tick.to_string(),
    ]
}

/// Min, max, mean and standard deviation across loci.
fn across_loci<I: IntoIterator<Item = f64>>(values: I) -> [String; 4] {
    let report = values.into_iter().collect::<Accumulator>().report();
    [
        report.min.to_string(),
        report.max.to_string(),
        report.mean.to_string(),
        report.std_dev.to_string(),
    ]
}

fn diversity_fields(report: &DiversityReport) -> Vec<String> {
    let mut fields = vec![
        report.num_configurations.to_string(),
        report.configuration_slatkin.probability.to_string(),
        report.configuration_entropy.to_string(),
        report.configuration_iqv.to_string(),
    ];
    fields.extend(across_loci(report.slatkin.iter().map(|s| s.probability)));
    fields.extend(across_loci(report.entropy.iter().copied()));
    fields.extend(across_loci(report.iqv.iter().copied()));
    fields.extend(across_loci(report.richness.iter().map(|&r| r as f64)));
    fields.extend(across_loci(report.neiman_tf.iter().copied()));
    fields
}

fn kandler_fields(kandler: Option<&KandlerSurvival>) -> Vec<String> {
    match kandler {
        Some(survival) => {
            let mut fields = vec![survival.interval.to_string()];
            fields.extend(across_loci(survival.remaining.iter().map(|&r| r as f64)));
            fields
        }
        None => vec![String::new(); KANDLER_HEADER.len()],
    }
}
