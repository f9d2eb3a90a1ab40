use crate::analysis::{
    Analyzer, PopulationAnalyzer, SampledAnalyzer, SampledTimeAveragedAnalyzer,
};
use crate::config::{Config, Schedule};
use crate::data::{RecordWriter, SampleRecord};
use crate::model::SimRng;
use crate::population::Population;
use crate::rules::{InfiniteAllelesMutation, InteractionRule, RuleKind, build_rules};
use crate::topology;
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_distr::Bernoulli;
use std::collections::BTreeMap;

/// Identification of a run, copied into every record.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub simulation_id: String,
    pub experiment: String,
}

/// Simulation engine.
///
/// Holds the configuration, the population, the interaction rules and the
/// random number generator, and drives the Moran dynamics one tick at a time.
pub struct Engine {
    cfg: Config,
    schedule: Schedule,
    pop: Population,
    rules: BTreeMap<RuleKind, Box<dyn InteractionRule>>,
    innovation: InfiniteAllelesMutation,
    innovation_dist: Bernoulli,
    rng: SimRng,
    seed: u64,
    tick: u64,
}

struct Analyzers {
    population: PopulationAnalyzer,
    sampled: SampledAnalyzer,
    ta_sampled: SampledTimeAveragedAnalyzer,
}

impl Engine {
    /// Create a new `Engine` with a random initial population.
    ///
    /// The random number generator is seeded with the configured seed, or
    /// with one drawn from the OS.
    pub fn new(cfg: Config) -> Result<Self> {
        let schedule = cfg.schedule().context("failed to derive sampling schedule")?;

        let seed = match cfg.seed {
            Some(seed) => seed,
            None => SimRng::try_from_os_rng()?.random(),
        };
        let mut rng = SimRng::seed_from_u64(seed);

        let graph = topology::build_graph(&cfg.population.topology, cfg.population.size, &mut rng)
            .context("failed to build population graph")?;
        let pop = Population::initialize_population(&cfg, topology::adjacency(&graph), &mut rng)
            .context("failed to initialize population")?;

        let rules = build_rules(&cfg).context("failed to build interaction rules")?;
        for agent in pop.agents() {
            if !rules.contains_key(&agent.rule()) {
                bail!("no {:?} rule for agent {}", agent.rule(), agent.id());
            }
        }

        let innovation_dist = Bernoulli::new(cfg.innovation_prob())
            .context("failed to construct innovation distribution")?;

        log::debug!("{schedule:?}");
        log::info!("seed = {seed}");

        Ok(Self {
            cfg,
            schedule,
            pop,
            rules,
            innovation: InfiniteAllelesMutation,
            innovation_dist,
            rng,
            seed,
            tick: 0,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn population(&self) -> &Population {
        &self.pop
    }

    /// Perform one Moran event and return the new tick.
    pub fn step(&mut self) -> Result<u64> {
        let focal = self.pop.get_random_agent(&mut self.rng);
        let kind = self.pop.agent(focal)?.rule();
        let rule = self
            .rules
            .get(&kind)
            .with_context(|| format!("no {kind:?} rule"))?;
        rule.step(&mut self.pop, focal, self.tick, &mut self.rng)
            .with_context(|| format!("failed to apply {kind:?} rule to agent {focal}"))?;

        if self.innovation_dist.sample(&mut self.rng) {
            self.innovation
                .step(&mut self.pop, focal, self.tick, &mut self.rng)
                .with_context(|| format!("failed to apply innovation to agent {focal}"))?;
        }

        self.tick += 1;
        Ok(self.tick)
    }

    /// Run the simulation to the end tick and write the sample records.
    ///
    /// Intermediate records are written every snapshot interval, and the
    /// final record, with the time averaged statistics, at the end tick.
    pub fn perform_simulation(&mut self, run: &RunInfo, writer: &mut RecordWriter) -> Result<()> {
        let schedule = self.schedule;
        let n = self.cfg.ticks_per_generation();
        let snapshot_every = self.cfg.sampling.snapshot_interval.map(|gens| gens * n);
        let progress_every = (schedule.end_tick / 20).max(1);

        let mut analyzers = Analyzers {
            population: PopulationAnalyzer::new(),
            sampled: SampledAnalyzer::new(&self.cfg.sampling.sample_sizes),
            ta_sampled: SampledTimeAveragedAnalyzer::new(&self.cfg, &schedule)
                .context("failed to construct time averaged analyzer")?,
        };

        while self.tick < schedule.end_tick {
            let tick = self.step().context("failed to perform step")?;

            if analyzers.ta_sampled.time_averaged().is_within_intervals(tick) {
                analyzers
                    .ta_sampled
                    .update(&self.pop, tick, &mut self.rng)
                    .context("failed to update time averaged analyzer")?;
            }

            if tick == schedule.starting_anchor {
                analyzers.population.update(&self.pop, tick, &mut self.rng)?;
                analyzers
                    .population
                    .start_kandler_interval(tick)
                    .context("failed to start trait survival interval")?;
                log::debug!("started trait survival interval at tick {tick}");
            }
            if tick == schedule.ending_anchor {
                analyzers.population.update(&self.pop, tick, &mut self.rng)?;
                analyzers
                    .population
                    .stop_kandler_interval(tick)
                    .context("failed to stop trait survival interval")?;
                log::debug!("stopped trait survival interval at tick {tick}");
            }

            if tick < schedule.end_tick && snapshot_every.is_some_and(|every| tick % every == 0) {
                let record = self
                    .sample_record(run, &mut analyzers)
                    .context("failed to sample population")?;
                writer.write(&record)?;
            }

            if tick % progress_every == 0 {
                let progress = 100.0 * tick as f64 / schedule.end_tick as f64;
                log::info!("completed {progress:06.2}%");
            }
        }

        let record = self
            .final_record(run, &mut analyzers)
            .context("failed to sample final population")?;
        writer.write(&record)?;

        log::info!(
            "finished at tick {} after {} interactions and {} innovations",
            self.tick,
            self.pop.interactions().total,
            self.pop.innovations().total
        );

        Ok(())
    }

    fn sample_record(&mut self, run: &RunInfo, analyzers: &mut Analyzers) -> Result<SampleRecord> {
        let reps = self.cfg.sampling.slatkin_reps;
        let tick = self.tick;

        analyzers.population.update(&self.pop, tick, &mut self.rng)?;
        analyzers.sampled.update(&self.pop, tick, &mut self.rng)?;

        let population = analyzers.population.report(reps, &mut self.rng)?;
        let sampled = analyzers.sampled.report(reps, &mut self.rng)?;
        let kandler = if analyzers.population.has_kandler_survival() {
            Some(analyzers.population.kandler_survival()?.clone())
        } else {
            None
        };

        log::debug!("sampled population at tick {tick}");

        Ok(SampleRecord {
            simulation_id: run.simulation_id.clone(),
            experiment: run.experiment.clone(),
            tick,
            config: self.cfg.clone(),
            population,
            kandler,
            sampled,
            time_averaged: None,
            ta_kandler: None,
            ta_sampled: None,
            ta_sampled_kandler: None,
        })
    }

    fn final_record(&mut self, run: &RunInfo, analyzers: &mut Analyzers) -> Result<SampleRecord> {
        let reps = self.cfg.sampling.slatkin_reps;
        let mut record = self.sample_record(run, analyzers)?;

        let ta_sampled = &mut analyzers.ta_sampled;
        ta_sampled
            .take_sample_snapshot(&mut self.rng)
            .context("failed to sample time averaged windows")?;

        let time_averaged = ta_sampled.time_averaged();
        log::info!(
            "time averaged richness = {:?}",
            time_averaged.get_ta_richness()?
        );
        log::debug!(
            "time averaged frequencies = {:?}",
            time_averaged.get_ta_frequencies()?
        );
        record.time_averaged = Some(time_averaged.report(reps, &mut self.rng)?);
        record.ta_kandler = Some(time_averaged.ta_kandler()?);
        record.ta_sampled = Some(ta_sampled.report(reps, &mut self.rng)?);
        record.ta_sampled_kandler = Some(ta_sampled.ta_sampled_kandler()?);

        log::info!(
            "final richness = {:?}",
            analyzers.population.get_richness()?
        );

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Topology;
    use crate::data::read_records;
    use crate::model::Allele;
    use std::collections::BTreeSet;
    use std::env;

    fn lattice_config() -> Config {
        let mut cfg = Config::for_tests(9, 3, 10);
        cfg.population.topology = Topology::SquareLattice { periodic: false };
        cfg
    }

    #[test]
    fn neutral_run_without_innovation_keeps_initial_alleles() {
        let mut engine = Engine::new(lattice_config()).unwrap();
        for expected in 1..=500 {
            assert_eq!(engine.step().unwrap(), expected);
            let pop = engine.population();
            assert!(
                pop.agents()
                    .iter()
                    .all(|agt| agt.traits().iter().all(|&allele| allele < 10))
            );
            assert!(pop.trait_counts().richness().iter().all(|&r| r <= 9));
        }
        let pop = engine.population();
        assert_eq!(pop.interactions().total, 500);
        assert_eq!(pop.innovations().total, 0);
    }

    #[test]
    fn innovation_adds_new_alleles() {
        let mut cfg = Config::for_tests(9, 1, 3);
        cfg.model.innovation_rate = 18.0;
        let mut engine = Engine::new(cfg).unwrap();

        let alleles = |engine: &Engine| -> BTreeSet<Allele> {
            engine
                .population()
                .agents()
                .iter()
                .map(|agt| agt.trait_at(0))
                .collect()
        };
        let mut seen = alleles(&engine);
        let initial = seen.len();
        for _ in 0..50 {
            engine.step().unwrap();
            let before = seen.len();
            seen.extend(alleles(&engine));
            assert!(seen.len() > before);
        }
        assert_eq!(seen.len(), initial + 50);

        let pop = engine.population();
        assert_eq!(pop.innovations().total, 50);
        let max_allele = pop.agents().iter().map(|agt| agt.trait_at(0)).max().unwrap();
        assert_eq!(max_allele, 3 + 49);
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let mut a = Engine::new(lattice_config()).unwrap();
        let mut b = Engine::new(lattice_config()).unwrap();
        assert_eq!(a.seed(), b.seed());
        for _ in 0..200 {
            a.step().unwrap();
            b.step().unwrap();
        }
        assert_eq!(a.population().agents(), b.population().agents());
    }

    #[test]
    fn rejects_innovation_probability_above_one() {
        let mut cfg = lattice_config();
        cfg.model.innovation_rate = 100.0;
        assert!(Engine::new(cfg).is_err());
    }

    #[test]
    fn writes_snapshot_and_final_records() {
        let mut cfg = Config::for_tests(4, 2, 3);
        cfg.sampling.end_tick = 100;
        cfg.sampling.sample_sizes = vec![2, 4];
        cfg.sampling.snapshot_interval = Some(5);
        cfg.model.innovation_rate = 0.5;

        let dir = env::temp_dir().join(format!("ctmixtures-engine-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("samples.msgpack");

        let run = RunInfo {
            simulation_id: "urn:uuid:engine".to_string(),
            experiment: "engine".to_string(),
        };
        let mut engine = Engine::new(cfg).unwrap();
        let mut writer = RecordWriter::create(&file).unwrap();
        engine.perform_simulation(&run, &mut writer).unwrap();
        assert_eq!(writer.finish().unwrap(), 5);
        assert_eq!(engine.tick(), 100);

        let records = read_records(&file).unwrap();
        let ticks: Vec<_> = records.iter().map(|rec| rec.tick).collect();
        assert_eq!(ticks, vec![20, 40, 60, 80, 100]);
        assert!(records[..4].iter().all(|rec| !rec.is_final()));

        let last = &records[4];
        assert!(last.is_final());
        assert_eq!(last.kandler.as_ref().unwrap().interval, 8);
        assert!(records[0].kandler.is_none());
        assert_eq!(last.sampled.keys().copied().collect::<Vec<_>>(), vec![2, 4]);
        let ta_sampled = last.ta_sampled.as_ref().unwrap();
        assert_eq!(ta_sampled.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(last.ta_sampled_kandler.as_ref().unwrap()[&1].len(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
