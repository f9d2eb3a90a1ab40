use crate::rules::RuleKind;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Simulation configuration parameters.
///
/// Loaded from a TOML file, patched with command line overrides and
/// validated before use. See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seed of the random number generator (drawn from the OS if absent).
    #[serde(default)]
    pub seed: Option<u64>,

    pub population: PopulationConfig,
    pub model: ModelConfig,
    pub sampling: SamplingConfig,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PopulationConfig {
    /// Number of agents.
    pub size: usize,
    /// Number of loci per agent.
    pub num_loci: usize,
    /// Initial alleles are drawn uniformly from `0..max_init_traits`.
    pub max_init_traits: u64,

    pub topology: Topology,
}

/// Neighbor structure of the population.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topology {
    /// Square lattice with von Neumann neighborhood.
    SquareLattice {
        #[serde(default)]
        periodic: bool,
    },
    /// Watts-Strogatz small world: ring of `neighbors` nearest agents, rewired.
    SmallWorld { neighbors: usize, rewire_prob: f64 },
    /// Every agent is a neighbor of every other agent.
    Complete,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Mixture of interaction rules assigned to agents by weight.
    pub rules: Vec<RuleWeight>,

    /// Probability that a conformist agent copies the most frequent neighbor allele.
    #[serde(default)]
    pub conformism_strength: f64,
    /// Probability that an anti-conformist agent copies the least frequent neighbor allele.
    #[serde(default)]
    pub anticonformism_strength: f64,

    /// Population-level innovation rate (theta).
    pub innovation_rate: f64,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleWeight {
    pub rule: RuleKind,
    pub weight: f64,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamplingConfig {
    /// Tick at which the simulation stops and final samples are taken.
    pub end_tick: u64,
    /// Generations between the two trait survival snapshots.
    pub kandler_interval: u64,
    /// Durations (in generations) of the time averaging windows.
    pub ta_durations: Vec<u64>,
    /// Sizes of the random samples drawn from the population.
    pub sample_sizes: Vec<usize>,
    /// Generations between intermediate snapshot records.
    #[serde(default)]
    pub snapshot_interval: Option<u64>,
    /// Monte Carlo replicates of the Slatkin exact test.
    #[serde(default = "default_slatkin_reps")]
    pub slatkin_reps: usize,
}

fn default_slatkin_reps() -> usize {
    100_000
}

/// Parameters given on the command line, applied on top of the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub pop_size: Option<usize>,
    pub num_loci: Option<usize>,
    pub max_init_traits: Option<u64>,
    pub conformism_strength: Option<f64>,
    pub anticonformism_strength: Option<f64>,
    pub innovation_rate: Option<f64>,
    pub periodic: Option<bool>,
    pub kandler_interval: Option<u64>,
    pub end_tick: Option<u64>,
    pub seed: Option<u64>,
}

/// Ticks at which the sampling events of a run happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// First tick fed to the starting time averager.
    pub earliest_tick: u64,
    /// Starting windows end here, and the first survival snapshot is taken.
    pub starting_anchor: u64,
    /// Ending windows start here, and the second survival snapshot is taken.
    pub ending_anchor: u64,
    pub end_tick: u64,
}

impl Config {
    /// Load a [`Config`] from a TOML file and apply `overrides`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed,
    /// or if the resulting configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P, overrides: &Overrides) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml(&contents, overrides)
    }

    pub fn from_toml(contents: &str, overrides: &Overrides) -> Result<Self> {
        let mut config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config
            .apply_overrides(overrides)
            .context("failed to apply overrides")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    fn apply_overrides(&mut self, ovr: &Overrides) -> Result<()> {
        if let Some(size) = ovr.pop_size {
            self.population.size = size;
        }
        if let Some(num_loci) = ovr.num_loci {
            self.population.num_loci = num_loci;
        }
        if let Some(max_init_traits) = ovr.max_init_traits {
            self.population.max_init_traits = max_init_traits;
        }
        if let Some(strength) = ovr.conformism_strength {
            self.model.conformism_strength = strength;
        }
        if let Some(strength) = ovr.anticonformism_strength {
            self.model.anticonformism_strength = strength;
        }
        if let Some(theta) = ovr.innovation_rate {
            self.model.innovation_rate = theta;
        }
        if let Some(periodic) = ovr.periodic {
            match &mut self.population.topology {
                Topology::SquareLattice { periodic: p } => *p = periodic,
                other => bail!("periodic boundary only applies to a square lattice, not {other:?}"),
            }
        }
        if let Some(kandler_interval) = ovr.kandler_interval {
            self.sampling.kandler_interval = kandler_interval;
        }
        if let Some(end_tick) = ovr.end_tick {
            self.sampling.end_tick = end_tick;
        }
        if ovr.seed.is_some() {
            self.seed = ovr.seed;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let pop = &self.population;
        check_num(pop.size, 2..=10_000_000).context("invalid population size")?;
        check_num(pop.num_loci, 1..=1_000).context("invalid number of loci")?;
        check_num(pop.max_init_traits, 1..=1_000_000)
            .context("invalid maximum number of initial traits")?;
        check_topology(&pop.topology, pop.size).context("invalid topology")?;

        let model = &self.model;
        check_rules(&model.rules).context("invalid rule mixture")?;
        check_num(model.conformism_strength, 0.0..=1.0).context("invalid conformism strength")?;
        check_num(model.anticonformism_strength, 0.0..=1.0)
            .context("invalid anticonformism strength")?;
        check_num(model.innovation_rate, 0.0..=1e9).context("invalid innovation rate")?;
        check_num(self.innovation_prob(), 0.0..=1.0)
            .context("innovation rate too large for the population size and number of loci")?;

        let sampling = &self.sampling;
        check_num(sampling.kandler_interval, 1..=u32::MAX as u64)
            .context("invalid kandler interval")?;
        if sampling.ta_durations.is_empty() {
            bail!("at least one time averaging duration is required");
        }
        for &duration in &sampling.ta_durations {
            check_num(duration, 1..=u32::MAX as u64)
                .context("invalid time averaging duration")?;
        }
        for &ssize in &sampling.sample_sizes {
            check_num(ssize, 1..=pop.size).context("invalid sample size")?;
        }
        if let Some(interval) = sampling.snapshot_interval {
            check_num(interval, 1..=u32::MAX as u64).context("invalid snapshot interval")?;
        }
        check_num(sampling.slatkin_reps, 1..=10_000_000)
            .context("invalid number of slatkin replicates")?;

        let schedule = self.schedule().context("invalid sampling schedule")?;
        log::debug!("{schedule:?}");

        Ok(())
    }

    pub fn ticks_per_generation(&self) -> u64 {
        self.population.size as u64
    }

    /// Per-locus mutation probability per tick, from theta = 2 N mu.
    pub fn mutation_rate(&self) -> f64 {
        self.model.innovation_rate / (2.0 * self.population.size as f64)
    }

    /// Probability that an innovation happens at some locus in a tick.
    pub fn innovation_prob(&self) -> f64 {
        self.population.num_loci as f64 * self.mutation_rate()
    }

    /// Compute the sampling schedule of a run.
    ///
    /// The ending windows finish at the end tick, the starting windows finish
    /// one kandler interval before the ending windows begin.
    pub fn schedule(&self) -> Result<Schedule> {
        let n = self.ticks_per_generation();
        let max_duration = self
            .sampling
            .ta_durations
            .iter()
            .copied()
            .max()
            .context("no time averaging durations")?;
        let window = max_duration
            .checked_mul(n)
            .context("time averaging window overflows")?;
        let kandler = self
            .sampling
            .kandler_interval
            .checked_mul(n)
            .context("kandler interval overflows")?;

        let end_tick = self.sampling.end_tick;
        let too_short = || {
            format!(
                "end tick {end_tick} is too short for windows of {window} ticks \
                 around a kandler interval of {kandler} ticks"
            )
        };
        let ending_anchor = end_tick.checked_sub(window).with_context(too_short)?;
        let starting_anchor = ending_anchor.checked_sub(kandler).with_context(too_short)?;
        let earliest_tick = starting_anchor.checked_sub(window).with_context(too_short)?;
        if earliest_tick < 1 {
            bail!(too_short());
        }

        Ok(Schedule {
            earliest_tick,
            starting_anchor,
            ending_anchor,
            end_tick,
        })
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_topology(topology: &Topology, size: usize) -> Result<()> {
    match *topology {
        Topology::SquareLattice { .. } => {
            let side = size.isqrt();
            if side * side != size {
                bail!("population size {size} is not a perfect square");
            }
        }
        Topology::SmallWorld {
            neighbors,
            rewire_prob,
        } => {
            check_num(neighbors, 2..size).context("invalid number of ring neighbors")?;
            if neighbors % 2 != 0 {
                bail!("number of ring neighbors must be even, but is {neighbors}");
            }
            check_num(rewire_prob, 0.0..=1.0).context("invalid rewiring probability")?;
        }
        Topology::Complete => {}
    }
    Ok(())
}

fn check_rules(rules: &[RuleWeight]) -> Result<()> {
    if rules.is_empty() {
        bail!("at least one rule is required");
    }
    for (i_rule, entry) in rules.iter().enumerate() {
        if rules[..i_rule].iter().any(|prev| prev.rule == entry.rule) {
            bail!("rule {:?} is listed more than once", entry.rule);
        }
        check_num(entry.weight, 0.0..=f64::MAX)
            .with_context(|| format!("invalid weight of rule {:?}", entry.rule))?;
    }
    let sum: f64 = rules.iter().map(|entry| entry.weight).sum();
    if sum <= 0.0 {
        bail!("rule weights must have a positive sum");
    }
    Ok(())
}

#[cfg(test)]
impl Config {
    /// Small complete-graph configuration with a single neutral rule.
    pub fn for_tests(size: usize, num_loci: usize, max_init_traits: u64) -> Self {
        Self {
            seed: Some(42),
            population: PopulationConfig {
                size,
                num_loci,
                max_init_traits,
                topology: Topology::Complete,
            },
            model: ModelConfig {
                rules: vec![RuleWeight {
                    rule: RuleKind::Neutral,
                    weight: 1.0,
                }],
                conformism_strength: 0.0,
                anticonformism_strength: 0.0,
                innovation_rate: 0.0,
            },
            sampling: SamplingConfig {
                end_tick: 500,
                kandler_interval: 2,
                ta_durations: vec![1, 2],
                sample_sizes: vec![],
                snapshot_interval: None,
                slatkin_reps: 200,
            },
        }
    }
}
