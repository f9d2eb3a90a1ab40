use crate::averager::{Direction, TimeAverager};
use crate::config::{Config, Schedule};
use crate::counts::{DiversityReport, TraitCounts, sample_configurations, surviving_traits};
use crate::model::{Allele, SimRng};
use crate::population::Population;
use anyhow::{Context, Result, bail, ensure};
use rand::seq::index;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Observer of the population that turns its state into diversity statistics.
pub trait Analyzer {
    type Report;

    /// Observe the population at `tick`.
    fn update(&mut self, pop: &Population, tick: u64, rng: &mut SimRng) -> Result<()>;

    /// Compute the statistics of the last observation.
    fn report(&self, reps: usize, rng: &mut SimRng) -> Result<Self::Report>;
}

/// Number of traits still present after an interval, per locus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KandlerSurvival {
    /// Ticks between the two observations.
    pub interval: u64,
    pub remaining: Vec<usize>,
}

enum KandlerState {
    Idle,
    Started {
        tick: u64,
        traits: Vec<BTreeSet<Allele>>,
    },
    Stopped(KandlerSurvival),
}

/// Trait survival between a start and a stop observation.
pub struct KandlerTracker {
    state: KandlerState,
}

impl KandlerTracker {
    pub fn new() -> Self {
        Self {
            state: KandlerState::Idle,
        }
    }

    pub fn start(&mut self, tick: u64, traits: Vec<BTreeSet<Allele>>) -> Result<()> {
        if !matches!(self.state, KandlerState::Idle) {
            bail!("trait survival interval already started");
        }
        self.state = KandlerState::Started { tick, traits };
        Ok(())
    }

    pub fn stop(&mut self, tick: u64, traits: &[BTreeSet<Allele>]) -> Result<()> {
        let KandlerState::Started {
            tick: start,
            traits: ref start_traits,
        } = self.state
        else {
            bail!("trait survival interval is not running");
        };
        ensure!(
            tick > start,
            "trait survival interval stops at tick {tick}, not after its start at tick {start}"
        );
        let survival = KandlerSurvival {
            interval: tick - start,
            remaining: surviving_traits(start_traits, traits),
        };
        self.state = KandlerState::Stopped(survival);
        Ok(())
    }

    pub fn survival(&self) -> Result<&KandlerSurvival> {
        match &self.state {
            KandlerState::Stopped(survival) => Ok(survival),
            _ => bail!("trait survival interval has not stopped"),
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state, KandlerState::Stopped(_))
    }
}

/// Statistics over the whole population.
pub struct PopulationAnalyzer {
    counts: Option<TraitCounts>,
    kandler: KandlerTracker,
}

impl PopulationAnalyzer {
    pub fn new() -> Self {
        Self {
            counts: None,
            kandler: KandlerTracker::new(),
        }
    }

    /// Counts of the last census.
    pub fn counts(&self) -> Result<&TraitCounts> {
        self.counts
            .as_ref()
            .context("population has not been observed yet")
    }

    pub fn get_richness(&self) -> Result<Vec<usize>> {
        Ok(self.counts()?.richness())
    }

    /// Start the trait survival interval from the last census.
    pub fn start_kandler_interval(&mut self, tick: u64) -> Result<()> {
        let traits = self.counts()?.trait_sets();
        self.kandler.start(tick, traits)
    }

    /// Stop the trait survival interval at the last census.
    pub fn stop_kandler_interval(&mut self, tick: u64) -> Result<()> {
        let traits = self.counts()?.trait_sets();
        self.kandler.stop(tick, &traits)
    }

    pub fn kandler_survival(&self) -> Result<&KandlerSurvival> {
        self.kandler.survival()
    }

    pub fn has_kandler_survival(&self) -> bool {
        self.kandler.is_stopped()
    }
}

impl Analyzer for PopulationAnalyzer {
    type Report = DiversityReport;

    fn update(&mut self, pop: &Population, _tick: u64, _rng: &mut SimRng) -> Result<()> {
        self.counts = Some(pop.trait_counts());
        Ok(())
    }

    fn report(&self, reps: usize, rng: &mut SimRng) -> Result<Self::Report> {
        Ok(self.counts()?.report(reps, rng))
    }
}

/// Statistics over random samples of agents, one sample per configured size.
pub struct SampledAnalyzer {
    sample_sizes: Vec<usize>,
    samples: Option<BTreeMap<usize, TraitCounts>>,
}

impl SampledAnalyzer {
    pub fn new(sample_sizes: &[usize]) -> Self {
        Self {
            sample_sizes: sample_sizes.to_vec(),
            samples: None,
        }
    }

    pub fn samples(&self) -> Result<&BTreeMap<usize, TraitCounts>> {
        self.samples
            .as_ref()
            .context("population has not been sampled yet")
    }
}

impl Analyzer for SampledAnalyzer {
    type Report = BTreeMap<usize, DiversityReport>;

    fn update(&mut self, pop: &Population, _tick: u64, rng: &mut SimRng) -> Result<()> {
        let mut samples = BTreeMap::new();
        for &size in &self.sample_sizes {
            ensure!(
                size <= pop.size(),
                "sample size {size} exceeds population size {}",
                pop.size()
            );
            let ids = index::sample(rng, pop.size(), size);
            let counts = pop.trait_counts_for(ids)?;
            samples.insert(size, counts);
        }
        self.samples = Some(samples);
        Ok(())
    }

    fn report(&self, reps: usize, rng: &mut SimRng) -> Result<Self::Report> {
        Ok(self
            .samples()?
            .iter()
            .map(|(&size, counts)| (size, counts.report(reps, rng)))
            .collect())
    }
}

/// Statistics over counts accumulated in windows before and after a trait
/// survival interval.
pub struct TimeAveragedAnalyzer {
    population: PopulationAnalyzer,
    starting: TimeAverager,
    ending: TimeAverager,
    interval: u64,
}

impl TimeAveragedAnalyzer {
    pub fn new(cfg: &Config, schedule: &Schedule) -> Result<Self> {
        let durations = &cfg.sampling.ta_durations;
        let n = cfg.ticks_per_generation();
        let num_loci = cfg.population.num_loci;
        let starting = TimeAverager::new(
            Direction::Starting,
            schedule.starting_anchor,
            durations,
            n,
            num_loci,
        )
        .context("failed to set up starting windows")?;
        let ending = TimeAverager::new(
            Direction::Ending,
            schedule.ending_anchor,
            durations,
            n,
            num_loci,
        )
        .context("failed to set up ending windows")?;
        ensure!(
            starting.earliest_tick() == schedule.earliest_tick
                && ending.latest_tick() < schedule.end_tick,
            "time averaging windows do not fit in {schedule:?}"
        );
        log::debug!(
            "starting windows {:?}, ending windows {:?}",
            starting.interval_bounds(),
            ending.interval_bounds()
        );
        Ok(Self {
            population: PopulationAnalyzer::new(),
            starting,
            ending,
            interval: schedule.ending_anchor - schedule.starting_anchor,
        })
    }

    /// Whether a census at `tick` falls in any window.
    pub fn is_within_intervals(&self, tick: u64) -> bool {
        self.starting.is_within_intervals(tick) || self.ending.is_within_intervals(tick)
    }

    /// Accumulated counts of the ending windows, keyed by duration.
    pub fn ta_counts(&self) -> Result<BTreeMap<u64, &TraitCounts>> {
        self.ending.window_counts()
    }

    /// Time averaged allele frequencies, normalized by the mass of each locus.
    pub fn get_ta_frequencies(&self) -> Result<BTreeMap<u64, Vec<BTreeMap<Allele, f64>>>> {
        let frequencies = |locus: &BTreeMap<Allele, u64>| -> BTreeMap<Allele, f64> {
            let mass: u64 = locus.values().sum();
            locus
                .iter()
                .map(|(&allele, &count)| (allele, count as f64 / mass as f64))
                .collect()
        };
        Ok(self
            .ending
            .get_counts_for_generation_intervals()?
            .into_iter()
            .map(|(duration, loci)| (duration, loci.iter().map(frequencies).collect::<Vec<_>>()))
            .collect())
    }

    pub fn get_ta_richness(&self) -> Result<BTreeMap<u64, Vec<usize>>> {
        Ok(self
            .ta_counts()?
            .into_iter()
            .map(|(duration, counts)| (duration, counts.richness()))
            .collect())
    }

    /// Survival of the traits of each starting window into the ending window
    /// of the same duration.
    pub fn ta_kandler(&self) -> Result<BTreeMap<u64, KandlerSurvival>> {
        let starting = self.starting.window_counts()?;
        let ending = self.ending.window_counts()?;
        starting
            .iter()
            .map(|(&duration, start)| {
                let end = ending
                    .get(&duration)
                    .with_context(|| format!("no ending window of {duration} generations"))?;
                let survival = KandlerSurvival {
                    interval: self.interval,
                    remaining: surviving_traits(&start.trait_sets(), &end.trait_sets()),
                };
                Ok((duration, survival))
            })
            .collect()
    }
}

impl Analyzer for TimeAveragedAnalyzer {
    type Report = BTreeMap<u64, DiversityReport>;

    fn update(&mut self, pop: &Population, tick: u64, rng: &mut SimRng) -> Result<()> {
        self.population.update(pop, tick, rng)?;
        let counts = self.population.counts()?;
        for averager in [&mut self.starting, &mut self.ending] {
            if averager.is_within_intervals(tick) {
                averager
                    .record_trait_count_sample(tick, counts)
                    .with_context(|| format!("failed to record {:?} window", averager.direction()))?;
            }
        }
        Ok(())
    }

    fn report(&self, reps: usize, rng: &mut SimRng) -> Result<Self::Report> {
        Ok(self
            .ta_counts()?
            .into_iter()
            .map(|(duration, counts)| (duration, counts.report(reps, rng)))
            .collect())
    }
}

/// Samples drawn once from the accumulated windows, keyed by duration then sample size.
type WindowSamples = BTreeMap<u64, BTreeMap<usize, TraitCounts>>;

struct SampleSnapshot {
    starting: WindowSamples,
    ending: WindowSamples,
}

/// Statistics over samples of the time averaged windows.
pub struct SampledTimeAveragedAnalyzer {
    time_averaged: TimeAveragedAnalyzer,
    sample_sizes: Vec<usize>,
    num_loci: usize,
    snapshot: Option<SampleSnapshot>,
}

impl SampledTimeAveragedAnalyzer {
    pub fn new(cfg: &Config, schedule: &Schedule) -> Result<Self> {
        Ok(Self {
            time_averaged: TimeAveragedAnalyzer::new(cfg, schedule)?,
            sample_sizes: cfg.sampling.sample_sizes.clone(),
            num_loci: cfg.population.num_loci,
            snapshot: None,
        })
    }

    pub fn time_averaged(&self) -> &TimeAveragedAnalyzer {
        &self.time_averaged
    }

    /// Draw, once, a sample of every size from every closed window.
    pub fn take_sample_snapshot(&mut self, rng: &mut SimRng) -> Result<()> {
        ensure!(self.snapshot.is_none(), "sample snapshot already taken");
        let ta = &self.time_averaged;
        let starting = sample_windows(
            ta.starting.get_configuration_counts_for_generation_intervals()?,
            &self.sample_sizes,
            self.num_loci,
            rng,
        )?;
        let ending = sample_windows(
            ta.ending.get_configuration_counts_for_generation_intervals()?,
            &self.sample_sizes,
            self.num_loci,
            rng,
        )?;
        self.snapshot = Some(SampleSnapshot { starting, ending });
        Ok(())
    }

    fn snapshot(&self) -> Result<&SampleSnapshot> {
        self.snapshot
            .as_ref()
            .context("sample snapshot has not been taken")
    }

    /// Samples of the ending windows.
    pub fn ta_samples(&self) -> Result<&WindowSamples> {
        Ok(&self.snapshot()?.ending)
    }

    /// Survival between the samples of the starting and ending windows.
    pub fn ta_sampled_kandler(&self) -> Result<BTreeMap<u64, BTreeMap<usize, KandlerSurvival>>> {
        let snapshot = self.snapshot()?;
        let interval = self.time_averaged.interval;
        let mut result = BTreeMap::new();
        for (&duration, starts) in &snapshot.starting {
            let ends = snapshot
                .ending
                .get(&duration)
                .with_context(|| format!("no ending samples of {duration} generations"))?;
            let mut by_size = BTreeMap::new();
            for (&size, start) in starts {
                let end = ends
                    .get(&size)
                    .with_context(|| format!("no ending sample of size {size}"))?;
                let survival = KandlerSurvival {
                    interval,
                    remaining: surviving_traits(&start.trait_sets(), &end.trait_sets()),
                };
                by_size.insert(size, survival);
            }
            result.insert(duration, by_size);
        }
        Ok(result)
    }
}

fn sample_windows(
    windows: BTreeMap<u64, &BTreeMap<Vec<Allele>, u64>>,
    sample_sizes: &[usize],
    num_loci: usize,
    rng: &mut SimRng,
) -> Result<WindowSamples> {
    let mut result = BTreeMap::new();
    for (duration, configurations) in windows {
        let mut by_size = BTreeMap::new();
        for &size in sample_sizes {
            let sample = sample_configurations(configurations, num_loci, size, rng)
                .with_context(|| format!("failed to sample window of {duration} generations"))?;
            by_size.insert(size, sample);
        }
        result.insert(duration, by_size);
    }
    Ok(result)
}

impl Analyzer for SampledTimeAveragedAnalyzer {
    type Report = BTreeMap<u64, BTreeMap<usize, DiversityReport>>;

    fn update(&mut self, pop: &Population, tick: u64, rng: &mut SimRng) -> Result<()> {
        self.time_averaged.update(pop, tick, rng)
    }

    fn report(&self, reps: usize, rng: &mut SimRng) -> Result<Self::Report> {
        Ok(self
            .ta_samples()?
            .iter()
            .map(|(&duration, by_size)| {
                let reports = by_size
                    .iter()
                    .map(|(&size, counts)| (size, counts.report(reps, rng)))
                    .collect();
                (duration, reports)
            })
            .collect())
    }
}
