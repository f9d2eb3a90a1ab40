use crate::counts::TraitCounts;
use crate::model::Allele;
use anyhow::{Context, Result, bail, ensure};
use std::collections::BTreeMap;

/// Side of the anchor tick on which the windows lie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Windows `[anchor - d * N, anchor)`.
    Starting,
    /// Windows `[anchor, anchor + d * N)`.
    Ending,
}

struct Window {
    start: u64,
    end: u64,
    counts: TraitCounts,
}

impl Window {
    fn contains(&self, tick: u64) -> bool {
        self.start <= tick && tick < self.end
    }
}

/// Accumulates trait counts over windows of several durations sharing one anchor tick.
pub struct TimeAverager {
    direction: Direction,
    windows: BTreeMap<u64, Window>,
    last_recorded: Option<u64>,
}

impl TimeAverager {
    /// Create an averager with one window per duration (in generations of
    /// `ticks_per_generation` ticks) on the `direction` side of `anchor`.
    pub fn new(
        direction: Direction,
        anchor: u64,
        durations: &[u64],
        ticks_per_generation: u64,
        num_loci: usize,
    ) -> Result<Self> {
        ensure!(!durations.is_empty(), "no time averaging durations");

        let mut windows = BTreeMap::new();
        for &duration in durations {
            ensure!(duration > 0, "time averaging duration must be positive");
            let length = duration
                .checked_mul(ticks_per_generation)
                .context("time averaging window is too long")?;
            let (start, end) = match direction {
                Direction::Starting => (
                    anchor.checked_sub(length).with_context(|| {
                        format!("window of {duration} generations starts before tick 0")
                    })?,
                    anchor,
                ),
                Direction::Ending => (
                    anchor,
                    anchor
                        .checked_add(length)
                        .context("time averaging window is too long")?,
                ),
            };
            let window = Window {
                start,
                end,
                counts: TraitCounts::new(num_loci),
            };
            windows.insert(duration, window);
        }

        Ok(Self {
            direction,
            windows,
            last_recorded: None,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// `(start, end)` ticks of each window, end exclusive.
    pub fn interval_bounds(&self) -> BTreeMap<u64, (u64, u64)> {
        self.windows
            .iter()
            .map(|(&duration, window)| (duration, (window.start, window.end)))
            .collect()
    }

    /// First tick of the widest window.
    pub fn earliest_tick(&self) -> u64 {
        self.windows.values().map(|w| w.start).min().unwrap_or(0)
    }

    /// Last tick of the widest window.
    pub fn latest_tick(&self) -> u64 {
        self.windows
            .values()
            .map(|w| w.end.saturating_sub(1))
            .max()
            .unwrap_or(0)
    }

    pub fn is_within_intervals(&self, tick: u64) -> bool {
        self.windows.values().any(|w| w.contains(tick))
    }

    /// Add `counts` into every window containing `tick`.
    ///
    /// # Errors
    /// Returns an error if `tick` is not later than the last recorded tick.
    pub fn record_trait_count_sample(&mut self, tick: u64, counts: &TraitCounts) -> Result<()> {
        if let Some(last) = self.last_recorded {
            if tick <= last {
                bail!("tick {tick} recorded after tick {last}");
            }
        }
        for window in self.windows.values_mut().filter(|w| w.contains(tick)) {
            window
                .counts
                .merge(counts)
                .with_context(|| format!("failed to record counts at tick {tick}"))?;
        }
        self.last_recorded = Some(tick);
        Ok(())
    }

    /// Whether the last tick of every window has been recorded.
    pub fn is_closed(&self) -> bool {
        self.last_recorded
            .is_some_and(|last| last >= self.latest_tick())
    }

    /// Accumulated counts of each window, keyed by duration.
    pub fn window_counts(&self) -> Result<BTreeMap<u64, &TraitCounts>> {
        self.ensure_closed()?;
        Ok(self
            .windows
            .iter()
            .map(|(&duration, window)| (duration, &window.counts))
            .collect())
    }

    /// Per-locus allele counts of each window, keyed by duration.
    pub fn get_counts_for_generation_intervals(
        &self,
    ) -> Result<BTreeMap<u64, &[BTreeMap<Allele, u64>]>> {
        Ok(self
            .window_counts()?
            .into_iter()
            .map(|(duration, counts)| (duration, counts.locus_counts()))
            .collect())
    }

    /// Configuration counts of each window, keyed by duration.
    pub fn get_configuration_counts_for_generation_intervals(
        &self,
    ) -> Result<BTreeMap<u64, &BTreeMap<Vec<Allele>, u64>>> {
        Ok(self
            .window_counts()?
            .into_iter()
            .map(|(duration, counts)| (duration, counts.configurations()))
            .collect())
    }

    fn ensure_closed(&self) -> Result<()> {
        ensure!(
            self.is_closed(),
            "{:?} time averaging windows are still open (last recorded tick {:?}, last window tick {})",
            self.direction,
            self.last_recorded,
            self.latest_tick()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(allele: Allele) -> TraitCounts {
        let mut counts = TraitCounts::new(1);
        counts.observe(&[allele]);
        counts
    }

    #[test]
    fn windows_are_half_open() {
        let starting = TimeAverager::new(Direction::Starting, 20, &[1, 2], 5, 1).unwrap();
        assert_eq!(starting.interval_bounds()[&1], (15, 20));
        assert_eq!(starting.interval_bounds()[&2], (10, 20));
        assert_eq!(starting.earliest_tick(), 10);
        assert_eq!(starting.latest_tick(), 19);
        assert!(!starting.is_within_intervals(20));
        assert!(starting.is_within_intervals(10));

        let ending = TimeAverager::new(Direction::Ending, 20, &[1, 2], 5, 1).unwrap();
        assert_eq!(ending.interval_bounds()[&2], (20, 30));
        assert_eq!(ending.earliest_tick(), 20);
        assert_eq!(ending.latest_tick(), 29);
        assert!(!ending.is_within_intervals(30));
    }

    #[test]
    fn rejects_windows_before_tick_zero() {
        assert!(TimeAverager::new(Direction::Starting, 4, &[1], 5, 1).is_err());
        assert!(TimeAverager::new(Direction::Ending, 4, &[], 5, 1).is_err());
        assert!(TimeAverager::new(Direction::Ending, 4, &[0], 5, 1).is_err());
    }

    #[test]
    fn accumulates_counts_per_window() {
        let mut averager = TimeAverager::new(Direction::Ending, 10, &[1, 2], 2, 1).unwrap();
        for tick in 10..14 {
            averager
                .record_trait_count_sample(tick, &single(tick % 2))
                .unwrap();
        }
        let counts = averager.get_counts_for_generation_intervals().unwrap();
        assert_eq!(counts[&1][0], BTreeMap::from([(0, 1), (1, 1)]));
        assert_eq!(counts[&2][0], BTreeMap::from([(0, 2), (1, 2)]));

        let configs = averager
            .get_configuration_counts_for_generation_intervals()
            .unwrap();
        assert_eq!(configs[&2][&vec![1]], 2);
    }

    #[test]
    fn queries_fail_until_closed() {
        let mut averager = TimeAverager::new(Direction::Starting, 10, &[1], 2, 1).unwrap();
        averager.record_trait_count_sample(8, &single(3)).unwrap();
        assert!(!averager.is_closed());
        assert!(averager.get_counts_for_generation_intervals().is_err());
        averager.record_trait_count_sample(9, &single(3)).unwrap();
        assert!(averager.is_closed());
        assert!(averager.get_counts_for_generation_intervals().is_ok());
    }

    #[test]
    fn rejects_repeated_ticks() {
        let mut averager = TimeAverager::new(Direction::Ending, 0, &[1], 4, 1).unwrap();
        averager.record_trait_count_sample(1, &single(0)).unwrap();
        assert!(averager.record_trait_count_sample(1, &single(0)).is_err());
        assert!(averager.record_trait_count_sample(0, &single(0)).is_err());
    }
}
