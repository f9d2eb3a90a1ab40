use crate::model::Allele;
use crate::slatkin::{SlatkinResult, slatkin_exact_test};
use crate::stats;
use anyhow::{Result, ensure};
use rand::{Rng, seq::index};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Multiset of observed trait vectors.
///
/// Keeps, for each locus, the count of every allele, and the count of every
/// full configuration (one allele per locus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitCounts {
    loci: Vec<BTreeMap<Allele, u64>>,
    configurations: BTreeMap<Vec<Allele>, u64>,
}

/// Diversity statistics of one [`TraitCounts`], per locus and per configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiversityReport {
    pub richness: Vec<usize>,
    pub entropy: Vec<f64>,
    pub iqv: Vec<f64>,
    pub neiman_tf: Vec<f64>,
    pub slatkin: Vec<SlatkinResult>,
    pub unlabeled_counts: Vec<Vec<u64>>,
    pub unlabeled_frequencies: Vec<Vec<f64>>,

    pub num_configurations: usize,
    pub configuration_counts: Vec<u64>,
    pub configuration_slatkin: SlatkinResult,
    pub configuration_entropy: f64,
    pub configuration_iqv: f64,
    pub configuration_neiman_tf: f64,
}

impl TraitCounts {
    pub fn new(num_loci: usize) -> Self {
        Self {
            loci: vec![BTreeMap::new(); num_loci],
            configurations: BTreeMap::new(),
        }
    }

    /// Add one observation of the configuration `traits`.
    pub fn observe(&mut self, traits: &[Allele]) {
        self.observe_many(traits, 1);
    }

    fn observe_many(&mut self, traits: &[Allele], count: u64) {
        for (locus, &allele) in self.loci.iter_mut().zip(traits) {
            *locus.entry(allele).or_default() += count;
        }
        *self.configurations.entry(traits.to_vec()).or_default() += count;
    }

    /// Add every observation of `other`.
    pub fn merge(&mut self, other: &TraitCounts) -> Result<()> {
        ensure!(
            self.num_loci() == other.num_loci(),
            "cannot merge counts over {} loci into counts over {} loci",
            other.num_loci(),
            self.num_loci()
        );
        for (config, &count) in &other.configurations {
            self.observe_many(config, count);
        }
        Ok(())
    }

    pub fn num_loci(&self) -> usize {
        self.loci.len()
    }

    /// Number of observations.
    pub fn total(&self) -> u64 {
        self.configurations.values().sum()
    }

    pub fn locus_counts(&self) -> &[BTreeMap<Allele, u64>] {
        &self.loci
    }

    pub fn configurations(&self) -> &BTreeMap<Vec<Allele>, u64> {
        &self.configurations
    }

    pub fn richness(&self) -> Vec<usize> {
        self.loci.iter().map(BTreeMap::len).collect()
    }

    /// Set of alleles present at each locus.
    pub fn trait_sets(&self) -> Vec<BTreeSet<Allele>> {
        self.loci
            .iter()
            .map(|locus| locus.keys().copied().collect())
            .collect()
    }

    /// Allele counts at each locus, sorted in descending order.
    pub fn unlabeled_counts(&self) -> Vec<Vec<u64>> {
        self.loci
            .iter()
            .map(|locus| descending(locus.values().copied().collect()))
            .collect()
    }

    pub fn unlabeled_frequencies(&self) -> Vec<Vec<f64>> {
        self.unlabeled_counts()
            .iter()
            .map(|counts| stats::frequencies(counts))
            .collect()
    }

    pub fn num_configurations(&self) -> usize {
        self.configurations.len()
    }

    /// Configuration counts, sorted in descending order.
    pub fn configuration_counts(&self) -> Vec<u64> {
        descending(self.configurations.values().copied().collect())
    }

    pub fn entropy(&self) -> Vec<f64> {
        self.per_locus(stats::shannon_entropy)
    }

    pub fn iqv(&self) -> Vec<f64> {
        self.per_locus(stats::iqv)
    }

    pub fn neiman_tf(&self) -> Vec<f64> {
        self.per_locus(stats::neiman_tf)
    }

    pub fn slatkin<R: Rng + ?Sized>(&self, reps: usize, rng: &mut R) -> Vec<SlatkinResult> {
        self.unlabeled_counts()
            .iter()
            .map(|counts| slatkin_exact_test(counts, reps, rng))
            .collect()
    }

    fn per_locus(&self, stat: fn(&[f64]) -> f64) -> Vec<f64> {
        self.unlabeled_frequencies()
            .iter()
            .map(|freqs| stat(freqs))
            .collect()
    }

    /// Compute every diversity statistic of these counts.
    pub fn report<R: Rng + ?Sized>(&self, reps: usize, rng: &mut R) -> DiversityReport {
        let configuration_counts = self.configuration_counts();
        let configuration_freqs = stats::frequencies(&configuration_counts);
        DiversityReport {
            richness: self.richness(),
            entropy: self.entropy(),
            iqv: self.iqv(),
            neiman_tf: self.neiman_tf(),
            slatkin: self.slatkin(reps, rng),
            unlabeled_counts: self.unlabeled_counts(),
            unlabeled_frequencies: self.unlabeled_frequencies(),
            num_configurations: self.num_configurations(),
            configuration_slatkin: slatkin_exact_test(&configuration_counts, reps, rng),
            configuration_entropy: stats::shannon_entropy(&configuration_freqs),
            configuration_iqv: stats::iqv(&configuration_freqs),
            configuration_neiman_tf: stats::neiman_tf(&configuration_freqs),
            configuration_counts,
        }
    }
}

/// Draw `size` observations without replacement from the multiset of
/// `configurations`.
pub fn sample_configurations<R: Rng + ?Sized>(
    configurations: &BTreeMap<Vec<Allele>, u64>,
    num_loci: usize,
    size: usize,
    rng: &mut R,
) -> Result<TraitCounts> {
    let total: u64 = configurations.values().sum();
    ensure!(
        size as u64 <= total,
        "cannot sample {size} observations out of {total}"
    );

    let mut picks: Vec<u64> = index::sample(rng, total as usize, size)
        .into_iter()
        .map(|i| i as u64)
        .collect();
    picks.sort_unstable();

    let mut sample = TraitCounts::new(num_loci);
    let mut picks = picks.into_iter().peekable();
    let mut offset = 0;
    for (config, &count) in configurations {
        let mut taken = 0;
        while picks.next_if(|&pick| pick < offset + count).is_some() {
            taken += 1;
        }
        if taken > 0 {
            sample.observe_many(config, taken);
        }
        offset += count;
    }
    Ok(sample)
}

fn descending(mut counts: Vec<u64>) -> Vec<u64> {
    counts.sort_unstable_by(|a, b| b.cmp(a));
    counts
}

/// Number of alleles of `start` still present in `end`, per locus.
pub fn surviving_traits(start: &[BTreeSet<Allele>], end: &[BTreeSet<Allele>]) -> Vec<usize> {
    start
        .iter()
        .zip(end)
        .map(|(a, b)| a.intersection(b).count())
        .collect()
}
