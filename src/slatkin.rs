//! Slatkin's exact test of neutrality under the infinite-alleles model.
//!
//! The probability of the observed allele configuration conditional on the
//! number of alleles does not depend on theta, so the test compares it with
//! configurations drawn from the Ewens distribution conditioned on the
//! observed sample size `n` and number of alleles `k`.
//!
//! In the Feller coupling a new allele appears at gene `v + 1` with
//! probability `theta / (theta + v)`, so the `k - 1` allele boundaries,
//! conditioned on their number, are a subset of `1..n` drawn with product
//! weight `prod 1 / v`. [`ConditionalSampler`] draws that subset directly
//! from a table of elementary symmetric sums. When the table would be too
//! large the boundaries are drawn unconditionally at the estimated theta,
//! skipping over the genes that do not start an allele, and rejected unless
//! there are exactly `k - 1` of them.

use rand::Rng;
use rand_distr::{Distribution, Geometric};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MAX_ATTEMPTS_PER_REP: usize = 1000;

/// Largest `n * k` for which the conditional sampler table is built.
const MAX_TABLE_ENTRIES: u64 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlatkinResult {
    /// Probability of a configuration at most as likely as the observed one.
    pub probability: f64,
    /// Estimate of theta from the number of alleles.
    pub theta: f64,
}

/// Run the exact test on the allele `counts` of a sample with `reps` replicates.
///
/// Zero counts are ignored. Monomorphic and all-singleton samples have
/// probability 1.
pub fn slatkin_exact_test<R: Rng + ?Sized>(
    counts: &[u64],
    reps: usize,
    rng: &mut R,
) -> SlatkinResult {
    let counts: Vec<u64> = counts.iter().copied().filter(|&c| c > 0).collect();
    let k = counts.len();
    let n: u64 = counts.iter().sum();

    if k == 0 {
        return SlatkinResult {
            probability: 1.0,
            theta: 0.0,
        };
    }
    if k == 1 || k as u64 == n {
        let theta = if k == 1 { 0.0 } else { f64::INFINITY };
        return SlatkinResult {
            probability: 1.0,
            theta,
        };
    }

    let theta = estimate_theta(n, k);
    let observed = log_weight(&counts);

    let sampler = ConditionalSampler::fits(n, k).then(|| ConditionalSampler::new(n, k));
    if sampler.is_none() {
        log::debug!("drawing Slatkin replicates by rejection (n = {n}, k = {k})");
    }

    let mut accepted = 0;
    let mut extreme = 0;
    let mut attempts = 0;
    let max_attempts = reps.saturating_mul(MAX_ATTEMPTS_PER_REP);
    while accepted < reps && attempts < max_attempts {
        attempts += 1;
        let sample = match &sampler {
            Some(sampler) => Some(sampler.sample(rng)),
            None => sample_feller(n, k, theta, rng),
        };
        let Some(sample) = sample else {
            continue;
        };
        accepted += 1;
        if log_weight(&sample) <= observed + 1e-9 {
            extreme += 1;
        }
    }

    if accepted == 0 {
        log::warn!("no configuration with n = {n} and k = {k} accepted in {attempts} attempts");
        return SlatkinResult {
            probability: f64::NAN,
            theta,
        };
    }
    if accepted < reps {
        log::warn!("Slatkin test used {accepted} of {reps} replicates (n = {n}, k = {k})");
    }

    SlatkinResult {
        probability: extreme as f64 / accepted as f64,
        theta,
    }
}

/// Maximum likelihood estimate of theta: solves `k = sum_{i<n} theta / (theta + i)`.
pub fn estimate_theta(n: u64, k: usize) -> f64 {
    let k = k as f64;
    let expected = |theta: f64| (0..n).map(|i| theta / (theta + i as f64)).sum::<f64>();

    let mut lo = 1e-12;
    let mut hi = 1.0;
    while expected(hi) < k && hi < 1e15 {
        hi *= 2.0;
    }
    for _ in 0..200 {
        let mid = (lo * hi).sqrt();
        if expected(mid) < k {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi / lo < 1.0 + 1e-12 {
            break;
        }
    }
    (lo * hi).sqrt()
}

/// Exact sampler of Ewens configurations of `n` genes with `k` alleles.
struct ConditionalSampler {
    n: usize,
    k: usize,
    /// `log_sums[j][v]`: log of the elementary symmetric sum of degree `j`
    /// of `1 / v, ..., 1 / (n - 1)`, `-inf` when fewer than `j` terms remain.
    log_sums: Vec<Vec<f64>>,
}

impl ConditionalSampler {
    fn fits(n: u64, k: usize) -> bool {
        n.checked_add(1)
            .and_then(|len| len.checked_mul(k as u64))
            .is_some_and(|entries| entries <= MAX_TABLE_ENTRIES)
    }

    fn new(n: u64, k: usize) -> Self {
        let n = n as usize;
        let mut log_sums = vec![vec![0.0; n + 1]];
        for j in 1..k {
            let prev = &log_sums[j - 1];
            let mut sums = vec![f64::NEG_INFINITY; n + 1];
            for v in (1..n).rev() {
                sums[v] = log_add(prev[v + 1] - (v as f64).ln(), sums[v + 1]);
            }
            log_sums.push(sums);
        }
        Self { n, k, log_sums }
    }

    /// Draw the allele counts, in the order of the Feller coupling.
    ///
    /// Given the previous boundary, the next one is at most `w` with
    /// probability `1 - e_j(w + 1) / e_j(v)`, found by bisection.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<u64> {
        let mut counts = Vec::with_capacity(self.k);
        let mut last = 0;
        for j in (1..self.k).rev() {
            let sums = &self.log_sums[j];
            let target = sums[last + 1] + (1.0 - rng.random::<f64>()).ln();
            let mut lo = last + 1;
            let mut hi = self.n - j;
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if sums[mid + 1] <= target {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }
            counts.push((lo - last) as u64);
            last = lo;
        }
        counts.push((self.n - last) as u64);
        counts
    }
}

fn log_add(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if lo == f64::NEG_INFINITY {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// Draw the allele counts of the Feller coupling with `theta`.
///
/// Candidates are generated by geometric skips at the largest rate of each
/// dyadic block of genes and thinned to their own rate. Returns `None` unless
/// exactly `k` alleles appear.
fn sample_feller<R: Rng + ?Sized>(n: u64, k: usize, theta: f64, rng: &mut R) -> Option<Vec<u64>> {
    let mut boundaries: Vec<u64> = Vec::with_capacity(k);
    let mut lo = 1;
    while lo < n {
        let hi = lo.saturating_mul(2).min(n);
        let bound = theta / (theta + lo as f64);
        let skips = Geometric::new(bound).ok()?;
        let mut v = lo;
        loop {
            v = v.saturating_add(skips.sample(rng));
            if v >= hi {
                break;
            }
            if rng.random::<f64>() * bound < theta / (theta + v as f64) {
                if boundaries.len() + 1 == k {
                    return None;
                }
                boundaries.push(v);
            }
            v += 1;
        }
        lo = hi;
    }
    if boundaries.len() + 1 != k {
        return None;
    }

    let mut counts = Vec::with_capacity(k);
    let mut last = 0;
    for v in boundaries {
        counts.push(v - last);
        last = v;
    }
    counts.push(n - last);
    Some(counts)
}

/// Log of the Ewens probability of `counts` given `k`, up to a constant.
fn log_weight(counts: &[u64]) -> f64 {
    let mut multiplicities: BTreeMap<u64, u64> = BTreeMap::new();
    let mut weight = 0.0;
    for &count in counts {
        weight -= (count as f64).ln();
        *multiplicities.entry(count).or_default() += 1;
    }
    for &mult in multiplicities.values() {
        weight -= (2..=mult).map(|m| (m as f64).ln()).sum::<f64>();
    }
    weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;
    use std::time::{Duration, Instant};

    #[test]
    fn degenerate_samples_are_not_significant() {
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        assert_eq!(slatkin_exact_test(&[10], 100, &mut rng).probability, 1.0);
        assert_eq!(slatkin_exact_test(&[1, 1, 1], 100, &mut rng).probability, 1.0);
        assert_eq!(slatkin_exact_test(&[0, 7, 0], 100, &mut rng).probability, 1.0);
        let empty = slatkin_exact_test(&[], 100, &mut rng);
        assert_eq!(empty.probability, 1.0);
        assert_eq!(empty.theta, 0.0);
    }

    #[test]
    fn even_configuration_is_extreme() {
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        let even = slatkin_exact_test(&[20; 5], 2000, &mut rng);
        let skewed = slatkin_exact_test(&[90, 4, 3, 2, 1], 2000, &mut rng);
        assert!(even.probability < 0.01);
        assert!(skewed.probability > even.probability);
        assert!((0.0..=1.0).contains(&skewed.probability));
    }

    #[test]
    fn seeded_test_is_deterministic() {
        let counts = [12, 5, 2, 1];
        let a = slatkin_exact_test(&counts, 500, &mut ChaCha12Rng::seed_from_u64(3));
        let b = slatkin_exact_test(&counts, 500, &mut ChaCha12Rng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn theta_estimate_matches_expected_alleles() {
        for (n, k) in [(100, 5), (30, 2), (50, 40)] {
            let theta = estimate_theta(n, k);
            let expected: f64 = (0..n).map(|i| theta / (theta + i as f64)).sum();
            assert!((expected - k as f64).abs() < 1e-6, "n = {n}, k = {k}");
        }
    }

    /// Share of draws equal to `[4, 1]` among partitions of 5 genes into 2
    /// alleles; the conditional Ewens probabilities are 0.6 for `{4, 1}` and
    /// 0.4 for `{3, 2}`.
    fn share_of_four_one(draws: &[Vec<u64>]) -> f64 {
        let hits = draws
            .iter()
            .filter(|counts| {
                let mut counts = counts.to_vec();
                counts.sort_unstable();
                counts == [1, 4]
            })
            .count();
        hits as f64 / draws.len() as f64
    }

    #[test]
    fn conditional_sampler_has_requested_shape() {
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        let sampler = ConditionalSampler::new(60, 6);
        for _ in 0..2000 {
            let counts = sampler.sample(&mut rng);
            assert_eq!(counts.len(), 6);
            assert_eq!(counts.iter().sum::<u64>(), 60);
            assert!(counts.iter().all(|&c| c > 0));
        }

        let sampler = ConditionalSampler::new(5, 2);
        let draws: Vec<_> = (0..20_000).map(|_| sampler.sample(&mut rng)).collect();
        assert!((share_of_four_one(&draws) - 0.6).abs() < 0.02);
    }

    #[test]
    fn feller_sampler_matches_conditional_distribution() {
        let mut rng = ChaCha12Rng::seed_from_u64(5);
        let theta = estimate_theta(5, 2);
        let draws: Vec<_> = (0..100_000)
            .filter_map(|_| sample_feller(5, 2, theta, &mut rng))
            .collect();
        assert!(draws.len() > 10_000);
        assert!(draws.iter().all(|counts| counts.iter().sum::<u64>() == 5));
        assert!((share_of_four_one(&draws) - 0.6).abs() < 0.02);

        let theta = estimate_theta(500, 8);
        let accepted = (0..2000)
            .filter_map(|_| sample_feller(500, 8, theta, &mut rng))
            .inspect(|counts| {
                assert_eq!(counts.len(), 8);
                assert_eq!(counts.iter().sum::<u64>(), 500);
            })
            .count();
        assert!(accepted > 0);
    }

    #[test]
    fn large_samples_are_tested_quickly() {
        let mut counts: Vec<u64> = (1..=32).collect();
        counts.push(100_000 - counts.iter().sum::<u64>());
        assert!(ConditionalSampler::fits(100_000, counts.len()));

        let start = Instant::now();
        let result = slatkin_exact_test(&counts, 1000, &mut ChaCha12Rng::seed_from_u64(6));
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!((0.0..=1.0).contains(&result.probability));
        assert!(result.theta > 0.0);
    }

    #[test]
    fn log_weight_penalizes_repeated_counts() {
        let distinct = log_weight(&[3, 2, 1]);
        assert!((distinct + 6.0_f64.ln()).abs() < 1e-12);
        let repeated = log_weight(&[2, 2, 2]);
        assert!((repeated + 3.0 * 2.0_f64.ln() + 6.0_f64.ln()).abs() < 1e-12);
    }
}
