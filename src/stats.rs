use serde::{Deserialize, Serialize};

/// Running summary of a series of values (Welford's algorithm).
pub struct Accumulator {
    n_vals: usize,
    mean: f64,
    diff_2_sum: f64,
    min: f64,
    max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorReport {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            n_vals: 0,
            mean: 0.0,
            diff_2_sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn add(&mut self, val: f64) {
        self.n_vals += 1;

        let diff_a = val - self.mean;
        self.mean += diff_a / self.n_vals as f64;

        let diff_b = val - self.mean;
        self.diff_2_sum += diff_a * diff_b;

        self.min = self.min.min(val);
        self.max = self.max.max(val);
    }

    pub fn report(&self) -> AccumulatorReport {
        if self.n_vals == 0 {
            return AccumulatorReport {
                mean: f64::NAN,
                std_dev: f64::NAN,
                min: f64::NAN,
                max: f64::NAN,
            };
        }
        AccumulatorReport {
            mean: self.mean,
            std_dev: if self.n_vals > 1 {
                (self.diff_2_sum / (self.n_vals as f64 - 1.0)).sqrt()
            } else {
                f64::NAN
            },
            min: self.min,
            max: self.max,
        }
    }
}

impl FromIterator<f64> for Accumulator {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = Accumulator::new();
        for val in iter {
            acc.add(val);
        }
        acc
    }
}

/// Relative frequencies of `counts`, in the same order.
pub fn frequencies(counts: &[u64]) -> Vec<f64> {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return vec![0.0; counts.len()];
    }
    counts.iter().map(|&c| c as f64 / total as f64).collect()
}

/// Shannon entropy (natural log) of a frequency vector.
///
/// Zero frequencies contribute nothing; an all-zero vector has entropy 0.
pub fn shannon_entropy(freqs: &[f64]) -> f64 {
    let sum: f64 = freqs
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| p * p.ln())
        .sum();
    if sum == 0.0 { 0.0 } else { -sum }
}

/// Index of qualitative variation, in `[0, 1]`.
pub fn iqv(freqs: &[f64]) -> f64 {
    let k = freqs.len();
    if k <= 1 {
        return 0.0;
    }
    let k = k as f64;
    let sum_sq: f64 = freqs.iter().map(|p| p * p).sum();
    (k / (k - 1.0)) * (1.0 - sum_sq)
}

/// Neiman's t_f estimator of theta from homozygosity.
pub fn neiman_tf(freqs: &[f64]) -> f64 {
    let sum_sq: f64 = freqs.iter().map(|p| p * p).sum();
    if sum_sq == 0.0 {
        return 0.0;
    }
    1.0 / sum_sq - 1.0
}
