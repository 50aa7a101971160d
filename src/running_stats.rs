//! Online statistics for a single timing field.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Reservoir size used when the configured limit is zero.
pub const DEFAULT_PERCENTILE_LIMIT: usize = 1000;

/// Running min/max/sum/count plus a bounded reservoir of observations used
/// for percentile estimation.
///
/// The reservoir holds at most `limit` values; once full, each new
/// observation overwrites a uniformly chosen slot, keeping memory and
/// percentile cost bounded regardless of how many values arrive.
#[derive(Debug, Clone)]
pub struct RunningStats {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
    reservoir: Vec<f64>,
    sorted: bool,
    limit: usize,
    rng: SmallRng,
}

impl RunningStats {
    pub fn new(limit: usize) -> Self {
        let limit = if limit == 0 {
            DEFAULT_PERCENTILE_LIMIT
        } else {
            limit
        };
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            m2: 0.0,
            reservoir: Vec::new(),
            sorted: true,
            limit,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn add_value(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        // Welford's online update; keeps mean and stddev O(1).
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);

        if self.reservoir.len() < self.limit {
            self.reservoir.push(value);
        } else {
            let slot = self.rng.gen_range(0..self.reservoir.len());
            self.reservoir[slot] = value;
        }
        self.sorted = false;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    pub fn lower(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn upper(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }

    /// Population standard deviation.
    pub fn stddev(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }

    pub fn median(&mut self) -> f64 {
        self.percentile(50.0)
    }

    /// Estimated percentile over the reservoir, `0.0` when no values have
    /// been observed. `p` is clamped to `[0, 100]`.
    pub fn percentile(&mut self, p: f64) -> f64 {
        if self.reservoir.is_empty() {
            return 0.0;
        }
        if !self.sorted {
            self.reservoir.sort_by(|a, b| a.total_cmp(b));
            self.sorted = true;
        }
        let p = p.min(100.0);
        let index = (self.reservoir.len() as f64 * p / 100.0 - 0.5) as isize;
        let index = index.clamp(0, self.reservoir.len() as isize - 1) as usize;
        self.reservoir[index]
    }
}
