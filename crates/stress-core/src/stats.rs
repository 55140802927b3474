use serde::{Deserialize, Serialize};

/// Cut points of the latency percentile table.
pub const PERCENTILES: [u32; 7] = [10, 25, 50, 75, 90, 95, 99];

/// Equal-width histogram buckets between fastest and slowest.
pub const HISTOGRAM_BUCKETS: usize = 10;

/// Longest histogram bar, in characters.
pub const BAR_WIDTH: usize = 40;

/// Latencies in seconds, sorted ascending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Samples {
    sorted: Vec<f64>,
}

impl Samples {
    pub fn new(mut values: Vec<f64>) -> Self {
        values.sort_by(|a, b| a.total_cmp(b));
        Self { sorted: values }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.sorted
    }

    pub fn fastest(&self) -> f64 {
        self.sorted.first().copied().unwrap_or_default()
    }

    pub fn slowest(&self) -> f64 {
        self.sorted.last().copied().unwrap_or_default()
    }

    pub fn sum(&self) -> f64 {
        self.sorted.iter().sum()
    }

    pub fn average(&self) -> f64 {
        if self.sorted.is_empty() {
            return 0.0;
        }
        self.sum() / self.sorted.len() as f64
    }

    pub fn summary(&self) -> PhaseStats {
        PhaseStats {
            average: self.average(),
            fastest: self.fastest(),
            slowest: self.slowest(),
        }
    }

    /// Walks the sorted samples and takes, for each cut point, the first
    /// sample whose rank `i * 100 / n` reaches it. One sample may fill several
    /// cut points; a cut point above the highest rank has no value.
    pub fn percentiles(&self) -> Vec<Percentile> {
        let n = self.sorted.len();
        let mut table: Vec<Percentile> = PERCENTILES
            .iter()
            .map(|&percent| Percentile {
                percent,
                latency: None,
            })
            .collect();

        let mut next = 0;
        for (i, &latency) in self.sorted.iter().enumerate() {
            let rank = (i * 100 / n) as u32;
            while next < table.len() && rank >= table[next].percent {
                table[next].latency = Some(latency);
                next += 1;
            }
            if next == table.len() {
                break;
            }
        }
        table
    }

    /// Buckets samples into [`HISTOGRAM_BUCKETS`] equal-width marks starting
    /// at the fastest sample, plus a closing mark at the slowest. Each sample
    /// lands in the first bucket whose mark it does not exceed.
    pub fn histogram(&self) -> Vec<Bucket> {
        if self.sorted.is_empty() {
            return Vec::new();
        }
        let fastest = self.fastest();
        let slowest = self.slowest();
        let width = (slowest - fastest) / HISTOGRAM_BUCKETS as f64;

        let mut buckets: Vec<Bucket> = (0..HISTOGRAM_BUCKETS)
            .map(|i| fastest + width * i as f64)
            .chain(std::iter::once(slowest))
            .map(|mark| Bucket {
                mark,
                count: 0,
                bar: 0,
            })
            .collect();

        let last = buckets.len() - 1;
        let mut bi = 0;
        for &latency in &self.sorted {
            while bi < last && latency > buckets[bi].mark {
                bi += 1;
            }
            buckets[bi].count += 1;
        }

        let max = buckets.iter().map(|b| b.count).max().unwrap_or(0);
        if max > 0 {
            for bucket in &mut buckets {
                bucket.bar = (bucket.count * BAR_WIDTH + max / 2) / max;
            }
        }
        buckets
    }
}

/// Average, fastest and slowest of one phase, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub average: f64,
    pub fastest: f64,
    pub slowest: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentile {
    pub percent: u32,
    /// Seconds; `None` when there were too few samples to reach the cut point
    pub latency: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Upper bound of the bucket, in seconds
    pub mark: f64,
    pub count: usize,
    /// Bar length scaled to [`BAR_WIDTH`]
    pub bar: usize,
}
