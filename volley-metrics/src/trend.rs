use hdrhistogram::Histogram;

/// Values recorded into a trend are milliseconds; the live histogram keeps microseconds.
const LIVE_SCALE: f64 = 1_000.0;

/// Sample buffer behind a trend series.
///
/// Every sample is kept so that end-of-run percentiles are exact. The HDR histogram is a
/// cheap approximate view for live progress and per-tick threshold checks.
#[derive(Debug)]
pub struct Trend {
    samples: Vec<f64>,
    live: Histogram<u64>,
}

impl Default for Trend {
    fn default() -> Self {
        Self {
            samples: Vec::new(),
            live: new_live_histogram(),
        }
    }
}

fn new_live_histogram() -> Histogram<u64> {
    // Initial upper bound: 1 hour in microseconds; auto-resize covers outliers.
    match Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3) {
        Ok(mut h) => {
            h.auto(true);
            h
        }
        Err(err) => panic!("failed to create histogram: {err}"),
    }
}

impl Trend {
    pub fn record(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.samples.push(value);
        let scaled = (value.max(0.0) * LIVE_SCALE).round() as u64;
        let _ = self.live.record(scaled.max(1));
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }
}

/// Approximate view over one or more merged live histograms, in milliseconds.
///
/// Merging costs one pass over histogram buckets, independent of the sample count.
#[derive(Debug)]
pub struct LiveTrend(Histogram<u64>);

impl Default for LiveTrend {
    fn default() -> Self {
        Self(new_live_histogram())
    }
}

impl LiveTrend {
    pub(crate) fn merge(&mut self, trend: &Trend) {
        let _ = self.0.add(&trend.live);
    }

    pub fn count(&self) -> u64 {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.0.mean() / LIVE_SCALE)
    }

    pub fn min(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.0.min() as f64 / LIVE_SCALE)
    }

    pub fn max(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.0.max() as f64 / LIVE_SCALE)
    }

    /// `q` in `0.0..=1.0`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        (!self.is_empty()).then(|| self.0.value_at_quantile(q.clamp(0.0, 1.0)) as f64 / LIVE_SCALE)
    }
}

/// Nearest-rank percentile over ascending `sorted` samples.
///
/// Returns the smallest sample such that at least `p` percent of samples are less than or
/// equal to it. `p` is clamped to `0..=100`; `p == 0` yields the minimum.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    // Float noise such as `0.999 * 1000 = 999.0000000000001` must not bump the rank.
    let rank = ((p / 100.0) * n as f64 - 1e-9).ceil() as usize;
    sorted.get(rank.clamp(1, n) - 1).copied()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendSummary {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub med: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

impl TrendSummary {
    /// Summarizes samples, sorting them in place.
    pub fn from_samples(samples: &mut [f64]) -> Self {
        samples.sort_unstable_by(f64::total_cmp);
        let count = samples.len() as u64;
        let avg = (count > 0).then(|| samples.iter().sum::<f64>() / count as f64);

        Self {
            count,
            min: samples.first().copied(),
            max: samples.last().copied(),
            avg,
            med: percentile(samples, 50.0),
            p90: percentile(samples, 90.0),
            p95: percentile(samples, 95.0),
            p99: percentile(samples, 99.0),
        }
    }
}
