use std::sync::Arc;
use std::time::{Duration, Instant};

use volley_metrics::{CounterSnapshot, per_sec};

use crate::metrics::{BuiltinMetrics, TAG_PHASE};
use crate::schedule::StageSnapshot;
use crate::thresholds_eval::ThresholdReport;

#[derive(Debug, Clone, Default)]
pub struct LiveMetrics {
    /// Requests/sec observed during the last progress interval.
    pub rps_now: f64,

    /// Iterations/sec observed during the last progress interval.
    pub iterations_per_sec_now: f64,

    /// Failed requests / total requests during the last progress interval (0..=1).
    pub error_rate_now: f64,

    pub requests_total: u64,
    pub failed_requests_total: u64,
    pub checks_failed_total: u64,
    pub iterations_total: u64,
    pub bytes_received_total: u64,
    pub bytes_sent_total: u64,

    /// Approximate latency percentiles (ms) over the run so far, from the live histograms.
    pub latency_p50_ms: Option<f64>,
    pub latency_p90_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct StageProgress {
    /// 1-based stage index.
    pub stage: usize,
    pub stages: usize,
    pub stage_elapsed: Duration,
    pub stage_remaining: Duration,
    pub start_target: u64,
    pub end_target: u64,
    pub current_target: u64,
}

impl From<StageSnapshot> for StageProgress {
    fn from(st: StageSnapshot) -> Self {
        Self {
            stage: st.index + 1,
            stages: st.count,
            stage_elapsed: st.stage_elapsed,
            stage_remaining: st.stage_remaining,
            start_target: st.start_target,
            end_target: st.end_target,
            current_target: st.current_target,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LoadProgress {
    Fixed {
        vus: u64,
        duration: Option<Duration>,
        iterations: Option<u64>,
    },
    Ramping {
        total_duration: Duration,
        stage: Option<StageProgress>,
    },
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Monotonic tick counter (1-based) for progress emissions.
    pub tick: u64,
    pub elapsed: Duration,
    pub target_vus: u64,
    pub active_vus: u64,
    pub metrics: LiveMetrics,
    pub load: LoadProgress,
    /// Live threshold verdicts; display-only unless a rule aborts the run.
    pub thresholds: Option<ThresholdReport>,
}

pub type ProgressFn = Arc<dyn Fn(ProgressUpdate) + Send + Sync + 'static>;

/// Turns cumulative registry totals into per-interval rates.
#[derive(Debug)]
pub(crate) struct LiveSampler {
    last_at: Instant,
    last_requests: Option<CounterSnapshot>,
    last_failed: Option<CounterSnapshot>,
    last_iterations: Option<CounterSnapshot>,
}

impl LiveSampler {
    pub(crate) fn new(started: Instant) -> Self {
        Self {
            last_at: started,
            last_requests: None,
            last_failed: None,
            last_iterations: None,
        }
    }

    pub(crate) fn sample(&mut self, metrics: &BuiltinMetrics) -> LiveMetrics {
        let now = Instant::now();
        let dt = now.duration_since(self.last_at).as_secs_f64();
        self.last_at = now;

        let reg = metrics.registry();
        let requests_total = reg
            .query(metrics.http_reqs)
            .where_tag_missing(TAG_PHASE)
            .sum_counter_total();
        let failed = reg
            .query(metrics.http_req_failed)
            .where_tag_missing(TAG_PHASE)
            .sum_rate_total();
        let checks = reg
            .query(metrics.checks)
            .where_tag_missing(TAG_PHASE)
            .sum_rate_total();
        let iterations_total = reg.query(metrics.iterations).sum_counter_total();

        let requests = CounterSnapshot::new(requests_total);
        let failed_now = CounterSnapshot::new(failed.hits);
        let iterations = CounterSnapshot::new(iterations_total);

        let delta_requests = requests.delta_since(self.last_requests);
        let delta_failed = failed_now.delta_since(self.last_failed);
        let delta_iterations = iterations.delta_since(self.last_iterations);
        self.last_requests = Some(requests);
        self.last_failed = Some(failed_now);
        self.last_iterations = Some(iterations);

        let quantiles = reg
            .query(metrics.http_req_duration)
            .where_tag_missing(TAG_PHASE)
            .live_trend_quantiles(&[0.50, 0.90, 0.95, 0.99]);
        let q = |i: usize| quantiles.get(i).copied().flatten();

        LiveMetrics {
            rps_now: per_sec(delta_requests, dt),
            iterations_per_sec_now: per_sec(delta_iterations, dt),
            error_rate_now: if delta_requests == 0 {
                0.0
            } else {
                delta_failed as f64 / delta_requests as f64
            },
            requests_total,
            failed_requests_total: failed.hits,
            checks_failed_total: checks.total.saturating_sub(checks.hits),
            iterations_total,
            bytes_received_total: reg
                .query(metrics.data_received)
                .where_tag_missing(TAG_PHASE)
                .sum_counter_total(),
            bytes_sent_total: reg
                .query(metrics.data_sent)
                .where_tag_missing(TAG_PHASE)
                .sum_counter_total(),
            latency_p50_ms: q(0),
            latency_p90_ms: q(1),
            latency_p95_ms: q(2),
            latency_p99_ms: q(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{RequestOutcome, SampleTags};
    use volley_metrics::Registry;

    #[test]
    fn sampler_reports_interval_deltas() {
        let m = BuiltinMetrics::register(Arc::new(Registry::default()));
        let mut sampler = LiveSampler::new(Instant::now());

        let ok = RequestOutcome {
            status: Some(200),
            error: None,
            latency: Duration::from_millis(20),
            bytes_sent: 10,
            bytes_received: 20,
        };
        let bad = RequestOutcome {
            status: Some(500),
            ..ok
        };

        for _ in 0..3 {
            m.record_request(SampleTags::scenario("s", "a"), "GET", &ok, None);
        }
        m.record_request(SampleTags::scenario("s", "a"), "GET", &bad, None);
        m.record_request(SampleTags::lifecycle("setup", "seed"), "POST", &bad, None);

        let first = sampler.sample(&m);
        assert_eq!(first.requests_total, 4);
        assert_eq!(first.failed_requests_total, 1);
        assert_eq!(first.error_rate_now, 0.25);
        assert_eq!(first.bytes_sent_total, 40);
        assert!(first.latency_p50_ms.is_some());

        m.record_request(SampleTags::scenario("s", "a"), "GET", &ok, None);
        let second = sampler.sample(&m);
        assert_eq!(second.requests_total, 5);
        assert_eq!(second.error_rate_now, 0.0);
    }
}
