use std::sync::Arc;
use std::time::Duration;

use volley_http::HttpTransportErrorKind;
use volley_metrics::{MetricHandle, MetricId, MetricKind, Registry};

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const CHECKS: &str = "checks";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";
pub const DATA_SENT: &str = "data_sent";
pub const DATA_RECEIVED: &str = "data_received";

/// Tag carried only by setup/teardown series; threshold and summary queries exclude it.
pub const TAG_PHASE: &str = "phase";

pub const BUILTIN_METRICS: &[(&str, MetricKind)] = &[
    (HTTP_REQS, MetricKind::Counter),
    (HTTP_REQ_DURATION, MetricKind::Trend),
    (HTTP_REQ_FAILED, MetricKind::Rate),
    (CHECKS, MetricKind::Rate),
    (ITERATIONS, MetricKind::Counter),
    (ITERATION_DURATION, MetricKind::Trend),
    (VUS, MetricKind::Gauge),
    (VUS_MAX, MetricKind::Gauge),
    (DATA_SENT, MetricKind::Counter),
    (DATA_RECEIVED, MetricKind::Counter),
];

/// Milliseconds with sub-millisecond precision, as stored in trend metrics.
pub fn duration_ms(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

pub fn builtin_kind(name: &str) -> Option<MetricKind> {
    BUILTIN_METRICS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, kind)| *kind)
}

/// Outcome of one HTTP call, consumed immediately by [`BuiltinMetrics::record_request`].
#[derive(Debug, Clone, Copy)]
pub struct RequestOutcome {
    /// `None` when the call failed before a response arrived.
    pub status: Option<u16>,
    pub error: Option<HttpTransportErrorKind>,
    pub latency: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl RequestOutcome {
    /// The `http_req_failed` predicate: a transport error, or a status outside `expected`
    /// (default `200..=399`).
    pub fn is_failure(&self, expected: Option<&[u16]>) -> bool {
        match self.status {
            None => true,
            Some(status) => match expected {
                Some(list) => !list.contains(&status),
                None => !(200..=399).contains(&status),
            },
        }
    }
}

/// Where a recorded sample came from.
#[derive(Debug, Clone, Copy)]
pub struct SampleTags<'a> {
    pub scenario: &'a str,
    pub step: &'a str,
    /// `Some("setup" | "teardown")` for lifecycle calls.
    pub phase: Option<&'a str>,
}

impl<'a> SampleTags<'a> {
    pub fn scenario(scenario: &'a str, step: &'a str) -> Self {
        Self {
            scenario,
            step,
            phase: None,
        }
    }

    pub fn lifecycle(phase: &'a str, step: &'a str) -> Self {
        Self {
            scenario: phase,
            step,
            phase: Some(phase),
        }
    }
}

/// Ids of the built-in metrics, registered once per run.
#[derive(Debug, Clone)]
pub struct BuiltinMetrics {
    registry: Arc<Registry>,
    pub http_reqs: MetricId,
    pub http_req_duration: MetricId,
    pub http_req_failed: MetricId,
    pub checks: MetricId,
    pub iterations: MetricId,
    pub iteration_duration: MetricId,
    pub vus: MetricId,
    pub vus_max: MetricId,
    pub data_sent: MetricId,
    pub data_received: MetricId,
}

impl BuiltinMetrics {
    pub fn register(registry: Arc<Registry>) -> Self {
        let reg = |name: &str| {
            let kind = builtin_kind(name).unwrap_or(MetricKind::Counter);
            registry.register(name, kind)
        };

        Self {
            http_reqs: reg(HTTP_REQS),
            http_req_duration: reg(HTTP_REQ_DURATION),
            http_req_failed: reg(HTTP_REQ_FAILED),
            checks: reg(CHECKS),
            iterations: reg(ITERATIONS),
            iteration_duration: reg(ITERATION_DURATION),
            vus: reg(VUS),
            vus_max: reg(VUS_MAX),
            data_sent: reg(DATA_SENT),
            data_received: reg(DATA_RECEIVED),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn handle(&self, metric: MetricId, tags: &[(&str, &str)]) -> Option<MetricHandle> {
        self.registry
            .get_handle(metric, self.registry.resolve_tags(tags))
    }

    fn with_phase<'t>(tags: &mut Vec<(&'t str, &'t str)>, sample: &SampleTags<'t>) {
        if let Some(phase) = sample.phase {
            tags.push((TAG_PHASE, phase));
        }
    }

    pub fn record_request(
        &self,
        sample: SampleTags<'_>,
        method: &str,
        outcome: &RequestOutcome,
        expected_statuses: Option<&[u16]>,
    ) {
        let status = outcome.status.map(|s| s.to_string());
        let error = outcome.error.map(|e| e.to_string());

        let mut tags: Vec<(&str, &str)> = vec![
            ("scenario", sample.scenario),
            ("step", sample.step),
            ("method", method),
        ];
        if let Some(status) = status.as_deref() {
            tags.push(("status", status));
        }
        if let Some(error) = error.as_deref() {
            tags.push(("error", error));
        }
        Self::with_phase(&mut tags, &sample);

        if let Some(h) = self.handle(self.http_reqs, &tags) {
            h.increment(1);
        }
        if let Some(h) = self.handle(self.http_req_duration, &tags) {
            h.observe(duration_ms(outcome.latency));
        }
        if let Some(h) = self.handle(self.http_req_failed, &tags) {
            h.record_rate(outcome.is_failure(expected_statuses));
        }

        // Byte counters are partitioned by scenario only.
        let mut byte_tags: Vec<(&str, &str)> = vec![("scenario", sample.scenario)];
        Self::with_phase(&mut byte_tags, &sample);
        if outcome.bytes_sent > 0
            && let Some(h) = self.handle(self.data_sent, &byte_tags)
        {
            h.increment(outcome.bytes_sent);
        }
        if outcome.bytes_received > 0
            && let Some(h) = self.handle(self.data_received, &byte_tags)
        {
            h.increment(outcome.bytes_received);
        }
    }

    pub fn record_check(&self, sample: SampleTags<'_>, check: &str, passed: bool) {
        let mut tags: Vec<(&str, &str)> = vec![
            ("scenario", sample.scenario),
            ("step", sample.step),
            ("check", check),
        ];
        Self::with_phase(&mut tags, &sample);
        if let Some(h) = self.handle(self.checks, &tags) {
            h.record_rate(passed);
        }
    }

    pub fn record_iteration(&self, scenario: &str, duration: Duration, success: bool) {
        let outcome = if success { "success" } else { "failed" };
        if let Some(h) = self.handle(
            self.iterations,
            &[("scenario", scenario), ("outcome", outcome)],
        ) {
            h.increment(1);
        }
        if let Some(h) = self.handle(self.iteration_duration, &[("scenario", scenario)]) {
            h.observe(duration_ms(duration));
        }
    }

    pub fn vus_handle(&self) -> Option<MetricHandle> {
        self.handle(self.vus, &[])
    }

    pub fn vus_max_handle(&self) -> Option<MetricHandle> {
        self.handle(self.vus_max, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: Option<u16>) -> RequestOutcome {
        RequestOutcome {
            status,
            error: status
                .is_none()
                .then_some(HttpTransportErrorKind::Connect),
            latency: Duration::from_millis(120),
            bytes_sent: 100,
            bytes_received: 250,
        }
    }

    #[test]
    fn failure_predicate_defaults_to_2xx_3xx() {
        assert!(!outcome(Some(200)).is_failure(None));
        assert!(!outcome(Some(302)).is_failure(None));
        assert!(outcome(Some(404)).is_failure(None));
        assert!(outcome(Some(503)).is_failure(None));
        assert!(outcome(None).is_failure(None));

        assert!(!outcome(Some(409)).is_failure(Some(&[200, 409])));
        assert!(outcome(Some(201)).is_failure(Some(&[200, 409])));
        assert!(outcome(None).is_failure(Some(&[200])));
    }

    #[test]
    fn record_request_feeds_every_http_stream() {
        let registry = Arc::new(Registry::default());
        let m = BuiltinMetrics::register(registry.clone());

        let tags = SampleTags::scenario("create_merge", "create");
        m.record_request(tags, "POST", &outcome(Some(201)), None);
        m.record_request(tags, "POST", &outcome(Some(500)), None);
        m.record_request(tags, "POST", &outcome(None), None);

        assert_eq!(registry.query(m.http_reqs).sum_counter_total(), 3);
        let failed = registry.query(m.http_req_failed).sum_rate_total();
        assert_eq!((failed.total, failed.hits), (3, 2));
        assert_eq!(registry.query(m.http_req_duration).trend_samples().len(), 3);
        assert_eq!(registry.query(m.data_sent).sum_counter_total(), 300);
        assert_eq!(registry.query(m.data_received).sum_counter_total(), 750);

        let errors = registry
            .query(m.http_reqs)
            .where_tag("error", "connect")
            .sum_counter_total();
        assert_eq!(errors, 1);
    }

    #[test]
    fn lifecycle_samples_carry_phase_tag() {
        let registry = Arc::new(Registry::default());
        let m = BuiltinMetrics::register(registry.clone());

        m.record_request(
            SampleTags::lifecycle("setup", "create_team"),
            "POST",
            &outcome(Some(201)),
            None,
        );
        m.record_request(
            SampleTags::scenario("create_merge", "create"),
            "POST",
            &outcome(Some(201)),
            None,
        );
        m.record_check(SampleTags::lifecycle("setup", "create_team"), "status is 201", true);

        let run_only = registry
            .query(m.http_reqs)
            .where_tag_missing(TAG_PHASE)
            .sum_counter_total();
        assert_eq!(run_only, 1);

        let setup = registry
            .query(m.http_reqs)
            .where_tag("scenario", "setup")
            .sum_counter_total();
        assert_eq!(setup, 1);

        let checks = registry
            .query(m.checks)
            .where_tag_missing(TAG_PHASE)
            .sum_rate_total();
        assert_eq!(checks.total, 0);
    }

    #[test]
    fn iterations_are_split_by_outcome() {
        let registry = Arc::new(Registry::default());
        let m = BuiltinMetrics::register(registry.clone());

        m.record_iteration("a", Duration::from_millis(1_000), true);
        m.record_iteration("a", Duration::from_millis(10), false);

        assert_eq!(registry.query(m.iterations).sum_counter_total(), 2);
        assert_eq!(
            registry
                .query(m.iterations)
                .where_tag("outcome", "failed")
                .sum_counter_total(),
            1
        );
        let summary = registry.query(m.iteration_duration).trend_summary();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.max, Some(1_000.0));
    }

    #[test]
    fn builtin_kinds() {
        assert_eq!(builtin_kind("http_req_duration"), Some(MetricKind::Trend));
        assert_eq!(builtin_kind("checks"), Some(MetricKind::Rate));
        assert_eq!(builtin_kind("vus_max"), Some(MetricKind::Gauge));
        assert_eq!(builtin_kind("custom"), None);
    }
}
