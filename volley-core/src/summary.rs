use std::time::Duration;

use volley_metrics::{KeyId, MetricId, TrendSummary, per_sec};

use crate::metrics::{BuiltinMetrics, TAG_PHASE};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioSummary {
    pub name: String,
    pub requests_total: u64,
    pub failed_requests_total: u64,
    pub rps: f64,
    pub bytes_sent_total: u64,
    pub bytes_received_total: u64,
    pub iterations_total: u64,
    pub iterations_failed: u64,
    /// `http_req_duration`, milliseconds.
    pub latency: TrendSummary,
    /// `iteration_duration`, milliseconds.
    pub iteration_duration: TrendSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    pub scenario: String,
    pub step: String,
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

/// End-of-run aggregates; setup and teardown traffic is excluded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub elapsed: Duration,
    pub vus_max: u64,
    pub totals: ScenarioSummary,
    pub scenarios: Vec<ScenarioSummary>,
    pub checks: Vec<CheckSummary>,
}

impl RunSummary {
    pub fn checks_total(&self) -> u64 {
        self.checks.iter().map(|c| c.passes + c.fails).sum()
    }

    pub fn checks_failed(&self) -> u64 {
        self.checks.iter().map(|c| c.fails).sum()
    }

    pub(crate) fn collect<'a>(
        metrics: &BuiltinMetrics,
        run_id: &str,
        scenarios: impl IntoIterator<Item = &'a str>,
        elapsed: Duration,
    ) -> Self {
        let totals = scenario_summary(metrics, "total", None, elapsed);
        let scenarios = scenarios
            .into_iter()
            .map(|name| scenario_summary(metrics, name, Some(name), elapsed))
            .collect();

        let vus_max = metrics
            .registry()
            .query(metrics.vus_max)
            .max_gauge()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(0);

        Self {
            run_id: run_id.to_string(),
            elapsed,
            vus_max,
            totals,
            scenarios,
            checks: check_summaries(metrics),
        }
    }
}

fn scenario_summary(
    metrics: &BuiltinMetrics,
    name: &str,
    scenario: Option<&str>,
    elapsed: Duration,
) -> ScenarioSummary {
    let reg = metrics.registry();
    let q = |id: MetricId| {
        let q = reg.query(id).where_tag_missing(TAG_PHASE);
        match scenario {
            Some(s) => q.where_tag("scenario", s),
            None => q,
        }
    };

    let requests_total = q(metrics.http_reqs).sum_counter_total();
    ScenarioSummary {
        name: name.to_string(),
        requests_total,
        failed_requests_total: q(metrics.http_req_failed).sum_rate_total().hits,
        rps: if elapsed.is_zero() {
            0.0
        } else {
            per_sec(requests_total, elapsed.as_secs_f64())
        },
        bytes_sent_total: q(metrics.data_sent).sum_counter_total(),
        bytes_received_total: q(metrics.data_received).sum_counter_total(),
        iterations_total: q(metrics.iterations).sum_counter_total(),
        iterations_failed: q(metrics.iterations)
            .where_tag("outcome", "failed")
            .sum_counter_total(),
        latency: q(metrics.http_req_duration).trend_summary(),
        iteration_duration: q(metrics.iteration_duration).trend_summary(),
    }
}

fn check_summaries(metrics: &BuiltinMetrics) -> Vec<CheckSummary> {
    let reg = metrics.registry();
    let (Some(scenario_k), Some(step_k), Some(check_k)) = (
        reg.lookup_key("scenario"),
        reg.lookup_key("step"),
        reg.lookup_key("check"),
    ) else {
        return Vec::new();
    };

    let resolve = |id: Option<KeyId>| {
        id.and_then(|id| reg.resolve_key_id(id))
            .map(|s| s.to_string())
            .unwrap_or_default()
    };

    let mut out: Vec<CheckSummary> = reg
        .query(metrics.checks)
        .where_tag_missing(TAG_PHASE)
        .group_by([scenario_k, step_k, check_k])
        .sum_rate()
        .into_iter()
        .map(|(tags, totals)| CheckSummary {
            scenario: resolve(tags.get(scenario_k)),
            step: resolve(tags.get(step_k)),
            name: resolve(tags.get(check_k)),
            passes: totals.hits,
            fails: totals.total.saturating_sub(totals.hits),
        })
        .collect();

    out.sort_by(|a, b| {
        (&a.scenario, &a.step, &a.name).cmp(&(&b.scenario, &b.step, &b.name))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{RequestOutcome, SampleTags};
    use std::sync::Arc;
    use volley_metrics::Registry;

    #[test]
    fn collects_per_scenario_and_checks() {
        let m = BuiltinMetrics::register(Arc::new(Registry::default()));
        let ok = RequestOutcome {
            status: Some(201),
            error: None,
            latency: Duration::from_millis(40),
            bytes_sent: 100,
            bytes_received: 50,
        };

        let create = SampleTags::scenario("create_merge", "create");
        m.record_request(create, "POST", &ok, None);
        m.record_check(create, "status is 201", true);
        m.record_check(create, "status is 201", false);
        m.record_iteration("create_merge", Duration::from_millis(1_050), true);

        let get = SampleTags::scenario("get_review", "get");
        m.record_request(get, "GET", &RequestOutcome { status: Some(500), ..ok }, None);
        m.record_iteration("get_review", Duration::from_millis(30), false);

        let setup = SampleTags::lifecycle("setup", "team");
        m.record_request(setup, "POST", &ok, None);
        m.record_check(setup, "team created", true);

        if let Some(g) = m.vus_max_handle() {
            g.raise_gauge(7);
        }

        let s = RunSummary::collect(
            &m,
            "run-1",
            ["create_merge", "get_review"],
            Duration::from_secs(2),
        );

        assert_eq!(s.vus_max, 7);
        assert_eq!(s.totals.requests_total, 2);
        assert_eq!(s.totals.failed_requests_total, 1);
        assert_eq!(s.totals.rps, 1.0);
        assert_eq!(s.totals.bytes_sent_total, 200);
        assert_eq!(s.totals.iterations_total, 2);
        assert_eq!(s.totals.iterations_failed, 1);

        assert_eq!(s.scenarios[0].name, "create_merge");
        assert_eq!(s.scenarios[0].requests_total, 1);
        assert_eq!(s.scenarios[0].iteration_duration.max, Some(1_050.0));
        assert_eq!(s.scenarios[1].failed_requests_total, 1);

        assert_eq!(
            s.checks,
            vec![CheckSummary {
                scenario: "create_merge".to_string(),
                step: "create".to_string(),
                name: "status is 201".to_string(),
                passes: 1,
                fails: 1,
            }]
        );
        assert_eq!(s.checks_total(), 2);
        assert_eq!(s.checks_failed(), 1);
    }
}
