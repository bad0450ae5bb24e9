use serde::Serialize;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use volley_core::{
    CheckSummary, LoadProgress, ProgressUpdate, RunOutcome, ScenarioSummary, ThresholdResult,
    TrendSummary,
};

use super::OutputFormatter;

pub(crate) struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn print_header(&self, _plan_path: &Path, _plan: &volley_core::RunPlan) {}

    fn progress(&self) -> Option<volley_core::ProgressFn> {
        Some(Arc::new(move |u| {
            let line = build_progress_line(&u);
            emit_json_line(&line);
        }))
    }

    fn print_summary(&self, outcome: &RunOutcome) -> anyhow::Result<()> {
        let line = build_summary_line(outcome);
        emit_json_line(&line);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonProgressLine {
    pub kind: &'static str,
    pub tick: u64,
    pub elapsed_secs: f64,
    pub target_vus: u64,
    pub active_vus: u64,

    pub requests_per_sec: f64,
    pub iterations_per_sec: f64,
    pub error_rate: f64,

    pub requests_total: u64,
    pub failed_requests_total: u64,
    pub iterations_total: u64,
    pub checks_failed_total: u64,
    pub bytes_received_total: u64,
    pub bytes_sent_total: u64,

    pub latency_p50_ms: Option<f64>,
    pub latency_p90_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<usize>,

    /// Threshold rules failing right now (`metric: expression`).
    pub thresholds_failing: Vec<String>,
}

fn build_progress_line(u: &ProgressUpdate) -> JsonProgressLine {
    let (stage, stages) = match &u.load {
        LoadProgress::Ramping {
            stage: Some(stage), ..
        } => (Some(stage.stage), Some(stage.stages)),
        _ => (None, None),
    };

    let thresholds_failing = u
        .thresholds
        .as_ref()
        .map(|report| {
            report
                .violations()
                .map(|v| format!("{}: {}", v.metric, v.expression))
                .collect()
        })
        .unwrap_or_default();

    JsonProgressLine {
        kind: "progress",
        tick: u.tick,
        elapsed_secs: u.elapsed.as_secs_f64(),
        target_vus: u.target_vus,
        active_vus: u.active_vus,

        requests_per_sec: u.metrics.rps_now,
        iterations_per_sec: u.metrics.iterations_per_sec_now,
        error_rate: u.metrics.error_rate_now,

        requests_total: u.metrics.requests_total,
        failed_requests_total: u.metrics.failed_requests_total,
        iterations_total: u.metrics.iterations_total,
        checks_failed_total: u.metrics.checks_failed_total,
        bytes_received_total: u.metrics.bytes_received_total,
        bytes_sent_total: u.metrics.bytes_sent_total,

        latency_p50_ms: u.metrics.latency_p50_ms,
        latency_p90_ms: u.metrics.latency_p90_ms,
        latency_p95_ms: u.metrics.latency_p95_ms,
        latency_p99_ms: u.metrics.latency_p99_ms,

        stage,
        stages,
        thresholds_failing,
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonSummaryLine {
    pub kind: &'static str,
    pub run_id: String,
    pub elapsed_secs: f64,
    pub vus_max: u64,

    pub scenarios: Vec<JsonScenarioSummary>,
    pub totals: JsonScenarioSummary,
    pub checks: Vec<JsonCheck>,

    pub thresholds: Vec<JsonThreshold>,
    pub thresholds_passed: bool,

    pub aborted_by_threshold: bool,
    pub hard_stopped: bool,
    pub teardown_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonScenarioSummary {
    pub scenario: String,

    pub requests_total: u64,
    pub failed_requests_total: u64,
    pub requests_per_sec: f64,
    pub bytes_received_total: u64,
    pub bytes_sent_total: u64,
    pub iterations_total: u64,
    pub iterations_failed: u64,

    pub latency_ms: JsonTrend,
    pub iteration_duration_ms: JsonTrend,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonTrend {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub med: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonCheck {
    pub scenario: String,
    pub step: String,
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonThreshold {
    pub metric: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub passed: bool,
    pub no_data: bool,
    pub abort_on_fail: bool,
}

impl From<&TrendSummary> for JsonTrend {
    fn from(t: &TrendSummary) -> Self {
        Self {
            count: t.count,
            min: t.min,
            max: t.max,
            avg: t.avg,
            med: t.med,
            p90: t.p90,
            p95: t.p95,
            p99: t.p99,
        }
    }
}

impl From<&ScenarioSummary> for JsonScenarioSummary {
    fn from(s: &ScenarioSummary) -> Self {
        Self {
            scenario: s.name.clone(),
            requests_total: s.requests_total,
            failed_requests_total: s.failed_requests_total,
            requests_per_sec: s.rps,
            bytes_received_total: s.bytes_received_total,
            bytes_sent_total: s.bytes_sent_total,
            iterations_total: s.iterations_total,
            iterations_failed: s.iterations_failed,
            latency_ms: (&s.latency).into(),
            iteration_duration_ms: (&s.iteration_duration).into(),
        }
    }
}

impl From<&CheckSummary> for JsonCheck {
    fn from(c: &CheckSummary) -> Self {
        Self {
            scenario: c.scenario.clone(),
            step: c.step.clone(),
            name: c.name.clone(),
            passes: c.passes,
            fails: c.fails,
        }
    }
}

impl From<&ThresholdResult> for JsonThreshold {
    fn from(r: &ThresholdResult) -> Self {
        Self {
            metric: r.metric.clone(),
            expression: r.expression.clone(),
            observed: r.observed,
            passed: r.passed,
            no_data: r.no_data,
            abort_on_fail: r.abort_on_fail,
        }
    }
}

fn build_summary_line(outcome: &RunOutcome) -> JsonSummaryLine {
    let summary = &outcome.summary;

    JsonSummaryLine {
        kind: "summary",
        run_id: summary.run_id.clone(),
        elapsed_secs: summary.elapsed.as_secs_f64(),
        vus_max: summary.vus_max,
        scenarios: summary.scenarios.iter().map(Into::into).collect(),
        totals: (&summary.totals).into(),
        checks: summary.checks.iter().map(Into::into).collect(),
        thresholds: outcome.thresholds.results.iter().map(Into::into).collect(),
        thresholds_passed: outcome.thresholds_passed(),
        aborted_by_threshold: outcome.aborted_by_threshold,
        hard_stopped: outcome.hard_stopped,
        teardown_error: outcome.teardown_error.clone(),
    }
}

fn emit_json_line<T: Serialize>(line: &T) {
    let mut out = std::io::stdout().lock();
    if serde_json::to_writer(&mut out, line).is_ok() {
        let _ = writeln!(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Duration;
    use volley_core::{LiveMetrics, RunSummary, StageProgress, ThresholdReport};

    fn to_value<T: Serialize>(line: &T) -> Value {
        match serde_json::to_value(line) {
            Ok(v) => v,
            Err(err) => panic!("to_value failed: {err}"),
        }
    }

    #[test]
    fn progress_line_carries_stage_and_failing_rules() {
        let update = ProgressUpdate {
            tick: 3,
            elapsed: Duration::from_millis(3_500),
            target_vus: 10,
            active_vus: 9,
            metrics: LiveMetrics {
                rps_now: 120.0,
                requests_total: 400,
                ..LiveMetrics::default()
            },
            load: LoadProgress::Ramping {
                total_duration: Duration::from_secs(100),
                stage: Some(StageProgress {
                    stage: 1,
                    stages: 3,
                    stage_elapsed: Duration::from_millis(3_500),
                    stage_remaining: Duration::from_millis(26_500),
                    start_target: 0,
                    end_target: 50,
                    current_target: 5,
                }),
            },
            thresholds: Some(ThresholdReport {
                results: vec![ThresholdResult {
                    metric: "http_req_failed".to_string(),
                    expression: "rate<0.01".to_string(),
                    observed: Some(0.2),
                    passed: false,
                    no_data: false,
                    abort_on_fail: false,
                }],
            }),
        };

        let v = to_value(&build_progress_line(&update));
        assert_eq!(v.get("kind").and_then(Value::as_str), Some("progress"));
        assert_eq!(v.get("stage").and_then(Value::as_u64), Some(1));
        assert_eq!(v.get("stages").and_then(Value::as_u64), Some(3));
        assert_eq!(v.get("requests_total").and_then(Value::as_u64), Some(400));
        assert_eq!(
            v.pointer("/thresholds_failing/0").and_then(Value::as_str),
            Some("http_req_failed: rate<0.01")
        );
    }

    #[test]
    fn fixed_progress_omits_stage() {
        let update = ProgressUpdate {
            tick: 1,
            elapsed: Duration::from_secs(1),
            target_vus: 2,
            active_vus: 2,
            metrics: LiveMetrics::default(),
            load: LoadProgress::Fixed {
                vus: 2,
                duration: Some(Duration::from_secs(10)),
                iterations: None,
            },
            thresholds: None,
        };

        let v = to_value(&build_progress_line(&update));
        assert!(v.get("stage").is_none());
        assert_eq!(
            v.get("thresholds_failing")
                .and_then(Value::as_array)
                .map(Vec::len),
            Some(0)
        );
    }

    #[test]
    fn summary_line_has_totals_checks_and_thresholds() {
        let scenario = ScenarioSummary {
            name: "s1".to_string(),
            requests_total: 10,
            failed_requests_total: 2,
            iterations_total: 5,
            ..ScenarioSummary::default()
        };
        let outcome = RunOutcome {
            summary: RunSummary {
                run_id: "r".to_string(),
                elapsed: Duration::from_secs(2),
                vus_max: 1,
                totals: ScenarioSummary {
                    name: "total".to_string(),
                    ..scenario.clone()
                },
                scenarios: vec![scenario],
                checks: vec![CheckSummary {
                    scenario: "s1".to_string(),
                    step: "create".to_string(),
                    name: "status is 201".to_string(),
                    passes: 4,
                    fails: 1,
                }],
            },
            thresholds: ThresholdReport {
                results: vec![ThresholdResult {
                    metric: "http_req_duration".to_string(),
                    expression: "p(95)<300".to_string(),
                    observed: Some(12.5),
                    passed: true,
                    no_data: false,
                    abort_on_fail: false,
                }],
            },
            teardown_error: None,
            aborted_by_threshold: false,
            hard_stopped: false,
        };

        let v = to_value(&build_summary_line(&outcome));
        assert_eq!(v.get("kind").and_then(Value::as_str), Some("summary"));
        assert_eq!(
            v.pointer("/totals/requests_total").and_then(Value::as_u64),
            Some(10)
        );
        assert_eq!(
            v.pointer("/scenarios/0/scenario").and_then(Value::as_str),
            Some("s1")
        );
        assert_eq!(v.pointer("/checks/0/fails").and_then(Value::as_u64), Some(1));
        assert_eq!(
            v.get("thresholds_passed").and_then(Value::as_bool),
            Some(true)
        );
        assert!(v.get("teardown_error").is_some_and(Value::is_null));
    }
}
