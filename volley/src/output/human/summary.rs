use std::fmt::Write as _;

use volley_core::{CheckSummary, RunOutcome, ScenarioSummary, ThresholdResult, TrendSummary};

use super::duration::{format_duration_single, format_ms_opt};
use super::format::{format_bytes, format_observed, format_percent, format_rate};

pub(crate) fn render(outcome: &RunOutcome) -> String {
    let summary = &outcome.summary;
    let mut out = String::new();

    writeln!(
        &mut out,
        "summary (run {}, {} elapsed, {} vus max)",
        summary.run_id,
        format_duration_single(summary.elapsed),
        summary.vus_max
    )
    .ok();

    for s in &summary.scenarios {
        writeln!(&mut out, "scenario: {}", s.name).ok();
        render_scenario(s, &mut out);
        out.push('\n');
    }

    out.push_str("totals\n");
    render_scenario(&summary.totals, &mut out);

    if !summary.checks.is_empty() {
        out.push('\n');
        render_checks(&summary.checks, &mut out);
    }

    if !outcome.thresholds.results.is_empty() {
        out.push('\n');
        render_thresholds(&outcome.thresholds.results, &mut out);
    }

    if outcome.hard_stopped {
        out.push_str("\nnote: in-flight iterations were cancelled after the graceful stop\n");
    }

    out
}

fn render_scenario(s: &ScenarioSummary, out: &mut String) {
    let failed_ratio = if s.requests_total > 0 {
        s.failed_requests_total as f64 / s.requests_total as f64
    } else {
        0.0
    };

    writeln!(
        out,
        "  requests: {} (failed {}, {}) rps={}",
        s.requests_total,
        s.failed_requests_total,
        format_percent(failed_ratio),
        format_rate(s.rps)
    )
    .ok();
    writeln!(
        out,
        "  iterations: {} (failed {})",
        s.iterations_total, s.iterations_failed
    )
    .ok();
    writeln!(
        out,
        "  bytes: recv {} sent {}",
        format_bytes(s.bytes_received_total),
        format_bytes(s.bytes_sent_total)
    )
    .ok();
    render_trend("latency", &s.latency, out);
    render_trend("iteration", &s.iteration_duration, out);
}

fn render_trend(label: &str, t: &TrendSummary, out: &mut String) {
    if t.count == 0 {
        writeln!(out, "  {label}: n/a").ok();
        return;
    }

    writeln!(
        out,
        "  {label} = avg={} min={} med={} p90={} p95={} p99={} max={} (n={})",
        format_ms_opt(t.avg),
        format_ms_opt(t.min),
        format_ms_opt(t.med),
        format_ms_opt(t.p90),
        format_ms_opt(t.p95),
        format_ms_opt(t.p99),
        format_ms_opt(t.max),
        t.count
    )
    .ok();
}

fn render_checks(checks: &[CheckSummary], out: &mut String) {
    let total: u64 = checks.iter().map(|c| c.passes + c.fails).sum();
    let failed: u64 = checks.iter().map(|c| c.fails).sum();
    writeln!(out, "checks: {}/{} passed", total - failed, total).ok();

    let mut sorted: Vec<_> = checks.iter().collect();
    sorted.sort_by(|a, b| {
        b.fails
            .cmp(&a.fails)
            .then_with(|| a.scenario.cmp(&b.scenario))
            .then_with(|| a.step.cmp(&b.step))
            .then_with(|| a.name.cmp(&b.name))
    });

    for c in sorted {
        let mark = if c.fails == 0 { "ok  " } else { "FAIL" };
        writeln!(
            out,
            "  {mark} {}/{}: {} ({} passed, {} failed)",
            c.scenario, c.step, c.name, c.passes, c.fails
        )
        .ok();
    }
}

fn render_thresholds(results: &[ThresholdResult], out: &mut String) {
    let passed = results.iter().filter(|r| r.passed).count();
    writeln!(out, "thresholds: {passed}/{} passed", results.len()).ok();

    for r in results {
        let mark = if r.passed { "ok  " } else { "FAIL" };
        let observed = if r.no_data {
            "no data".to_string()
        } else {
            format_observed(r.observed)
        };
        let abort = if r.abort_on_fail { " [abortOnFail]" } else { "" };
        writeln!(
            out,
            "  {mark} {}: {} (observed {observed}){abort}",
            r.metric, r.expression
        )
        .ok();
    }
}
