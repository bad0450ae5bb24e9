use std::time::Duration;

use volley_metrics::{MetricId, MetricKind, Query, Registry};

use crate::config::NoDataPolicy;
use crate::error::{Error, Result};
use crate::metrics::TAG_PHASE;
use crate::thresholds::{ThresholdAgg, ThresholdSet, parse_threshold_expr};

/// Verdict of one threshold expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdResult {
    /// Display key, including any tag selector.
    pub metric: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub passed: bool,
    /// The metric had no samples; `passed` came from the no-data policy.
    pub no_data: bool,
    pub abort_on_fail: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdReport {
    pub results: Vec<ThresholdResult>,
}

impl ThresholdReport {
    /// Every rule passed (vacuously true without rules).
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn violations(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    /// A rule with data failed and asks for the run to stop.
    pub fn should_abort(&self) -> bool {
        self.results
            .iter()
            .any(|r| !r.passed && !r.no_data && r.abort_on_fail)
    }
}

/// How trend aggregations are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrendView {
    /// Every sample, sorted: the final verdict.
    Exact,
    /// Merged HDR histograms: per-tick checks while the run is live.
    Live,
}

/// Evaluates every rule against the run's (non-lifecycle) series.
///
/// `elapsed` is the denominator of counter `rate` (events per second).
pub fn evaluate_thresholds(
    metrics: &Registry,
    sets: &[ThresholdSet],
    no_data: NoDataPolicy,
    elapsed: Duration,
) -> Result<ThresholdReport> {
    evaluate(metrics, sets, no_data, elapsed, TrendView::Exact)
}

/// Like [`evaluate_thresholds`], but trend rules read the approximate live histograms so
/// the cost does not grow with the number of samples.
pub(crate) fn evaluate_thresholds_live(
    metrics: &Registry,
    sets: &[ThresholdSet],
    no_data: NoDataPolicy,
    elapsed: Duration,
) -> Result<ThresholdReport> {
    evaluate(metrics, sets, no_data, elapsed, TrendView::Live)
}

fn evaluate(
    metrics: &Registry,
    sets: &[ThresholdSet],
    no_data: NoDataPolicy,
    elapsed: Duration,
    view: TrendView,
) -> Result<ThresholdReport> {
    let mut results = Vec::new();

    for set in sets {
        let key = set.display_key();
        let lookup = metrics.lookup_metric(&set.metric);

        for expr_cfg in &set.expressions {
            let expr =
                parse_threshold_expr(&expr_cfg.source).map_err(|error| Error::InvalidThreshold {
                    metric: key.clone(),
                    error,
                })?;

            let observed = match lookup {
                Some((id, kind)) => {
                    observed_value(metrics, set, id, kind, expr.agg, elapsed, view)
                }
                None => None,
            };

            let (passed, no_data_hit) = match observed {
                Some(v) => (expr.op.compare(v, expr.value), false),
                None => (no_data == NoDataPolicy::Pass, true),
            };

            results.push(ThresholdResult {
                metric: key.clone(),
                expression: expr_cfg.source.clone(),
                observed,
                passed,
                no_data: no_data_hit,
                abort_on_fail: expr_cfg.abort_on_fail,
            });
        }
    }

    Ok(ThresholdReport { results })
}

fn scoped<'a>(metrics: &'a Registry, set: &ThresholdSet, id: MetricId) -> Query<'a> {
    let mut q = metrics.query(id).where_tag_missing(TAG_PHASE);
    for (k, v) in &set.tags {
        q = q.where_tag(k, v);
    }
    q
}

/// `None` means no data for this aggregation.
fn observed_value(
    metrics: &Registry,
    set: &ThresholdSet,
    id: MetricId,
    kind: MetricKind,
    agg: ThresholdAgg,
    elapsed: Duration,
    view: TrendView,
) -> Option<f64> {
    let q = || scoped(metrics, set, id);

    match kind {
        MetricKind::Trend if view == TrendView::Live => {
            let live = q().live_trend();
            match agg {
                ThresholdAgg::Count => (!live.is_empty()).then(|| live.count() as f64),
                ThresholdAgg::Avg => live.mean(),
                ThresholdAgg::Min => live.min(),
                ThresholdAgg::Max => live.max(),
                ThresholdAgg::Med => live.quantile(0.5),
                ThresholdAgg::P(p) => live.quantile(p / 100.0),
                ThresholdAgg::Rate | ThresholdAgg::Value => None,
            }
        }
        MetricKind::Trend => {
            let mut samples = q().trend_samples();
            if samples.is_empty() {
                return None;
            }
            samples.sort_unstable_by(f64::total_cmp);
            let n = samples.len() as f64;
            match agg {
                ThresholdAgg::Count => Some(n),
                ThresholdAgg::Avg => Some(samples.iter().sum::<f64>() / n),
                ThresholdAgg::Min => samples.first().copied(),
                ThresholdAgg::Max => samples.last().copied(),
                ThresholdAgg::Med => volley_metrics::percentile(&samples, 50.0),
                ThresholdAgg::P(p) => volley_metrics::percentile(&samples, p),
                ThresholdAgg::Rate | ThresholdAgg::Value => None,
            }
        }
        MetricKind::Rate => {
            let totals = q().sum_rate_total();
            match agg {
                ThresholdAgg::Rate => totals.rate(),
                ThresholdAgg::Count => (totals.total > 0).then_some(totals.hits as f64),
                _ => None,
            }
        }
        MetricKind::Counter => {
            let total = q().sum_counter_total();
            match agg {
                // A counter that never fired still has a well-defined count.
                ThresholdAgg::Count => Some(total as f64),
                ThresholdAgg::Rate => {
                    (!elapsed.is_zero()).then(|| volley_metrics::per_sec(total, elapsed.as_secs_f64()))
                }
                _ => None,
            }
        }
        MetricKind::Gauge => match agg {
            ThresholdAgg::Value | ThresholdAgg::Max | ThresholdAgg::Min => {
                q().max_gauge().map(|v| v as f64)
            }
            _ => None,
        },
    }
}
