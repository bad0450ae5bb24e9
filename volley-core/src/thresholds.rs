use std::fmt;

use volley_metrics::MetricKind;

use crate::error::{Error, Result};
use crate::metrics::builtin_kind;

/// One expression of a threshold rule, as written in the plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExprConfig {
    pub source: String,
    /// Stop the run as soon as a live evaluation sees this expression fail.
    pub abort_on_fail: bool,
}

impl ThresholdExprConfig {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            abort_on_fail: false,
        }
    }

    pub fn aborting(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            abort_on_fail: true,
        }
    }
}

/// Threshold rules attached to one metric (optionally narrowed by a tag selector).
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSet {
    pub metric: String,
    /// `metric{k=v,...}` selector; every pair must match a series tag.
    pub tags: Vec<(String, String)>,
    pub expressions: Vec<ThresholdExprConfig>,
}

impl ThresholdSet {
    /// Builds a set from a plan key such as `http_req_duration{scenario=create_merge}`.
    pub fn from_key(key: &str, expressions: Vec<ThresholdExprConfig>) -> Result<Self> {
        let (metric, tags) = parse_key(key).map_err(|error| Error::InvalidThreshold {
            metric: key.to_string(),
            error,
        })?;
        Ok(Self {
            metric,
            tags,
            expressions,
        })
    }

    pub fn display_key(&self) -> String {
        if self.tags.is_empty() {
            return self.metric.clone();
        }
        let selector = self
            .tags
            .iter()
            .map(|(k, v)| {
                if v.contains([',', '"']) {
                    format!("{k}='{v}'")
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        format!("{}{{{selector}}}", self.metric)
    }
}

/// Parses `metric` or `metric{k=v,...}`. Values may be quoted with `"` or `'` to carry
/// commas, e.g. `checks{check="status is 200, body ok"}`.
fn parse_key(key: &str) -> std::result::Result<(String, Vec<(String, String)>), String> {
    let key = key.trim();
    let Some(open) = key.find('{') else {
        if key.is_empty() {
            return Err("empty metric name".to_string());
        }
        return Ok((key.to_string(), Vec::new()));
    };

    let metric = key[..open].trim();
    let Some(inner) = key[open + 1..].strip_suffix('}') else {
        return Err(format!("unterminated tag selector in `{key}`"));
    };
    if metric.is_empty() {
        return Err("empty metric name".to_string());
    }

    let mut tags = Vec::new();
    for pair in split_selector(inner)?
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        let Some((k, v)) = pair.split_once(['=', ':']) else {
            return Err(format!("tag selector entry `{pair}` must be key=value"));
        };
        let k = k.trim();
        if k.is_empty() {
            return Err(format!("tag selector entry `{pair}` has an empty key"));
        }
        tags.push((k.to_string(), unquote(v.trim()).to_string()));
    }
    if tags.is_empty() {
        return Err(format!("empty tag selector in `{key}`"));
    }

    Ok((metric.to_string(), tags))
}

/// Splits on commas outside quotes.
fn split_selector(inner: &str) -> std::result::Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, ',') => {
                parts.push(&inner[start..i]);
                start = i + 1;
            }
            (None, _) => {}
        }
    }
    if quote.is_some() {
        return Err(format!("unterminated quote in tag selector `{inner}`"));
    }
    parts.push(&inner[start..]);
    Ok(parts)
}

fn unquote(v: &str) -> &str {
    for q in ['"', '\''] {
        if let Some(inner) = v.strip_prefix(q).and_then(|v| v.strip_suffix(q)) {
            return inner;
        }
    }
    v
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
}

impl ThresholdOp {
    pub fn compare(self, observed: f64, expected: f64) -> bool {
        match self {
            ThresholdOp::Lt => observed < expected,
            ThresholdOp::Lte => observed <= expected,
            ThresholdOp::Gt => observed > expected,
            ThresholdOp::Gte => observed >= expected,
            ThresholdOp::Eq => observed == expected,
            ThresholdOp::Ne => observed != expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdAgg {
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
    Value,
    P(f64),
}

impl ThresholdAgg {
    /// Whether this aggregation is defined for a metric of `kind`.
    pub fn applies_to(self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Trend => matches!(
                self,
                Self::Avg | Self::Min | Self::Max | Self::Med | Self::Count | Self::P(_)
            ),
            MetricKind::Rate => matches!(self, Self::Rate | Self::Count),
            MetricKind::Counter => matches!(self, Self::Count | Self::Rate),
            MetricKind::Gauge => matches!(self, Self::Value | Self::Min | Self::Max),
        }
    }
}

impl fmt::Display for ThresholdAgg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Value => f.write_str("value"),
            Self::P(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpr {
    pub agg: ThresholdAgg,
    pub op: ThresholdOp,
    pub value: f64,
}

pub fn parse_threshold_expr(raw: &str) -> std::result::Result<ThresholdExpr, String> {
    let s: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return Err("empty threshold".to_string());
    }

    // Two-character operators first so `<=` is not read as `<`.
    let ops = [
        ("<=", ThresholdOp::Lte),
        (">=", ThresholdOp::Gte),
        ("==", ThresholdOp::Eq),
        ("!=", ThresholdOp::Ne),
        ("<", ThresholdOp::Lt),
        (">", ThresholdOp::Gt),
    ];
    let (op_pos, op_len, op) = ops
        .iter()
        .find_map(|(tok, op)| s.find(tok).map(|pos| (pos, tok.len(), *op)))
        .ok_or_else(|| format!("invalid threshold (missing operator): {raw}"))?;

    let (left, right_with_op) = s.split_at(op_pos);
    let right = &right_with_op[op_len..];
    if left.is_empty() || right.is_empty() {
        return Err(format!("invalid threshold: {raw}"));
    }

    let agg = match left.to_ascii_lowercase().as_str() {
        "avg" => ThresholdAgg::Avg,
        "min" => ThresholdAgg::Min,
        "max" => ThresholdAgg::Max,
        "med" => ThresholdAgg::Med,
        "count" => ThresholdAgg::Count,
        "rate" => ThresholdAgg::Rate,
        "value" => ThresholdAgg::Value,
        other => {
            let Some(inner) = other.strip_prefix("p(").and_then(|v| v.strip_suffix(')')) else {
                return Err(format!("unknown aggregation `{left}` in threshold: {raw}"));
            };
            let p: f64 = inner
                .parse()
                .map_err(|_| format!("invalid percentile in threshold: {raw}"))?;
            if !(p > 0.0 && p <= 100.0) {
                return Err(format!("percentile out of range in threshold: {raw}"));
            }
            ThresholdAgg::P(p)
        }
    };

    let value: f64 = right
        .parse()
        .map_err(|_| format!("invalid numeric value in threshold: {raw}"))?;
    if !value.is_finite() {
        return Err(format!("invalid numeric value in threshold: {raw}"));
    }

    Ok(ThresholdExpr { agg, op, value })
}

/// Rejects unparsable expressions, unknown metrics and aggregations the metric kind lacks.
pub fn validate_thresholds(sets: &[ThresholdSet]) -> Result<()> {
    for set in sets {
        let invalid = |error: String| Error::InvalidThreshold {
            metric: set.display_key(),
            error,
        };

        let kind = builtin_kind(&set.metric)
            .ok_or_else(|| invalid(format!("unknown metric `{}`", set.metric)))?;

        if set.expressions.is_empty() {
            return Err(invalid("no expressions".to_string()));
        }

        for expr in &set.expressions {
            let parsed = parse_threshold_expr(&expr.source).map_err(invalid)?;
            if !parsed.agg.applies_to(kind) {
                return Err(invalid(format!(
                    "aggregation `{}` is not available for {kind} metrics",
                    parsed.agg
                )));
            }
        }
    }
    Ok(())
}
