use std::collections::HashMap;
use std::sync::atomic::Ordering;

use smallvec::SmallVec;

use crate::key::KeyId;
use crate::metrics::MetricStorage;
use crate::registry::{MetricId, Registry};
use crate::tags::TagSet;
use crate::trend::{LiveTrend, TrendSummary};

#[derive(Debug, Clone, Copy)]
enum TagFilter {
    Eq(KeyId, KeyId),
    Missing(KeyId),
    /// A selector on a key or value that was never interned: nothing can match.
    Never,
}

impl TagFilter {
    fn matches(&self, tags: &TagSet) -> bool {
        match *self {
            TagFilter::Eq(k, v) => tags.get(k) == Some(v),
            TagFilter::Missing(k) => tags.get(k).is_none(),
            TagFilter::Never => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub total: u64,
}

impl CounterSnapshot {
    pub fn new(total: u64) -> Self {
        Self { total }
    }

    pub fn delta_since(self, prev: Option<Self>) -> u64 {
        match prev {
            Some(prev) => self.total.saturating_sub(prev.total),
            None => self.total,
        }
    }
}

#[inline]
pub fn per_sec(delta: u64, dt_secs: f64) -> f64 {
    delta as f64 / dt_secs.max(1e-9)
}

/// Totals of a rate metric across the matched series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateTotals {
    pub total: u64,
    pub hits: u64,
}

impl RateTotals {
    pub fn rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.hits as f64 / self.total as f64)
    }
}

/// Read-side filter/group builder over the series of a single metric.
#[derive(Debug, Clone)]
pub struct Query<'a> {
    registry: &'a Registry,
    metric: MetricId,
    filters: SmallVec<[TagFilter; 4]>,
    group_keys: SmallVec<[KeyId; 4]>,
}

impl<'a> Query<'a> {
    pub(crate) fn new(registry: &'a Registry, metric: MetricId) -> Self {
        Self {
            registry,
            metric,
            filters: SmallVec::new(),
            group_keys: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn where_eq(mut self, key: KeyId, value: KeyId) -> Self {
        self.filters.push(TagFilter::Eq(key, value));
        self
    }

    #[must_use]
    pub fn where_missing(mut self, key: KeyId) -> Self {
        self.filters.push(TagFilter::Missing(key));
        self
    }

    /// String form of [`Query::where_eq`] that does not intern unknown keys or values.
    #[must_use]
    pub fn where_tag(self, key: &str, value: &str) -> Self {
        match (self.registry.lookup_key(key), self.registry.lookup_key(value)) {
            (Some(k), Some(v)) => self.where_eq(k, v),
            _ => {
                let mut q = self;
                q.filters.push(TagFilter::Never);
                q
            }
        }
    }

    /// String form of [`Query::where_missing`]. A key that was never interned is missing
    /// from every series, so the filter is dropped.
    #[must_use]
    pub fn where_tag_missing(self, key: &str) -> Self {
        match self.registry.lookup_key(key) {
            Some(k) => self.where_missing(k),
            None => self,
        }
    }

    #[must_use]
    pub fn group_by(mut self, keys: impl IntoIterator<Item = KeyId>) -> Self {
        self.group_keys = keys.into_iter().collect();
        self.group_keys.sort_unstable();
        self.group_keys.dedup();
        self
    }

    fn matches(&self, tags: &TagSet) -> bool {
        self.filters.iter().all(|f| f.matches(tags))
    }

    fn group_key(&self, tags: &TagSet) -> TagSet {
        tags.project(&self.group_keys)
    }

    pub fn sum_counter(self) -> HashMap<TagSet, u64> {
        let mut out: HashMap<TagSet, u64> = HashMap::new();

        self.registry.visit_series(self.metric, |tags, storage| {
            if !self.matches(tags) {
                return;
            }
            let MetricStorage::Counter(c) = storage else {
                return;
            };

            let v = c.load(Ordering::Relaxed);
            if v == 0 {
                return;
            }

            let k = self.group_key(tags);
            let cur = out.entry(k).or_default();
            *cur = cur.saturating_add(v);
        });

        out
    }

    pub fn sum_counter_total(self) -> u64 {
        self.sum_counter().values().copied().sum()
    }

    /// Highest gauge value across matched series.
    pub fn max_gauge(self) -> Option<i64> {
        let mut out: Option<i64> = None;
        self.registry.visit_series(self.metric, |tags, storage| {
            if !self.matches(tags) {
                return;
            }
            if let MetricStorage::Gauge(g) = storage {
                let v = g.load(Ordering::Relaxed);
                out = Some(out.map_or(v, |cur| cur.max(v)));
            }
        });
        out
    }

    pub fn sum_rate(self) -> HashMap<TagSet, RateTotals> {
        let mut out: HashMap<TagSet, RateTotals> = HashMap::new();

        self.registry.visit_series(self.metric, |tags, storage| {
            if !self.matches(tags) {
                return;
            }
            let MetricStorage::Rate(r) = storage else {
                return;
            };

            let (total, hits) = r.load();
            let acc = out.entry(self.group_key(tags)).or_default();
            acc.total = acc.total.saturating_add(total);
            acc.hits = acc.hits.saturating_add(hits);
        });

        out
    }

    pub fn sum_rate_total(self) -> RateTotals {
        self.sum_rate()
            .into_values()
            .fold(RateTotals::default(), |acc, r| RateTotals {
                total: acc.total.saturating_add(r.total),
                hits: acc.hits.saturating_add(r.hits),
            })
    }

    /// Every sample of the matched trend series, unsorted.
    pub fn trend_samples(self) -> Vec<f64> {
        let mut out = Vec::new();
        self.registry.visit_series(self.metric, |tags, storage| {
            if !self.matches(tags) {
                return;
            }
            if let MetricStorage::Trend(t) = storage {
                out.extend_from_slice(t.lock().samples());
            }
        });
        out
    }

    pub fn trend_summary(self) -> TrendSummary {
        let mut samples = self.trend_samples();
        TrendSummary::from_samples(&mut samples)
    }

    /// Merged live histograms of the matched trend series.
    pub fn live_trend(self) -> LiveTrend {
        let mut acc = LiveTrend::default();
        self.registry.visit_series(self.metric, |tags, storage| {
            if !self.matches(tags) {
                return;
            }
            if let MetricStorage::Trend(t) = storage {
                acc.merge(&t.lock());
            }
        });
        acc
    }

    /// Approximate quantiles from the live histograms, cheap enough for per-second progress.
    pub fn live_trend_quantiles(self, quantiles: &[f64]) -> Vec<Option<f64>> {
        let live = self.live_trend();
        quantiles.iter().map(|q| live.quantile(*q)).collect()
    }
}
