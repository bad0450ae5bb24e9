use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::trend::Trend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

#[derive(Debug, Default)]
pub struct Rate {
    pub total: AtomicU64,
    pub hits: AtomicU64,
}

impl Rate {
    pub fn load(&self) -> (u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.hits.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug)]
pub(crate) enum MetricStorage {
    Counter(Arc<AtomicU64>),
    Gauge(Arc<AtomicI64>),
    Rate(Arc<Rate>),
    Trend(Arc<Mutex<Trend>>),
}

impl MetricStorage {
    pub(crate) fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(Arc::default()),
            MetricKind::Gauge => Self::Gauge(Arc::default()),
            MetricKind::Rate => Self::Rate(Arc::default()),
            MetricKind::Trend => Self::Trend(Arc::default()),
        }
    }

    pub(crate) fn handle(&self) -> MetricHandle {
        match self {
            Self::Counter(a) => MetricHandle::Counter(a.clone()),
            Self::Gauge(a) => MetricHandle::Gauge(a.clone()),
            Self::Rate(a) => MetricHandle::Rate(a.clone()),
            Self::Trend(a) => MetricHandle::Trend(a.clone()),
        }
    }
}

/// Write handle for one series. Cloning is cheap; all operations are thread-safe.
///
/// Operations that don't match the handle's kind are ignored.
#[derive(Debug, Clone)]
pub enum MetricHandle {
    Counter(Arc<AtomicU64>),
    Gauge(Arc<AtomicI64>),
    Rate(Arc<Rate>),
    Trend(Arc<Mutex<Trend>>),
}

impl MetricHandle {
    #[inline]
    pub fn increment(&self, value: u64) {
        if let MetricHandle::Counter(c) = self {
            c.fetch_add(value, Ordering::Relaxed);
        }
    }

    /// Adds `delta` and returns the new gauge value.
    #[inline]
    pub fn add_gauge(&self, delta: i64) -> i64 {
        if let MetricHandle::Gauge(g) = self {
            g.fetch_add(delta, Ordering::Relaxed).saturating_add(delta)
        } else {
            0
        }
    }

    /// Raises the gauge to `value` if it is currently lower.
    pub fn raise_gauge(&self, value: i64) {
        if let MetricHandle::Gauge(g) = self {
            g.fetch_max(value, Ordering::Relaxed);
        }
    }

    /// Records one observation into a rate; `hit` is the predicate evaluated by the caller.
    #[inline]
    pub fn record_rate(&self, hit: bool) {
        self.add_rate(u64::from(hit), 1);
    }

    #[inline]
    pub fn add_rate(&self, hits: u64, total: u64) {
        if let MetricHandle::Rate(r) = self {
            r.hits.fetch_add(hits, Ordering::Relaxed);
            r.total.fetch_add(total, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn observe(&self, value: f64) {
        if let MetricHandle::Trend(t) = self {
            t.lock().record(value);
        }
    }

    pub fn get_gauge(&self) -> i64 {
        if let MetricHandle::Gauge(g) = self {
            g.load(Ordering::Relaxed)
        } else {
            0
        }
    }
}
