#![forbid(unsafe_code)]

//! Tagged, thread-safe metric streams for load runs.
//!
//! Four kinds are supported: counters, gauges, rates (hits over total) and trends. Trends
//! keep every sample so that percentile queries at the end of a run are exact.

pub mod key;
pub mod metrics;
pub mod query;
pub mod registry;
pub mod tags;
pub mod trend;

pub use key::KeyId;
pub use metrics::{MetricHandle, MetricKind};
pub use query::{CounterSnapshot, Query, RateTotals, per_sec};
pub use registry::{MetricId, Registry};
pub use tags::TagSet;
pub use trend::{LiveTrend, TrendSummary, percentile};
