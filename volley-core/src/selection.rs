use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;

use crate::error::{Error, Result};
use crate::scenario::Scenario;

/// Cumulative-weight dispatch table over the run's scenarios.
///
/// Entry `i` owns the half-open interval `[bound[i-1], bound[i])` of `[0, total)`.
#[derive(Debug, Clone)]
pub struct ScenarioTable {
    entries: Vec<(f64, Arc<Scenario>)>,
    total: f64,
}

impl ScenarioTable {
    pub fn new(scenarios: Vec<Scenario>) -> Result<Self> {
        if scenarios.is_empty() {
            return Err(Error::NoScenarios);
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(scenarios.len());
        let mut total = 0.0;
        for scenario in scenarios {
            if !(scenario.weight.is_finite() && scenario.weight > 0.0) {
                return Err(Error::InvalidWeight {
                    scenario: scenario.name,
                    weight: scenario.weight,
                });
            }
            if !seen.insert(scenario.name.clone()) {
                return Err(Error::DuplicateScenario(scenario.name));
            }
            total += scenario.weight;
            if !total.is_finite() {
                return Err(Error::WeightOverflow);
            }
            entries.push((total, Arc::new(scenario)));
        }

        Ok(Self { entries, total })
    }

    pub fn total_weight(&self) -> f64 {
        self.total
    }

    pub fn scenarios(&self) -> impl Iterator<Item = &Arc<Scenario>> {
        self.entries.iter().map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scenario owning `u`, for `u` in `[0, total)`. Values at or past `total` (float drift)
    /// map to the last entry.
    pub fn pick_at(&self, u: f64) -> &Arc<Scenario> {
        let idx = self.entries.partition_point(|(bound, _)| *bound <= u);
        let idx = idx.min(self.entries.len() - 1);
        &self.entries[idx].1
    }

    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> &Arc<Scenario> {
        if self.entries.len() == 1 {
            return &self.entries[0].1;
        }
        self.pick_at(rng.gen_range(0.0..self.total))
    }
}
