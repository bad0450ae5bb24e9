use std::time::Duration;

use crate::config::Stage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSnapshot {
    pub index: usize,
    pub count: usize,
    pub stage_elapsed: Duration,
    pub stage_remaining: Duration,
    pub start_target: u64,
    pub end_target: u64,
    pub current_target: u64,
}

/// Piecewise-linear VU target over cumulative stage boundaries.
///
/// Stage `i` ramps from the previous stage's target (or `start` for the first stage) to its own
/// target across its duration. Past the last boundary the last target holds.
#[derive(Debug, Clone)]
pub struct RampingSchedule {
    start: u64,
    stages: Vec<Stage>,
    cumulative_ends: Vec<Duration>,
}

impl RampingSchedule {
    pub fn new(start: u64, stages: Vec<Stage>) -> Self {
        let mut cumulative_ends = Vec::with_capacity(stages.len());
        let mut acc = Duration::ZERO;
        for s in &stages {
            acc = acc.saturating_add(s.duration);
            cumulative_ends.push(acc);
        }

        Self {
            start,
            stages,
            cumulative_ends,
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.cumulative_ends
            .last()
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Index of the stage covering `elapsed` (a boundary instant belongs to the stage it ends).
    fn stage_index(&self, elapsed: Duration) -> usize {
        match self
            .cumulative_ends
            .binary_search_by(|end| end.cmp(&elapsed))
        {
            Ok(i) | Err(i) => i.min(self.stages.len().saturating_sub(1)),
        }
    }

    fn stage_bounds(&self, idx: usize) -> (Duration, Duration, u64, u64) {
        let stage_start = if idx == 0 {
            Duration::ZERO
        } else {
            self.cumulative_ends[idx - 1]
        };
        let start_target = if idx == 0 {
            self.start
        } else {
            self.stages[idx - 1].target
        };
        (
            stage_start,
            self.cumulative_ends[idx],
            start_target,
            self.stages[idx].target,
        )
    }

    /// Exact interpolated target, before rounding to a whole VU count.
    pub fn exact_target_at(&self, elapsed: Duration) -> f64 {
        if self.stages.is_empty() || elapsed.is_zero() {
            return self.start as f64;
        }
        if elapsed >= self.total_duration() {
            return self.stages.last().map_or(self.start, |s| s.target) as f64;
        }

        let idx = self.stage_index(elapsed);
        let (stage_start, stage_end, start_target, end_target) = self.stage_bounds(idx);
        let stage_duration = stage_end.saturating_sub(stage_start);
        if stage_duration.is_zero() {
            return end_target as f64;
        }

        let frac = elapsed.saturating_sub(stage_start).as_secs_f64() / stage_duration.as_secs_f64();
        start_target as f64 + (end_target as f64 - start_target as f64) * frac
    }

    /// Target VU count at `elapsed`, rounded to the nearest integer.
    pub fn target_at(&self, elapsed: Duration) -> u64 {
        let exact = self.exact_target_at(elapsed);
        exact.round().clamp(0.0, u64::MAX as f64) as u64
    }

    pub fn stage_snapshot_at(&self, elapsed: Duration) -> Option<StageSnapshot> {
        if self.stages.is_empty() {
            return None;
        }

        let clamped = elapsed.min(self.total_duration());
        let idx = self.stage_index(clamped);
        let (stage_start, stage_end, start_target, end_target) = self.stage_bounds(idx);

        let stage_duration = stage_end.saturating_sub(stage_start);
        let stage_elapsed = clamped.saturating_sub(stage_start).min(stage_duration);

        Some(StageSnapshot {
            index: idx,
            count: self.stages.len(),
            stage_elapsed,
            stage_remaining: stage_duration.saturating_sub(stage_elapsed),
            start_target,
            end_target,
            current_target: self.target_at(clamped),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heavy() -> RampingSchedule {
        RampingSchedule::new(
            0,
            vec![
                Stage {
                    duration: Duration::from_secs(30),
                    target: 50,
                },
                Stage {
                    duration: Duration::from_secs(60),
                    target: 50,
                },
                Stage {
                    duration: Duration::from_secs(10),
                    target: 0,
                },
            ],
        )
    }

    #[test]
    fn total_duration_sums_stages() {
        let s = heavy();
        assert_eq!(s.total_duration(), Duration::from_secs(100));
        assert_eq!(s.target_at(Duration::from_secs(100)), 0);
    }

    #[test]
    fn target_follows_linear_interpolation_within_one() {
        let s = heavy();
        for ms in (0..=100_000u64).step_by(250) {
            let t = Duration::from_millis(ms);
            let secs = t.as_secs_f64();
            let expected = if secs <= 30.0 {
                50.0 * secs / 30.0
            } else if secs <= 90.0 {
                50.0
            } else {
                50.0 * (100.0 - secs) / 10.0
            };
            let got = s.target_at(t) as f64;
            assert!(
                (got - expected).abs() <= 1.0,
                "t={secs}s expected≈{expected} got {got}"
            );
        }
    }

    #[test]
    fn boundaries_and_past_end() {
        let s = heavy();
        assert_eq!(s.target_at(Duration::ZERO), 0);
        assert_eq!(s.target_at(Duration::from_secs(15)), 25);
        assert_eq!(s.target_at(Duration::from_secs(30)), 50);
        assert_eq!(s.target_at(Duration::from_secs(95)), 25);
        assert_eq!(s.target_at(Duration::from_secs(100)), 0);
        assert_eq!(s.target_at(Duration::from_secs(500)), 0);
    }

    #[test]
    fn zero_length_stage_jumps_to_target() {
        let s = RampingSchedule::new(
            2,
            vec![
                Stage {
                    duration: Duration::ZERO,
                    target: 10,
                },
                Stage {
                    duration: Duration::from_secs(10),
                    target: 10,
                },
            ],
        );
        assert_eq!(s.target_at(Duration::from_millis(1)), 10);
        assert_eq!(s.target_at(Duration::ZERO), 2);
    }

    #[test]
    fn stage_snapshot_reports_position() {
        let s = heavy();
        let snap = s
            .stage_snapshot_at(Duration::from_secs(45))
            .unwrap_or_else(|| panic!("expected snapshot"));
        assert_eq!(snap.index, 1);
        assert_eq!(snap.count, 3);
        assert_eq!(snap.stage_elapsed, Duration::from_secs(15));
        assert_eq!(snap.stage_remaining, Duration::from_secs(45));
        assert_eq!((snap.start_target, snap.end_target), (50, 50));

        let end = s
            .stage_snapshot_at(Duration::from_secs(1_000))
            .unwrap_or_else(|| panic!("expected snapshot"));
        assert_eq!(end.index, 2);
        assert_eq!(end.stage_remaining, Duration::ZERO);
        assert_eq!(end.current_target, 0);

        assert!(RampingSchedule::new(3, vec![]).stage_snapshot_at(Duration::ZERO).is_none());
    }
}
