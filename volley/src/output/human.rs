use std::sync::Arc;

mod duration;
mod format;
mod progress;
mod summary;

use duration::format_duration_single;
use format::{format_observed, format_rate};
use progress::{HumanProgress, ProgressTarget};
use summary::render;

use volley_core::{LoadProfile, LoadProgress, ProgressUpdate, RunOutcome, RunPlan};

use super::OutputFormatter;

pub(crate) struct HumanReadableOutput {
    progress: Arc<HumanProgress>,
}

impl HumanReadableOutput {
    pub(crate) fn new() -> Self {
        Self {
            progress: Arc::new(HumanProgress::new()),
        }
    }
}

impl OutputFormatter for HumanReadableOutput {
    fn print_header(&self, plan_path: &std::path::Path, plan: &RunPlan) {
        println!("plan: {}", plan_path.display());
        println!("load: {}", describe_profile(&plan.config.profile));

        let total_weight: f64 = plan.scenarios.iter().map(|s| s.weight).sum();
        for s in &plan.scenarios {
            let share = if total_weight > 0.0 {
                s.weight / total_weight * 100.0
            } else {
                0.0
            };
            println!(
                "scenario: {} weight={} ({share:.0}%) steps={}",
                s.name,
                s.weight,
                s.steps.len()
            );
        }

        let rules: usize = plan
            .config
            .thresholds
            .iter()
            .map(|t| t.expressions.len())
            .sum();
        if rules > 0 {
            println!("thresholds: {rules} rule(s)");
        }
        if plan.setup.is_some() || plan.teardown.is_some() {
            println!(
                "lifecycle: setup={} teardown={}",
                plan.setup.is_some(),
                plan.teardown.is_some()
            );
        }
        println!();
    }

    fn progress(&self) -> Option<volley_core::ProgressFn> {
        let progress = self.progress.clone();

        Some(Arc::new(move |u| {
            let (target, message) = progress_line(&u);
            progress.update(target, message);
        }))
    }

    fn print_summary(&self, outcome: &RunOutcome) -> anyhow::Result<()> {
        self.progress.finish();
        print!("{}", render(outcome));

        let violations: Vec<_> = outcome.thresholds.violations().collect();
        if !violations.is_empty() {
            eprintln!("thresholds failed:");
            for v in violations {
                eprintln!(
                    "  {}: {} (observed {})",
                    v.metric,
                    v.expression,
                    format_observed(v.observed)
                );
            }
        }
        if outcome.aborted_by_threshold {
            eprintln!("run aborted early by a threshold");
        }
        if let Some(err) = &outcome.teardown_error {
            eprintln!("teardown failed: {err}");
        }

        Ok(())
    }
}

fn describe_profile(profile: &LoadProfile) -> String {
    match profile {
        LoadProfile::Fixed {
            vus,
            duration,
            iterations,
        } => {
            let mut out = format!("vus={vus}");
            if let Some(d) = duration {
                out.push_str(&format!(" duration={}", format_duration_single(*d)));
            }
            if let Some(n) = iterations {
                out.push_str(&format!(" iterations={n}"));
            }
            out
        }
        LoadProfile::Ramping { start_vus, stages } => {
            let stages = stages
                .iter()
                .map(|s| format!("{}->{}", format_duration_single(s.duration), s.target))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "start_vus={start_vus} peak={} stages=[{stages}]",
                profile.max_vus()
            )
        }
    }
}

fn progress_line(u: &ProgressUpdate) -> (ProgressTarget, String) {
    let m = &u.metrics;
    let rates = format!(
        " iters/s={} rps={} errors={}/{}",
        format_rate(m.iterations_per_sec_now),
        format_rate(m.rps_now),
        m.failed_requests_total,
        m.requests_total
    );

    let failing = u
        .thresholds
        .as_ref()
        .map(|t| t.violations().count())
        .unwrap_or(0);
    let thresholds = if failing > 0 {
        format!(" thresholds_failing={failing}")
    } else {
        String::new()
    };

    let vus = format!("vus={}/{}", u.active_vus, u.target_vus);
    let elapsed = format_duration_single(u.elapsed);

    match &u.load {
        LoadProgress::Fixed {
            duration,
            iterations,
            ..
        } => {
            let target = match (duration, iterations) {
                (Some(total), _) => ProgressTarget::Time {
                    total: *total,
                    elapsed: u.elapsed,
                },
                (None, Some(total)) => ProgressTarget::Iterations {
                    total: *total,
                    done: m.iterations_total,
                },
                (None, None) => ProgressTarget::Open,
            };
            (target, format!("{vus} elapsed={elapsed}{rates}{thresholds}"))
        }
        LoadProgress::Ramping {
            total_duration,
            stage,
        } => {
            let stage = stage
                .as_ref()
                .map(|s| {
                    format!(
                        " stage={}/{} stage_remaining={}",
                        s.stage,
                        s.stages,
                        format_duration_single(s.stage_remaining)
                    )
                })
                .unwrap_or_default();
            (
                ProgressTarget::Time {
                    total: *total_duration,
                    elapsed: u.elapsed,
                },
                format!("{vus}{stage} elapsed={elapsed}{rates}{thresholds}"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use volley_core::{LiveMetrics, Stage};

    #[test]
    fn profile_descriptions() {
        let fixed = LoadProfile::Fixed {
            vus: 10,
            duration: Some(Duration::from_secs(30)),
            iterations: None,
        };
        assert_eq!(describe_profile(&fixed), "vus=10 duration=30s");

        let ramping = LoadProfile::Ramping {
            start_vus: 0,
            stages: vec![
                Stage {
                    duration: Duration::from_secs(30),
                    target: 50,
                },
                Stage {
                    duration: Duration::from_secs(10),
                    target: 0,
                },
            ],
        };
        assert_eq!(
            describe_profile(&ramping),
            "start_vus=0 peak=50 stages=[30s->50, 10s->0]"
        );
    }

    #[test]
    fn iteration_bounded_runs_track_iterations() {
        let update = ProgressUpdate {
            tick: 1,
            elapsed: Duration::from_secs(1),
            target_vus: 2,
            active_vus: 2,
            metrics: LiveMetrics {
                iterations_total: 7,
                ..LiveMetrics::default()
            },
            load: LoadProgress::Fixed {
                vus: 2,
                duration: None,
                iterations: Some(20),
            },
            thresholds: None,
        };

        let (target, message) = progress_line(&update);
        assert_eq!(target, ProgressTarget::Iterations { total: 20, done: 7 });
        assert!(message.starts_with("vus=2/2 elapsed=1s"), "{message}");
    }
}
