use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::SeedableRng as _;
use rand::rngs::StdRng;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use volley_http::HttpClient;
use volley_metrics::Registry;

use crate::config::{LoadProfile, NoDataPolicy, RunConfig};
use crate::error::{Error, Result};
use crate::gate::IterationGate;
use crate::metrics::BuiltinMetrics;
use crate::progress::{LiveSampler, LoadProgress, ProgressFn, ProgressUpdate};
use crate::scenario::Scenario;
use crate::schedule::RampingSchedule;
use crate::scheduler::Scheduler;
use crate::selection::ScenarioTable;
use crate::setup::{LifecycleContext, Setup, SetupContext, Teardown};
use crate::signal::Latch;
use crate::summary::RunSummary;
use crate::template::random_uuid;
use crate::thresholds::{ThresholdSet, validate_thresholds};
use crate::thresholds_eval::{ThresholdReport, evaluate_thresholds, evaluate_thresholds_live};
use crate::vu::{Control, VuShared};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Everything needed to execute one run.
#[derive(Clone)]
pub struct RunPlan {
    pub config: RunConfig,
    pub scenarios: Vec<Scenario>,
    pub setup: Option<Arc<dyn Setup>>,
    pub teardown: Option<Arc<dyn Teardown>>,
}

impl std::fmt::Debug for RunPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunPlan")
            .field("config", &self.config)
            .field("scenarios", &self.scenarios)
            .field("setup", &self.setup.is_some())
            .field("teardown", &self.teardown.is_some())
            .finish()
    }
}

impl RunPlan {
    pub fn new(config: RunConfig, scenarios: Vec<Scenario>) -> Self {
        Self {
            config,
            scenarios,
            setup: None,
            teardown: None,
        }
    }

    #[must_use]
    pub fn with_setup(mut self, setup: impl Setup + 'static) -> Self {
        self.setup = Some(Arc::new(setup));
        self
    }

    #[must_use]
    pub fn with_teardown(mut self, teardown: impl Teardown + 'static) -> Self {
        self.teardown = Some(Arc::new(teardown));
        self
    }

    /// Load-time validation: shape, scenario table and thresholds.
    pub fn validate(&self) -> Result<()> {
        validate_profile(&self.config.profile)?;
        ScenarioTable::new(self.scenarios.clone())?;
        validate_thresholds(&self.config.thresholds)
    }
}

fn validate_profile(profile: &LoadProfile) -> Result<()> {
    match profile {
        LoadProfile::Fixed {
            vus,
            duration,
            iterations,
        } => {
            if duration.is_some_and(|d| d.is_zero()) {
                return Err(Error::InvalidDuration("duration"));
            }
            match iterations {
                Some(0) => Err(Error::InvalidIterations),
                None if duration.is_none() && *vus > 0 => Err(Error::InvalidDuration("duration")),
                _ => Ok(()),
            }
        }
        LoadProfile::Ramping { .. } => {
            if profile.total_duration().is_none_or(|d| d.is_zero()) {
                return Err(Error::InvalidStages);
            }
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub thresholds: ThresholdReport,
    /// Teardown failed; threshold verdicts are unaffected.
    pub teardown_error: Option<String>,
    /// An `abortOnFail` threshold stopped the run early.
    pub aborted_by_threshold: bool,
    /// In-flight work outlived the graceful stop and was cancelled.
    pub hard_stopped: bool,
}

impl RunOutcome {
    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.passed()
    }

    pub fn checks_failed(&self) -> u64 {
        self.summary.checks_failed()
    }
}

fn make_run_id(seed: Option<u64>) -> String {
    match seed {
        Some(seed) => random_uuid(&mut StdRng::seed_from_u64(seed)),
        None => uuid::Uuid::new_v4().to_string(),
    }
}

/// Setup, then the VU population until the profile ends, then teardown and verdicts.
///
/// Setup failure aborts before any VU starts. Per-request failures never end the run.
pub async fn run(plan: RunPlan, client: HttpClient, progress: Option<ProgressFn>) -> Result<RunOutcome> {
    plan.validate()?;
    let RunPlan {
        config,
        scenarios,
        setup,
        teardown,
    } = plan;

    let table = ScenarioTable::new(scenarios)?;
    let scenario_names: Vec<String> = table.scenarios().map(|s| s.name.clone()).collect();

    let registry = Arc::new(Registry::default());
    let metrics = BuiltinMetrics::register(registry.clone());
    let run_id: Arc<str> = Arc::from(make_run_id(config.seed));

    let lifecycle = LifecycleContext {
        client: client.clone(),
        metrics: metrics.clone(),
        env: config.env.clone(),
        run_id: run_id.clone(),
        request_timeout: config.request_timeout,
        seed: config.seed,
    };

    let setup_data = match &setup {
        Some(setup) => {
            tracing::info!(run_id = %run_id, "running setup");
            let data = setup.setup(&lifecycle).await.map_err(|e| match e {
                Error::SetupFailed(_) => e,
                other => Error::SetupFailed(other.to_string()),
            })?;
            tracing::info!("setup finished");
            data
        }
        None => SetupContext::default(),
    };

    let gate = match &config.profile {
        LoadProfile::Fixed {
            iterations: Some(n),
            ..
        } => Some(IterationGate::new(*n)),
        _ => None,
    };

    let shared = Arc::new(VuShared {
        client,
        metrics: metrics.clone(),
        scenarios: table,
        setup: setup_data.clone(),
        env: config.env.clone(),
        run_id: run_id.clone(),
        request_timeout: config.request_timeout,
        seed: config.seed,
        gate,
        hard_stop: Latch::new(),
    });

    let (control_tx, control_rx) = watch::channel(Control::default());
    let stop_requested = Arc::new(Latch::new());
    let started = Instant::now();

    let monitor = spawn_monitor(Monitor {
        metrics: metrics.clone(),
        thresholds: config.thresholds.clone(),
        no_data: config.no_data,
        profile: config.profile.clone(),
        control: control_rx,
        stop_requested: stop_requested.clone(),
        progress,
        started,
    });

    tracing::info!(profile = ?config.profile, "starting virtual users");
    let scheduled = Scheduler {
        config: &config,
        shared,
        control: control_tx,
        stop_requested: &stop_requested,
    }
    .run(started)
    .await;
    let elapsed = started.elapsed();

    if let Some(h) = monitor {
        h.abort();
        let _ = h.await;
    }
    if let Ok(report) = &scheduled {
        tracing::info!(
            elapsed = ?elapsed,
            vus = report.spawned,
            hard_stopped = report.hard_stopped,
            "virtual users finished"
        );
    }

    let (scheduled, teardown_error) = teardown_then(
        scheduled,
        run_teardown(teardown.as_deref(), &lifecycle, &setup_data),
    )
    .await?;

    let thresholds = evaluate_thresholds(&registry, &config.thresholds, config.no_data, elapsed)?;
    let summary = RunSummary::collect(
        &metrics,
        &run_id,
        scenario_names.iter().map(String::as_str),
        elapsed,
    );

    Ok(RunOutcome {
        summary,
        aborted_by_threshold: scheduled.stop_requested && thresholds.should_abort(),
        thresholds,
        teardown_error,
        hard_stopped: scheduled.hard_stopped,
    })
}

async fn run_teardown(
    teardown: Option<&dyn Teardown>,
    lifecycle: &LifecycleContext,
    setup_data: &SetupContext,
) -> Option<String> {
    let teardown = teardown?;
    match teardown.teardown(lifecycle, setup_data).await {
        Ok(()) => None,
        Err(e) => {
            tracing::warn!(error = %e, "teardown failed");
            Some(e.to_string())
        }
    }
}

/// Runs teardown whatever the scheduler returned; a scheduler error surfaces afterwards.
async fn teardown_then<T>(
    scheduled: Result<T>,
    teardown: impl Future<Output = Option<String>>,
) -> Result<(T, Option<String>)> {
    let teardown_error = teardown.await;
    Ok((scheduled?, teardown_error))
}

struct Monitor {
    metrics: BuiltinMetrics,
    thresholds: Vec<ThresholdSet>,
    no_data: NoDataPolicy,
    profile: LoadProfile,
    control: watch::Receiver<Control>,
    stop_requested: Arc<Latch>,
    progress: Option<ProgressFn>,
    started: Instant,
}

/// Per-second progress emission and live threshold evaluation; `None` when neither is needed.
fn spawn_monitor(m: Monitor) -> Option<tokio::task::JoinHandle<()>> {
    let aborting = m
        .thresholds
        .iter()
        .any(|s| s.expressions.iter().any(|e| e.abort_on_fail));
    if m.progress.is_none() && !aborting {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        let schedule = match &m.profile {
            LoadProfile::Ramping { start_vus, stages } => {
                Some(RampingSchedule::new(*start_vus, stages.clone()))
            }
            LoadProfile::Fixed { .. } => None,
        };
        let mut sampler = LiveSampler::new(m.started);
        let mut tick: u64 = 0;

        loop {
            interval.tick().await;
            tick = tick.saturating_add(1);
            let elapsed = m.started.elapsed();

            let report = if m.thresholds.is_empty() {
                None
            } else {
                let registry = m.metrics.registry();
                match evaluate_thresholds_live(registry, &m.thresholds, m.no_data, elapsed) {
                    Ok(r) => Some(r),
                    Err(e) => {
                        tracing::warn!(error = %e, "live threshold evaluation failed");
                        None
                    }
                }
            };

            if let Some(r) = &report
                && r.should_abort()
                && !m.stop_requested.is_set()
            {
                for v in r.violations().filter(|v| v.abort_on_fail && !v.no_data) {
                    tracing::warn!(
                        metric = %v.metric,
                        expression = %v.expression,
                        observed = ?v.observed,
                        "threshold crossed with abortOnFail; stopping run"
                    );
                }
                m.stop_requested.set();
            }

            let Some(progress) = &m.progress else {
                continue;
            };

            let load = match (&m.profile, &schedule) {
                (
                    LoadProfile::Fixed {
                        vus,
                        duration,
                        iterations,
                    },
                    _,
                ) => LoadProgress::Fixed {
                    vus: *vus,
                    duration: *duration,
                    iterations: *iterations,
                },
                (LoadProfile::Ramping { .. }, schedule) => LoadProgress::Ramping {
                    total_duration: schedule
                        .as_ref()
                        .map(RampingSchedule::total_duration)
                        .unwrap_or_default(),
                    stage: schedule
                        .as_ref()
                        .and_then(|s| s.stage_snapshot_at(elapsed))
                        .map(Into::into),
                },
            };

            let active_vus = m
                .metrics
                .vus_handle()
                .map(|h| u64::try_from(h.get_gauge()).unwrap_or(0))
                .unwrap_or(0);

            (progress)(ProgressUpdate {
                tick,
                elapsed,
                target_vus: m.control.borrow().target,
                active_vus,
                metrics: sampler.sample(&m.metrics),
                load,
                thresholds: report,
            });
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Stage;

    #[test]
    fn profile_validation() {
        assert!(validate_profile(&LoadProfile::Fixed {
            vus: 1,
            duration: None,
            iterations: Some(1)
        })
        .is_ok());
        assert!(matches!(
            validate_profile(&LoadProfile::Fixed {
                vus: 1,
                duration: None,
                iterations: None
            }),
            Err(Error::InvalidDuration(_))
        ));
        assert!(matches!(
            validate_profile(&LoadProfile::Ramping {
                start_vus: 3,
                stages: vec![Stage {
                    duration: Duration::ZERO,
                    target: 3
                }]
            }),
            Err(Error::InvalidStages)
        ));
    }

    #[test]
    fn zero_vu_profiles_are_valid() {
        for profile in [
            LoadProfile::Fixed {
                vus: 0,
                duration: Some(Duration::from_secs(1)),
                iterations: None,
            },
            LoadProfile::Fixed {
                vus: 0,
                duration: None,
                iterations: None,
            },
            LoadProfile::Ramping {
                start_vus: 0,
                stages: vec![Stage {
                    duration: Duration::from_secs(1),
                    target: 0,
                }],
            },
        ] {
            assert!(validate_profile(&profile).is_ok(), "{profile:?}");
        }
    }

    #[tokio::test]
    async fn teardown_runs_before_a_vu_failure_surfaces() {
        let crashed: tokio::task::JoinHandle<()> = tokio::spawn(async { panic!("vu crashed") });
        let join_err = match crashed.await {
            Ok(()) => panic!("expected a join error"),
            Err(e) => e,
        };

        let ran = std::sync::atomic::AtomicBool::new(false);
        let res = teardown_then(Err::<(), _>(Error::Join(join_err)), async {
            ran.store(true, std::sync::atomic::Ordering::SeqCst);
            Some("cleanup failed".to_string())
        })
        .await;

        assert!(matches!(res, Err(Error::Join(_))), "{res:?}");
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));

        let (value, teardown_error) = teardown_then(Ok(7), async { None })
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(value, 7);
        assert!(teardown_error.is_none());
    }

    #[test]
    fn seeded_run_ids_repeat() {
        assert_eq!(make_run_id(Some(9)), make_run_id(Some(9)));
        assert_ne!(make_run_id(None), make_run_id(None));
    }
}
