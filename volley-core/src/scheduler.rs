use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::config::{LoadProfile, RunConfig};
use crate::error::{Error, Result};
use crate::schedule::RampingSchedule;
use crate::signal::Latch;
use crate::vu::{Control, VuShared, run_vu};

/// How long VU tasks get to observe the hard stop before they are aborted.
const HARD_STOP_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SchedulerReport {
    pub spawned: u64,
    /// In-flight work outlived `graceful_stop` and was cancelled.
    pub hard_stopped: bool,
    /// The run ended early because a stop was requested.
    pub stop_requested: bool,
}

/// Owns the VU population for one run: spawns VUs as the target grows, parks them as it
/// shrinks, and winds everything down when the profile ends or a stop is requested.
pub(crate) struct Scheduler<'a> {
    pub config: &'a RunConfig,
    pub shared: Arc<VuShared>,
    pub control: watch::Sender<Control>,
    pub stop_requested: &'a Latch,
}

impl Scheduler<'_> {
    pub(crate) async fn run(self, started: Instant) -> Result<SchedulerReport> {
        let mut vus: JoinSet<()> = JoinSet::new();
        let mut spawned: u64 = 0;
        let mut first_error: Option<Error> = None;

        match &self.config.profile {
            LoadProfile::Fixed { vus: n, duration, .. } => {
                self.publish_target(*n);
                self.spawn_up_to(&mut vus, &mut spawned, *n);

                let all_done = drain(&mut vus, &mut first_error);
                match duration {
                    // An empty population idles out the duration.
                    Some(d) if *n == 0 => tokio::select! {
                        _ = tokio::time::sleep(*d) => {}
                        _ = self.stop_requested.wait() => {}
                    },
                    Some(d) => tokio::select! {
                        _ = tokio::time::sleep(*d) => {}
                        _ = self.stop_requested.wait() => {}
                        _ = all_done => {}
                    },
                    None => tokio::select! {
                        _ = self.stop_requested.wait() => {}
                        _ = all_done => {}
                    },
                }
            }
            LoadProfile::Ramping { start_vus, stages } => {
                let schedule = RampingSchedule::new(*start_vus, stages.clone());
                let mut end = pin!(tokio::time::sleep_until(
                    (started + schedule.total_duration()).into()
                ));
                let mut ticker = tokio::time::interval(self.config.control_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = self.stop_requested.wait() => break,
                        _ = &mut end => break,
                        _ = ticker.tick() => {}
                    }

                    let target = schedule.target_at(started.elapsed());
                    self.publish_target(target);
                    self.spawn_up_to(&mut vus, &mut spawned, target);
                    reap_finished(&mut vus, &mut first_error);
                }
            }
        }

        let stop_requested = self.stop_requested.is_set();
        let hard_stopped = self.stop(&mut vus, &mut first_error).await;

        match first_error {
            Some(err) => Err(err),
            None => Ok(SchedulerReport {
                spawned,
                hard_stopped,
                stop_requested,
            }),
        }
    }

    fn publish_target(&self, target: u64) {
        self.control.send_if_modified(|c| {
            if c.target == target {
                return false;
            }
            tracing::debug!(from = c.target, to = target, "vu target changed");
            c.target = target;
            true
        });
    }

    fn spawn_up_to(&self, vus: &mut JoinSet<()>, spawned: &mut u64, target: u64) {
        while *spawned < target {
            *spawned += 1;
            vus.spawn(run_vu(
                *spawned,
                self.shared.clone(),
                self.control.subscribe(),
            ));
        }
        if let Some(g) = self.shared.metrics.vus_max_handle() {
            g.raise_gauge(i64::try_from(*spawned).unwrap_or(i64::MAX));
        }
    }

    /// Graceful then hard stop. Returns whether the hard stop was needed.
    async fn stop(&self, vus: &mut JoinSet<()>, first_error: &mut Option<Error>) -> bool {
        self.control.send_modify(|c| c.stopping = true);
        tracing::debug!(
            graceful_stop = ?self.config.graceful_stop,
            "stopping; waiting for in-flight iterations"
        );

        if tokio::time::timeout(self.config.graceful_stop, drain(vus, first_error))
            .await
            .is_ok()
        {
            return false;
        }

        tracing::warn!(
            in_flight = vus.len(),
            "graceful stop expired; cancelling in-flight requests"
        );
        self.shared.hard_stop.set();
        if tokio::time::timeout(HARD_STOP_DRAIN, drain(vus, first_error))
            .await
            .is_err()
        {
            vus.abort_all();
            drain(vus, first_error).await;
        }
        true
    }
}

/// Waits for every VU task; keeps the first panic as the run error.
async fn drain(vus: &mut JoinSet<()>, first_error: &mut Option<Error>) {
    while let Some(res) = vus.join_next().await {
        record_join(res, first_error);
    }
}

fn reap_finished(vus: &mut JoinSet<()>, first_error: &mut Option<Error>) {
    while let Some(res) = vus.try_join_next() {
        record_join(res, first_error);
    }
}

fn record_join(res: std::result::Result<(), tokio::task::JoinError>, first_error: &mut Option<Error>) {
    if let Err(e) = res
        && !e.is_cancelled()
    {
        tracing::error!(error = %e, "virtual user task failed");
        first_error.get_or_insert(Error::Join(e));
    }
}
