use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::SeedableRng as _;
use rand::rngs::StdRng;
use tokio::sync::watch;
use volley_http::HttpClient;
use volley_metrics::MetricHandle;

use crate::config::EnvVars;
use crate::exec::{Executor, Flow, IterationState};
use crate::gate::IterationGate;
use crate::metrics::BuiltinMetrics;
use crate::selection::ScenarioTable;
use crate::setup::SetupContext;
use crate::signal::Latch;

/// Scheduler -> VU control state, published over a watch channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Control {
    /// VUs with `id <= target` run iterations; the rest park.
    pub target: u64,
    /// No new iterations once set.
    pub stopping: bool,
}

/// Everything a VU reads; built once per run.
#[derive(Debug)]
pub(crate) struct VuShared {
    pub client: HttpClient,
    pub metrics: BuiltinMetrics,
    pub scenarios: ScenarioTable,
    pub setup: SetupContext,
    pub env: EnvVars,
    pub run_id: Arc<str>,
    pub request_timeout: Option<Duration>,
    pub seed: Option<u64>,
    pub gate: Option<IterationGate>,
    pub hard_stop: Latch,
}

/// Keeps the `vus` gauge equal to the number of VUs currently running iterations.
struct ActiveVuGuard {
    gauge: Option<MetricHandle>,
}

impl ActiveVuGuard {
    fn enter(metrics: &BuiltinMetrics) -> Self {
        let gauge = metrics.vus_handle();
        if let Some(g) = &gauge {
            g.add_gauge(1);
        }
        Self { gauge }
    }
}

impl Drop for ActiveVuGuard {
    fn drop(&mut self) {
        if let Some(g) = &self.gauge {
            g.add_gauge(-1);
        }
    }
}

/// Per-VU generator: reproducible from the run seed, distinct per VU.
pub(crate) fn vu_rng(seed: Option<u64>, vu: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ vu.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        None => StdRng::from_entropy(),
    }
}

pub(crate) async fn run_vu(id: u64, shared: Arc<VuShared>, mut control: watch::Receiver<Control>) {
    let mut rng = vu_rng(shared.seed, id);
    let mut iteration: u64 = 0;
    let mut active: Option<ActiveVuGuard> = None;

    loop {
        let c = *control.borrow_and_update();
        if c.stopping || shared.hard_stop.is_set() {
            break;
        }

        if id > c.target {
            if active.take().is_some() {
                tracing::trace!(vu = id, "parked");
            }
            if control.changed().await.is_err() {
                break;
            }
            continue;
        }

        if let Some(gate) = &shared.gate
            && !gate.next()
        {
            break;
        }

        if active.is_none() {
            active = Some(ActiveVuGuard::enter(&shared.metrics));
        }

        let completed = run_iteration(&shared, id, iteration, &mut rng).await;
        iteration = iteration.wrapping_add(1);
        if !completed {
            break;
        }
    }
}

/// Runs one scenario end to end; `false` when the hard stop cut it short.
async fn run_iteration(shared: &VuShared, vu: u64, iteration: u64, rng: &mut StdRng) -> bool {
    let scenario = shared.scenarios.pick(rng).clone();
    let started = Instant::now();

    let exec = Executor {
        client: &shared.client,
        metrics: &shared.metrics,
        env: &shared.env,
        setup: shared.setup.value(),
        run_id: &shared.run_id,
        request_timeout: shared.request_timeout,
        hard_stop: Some(&shared.hard_stop),
        scenario: &scenario.name,
        phase: None,
        strict: false,
        vu,
        iteration,
        index: None,
    };

    let mut state = IterationState::default();
    exec.bind_vars(&scenario.vars, &mut state, rng);

    let success = match exec.run_steps(&scenario.steps, &mut state, rng).await {
        Flow::Continue => true,
        Flow::Abort(reason) => {
            tracing::debug!(vu, scenario = %scenario.name, %reason, "iteration aborted");
            false
        }
        Flow::Cancelled => return false,
    };

    shared
        .metrics
        .record_iteration(&scenario.name, started.elapsed(), success);
    true
}
