use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng as _;
use rand::rngs::StdRng;
use serde_json::Value;
use volley_http::HttpClient;

use crate::config::{EnvVars, env_lookup};
use crate::error::{Error, Result};
use crate::exec::{Executor, Flow, IterationState};
use crate::metrics::BuiltinMetrics;
use crate::scenario::Step;
use crate::template::JsonTemplate;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const PHASE_SETUP: &str = "setup";
pub const PHASE_TEARDOWN: &str = "teardown";

/// Fixture data produced once by setup and shared read-only with every VU.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetupContext(Arc<Value>);

impl SetupContext {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(value))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }
}

/// What setup and teardown get to work with.
#[derive(Debug, Clone)]
pub struct LifecycleContext {
    pub(crate) client: HttpClient,
    pub(crate) metrics: BuiltinMetrics,
    pub(crate) env: EnvVars,
    pub(crate) run_id: Arc<str>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) seed: Option<u64>,
}

impl LifecycleContext {
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        env_lookup(&self.env, name)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
}

pub trait Setup: Send + Sync {
    fn setup<'a>(&'a self, ctx: &'a LifecycleContext) -> BoxFuture<'a, Result<SetupContext>>;
}

pub trait Teardown: Send + Sync {
    fn teardown<'a>(
        &'a self,
        ctx: &'a LifecycleContext,
        data: &'a SetupContext,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Setup that hands out a fixed value.
#[derive(Debug, Clone)]
pub struct StaticSetup(pub Value);

impl Setup for StaticSetup {
    fn setup<'a>(&'a self, _ctx: &'a LifecycleContext) -> BoxFuture<'a, Result<SetupContext>> {
        Box::pin(async move { Ok(SetupContext::new(self.0.clone())) })
    }
}

#[derive(Debug, Clone)]
struct LifecycleStep {
    steps: Vec<Step>,
    repeat: u64,
}

/// Plan-driven setup or teardown: steps run once in order, any failure is fatal.
///
/// `repeat: n` runs a step `n` times with `{{index}}` bound to `0..n`. The result is the
/// `output` template rendered against the final variables, or the variables themselves.
#[derive(Debug, Clone, Default)]
pub struct StepLifecycle {
    steps: Vec<LifecycleStep>,
    output: Option<JsonTemplate>,
}

impl StepLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_step(self, step: Step) -> Self {
        self.with_repeated_step(step, 1)
    }

    #[must_use]
    pub fn with_repeated_step(self, step: Step, repeat: u64) -> Self {
        self.with_repeated_steps([step], repeat)
    }

    /// Runs `steps` in order, `repeat` times over, with `{{index}}` bound per pass.
    #[must_use]
    pub fn with_repeated_steps(mut self, steps: impl IntoIterator<Item = Step>, repeat: u64) -> Self {
        self.steps.push(LifecycleStep {
            steps: steps.into_iter().collect(),
            repeat,
        });
        self
    }

    pub fn with_output(mut self, output: &Value) -> Result<Self> {
        self.output = Some(JsonTemplate::compile(output)?);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    async fn execute(
        &self,
        ctx: &LifecycleContext,
        phase: &'static str,
        setup: &Value,
    ) -> std::result::Result<Value, String> {
        let mut rng = match ctx.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut state = IterationState::default();

        let mut exec = Executor {
            client: &ctx.client,
            metrics: &ctx.metrics,
            env: &ctx.env,
            setup,
            run_id: &ctx.run_id,
            request_timeout: ctx.request_timeout,
            hard_stop: None,
            scenario: phase,
            phase: Some(phase),
            strict: true,
            vu: 0,
            iteration: 0,
            index: None,
        };

        for LifecycleStep { steps, repeat } in &self.steps {
            for i in 0..*repeat {
                exec.index = Some(i);
                for step in steps {
                    match exec.run_step(step, &mut state, &mut rng).await {
                        Flow::Continue => {}
                        Flow::Abort(reason) => return Err(reason),
                        Flow::Cancelled => {
                            return Err(format!("step `{}` was cancelled", step.name));
                        }
                    }
                }
            }
        }

        exec.index = None;
        Ok(match &self.output {
            Some(output) => exec.render(output, &state, &mut rng),
            None => Value::Object(state.into_vars()),
        })
    }
}

impl Setup for StepLifecycle {
    fn setup<'a>(&'a self, ctx: &'a LifecycleContext) -> BoxFuture<'a, Result<SetupContext>> {
        Box::pin(async move {
            let value = self
                .execute(ctx, PHASE_SETUP, &Value::Null)
                .await
                .map_err(Error::SetupFailed)?;
            Ok(SetupContext::new(value))
        })
    }
}

impl Teardown for StepLifecycle {
    fn teardown<'a>(
        &'a self,
        ctx: &'a LifecycleContext,
        data: &'a SetupContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.execute(ctx, PHASE_TEARDOWN, data.value())
                .await
                .map(|_| ())
                .map_err(Error::TeardownFailed)
        })
    }
}
