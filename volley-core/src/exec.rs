use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng as _;
use rand::rngs::StdRng;
use serde_json::{Map, Value};
use volley_http::{HttpClient, HttpRequest, HttpTransportErrorKind};

use crate::config::EnvVars;
use crate::json_path;
use crate::metrics::{BuiltinMetrics, RequestOutcome, SampleTags};
use crate::scenario::{Extract, HttpStep, Step, StepKind, Think};
use crate::signal::Latch;
use crate::template::{JsonTemplate, Scope};

/// Variables and last response of one iteration; dropped when the iteration ends.
#[derive(Debug, Clone, Default)]
pub struct IterationState {
    vars: Map<String, Value>,
    last_status: Option<u16>,
    last_json: Option<Value>,
}

impl IterationState {
    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn remove_var(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    /// Appends to a list variable, creating it (or wrapping a scalar) as needed.
    pub fn push_var(&mut self, name: &str, value: Value) {
        match self.vars.get_mut(name) {
            Some(Value::Array(items)) => items.push(value),
            Some(Value::Null) | None => {
                self.vars.insert(name.to_string(), Value::Array(vec![value]));
            }
            Some(other) => {
                let prev = other.take();
                *other = Value::Array(vec![prev, value]);
            }
        }
    }

    pub fn last_status(&self) -> Option<u16> {
        self.last_status
    }

    /// Parsed body of the most recent response, if it was JSON.
    pub fn last_json(&self) -> Option<&Value> {
        self.last_json.as_ref()
    }

    fn set_last_response(&mut self, status: Option<u16>, json: Option<Value>) {
        self.last_status = status;
        self.last_json = json;
    }

    pub(crate) fn into_vars(self) -> Map<String, Value> {
        self.vars
    }
}

/// How a step sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// A fatal step failed; the rest of the sequence is skipped.
    Abort(String),
    /// Hard stop interrupted an in-flight call or think.
    Cancelled,
}

/// Runs steps for one iteration (or one lifecycle phase).
pub(crate) struct Executor<'a> {
    pub client: &'a HttpClient,
    pub metrics: &'a BuiltinMetrics,
    pub env: &'a EnvVars,
    pub setup: &'a Value,
    pub run_id: &'a str,
    pub request_timeout: Option<Duration>,
    pub hard_stop: Option<&'a Latch>,
    /// Scenario name, or the phase name for setup/teardown.
    pub scenario: &'a str,
    pub phase: Option<&'a str>,
    /// Lifecycle mode: every failed status, check or transport error is fatal.
    pub strict: bool,
    pub vu: u64,
    pub iteration: u64,
    pub index: Option<u64>,
}

impl<'a> Executor<'a> {
    fn scope<'s>(&'s self, state: &'s IterationState) -> Scope<'s> {
        Scope {
            setup: self.setup,
            vars: &state.vars,
            env: self.env,
            vu: self.vu,
            iteration: self.iteration,
            index: self.index,
            run_id: self.run_id,
            scenario: self.scenario,
        }
    }

    fn sample<'s>(&'s self, step: &'s str) -> SampleTags<'s> {
        match self.phase {
            Some(phase) => SampleTags::lifecycle(phase, step),
            None => SampleTags::scenario(self.scenario, step),
        }
    }

    /// Renders `vars` in order; later bindings see earlier ones.
    pub(crate) fn bind_vars(
        &self,
        vars: &[(String, JsonTemplate)],
        state: &mut IterationState,
        rng: &mut StdRng,
    ) {
        for (name, template) in vars {
            let value = template.render(&self.scope(state), rng);
            state.set_var(name.clone(), value);
        }
    }

    pub(crate) fn render(&self, template: &JsonTemplate, state: &IterationState, rng: &mut StdRng) -> Value {
        template.render(&self.scope(state), rng)
    }

    pub(crate) async fn run_steps(
        &self,
        steps: &[Step],
        state: &mut IterationState,
        rng: &mut StdRng,
    ) -> Flow {
        for step in steps {
            match self.run_step(step, state, rng).await {
                Flow::Continue => {}
                other => return other,
            }
        }
        Flow::Continue
    }

    pub(crate) async fn run_step(
        &self,
        step: &Step,
        state: &mut IterationState,
        rng: &mut StdRng,
    ) -> Flow {
        if let Some(guard) = &step.guard
            && !guard.allows(state)
        {
            tracing::trace!(step = %step.name, "guard false, step skipped");
            return Flow::Continue;
        }

        match &step.kind {
            StepKind::Http(http) => self.run_http(&step.name, http, state, rng).await,
            StepKind::Think(think) => self.run_think(think, rng).await,
            StepKind::Extract(extract) => {
                run_extract(extract, state);
                Flow::Continue
            }
        }
    }

    async fn run_http(
        &self,
        step_name: &str,
        http: &HttpStep,
        state: &mut IterationState,
        rng: &mut StdRng,
    ) -> Flow {
        let req = {
            let scope = self.scope(state);
            let mut req = HttpRequest::new(http.method.clone(), http.url.render(&scope, rng))
                .with_timeout(http.timeout.or(self.request_timeout));
            for (name, value) in &http.headers {
                req = req.with_header(name.clone(), value.render(&scope, rng));
            }
            if let Some(body) = &http.body {
                let body = body.render(&scope, rng);
                req = req.with_json_body(Bytes::from(body.to_string()));
            }
            req
        };

        let started = Instant::now();
        let result = match self.hard_stop {
            Some(stop) => tokio::select! {
                biased;
                _ = stop.wait() => Err(volley_http::Error::Cancelled),
                r = self.client.request(req) => r,
            },
            None => self.client.request(req).await,
        };
        let latency = started.elapsed();

        let sample = self.sample(step_name);
        let method = http.method.as_str();
        let fatal = http.fatal || self.strict;
        let expected = http.expected_statuses.as_deref();

        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                let kind = err.transport_error_kind();
                let outcome = RequestOutcome {
                    status: None,
                    error: Some(kind),
                    latency,
                    bytes_sent: 0,
                    bytes_received: 0,
                };
                self.metrics.record_request(sample, method, &outcome, expected);
                state.set_last_response(None, None);

                if kind == HttpTransportErrorKind::Cancelled {
                    return Flow::Cancelled;
                }
                tracing::debug!(step = step_name, error = %err, "request failed");
                for check in &http.checks {
                    self.metrics.record_check(sample, &check.name, false);
                }
                return if fatal {
                    Flow::Abort(format!("step `{step_name}`: {err}"))
                } else {
                    Flow::Continue
                };
            }
        };

        let outcome = RequestOutcome {
            status: Some(resp.status),
            error: None,
            latency,
            bytes_sent: resp.bytes_sent,
            bytes_received: resp.bytes_received,
        };
        self.metrics.record_request(sample, method, &outcome, expected);

        let json = serde_json::from_slice::<Value>(&resp.body).ok();
        let mut failed_check: Option<&str> = None;
        for check in &http.checks {
            let passed = check.evaluate(&resp, json.as_ref());
            self.metrics.record_check(sample, &check.name, passed);
            if !passed && failed_check.is_none() {
                failed_check = Some(&check.name);
            }
        }
        state.set_last_response(Some(resp.status), json);

        if fatal && let Some(check) = failed_check {
            return Flow::Abort(format!(
                "step `{step_name}`: check `{check}` failed (status {})",
                resp.status
            ));
        }
        if self.strict && outcome.is_failure(expected) {
            return Flow::Abort(format!(
                "step `{step_name}`: unexpected status {}",
                resp.status
            ));
        }
        Flow::Continue
    }

    async fn run_think(&self, think: &Think, rng: &mut StdRng) -> Flow {
        let extra = think
            .jitter
            .filter(|j| !j.is_zero())
            .map(|j| j.mul_f64(rng.gen_range(0.0..=1.0)))
            .unwrap_or_default();
        let total = think.duration.saturating_add(extra);
        if total.is_zero() {
            return Flow::Continue;
        }

        match self.hard_stop {
            Some(stop) => tokio::select! {
                biased;
                _ = stop.wait() => Flow::Cancelled,
                _ = tokio::time::sleep(total) => Flow::Continue,
            },
            None => {
                tokio::time::sleep(total).await;
                Flow::Continue
            }
        }
    }
}

fn run_extract(extract: &Extract, state: &mut IterationState) {
    let found = state
        .last_json()
        .and_then(|v| json_path::lookup(v, &extract.path))
        .cloned();

    match (found, extract.collect) {
        (Some(v), true) => state.push_var(&extract.var, v),
        (Some(v), false) => state.set_var(extract.var.clone(), v),
        (None, true) => {}
        (None, false) => {
            state.remove_var(&extract.var);
        }
    }
}
