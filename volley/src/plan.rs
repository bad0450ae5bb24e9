use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::Value;
use volley_core::{
    Check, CliOverrides, EnvVars, Guard, HttpStep, NoDataPolicy, RunOptions, RunPlan, Scenario,
    Stage, Step, StepLifecycle, ThresholdExprConfig, ThresholdSet, resolve_run_config,
};

/// A plan file: run options, optional setup/teardown and the scenario mix.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct PlanYaml {
    #[serde(default)]
    pub options: OptionsYaml,

    #[serde(default)]
    pub setup: Option<LifecycleYaml>,

    #[serde(default)]
    pub teardown: Option<LifecycleYaml>,

    pub scenarios: Vec<ScenarioYaml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct OptionsYaml {
    pub vus: Option<u64>,
    pub iterations: Option<u64>,

    #[serde(default)]
    pub duration: Option<YamlDuration>,

    #[serde(rename = "startVUs")]
    pub start_vus: Option<u64>,

    #[serde(default)]
    pub stages: Vec<StageYaml>,

    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdExprYaml>,

    #[serde(default)]
    pub graceful_stop: Option<YamlDuration>,

    #[serde(default)]
    pub control_interval: Option<YamlDuration>,

    pub no_data: Option<String>,

    #[serde(default)]
    pub request_timeout: Option<YamlDuration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct StageYaml {
    pub target: u64,
    pub duration: YamlDuration,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct YamlDuration(Duration);

impl YamlDuration {
    fn into_inner(self) -> Duration {
        self.0
    }
}

impl<'de> Deserialize<'de> for YamlDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = YamlDuration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("duration as string (e.g. 10s), integer seconds, or float seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(YamlDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v)
                    .map(|v| YamlDuration(Duration::from_secs(v)))
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("duration must be a non-negative, finite number"));
                }
                Ok(YamlDuration(Duration::from_secs_f64(v)))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let d = humantime::parse_duration(v).map_err(E::custom)?;
                Ok(YamlDuration(d))
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// `metric: "p(95)<300"`, or a list mixing plain expressions and `{threshold, abortOnFail}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ThresholdExprYaml {
    Many(Vec<ThresholdItemYaml>),
    One(ThresholdItemYaml),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ThresholdItemYaml {
    Expr(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
    },
}

impl From<ThresholdItemYaml> for ThresholdExprConfig {
    fn from(item: ThresholdItemYaml) -> Self {
        match item {
            ThresholdItemYaml::Expr(source) => ThresholdExprConfig::new(source),
            ThresholdItemYaml::Detailed {
                threshold,
                abort_on_fail,
            } => ThresholdExprConfig {
                source: threshold,
                abort_on_fail,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(v) => vec![v],
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct LifecycleYaml {
    #[serde(default)]
    pub steps: Vec<StepYaml>,

    /// Templated result; defaults to the collected variables.
    #[serde(default)]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct ScenarioYaml {
    pub name: String,

    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Bound in declaration order at iteration start.
    #[serde(default)]
    pub vars: serde_yaml::Mapping,

    pub steps: Vec<StepYaml>,
}

fn default_weight() -> f64 {
    1.0
}

/// One entry of a step list: exactly one of `request`, `think` or `extract`.
///
/// A request may carry `extract` too; the extractions then run right after it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct StepYaml {
    pub name: Option<String>,

    #[serde(rename = "if")]
    pub guard: Option<GuardYaml>,

    pub request: Option<RequestYaml>,

    #[serde(default)]
    pub checks: Vec<CheckYaml>,

    #[serde(default)]
    pub fatal: bool,

    #[serde(default)]
    pub think: Option<YamlDuration>,

    #[serde(default)]
    pub jitter: Option<YamlDuration>,

    pub extract: Option<OneOrMany<ExtractYaml>>,

    /// Setup/teardown only.
    pub repeat: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct GuardYaml {
    pub present: Option<String>,
    pub absent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct RequestYaml {
    #[serde(default = "default_method")]
    pub method: String,

    pub url: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub body: Option<Value>,

    #[serde(default)]
    pub timeout: Option<YamlDuration>,

    pub expected_statuses: Option<OneOrMany<u16>>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct CheckYaml {
    pub name: Option<String>,
    pub status: Option<OneOrMany<u16>>,
    pub json_path: Option<String>,
    pub equals: Option<Value>,
    pub body_contains: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct ExtractYaml {
    pub var: String,
    pub path: String,

    #[serde(default)]
    pub collect: bool,
}

pub(crate) async fn load_plan(path: &Path) -> anyhow::Result<PlanYaml> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read plan: {}", path.display()))?;

    serde_yaml::from_slice(&bytes).with_context(|| format!("failed to parse plan: {}", path.display()))
}

impl PlanYaml {
    /// Builds the engine plan; CLI overrides win over `options`.
    pub(crate) fn into_run_plan(self, cli: &CliOverrides, env: EnvVars) -> anyhow::Result<RunPlan> {
        let options = self.options.into_run_options()?;
        let config = resolve_run_config(options, cli, env).context("invalid options")?;

        let scenarios = self
            .scenarios
            .into_iter()
            .map(ScenarioYaml::into_scenario)
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut plan = RunPlan::new(config, scenarios);
        if let Some(setup) = self.setup {
            plan = plan.with_setup(setup.into_lifecycle("setup")?);
        }
        if let Some(teardown) = self.teardown {
            plan = plan.with_teardown(teardown.into_lifecycle("teardown")?);
        }

        plan.validate().context("invalid plan")?;
        Ok(plan)
    }
}

impl OptionsYaml {
    fn into_run_options(self) -> anyhow::Result<RunOptions> {
        let no_data = self
            .no_data
            .as_deref()
            .map(|raw| {
                raw.parse::<NoDataPolicy>()
                    .map_err(|_| anyhow::anyhow!("invalid noData `{raw}` (expected pass or fail)"))
            })
            .transpose()?;

        Ok(RunOptions {
            vus: self.vus,
            duration: self.duration.map(YamlDuration::into_inner),
            iterations: self.iterations,
            start_vus: self.start_vus,
            stages: self
                .stages
                .into_iter()
                .map(|s| Stage {
                    duration: s.duration.into_inner(),
                    target: s.target,
                })
                .collect(),
            thresholds: parse_thresholds_map(self.thresholds)?,
            graceful_stop: self.graceful_stop.map(YamlDuration::into_inner),
            control_interval: self.control_interval.map(YamlDuration::into_inner),
            no_data,
            request_timeout: self.request_timeout.map(YamlDuration::into_inner),
        })
    }
}

fn parse_thresholds_map(
    raw: BTreeMap<String, ThresholdExprYaml>,
) -> anyhow::Result<Vec<ThresholdSet>> {
    raw.into_iter()
        .map(|(metric_key, v)| {
            let expressions = match v {
                ThresholdExprYaml::One(item) => vec![item.into()],
                ThresholdExprYaml::Many(items) => items.into_iter().map(Into::into).collect(),
            };
            ThresholdSet::from_key(&metric_key, expressions)
                .with_context(|| format!("invalid thresholds for `{metric_key}`"))
        })
        .collect()
}

impl ScenarioYaml {
    fn into_scenario(self) -> anyhow::Result<Scenario> {
        let ctx = || format!("scenario `{}`", self.name);
        let mut scenario = Scenario::new(self.name.clone(), self.weight);

        for (key, value) in &self.vars {
            let name = key
                .as_str()
                .with_context(|| format!("{}: var names must be strings", ctx()))?;
            let value = serde_json::to_value(value)
                .with_context(|| format!("{}: var `{name}` is not JSON-compatible", ctx()))?;
            scenario = scenario
                .with_var(name, &value)
                .with_context(|| format!("{}: var `{name}`", ctx()))?;
        }

        for (idx, step) in self.steps.into_iter().enumerate() {
            if step.repeat.is_some() {
                anyhow::bail!("{}: `repeat` is only allowed in setup/teardown", ctx());
            }
            for s in step
                .into_steps(idx)
                .with_context(|| format!("{}: step {}", ctx(), idx + 1))?
            {
                scenario = scenario.with_step(s);
            }
        }

        Ok(scenario)
    }
}

impl LifecycleYaml {
    fn into_lifecycle(self, phase: &str) -> anyhow::Result<StepLifecycle> {
        let mut lifecycle = StepLifecycle::new();

        for (idx, step) in self.steps.into_iter().enumerate() {
            let repeat = step.repeat.unwrap_or(1);
            let steps = step
                .into_steps(idx)
                .with_context(|| format!("{phase}: step {}", idx + 1))?;
            lifecycle = lifecycle.with_repeated_steps(steps, repeat);
        }

        if let Some(output) = &self.output {
            lifecycle = lifecycle
                .with_output(output)
                .with_context(|| format!("{phase}: output"))?;
        }

        Ok(lifecycle)
    }
}

impl StepYaml {
    /// Expands one plan step into engine steps (a request plus its extractions).
    fn into_steps(self, idx: usize) -> anyhow::Result<Vec<Step>> {
        let guard = self.guard.map(GuardYaml::into_guard).transpose()?;
        let extracts = self.extract.map(OneOrMany::into_vec).unwrap_or_default();

        let mut out = match (self.request, self.think) {
            (Some(_), Some(_)) => anyhow::bail!("a step cannot both `request` and `think`"),
            (Some(request), None) => {
                let name = self.name.unwrap_or_else(|| format!("step_{}", idx + 1));
                let mut http = request.into_http_step()?;
                for check in self.checks {
                    http = http.with_check(check.into_check()?);
                }
                if self.fatal {
                    http = http.fatal();
                }
                vec![Step::http(name, http)]
            }
            (None, Some(duration)) => {
                if !self.checks.is_empty() || self.fatal {
                    anyhow::bail!("`checks` and `fatal` need a `request`");
                }
                let name = self.name.unwrap_or_else(|| "think".to_string());
                vec![Step::think(
                    name,
                    duration.into_inner(),
                    self.jitter.map(YamlDuration::into_inner),
                )]
            }
            (None, None) => {
                if extracts.is_empty() {
                    anyhow::bail!("step needs one of `request`, `think` or `extract`");
                }
                Vec::new()
            }
        };

        for e in extracts {
            let step = Step::extract(format!("extract_{}", e.var), e.var, e.path)?;
            out.push(if e.collect { step.collecting() } else { step });
        }

        Ok(match guard {
            Some(guard) => out.into_iter().map(|s| s.with_guard(guard.clone())).collect(),
            None => out,
        })
    }
}

impl GuardYaml {
    fn into_guard(self) -> anyhow::Result<Guard> {
        match (self.present, self.absent) {
            (Some(var), None) => Ok(Guard::Present(var)),
            (None, Some(var)) => Ok(Guard::Absent(var)),
            _ => anyhow::bail!("`if` needs exactly one of `present` or `absent`"),
        }
    }
}

impl RequestYaml {
    fn into_http_step(self) -> anyhow::Result<HttpStep> {
        let mut step = HttpStep::new(&self.method, &self.url)?;
        for (name, value) in &self.headers {
            step = step.with_header(name.clone(), value)?;
        }
        if let Some(body) = &self.body {
            step = step.with_body(body)?;
        }
        if let Some(timeout) = self.timeout {
            step = step.with_timeout(timeout.into_inner());
        }
        if let Some(statuses) = self.expected_statuses {
            step = step.with_expected_statuses(statuses.into_vec());
        }
        Ok(step)
    }
}

impl CheckYaml {
    fn into_check(self) -> anyhow::Result<Check> {
        let check = match (self.status, self.json_path, self.equals, self.body_contains) {
            (Some(codes), None, None, None) => {
                let codes = codes.into_vec();
                let name = self.name.unwrap_or_else(|| {
                    let list = codes
                        .iter()
                        .map(u16::to_string)
                        .collect::<Vec<_>>()
                        .join("|");
                    format!("status is {list}")
                });
                Check::status(name, codes)
            }
            (None, Some(path), None, None) => {
                let name = self.name.unwrap_or_else(|| format!("has {path}"));
                Check::json_path(name, path)?
            }
            (None, Some(path), Some(value), None) => {
                let name = self.name.unwrap_or_else(|| format!("{path} == {value}"));
                Check::json_equals(name, path, value)?
            }
            (None, None, None, Some(needle)) => {
                let name = self
                    .name
                    .unwrap_or_else(|| format!("body contains {needle}"));
                Check::body_contains(name, needle)
            }
            (None, None, Some(_), None) => anyhow::bail!("check `equals` needs `jsonPath`"),
            _ => anyhow::bail!(
                "a check needs exactly one of `status`, `jsonPath` (optionally with `equals`) or `bodyContains`"
            ),
        };
        Ok(check)
    }
}
