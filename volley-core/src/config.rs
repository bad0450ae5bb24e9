use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::thresholds::ThresholdSet;

pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_CONTROL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub type EnvVars = Arc<[(Arc<str>, Arc<str>)]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
}

/// How a threshold rule is resolved when its metric has no samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum NoDataPolicy {
    /// Vacuously satisfied.
    #[default]
    Pass,
    Fail,
}

/// Shape of the VU population over time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadProfile {
    /// Constant `vus` for `duration`, or until `iterations` (shared across VUs) are done.
    Fixed {
        vus: u64,
        duration: Option<Duration>,
        iterations: Option<u64>,
    },
    /// Piecewise-linear ramp of active VUs, starting at `start_vus`.
    Ramping { start_vus: u64, stages: Vec<Stage> },
}

impl LoadProfile {
    pub fn max_vus(&self) -> u64 {
        match self {
            Self::Fixed { vus, .. } => *vus,
            Self::Ramping { start_vus, stages } => stages
                .iter()
                .map(|s| s.target)
                .max()
                .unwrap_or(0)
                .max(*start_vus),
        }
    }

    /// `None` for iteration-bounded runs.
    pub fn total_duration(&self) -> Option<Duration> {
        match self {
            Self::Fixed { duration, .. } => *duration,
            Self::Ramping { stages, .. } => Some(
                stages
                    .iter()
                    .fold(Duration::ZERO, |acc, s| acc.saturating_add(s.duration)),
            ),
        }
    }
}

/// Fully resolved, validated configuration of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub profile: LoadProfile,
    pub thresholds: Vec<ThresholdSet>,
    pub graceful_stop: Duration,
    pub control_interval: Duration,
    pub no_data: NoDataPolicy,
    pub request_timeout: Option<Duration>,
    /// Seeds per-VU scenario selection, template `random` and `uuid`; `None` uses entropy.
    pub seed: Option<u64>,
    pub env: EnvVars,
}

impl RunConfig {
    pub fn fixed(vus: u64, duration: Duration) -> Self {
        Self::with_profile(LoadProfile::Fixed {
            vus,
            duration: Some(duration),
            iterations: None,
        })
    }

    pub fn with_profile(profile: LoadProfile) -> Self {
        Self {
            profile,
            thresholds: Vec::new(),
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            control_interval: DEFAULT_CONTROL_INTERVAL,
            no_data: NoDataPolicy::default(),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            seed: None,
            env: Arc::from([]),
        }
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        env_lookup(&self.env, name)
    }
}

pub(crate) fn env_lookup<'a>(env: &'a EnvVars, name: &str) -> Option<&'a str> {
    env.iter()
        .rev()
        .find(|(k, _)| k.as_ref() == name)
        .map(|(_, v)| v.as_ref())
}

/// Run options as written in a plan file; everything is optional.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub vus: Option<u64>,
    pub duration: Option<Duration>,
    pub iterations: Option<u64>,
    pub start_vus: Option<u64>,
    pub stages: Vec<Stage>,
    pub thresholds: Vec<ThresholdSet>,
    pub graceful_stop: Option<Duration>,
    pub control_interval: Option<Duration>,
    pub no_data: Option<NoDataPolicy>,
    pub request_timeout: Option<Duration>,
}

/// Command-line overrides; these win over plan options.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub vus: Option<u64>,
    pub duration: Option<Duration>,
    pub iterations: Option<u64>,
    pub seed: Option<u64>,
    pub no_data: Option<NoDataPolicy>,
}

impl CliOverrides {
    fn overrides_shape(&self) -> bool {
        self.vus.is_some() || self.duration.is_some() || self.iterations.is_some()
    }
}

/// Resolves plan options and CLI overrides into a validated [`RunConfig`].
///
/// Precedence is CLI > plan > defaults. Explicit `--vus/--duration/--iterations` turn a
/// staged plan into a fixed one. Without a duration or stages, each VU runs one iteration.
pub fn resolve_run_config(opts: RunOptions, cli: &CliOverrides, env: EnvVars) -> Result<RunConfig> {
    let use_stages = !opts.stages.is_empty() && !cli.overrides_shape();

    let profile = if use_stages {
        if opts.iterations.is_some() {
            return Err(Error::InvalidIterations);
        }
        let profile = LoadProfile::Ramping {
            start_vus: opts.start_vus.unwrap_or(0),
            stages: opts.stages,
        };
        if profile.total_duration().is_none_or(|d| d.is_zero()) {
            return Err(Error::InvalidStages);
        }
        profile
    } else {
        let vus = cli.vus.or(opts.vus).unwrap_or(1);

        let duration = cli.duration.or(opts.duration);
        if duration.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidDuration("duration"));
        }

        let iterations = cli
            .iterations
            .or(opts.iterations)
            .or_else(|| duration.is_none().then_some(vus).filter(|n| *n > 0));
        if iterations == Some(0) {
            return Err(Error::InvalidIterations);
        }

        LoadProfile::Fixed {
            vus,
            duration,
            iterations,
        }
    };

    let control_interval = opts.control_interval.unwrap_or(DEFAULT_CONTROL_INTERVAL);
    if control_interval.is_zero() {
        return Err(Error::InvalidDuration("controlInterval"));
    }

    crate::thresholds::validate_thresholds(&opts.thresholds)?;

    Ok(RunConfig {
        profile,
        thresholds: opts.thresholds,
        graceful_stop: opts.graceful_stop.unwrap_or(DEFAULT_GRACEFUL_STOP),
        control_interval,
        no_data: cli.no_data.or(opts.no_data).unwrap_or_default(),
        request_timeout: Some(opts.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
            .filter(|d| !d.is_zero()),
        seed: cli.seed,
        env,
    })
}
