#![forbid(unsafe_code)]

mod config;
mod error;
mod exec;
mod gate;
mod json_path;
mod metrics;
mod progress;
mod run;
mod scenario;
mod schedule;
mod scheduler;
mod selection;
mod setup;
mod signal;
mod summary;
mod template;
mod thresholds;
mod thresholds_eval;
mod vu;

pub use config::{
    CliOverrides, DEFAULT_CONTROL_INTERVAL, DEFAULT_GRACEFUL_STOP, DEFAULT_REQUEST_TIMEOUT,
    EnvVars, LoadProfile, NoDataPolicy, RunConfig, RunOptions, Stage, resolve_run_config,
};
pub use error::{Error, Result};
pub use exec::IterationState;
pub use metrics::{
    BUILTIN_METRICS, CHECKS, DATA_RECEIVED, DATA_SENT, HTTP_REQ_DURATION, HTTP_REQ_FAILED,
    HTTP_REQS, ITERATION_DURATION, ITERATIONS, TAG_PHASE, VUS, VUS_MAX, builtin_kind,
};
pub use progress::{LiveMetrics, LoadProgress, ProgressFn, ProgressUpdate, StageProgress};
pub use run::{RunOutcome, RunPlan, run};
pub use scenario::{
    Check, CheckKind, Extract, Guard, HttpStep, Predicate, Scenario, Step, StepKind, Think,
};
pub use schedule::{RampingSchedule, StageSnapshot};
pub use selection::ScenarioTable;
pub use setup::{
    BoxFuture, LifecycleContext, PHASE_SETUP, PHASE_TEARDOWN, Setup, SetupContext, StaticSetup,
    StepLifecycle, Teardown,
};
pub use summary::{CheckSummary, RunSummary, ScenarioSummary};
pub use template::{JsonTemplate, Template};
pub use thresholds::{
    ThresholdAgg, ThresholdExpr, ThresholdExprConfig, ThresholdOp, ThresholdSet,
    parse_threshold_expr, validate_thresholds,
};
pub use thresholds_eval::{ThresholdReport, ThresholdResult, evaluate_thresholds};

pub use volley_http::{HttpClient, Method};
pub use volley_metrics::{MetricKind, TrendSummary};
