pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("`iterations` must be a positive integer")]
    InvalidIterations,

    #[error("`stages` must be a non-empty array of {{ duration, target }} with a non-zero total duration")]
    InvalidStages,

    #[error("`{0}` must be a positive duration")]
    InvalidDuration(&'static str),

    #[error("at least one scenario is required")]
    NoScenarios,

    #[error("duplicate scenario name `{0}`")]
    DuplicateScenario(String),

    #[error("scenario `{scenario}` has invalid weight {weight} (expected a finite number > 0)")]
    InvalidWeight { scenario: String, weight: f64 },

    #[error("scenario weights must sum to a finite number")]
    WeightOverflow,

    #[error("invalid template `{template}`: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("invalid http method `{0}`")]
    InvalidMethod(String),

    #[error("invalid threshold for metric `{metric}`: {error}")]
    InvalidThreshold { metric: String, error: String },

    #[error("setup failed: {0}")]
    SetupFailed(String),

    #[error("teardown failed: {0}")]
    TeardownFailed(String),
}

impl Error {
    pub(crate) fn template(template: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            template: template.to_string(),
            reason: reason.into(),
        }
    }
}
