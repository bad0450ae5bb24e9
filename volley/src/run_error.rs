use crate::exit_codes::ExitCode;

#[derive(Debug)]
pub enum RunError {
    InvalidInput(anyhow::Error),
    SetupFailed(anyhow::Error),
    RuntimeError(anyhow::Error),
}

impl RunError {
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::InvalidInput(_) => ExitCode::InvalidInput,
            Self::SetupFailed(_) => ExitCode::SetupFailed,
            Self::RuntimeError(_) => ExitCode::RuntimeError,
        }
    }

    #[must_use]
    pub fn anyhow(&self) -> &anyhow::Error {
        match self {
            Self::InvalidInput(e) | Self::SetupFailed(e) | Self::RuntimeError(e) => e,
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.anyhow())
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.anyhow().as_ref())
    }
}

/// Maps an engine error to the exit-code class it belongs to.
pub(crate) fn classify_core_error(context: &'static str, err: volley_core::Error) -> RunError {
    use volley_core::Error as CoreError;

    let kind = match &err {
        CoreError::InvalidIterations
        | CoreError::InvalidStages
        | CoreError::InvalidDuration(_)
        | CoreError::NoScenarios
        | CoreError::DuplicateScenario(_)
        | CoreError::InvalidWeight { .. }
        | CoreError::WeightOverflow
        | CoreError::InvalidTemplate { .. }
        | CoreError::InvalidMethod(_)
        | CoreError::InvalidThreshold { .. } => RunError::InvalidInput,

        CoreError::SetupFailed(_) => RunError::SetupFailed,

        CoreError::TeardownFailed(_) | CoreError::Join(_) => RunError::RuntimeError,
    };

    kind(anyhow::Error::new(err).context(context))
}
