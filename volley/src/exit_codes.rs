#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// One or more checks failed (only with `--fail-on-checks`).
    ChecksFailed = 10,

    /// One or more thresholds failed.
    ThresholdsFailed = 11,

    /// Checks and thresholds failed.
    ChecksAndThresholdsFailed = 12,

    /// Setup failed; no virtual user was started.
    SetupFailed = 20,

    /// Teardown failed while every threshold passed.
    TeardownFailed = 21,

    /// Invalid CLI flags or plan (bad durations, templates, threshold syntax, etc.).
    InvalidInput = 30,

    /// Internal/runtime error (IO errors, panicked VU tasks).
    RuntimeError = 40,
}

impl ExitCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_quality_gates(checks_failed: bool, thresholds_failed: bool) -> Self {
        match (checks_failed, thresholds_failed) {
            (false, false) => Self::Success,
            (true, false) => Self::ChecksFailed,
            (false, true) => Self::ThresholdsFailed,
            (true, true) => Self::ChecksAndThresholdsFailed,
        }
    }

    /// A teardown failure only surfaces when nothing else failed.
    #[must_use]
    pub fn with_teardown(self, teardown_failed: bool) -> Self {
        match self {
            Self::Success if teardown_failed => Self::TeardownFailed,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_gates_combine() {
        assert_eq!(ExitCode::from_quality_gates(false, false), ExitCode::Success);
        assert_eq!(ExitCode::from_quality_gates(true, false).as_i32(), 10);
        assert_eq!(ExitCode::from_quality_gates(false, true).as_i32(), 11);
        assert_eq!(ExitCode::from_quality_gates(true, true).as_i32(), 12);
    }

    #[test]
    fn teardown_failure_never_masks_thresholds() {
        assert_eq!(
            ExitCode::Success.with_teardown(true),
            ExitCode::TeardownFailed
        );
        assert_eq!(
            ExitCode::ThresholdsFailed.with_teardown(true),
            ExitCode::ThresholdsFailed
        );
        assert_eq!(ExitCode::Success.with_teardown(false), ExitCode::Success);
    }
}
