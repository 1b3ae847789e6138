use std::time::Duration;

use thiserror::Error;

/// Why a single plan step failed. Every variant is caught at the executor
/// boundary and turned into a failed [`crate::types::StepOutcome`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("{action} requires {field}")]
    InvalidStep {
        action: &'static str,
        field: &'static str,
    },
    #[error("no element matches selector '{selector}'")]
    TargetNotFound { selector: String },
    #[error("{operation} timed out after {}ms", .limit.as_millis())]
    Timeout {
        operation: String,
        limit: Duration,
    },
    #[error("unsupported action '{0}'")]
    UnsupportedAction(String),
    #[error("browser operation failed: {0}")]
    DriverFailure(String),
}

impl StepError {
    /// Stable tag recorded on failed outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::InvalidStep { .. } => "invalid_step",
            StepError::TargetNotFound { .. } => "target_not_found",
            StepError::Timeout { .. } => "timeout",
            StepError::UnsupportedAction(_) => "unsupported_action",
            StepError::DriverFailure(_) => "driver_failure",
        }
    }
}

/// Failure reported by a [`crate::driver::BrowserSession`] operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("no element matches selector '{0}'")]
    NotFound(String),
    #[error("{operation} timed out after {}ms", .limit.as_millis())]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
    #[error("{0}")]
    Failed(String),
}

impl DriverError {
    pub fn failed(err: impl std::fmt::Display) -> Self {
        DriverError::Failed(format!("{err:#}"))
    }
}

impl From<DriverError> for StepError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotFound(selector) => StepError::TargetNotFound { selector },
            DriverError::Timeout { operation, limit } => StepError::Timeout {
                operation: operation.to_string(),
                limit,
            },
            DriverError::Failed(message) => StepError::DriverFailure(message),
        }
    }
}

/// A planning, diagnosis or summarization call that did not produce usable output.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("planner request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("planner API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("planner returned unusable output: {0}")]
    Malformed(String),
    #[error("planner call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task {0} already has a live session")]
    AlreadyRegistered(u64),
}

/// Failures that end a run before any execution result exists.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("initial planning failed: {0}")]
    Planning(#[from] PlanningError),
    #[error("failed to open browser session: {0}")]
    Browser(#[from] DriverError),
}
