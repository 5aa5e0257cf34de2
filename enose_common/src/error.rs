//! Step-level error kinds shared across the workspace.

use thiserror::Error;

/// Failure of a single experiment step, surfaced to the runner.
///
/// Precondition failures are *not* errors — executors return them as
/// values so the runner can apply its skip-or-abort policy. Everything
/// here terminates the step.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// Motion or sensor link unresponsive after the in-executor retry.
    #[error("CommunicationTimeout: {0}")]
    CommunicationTimeout(String),

    /// A consumable reached its critical threshold and policy blocks.
    #[error("ResourceExhausted: {0}")]
    ResourceExhausted(String),

    /// Normal termination via abort. Recorded, not logged as an error.
    #[error("Cancelled")]
    Cancelled,

    /// Programming error (e.g. nested transaction guards). The run is
    /// aborted; the process continues.
    #[error("InternalInvariantViolated: {0}")]
    InternalInvariantViolated(String),

    /// Load-cell or sensor feedback became unusable mid-step.
    #[error("feedback lost: {0}")]
    FeedbackLost(String),
}

impl StepError {
    /// True for errors that represent a deliberate stop rather than a
    /// fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }
}

/// One failed precondition, named so the runner can report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionFailure {
    /// Short machine-readable check name.
    pub check: &'static str,
    /// Human-readable explanation.
    pub message: String,
}

/// Outcome of an executor's precondition pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreconditionReport {
    /// Failures, empty when all checks passed.
    pub failures: Vec<PreconditionFailure>,
}

impl PreconditionReport {
    /// Report with no failures.
    pub fn ok() -> Self {
        Self::default()
    }

    /// True when every check passed.
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// Record a failed check.
    pub fn fail(&mut self, check: &'static str, message: impl Into<String>) {
        self.failures.push(PreconditionFailure {
            check,
            message: message.into(),
        });
    }

    /// All failure messages joined for logging.
    pub fn summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.check, f.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
