//! Framework error types.
//!
//! drover separates three fault domains. User test code that throws is
//! captured by the invoker into a failed [`TestResult`](crate::result::TestResult)
//! and never surfaces as an `Err`. Framework-internal faults (a listener
//! panicking, a worker dying mid-batch) are logged and swallowed so the run
//! can finish. Only configuration and lifecycle mistakes are returned to the
//! caller as [`CoreError`].

use std::time::Duration;

/// Result type for framework operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced to callers of the execution core.
///
/// # Error Categories
///
/// - **Config**: invalid suite or test configuration (bad thread count,
///   dependency cycle, unknown dependency target). Fails construction.
/// - **Lifecycle**: API misuse at runtime (submit after shutdown, running a
///   suite twice).
/// - **Timeout**: a bounded wait elapsed; partial results are available.
/// - **Interrupted**: the awaiting task itself was cancelled.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Invalid suite, test, or pool configuration.
    ///
    /// Common causes: thread count below one, a dependency cycle between
    /// test methods, a dependency on a method or group that does not exist.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("Lifecycle violation: {0}")]
    Lifecycle(String),

    /// A bounded wait elapsed before all submitted work completed.
    ///
    /// Outstanding work has been cancelled cooperatively; results recorded
    /// before the deadline remain observable.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The task awaiting the framework was itself cancelled.
    #[error("Interrupted while {0}")]
    Interrupted(String),

    /// Other framework-related errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// Returns `true` for errors that indicate a configuration mistake.
    pub fn is_config(&self) -> bool {
        matches!(self, CoreError::Config(_))
    }

    /// Returns `true` when a deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Timeout(_))
    }
}
