use thiserror::Error;

/// Errors surfaced by the engine facade.
///
/// Task-level failures never show up here, they are folded into
/// [`Outcome::Failed`](crate::result::Outcome::Failed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine has been disposed")]
    Disposed,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no tokio runtime available to host worker slots")]
    NoRuntime,
    #[error("timed out waiting for a snapshot")]
    Timeout,
}

/// Failure reported by a [`TaskExecutor`](crate::executor::TaskExecutor).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task ran but its artifact is unusable (wrong type, empty body, ...).
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("failed: {0}")]
    Failed(String),
    #[error("panicked: {0}")]
    Panic(String),
}
