//! Error types for Beacon.

use thiserror::Error;

/// Errors raised while handing a batch of delivery actions to a scheduler.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The execution context no longer accepts work.
    #[error("Execution context closed: {0}")]
    Closed(String),

    /// Scheduler-specific submission failure.
    #[error("Submission rejected: {0}")]
    Rejected(String),
}

/// Station errors.
///
/// All variants are synchronous failures of the offending call. Queue
/// overflow is not an error; it is reported through the queue counters.
#[derive(Debug, Error)]
pub enum StationError {
    /// Channel was never declared.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// Channel, execution context id or subscription key already taken.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Execution context handle or id is not registered.
    #[error("Unknown execution context: {0}")]
    UnknownContext(String),

    /// A supplied queue or signal is bound to a different execution context.
    #[error("Execution context mismatch: {0}")]
    ContextMismatch(String),

    /// Subscription lookup failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A scheduler refused the delivery batch.
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Result alias used throughout the station API.
pub type Result<T, E = StationError> = std::result::Result<T, E>;
