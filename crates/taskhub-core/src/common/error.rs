//! Error types for the task-hub worker protocol.
//!
//! This module defines the central `Error` enum covering everything the worker
//! can run into outside of user handler code. Failed completion reports are
//! not errors here: the reporter logs them and moves on.
//!
//! ## Error Cases
//! - `InvalidConfig`: A concurrency limit or timing setting was rejected at
//!   construction time. Fatal.
//! - `Connect`: The transport to the coordinator could not be established.
//! - `Stream`: Opening or reading the work item stream failed.
//! - `StreamClosed`: The coordinator ended the work item stream.
//! - `Cancelled`: The supervising cancellation signal fired.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the task-hub worker.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A configuration value was out of range.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The channel to the coordinator could not be built or connected.
    #[error("Connect error: {0}")]
    Connect(#[from] tonic::transport::Error),

    /// The work item stream returned a non-OK status.
    #[error("Stream error: {0}")]
    Stream(#[from] Status),

    /// The coordinator closed the work item stream.
    #[error("Work item stream closed by coordinator")]
    StreamClosed,

    /// The supervising cancellation signal fired.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns `true` if this error means "shut down" rather than "retry".
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Validates a concurrency limit declared to the coordinator.
///
/// The wire carries these as `int32`, so anything non-positive is rejected
/// here rather than being sent upstream.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if `value <= 0`.
pub fn validate_concurrency(name: &str, value: i32) -> Result<i32> {
    if value <= 0 {
        return Err(Error::invalid_config(format!(
            "{name} must be greater than 0 (got {value})"
        )));
    }
    Ok(value)
}
