//! # Handler failures
//!
//! Orchestration and activity handlers are plain async functions supplied by
//! the application. When one of them fails it returns a [`HandlerError`], which
//! the worker turns into a [`FailureDetail`] and reports back to the
//! coordinator in place of a result.
//!
//! A [`HandlerError`] is either an ordinary failure or a cancellation. Whether
//! a cancellation is reported depends on the worker's own shutdown signal, so
//! the distinction is kept explicit here rather than inferred from the
//! message.

use crate::proto;
use core::any::Any;
use core::fmt;

/// Error type name used for handler cancellations.
pub const CANCELLED_ERROR_TYPE: &str = "OperationCancelled";

/// Error type name used when a handler panics.
pub const PANIC_ERROR_TYPE: &str = "panic";

/// The failure an orchestration or activity handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    error_type: String,
    message: String,
    stack_trace: Option<String>,
    cancelled: bool,
}

impl HandlerError {
    /// Creates an ordinary handler failure.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack_trace: None,
            cancelled: false,
        }
    }

    /// Creates a cancellation error.
    ///
    /// A cancellation is only suppressed by the worker if its own shutdown
    /// signal has fired; otherwise it is reported like any other failure.
    pub fn cancelled() -> Self {
        Self {
            error_type: CANCELLED_ERROR_TYPE.to_string(),
            message: "The operation was cancelled.".to_string(),
            stack_trace: None,
            cancelled: true,
        }
    }

    /// Builds a failure from any error value, naming it by its Rust type.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self::new(core::any::type_name::<E>(), err.to_string())
    }

    /// Builds a failure from a panic payload caught around a handler.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self::new(PANIC_ERROR_TYPE, message)
    }

    /// Replaces the reported error type, keeping the message.
    #[must_use]
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    /// Attaches a stack trace.
    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    pub fn error_type(&self) -> &str {
        &self.error_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }

    /// Returns `true` if this is a cancellation error.
    pub const fn is_cancellation(&self) -> bool {
        self.cancelled
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Keeps the full context chain as the message.
///
/// The error type comes from the root cause when it is a [`HandlerError`] or
/// an [`std::io::Error`]; anything else is reported as `anyhow::Error` and can
/// be renamed with [`HandlerError::with_error_type`].
impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        let root = err.root_cause();
        let (error_type, cancelled, stack_trace) =
            if let Some(inner) = root.downcast_ref::<Self>() {
                (inner.error_type.clone(), inner.cancelled, inner.stack_trace.clone())
            } else if let Some(io) = root.downcast_ref::<std::io::Error>() {
                (format!("std::io::Error({:?})", io.kind()), false, None)
            } else {
                ("anyhow::Error".to_string(), false, None)
            };

        let stack_trace = stack_trace.or_else(|| {
            let backtrace = err.backtrace();
            (backtrace.status() == std::backtrace::BacktraceStatus::Captured)
                .then(|| backtrace.to_string())
        });

        Self {
            error_type,
            message: format!("{err:#}"),
            stack_trace,
            cancelled,
        }
    }
}

/// Structured description of a handler failure, as sent to the coordinator.
///
/// `stack_trace` stays `None` when the failure carried none; it is never
/// coerced to an empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: Option<String>,
}

impl From<&HandlerError> for FailureDetail {
    fn from(err: &HandlerError) -> Self {
        Self {
            error_type: err.error_type.clone(),
            error_message: err.message.clone(),
            stack_trace: err.stack_trace.clone(),
        }
    }
}

impl From<FailureDetail> for proto::TaskFailureDetails {
    fn from(detail: FailureDetail) -> Self {
        Self {
            error_type: detail.error_type,
            error_message: detail.error_message,
            stack_trace: detail.stack_trace,
            inner_failure: None,
            is_non_retriable: false,
        }
    }
}
