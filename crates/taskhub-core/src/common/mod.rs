pub mod error;
pub mod failure;

pub use error::{Error, Result, validate_concurrency};
pub use failure::{FailureDetail, HandlerError};
