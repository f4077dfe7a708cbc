#![doc = include_str!("../README.md")]

pub mod worker;

pub use taskhub_core::{Error, FailureDetail, HandlerError, Result, proto};
pub use worker::*;
