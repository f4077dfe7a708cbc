pub mod client;
pub mod config;
pub mod dispatcher;
pub mod protocol;
pub mod reporter;
pub mod signal;
pub mod telemetry;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{GrpcTaskHubClient, TaskHubClient, WorkItemStream};
pub use config::{CliArgs, WorkerConfig, WorkerOptions};
pub use dispatcher::{
    ActivityHandler, HandlerResult, OrchestrationHandler, activity_handler, orchestration_handler,
};
pub use protocol::{ProtocolHandler, SessionState};
