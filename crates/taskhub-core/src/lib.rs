#![doc = include_str!("../README.md")]

mod common;
pub use common::*;

/// gRPC service and message definitions generated from
/// `proto/orchestrator_service.proto`.
///
/// ## Service
///
/// - `GetWorkItems` - server-streaming; yields [`proto::WorkItem`]s.
/// - `CompleteOrchestratorTask` - reports an [`proto::OrchestratorResponse`].
/// - `CompleteActivityTask` - reports an [`proto::ActivityResponse`].
///
/// Nullable strings are `google.protobuf.StringValue` on the wire and surface
/// as `Option<String>` here.
pub mod proto {
    tonic::include_proto!("taskhub");
}
