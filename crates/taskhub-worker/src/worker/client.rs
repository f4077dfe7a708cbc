//! Work item stream client and completion RPCs.
//!
//! [`TaskHubClient`] is the seam between the worker and the coordinator: one
//! server-streaming call to obtain work items and two unary calls to report
//! outcomes. The production implementation wraps the tonic-generated
//! [`TaskHubSidecarServiceClient`]; tests substitute an in-memory coordinator.
//!
//! The client is stateless across reconnects. Every call to
//! [`TaskHubClient::get_work_items`] opens a fresh stream.

use core::pin::Pin;
use taskhub_core::{
    Result,
    proto::{
        ActivityResponse, GetWorkItemsRequest, OrchestratorResponse, WorkItem,
        task_hub_sidecar_service_client::TaskHubSidecarServiceClient,
    },
};
use tokio_stream::Stream;
use tonic::{
    Status,
    codec::CompressionEncoding,
    transport::{Channel, Endpoint},
};

/// A live, ordered stream of work items from the coordinator.
pub type WorkItemStream = Pin<Box<dyn Stream<Item = core::result::Result<WorkItem, Status>> + Send>>;

/// The RPC contract the worker consumes.
#[tonic::async_trait]
pub trait TaskHubClient: Send + Sync + 'static {
    /// Opens the server-streaming `GetWorkItems` call, declaring the worker's
    /// concurrency hints.
    async fn get_work_items(
        &self,
        request: GetWorkItemsRequest,
    ) -> core::result::Result<WorkItemStream, Status>;

    /// Reports the outcome of an orchestration work item.
    async fn complete_orchestrator_task(
        &self,
        response: OrchestratorResponse,
    ) -> core::result::Result<(), Status>;

    /// Reports the outcome of an activity work item.
    async fn complete_activity_task(
        &self,
        response: ActivityResponse,
    ) -> core::result::Result<(), Status>;
}

/// [`TaskHubClient`] backed by a tonic [`Channel`].
#[derive(Clone, Debug)]
pub struct GrpcTaskHubClient {
    inner: TaskHubSidecarServiceClient<Channel>,
}

impl GrpcTaskHubClient {
    /// Wraps an existing channel.
    ///
    /// Requests go out uncompressed since not every coordinator accepts
    /// compressed bodies; zstd and gzip responses are accepted.
    pub fn new(channel: Channel) -> Self {
        let inner = TaskHubSidecarServiceClient::new(channel)
            .accept_compressed(CompressionEncoding::Zstd)
            .accept_compressed(CompressionEncoding::Gzip);
        Self { inner }
    }

    /// Builds a lazily-connecting client for `address`.
    ///
    /// No connection is made here. Transport failures surface on the first
    /// RPC, where the worker's reconnect loop handles them.
    ///
    /// # Errors
    ///
    /// Returns [`taskhub_core::Error::Connect`] if `address` is not a valid
    /// URI.
    pub fn connect_lazy(address: impl Into<String>) -> Result<Self> {
        let endpoint = Endpoint::from_shared(address.into())?
            .tcp_nodelay(true)
            .http2_adaptive_window(true);
        Ok(Self::new(endpoint.connect_lazy()))
    }
}

#[tonic::async_trait]
impl TaskHubClient for GrpcTaskHubClient {
    async fn get_work_items(
        &self,
        request: GetWorkItemsRequest,
    ) -> core::result::Result<WorkItemStream, Status> {
        // tonic clients take `&mut self`; clones share the same channel.
        let mut client = self.inner.clone();
        let stream = client.get_work_items(request).await?.into_inner();
        Ok(Box::pin(stream))
    }

    async fn complete_orchestrator_task(
        &self,
        response: OrchestratorResponse,
    ) -> core::result::Result<(), Status> {
        let mut client = self.inner.clone();
        client.complete_orchestrator_task(response).await?;
        Ok(())
    }

    async fn complete_activity_task(
        &self,
        response: ActivityResponse,
    ) -> core::result::Result<(), Status> {
        let mut client = self.inner.clone();
        client.complete_activity_task(response).await?;
        Ok(())
    }
}
