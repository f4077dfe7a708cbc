//! Result reporting.
//!
//! Once a dispatched handler settles, [`Reporter`] turns its outcome into
//! exactly one completion RPC, or none at all when the failure is the worker's
//! own shutdown signal firing:
//!
//! | Outcome                                      | RPC                                   |
//! |----------------------------------------------|---------------------------------------|
//! | `Ok(response)`                               | completion with the handler's result  |
//! | `Err(e)`, not a cancellation                 | completion carrying a `FailureDetail` |
//! | `Err(e)`, cancellation, signal not fired     | completion carrying a `FailureDetail` |
//! | `Err(e)`, cancellation, signal fired         | none                                  |
//!
//! The instance id, task id and completion token always come from the
//! originating request. A failing completion RPC is logged and swallowed; the
//! coordinator redelivers unacknowledged work.

use super::{
    client::TaskHubClient,
    signal::ShutdownSignal,
    telemetry::{increment_reports_failed, increment_work_items_completed, increment_work_items_failed},
    tracker::WorkKind,
};
use std::sync::Arc;
use taskhub_core::{
    FailureDetail, HandlerError,
    proto::{
        ActivityRequest, ActivityResponse, CompleteOrchestrationAction, OrchestrationStatus,
        OrchestratorAction, OrchestratorRequest, OrchestratorResponse,
        orchestrator_action::OrchestratorActionType,
    },
};

/// Identity of an orchestration work item, captured before the handler runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationOrigin {
    pub instance_id: String,
    pub completion_token: String,
}

impl OrchestrationOrigin {
    pub fn new(request: &OrchestratorRequest, completion_token: &str) -> Self {
        Self {
            instance_id: request.instance_id.clone(),
            completion_token: completion_token.to_string(),
        }
    }
}

/// Identity of an activity work item, captured before the handler runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityOrigin {
    pub name: String,
    pub instance_id: String,
    pub task_id: i32,
    pub completion_token: String,
}

impl ActivityOrigin {
    pub fn new(request: &ActivityRequest, completion_token: &str) -> Self {
        Self {
            name: request.name.clone(),
            instance_id: request
                .orchestration_instance
                .as_ref()
                .map(|i| i.instance_id.clone())
                .unwrap_or_default(),
            task_id: request.task_id,
            completion_token: completion_token.to_string(),
        }
    }
}

/// What the reporter did with one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    /// A success result was sent.
    Completed,
    /// A failure result was sent.
    Failed,
    /// The outcome was a cancellation caused by shutdown; nothing was sent.
    Suppressed,
    /// The completion RPC itself failed; the error was logged.
    SendFailed,
}

/// Builds the response that completes an orchestration as failed.
///
/// The response carries a single terminal action.
pub fn orchestration_failure(origin: &OrchestrationOrigin, err: &HandlerError) -> OrchestratorResponse {
    OrchestratorResponse {
        instance_id: origin.instance_id.clone(),
        actions: vec![OrchestratorAction {
            id: -1,
            orchestrator_action_type: Some(OrchestratorActionType::CompleteOrchestration(
                CompleteOrchestrationAction {
                    orchestration_status: OrchestrationStatus::Failed as i32,
                    failure_details: Some(FailureDetail::from(err).into()),
                    ..Default::default()
                },
            )),
        }],
        custom_status: None,
        completion_token: origin.completion_token.clone(),
    }
}

/// Builds the response that fails an activity.
pub fn activity_failure(origin: &ActivityOrigin, err: &HandlerError) -> ActivityResponse {
    ActivityResponse {
        instance_id: origin.instance_id.clone(),
        task_id: origin.task_id,
        result: None,
        failure_details: Some(FailureDetail::from(err).into()),
        completion_token: origin.completion_token.clone(),
    }
}

/// Sends settled outcomes back to the coordinator.
pub struct Reporter<C> {
    client: Arc<C>,
    shutdown: ShutdownSignal,
}

impl<C> Clone for Reporter<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<C: TaskHubClient> Reporter<C> {
    /// Cancellation errors are only suppressed while `shutdown` is triggered.
    pub const fn new(client: Arc<C>, shutdown: ShutdownSignal) -> Self {
        Self { client, shutdown }
    }

    fn is_shutdown_cancellation(&self, err: &HandlerError) -> bool {
        err.is_cancellation() && self.shutdown.is_cancelled()
    }

    pub async fn report_orchestration(
        &self,
        origin: &OrchestrationOrigin,
        outcome: Result<OrchestratorResponse, HandlerError>,
    ) -> ReportStatus {
        let (response, status) = match outcome {
            Ok(mut response) => {
                response.instance_id.clone_from(&origin.instance_id);
                response.completion_token.clone_from(&origin.completion_token);
                (response, ReportStatus::Completed)
            }
            Err(err) if self.is_shutdown_cancellation(&err) => {
                tracing::debug!(
                    instance_id = %origin.instance_id,
                    "Orchestration cancelled by shutdown; not reporting"
                );
                return ReportStatus::Suppressed;
            }
            Err(err) => {
                tracing::warn!(
                    instance_id = %origin.instance_id,
                    error = %err,
                    "Orchestration handler failed"
                );
                (orchestration_failure(origin, &err), ReportStatus::Failed)
            }
        };

        match self.client.complete_orchestrator_task(response).await {
            Ok(()) => {
                tracing::debug!(instance_id = %origin.instance_id, ?status, "Sent orchestration result");
                record_report(WorkKind::Orchestration, status);
                status
            }
            Err(e) => {
                increment_reports_failed();
                tracing::warn!(
                    instance_id = %origin.instance_id,
                    code = ?e.code(),
                    "Failed to send orchestration result: {}",
                    e.message()
                );
                ReportStatus::SendFailed
            }
        }
    }

    pub async fn report_activity(
        &self,
        origin: &ActivityOrigin,
        outcome: Result<ActivityResponse, HandlerError>,
    ) -> ReportStatus {
        let (response, status) = match outcome {
            Ok(mut response) => {
                response.instance_id.clone_from(&origin.instance_id);
                response.task_id = origin.task_id;
                response.completion_token.clone_from(&origin.completion_token);
                (response, ReportStatus::Completed)
            }
            Err(err) if self.is_shutdown_cancellation(&err) => {
                tracing::debug!(
                    name = %origin.name,
                    instance_id = %origin.instance_id,
                    task_id = origin.task_id,
                    "Activity cancelled by shutdown; not reporting"
                );
                return ReportStatus::Suppressed;
            }
            Err(err) => {
                tracing::warn!(
                    name = %origin.name,
                    instance_id = %origin.instance_id,
                    task_id = origin.task_id,
                    error = %err,
                    "Activity handler failed"
                );
                (activity_failure(origin, &err), ReportStatus::Failed)
            }
        };

        match self.client.complete_activity_task(response).await {
            Ok(()) => {
                tracing::debug!(
                    name = %origin.name,
                    instance_id = %origin.instance_id,
                    task_id = origin.task_id,
                    ?status,
                    "Sent activity result"
                );
                record_report(WorkKind::Activity, status);
                status
            }
            Err(e) => {
                increment_reports_failed();
                tracing::warn!(
                    name = %origin.name,
                    instance_id = %origin.instance_id,
                    task_id = origin.task_id,
                    code = ?e.code(),
                    "Failed to send activity result: {}",
                    e.message()
                );
                ReportStatus::SendFailed
            }
        }
    }
}

fn record_report(kind: WorkKind, status: ReportStatus) {
    match status {
        ReportStatus::Completed => increment_work_items_completed(kind),
        ReportStatus::Failed => increment_work_items_failed(kind),
        ReportStatus::Suppressed | ReportStatus::SendFailed => {}
    }
}
