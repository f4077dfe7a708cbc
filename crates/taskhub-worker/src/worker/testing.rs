//! Scripted in-memory coordinator for tests.

use super::client::{TaskHubClient, WorkItemStream};
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use taskhub_core::proto::{
    ActivityRequest, ActivityResponse, GetWorkItemsRequest, OrchestrationInstance,
    OrchestratorRequest, OrchestratorResponse, WorkItem, work_item,
};
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use tonic::Status;

/// How a scripted stream behaves once its items are exhausted.
#[derive(Debug, Clone)]
pub enum StreamEnd {
    /// Stay open until the worker stops reading.
    Hang,
    /// End the stream cleanly.
    Close,
    /// Fail the read with this status.
    Fail(Status),
}

/// One scripted `GetWorkItems` call.
#[derive(Debug, Clone)]
pub enum Session {
    /// The call itself fails.
    Refuse(Status),
    /// The call succeeds and yields `items`, then behaves per `end`.
    Stream { items: Vec<WorkItem>, end: StreamEnd },
}

#[derive(Default)]
struct Recorded {
    requests: Vec<GetWorkItemsRequest>,
    orchestrations: Vec<OrchestratorResponse>,
    activities: Vec<ActivityResponse>,
}

/// A [`TaskHubClient`] that replays scripted sessions and records every call.
///
/// Once the script runs out, further connects get a stream that hangs.
#[derive(Default)]
pub struct FakeTaskHub {
    sessions: Mutex<VecDeque<Session>>,
    recorded: Mutex<Recorded>,
    completion_failure: Mutex<Option<Status>>,
    changed: Notify,
}

impl FakeTaskHub {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session(self, session: Session) -> Self {
        self.sessions.lock().push_back(session);
        self
    }

    /// A single session that yields `items` and then hangs.
    pub fn streaming(items: Vec<WorkItem>) -> Self {
        Self::new().with_session(Session::Stream {
            items,
            end: StreamEnd::Hang,
        })
    }

    /// Makes every completion call fail with `status` (still recorded).
    pub fn fail_completions(&self, status: Status) {
        *self.completion_failure.lock() = Some(status);
    }

    pub fn requests(&self) -> Vec<GetWorkItemsRequest> {
        self.recorded.lock().requests.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.recorded.lock().requests.len()
    }

    pub fn orchestration_completions(&self) -> Vec<OrchestratorResponse> {
        self.recorded.lock().orchestrations.clone()
    }

    pub fn activity_completions(&self) -> Vec<ActivityResponse> {
        self.recorded.lock().activities.clone()
    }

    pub fn completion_count(&self) -> usize {
        let recorded = self.recorded.lock();
        recorded.orchestrations.len() + recorded.activities.len()
    }

    /// Resolves once `condition` holds.
    pub async fn wait_until(&self, condition: impl Fn(&Self) -> bool) {
        loop {
            let changed = self.changed.notified();
            if condition(self) {
                return;
            }
            changed.await;
        }
    }

    fn record(&self, f: impl FnOnce(&mut Recorded)) {
        f(&mut self.recorded.lock());
        self.changed.notify_waiters();
    }

    fn completion_result(&self) -> Result<(), Status> {
        match self.completion_failure.lock().as_ref() {
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }
}

#[tonic::async_trait]
impl TaskHubClient for FakeTaskHub {
    async fn get_work_items(&self, request: GetWorkItemsRequest) -> Result<WorkItemStream, Status> {
        self.record(|r| r.requests.push(request));
        let session = self.sessions.lock().pop_front();

        match session {
            Some(Session::Refuse(status)) => Err(status),
            Some(Session::Stream { items, end }) => {
                let items = tokio_stream::iter(items.into_iter().map(Ok));
                let stream: WorkItemStream = match end {
                    StreamEnd::Hang => Box::pin(items.chain(tokio_stream::pending())),
                    StreamEnd::Close => Box::pin(items),
                    StreamEnd::Fail(status) => {
                        Box::pin(items.chain(tokio_stream::once(Err(status))))
                    }
                };
                Ok(stream)
            }
            None => Ok(Box::pin(tokio_stream::pending())),
        }
    }

    async fn complete_orchestrator_task(&self, response: OrchestratorResponse) -> Result<(), Status> {
        self.record(|r| r.orchestrations.push(response));
        self.completion_result()
    }

    async fn complete_activity_task(&self, response: ActivityResponse) -> Result<(), Status> {
        self.record(|r| r.activities.push(response));
        self.completion_result()
    }
}

/// Fails the test if `fut` does not finish within five seconds.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

pub fn orchestration_item(instance_id: &str) -> WorkItem {
    WorkItem {
        request: Some(work_item::Request::OrchestratorRequest(OrchestratorRequest {
            instance_id: instance_id.to_string(),
            ..Default::default()
        })),
        completion_token: format!("tok-{instance_id}"),
    }
}

pub fn activity_item(name: &str, instance_id: &str, task_id: i32) -> WorkItem {
    WorkItem {
        request: Some(work_item::Request::ActivityRequest(ActivityRequest {
            name: name.to_string(),
            task_id,
            orchestration_instance: Some(OrchestrationInstance {
                instance_id: instance_id.to_string(),
                execution_id: None,
            }),
            input: Some(format!("\"{name}-input\"")),
            ..Default::default()
        })),
        completion_token: format!("tok-{instance_id}-{task_id}"),
    }
}

pub fn health_ping() -> WorkItem {
    WorkItem {
        request: Some(work_item::Request::HealthPing(Default::default())),
        completion_token: String::new(),
    }
}
