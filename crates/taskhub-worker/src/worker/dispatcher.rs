//! Work item dispatch.
//!
//! The [`Dispatcher`] classifies each work item read from the stream and runs
//! the matching handler as its own Tokio task, so the read loop never waits on
//! in-progress work. The task hands the settled outcome to the
//! [`Reporter`]. Kinds this worker does not handle are dropped without a
//! handler call or a report.
//!
//! There is no local concurrency cap. The limits in [`WorkerOptions`] are sent
//! to the coordinator as hints and only size the pruning thresholds here.

use super::{
    client::TaskHubClient,
    config::WorkerOptions,
    reporter::{ActivityOrigin, OrchestrationOrigin, Reporter},
    signal::ShutdownSignal,
    telemetry::{
        increment_work_items_ignored, increment_work_items_received, record_work_item_duration,
    },
    tracker::{ActiveWork, ActiveWorkRecord, WorkKind},
};
use core::{future::Future, panic::AssertUnwindSafe, time::Duration};
use futures::{FutureExt, future::BoxFuture};
use std::{sync::Arc, time::Instant};
use taskhub_core::{
    HandlerError,
    proto::{
        ActivityRequest, ActivityResponse, OrchestratorRequest, OrchestratorResponse, WorkItem,
        work_item,
    },
};
use tracing::{Instrument, Span};

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Runs one orchestration replay step.
pub type OrchestrationHandler =
    Arc<dyn Fn(OrchestratorRequest) -> BoxFuture<'static, HandlerResult<OrchestratorResponse>> + Send + Sync>;

/// Runs one activity invocation.
pub type ActivityHandler =
    Arc<dyn Fn(ActivityRequest) -> BoxFuture<'static, HandlerResult<ActivityResponse>> + Send + Sync>;

/// Wraps an async closure as an [`OrchestrationHandler`].
pub fn orchestration_handler<F, Fut>(f: F) -> OrchestrationHandler
where
    F: Fn(OrchestratorRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<OrchestratorResponse>> + Send + 'static,
{
    Arc::new(move |request| f(request).boxed())
}

/// Wraps an async closure as an [`ActivityHandler`].
pub fn activity_handler<F, Fut>(f: F) -> ActivityHandler
where
    F: Fn(ActivityRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<ActivityResponse>> + Send + 'static,
{
    Arc::new(move |request| f(request).boxed())
}

/// A work item sorted by the kind of request it carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Orchestration(OrchestratorRequest),
    Activity(ActivityRequest),
    /// No request, or a kind this worker does not handle.
    Unrecognized(&'static str),
}

pub fn classify(request: Option<work_item::Request>) -> Classified {
    match request {
        Some(work_item::Request::OrchestratorRequest(req)) => Classified::Orchestration(req),
        Some(work_item::Request::ActivityRequest(req)) => Classified::Activity(req),
        Some(work_item::Request::EntityRequest(_)) => Classified::Unrecognized("entity"),
        Some(work_item::Request::HealthPing(_)) => Classified::Unrecognized("health_ping"),
        None => Classified::Unrecognized("empty"),
    }
}

/// Runs a handler, turning a panic into a [`HandlerError`] and recording how
/// long it took.
///
/// `run` is called inside the unwind boundary, so a closure that panics before
/// returning its future is caught too.
async fn run_handler<T, F>(kind: WorkKind, run: F) -> HandlerResult<T>
where
    F: FnOnce() -> BoxFuture<'static, HandlerResult<T>>,
{
    let start = Instant::now();
    let outcome = match AssertUnwindSafe(async move { run().await }).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(HandlerError::from_panic(&*payload)),
    };
    record_work_item_duration(kind, start.elapsed().as_secs_f64() * 1000.0);
    outcome
}

/// Spawns `fut` as one execution of `work`'s kind and records it there.
fn spawn_tracked<F>(work: &ActiveWork, instance_id: String, span: Span, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    increment_work_items_received(work.kind());
    let guard = work.start();
    tracing::debug!(
        parent: &span,
        active = guard.count_at_start(),
        "Dispatching {} work item",
        work.kind()
    );

    let fut = async move {
        let _guard = guard;
        fut.await;
    };
    let handle = tokio::spawn(fut.instrument(span));
    work.track(ActiveWorkRecord::new(instance_id, handle));
}

pub struct Dispatcher<C> {
    orchestrations: OrchestrationHandler,
    activities: ActivityHandler,
    reporter: Reporter<C>,
    orchestration_work: ActiveWork,
    activity_work: ActiveWork,
}

impl<C: TaskHubClient> Dispatcher<C> {
    pub fn new(
        client: Arc<C>,
        orchestrations: OrchestrationHandler,
        activities: ActivityHandler,
        shutdown: ShutdownSignal,
        options: &WorkerOptions,
    ) -> Self {
        Self {
            orchestrations,
            activities,
            reporter: Reporter::new(client, shutdown),
            orchestration_work: ActiveWork::new(
                WorkKind::Orchestration,
                options.orchestration_prune_threshold(),
            ),
            activity_work: ActiveWork::new(WorkKind::Activity, options.activity_prune_threshold()),
        }
    }

    /// Launches the handler for `item` and returns the kind dispatched, or
    /// `None` if the item was ignored.
    pub fn dispatch(&self, item: WorkItem) -> Option<WorkKind> {
        let WorkItem {
            request,
            completion_token,
        } = item;

        match classify(request) {
            Classified::Orchestration(request) => {
                self.dispatch_orchestration(request, &completion_token);
                Some(WorkKind::Orchestration)
            }
            Classified::Activity(request) => {
                self.dispatch_activity(request, &completion_token);
                Some(WorkKind::Activity)
            }
            Classified::Unrecognized(kind) => {
                increment_work_items_ignored();
                tracing::debug!(kind, "Ignoring work item of unhandled kind");
                None
            }
        }
    }

    fn dispatch_orchestration(&self, request: OrchestratorRequest, completion_token: &str) {
        let origin = OrchestrationOrigin::new(&request, completion_token);
        let span = tracing::info_span!("orchestration", instance_id = %origin.instance_id);
        let instance_id = origin.instance_id.clone();
        let handler = Arc::clone(&self.orchestrations);
        let reporter = self.reporter.clone();

        spawn_tracked(&self.orchestration_work, instance_id, span, async move {
            let outcome = run_handler(WorkKind::Orchestration, move || handler(request)).await;
            reporter.report_orchestration(&origin, outcome).await;
        });
    }

    fn dispatch_activity(&self, request: ActivityRequest, completion_token: &str) {
        let origin = ActivityOrigin::new(&request, completion_token);
        let span = tracing::info_span!(
            "activity",
            name = %origin.name,
            instance_id = %origin.instance_id,
            task_id = origin.task_id
        );
        let instance_id = origin.instance_id.clone();
        let handler = Arc::clone(&self.activities);
        let reporter = self.reporter.clone();

        spawn_tracked(&self.activity_work, instance_id, span, async move {
            let outcome = run_handler(WorkKind::Activity, move || handler(request)).await;
            reporter.report_activity(&origin, outcome).await;
        });
    }

    /// Number of dispatched executions that have not settled yet.
    pub fn in_flight(&self) -> usize {
        self.orchestration_work.in_flight() + self.activity_work.in_flight()
    }

    /// Number of tracked records across both kinds (settled or not).
    pub fn tracked(&self) -> usize {
        self.orchestration_work.len() + self.activity_work.len()
    }

    /// Waits up to `timeout` for all tracked work, aborting what is left.
    pub async fn drain(&self, timeout: Duration) {
        let (orchestrations, activities) = tokio::join!(
            self.orchestration_work.drain(timeout),
            self.activity_work.drain(timeout)
        );

        tracing::info!(
            orchestrations_completed = orchestrations.completed,
            activities_completed = activities.completed,
            "Drained in-flight work"
        );
        if !orchestrations.aborted.is_empty() || !activities.aborted.is_empty() {
            tracing::warn!(
                orchestrations = ?orchestrations.aborted,
                activities = ?activities.aborted,
                "In-flight work did not settle before the drain timeout and was aborted"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testing::{FakeTaskHub, activity_item, health_ping, orchestration_item, within};
    use portable_atomic::{AtomicUsize, Ordering};
    use taskhub_core::proto::{EntityBatchRequest, orchestrator_action::OrchestratorActionType};
    use tokio::sync::Semaphore;

    fn echo_orchestrations() -> OrchestrationHandler {
        orchestration_handler(|req: OrchestratorRequest| async move {
            Ok(OrchestratorResponse {
                instance_id: req.instance_id,
                ..Default::default()
            })
        })
    }

    fn echo_activities() -> ActivityHandler {
        activity_handler(|req: ActivityRequest| async move {
            Ok(ActivityResponse {
                result: req.input,
                ..Default::default()
            })
        })
    }

    fn dispatcher(
        hub: &Arc<FakeTaskHub>,
        orchestrations: OrchestrationHandler,
        activities: ActivityHandler,
    ) -> Dispatcher<FakeTaskHub> {
        Dispatcher::new(
            Arc::clone(hub),
            orchestrations,
            activities,
            ShutdownSignal::default(),
            &WorkerOptions::new(2, 2).unwrap(),
        )
    }

    #[test]
    fn classifies_every_request_kind() {
        assert!(matches!(
            classify(orchestration_item("i-1").request),
            Classified::Orchestration(req) if req.instance_id == "i-1"
        ));
        assert!(matches!(
            classify(activity_item("act", "i-1", 3).request),
            Classified::Activity(req) if req.task_id == 3
        ));
        assert_eq!(classify(health_ping().request), Classified::Unrecognized("health_ping"));
        assert_eq!(
            classify(Some(work_item::Request::EntityRequest(EntityBatchRequest::default()))),
            Classified::Unrecognized("entity")
        );
        assert_eq!(classify(None), Classified::Unrecognized("empty"));
    }

    #[tokio::test]
    async fn unrecognized_items_call_no_handler_and_send_no_report() {
        let hub = Arc::new(FakeTaskHub::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let orchestrations = {
            let calls = Arc::clone(&calls);
            orchestration_handler(move |_req| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(OrchestratorResponse::default()) }
            })
        };
        let dispatcher = dispatcher(&hub, orchestrations, echo_activities());

        assert_eq!(dispatcher.dispatch(health_ping()), None);
        assert_eq!(dispatcher.dispatch(WorkItem::default()), None);
        dispatcher.drain(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(hub.completion_count(), 0);
        assert_eq!(dispatcher.tracked(), 0);
    }

    #[tokio::test]
    async fn reports_each_dispatched_item_once() {
        let hub = Arc::new(FakeTaskHub::new());
        let dispatcher = dispatcher(&hub, echo_orchestrations(), echo_activities());

        assert_eq!(dispatcher.dispatch(orchestration_item("i-1")), Some(WorkKind::Orchestration));
        assert_eq!(dispatcher.dispatch(activity_item("act", "i-1", 5)), Some(WorkKind::Activity));
        dispatcher.drain(Duration::from_secs(5)).await;

        let orchestrations = hub.orchestration_completions();
        assert_eq!(orchestrations.len(), 1);
        assert_eq!(orchestrations[0].instance_id, "i-1");
        assert_eq!(orchestrations[0].completion_token, "tok-i-1");

        let activities = hub.activity_completions();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].task_id, 5);
        assert_eq!(activities[0].result.as_deref(), Some("\"act-input\""));
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn panicking_handler_is_reported_as_failure() {
        let hub = Arc::new(FakeTaskHub::new());
        let activities = activity_handler(|_req: ActivityRequest| async move {
            if true {
                panic!("activity exploded");
            }
            Ok(ActivityResponse::default())
        });
        let dispatcher = dispatcher(&hub, echo_orchestrations(), activities);

        dispatcher.dispatch(activity_item("act", "i-9", 1));
        dispatcher.drain(Duration::from_secs(5)).await;

        let sent = hub.activity_completions();
        assert_eq!(sent.len(), 1);
        let details = sent[0].failure_details.as_ref().unwrap();
        assert_eq!(details.error_type, "panic");
        assert_eq!(details.error_message, "activity exploded");
        assert_eq!(details.stack_trace, None);
    }

    #[tokio::test]
    async fn handler_panicking_before_returning_its_future_is_reported() {
        let hub = Arc::new(FakeTaskHub::new());
        let orchestrations = orchestration_handler(|req: OrchestratorRequest| {
            assert_ne!(req.instance_id, "explodes", "rejected before any await");
            async { Ok(OrchestratorResponse::default()) }
        });
        let dispatcher = dispatcher(&hub, orchestrations, echo_activities());

        dispatcher.dispatch(orchestration_item("explodes"));
        dispatcher.drain(Duration::from_secs(2)).await;

        let sent = hub.orchestration_completions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].instance_id, "explodes");
        assert_eq!(sent[0].completion_token, "tok-explodes");
        let Some(OrchestratorActionType::CompleteOrchestration(action)) =
            &sent[0].actions[0].orchestrator_action_type
        else {
            panic!("expected a complete-orchestration action");
        };
        let details = action.failure_details.as_ref().unwrap();
        assert_eq!(details.error_type, "panic");
        assert!(details.error_message.contains("rejected before any await"));
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatch_does_not_wait_for_handlers() {
        let hub = Arc::new(FakeTaskHub::new());
        let gate = Arc::new(Semaphore::new(0));

        let orchestrations = {
            let gate = Arc::clone(&gate);
            orchestration_handler(move |req: OrchestratorRequest| {
                let gate = Arc::clone(&gate);
                async move {
                    if req.instance_id == "blocked" {
                        let _permit = gate.acquire().await;
                    }
                    Ok(OrchestratorResponse {
                        instance_id: req.instance_id,
                        ..Default::default()
                    })
                }
            })
        };
        let dispatcher = dispatcher(&hub, orchestrations, echo_activities());

        dispatcher.dispatch(orchestration_item("blocked"));
        dispatcher.dispatch(orchestration_item("free"));
        within(hub.wait_until(|h| h.completion_count() == 1)).await;
        assert_eq!(hub.orchestration_completions()[0].instance_id, "free");

        gate.add_permits(1);
        within(hub.wait_until(|h| h.completion_count() == 2)).await;
        dispatcher.drain(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn no_local_cap_on_concurrent_items() {
        let hub = Arc::new(FakeTaskHub::new());
        let gate = Arc::new(Semaphore::new(0));
        let entered = Arc::new(AtomicUsize::new(0));

        let activities = {
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            activity_handler(move |_req: ActivityRequest| {
                let gate = Arc::clone(&gate);
                let entered = Arc::clone(&entered);
                async move {
                    entered.fetch_add(1, Ordering::SeqCst);
                    let _permit = gate.acquire().await;
                    Ok(ActivityResponse::default())
                }
            })
        };
        let dispatcher = dispatcher(&hub, echo_orchestrations(), activities);

        // The hint is 2; all fifty still run at once.
        for task_id in 0..50 {
            dispatcher.dispatch(activity_item("act", "i-1", task_id));
        }
        within(async {
            while entered.load(Ordering::SeqCst) < 50 {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert_eq!(dispatcher.in_flight(), 50);

        gate.add_permits(50);
        within(hub.wait_until(|h| h.completion_count() == 50)).await;
        dispatcher.drain(Duration::from_secs(5)).await;
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
