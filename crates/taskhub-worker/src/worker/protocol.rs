//! # Protocol handler
//!
//! [`ProtocolHandler`] owns the worker's session with the coordinator. It
//! opens the `GetWorkItems` stream, reads items one at a time and hands each
//! to the [`Dispatcher`], reconnecting after a fixed delay whenever the stream
//! fails or closes. Only the supervising cancellation signal ends the loop;
//! there is no retry limit.
//!
//! ## Session states
//!
//! ```text
//! Stopped -> Connecting -> Streaming -> Backoff -> Connecting -> ... -> Stopped
//! ```
//!
//! - A signal that is already triggered before the first connect goes straight
//!   to `Stopped` without any RPC.
//! - Cancellation in any state goes to `Stopped`.
//! - A handler failure never changes the session state.
//!
//! On `Stopped` the handler stops reading and waits, for at most the
//! configured drain timeout, on the work it already dispatched.

use super::{
    client::TaskHubClient,
    config::WorkerOptions,
    dispatcher::{ActivityHandler, Dispatcher, OrchestrationHandler},
    signal::ShutdownSignal,
    telemetry::increment_reconnects,
};
use core::fmt;
use std::sync::Arc;
use taskhub_core::{Error, Result, proto::GetWorkItemsRequest};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Where the worker is in its connect/stream/backoff cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Stopped,
    Connecting,
    Streaming,
    Backoff,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Connecting => f.write_str("connecting"),
            Self::Streaming => f.write_str("streaming"),
            Self::Backoff => f.write_str("backoff"),
        }
    }
}

pub struct ProtocolHandler<C> {
    client: Arc<C>,
    options: WorkerOptions,
    disposal: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl<C: TaskHubClient> ProtocolHandler<C> {
    /// Creates a handler with the given concurrency limits and default
    /// timings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if either limit is not positive. No
    /// RPC is attempted.
    pub fn new(
        client: Arc<C>,
        max_concurrent_work_items: i32,
        max_concurrent_activities: i32,
    ) -> Result<Self> {
        let options = WorkerOptions::new(max_concurrent_work_items, max_concurrent_activities)?;
        Ok(Self::with_options(client, options))
    }

    pub fn with_options(client: Arc<C>, options: WorkerOptions) -> Self {
        Self {
            client,
            options,
            disposal: CancellationToken::new(),
            state: watch::Sender::new(SessionState::Stopped),
        }
    }

    pub const fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Subscribes to session state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Stops a running [`start`](Self::start) as if its token had fired.
    /// Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        if self.disposal.is_cancelled() {
            return;
        }
        tracing::info!("Shutting down protocol handler");
        self.disposal.cancel();
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::trace!(from = %previous, to = %state, "Session state changed");
        }
    }

    /// Streams work items and dispatches them to the given handlers until
    /// `cancel` fires or [`shutdown`](Self::shutdown) is called.
    ///
    /// Transport failures are retried forever and never surface here. Returns
    /// once the loop has stopped and in-flight work has been drained.
    pub async fn start(
        &self,
        orchestrations: OrchestrationHandler,
        activities: ActivityHandler,
        cancel: CancellationToken,
    ) {
        let signal = ShutdownSignal::new(cancel, self.disposal.clone());
        if signal.is_cancelled() {
            tracing::debug!("Cancelled before start; not connecting");
            self.set_state(SessionState::Stopped);
            return;
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.client),
            orchestrations,
            activities,
            signal.clone(),
            &self.options,
        );
        let request = GetWorkItemsRequest {
            max_concurrent_orchestration_work_items: self.options.max_concurrent_work_items(),
            max_concurrent_activity_work_items: self.options.max_concurrent_activities(),
        };

        loop {
            self.set_state(SessionState::Connecting);
            let reason = self.run_session(&dispatcher, request.clone(), &signal).await;
            if reason.is_cancelled() || signal.is_cancelled() {
                break;
            }

            tracing::warn!(
                error = %reason,
                retry_in = ?self.options.reconnect_delay(),
                "Work item stream ended; reconnecting"
            );
            self.set_state(SessionState::Backoff);
            increment_reconnects();

            tokio::select! {
                biased;
                () = signal.cancelled() => break,
                () = tokio::time::sleep(self.options.reconnect_delay()) => {}
            }
        }

        self.set_state(SessionState::Stopped);
        tracing::info!(
            in_flight = dispatcher.in_flight(),
            "Work item stream stopped; draining in-flight work"
        );
        dispatcher.drain(self.options.drain_timeout()).await;
    }

    /// Runs one connect-and-read session and returns why it ended.
    async fn run_session(
        &self,
        dispatcher: &Dispatcher<C>,
        request: GetWorkItemsRequest,
        signal: &ShutdownSignal,
    ) -> Error {
        let hints = (
            request.max_concurrent_orchestration_work_items,
            request.max_concurrent_activity_work_items,
        );
        let mut stream = tokio::select! {
            biased;
            () = signal.cancelled() => return Error::Cancelled,
            opened = self.client.get_work_items(request) => match opened {
                Ok(stream) => stream,
                Err(status) => return Error::Stream(status),
            },
        };

        self.set_state(SessionState::Streaming);
        tracing::info!(
            max_concurrent_work_items = hints.0,
            max_concurrent_activities = hints.1,
            "Connected to task hub; streaming work items"
        );

        loop {
            tokio::select! {
                biased;
                () = signal.cancelled() => return Error::Cancelled,
                next = stream.next() => match next {
                    Some(Ok(item)) => {
                        dispatcher.dispatch(item);
                    }
                    Some(Err(status)) => return Error::Stream(status),
                    None => return Error::StreamClosed,
                },
            }
        }
    }
}
