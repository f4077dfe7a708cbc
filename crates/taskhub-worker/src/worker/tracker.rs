//! Active work tracking.
//!
//! Every dispatched work item runs as its own Tokio task. [`ActiveWork`]
//! keeps the [`JoinHandle`] of each one so the worker can wait for in-flight
//! work when it stops. Records are appended exactly once at dispatch and
//! removed at most once, either by a prune pass (after they settled) or by the
//! final drain.
//!
//! Pruning is lazy: settled records are only swept when the tracker grows past
//! its threshold. This bounds memory under sustained load without putting a
//! cap on how many items actually run at once.

use super::telemetry::{decrement_work_items_inflight, increment_work_items_inflight};
use core::fmt;
use core::time::Duration;
use futures::future::join_all;
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// The kind of work a record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Orchestration,
    Activity,
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Orchestration => f.write_str("orchestration"),
            Self::Activity => f.write_str("activity"),
        }
    }
}

/// Handle to one in-flight dispatched execution.
#[derive(Debug)]
pub struct ActiveWorkRecord {
    instance_id: String,
    handle: JoinHandle<()>,
}

impl ActiveWorkRecord {
    pub const fn new(instance_id: String, handle: JoinHandle<()>) -> Self {
        Self {
            instance_id,
            handle,
        }
    }

    /// Returns `true` once the execution has settled.
    pub fn is_settled(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Result of a bounded drain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DrainSummary {
    /// Records that settled within the timeout.
    pub completed: usize,
    /// Instance ids of records still running at the timeout; these were
    /// aborted.
    pub aborted: Vec<String>,
}

/// Concurrency-safe, ordered collection of in-flight work for one item kind.
#[derive(Debug)]
pub struct ActiveWork {
    kind: WorkKind,
    records: Mutex<Vec<ActiveWorkRecord>>,
    prune_threshold: usize,
    in_flight: Arc<AtomicUsize>,
}

impl ActiveWork {
    pub fn new(kind: WorkKind, prune_threshold: usize) -> Self {
        Self {
            kind,
            records: Mutex::new(Vec::new()),
            prune_threshold,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub const fn kind(&self) -> WorkKind {
        self.kind
    }

    /// Appends a record, pruning settled records first if the tracker has
    /// grown past its threshold.
    pub fn track(&self, record: ActiveWorkRecord) {
        let mut records = self.records.lock();
        records.push(record);
        if records.len() > self.prune_threshold {
            let before = records.len();
            records.retain(|r| !r.is_settled());
            tracing::trace!(
                kind = %self.kind,
                pruned = before - records.len(),
                remaining = records.len(),
                "Pruned settled work records"
            );
        }
    }

    /// Number of records currently held (settled or not).
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Marks one execution as started. The returned guard marks it finished
    /// when dropped, including when the task is aborted.
    pub fn start(&self) -> InFlightGuard {
        let count = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        increment_work_items_inflight(self.kind);
        InFlightGuard {
            kind: self.kind,
            in_flight: Arc::clone(&self.in_flight),
            count,
        }
    }

    /// Number of executions currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits up to `timeout` for every tracked execution to settle, then
    /// aborts whatever is left. The tracker is empty afterwards.
    pub async fn drain(&self, timeout: Duration) -> DrainSummary {
        let records = core::mem::take(&mut *self.records.lock());
        if records.is_empty() {
            return DrainSummary::default();
        }

        let total = records.len();
        let (instance_ids, handles): (Vec<_>, Vec<_>) = records
            .into_iter()
            .map(|r| (r.instance_id, r.handle))
            .unzip();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(timeout, join_all(handles)).await;

        if joined.is_ok() {
            return DrainSummary {
                completed: total,
                aborted: Vec::new(),
            };
        }

        let mut aborted = Vec::new();
        for (instance_id, handle) in instance_ids.into_iter().zip(&aborts) {
            if !handle.is_finished() {
                handle.abort();
                aborted.push(instance_id);
            }
        }
        DrainSummary {
            completed: total - aborted.len(),
            aborted,
        }
    }
}

/// Decrements the in-flight count and gauge for its tracker on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    kind: WorkKind,
    in_flight: Arc<AtomicUsize>,
    count: usize,
}

impl InFlightGuard {
    /// In-flight count observed when this execution started, itself included.
    pub const fn count_at_start(&self) -> usize {
        self.count
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        decrement_work_items_inflight(self.kind);
    }
}
