//! Rows, completion callbacks, and per-loader shared state.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use ballast_client_core::{ProcedureResponse, Value};

use crate::retry::RetryItem;

/// Caller-supplied opaque row handle, returned exactly once in the terminal
/// callback for that row.
pub type RowTag = Box<dyn Any + Send>;

/// Terminal notifications for accepted rows.
///
/// Every row accepted by [`crate::BulkLoader::insert_row`] eventually
/// receives exactly one of these calls.
pub trait CompletionHandler: Send + Sync + 'static {
    /// The row reached a terminal failure. `values` are the original field
    /// values as supplied by the caller.
    fn on_failure(&self, tag: RowTag, values: Vec<Value>, response: ProcedureResponse);

    /// The database accepted the row.
    fn on_success(&self, tag: RowTag, response: &ProcedureResponse) {
        let _ = (tag, response);
    }
}

/// One row travelling through a pipeline or the retry worker.
pub(crate) struct PendingRow {
    pub owner: Arc<LoaderShared>,
    pub tag: RowTag,
    pub values: Vec<Value>,
    /// Cancellation stamp: rows stamped below the owner's cancel epoch are
    /// discarded instead of batched.
    pub epoch: u64,
}

/// Per-loader state shared by the handle, its pipelines, and its retry
/// worker.
pub(crate) struct LoaderShared {
    pub handler: Arc<dyn CompletionHandler>,
    pub counters: LoaderCounters,
    pub retry_tx: mpsc::UnboundedSender<RetryItem>,
    pub closed: AtomicBool,
    pub cancel_epoch: AtomicU64,
}

impl LoaderShared {
    pub fn new(handler: Arc<dyn CompletionHandler>, retry_tx: mpsc::UnboundedSender<RetryItem>) -> Self {
        Self {
            handler,
            counters: LoaderCounters::default(),
            retry_tx,
            closed: AtomicBool::new(false),
            cancel_epoch: AtomicU64::new(0),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self, row: &PendingRow) -> bool {
        row.epoch < self.cancel_epoch.load(Ordering::SeqCst)
    }

    /// Reports a row that was rejected before ever entering a pipeline.
    pub fn reject_row(&self, tag: RowTag, values: Vec<Value>, response: ProcedureResponse) {
        self.handler.on_failure(tag, values, response);
        self.counters.rejected();
    }

    /// Reports a row that was queued but diverted to failure at batch-build
    /// time.
    pub fn fail_queued_row(&self, row: PendingRow, response: ProcedureResponse) {
        let PendingRow { owner: _, tag, values, .. } = row;
        self.handler.on_failure(tag, values, response);
        self.counters.queued_diverted();
    }
}

/// Eventually-consistent per-loader row accounting.
///
/// Every accepted row is, at any instant, in exactly one of: queued in a
/// pipeline, batched in flight, queued for retry, or in flight from the
/// retry worker; once terminal it moves to completed.
#[derive(Default)]
pub struct LoaderCounters {
    queued: AtomicI64,
    batched: AtomicI64,
    retry_queued: AtomicI64,
    retry_in_flight: AtomicI64,
    completed: AtomicI64,
}

impl LoaderCounters {
    pub(crate) fn accepted(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn accept_undone(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn queued_dropped(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn queued_diverted(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn row_batched(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
        self.batched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batched_succeeded(&self) {
        self.batched.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batched_degraded(&self) {
        self.batched.fetch_sub(1, Ordering::Relaxed);
        self.retry_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batched_failed(&self) {
        self.batched.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retry_started(&self) {
        self.retry_queued.fetch_sub(1, Ordering::Relaxed);
        self.retry_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retry_requeued(&self) {
        self.retry_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.retry_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retry_finished(&self) {
        self.retry_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retry_queued_dropped(&self) {
        self.retry_queued.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn retry_queued_failed(&self) {
        self.retry_queued.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Rows accepted but not yet terminal.
    pub fn outstanding(&self) -> u64 {
        let total = self.queued.load(Ordering::Relaxed)
            + self.batched.load(Ordering::Relaxed)
            + self.retry_queued.load(Ordering::Relaxed)
            + self.retry_in_flight.load(Ordering::Relaxed);
        total.max(0) as u64
    }

    /// Rows that reached a terminal state, failed rows included.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed).max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_the_row_lifecycle() {
        let counters = LoaderCounters::default();

        counters.accepted();
        counters.accepted();
        assert_eq!(counters.outstanding(), 2);
        assert_eq!(counters.completed(), 0);

        counters.row_batched();
        counters.row_batched();
        assert_eq!(counters.outstanding(), 2);

        counters.batched_succeeded();
        counters.batched_degraded();
        assert_eq!(counters.outstanding(), 1);
        assert_eq!(counters.completed(), 1);

        counters.retry_started();
        counters.retry_finished();
        assert_eq!(counters.outstanding(), 0);
        assert_eq!(counters.completed(), 2);
    }
}
