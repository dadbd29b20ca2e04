//! The public loader handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::ensure;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use ballast_client_core::{ProcedureResponse, ProcedureStatus, TableSchema, Value};

use crate::error::{ClosedSnafu, Result};
use crate::pipeline::{Barrier, CloseBarrier, PipelineItem, PipelineSender};
use crate::registry::{RegistryInner, Route};
use crate::retry::RetryItem;
use crate::row::{LoaderShared, PendingRow, RowTag};

/// A handle for bulk-ingesting rows into one table.
///
/// Rows are accepted by [`insert_row`](Self::insert_row), batched per
/// partition, and reported terminally (success or failure) through the
/// loader's [`crate::CompletionHandler`]. Handles are cheap to share behind
/// an `Arc`; every method takes `&self`.
///
/// Call [`close`](Self::close) when done. A dropped-but-unclosed loader
/// leaks its table's pipelines until the registry itself is dropped.
pub struct BulkLoader {
    registry: Arc<RegistryInner>,
    table: String,
    schema: Arc<TableSchema>,
    route: Route,
    pipelines: Arc<Vec<PipelineSender>>,
    trigger: Arc<AtomicUsize>,
    shared: Arc<LoaderShared>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    flush_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl std::fmt::Debug for BulkLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkLoader")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl BulkLoader {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<RegistryInner>,
        table: String,
        schema: Arc<TableSchema>,
        route: Route,
        pipelines: Arc<Vec<PipelineSender>>,
        trigger: Arc<AtomicUsize>,
        shared: Arc<LoaderShared>,
        retry_task: JoinHandle<()>,
    ) -> Self {
        Self {
            registry,
            table,
            schema,
            route,
            pipelines,
            trigger,
            shared,
            retry_task: Mutex::new(Some(retry_task)),
            flush_task: Mutex::new(None),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// The current batch trigger size. May be lower than this loader asked
    /// for when another loader on the same table requested a smaller batch.
    pub fn max_batch_size(&self) -> usize {
        self.trigger.load(Ordering::SeqCst)
    }

    /// Rows accepted by this loader that have not yet reached a terminal
    /// state.
    pub fn outstanding_row_count(&self) -> u64 {
        self.shared.counters.outstanding()
    }

    /// Rows from this loader that reached a terminal state, failed rows
    /// included.
    pub fn completed_row_count(&self) -> u64 {
        self.shared.counters.completed()
    }

    /// Queues one row for ingestion.
    ///
    /// `tag` is returned verbatim in the row's terminal callback. `values`
    /// must have one entry per table column, coercible to the column types;
    /// rows that fail either check are reported through the handler and
    /// `Ok(())` is still returned. The call blocks only when the target
    /// partition's queue is full.
    pub async fn insert_row(&self, tag: RowTag, values: Vec<Value>) -> Result<()> {
        ensure!(!self.shared.is_closed(), ClosedSnafu);

        if values.len() != self.schema.column_count() {
            let response = ProcedureResponse::failure(
                ProcedureStatus::GracefulFailure,
                format!(
                    "expected {} fields, got {}",
                    self.schema.column_count(),
                    values.len()
                ),
            );
            self.shared.reject_row(tag, values, response);
            return Ok(());
        }

        let index = match self.route {
            Route::SinglePartition {
                column,
                column_type,
            } => {
                let partition = match self
                    .registry
                    .client()
                    .partition_for(column_type, &values[column])
                {
                    Ok(partition) => partition,
                    Err(err) => {
                        let response = ProcedureResponse::failure(
                            ProcedureStatus::GracefulFailure,
                            err.to_string(),
                        );
                        self.shared.reject_row(tag, values, response);
                        return Ok(());
                    }
                };
                partition as usize % self.pipelines.len()
            }
            Route::MultiPartition => 0,
        };

        let row = PendingRow {
            owner: self.shared.clone(),
            tag,
            values,
            epoch: self.shared.cancel_epoch.load(Ordering::SeqCst),
        };
        self.shared.counters.accepted();
        if let Err(send_error) = self.pipelines[index].tx.send(PipelineItem::Row(row)).await {
            // The pipeline is gone; the row never entered it.
            if let PipelineItem::Row(row) = send_error.0 {
                self.shared.counters.accept_undone();
                let PendingRow { tag, values, .. } = row;
                self.shared
                    .reject_row(tag, values, ProcedureResponse::connection_lost());
            }
        }
        Ok(())
    }

    /// Submits every partial batch currently accumulated, whatever its size.
    pub async fn flush(&self) {
        for pipeline in self.pipelines.iter() {
            let _ = pipeline.tx.send(PipelineItem::Flush).await;
        }
    }

    /// Starts, changes, or stops (with `None`) a periodic background flush.
    pub fn set_flush_interval(&self, interval: Option<Duration>) {
        let mut slot = self.flush_task.lock().expect("flush task slot poisoned");
        if let Some((ct, _task)) = slot.take() {
            ct.cancel();
        }
        let Some(period) = interval else {
            return;
        };

        let ct = CancellationToken::new();
        let task_ct = ct.clone();
        let pipelines = self.pipelines.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval's first tick is immediate; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_ct.cancelled() => break,
                    _ = ticker.tick() => {
                        for pipeline in pipelines.iter() {
                            if pipeline.tx.send(PipelineItem::Flush).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        *slot = Some((ct, task));
    }

    /// Waits until every row inserted before this call has reached a
    /// terminal state. Rows inserted concurrently with the drain may or may
    /// not be covered.
    pub async fn drain(&self) {
        let mut acks = Vec::with_capacity(self.pipelines.len());
        for pipeline in self.pipelines.iter() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if pipeline
                .tx
                .send(PipelineItem::Drain(Barrier { ack: ack_tx }))
                .await
                .is_ok()
            {
                acks.push(ack_rx);
            }
        }
        for ack in acks {
            let _ = ack.await;
        }

        // Rows degraded by batches that failed during the drain are already
        // queued ahead of this token.
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.shared.retry_tx.send(RetryItem::Drain(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Flushes, waits for every accepted row to reach a terminal state, and
    /// releases this loader's share of the table. Further
    /// [`insert_row`](Self::insert_row) calls fail with
    /// [`crate::LoaderError::Closed`]. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_flush_interval(None);

        for pipeline in self.pipelines.iter() {
            let (ack_tx, ack_rx) = oneshot::channel();
            let barrier = CloseBarrier {
                owner: self.shared.clone(),
                ack: ack_tx,
            };
            if pipeline
                .tx
                .send(PipelineItem::Close(barrier))
                .await
                .is_ok()
            {
                let _ = ack_rx.await;
            }
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.shared.retry_tx.send(RetryItem::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let retry_task = self
            .retry_task
            .lock()
            .expect("retry task slot poisoned")
            .take();
        if let Some(task) = retry_task {
            let _ = task.await;
        }

        self.registry.release(&self.table).await;
    }

    /// Discards this loader's rows that are still queued and un-batched.
    /// Rows already in a batch, in flight, or mid-retry are unaffected and
    /// still complete through the handler; discarded rows get no callback.
    pub async fn cancel_queued(&self) {
        self.shared.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        for pipeline in self.pipelines.iter() {
            let item = PipelineItem::CancelQueued {
                owner: self.shared.clone(),
            };
            let _ = pipeline.tx.send(item).await;
        }
    }
}

impl Drop for BulkLoader {
    fn drop(&mut self) {
        if !self.shared.is_closed() {
            warn!(table = %self.table, "loader dropped without close");
        }
    }
}
