//! Per-partition batching pipeline.
//!
//! One worker task per (table, partition), plus one for the multi-partition
//! slot. The worker owns all pipeline state: it accumulates rows from a
//! bounded queue, builds a batch when the queue delivers the trigger-size'th
//! row, submits batches asynchronously, and processes completions from the
//! same `select!` loop. Rows are batched in submission order and batches are
//! submitted in build order; completions may arrive out of order, which the
//! barrier machinery in [`crate::barrier`] accounts for.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{future, FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use ballast_client_core::{
    PartitionId, ProcedureCall, ProcedureClient, ProcedureResponse, ProcedureStatus, RowSet,
    TableSchema,
};

use crate::barrier::CompletionTracker;
use crate::buffer::BufferPool;
use crate::retry::RetryItem;
use crate::row::{LoaderShared, PendingRow};

/// Acknowledged once every batch submitted before the token has completed.
pub(crate) struct Barrier {
    pub ack: oneshot::Sender<()>,
}

/// Like [`Barrier`], but bound to one loader: if rows of that loader are
/// found un-batched when the barrier would fire, it flushes and re-arms
/// itself until the pipeline holds none of them.
pub(crate) struct CloseBarrier {
    pub owner: Arc<LoaderShared>,
    pub ack: oneshot::Sender<()>,
}

/// Everything that travels through a pipeline's queue.
pub(crate) enum PipelineItem {
    Row(PendingRow),
    Flush,
    Drain(Barrier),
    Close(CloseBarrier),
    CancelQueued { owner: Arc<LoaderShared> },
}

/// Queue endpoint of one pipeline, shared by every loader on the table.
#[derive(Clone)]
pub(crate) struct PipelineSender {
    pub partition: Option<PartitionId>,
    pub tx: mpsc::Sender<PipelineItem>,
}

pub(crate) struct PipelineConfig {
    pub client: Arc<dyn ProcedureClient>,
    pub schema: Arc<TableSchema>,
    pub procedure: &'static str,
    /// `None` for the multi-partition pipeline.
    pub partition: Option<PartitionId>,
    pub partition_column: Option<usize>,
    pub upsert: bool,
    pub trigger: Arc<AtomicUsize>,
    pub queue_capacity: usize,
    pub pool_retain: usize,
}

pub(crate) fn spawn_pipeline(
    config: PipelineConfig,
    ct: CancellationToken,
) -> (PipelineSender, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let sender = PipelineSender {
        partition: config.partition,
        tx,
    };
    let worker = PipelineWorker {
        table: config.schema.table().to_string(),
        pool: BufferPool::new(config.schema.clone(), config.pool_retain),
        schema: config.schema,
        client: config.client,
        procedure: config.procedure,
        partition: config.partition,
        partition_column: config.partition_column,
        upsert: config.upsert,
        trigger: config.trigger,
        pending: Vec::new(),
    };
    let task = tokio::spawn(worker.run(rx, ct));
    (sender, task)
}

struct Batch {
    rows: Vec<PendingRow>,
    buffer: RowSet,
}

type BatchOutcome = (u64, Batch, ProcedureResponse);
type InFlight = FuturesUnordered<BoxFuture<'static, BatchOutcome>>;

enum Waiting {
    Drain(Barrier),
    Close(CloseBarrier),
}

struct PipelineWorker {
    client: Arc<dyn ProcedureClient>,
    schema: Arc<TableSchema>,
    table: String,
    procedure: &'static str,
    partition: Option<PartitionId>,
    partition_column: Option<usize>,
    upsert: bool,
    trigger: Arc<AtomicUsize>,
    pool: BufferPool,
    pending: Vec<PendingRow>,
}

impl PipelineWorker {
    fn trigger_size(&self) -> usize {
        self.trigger.load(Ordering::Relaxed).max(1)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PipelineItem>, ct: CancellationToken) {
        trace!(table = %self.table, partition = ?self.partition, "pipeline worker started");
        let mut in_flight: InFlight = FuturesUnordered::new();
        let mut tracker: CompletionTracker<Waiting> = CompletionTracker::new();

        loop {
            tokio::select! {
                _ = ct.cancelled() => break,
                item = rx.recv() => {
                    let Some(item) = item else { break };
                    self.handle_item(item, &mut in_flight, &mut tracker).await;
                }
                Some((seq, batch, response)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.complete_batch(batch, response);
                    let fired = tracker.complete(seq);
                    self.resolve_fired(fired, &mut in_flight, &mut tracker).await;
                }
            }
        }

        // Queue closed or cancelled: the channel can still hold items that
        // arrived behind an already-acknowledged close barrier. Refuse new
        // sends (a racing insert gets its row back and reports it), then
        // pull out what is buffered, push every remaining row through, and
        // see the in-flight batches to completion so no accepted row goes
        // unreported.
        rx.close();
        let mut stranded: Vec<Waiting> = Vec::new();
        while let Ok(item) = rx.try_recv() {
            match item {
                PipelineItem::Row(row) => {
                    if row.owner.is_cancelled(&row) {
                        row.owner.counters.queued_dropped();
                    } else {
                        self.pending.push(row);
                    }
                }
                PipelineItem::Flush => {}
                PipelineItem::Drain(barrier) => stranded.push(Waiting::Drain(barrier)),
                PipelineItem::Close(barrier) => stranded.push(Waiting::Close(barrier)),
                PipelineItem::CancelQueued { owner } => {
                    self.pending.retain(|row| {
                        if Arc::ptr_eq(&row.owner, &owner) && owner.is_cancelled(row) {
                            owner.counters.queued_dropped();
                            false
                        } else {
                            true
                        }
                    });
                }
            }
        }
        if !self.pending.is_empty() {
            self.submit_pending(&mut in_flight, &mut tracker).await;
        }
        for waiting in stranded {
            if let Some(waiting) = tracker.arm(waiting) {
                self.resolve_fired(vec![waiting], &mut in_flight, &mut tracker)
                    .await;
            }
        }
        while let Some((seq, batch, response)) = in_flight.next().await {
            self.complete_batch(batch, response);
            let fired = tracker.complete(seq);
            self.resolve_fired(fired, &mut in_flight, &mut tracker).await;
        }
        trace!(table = %self.table, partition = ?self.partition, "pipeline worker stopped");
    }

    async fn handle_item(
        &mut self,
        item: PipelineItem,
        in_flight: &mut InFlight,
        tracker: &mut CompletionTracker<Waiting>,
    ) {
        match item {
            PipelineItem::Row(row) => {
                if row.owner.is_cancelled(&row) {
                    row.owner.counters.queued_dropped();
                    return;
                }
                self.pending.push(row);
                if self.pending.len() >= self.trigger_size() {
                    self.submit_pending(in_flight, tracker).await;
                }
            }
            PipelineItem::Flush => {
                if !self.pending.is_empty() {
                    self.submit_pending(in_flight, tracker).await;
                }
            }
            PipelineItem::Drain(barrier) => {
                if !self.pending.is_empty() {
                    self.submit_pending(in_flight, tracker).await;
                }
                if let Some(waiting) = tracker.arm(Waiting::Drain(barrier)) {
                    self.resolve_fired(vec![waiting], in_flight, tracker).await;
                }
            }
            PipelineItem::Close(barrier) => {
                if !self.pending.is_empty() {
                    self.submit_pending(in_flight, tracker).await;
                }
                if let Some(waiting) = tracker.arm(Waiting::Close(barrier)) {
                    self.resolve_fired(vec![waiting], in_flight, tracker).await;
                }
            }
            PipelineItem::CancelQueued { owner } => {
                self.pending.retain(|row| {
                    if Arc::ptr_eq(&row.owner, &owner) && owner.is_cancelled(row) {
                        owner.counters.queued_dropped();
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }

    async fn resolve_fired(
        &mut self,
        fired: Vec<Waiting>,
        in_flight: &mut InFlight,
        tracker: &mut CompletionTracker<Waiting>,
    ) {
        for waiting in fired {
            match waiting {
                Waiting::Drain(barrier) => {
                    let _ = barrier.ack.send(());
                }
                Waiting::Close(barrier) => {
                    let raced_in = self.pending.iter().any(|row| {
                        Arc::ptr_eq(&row.owner, &barrier.owner)
                            && !barrier.owner.is_cancelled(row)
                    });
                    if !raced_in {
                        let _ = barrier.ack.send(());
                        continue;
                    }
                    // Rows slipped in between the close token and its
                    // acknowledgment: flush them and re-arm.
                    debug!(table = %self.table, partition = ?self.partition,
                        "close barrier found late rows, re-arming");
                    self.submit_pending(in_flight, tracker).await;
                    if let Some(Waiting::Close(barrier)) = tracker.arm(Waiting::Close(barrier)) {
                        let _ = barrier.ack.send(());
                    }
                }
            }
        }
    }

    /// Builds and submits batches until nothing is pending.
    async fn submit_pending(
        &mut self,
        in_flight: &mut InFlight,
        tracker: &mut CompletionTracker<Waiting>,
    ) {
        while !self.pending.is_empty() {
            self.build_and_submit(in_flight, tracker).await;
        }
    }

    /// Builds one batch of up to trigger-size rows and dispatches it.
    ///
    /// Rows whose fields cannot be coerced to the table's column types are
    /// diverted to an immediate failure notification; the rest of the batch
    /// proceeds.
    async fn build_and_submit(
        &mut self,
        in_flight: &mut InFlight,
        tracker: &mut CompletionTracker<Waiting>,
    ) {
        let take = self.trigger_size().min(self.pending.len());
        let rows: Vec<PendingRow> = self.pending.drain(..take).collect();

        let mut buffer = self.pool.acquire();
        let mut kept: Vec<PendingRow> = Vec::with_capacity(rows.len());
        for row in rows {
            match self.schema.coerce_row(&row.values) {
                Ok(coerced) => {
                    buffer.push_row(coerced);
                    kept.push(row);
                }
                Err(err) => {
                    let owner = row.owner.clone();
                    owner.fail_queued_row(
                        row,
                        ProcedureResponse::failure(
                            ProcedureStatus::GracefulFailure,
                            err.to_string(),
                        ),
                    );
                }
            }
        }

        if kept.is_empty() {
            self.pool.release(buffer);
            return;
        }

        for row in &kept {
            row.owner.counters.row_batched();
        }
        let seq = tracker.begin();
        let batch = Batch {
            rows: kept,
            buffer,
        };

        loop {
            let partition_key = self
                .partition_column
                .map(|idx| &batch.buffer.rows()[0][idx]);
            let call = ProcedureCall {
                procedure: self.procedure,
                table: &self.table,
                partition_key,
                upsert: self.upsert,
                rows: &batch.buffer,
            };
            match self.client.submit(call).await {
                Ok(pending_call) => {
                    in_flight.push(
                        async move {
                            let response = pending_call.response().await;
                            (seq, batch, response)
                        }
                        .boxed(),
                    );
                    return;
                }
                Err(err) => {
                    if self.client.auto_reconnect_enabled() {
                        warn!(table = %self.table, partition = ?self.partition, %err,
                            "transport failure, pipeline suspended until reconnect");
                        self.client.wait_reconnected().await;
                        continue;
                    }
                    // No reconnect coming: deliver a synthesized
                    // connection-lost response through the normal
                    // completion path.
                    in_flight.push(
                        future::ready((seq, batch, ProcedureResponse::connection_lost()))
                            .boxed(),
                    );
                    return;
                }
            }
        }
    }

    /// Processes one batch completion: returns the buffer to the pool, then
    /// notifies successes off this worker or degrades failures to per-row
    /// retries.
    fn complete_batch(&mut self, batch: Batch, response: ProcedureResponse) {
        let Batch { rows, buffer } = batch;
        self.pool.release(buffer);

        if response.status.is_success() {
            for row in &rows {
                row.owner.counters.batched_succeeded();
            }
            tokio::spawn(async move {
                for row in rows {
                    let PendingRow { owner, tag, .. } = row;
                    owner.handler.on_success(tag, &response);
                }
            });
            return;
        }

        // A batch failure carries no information about which row caused it;
        // every row is handed to its owner's retry worker for independent
        // resubmission.
        debug!(table = %self.table, partition = ?self.partition,
            rows = rows.len(), status = ?response.status,
            "batch failed, degrading to single-row retries");
        for row in rows {
            row.owner.counters.batched_degraded();
            let retry_tx = row.owner.retry_tx.clone();
            if let Err(send_error) = retry_tx.send(RetryItem::Row(row)) {
                if let RetryItem::Row(row) = send_error.0 {
                    let owner = row.owner.clone();
                    let PendingRow { tag, values, .. } = row;
                    owner.handler.on_failure(tag, values, response.clone());
                    owner.counters.retry_queued_failed();
                }
            }
        }
    }
}
