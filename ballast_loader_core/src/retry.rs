//! Per-loader retry worker.
//!
//! A failed batch carries no information about which row caused it, so every
//! row of the batch is handed here and resubmitted as a one-row batch. Each
//! loader has one dedicated worker; its queue is unbounded so pipeline
//! completion processing never blocks on a full retry queue.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{future, FutureExt, StreamExt};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use ballast_client_core::{
    ProcedureCall, ProcedureClient, ProcedureResponse, ProcedureStatus, RowSet, TableSchema,
};

use crate::barrier::CompletionTracker;
use crate::row::PendingRow;

pub(crate) enum RetryItem {
    /// A row from a failed batch, to be resubmitted individually.
    Row(PendingRow),
    /// Worker-internal: a row resubmitted after a connection-lost response,
    /// keeping its original submission sequence so armed barriers still wait
    /// for it.
    Requeue { row: PendingRow, seq: u64 },
    /// Acknowledged once every row in flight at issue time has completed.
    Drain(oneshot::Sender<()>),
    /// Like `Drain`, but the worker exits after acknowledging; re-issues
    /// itself if rows raced in behind the token.
    Close(oneshot::Sender<()>),
}

pub(crate) struct RetryConfig {
    pub client: Arc<dyn ProcedureClient>,
    pub schema: Arc<TableSchema>,
    pub procedure: &'static str,
    pub partition_column: Option<usize>,
    pub upsert: bool,
}

pub(crate) fn spawn_retry_worker(
    config: RetryConfig,
    ct: CancellationToken,
) -> (mpsc::UnboundedSender<RetryItem>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = RetryWorker {
        client: config.client,
        schema: config.schema,
        procedure: config.procedure,
        partition_column: config.partition_column,
        upsert: config.upsert,
        self_tx: tx.clone(),
    };
    let task = tokio::spawn(worker.run(rx, ct));
    (tx, task)
}

enum Token {
    Drain(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

type RetryOutcome = (u64, PendingRow, ProcedureResponse);
type InFlight = FuturesUnordered<BoxFuture<'static, RetryOutcome>>;

struct RetryWorker {
    client: Arc<dyn ProcedureClient>,
    schema: Arc<TableSchema>,
    procedure: &'static str,
    partition_column: Option<usize>,
    upsert: bool,
    self_tx: mpsc::UnboundedSender<RetryItem>,
}

impl RetryWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RetryItem>, ct: CancellationToken) {
        trace!(table = %self.schema.table(), "retry worker started");
        let mut in_flight: InFlight = FuturesUnordered::new();
        let mut tracker: CompletionTracker<Token> = CompletionTracker::new();

        'main: loop {
            tokio::select! {
                _ = ct.cancelled() => break 'main,
                item = rx.recv() => {
                    let Some(item) = item else { break 'main };
                    let tokens = self.handle_item(item, &mut in_flight, &mut tracker).await;
                    if self.process_tokens(tokens, &mut rx, &mut in_flight, &mut tracker).await {
                        break 'main;
                    }
                }
                Some((seq, row, response)) = in_flight.next(), if !in_flight.is_empty() => {
                    let tokens = self.complete_row(seq, row, response, &mut tracker);
                    if self.process_tokens(tokens, &mut rx, &mut in_flight, &mut tracker).await {
                        break 'main;
                    }
                }
            }
        }
        trace!(table = %self.schema.table(), "retry worker stopped");
    }

    /// Handles one queue item; returns any barrier tokens that fired
    /// immediately.
    async fn handle_item(
        &mut self,
        item: RetryItem,
        in_flight: &mut InFlight,
        tracker: &mut CompletionTracker<Token>,
    ) -> Vec<Token> {
        match item {
            RetryItem::Row(row) => {
                if row.owner.is_cancelled(&row) {
                    row.owner.counters.retry_queued_dropped();
                    return Vec::new();
                }
                row.owner.counters.retry_started();
                let seq = tracker.begin();
                self.submit_row(row, seq, in_flight).await;
                Vec::new()
            }
            RetryItem::Requeue { row, seq } => {
                if row.owner.is_cancelled(&row) {
                    row.owner.counters.retry_queued_dropped();
                    return tracker.complete(seq);
                }
                row.owner.counters.retry_started();
                self.submit_row(row, seq, in_flight).await;
                Vec::new()
            }
            RetryItem::Drain(ack) => tracker.arm(Token::Drain(ack)).into_iter().collect(),
            RetryItem::Close(ack) => tracker.arm(Token::Close(ack)).into_iter().collect(),
        }
    }

    /// Acknowledges fired tokens. Returns true when a close token completed
    /// and the worker should exit.
    async fn process_tokens(
        &mut self,
        tokens: Vec<Token>,
        rx: &mut mpsc::UnboundedReceiver<RetryItem>,
        in_flight: &mut InFlight,
        tracker: &mut CompletionTracker<Token>,
    ) -> bool {
        for token in tokens {
            match token {
                Token::Drain(ack) => {
                    let _ = ack.send(());
                }
                Token::Close(ack) => {
                    if self.finish_close(ack, rx, in_flight, tracker).await {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// A close token reached zero: check for rows that raced in behind it,
    /// re-issuing the token until the queue is truly empty, then
    /// acknowledge and stop.
    async fn finish_close(
        &mut self,
        ack: oneshot::Sender<()>,
        rx: &mut mpsc::UnboundedReceiver<RetryItem>,
        in_flight: &mut InFlight,
        tracker: &mut CompletionTracker<Token>,
    ) -> bool {
        let mut ack = ack;
        loop {
            let mut saw_row = false;
            loop {
                match rx.try_recv() {
                    Ok(RetryItem::Row(row)) => {
                        saw_row = true;
                        if row.owner.is_cancelled(&row) {
                            row.owner.counters.retry_queued_dropped();
                        } else {
                            row.owner.counters.retry_started();
                            let seq = tracker.begin();
                            self.submit_row(row, seq, in_flight).await;
                        }
                    }
                    Ok(RetryItem::Requeue { row, seq }) => {
                        saw_row = true;
                        if row.owner.is_cancelled(&row) {
                            row.owner.counters.retry_queued_dropped();
                            let _ = tracker.complete(seq);
                        } else {
                            row.owner.counters.retry_started();
                            self.submit_row(row, seq, in_flight).await;
                        }
                    }
                    Ok(RetryItem::Drain(drain_ack)) => {
                        if let Some(Token::Drain(a)) = tracker.arm(Token::Drain(drain_ack)) {
                            let _ = a.send(());
                        }
                    }
                    Ok(RetryItem::Close(_)) => {}
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            if !saw_row && tracker.in_flight_count() == 0 {
                let _ = ack.send(());
                return true;
            }

            match tracker.arm(Token::Close(ack)) {
                Some(Token::Close(again)) => {
                    // Everything already completed; sweep the queue again.
                    ack = again;
                }
                Some(Token::Drain(_)) => unreachable!("close token armed as drain"),
                None => return false,
            }
        }
    }

    /// Rebuilds a one-row batch and dispatches it.
    async fn submit_row(&mut self, row: PendingRow, seq: u64, in_flight: &mut InFlight) {
        let coerced = match self.schema.coerce_row(&row.values) {
            Ok(coerced) => coerced,
            Err(err) => {
                // The row passed batch-build coercion once, so this is not
                // expected; report it rather than dropping the row.
                let response = ProcedureResponse::failure(
                    ProcedureStatus::GracefulFailure,
                    err.to_string(),
                );
                in_flight.push(future::ready((seq, row, response)).boxed());
                return;
            }
        };

        let mut rows = RowSet::new(self.schema.clone());
        rows.push_row(coerced);

        loop {
            let partition_key = self.partition_column.map(|idx| &rows.rows()[0][idx]);
            let call = ProcedureCall {
                procedure: self.procedure,
                table: self.schema.table(),
                partition_key,
                upsert: self.upsert,
                rows: &rows,
            };
            match self.client.submit(call).await {
                Ok(pending_call) => {
                    in_flight.push(
                        async move {
                            let response = pending_call.response().await;
                            (seq, row, response)
                        }
                        .boxed(),
                    );
                    return;
                }
                Err(err) => {
                    if self.client.auto_reconnect_enabled() {
                        warn!(table = %self.schema.table(), %err,
                            "transport failure, retry worker suspended until reconnect");
                        self.client.wait_reconnected().await;
                        continue;
                    }
                    in_flight.push(
                        future::ready((seq, row, ProcedureResponse::connection_lost())).boxed(),
                    );
                    return;
                }
            }
        }
    }

    /// Processes one row completion; returns any barrier tokens it
    /// satisfied. A connection-lost response under auto-reconnect re-queues
    /// the row instead of failing it, keeping its sequence outstanding.
    fn complete_row(
        &mut self,
        seq: u64,
        row: PendingRow,
        response: ProcedureResponse,
        tracker: &mut CompletionTracker<Token>,
    ) -> Vec<Token> {
        if response.status == ProcedureStatus::ConnectionLost
            && self.client.auto_reconnect_enabled()
        {
            row.owner.counters.retry_requeued();
            match self.self_tx.send(RetryItem::Requeue { row, seq }) {
                Ok(()) => return Vec::new(),
                Err(send_error) => {
                    let RetryItem::Requeue { row, .. } = send_error.0 else {
                        return Vec::new();
                    };
                    row.owner.counters.retry_started();
                    let owner = row.owner.clone();
                    let PendingRow { tag, values, .. } = row;
                    owner.handler.on_failure(tag, values, response);
                    owner.counters.retry_finished();
                    return tracker.complete(seq);
                }
            }
        }

        let owner = row.owner.clone();
        let PendingRow { tag, values, .. } = row;
        if response.status.is_success() {
            owner.handler.on_success(tag, &response);
        } else {
            owner.handler.on_failure(tag, values, response);
        }
        owner.counters.retry_finished();
        tracker.complete(seq)
    }
}
