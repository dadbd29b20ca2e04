//! In-memory implementation of the procedure client trait.
//!
//! This implementation keeps all table data in memory and is suitable for
//! testing and development. Faults can be scripted to exercise the loader's
//! failure paths: one-shot faults apply to load submissions in order, and
//! persistent reject rules refuse any batch containing a matching row.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tracing::trace;

use crate::call::{
    PendingCall, ProcedureCall, ProcedureResponse, ProcedureStatus, LOAD_MULTI_PARTITION_TABLE,
    LOAD_SINGLE_PARTITION_TABLE,
};
use crate::client::ProcedureClient;
use crate::error::{
    ClientError, Result, TableAlreadyExistsSnafu, TableNotFoundSnafu, TransportError, TypeError,
};
use crate::schema::{DeploymentInfo, PartitionId, TableSchema};
use crate::value::{ColumnType, Value};

/// A scripted one-shot fault, consumed by the next load submission.
#[derive(Debug, Clone)]
pub enum Fault {
    /// The submission fails at the transport level: the call is never
    /// dispatched and no response will arrive.
    Transport { message: String },
    /// The submission is dispatched and the server replies with the given
    /// non-success status.
    Reject {
        status: ProcedureStatus,
        message: String,
    },
}

/// A record of one load submission, kept for test assertions.
#[derive(Debug, Clone)]
pub struct SubmittedBatch {
    pub procedure: String,
    pub table: String,
    pub partition_key: Option<Value>,
    pub row_count: usize,
    pub upsert: bool,
}

#[derive(Debug, Clone)]
struct RejectRule {
    column: usize,
    value: Value,
    message: String,
}

#[derive(Default)]
struct DatabaseStore {
    tables: HashMap<String, TableState>,
    faults: VecDeque<Fault>,
    reject_rules: Vec<RejectRule>,
    submissions: Vec<SubmittedBatch>,
}

struct TableState {
    schema: Arc<TableSchema>,
    rows: Vec<Vec<Value>>,
}

/// In-memory stand-in for the database connection.
pub struct InMemoryDatabase {
    store: RwLock<DatabaseStore>,
    deployment: DeploymentInfo,
    auto_reconnect: bool,
    reconnect_epoch: AtomicU64,
    reconnected: Notify,
}

impl InMemoryDatabase {
    pub fn new(deployment: DeploymentInfo) -> Self {
        Self {
            store: RwLock::new(DatabaseStore::default()),
            deployment,
            auto_reconnect: false,
            reconnect_epoch: AtomicU64::new(0),
            reconnected: Notify::new(),
        }
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub async fn create_table(&self, schema: TableSchema) -> Result<()> {
        let mut store = self.store.write().await;
        let table = schema.table().to_string();
        if store.tables.contains_key(&table) {
            return TableAlreadyExistsSnafu { table }.fail();
        }
        store.tables.insert(
            table,
            TableState {
                schema: Arc::new(schema),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    /// Queues a one-shot fault for the next load submission.
    pub async fn push_fault(&self, fault: Fault) {
        self.store.write().await.faults.push_back(fault);
    }

    /// Any batch containing a row whose `column` equals `value` is rejected
    /// with a graceful failure. The rule is persistent, so the row keeps
    /// failing when retried individually while its batch-mates succeed.
    pub async fn reject_rows_matching(&self, column: usize, value: Value, message: &str) {
        self.store.write().await.reject_rules.push(RejectRule {
            column,
            value,
            message: message.to_string(),
        });
    }

    /// Signals pipelines suspended on [`ProcedureClient::wait_reconnected`].
    pub fn trigger_reconnect(&self) {
        self.reconnect_epoch.fetch_add(1, Ordering::SeqCst);
        self.reconnected.notify_waiters();
    }

    pub async fn table_row_count(&self, table: &str) -> usize {
        self.store
            .read()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub async fn table_rows(&self, table: &str) -> Vec<Vec<Value>> {
        self.store
            .read()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Number of load submissions that reached the server side.
    pub async fn batches_submitted(&self) -> usize {
        self.store.read().await.submissions.len()
    }

    pub async fn submission_log(&self) -> Vec<SubmittedBatch> {
        self.store.read().await.submissions.clone()
    }
}

impl DatabaseStore {
    fn respond(&mut self, call: &ProcedureCall<'_>) -> ProcedureResponse {
        self.submissions.push(SubmittedBatch {
            procedure: call.procedure.to_string(),
            table: call.table.to_string(),
            partition_key: call.partition_key.cloned(),
            row_count: call.rows.len(),
            upsert: call.upsert,
        });

        for rule in &self.reject_rules {
            let hit = call.rows.rows().iter().any(|row| {
                row.get(rule.column).map(|v| v == &rule.value).unwrap_or(false)
            });
            if hit {
                return ProcedureResponse::failure(
                    ProcedureStatus::GracefulFailure,
                    rule.message.clone(),
                );
            }
        }

        let Some(table) = self.tables.get_mut(call.table) else {
            return ProcedureResponse::failure(
                ProcedureStatus::UnexpectedFailure,
                format!("table not found: {}", call.table),
            );
        };

        let column_count = table.schema.column_count();
        for row in call.rows.rows() {
            if row.len() != column_count {
                return ProcedureResponse::failure(
                    ProcedureStatus::GracefulFailure,
                    format!(
                        "row has {} fields, table {} has {} columns",
                        row.len(),
                        call.table,
                        column_count
                    ),
                );
            }
        }

        for row in call.rows.rows() {
            if call.upsert {
                if let Some(existing) = table
                    .rows
                    .iter_mut()
                    .find(|existing| existing.first() == row.first())
                {
                    *existing = row.clone();
                    continue;
                }
            }
            table.rows.push(row.clone());
        }

        ProcedureResponse::success()
    }
}

#[async_trait]
impl ProcedureClient for InMemoryDatabase {
    async fn describe_table(&self, table: &str) -> Result<TableSchema, ClientError> {
        let store = self.store.read().await;
        store
            .tables
            .get(table)
            .map(|t| t.schema.as_ref().clone())
            .ok_or_else(|| {
                TableNotFoundSnafu {
                    table: table.to_string(),
                }
                .build()
            })
    }

    async fn describe_deployment(&self) -> Result<DeploymentInfo, ClientError> {
        Ok(self.deployment)
    }

    async fn submit(&self, call: ProcedureCall<'_>) -> Result<PendingCall, TransportError> {
        if call.procedure != LOAD_SINGLE_PARTITION_TABLE
            && call.procedure != LOAD_MULTI_PARTITION_TABLE
        {
            let (tx, pending) = PendingCall::channel();
            let _ = tx.send(ProcedureResponse::failure(
                ProcedureStatus::UnexpectedFailure,
                format!("unknown procedure: {}", call.procedure),
            ));
            return Ok(pending);
        }

        let mut store = self.store.write().await;
        if let Some(fault) = store.faults.pop_front() {
            match fault {
                Fault::Transport { message } => {
                    trace!(table = call.table, "scripted transport fault");
                    return Err(TransportError { message });
                }
                Fault::Reject { status, message } => {
                    let (tx, pending) = PendingCall::channel();
                    let _ = tx.send(ProcedureResponse::failure(status, message));
                    return Ok(pending);
                }
            }
        }

        let response = store.respond(&call);
        let (tx, pending) = PendingCall::channel();
        let _ = tx.send(response);
        Ok(pending)
    }

    fn partition_for(
        &self,
        column_type: ColumnType,
        value: &Value,
    ) -> Result<PartitionId, TypeError> {
        // Stand-in for the real partition hash: stable within a process run.
        let coerced = value.coerce_to(column_type)?;
        let mut hasher = DefaultHasher::new();
        coerced.hash_into(&mut hasher);
        Ok((hasher.finish() % self.deployment.partition_count() as u64) as PartitionId)
    }

    fn auto_reconnect_enabled(&self) -> bool {
        self.auto_reconnect
    }

    async fn wait_reconnected(&self) {
        let start = self.reconnect_epoch.load(Ordering::SeqCst);
        loop {
            let notified = self.reconnected.notified();
            if self.reconnect_epoch.load(Ordering::SeqCst) != start {
                return;
            }
            notified.await;
        }
    }

    async fn drain_connection(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::RowSet;

    fn sample_schema() -> TableSchema {
        TableSchema::new(
            "events",
            vec![("id", ColumnType::BigInt), ("name", ColumnType::Varchar)],
            Some(0),
        )
    }

    fn sample_rows(schema: &Arc<TableSchema>, ids: &[i64]) -> RowSet {
        let mut rows = RowSet::new(schema.clone());
        for id in ids {
            rows.push_row(vec![Value::BigInt(*id), Value::Varchar(format!("r{id}"))]);
        }
        rows
    }

    #[tokio::test]
    async fn describe_and_submit_round_trip() {
        let db = InMemoryDatabase::new(DeploymentInfo::default());
        db.create_table(sample_schema()).await.unwrap();

        let schema = Arc::new(db.describe_table("events").await.unwrap());
        assert_eq!(schema.partition_column(), Some(0));

        let rows = sample_rows(&schema, &[1, 2, 3]);
        let key = Value::BigInt(1);
        let pending = db
            .submit(ProcedureCall {
                procedure: LOAD_SINGLE_PARTITION_TABLE,
                table: "events",
                partition_key: Some(&key),
                upsert: false,
                rows: &rows,
            })
            .await
            .unwrap();

        assert!(pending.response().await.status.is_success());
        assert_eq!(db.table_row_count("events").await, 3);
        assert_eq!(db.batches_submitted().await, 1);
    }

    #[tokio::test]
    async fn one_shot_faults_apply_in_order() {
        let db = InMemoryDatabase::new(DeploymentInfo::default());
        db.create_table(sample_schema()).await.unwrap();
        db.push_fault(Fault::Reject {
            status: ProcedureStatus::GracefulFailure,
            message: "scripted".into(),
        })
        .await;

        let schema = Arc::new(db.describe_table("events").await.unwrap());
        let rows = sample_rows(&schema, &[9]);
        let pending = db
            .submit(ProcedureCall {
                procedure: LOAD_MULTI_PARTITION_TABLE,
                table: "events",
                partition_key: None,
                upsert: false,
                rows: &rows,
            })
            .await
            .unwrap();
        assert_eq!(
            pending.response().await.status,
            ProcedureStatus::GracefulFailure
        );

        // The fault is consumed; the next submission succeeds.
        let pending = db
            .submit(ProcedureCall {
                procedure: LOAD_MULTI_PARTITION_TABLE,
                table: "events",
                partition_key: None,
                upsert: false,
                rows: &rows,
            })
            .await
            .unwrap();
        assert!(pending.response().await.status.is_success());
    }

    #[tokio::test]
    async fn partition_routing_is_stable() {
        let db = InMemoryDatabase::new(DeploymentInfo {
            host_count: 2,
            sites_per_host: 4,
            k_factor: 0,
        });
        let value = Value::BigInt(42);
        let first = db.partition_for(ColumnType::BigInt, &value).unwrap();
        let second = db.partition_for(ColumnType::BigInt, &value).unwrap();
        assert_eq!(first, second);
        assert!(first < 8);
    }

    #[tokio::test]
    async fn upsert_replaces_rows_by_first_column() {
        let db = InMemoryDatabase::new(DeploymentInfo::default());
        db.create_table(sample_schema()).await.unwrap();
        let schema = Arc::new(db.describe_table("events").await.unwrap());

        for _ in 0..2 {
            let rows = sample_rows(&schema, &[7]);
            let key = Value::BigInt(7);
            let pending = db
                .submit(ProcedureCall {
                    procedure: LOAD_SINGLE_PARTITION_TABLE,
                    table: "events",
                    partition_key: Some(&key),
                    upsert: true,
                    rows: &rows,
                })
                .await
                .unwrap();
            assert!(pending.response().await.status.is_success());
        }

        assert_eq!(db.table_row_count("events").await, 1);
    }
}
