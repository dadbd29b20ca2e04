//! Procedure invocation and response types.
//!
//! Non-success statuses are data carried in a [`ProcedureResponse`], never
//! errors: the loader inspects them and decides what to do. Only a
//! [`crate::TransportError`] (the call never left the client) is an `Err`.

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::schema::TableSchema;
use crate::value::Value;

/// Procedure used to load a batch into one partition of a partitioned table.
pub const LOAD_SINGLE_PARTITION_TABLE: &str = "load_single_partition_table";
/// Procedure used to load a batch into a replicated table.
pub const LOAD_MULTI_PARTITION_TABLE: &str = "load_multi_partition_table";

/// Outcome status of a procedure invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureStatus {
    Success,
    GracefulFailure,
    UnexpectedFailure,
    ConnectionLost,
    ConnectionTimeout,
}

impl ProcedureStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcedureStatus::Success)
    }
}

/// Response to a procedure invocation.
#[derive(Debug, Clone)]
pub struct ProcedureResponse {
    pub status: ProcedureStatus,
    pub status_string: String,
}

impl ProcedureResponse {
    pub fn success() -> Self {
        Self {
            status: ProcedureStatus::Success,
            status_string: String::new(),
        }
    }

    pub fn failure(status: ProcedureStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            status_string: message.into(),
        }
    }

    pub fn connection_lost() -> Self {
        Self::failure(
            ProcedureStatus::ConnectionLost,
            "connection to database was lost",
        )
    }
}

/// A reusable set of coerced rows bound to a table schema.
///
/// Row sets are pooled by the loader: `clear` retains the row capacity so a
/// buffer can be refilled without reallocating.
pub struct RowSet {
    schema: Arc<TableSchema>,
    rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.schema.column_count());
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

impl fmt::Debug for RowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowSet")
            .field("table", &self.schema.table())
            .field("rows", &format!("<{} rows>", self.rows.len()))
            .finish()
    }
}

/// One asynchronous procedure invocation.
///
/// For single-partition loads `partition_key` carries the partitioning value
/// extracted from the batch's first row; every row in a batch shares a
/// partition by construction.
#[derive(Debug)]
pub struct ProcedureCall<'a> {
    pub procedure: &'a str,
    pub table: &'a str,
    pub partition_key: Option<&'a Value>,
    pub upsert: bool,
    pub rows: &'a RowSet,
}

/// Handle to an in-flight procedure invocation.
pub struct PendingCall {
    rx: oneshot::Receiver<ProcedureResponse>,
}

impl PendingCall {
    pub fn channel() -> (oneshot::Sender<ProcedureResponse>, PendingCall) {
        let (tx, rx) = oneshot::channel();
        (tx, PendingCall { rx })
    }

    /// Waits for the response. A server side that went away without replying
    /// resolves to a synthesized connection-lost response.
    pub async fn response(self) -> ProcedureResponse {
        self.rx
            .await
            .unwrap_or_else(|_| ProcedureResponse::connection_lost())
    }
}
