use async_trait::async_trait;

use crate::call::{PendingCall, ProcedureCall};
use crate::error::{ClientError, TransportError, TypeError};
use crate::schema::{DeploymentInfo, PartitionId, TableSchema};
use crate::value::{ColumnType, Value};

/// The database client the bulk loader drives.
///
/// The loader consumes this as `Arc<dyn ProcedureClient>`; the two describe
/// calls are one-time bootstrap queries, `submit` is the steady-state path.
#[async_trait]
pub trait ProcedureClient: Send + Sync + 'static {
    /// Returns column name/type/ordinal information for a table, along with
    /// which column (if any) the table is partitioned on.
    async fn describe_table(&self, table: &str) -> Result<TableSchema, ClientError>;

    /// Returns the cluster deployment description.
    async fn describe_deployment(&self) -> Result<DeploymentInfo, ClientError>;

    /// Dispatches an asynchronous procedure invocation.
    ///
    /// `Ok` means the call is on the wire; the response arrives through the
    /// returned [`PendingCall`]. `Err` means the call could not be
    /// dispatched at all.
    async fn submit(&self, call: ProcedureCall<'_>) -> Result<PendingCall, TransportError>;

    /// The partition-routing function: maps a partitioning value to the
    /// partition that owns it.
    fn partition_for(
        &self,
        column_type: ColumnType,
        value: &Value,
    ) -> Result<PartitionId, TypeError>;

    /// Whether transport failures should be retried after reconnect rather
    /// than surfaced as connection-lost responses.
    fn auto_reconnect_enabled(&self) -> bool;

    /// Resolves once the connection has been re-established. Only consulted
    /// after a transport failure when auto-reconnect is enabled.
    async fn wait_reconnected(&self);

    /// Drains the underlying connection.
    async fn drain_connection(&self);
}
