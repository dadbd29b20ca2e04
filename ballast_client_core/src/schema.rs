//! Table and deployment metadata resolved once at loader construction.

use crate::error::TypeError;
use crate::value::{ColumnType, Value};

/// Identifier of a database partition.
pub type PartitionId = u32;

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub ordinal: usize,
    pub column_type: ColumnType,
}

/// Schema of one table, including which column (if any) the table is
/// partitioned on. Replicated tables have no partition column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    table: String,
    columns: Vec<ColumnSpec>,
    partition_column: Option<usize>,
}

impl TableSchema {
    pub fn new(
        table: impl Into<String>,
        columns: Vec<(&str, ColumnType)>,
        partition_column: Option<usize>,
    ) -> Self {
        let columns = columns
            .into_iter()
            .enumerate()
            .map(|(ordinal, (name, column_type))| ColumnSpec {
                name: name.to_string(),
                ordinal,
                column_type,
            })
            .collect();
        Self {
            table: table.into(),
            columns,
            partition_column,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn partition_column(&self) -> Option<usize> {
        self.partition_column
    }

    pub fn is_replicated(&self) -> bool {
        self.partition_column.is_none()
    }

    pub fn partition_column_type(&self) -> Option<ColumnType> {
        self.partition_column
            .map(|idx| self.columns[idx].column_type)
    }

    /// Coerces a full row of field values to this schema's column types.
    ///
    /// The caller must have validated the field count already; rows shorter
    /// or longer than the schema never reach this point.
    pub fn coerce_row(&self, values: &[Value]) -> Result<Vec<Value>, TypeError> {
        debug_assert_eq!(values.len(), self.columns.len());
        values
            .iter()
            .zip(self.columns.iter())
            .map(|(value, column)| value.coerce_to(column.column_type))
            .collect()
    }
}

/// Cluster deployment description, used once to size the partition-worker
/// pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentInfo {
    pub host_count: u32,
    pub sites_per_host: u32,
    pub k_factor: u32,
}

impl DeploymentInfo {
    pub fn partition_count(&self) -> u32 {
        ((self.host_count * self.sites_per_host) / (self.k_factor + 1)).max(1)
    }
}

impl Default for DeploymentInfo {
    fn default() -> Self {
        Self {
            host_count: 1,
            sites_per_host: 1,
            k_factor: 0,
        }
    }
}
