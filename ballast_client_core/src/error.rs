use snafu::Snafu;

use crate::value::ColumnType;

/// Errors returned by metadata operations on a [`crate::ProcedureClient`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
    #[snafu(display("table not found: {table}"))]
    TableNotFound { table: String },
    #[snafu(display("table already exists: {table}"))]
    TableAlreadyExists { table: String },
    #[snafu(display("internal error: {message}"))]
    Internal { message: String },
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// A field value could not be coerced to the column type it is destined for.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum TypeError {
    #[snafu(display("value of kind {value_kind} is not compatible with a {column_type} column"))]
    Incompatible {
        column_type: ColumnType,
        value_kind: &'static str,
    },
}

/// The call could not even be dispatched to the database.
///
/// This is distinct from a logical failure carried in a
/// [`crate::ProcedureResponse`]: a transport error means no response will
/// ever arrive for the attempted call.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
#[snafu(display("transport failure: {message}"))]
pub struct TransportError {
    pub message: String,
}

impl ClientError {
    pub fn is_table_not_found(&self) -> bool {
        matches!(self, ClientError::TableNotFound { .. })
    }
}
