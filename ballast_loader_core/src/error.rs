use snafu::Snafu;

use ballast_client_core::ClientError;

/// Errors surfaced directly to the caller.
///
/// Data rejections are never errors: they are reported through the loader's
/// [`crate::CompletionHandler`]. Only API misuse and bootstrap failures land
/// here.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoaderError {
    #[snafu(display("loader is closed"))]
    Closed,
    #[snafu(display("batch size must be at least 1"))]
    InvalidBatchSize,
    #[snafu(display("failed to resolve metadata for table {table}"))]
    Metadata { table: String, source: ClientError },
    #[snafu(display("loaders sharing table {table} must use the same upsert mode"))]
    UpsertModeMismatch { table: String },
}

pub type Result<T, E = LoaderError> = std::result::Result<T, E>;
