//! Bulk-ingestion client for a partitioned, in-memory distributed database.
//!
//! The loader accepts a continuous stream of application rows destined for
//! one table, batches them per partition, and pushes the batches through the
//! database's procedure interface, retrying and reporting failures without
//! blocking the producing application beyond a bounded queue.
//!
//! ## Data flow
//!
//! [`BulkLoader::insert_row`] -> partition pipeline queue -> (at the trigger
//! threshold) batch build -> asynchronous submission -> on success, per-row
//! notification; on failure, degradation to single-row retries through the
//! loader's retry worker.
//!
//! Multiple loaders targeting the same table share the table's partition
//! pipelines through a [`LoaderRegistry`]; batches mix rows from every
//! loader, and per-loader accounting is captured at batch-build time.

pub mod buffer;
pub mod error;
pub mod loader;
pub mod registry;
pub mod row;

mod barrier;
mod pipeline;
mod retry;

pub use error::{LoaderError, Result};
pub use loader::BulkLoader;
pub use registry::LoaderRegistry;
pub use row::{CompletionHandler, RowTag};
