//! Client-side collaborator surface for the ballast bulk loader.
//!
//! This crate defines the value and schema model shared with the database,
//! the procedure-call request/response types, and the [`ProcedureClient`]
//! trait the loader drives. [`InMemoryDatabase`] implements the trait without
//! a network for tests and development.

pub mod call;
pub mod client;
pub mod error;
pub mod memory;
pub mod schema;
pub mod value;

pub use call::{
    PendingCall, ProcedureCall, ProcedureResponse, ProcedureStatus, RowSet,
    LOAD_MULTI_PARTITION_TABLE, LOAD_SINGLE_PARTITION_TABLE,
};
pub use client::ProcedureClient;
pub use error::{ClientError, Result, TransportError, TypeError};
pub use memory::{Fault, InMemoryDatabase, SubmittedBatch};
pub use schema::{ColumnSpec, DeploymentInfo, PartitionId, TableSchema};
pub use value::{ColumnType, Value};
