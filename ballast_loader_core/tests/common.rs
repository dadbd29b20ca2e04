//! Shared fixtures for the loader integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use ballast_client_core::{
    ColumnType, DeploymentInfo, InMemoryDatabase, ProcedureResponse, TableSchema, Value,
};
use ballast_loader_core::{CompletionHandler, RowTag};

pub const TABLE: &str = "events";
pub const REPLICATED_TABLE: &str = "settings";

pub fn events_schema() -> TableSchema {
    TableSchema::new(
        TABLE,
        vec![("id", ColumnType::BigInt), ("name", ColumnType::Varchar)],
        Some(0),
    )
}

pub fn replicated_schema() -> TableSchema {
    TableSchema::new(
        REPLICATED_TABLE,
        vec![
            ("key", ColumnType::Varchar),
            ("value", ColumnType::Varchar),
        ],
        None,
    )
}

pub fn single_partition() -> DeploymentInfo {
    DeploymentInfo {
        host_count: 1,
        sites_per_host: 1,
        k_factor: 0,
    }
}

pub fn four_partitions() -> DeploymentInfo {
    DeploymentInfo {
        host_count: 2,
        sites_per_host: 2,
        k_factor: 0,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn database(deployment: DeploymentInfo) -> Arc<InMemoryDatabase> {
    init_tracing();
    let db = Arc::new(InMemoryDatabase::new(deployment));
    db.create_table(events_schema()).await.expect("create table");
    db
}

pub async fn reconnecting_database(deployment: DeploymentInfo) -> Arc<InMemoryDatabase> {
    init_tracing();
    let db = Arc::new(InMemoryDatabase::new(deployment).with_auto_reconnect(true));
    db.create_table(events_schema()).await.expect("create table");
    db
}

pub fn event_row(id: i64) -> Vec<Value> {
    vec![Value::BigInt(id), Value::Varchar(format!("event-{id}"))]
}

pub fn tag(id: i64) -> RowTag {
    Box::new(id)
}

fn tag_id(tag: RowTag) -> i64 {
    *tag.downcast::<i64>().expect("tag is an i64")
}

/// Success notifications are delivered off the pipeline task, so tests poll
/// for them instead of asserting immediately after a drain.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached within timeout");
}

/// Records terminal callbacks; tags must be `i64` row ids.
#[derive(Default)]
pub struct RecordingHandler {
    state: Mutex<HandlerState>,
}

#[derive(Default)]
struct HandlerState {
    successes: Vec<i64>,
    failures: Vec<(i64, Vec<Value>, ProcedureResponse)>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn success_count(&self) -> usize {
        self.state.lock().expect("handler state").successes.len()
    }

    pub fn failure_count(&self) -> usize {
        self.state.lock().expect("handler state").failures.len()
    }

    pub fn successes(&self) -> Vec<i64> {
        self.state.lock().expect("handler state").successes.clone()
    }

    pub fn failures(&self) -> Vec<(i64, Vec<Value>, ProcedureResponse)> {
        self.state.lock().expect("handler state").failures.clone()
    }
}

impl CompletionHandler for RecordingHandler {
    fn on_failure(&self, tag: RowTag, values: Vec<Value>, response: ProcedureResponse) {
        self.state
            .lock()
            .expect("handler state")
            .failures
            .push((tag_id(tag), values, response));
    }

    fn on_success(&self, tag: RowTag, _response: &ProcedureResponse) {
        self.state
            .lock()
            .expect("handler state")
            .successes
            .push(tag_id(tag));
    }
}
