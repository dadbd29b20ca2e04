//! Table registry.
//!
//! All loaders created from one registry share the registry's client
//! connection, and loaders targeting the same table share that table's
//! partition pipelines. The registry owns pipeline lifetimes: pipelines are
//! spawned when the first loader for a table arrives and stopped when the
//! last one closes.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use snafu::{ensure, ResultExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ballast_client_core::{
    ColumnType, DeploymentInfo, ProcedureClient, TableSchema, LOAD_MULTI_PARTITION_TABLE,
    LOAD_SINGLE_PARTITION_TABLE,
};

use crate::error::{InvalidBatchSizeSnafu, MetadataSnafu, Result, UpsertModeMismatchSnafu};
use crate::loader::BulkLoader;
use crate::pipeline::{spawn_pipeline, PipelineConfig, PipelineSender};
use crate::retry::{spawn_retry_worker, RetryConfig};
use crate::row::{CompletionHandler, LoaderShared};

/// Row-set buffers retained per pipeline pool.
const POOL_RETAIN: usize = 4;

/// How a table's rows reach their pipelines.
#[derive(Clone, Copy)]
pub(crate) enum Route {
    /// Partitioned table: rows are hashed on the partitioning column and go
    /// to that partition's pipeline.
    SinglePartition {
        column: usize,
        column_type: ColumnType,
    },
    /// Replicated table: every row goes through the single multi-partition
    /// pipeline.
    MultiPartition,
}

/// Creates [`BulkLoader`] handles over one shared client connection.
#[derive(Clone)]
pub struct LoaderRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    client: Arc<dyn ProcedureClient>,
    state: Mutex<RegistryState>,
    ct: CancellationToken,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

#[derive(Default)]
struct RegistryState {
    deployment: Option<DeploymentInfo>,
    tables: HashMap<String, TableEntry>,
}

struct TableEntry {
    schema: Arc<TableSchema>,
    upsert: bool,
    trigger: Arc<AtomicUsize>,
    pipelines: Arc<Vec<PipelineSender>>,
    tasks: Vec<JoinHandle<()>>,
    loader_count: usize,
    route: Route,
    table_ct: CancellationToken,
}

impl LoaderRegistry {
    pub fn new(client: Arc<dyn ProcedureClient>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                client,
                state: Mutex::new(RegistryState::default()),
                ct: CancellationToken::new(),
            }),
        }
    }

    /// Creates a loader for `table`.
    ///
    /// `max_batch_size` is the number of rows that triggers a batch
    /// submission. Loaders sharing a table share its trigger size: a new
    /// loader with a smaller `max_batch_size` lowers it for everyone, and it
    /// never rises again while the table has loaders. All loaders on a table
    /// must agree on `upsert`.
    pub async fn bulk_loader(
        &self,
        table: &str,
        max_batch_size: usize,
        upsert: bool,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<BulkLoader> {
        ensure!(max_batch_size >= 1, InvalidBatchSizeSnafu);

        // Metadata lookups happen before taking the registry lock.
        let schema = self
            .inner
            .client
            .describe_table(table)
            .await
            .context(MetadataSnafu { table })?;
        let schema = Arc::new(schema);

        let mut state = self.inner.state.lock().await;
        let deployment = match state.deployment {
            Some(deployment) => deployment,
            None => {
                let deployment = self
                    .inner
                    .client
                    .describe_deployment()
                    .await
                    .context(MetadataSnafu { table })?;
                state.deployment = Some(deployment);
                deployment
            }
        };

        let entry = match state.tables.entry(table.to_string()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                ensure!(entry.upsert == upsert, UpsertModeMismatchSnafu { table });
                // The trigger only ever tightens while the table is live.
                entry.trigger.fetch_min(max_batch_size, Ordering::SeqCst);
                entry.loader_count += 1;
                entry
            }
            Entry::Vacant(vacant) => {
                let route = match (schema.partition_column(), schema.partition_column_type()) {
                    (Some(column), Some(column_type)) => Route::SinglePartition {
                        column,
                        column_type,
                    },
                    _ => Route::MultiPartition,
                };
                let trigger = Arc::new(AtomicUsize::new(max_batch_size));
                let table_ct = self.inner.ct.child_token();
                let (pipelines, tasks) = spawn_table_pipelines(
                    &self.inner.client,
                    &schema,
                    route,
                    &trigger,
                    max_batch_size,
                    deployment,
                    upsert,
                    &table_ct,
                );
                info!(
                    table,
                    pipelines = pipelines.len(),
                    upsert,
                    "created table pipelines"
                );
                vacant.insert(TableEntry {
                    schema: schema.clone(),
                    upsert,
                    trigger,
                    pipelines: Arc::new(pipelines),
                    tasks,
                    loader_count: 1,
                    route,
                    table_ct,
                })
            }
        };

        let retry_procedure = match entry.route {
            Route::SinglePartition { .. } => LOAD_SINGLE_PARTITION_TABLE,
            Route::MultiPartition => LOAD_MULTI_PARTITION_TABLE,
        };
        let (retry_tx, retry_task) = spawn_retry_worker(
            RetryConfig {
                client: self.inner.client.clone(),
                schema: entry.schema.clone(),
                procedure: retry_procedure,
                partition_column: entry.schema.partition_column(),
                upsert,
            },
            entry.table_ct.child_token(),
        );
        let shared = Arc::new(LoaderShared::new(handler, retry_tx));

        Ok(BulkLoader::new(
            self.inner.clone(),
            table.to_string(),
            entry.schema.clone(),
            entry.route,
            entry.pipelines.clone(),
            entry.trigger.clone(),
            shared,
            retry_task,
        ))
    }
}

impl RegistryInner {
    pub(crate) fn client(&self) -> &Arc<dyn ProcedureClient> {
        &self.client
    }

    /// Called by a closing loader. Tears the table down when it was the last
    /// loader, and drains the connection when no tables remain.
    pub(crate) async fn release(&self, table: &str) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.tables.get_mut(table) else {
            return;
        };
        entry.loader_count -= 1;
        if entry.loader_count > 0 {
            return;
        }
        let Some(entry) = state.tables.remove(table) else {
            return;
        };
        let drain = state.tables.is_empty();
        drop(state);

        debug!(table, "last loader closed, stopping table pipelines");
        entry.table_ct.cancel();
        for task in entry.tasks {
            let _ = task.await;
        }
        if drain {
            self.client.drain_connection().await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_table_pipelines(
    client: &Arc<dyn ProcedureClient>,
    schema: &Arc<TableSchema>,
    route: Route,
    trigger: &Arc<AtomicUsize>,
    max_batch_size: usize,
    deployment: DeploymentInfo,
    upsert: bool,
    table_ct: &CancellationToken,
) -> (Vec<PipelineSender>, Vec<JoinHandle<()>>) {
    let mut pipelines = Vec::new();
    let mut tasks = Vec::new();
    match route {
        Route::SinglePartition { column, .. } => {
            let partition_count = deployment.partition_count();
            // Deeper queues when fewer partitions carry the ingest load.
            let multiplier = (1000 / partition_count as usize).max(5);
            let queue_capacity = multiplier.saturating_mul(max_batch_size);
            for partition in 0..partition_count {
                let (sender, task) = spawn_pipeline(
                    PipelineConfig {
                        client: client.clone(),
                        schema: schema.clone(),
                        procedure: LOAD_SINGLE_PARTITION_TABLE,
                        partition: Some(partition),
                        partition_column: Some(column),
                        upsert,
                        trigger: trigger.clone(),
                        queue_capacity,
                        pool_retain: POOL_RETAIN,
                    },
                    table_ct.child_token(),
                );
                pipelines.push(sender);
                tasks.push(task);
            }
        }
        Route::MultiPartition => {
            let (sender, task) = spawn_pipeline(
                PipelineConfig {
                    client: client.clone(),
                    schema: schema.clone(),
                    procedure: LOAD_MULTI_PARTITION_TABLE,
                    partition: None,
                    partition_column: None,
                    upsert,
                    trigger: trigger.clone(),
                    queue_capacity: 1000usize.saturating_mul(max_batch_size),
                    pool_retain: POOL_RETAIN,
                },
                table_ct.child_token(),
            );
            pipelines.push(sender);
            tasks.push(task);
        }
    }
    (pipelines, tasks)
}
