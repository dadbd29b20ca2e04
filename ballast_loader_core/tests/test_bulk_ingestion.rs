mod common;

use std::sync::Arc;
use std::time::Duration;

use ballast_client_core::{
    InMemoryDatabase, Value, LOAD_MULTI_PARTITION_TABLE, LOAD_SINGLE_PARTITION_TABLE,
};
use ballast_loader_core::LoaderRegistry;

use common::{
    database, event_row, four_partitions, replicated_schema, single_partition, tag, wait_until,
    RecordingHandler, REPLICATED_TABLE, TABLE,
};

#[tokio::test]
async fn every_inserted_row_reaches_the_table() {
    let db = database(four_partitions()).await;
    let registry = LoaderRegistry::new(db.clone());
    let handler = RecordingHandler::new();
    let loader = registry
        .bulk_loader(TABLE, 10, false, handler.clone())
        .await
        .expect("create loader");

    for id in 0..200 {
        loader
            .insert_row(tag(id), event_row(id))
            .await
            .expect("insert row");
    }
    loader.drain().await;

    assert_eq!(loader.outstanding_row_count(), 0);
    assert_eq!(loader.completed_row_count(), 200);
    assert_eq!(db.table_row_count(TABLE).await, 200);

    wait_until(|| handler.success_count() == 200).await;
    assert_eq!(handler.failure_count(), 0);

    loader.close().await;
}

#[tokio::test]
async fn full_batches_submit_at_the_trigger_size() {
    let db = database(single_partition()).await;
    let registry = LoaderRegistry::new(db.clone());
    let handler = RecordingHandler::new();
    let loader = registry
        .bulk_loader(TABLE, 25, false, handler.clone())
        .await
        .expect("create loader");

    for id in 0..100 {
        loader
            .insert_row(tag(id), event_row(id))
            .await
            .expect("insert row");
    }
    loader.drain().await;

    assert_eq!(db.batches_submitted().await, 4);
    for batch in db.submission_log().await {
        assert_eq!(batch.procedure, LOAD_SINGLE_PARTITION_TABLE);
        assert_eq!(batch.row_count, 25);
        assert!(batch.partition_key.is_some());
        assert!(!batch.upsert);
    }

    loader.close().await;
}

#[tokio::test]
async fn flush_pushes_out_a_partial_batch() {
    let db = database(single_partition()).await;
    let registry = LoaderRegistry::new(db.clone());
    let handler = RecordingHandler::new();
    let loader = registry
        .bulk_loader(TABLE, 100, false, handler.clone())
        .await
        .expect("create loader");

    for id in 0..7 {
        loader
            .insert_row(tag(id), event_row(id))
            .await
            .expect("insert row");
    }
    loader.flush().await;
    loader.drain().await;

    assert_eq!(db.batches_submitted().await, 1);
    assert_eq!(db.submission_log().await[0].row_count, 7);
    assert_eq!(loader.completed_row_count(), 7);

    loader.close().await;
}

// Paused clock: the sleeps in wait_until auto-advance time past the flush
// ticks, so the test is deterministic and immediate.
#[tokio::test(start_paused = true)]
async fn periodic_flush_pushes_partial_batches() {
    let db = database(single_partition()).await;
    let registry = LoaderRegistry::new(db.clone());
    let handler = RecordingHandler::new();
    let loader = registry
        .bulk_loader(TABLE, 100, false, handler.clone())
        .await
        .expect("create loader");

    loader.set_flush_interval(Some(Duration::from_millis(20)));
    for id in 0..3 {
        loader
            .insert_row(tag(id), event_row(id))
            .await
            .expect("insert row");
    }

    wait_until(|| handler.success_count() == 3).await;
    loader.close().await;
    assert_eq!(db.table_row_count(TABLE).await, 3);
}

#[tokio::test]
async fn replicated_tables_use_the_multi_partition_procedure() {
    let db = Arc::new(InMemoryDatabase::new(four_partitions()));
    db.create_table(replicated_schema())
        .await
        .expect("create table");
    let registry = LoaderRegistry::new(db.clone());
    let handler = RecordingHandler::new();
    let loader = registry
        .bulk_loader(REPLICATED_TABLE, 4, false, handler.clone())
        .await
        .expect("create loader");

    for id in 0..12 {
        let row = vec![
            Value::Varchar(format!("key-{id}")),
            Value::Varchar(format!("value-{id}")),
        ];
        loader.insert_row(tag(id), row).await.expect("insert row");
    }
    loader.drain().await;

    assert_eq!(db.table_row_count(REPLICATED_TABLE).await, 12);
    for batch in db.submission_log().await {
        assert_eq!(batch.procedure, LOAD_MULTI_PARTITION_TABLE);
        assert!(batch.partition_key.is_none());
    }

    loader.close().await;
}

#[tokio::test]
async fn partitioned_batches_carry_a_partition_key() {
    let db = database(four_partitions()).await;
    let registry = LoaderRegistry::new(db.clone());
    let handler = RecordingHandler::new();
    let loader = registry
        .bulk_loader(TABLE, 8, false, handler.clone())
        .await
        .expect("create loader");

    for id in 0..64 {
        loader
            .insert_row(tag(id), event_row(id))
            .await
            .expect("insert row");
    }
    loader.drain().await;

    let log = db.submission_log().await;
    let total_rows: usize = log.iter().map(|batch| batch.row_count).sum();
    assert_eq!(total_rows, 64);
    for batch in &log {
        assert!(batch.partition_key.is_some());
    }

    loader.close().await;
}

#[tokio::test]
async fn upsert_loaders_replace_existing_rows() {
    let db = database(single_partition()).await;
    let registry = LoaderRegistry::new(db.clone());
    let handler = RecordingHandler::new();
    let loader = registry
        .bulk_loader(TABLE, 10, true, handler.clone())
        .await
        .expect("create loader");

    loader
        .insert_row(tag(1), event_row(7))
        .await
        .expect("insert row");
    loader.flush().await;
    loader.drain().await;

    loader
        .insert_row(tag(2), vec![Value::BigInt(7), Value::Varchar("updated".into())])
        .await
        .expect("insert row");
    loader.flush().await;
    loader.drain().await;

    assert_eq!(db.table_row_count(TABLE).await, 1);
    assert_eq!(
        db.table_rows(TABLE).await[0][1],
        Value::Varchar("updated".into())
    );
    wait_until(|| handler.success_count() == 2).await;

    loader.close().await;
}

#[tokio::test]
async fn values_are_coerced_to_the_column_types() {
    let db = database(single_partition()).await;
    let registry = LoaderRegistry::new(db.clone());
    let handler = RecordingHandler::new();
    let loader = registry
        .bulk_loader(TABLE, 10, false, handler.clone())
        .await
        .expect("create loader");

    // An i32 id widens to the BigInt column.
    let row = vec![Value::Integer(41), Value::Varchar("narrow".into())];
    loader.insert_row(tag(0), row).await.expect("insert row");
    loader.flush().await;
    loader.drain().await;

    assert_eq!(db.table_rows(TABLE).await[0][0], Value::BigInt(41));
    loader.close().await;
}
