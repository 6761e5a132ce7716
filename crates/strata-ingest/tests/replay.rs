//! Replay idempotency across stage invocations.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use strata_ingest::{
    BronzeStage, IngestConfig, QualityRule, RunOptions, SanitizationBarrier, SilverContract,
    SilverStage, SourceBatch, Stage, StageOutcome,
};
use strata_table::{ColumnSpec, ColumnType, ObjectTableStore, PartitionSpec, TableStore};
use strata_test_utils::{FaultInjectingBackend, at, fixture_date, records};

type Store = ObjectTableStore<FaultInjectingBackend>;

fn stages() -> (
    Arc<Store>,
    BronzeStage<Store, FaultInjectingBackend>,
    SilverStage<Store, FaultInjectingBackend>,
) {
    let config = IngestConfig::default();
    let backend = Arc::new(FaultInjectingBackend::new());
    let store = Arc::new(ObjectTableStore::new(Arc::clone(&backend)));
    let barrier = SanitizationBarrier::with_default_rules(&config.sanitization);
    let bronze = BronzeStage::new(&config, barrier, Arc::clone(&store), Arc::clone(&backend))
        .expect("bronze stage");
    let silver = SilverStage::new(&config, Arc::clone(&store), backend).expect("silver stage");
    (store, bronze, silver)
}

fn contract() -> SilverContract {
    SilverContract::new(
        1,
        vec![
            ColumnSpec::new("id", ColumnType::Integer),
            ColumnSpec::new("qty", ColumnType::Integer),
        ],
        vec!["id".into()],
    )
}

fn utc(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

fn ids(rows: &[strata_table::Record]) -> Vec<serde_json::Value> {
    let mut ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
    ids.sort_by_key(ToString::to_string);
    ids
}

fn batch() -> SourceBatch {
    SourceBatch::new(
        "shop",
        records([json!({"id": 1, "qty": 3}), json!({"id": 2, "qty": 4})]),
    )
}

#[tokio::test]
async fn bronze_replay_is_a_no_op() {
    let (store, bronze, _) = stages();

    let first = bronze
        .run(batch(), RunOptions::default(), at(10, 0))
        .await
        .expect("first");
    let after_first = store.read_snapshot("bronze").await.expect("read");

    let second = bronze
        .run(batch(), RunOptions::default(), at(10, 30))
        .await
        .expect("second");
    let after_second = store.read_snapshot("bronze").await.expect("read");

    assert!(!first.is_skipped());
    assert!(second.is_skipped());
    assert_eq!(first.summary(), second.summary());
    assert_eq!(after_first.version, after_second.version);
    assert_eq!(after_first.rows, after_second.rows);
}

#[tokio::test]
async fn forced_bronze_replay_replaces_the_recorded_rows() {
    let (store, bronze, _) = stages();
    bronze
        .run(batch(), RunOptions::default(), at(10, 0))
        .await
        .expect("first");

    let forced = bronze
        .run(batch(), RunOptions::forced(), at(10, 30))
        .await
        .expect("forced");
    assert!(matches!(forced, StageOutcome::Committed(_)));

    let snapshot = store.read_snapshot("bronze").await.expect("read");
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.rows.len(), 2, "the recorded rows were replaced, not doubled");
    assert!(
        snapshot
            .rows
            .iter()
            .all(|row| row["ingest_timestamp"] == json!("2024-05-01T10:30:00.000000Z"))
    );

    // The forced run's summary is what later replays report.
    let replay = bronze
        .run(batch(), RunOptions::default(), at(11, 0))
        .await
        .expect("replay");
    assert!(replay.is_skipped());
    assert_eq!(replay.summary(), forced.summary());
}

#[tokio::test]
async fn windowed_batches_are_identified_by_their_window() {
    let (store, bronze, _) = stages();
    let windowed = |rows: Vec<serde_json::Value>| {
        SourceBatch::new("shop", records(rows)).with_window(at(8, 0), at(9, 0))
    };

    bronze
        .run(windowed(vec![json!({"id": 1, "qty": 3})]), RunOptions::default(), at(10, 0))
        .await
        .expect("first");
    let again = bronze
        .run(windowed(vec![json!({"id": 1, "qty": 5})]), RunOptions::default(), at(10, 5))
        .await
        .expect("again");
    assert!(again.is_skipped());

    let next_window = SourceBatch::new("shop", records([json!({"id": 1, "qty": 5})]))
        .with_window(at(9, 0), at(10, 0));
    let next = bronze
        .run(next_window, RunOptions::default(), at(10, 10))
        .await
        .expect("next window");
    assert!(!next.is_skipped());

    let snapshot = store.read_snapshot("bronze").await.expect("read");
    assert_eq!(snapshot.rows.len(), 2);
}

#[tokio::test]
async fn distinct_unwindowed_batches_both_land() {
    let (store, bronze, _) = stages();
    for qty in [1, 2] {
        let outcome = bronze
            .run(
                SourceBatch::new("shop", records([json!({"id": qty, "qty": qty})])),
                RunOptions::default(),
                at(10, 0),
            )
            .await
            .expect("run");
        assert!(!outcome.is_skipped());
    }
    assert_eq!(store.read_snapshot("bronze").await.expect("read").rows.len(), 2);
}

#[tokio::test]
async fn silver_replay_skips_until_bronze_moves() {
    let (store, bronze, silver) = stages();
    let partition = PartitionSpec::new("shop", fixture_date());
    let contract = contract();

    bronze
        .run(batch(), RunOptions::default(), at(10, 0))
        .await
        .expect("bronze");

    let first = silver
        .run(partition.clone(), &contract, RunOptions::default(), at(10, 5))
        .await
        .expect("silver");
    let after_first = store.read_snapshot("silver").await.expect("read");
    assert_eq!(first.summary().accepted, 2);

    let second = silver
        .run(partition.clone(), &contract, RunOptions::default(), at(10, 6))
        .await
        .expect("silver replay");
    assert!(second.is_skipped());
    assert_eq!(
        store.read_snapshot("silver").await.expect("read").version,
        after_first.version
    );

    // Forced replay re-merges; equal timestamps leave every row unchanged.
    let forced = silver
        .run(partition.clone(), &contract, RunOptions::forced(), at(10, 7))
        .await
        .expect("forced");
    assert!(!forced.is_skipped());
    assert_eq!(
        store.read_snapshot("silver").await.expect("read").rows,
        after_first.rows
    );

    bronze
        .run(
            SourceBatch::new("shop", records([json!({"id": 1, "qty": 9})])),
            RunOptions::default(),
            at(11, 0),
        )
        .await
        .expect("bronze update");
    let third = silver
        .run(partition, &contract, RunOptions::default(), at(11, 5))
        .await
        .expect("silver after update");
    assert!(!third.is_skipped());

    let rows = store.read_snapshot("silver").await.expect("read").rows;
    let updated = rows.iter().find(|r| r["id"] == json!(1)).expect("id 1");
    assert_eq!(updated["qty"], json!(9));
}

#[tokio::test]
async fn forced_replay_keeps_other_batches_in_the_partition() {
    let (store, bronze, _) = stages();
    let single = |id: i64| SourceBatch::new("shop", records([json!({"id": id, "qty": 1})]));

    bronze
        .run(single(1), RunOptions::default(), at(10, 0))
        .await
        .expect("batch a");
    bronze
        .run(single(2), RunOptions::default(), at(11, 0))
        .await
        .expect("batch b");

    let forced = bronze
        .run(single(2), RunOptions::forced(), at(12, 0))
        .await
        .expect("forced b");
    assert!(!forced.is_skipped());

    let rows = store.read_snapshot("bronze").await.expect("read").rows;
    assert_eq!(ids(&rows), vec![json!(1), json!(2)]);
    let replayed = rows.iter().find(|r| r["id"] == json!(2)).expect("id 2");
    assert_eq!(replayed["ingest_timestamp"], json!("2024-05-01T12:00:00.000000Z"));

    // Forcing again replaces the forced run's rows, still leaving batch a.
    bronze
        .run(single(2), RunOptions::forced(), at(13, 0))
        .await
        .expect("forced b again");
    let rows = store.read_snapshot("bronze").await.expect("read").rows;
    assert_eq!(ids(&rows), vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn windowed_replay_after_midnight_is_skipped() {
    let (store, bronze, _) = stages();
    let windowed = || {
        SourceBatch::new("shop", records([json!({"id": 1, "qty": 3})]))
            .with_window(utc(1, 22, 0), utc(1, 23, 0))
    };

    let first = bronze
        .run(windowed(), RunOptions::default(), utc(1, 23, 59))
        .await
        .expect("before midnight");
    let after_first = store.read_snapshot("bronze").await.expect("read");

    let second = bronze
        .run(windowed(), RunOptions::default(), utc(2, 0, 1))
        .await
        .expect("after midnight");
    assert!(second.is_skipped());
    assert_eq!(second.summary(), first.summary());
    assert_eq!(store.read_snapshot("bronze").await.expect("read"), after_first);

    // A forced replay on the next day moves the rows rather than copying them.
    bronze
        .run(windowed(), RunOptions::forced(), utc(2, 0, 5))
        .await
        .expect("forced");
    let rows = store.read_snapshot("bronze").await.expect("read").rows;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["ingest_date"], json!("2024-05-02"));
}

#[tokio::test]
async fn silver_ignores_writes_to_other_partitions() {
    let (store, bronze, silver) = stages();
    let contract = contract().with_rule(QualityRule::Range {
        column: "qty".into(),
        min: Some(0.0),
        max: None,
    });
    let shop = PartitionSpec::new("shop", fixture_date());

    bronze
        .run(
            SourceBatch::new("shop", records([json!({"id": 1, "qty": -5})])),
            RunOptions::default(),
            at(10, 0),
        )
        .await
        .expect("shop");
    let first = silver
        .run(shop.clone(), &contract, RunOptions::default(), at(10, 5))
        .await
        .expect("silver");
    assert_eq!(first.summary().quarantined, 1);

    bronze
        .run(
            SourceBatch::new("crm", records([json!({"id": 7, "qty": 1})])),
            RunOptions::default(),
            at(10, 10),
        )
        .await
        .expect("crm");
    let second = silver
        .run(shop, &contract, RunOptions::default(), at(10, 15))
        .await
        .expect("silver replay");
    assert!(second.is_skipped());

    let quarantined = silver
        .quarantine()
        .rows(Stage::Silver)
        .await
        .expect("quarantine rows");
    assert_eq!(quarantined.len(), 1);
}
