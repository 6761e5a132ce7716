//! End-to-end scenarios through the Bronze and Silver stages.

use std::sync::Arc;

use serde_json::json;
use strata_ingest::{
    BronzeStage, ErrorKind, IngestConfig, IngestError, MergeEngine, PurgeRequest, QualityRule,
    RunOptions, SanitizationBarrier, SilverContract, SilverStage, SourceBatch, Stage,
};
use strata_table::{ColumnSpec, ColumnType, ObjectTableStore, PartitionSpec, TableStore};
use strata_test_utils::{FaultInjectingBackend, at, fixture_date, init_test_logging, record, records};

type Store = ObjectTableStore<FaultInjectingBackend>;

struct Harness {
    backend: Arc<FaultInjectingBackend>,
    store: Arc<Store>,
    bronze: BronzeStage<Store, FaultInjectingBackend>,
    silver: SilverStage<Store, FaultInjectingBackend>,
}

fn harness() -> Harness {
    init_test_logging();
    let config = IngestConfig::default();
    let backend = Arc::new(FaultInjectingBackend::new());
    let store = Arc::new(ObjectTableStore::new(Arc::clone(&backend)));
    let barrier = SanitizationBarrier::with_default_rules(&config.sanitization);
    Harness {
        bronze: BronzeStage::new(&config, barrier, Arc::clone(&store), Arc::clone(&backend))
            .expect("bronze stage"),
        silver: SilverStage::new(&config, Arc::clone(&store), Arc::clone(&backend))
            .expect("silver stage"),
        backend,
        store,
    }
}

fn orders() -> SilverContract {
    SilverContract::new(
        1,
        vec![
            ColumnSpec::new("id", ColumnType::Integer),
            ColumnSpec::new("price", ColumnType::Float),
        ],
        vec!["id".into()],
    )
    .with_rule(QualityRule::Range {
        column: "price".into(),
        min: Some(0.0),
        max: None,
    })
}

fn shop_partition() -> PartitionSpec {
    PartitionSpec::new("shop", fixture_date())
}

fn batch(rows: Vec<serde_json::Value>) -> SourceBatch {
    SourceBatch::new("shop", records(rows))
}

#[tokio::test]
async fn card_numbers_reach_bronze_masked() {
    let h = harness();
    let outcome = h
        .bronze
        .run(
            batch(vec![json!({"id": 1, "card": "4111 1111 1111 1111"})]),
            RunOptions::default(),
            at(10, 0),
        )
        .await
        .expect("bronze run");
    assert_eq!(outcome.summary().accepted, 1);

    let bronze = h.store.read_snapshot("bronze").await.expect("read");
    assert_eq!(bronze.rows.len(), 1);
    let row = &bronze.rows[0];
    assert_eq!(row["card"], json!("XXXX-XXXX-XXXX-1111"));
    assert_eq!(row["source_system"], json!("shop"));
    assert_eq!(row["ingest_date"], json!("2024-05-01"));
    assert_eq!(row["ingest_timestamp"], json!("2024-05-01T10:00:00.000000Z"));
}

#[tokio::test]
async fn unmaskable_records_go_to_bronze_quarantine() {
    let h = harness();
    let config = IngestConfig::default();
    let deep = (0..config.sanitization.max_depth).fold(json!("leaf"), |inner, _| json!({"n": inner}));

    let outcome = h
        .bronze
        .run(
            batch(vec![json!({"id": 1}), json!({"id": 2, "doc": deep})]),
            RunOptions::default(),
            at(10, 0),
        )
        .await
        .expect("bronze run");
    assert_eq!(outcome.summary().accepted, 1);
    assert_eq!(outcome.summary().quarantined, 1);

    let quarantined = h.bronze.quarantine().rows(Stage::Bronze).await.expect("rows");
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0]["error_reason"], json!("sanitization_failed"));
    assert_eq!(quarantined[0]["payload"]["id"], json!(2));
    assert_eq!(quarantined[0]["source_system"], json!("shop"));
}

#[tokio::test]
async fn only_strictly_newer_rows_replace_silver_rows() {
    let h = harness();
    let contract = orders();

    h.bronze
        .run(batch(vec![json!({"id": 1, "price": 10})]), RunOptions::default(), at(10, 0))
        .await
        .expect("bronze t1");
    h.silver
        .run(shop_partition(), &contract, RunOptions::default(), at(10, 5))
        .await
        .expect("silver t1");

    h.bronze
        .run(batch(vec![json!({"id": 1, "price": 12})]), RunOptions::default(), at(11, 0))
        .await
        .expect("bronze t2");
    h.silver
        .run(shop_partition(), &contract, RunOptions::default(), at(11, 5))
        .await
        .expect("silver t2");

    let silver = h.store.read_snapshot("silver").await.expect("read");
    assert_eq!(silver.rows.len(), 1);
    assert_eq!(silver.rows[0]["price"], json!(12.0));
    assert_eq!(silver.rows[0]["ingest_timestamp"], json!("2024-05-01T11:00:00.000000Z"));

    // A late row stamped before the live one changes nothing.
    h.bronze
        .run(batch(vec![json!({"id": 1, "price": 99})]), RunOptions::default(), at(9, 0))
        .await
        .expect("bronze t0");
    h.silver
        .run(shop_partition(), &contract, RunOptions::default(), at(11, 10))
        .await
        .expect("silver t0");

    let silver = h.store.read_snapshot("silver").await.expect("read");
    assert_eq!(silver.rows.len(), 1);
    assert_eq!(silver.rows[0]["price"], json!(12.0));
}

#[tokio::test]
async fn range_violations_are_quarantined_not_merged() {
    let h = harness();
    h.bronze
        .run(batch(vec![json!({"id": 2, "price": -5})]), RunOptions::default(), at(10, 0))
        .await
        .expect("bronze");

    let outcome = h
        .silver
        .run(shop_partition(), &orders(), RunOptions::default(), at(10, 5))
        .await
        .expect("silver");
    assert_eq!(outcome.summary().accepted, 0);
    assert_eq!(outcome.summary().quarantined, 1);
    assert_eq!(outcome.summary().version, None);

    let silver = h.store.read_snapshot("silver").await.expect("read");
    assert!(silver.rows.is_empty());

    let quarantined = h.silver.quarantine().rows(Stage::Silver).await.expect("rows");
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0]["error_reason"], json!("range_check_failed"));
    assert_eq!(quarantined[0]["stage"], json!("silver"));
    assert_eq!(quarantined[0]["payload"]["price"], json!(-5));
    assert_eq!(quarantined[0]["attempted"]["price"], json!(-5.0));
}

#[tokio::test]
async fn concurrent_merges_with_disjoint_keys_both_land() {
    let h = harness();
    h.backend.rendezvous_commits("tables/silver/_log/", 2);
    let contract = orders();

    let handles: Vec<_> = [1_i64, 2]
        .into_iter()
        .map(|id| {
            let engine = MergeEngine::new(Arc::clone(&h.store), "silver", 4);
            let contract = contract.clone();
            let row = record(json!({
                "id": id,
                "price": 1.5,
                "ingest_timestamp": "2024-05-01T10:00:00.000000Z",
                "source_system": "shop",
                "batch_id": "0190b7a4-0000-7000-8000-000000000000",
                "ingest_date": "2024-05-01",
            }));
            tokio::spawn(async move { engine.merge(vec![row], &contract).await })
        })
        .collect();

    let mut attempts = Vec::new();
    for handle in handles {
        let report = handle.await.expect("join").expect("merge");
        assert_eq!(report.inserted, 1);
        attempts.push(report.attempts);
    }
    attempts.sort_unstable();
    assert_eq!(attempts, vec![1, 2], "the loser re-read and retried once");

    let silver = h.store.read_snapshot("silver").await.expect("read");
    assert_eq!(silver.version, 1);
    let mut ids: Vec<_> = silver.rows.iter().map(|r| r["id"].clone()).collect();
    ids.sort_by_key(|v| v.as_i64());
    assert_eq!(ids, vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn failed_casts_null_the_field_and_null_keys_drop_the_row() {
    let h = harness();
    h.bronze
        .run(
            batch(vec![
                json!({"id": "7", "price": "cheap"}),
                json!({"id": "oops", "price": "3.5"}),
            ]),
            RunOptions::default(),
            at(10, 0),
        )
        .await
        .expect("bronze");

    let outcome = h
        .silver
        .run(shop_partition(), &orders(), RunOptions::default(), at(10, 5))
        .await
        .expect("silver");
    let summary = outcome.summary();
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.dropped, 1);
    assert_eq!(summary.flagged, 1);
    assert_eq!(summary.quarantined, 0);

    let silver = h.store.read_snapshot("silver").await.expect("read");
    assert_eq!(silver.rows.len(), 1);
    assert_eq!(silver.rows[0]["id"], json!(7));
    assert_eq!(silver.rows[0]["price"], json!(null));
}

#[tokio::test]
async fn schema_drift_fails_the_batch_and_routes_it_to_quarantine() {
    let h = harness();
    h.bronze
        .run(batch(vec![json!({"id": 1, "price": 10})]), RunOptions::default(), at(10, 0))
        .await
        .expect("first batch");

    let err = h
        .bronze
        .run(
            batch(vec![json!({"id": "abc", "price": 11}), json!({"id": "def", "price": 12})]),
            RunOptions::default(),
            at(10, 30),
        )
        .await
        .expect_err("drift");
    assert_eq!(err.kind(), ErrorKind::SchemaDriftViolation);
    match err {
        IngestError::SchemaDriftViolation { column, existing, incoming, .. } => {
            assert_eq!(column, "id");
            assert_eq!(existing, ColumnType::Integer);
            assert_eq!(incoming, ColumnType::String);
        }
        other => panic!("unexpected error: {other}"),
    }

    let bronze = h.store.read_snapshot("bronze").await.expect("read");
    assert_eq!(bronze.rows.len(), 1, "nothing from the drifting batch is written");

    let quarantined = h.bronze.quarantine().rows(Stage::Bronze).await.expect("rows");
    assert_eq!(quarantined.len(), 2);
    assert!(quarantined.iter().all(|row| row["error_reason"] == json!("schema_drift")));
}

#[tokio::test]
async fn exhausted_commit_retries_surface_as_write_conflict() {
    let h = harness();
    h.backend.reject_next_commits(4);

    let err = h
        .bronze
        .run(batch(vec![json!({"id": 1})]), RunOptions::default(), at(10, 0))
        .await
        .expect_err("conflict");
    assert!(matches!(err, IngestError::WriteConflict { attempts: 4, .. }));
    assert_eq!(h.backend.pending_rejections(), 0);

    let bronze = h.store.read_snapshot("bronze").await.expect("read");
    assert!(bronze.is_empty_table());
    assert!(h.backend.paths("_replay/").await.is_empty());

    // Nothing was recorded, so the same batch runs again instead of skipping.
    let outcome = h
        .bronze
        .run(batch(vec![json!({"id": 1})]), RunOptions::default(), at(10, 0))
        .await
        .expect("retry run");
    assert!(!outcome.is_skipped());
}

#[tokio::test]
async fn transient_contention_is_absorbed_by_retry() {
    let h = harness();
    h.backend.reject_next_commits(2);

    let outcome = h
        .bronze
        .run(batch(vec![json!({"id": 1})]), RunOptions::default(), at(10, 0))
        .await
        .expect("bronze");
    assert_eq!(outcome.summary().version, Some(0));
}

#[tokio::test]
async fn purge_removes_matching_quarantine_rows() {
    let h = harness();
    h.bronze
        .run(
            batch(vec![json!({"id": 2, "price": -5}), json!({"id": 3, "price": -7})]),
            RunOptions::default(),
            at(10, 0),
        )
        .await
        .expect("bronze");
    h.silver
        .run(shop_partition(), &orders(), RunOptions::default(), at(10, 5))
        .await
        .expect("silver");

    let request = PurgeRequest::new("id", json!(2), "privacy-desk");
    let removed = h
        .silver
        .quarantine()
        .purge(Stage::Silver, &request)
        .await
        .expect("purge");
    assert_eq!(removed, 1);

    let remaining = h.silver.quarantine().rows(Stage::Silver).await.expect("rows");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0]["payload"]["id"], json!(3));
}

#[tokio::test]
async fn contract_changes_require_migration() {
    let h = harness();
    h.bronze
        .run(batch(vec![json!({"id": 1, "price": 10})]), RunOptions::default(), at(10, 0))
        .await
        .expect("bronze");
    h.silver
        .run(shop_partition(), &orders(), RunOptions::default(), at(10, 5))
        .await
        .expect("silver v1");

    let mut widened = orders();
    widened.schema.columns.push(ColumnSpec::new("note", ColumnType::String));
    let err = h
        .silver
        .run(shop_partition(), &widened, RunOptions::forced(), at(10, 10))
        .await
        .expect_err("unmigrated contract");
    assert_eq!(err.kind(), ErrorKind::ContractMismatch);

    widened.schema.version = 2;
    h.silver
        .merge_engine()
        .migrate_contract(&widened)
        .await
        .expect("migrate");
    h.silver
        .run(shop_partition(), &widened, RunOptions::default(), at(10, 15))
        .await
        .expect("silver v2");

    let silver = h.store.read_snapshot("silver").await.expect("read");
    assert_eq!(silver.contract, Some(widened.table_schema()));
    assert_eq!(silver.rows.len(), 1);
}

#[tokio::test]
async fn empty_source_system_is_rejected() {
    let h = harness();
    let err = h
        .bronze
        .run(SourceBatch::new("  ", Vec::new()), RunOptions::default(), at(10, 0))
        .await
        .expect_err("invalid");
    assert_eq!(err.kind(), ErrorKind::InvalidBatch);
}
