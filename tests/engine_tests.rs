use chrono::NaiveDate;
use event_rollup::engine::{prepare, write_results, Engine, PrepareReport};
use event_rollup::generate::{generate, GenerateOptions};
use event_rollup::index::Dimension;
use event_rollup::planner::{Plan, Strategy};
use event_rollup::query::{default_queries, QueryRequest};
use event_rollup::{EngineConfig, EngineError, EventType, ResultSet, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const HEADER: &str = "ts,type,auction_id,advertiser_id,publisher_id,bid_price,user_id,total_price,country";

// Timestamps in UTC; the default timezone is America/Los_Angeles (UTC-7 in June).
// 1717309800000 = 2024-06-02 06:30Z = 2024-06-01 23:30 local
// 1717313400000 = 2024-06-02 07:30Z = 2024-06-02 00:30 local
// 1717264800000 = 2024-06-01 18:00Z = 2024-06-01 11:00 local
// 1717416000000 = 2024-06-03 12:00Z = 2024-06-03 05:00 local
const FIXTURE_ROWS: [&str; 10] = [
    "1717309800000,impression,a1,1,10,1.5,100,,US",
    "1717313400000,impression,a2,1,11,2.0,101,,JP",
    "1717264800000,impression,a3,2,10,0.5,102,,JP",
    "1717416000000,serve,a4,2,10,0.1,103,,DE",
    "1717416000000,click,a5,3,12,,104,,US",
    "1717264800000,purchase,a6,1,,,105,100,US",
    "1717309800000,purchase,a7,2,,,106,50,JP",
    "1717313400000,purchase,a8,2,,,107,50,JP",
    "1717416000000,purchase,a9,3,,,108,100,DE",
    "1717416000000,bogus,a10,3,,,109,,DE",
];

fn day(y: i32, m: u32, d: u32) -> Value {
    Value::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
}

fn store_from_rows<S: AsRef<str>>(rows: &[S]) -> (TempDir, PathBuf, PrepareReport) {
    let tmp = tempfile::tempdir().unwrap();
    let data = tmp.path().join("data");
    fs::create_dir_all(&data).unwrap();
    let mut csv = String::from(HEADER);
    for row in rows {
        csv.push('\n');
        csv.push_str(row.as_ref());
    }
    csv.push('\n');
    fs::write(data.join("events_part_00000.csv"), csv).unwrap();

    let storage = tmp.path().join("store");
    let report = prepare(&EngineConfig::default(), &data, &storage).unwrap();
    (tmp, storage, report)
}

fn fixture_store() -> (TempDir, PathBuf, PrepareReport) {
    store_from_rows(&FIXTURE_ROWS)
}

fn synthetic_store() -> (TempDir, PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let data = tmp.path().join("data");
    let options = GenerateOptions {
        rows: 4_000,
        files: 2,
        start: NaiveDate::from_ymd_opt(2024, 10, 19).unwrap(),
        days: 6,
        seed: 7,
    };
    generate(&data, &options).unwrap();
    let storage = tmp.path().join("store");
    prepare(&EngineConfig::default(), &data, &storage).unwrap();
    (tmp, storage)
}

fn open(storage: &Path) -> Engine {
    Engine::open(storage, &EngineConfig::default()).unwrap()
}

fn rows_by_key(result: &ResultSet, key: &str, value: &str) -> BTreeMap<String, Value> {
    let k = result.column_index(key).unwrap();
    let v = result.column_index(value).unwrap();
    result
        .rows
        .iter()
        .map(|row| (row[k].to_string(), row[v].clone()))
        .collect()
}

#[test]
fn malformed_record_is_dropped_and_counted() {
    let (_tmp, storage, report) = fixture_store();
    assert_eq!(report.ingest.rows_read, 10);
    assert_eq!(report.ingest.ingested, 9);
    assert_eq!(report.ingest.dropped, 1);
    assert_eq!(report.ingest.samples.len(), 1);
    assert!(report.ingest.samples[0].contains("bogus"));
    assert!(report.degraded_indexes.is_empty());

    let engine = open(&storage);
    assert_eq!(engine.manifest().ingest.dropped, 1);
}

#[test]
fn purchase_average_by_country() {
    let (_tmp, storage, _) = fixture_store();
    let engine = open(&storage);
    let q3 = default_queries().unwrap().remove(2);

    let outcome = engine.query(&q3).unwrap();
    assert!(matches!(outcome.plan, Some(Plan::Rollup { ref name, .. }) if name == "country_purchases"));
    let averages = rows_by_key(&outcome.result, "country", "AVG(total_price)");
    let expected: BTreeMap<String, Value> = [
        ("US".to_string(), Value::Float(100.0)),
        ("JP".to_string(), Value::Float(50.0)),
        ("DE".to_string(), Value::Float(100.0)),
    ]
    .into_iter()
    .collect();
    assert_eq!(averages, expected);
    // Descending by average; the tie keeps group-key order.
    let order: Vec<String> = outcome.result.rows.iter().map(|r| r[0].to_string()).collect();
    assert_eq!(order, vec!["DE", "US", "JP"]);

    let full = engine.query_with(&q3, Strategy::FullScan).unwrap();
    assert_eq!(*full.result, *outcome.result);
}

#[test]
fn hundred_purchases_average_per_country() {
    // US: 40 events summing to 4000, JP: 30 summing to 1500, DE: 30 summing to 3000.
    let mut rows = Vec::new();
    let mut push = |country: &str, price: u32, i: usize| {
        rows.push(format!(
            "{},purchase,p{},{},,,{},{},{}",
            1_717_264_800_000i64 + i as i64 * 3_600_000,
            i,
            i % 7 + 1,
            200 + i,
            price,
            country
        ));
    };
    for i in 0..40 {
        push("US", if i % 2 == 0 { 60 } else { 140 }, i);
    }
    for i in 0..30 {
        push("JP", if i % 2 == 0 { 25 } else { 75 }, 40 + i);
    }
    for i in 0..30 {
        push("DE", if i % 2 == 0 { 80 } else { 120 }, 70 + i);
    }
    let (_tmp, storage, report) = store_from_rows(&rows);
    assert_eq!(report.ingest.ingested, 100);

    let engine = open(&storage);
    let q3 = default_queries().unwrap().remove(2);
    let expected: BTreeMap<String, Value> = [
        ("US".to_string(), Value::Float(100.0)),
        ("JP".to_string(), Value::Float(50.0)),
        ("DE".to_string(), Value::Float(100.0)),
    ]
    .into_iter()
    .collect();

    let rollup = engine.query_with(&q3, Strategy::Rollup).unwrap();
    assert!(matches!(rollup.plan, Some(Plan::Rollup { ref name, .. }) if name == "country_purchases"));
    assert_eq!(rows_by_key(&rollup.result, "country", "AVG(total_price)"), expected);

    let full = engine.query_with(&q3, Strategy::FullScan).unwrap();
    assert_eq!(full.stats.rows_scanned, 100);
    assert_eq!(rows_by_key(&full.result, "country", "AVG(total_price)"), expected);
    assert_eq!(*full.result, *rollup.result);
}

#[test]
fn events_are_bucketed_by_local_day() {
    let (_tmp, storage, _) = fixture_store();
    let partitions = storage.join("partitions").join("type=impression");
    assert!(partitions.join("day=2024-06-01").join("data.parquet").exists());
    assert!(partitions.join("day=2024-06-02").join("data.parquet").exists());
    assert!(!partitions.join("day=2024-06-03").exists());
    assert!(storage.join("partitions/type=purchase/data.parquet").exists());

    let engine = open(&storage);
    let q1 = default_queries().unwrap().remove(0);
    let expected = vec![
        vec![day(2024, 6, 1), Value::Float(2.0)],
        vec![day(2024, 6, 2), Value::Float(2.0)],
    ];
    for strategy in [Strategy::Rollup, Strategy::PrunedScan, Strategy::FullScan] {
        let outcome = engine.query_with(&q1, strategy).unwrap();
        assert_eq!(outcome.result.rows, expected, "{:?}", strategy);
    }
}

#[test]
fn partitions_cover_every_event_once() {
    let (_tmp, storage) = synthetic_store();
    let engine = open(&storage);
    let manifest = engine.manifest();

    let total: u64 = manifest.partitions.iter().map(|p| p.rows).sum();
    assert_eq!(total, 4_000);
    assert_eq!(manifest.ingest.ingested, 4_000);
    for event_type in EventType::ALL {
        let ingested = manifest
            .ingest
            .ingested_by_type
            .get(&event_type)
            .copied()
            .unwrap_or(0);
        assert_eq!(manifest.rows_of_type(event_type), ingested, "{}", event_type);
    }

    let count_by_type = QueryRequest::parse(
        r#"{"select": ["type", {"COUNT": "*"}], "group_by": ["type"]}"#,
    )
    .unwrap();
    let outcome = engine.query_with(&count_by_type, Strategy::FullScan).unwrap();
    let counts = rows_by_key(&outcome.result, "type", "COUNT(*)");
    for (name, count) in counts {
        let event_type: EventType = name.parse().unwrap();
        assert_eq!(count, Value::Int(manifest.rows_of_type(event_type) as i64));
    }
}

#[test]
fn every_path_returns_the_same_rows() {
    let (_tmp, storage) = synthetic_store();
    let engine = open(&storage);

    let mut queries = default_queries().unwrap();
    queries.extend(
        QueryRequest::parse_list(
            r#"[
            {"id": "x1", "select": ["country", {"COUNT": "*"}, {"MAX": "bid_price"}],
             "where": [{"col": "type", "op": "in", "val": ["serve", "impression"]},
                       {"col": "country", "op": "in", "val": ["US", "JP"]}],
             "group_by": ["country"]},
            {"id": "x2", "select": ["publisher_id", {"MIN": "bid_price"}, {"AVG": "bid_price"}],
             "where": [{"col": "type", "op": "eq", "val": "impression"},
                       {"col": "day", "op": "gte", "val": "2024-10-21"}],
             "group_by": ["publisher_id"],
             "order_by": [{"col": "publisher_id", "dir": "asc"}], "limit": 20},
            {"id": "x3", "select": ["advertiser_id", {"SUM": "bid_price"}],
             "where": [{"col": "type", "op": "eq", "val": "impression"},
                       {"col": "country", "op": "eq", "val": "DE"}],
             "group_by": ["advertiser_id"]}
        ]"#,
        )
        .unwrap(),
    );

    let mut rollup_answers = 0;
    let mut pruned_answers = 0;
    for query in &queries {
        let full = engine.query_with(query, Strategy::FullScan).unwrap();
        for strategy in [Strategy::Auto, Strategy::Rollup, Strategy::PrunedScan] {
            match engine.query_with(query, strategy) {
                Ok(outcome) => {
                    assert!(
                        outcome.result.approx_eq(&full.result, 1e-6),
                        "{} via {:?} differs from a full scan",
                        query.id,
                        strategy
                    );
                    match strategy {
                        Strategy::Rollup => rollup_answers += 1,
                        Strategy::PrunedScan => pruned_answers += 1,
                        _ => {}
                    }
                }
                Err(EngineError::Query(_)) if strategy != Strategy::Auto => {}
                Err(e) => panic!("{} via {:?} failed: {}", query.id, strategy, e),
            }
        }
    }
    assert!(rollup_answers >= 5);
    assert!(pruned_answers >= 6);

    let q2 = &queries[1];
    assert!(!engine.query_with(q2, Strategy::FullScan).unwrap().result.rows.is_empty());
}

#[test]
fn pruned_scan_reads_fewer_rows() {
    let (_tmp, storage) = synthetic_store();
    let engine = open(&storage);
    let q2 = default_queries().unwrap().remove(1);

    let pruned = engine.query_with(&q2, Strategy::PrunedScan).unwrap();
    let full = engine.query_with(&q2, Strategy::FullScan).unwrap();
    match pruned.plan {
        Some(Plan::PrunedScan { ref indexes, .. }) => assert!(!indexes.is_empty()),
        ref other => panic!("unexpected plan {:?}", other),
    }
    assert!(pruned.stats.rows_scanned < full.stats.rows_scanned);
    assert_eq!(full.stats.rows_scanned, 4_000);
}

#[test]
fn type_index_selects_partitions() {
    let (_tmp, storage) = synthetic_store();
    let clicks = QueryRequest::parse(
        r#"{"select": ["country", {"COUNT": "*"}],
            "where": [{"col": "type", "op": "eq", "val": "click"}],
            "group_by": ["country"]}"#,
    )
    .unwrap();

    let engine = open(&storage);
    let click_partitions: Vec<_> = engine
        .manifest()
        .partitions
        .iter()
        .filter(|p| p.key.event_type == EventType::Click)
        .map(|p| p.id)
        .collect();
    let indexed = engine.query_with(&clicks, Strategy::PrunedScan).unwrap();
    match indexed.plan {
        Some(Plan::PrunedScan { ref partitions, ref indexes }) => {
            assert_eq!(partitions, &click_partitions);
            assert_eq!(indexes, &vec![Dimension::Type]);
        }
        ref other => panic!("unexpected plan {:?}", other),
    }
    drop(engine);

    // Without the type index the partition keys still admit the same files.
    fs::remove_file(storage.join(Dimension::Type.relative_path())).unwrap();
    let engine = open(&storage);
    let keyed = engine.query_with(&clicks, Strategy::PrunedScan).unwrap();
    match keyed.plan {
        Some(Plan::PrunedScan { ref partitions, ref indexes }) => {
            assert_eq!(partitions, &click_partitions);
            assert!(indexes.is_empty());
        }
        ref other => panic!("unexpected plan {:?}", other),
    }
    assert_eq!(*keyed.result, *indexed.result);
    assert_eq!(keyed.stats.rows_scanned, indexed.stats.rows_scanned);
}

#[test]
fn cache_answers_repeats_without_planning() {
    let (_tmp, storage, _) = fixture_store();
    let engine = open(&storage);
    let q1 = default_queries().unwrap().remove(0);

    let first = engine.query(&q1).unwrap();
    assert!(!first.cached());
    assert_eq!(engine.planner_counters().total(), 1);

    let second = engine.query(&q1).unwrap();
    assert!(second.cached());
    assert_eq!(*second.result, *first.result);
    assert_eq!(engine.planner_counters().total(), 1);

    let renamed = QueryRequest::parse(
        r#"{"id": "daily", "select": ["day", {"SUM": "bid_price"}],
            "where": [{"col": "type", "op": "eq", "val": "impression"}],
            "group_by": ["day"]}"#,
    )
    .unwrap();
    assert!(engine.query(&renamed).unwrap().cached());
    assert_eq!(engine.planner_counters().total(), 1);
    assert_eq!((engine.cache().hits(), engine.cache().misses()), (2, 1));
}

#[test]
fn failing_query_does_not_abort_the_batch() {
    let (tmp, storage, _) = fixture_store();
    let engine = open(&storage);
    fs::remove_file(storage.join("partitions/type=click/data.parquet")).unwrap();

    let mut queries = default_queries().unwrap();
    let clicks = QueryRequest::parse(
        r#"{"id": "clicks", "select": ["country", {"COUNT": "*"}],
            "where": [{"col": "type", "op": "eq", "val": "click"}],
            "group_by": ["country"]}"#,
    )
    .unwrap();
    queries.insert(1, clicks);

    let runs = engine.run_batch(&queries);
    assert_eq!(runs.len(), 6);
    assert_eq!(runs[1].id, "clicks");
    assert!(runs[1].outcome.is_err());
    for (i, run) in runs.iter().enumerate() {
        if i != 1 {
            assert!(run.outcome.is_ok(), "{} failed", run.id);
        }
    }

    let out = tmp.path().join("out");
    let summary = write_results(&out, &runs, &engine).unwrap();
    assert!(out.join("q1.csv").exists());
    assert!(!out.join("q2.csv").exists());
    assert!(out.join("q3.csv").exists());
    let summary: serde_json::Value = serde_json::from_slice(&fs::read(summary).unwrap()).unwrap();
    assert_eq!(summary["queries"][1]["id"], "clicks");
    assert!(summary["queries"][1]["error"].is_string());
    assert!(summary["queries"][0]["error"].is_null());
}

#[test]
fn prepare_is_idempotent() {
    let (tmp, storage, _) = fixture_store();
    let rollup_files = |root: &Path| -> BTreeMap<String, Vec<u8>> {
        fs::read_dir(root.join("rollups"))
            .unwrap()
            .map(|entry| {
                let path = entry.unwrap().path();
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                (name, fs::read(&path).unwrap())
            })
            .collect()
    };
    let before = rollup_files(&storage);
    assert_eq!(before.len(), 8);

    let again = prepare(&EngineConfig::default(), &tmp.path().join("data"), &storage).unwrap();
    assert_eq!(again.ingest.ingested, 9);
    assert_eq!(rollup_files(&storage), before);

    let leftovers: Vec<_> = fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".store."))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn unprepared_store_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let result = Engine::open(&tmp.path().join("missing"), &EngineConfig::default());
    assert!(matches!(result, Err(EngineError::NotPrepared(_))));
}
