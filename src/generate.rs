//! Synthetic event logs in the raw input format, for demos and benchmarks.

use crate::error::{EngineError, Result};
use crate::event::EventType;
use arrow::array::{ArrayRef, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::csv::WriterBuilder;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const COUNTRIES: [&str; 8] = ["US", "JP", "DE", "GB", "FR", "IN", "BR", "CA"];
const DAY_MS: i64 = 86_400_000;
const CHUNK_ROWS: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub rows: usize,
    pub files: usize,
    pub start: NaiveDate,
    pub days: u32,
    pub seed: u64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            rows: 1_000_000,
            files: 4,
            start: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap_or(NaiveDate::MIN),
            days: 30,
            seed: 42,
        }
    }
}

/// One generated record, columns in input order.
struct RawEvent {
    ts: i64,
    event_type: EventType,
    auction_id: String,
    advertiser_id: i32,
    publisher_id: i32,
    bid_price: Option<f64>,
    user_id: i64,
    total_price: Option<f64>,
    country: &'static str,
}

fn input_schema() -> Schema {
    Schema::new(vec![
        Field::new("ts", DataType::Int64, false),
        Field::new("type", DataType::Utf8, false),
        Field::new("auction_id", DataType::Utf8, false),
        Field::new("advertiser_id", DataType::Int32, false),
        Field::new("publisher_id", DataType::Int32, false),
        Field::new("bid_price", DataType::Float64, true),
        Field::new("user_id", DataType::Int64, false),
        Field::new("total_price", DataType::Float64, true),
        Field::new("country", DataType::Utf8, false),
    ])
}

fn random_event(rng: &mut StdRng, start_ms: i64, span_ms: i64) -> RawEvent {
    let event_type = match rng.gen_range(0..100) {
        0..=49 => EventType::Serve,
        50..=89 => EventType::Impression,
        90..=97 => EventType::Click,
        _ => EventType::Purchase,
    };
    let bid_price = match event_type {
        EventType::Serve | EventType::Impression => {
            Some((rng.gen_range(0.01..5.0f64) * 10_000.0).round() / 10_000.0)
        }
        _ => None,
    };
    let total_price = match event_type {
        EventType::Purchase => Some((rng.gen_range(1.0..500.0f64) * 100.0).round() / 100.0),
        _ => None,
    };
    RawEvent {
        ts: start_ms + rng.gen_range(0..span_ms),
        event_type,
        auction_id: Uuid::from_u128(rng.gen()).to_string(),
        advertiser_id: rng.gen_range(1..=2_000),
        publisher_id: rng.gen_range(1..=500),
        bid_price,
        user_id: rng.gen_range(1..=5_000_000),
        total_price,
        country: COUNTRIES[rng.gen_range(0..COUNTRIES.len())],
    }
}

fn to_batch(events: &[RawEvent], schema: &Arc<Schema>) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(events.iter().map(|e| e.ts).collect::<Int64Array>()),
        Arc::new(
            events
                .iter()
                .map(|e| Some(e.event_type.as_str()))
                .collect::<StringArray>(),
        ),
        Arc::new(
            events
                .iter()
                .map(|e| Some(e.auction_id.as_str()))
                .collect::<StringArray>(),
        ),
        Arc::new(events.iter().map(|e| e.advertiser_id).collect::<Int32Array>()),
        Arc::new(events.iter().map(|e| e.publisher_id).collect::<Int32Array>()),
        Arc::new(events.iter().map(|e| e.bid_price).collect::<Float64Array>()),
        Arc::new(events.iter().map(|e| e.user_id).collect::<Int64Array>()),
        Arc::new(events.iter().map(|e| e.total_price).collect::<Float64Array>()),
        Arc::new(
            events
                .iter()
                .map(|e| Some(e.country))
                .collect::<StringArray>(),
        ),
    ];
    RecordBatch::try_new(schema.clone(), columns).map_err(EngineError::Arrow)
}

fn write_file(path: &Path, rows: usize, seed: u64, options: &GenerateOptions) -> Result<()> {
    let start_ms = options
        .start
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| EngineError::Config(format!("invalid start date {}", options.start)))?;
    let span_ms = i64::from(options.days.max(1)) * DAY_MS;

    let schema = Arc::new(input_schema());
    let file = File::create(path).map_err(|e| EngineError::storage_write(path, e))?;
    let mut writer = WriterBuilder::new()
        .with_header(true)
        .build(BufWriter::new(file));

    let mut rng = StdRng::seed_from_u64(seed);
    let mut remaining = rows;
    while remaining > 0 {
        let n = remaining.min(CHUNK_ROWS);
        let events: Vec<RawEvent> = (0..n)
            .map(|_| random_event(&mut rng, start_ms, span_ms))
            .collect();
        writer.write(&to_batch(&events, &schema)?)?;
        remaining -= n;
    }
    Ok(())
}

/// Write `options.files` CSV files named `events_part_<N>.csv` into `dir`,
/// in parallel. The same options always produce the same files.
pub fn generate(dir: &Path, options: &GenerateOptions) -> Result<Vec<PathBuf>> {
    let start = Instant::now();
    let files = options.files.max(1);
    fs::create_dir_all(dir).map_err(|e| EngineError::storage_write(dir, e))?;
    info!(
        "Generating {} events into {} files in {}",
        options.rows,
        files,
        dir.display()
    );

    let per_file = options.rows / files;
    let paths = (0..files)
        .into_par_iter()
        .map(|i| {
            let rows = if i == files - 1 {
                options.rows - per_file * (files - 1)
            } else {
                per_file
            };
            let path = dir.join(format!("events_part_{:05}.csv", i));
            write_file(&path, rows, options.seed.wrapping_add(i as u64), options)?;
            Ok(path)
        })
        .collect::<Result<Vec<_>>>()?;

    info!("Generated {} events in {:?}", options.rows, start.elapsed());
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ingest::{discover_files, ingest_files};

    #[test]
    fn generated_files_ingest_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let options = GenerateOptions {
            rows: 1_000,
            files: 3,
            days: 2,
            ..GenerateOptions::default()
        };
        let paths = generate(dir.path(), &options).unwrap();
        assert_eq!(paths.len(), 3);
        assert_eq!(discover_files(dir.path()).unwrap(), paths);

        let mut purchases_with_price = 0;
        let report = ingest_files(&paths, &EngineConfig::default(), |event| {
            if event.event_type == EventType::Purchase {
                assert!(event.total_price.is_some());
                purchases_with_price += 1;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(report.ingested, 1_000);
        assert_eq!(report.dropped, 0);
        assert_eq!(
            report.ingested_by_type.get(&EventType::Purchase).copied().unwrap_or(0),
            purchases_with_price
        );
    }

    #[test]
    fn same_seed_same_output() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let options = GenerateOptions {
            rows: 200,
            files: 1,
            ..GenerateOptions::default()
        };
        let pa = generate(a.path(), &options).unwrap();
        let pb = generate(b.path(), &options).unwrap();
        assert_eq!(fs::read(&pa[0]).unwrap(), fs::read(&pb[0]).unwrap());
    }
}
