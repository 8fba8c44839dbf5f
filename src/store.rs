//! Columnar store: partitioned parquet files, the manifest and atomic publish.
//!
//! Layout under the storage root:
//!
//! ```text
//! partitions/type=<type>/data.parquet
//! partitions/type=<type>/day=<YYYY-MM-DD>/data.parquet   (day-partitioned types)
//! indexes/<dimension>.parquet
//! rollups/<name>.parquet
//! manifest.json
//! ```

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::event::{Column, Event, EventType};
use crate::index::{IndexFailure, IndexMeta, PartitionId};
use crate::ingest::IngestReport;
use crate::rollup::RollupMeta;
use crate::value::{date_to_days, datetime_to_millis};
use arrow::array::{
    ArrayRef, Date32Array, DictionaryArray, Float64Array, Int32Array, Int64Array, StringArray,
    TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Field, Int32Type, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use log::{debug, info, warn};
use parquet::arrow::arrow_reader::{
    ArrowReaderMetadata, ArrowReaderOptions, ParquetRecordBatchReader,
    ParquetRecordBatchReaderBuilder, RowSelection,
};
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub const PARTITIONS_DIR: &str = "partitions";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const FORMAT_VERSION: u32 = 1;

fn dictionary_utf8() -> DataType {
    DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
}

/// Physical schema of every partition file, in [`Column::ALL`] order.
pub fn event_schema() -> Schema {
    let fields = Column::ALL
        .iter()
        .map(|column| {
            let (data_type, nullable) = match column {
                Column::Ts => (DataType::Int64, false),
                // Low-cardinality strings are dictionary encoded
                Column::Type | Column::Country => (dictionary_utf8(), false),
                Column::AuctionId => (DataType::Utf8, true),
                Column::AdvertiserId | Column::PublisherId => (DataType::Int32, true),
                Column::BidPrice | Column::TotalPrice => (DataType::Float64, true),
                Column::UserId => (DataType::Int64, true),
                Column::Day | Column::Week => (DataType::Date32, false),
                Column::Hour => (DataType::Timestamp(TimeUnit::Millisecond, None), false),
                Column::Minute => (DataType::Utf8, false),
            };
            Field::new(column.name(), data_type, nullable)
        })
        .collect::<Vec<_>>();
    Schema::new(fields)
}

/// Convert events into one record batch of the event schema.
pub fn events_to_batch(events: &[Event], schema: &SchemaRef) -> Result<RecordBatch> {
    if events.is_empty() {
        return Ok(RecordBatch::new_empty(schema.clone()));
    }

    let ts: Int64Array = events.iter().map(|e| e.ts_ms).collect();
    let types: DictionaryArray<Int32Type> =
        events.iter().map(|e| Some(e.event_type.as_str())).collect();
    let auction_ids: StringArray = events.iter().map(|e| e.auction_id.as_deref()).collect();
    let advertiser_ids: Int32Array = events.iter().map(|e| e.advertiser_id).collect();
    let publisher_ids: Int32Array = events.iter().map(|e| e.publisher_id).collect();
    let bid_prices: Float64Array = events.iter().map(|e| e.bid_price).collect();
    let user_ids: Int64Array = events.iter().map(|e| e.user_id).collect();
    let total_prices: Float64Array = events.iter().map(|e| e.total_price).collect();
    let countries: DictionaryArray<Int32Type> =
        events.iter().map(|e| Some(e.country.as_str())).collect();
    let days: Date32Array = events
        .iter()
        .map(|e| Some(date_to_days(e.local.day)))
        .collect();
    let weeks: Date32Array = events
        .iter()
        .map(|e| Some(date_to_days(e.local.week)))
        .collect();
    let hours: TimestampMillisecondArray = events
        .iter()
        .map(|e| Some(datetime_to_millis(e.local.hour)))
        .collect();
    let minutes: StringArray = events.iter().map(|e| Some(e.local.minute_label())).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(ts),
        Arc::new(types),
        Arc::new(auction_ids),
        Arc::new(advertiser_ids),
        Arc::new(publisher_ids),
        Arc::new(bid_prices),
        Arc::new(user_ids),
        Arc::new(total_prices),
        Arc::new(countries),
        Arc::new(days),
        Arc::new(weeks),
        Arc::new(hours),
        Arc::new(minutes),
    ];
    RecordBatch::try_new(schema.clone(), columns).map_err(EngineError::Arrow)
}

/// Physical partition identity: event type, plus local day for
/// day-partitioned types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub event_type: EventType,
    pub day: Option<NaiveDate>,
}

impl PartitionKey {
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(PARTITIONS_DIR).join(format!("type={}", self.event_type));
        if let Some(day) = self.day {
            path = path.join(format!("day={}", day.format("%Y-%m-%d")));
        }
        path.join("data.parquet")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub id: PartitionId,
    pub key: PartitionKey,
    /// Path relative to the storage root.
    pub path: PathBuf,
    pub rows: u64,
}

struct OpenPartition {
    path: PathBuf,
    writer: ArrowWriter<BufWriter<File>>,
    pending: Vec<Event>,
    rows: u64,
}

/// Streams events into per-partition parquet writers.
pub struct PartitionWriterSet {
    root: PathBuf,
    schema: SchemaRef,
    props: WriterProperties,
    batch_size: usize,
    day_partitioned: Vec<EventType>,
    open: BTreeMap<PartitionKey, OpenPartition>,
}

impl PartitionWriterSet {
    pub fn new(root: &Path, config: &EngineConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            schema: Arc::new(event_schema()),
            props: config.writer_properties(),
            batch_size: config.batch_size,
            day_partitioned: config.day_partitioned_types.clone(),
            open: BTreeMap::new(),
        }
    }

    pub fn key_for(&self, event: &Event) -> PartitionKey {
        let day = self
            .day_partitioned
            .contains(&event.event_type)
            .then_some(event.local.day);
        PartitionKey {
            event_type: event.event_type,
            day,
        }
    }

    pub fn push(&mut self, event: Event) -> Result<()> {
        let key = self.key_for(&event);
        if !self.open.contains_key(&key) {
            let partition = self.open_partition(&key)?;
            self.open.insert(key, partition);
        }
        let Some(partition) = self.open.get_mut(&key) else {
            return Ok(());
        };
        partition.pending.push(event);
        if partition.pending.len() >= self.batch_size {
            flush(partition, &self.schema)?;
        }
        Ok(())
    }

    fn open_partition(&self, key: &PartitionKey) -> Result<OpenPartition> {
        let path = self.root.join(key.relative_path());
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| EngineError::storage_write(dir, e))?;
        }
        let file = File::create(&path).map_err(|e| EngineError::storage_write(&path, e))?;
        let buf_writer = BufWriter::with_capacity(2 * 1024 * 1024, file);
        let writer = ArrowWriter::try_new(buf_writer, self.schema.clone(), Some(self.props.clone()))
            .map_err(|e| EngineError::storage_write(&path, e))?;
        debug!("Opened partition writer {}", path.display());
        Ok(OpenPartition {
            path,
            writer,
            pending: Vec::with_capacity(self.batch_size),
            rows: 0,
        })
    }

    /// Flush and close every writer. Partition ids follow key order.
    pub fn finish(self) -> Result<Vec<PartitionMeta>> {
        let mut metas = Vec::with_capacity(self.open.len());
        for (id, (key, mut partition)) in self.open.into_iter().enumerate() {
            flush(&mut partition, &self.schema)?;
            partition
                .writer
                .close()
                .map_err(|e| EngineError::storage_write(&partition.path, e))?;
            metas.push(PartitionMeta {
                id: id as PartitionId,
                key,
                path: key.relative_path(),
                rows: partition.rows,
            });
        }
        info!("Wrote {} partitions", metas.len());
        Ok(metas)
    }
}

fn flush(partition: &mut OpenPartition, schema: &SchemaRef) -> Result<()> {
    if partition.pending.is_empty() {
        return Ok(());
    }
    let batch = events_to_batch(&partition.pending, schema)?;
    partition
        .writer
        .write(&batch)
        .map_err(|e| EngineError::storage_write(&partition.path, e))?;
    partition.rows += batch.num_rows() as u64;
    partition.pending.clear();
    Ok(())
}

/// Holds the parsed footer of one file so several projected readers can be
/// created without re-parsing it.
pub struct PartitionReader {
    path: PathBuf,
    metadata: ArrowReaderMetadata,
}

impl PartitionReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let metadata = ArrowReaderMetadata::load(&file, ArrowReaderOptions::default())?;
        Ok(Self {
            path: path.to_path_buf(),
            metadata,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.metadata.schema().clone()
    }

    pub fn num_rows(&self) -> usize {
        self.metadata.metadata().file_metadata().num_rows() as usize
    }

    /// Gets root column indices for the given names.
    pub fn column_indices(&self, names: &[&str]) -> Result<Vec<usize>> {
        let schema = self.metadata.schema();
        names
            .iter()
            .map(|&name| {
                schema
                    .fields()
                    .iter()
                    .position(|f| f.name() == name)
                    .ok_or_else(|| EngineError::FieldNotFound(name.to_string()))
            })
            .collect()
    }

    /// Creates a record batch reader restricted to `names`, optionally only
    /// over the selected rows. Projected batches keep file column order, so
    /// callers look columns up by name.
    pub fn reader(
        &self,
        names: &[&str],
        selection: Option<RowSelection>,
        batch_size: usize,
    ) -> Result<ParquetRecordBatchReader> {
        let indices = self.column_indices(names)?;
        let file = File::open(&self.path)?;
        let mut builder =
            ParquetRecordBatchReaderBuilder::new_with_metadata(file, self.metadata.clone());
        let projection = ProjectionMask::roots(
            self.metadata.metadata().file_metadata().schema_descr(),
            indices,
        );
        builder = builder.with_projection(projection).with_batch_size(batch_size);
        if let Some(selection) = selection {
            builder = builder.with_row_selection(selection);
        }
        builder.build().map_err(EngineError::Parquet)
    }

    pub fn key_value(&self, key: &str) -> Option<String> {
        self.metadata
            .metadata()
            .file_metadata()
            .key_value_metadata()?
            .iter()
            .find(|kv| kv.key == key)
            .and_then(|kv| kv.value.clone())
    }
}

/// Everything the run phase needs to know about a prepared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub timezone: String,
    pub day_partitioned_types: Vec<EventType>,
    pub partitions: Vec<PartitionMeta>,
    pub ingest: IngestReport,
    pub indexes: Vec<IndexMeta>,
    pub degraded_indexes: Vec<IndexFailure>,
    pub rollups: Vec<RollupMeta>,
}

impl Manifest {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(EngineError::NotPrepared(format!(
                "no manifest at {}",
                path.display()
            )));
        }
        let manifest: Manifest = serde_json::from_slice(&fs::read(&path)?)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(EngineError::NotPrepared(format!(
                "manifest format {} (expected {})",
                manifest.format_version, FORMAT_VERSION
            )));
        }
        Ok(manifest)
    }

    pub fn write(&self, root: &Path) -> Result<()> {
        let path = root.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(&path, json).map_err(|e| EngineError::storage_write(&path, e))
    }

    pub fn partition(&self, id: PartitionId) -> Option<&PartitionMeta> {
        self.partitions.get(id as usize)
    }

    pub fn rows_of_type(&self, event_type: EventType) -> u64 {
        self.partitions
            .iter()
            .filter(|p| p.key.event_type == event_type)
            .map(|p| p.rows)
            .sum()
    }
}

/// A sibling directory the whole store is built in before being swapped into
/// place. Dropped without [`StagingDir::publish`], it removes itself.
pub struct StagingDir {
    path: PathBuf,
    target: PathBuf,
    published: bool,
}

impl StagingDir {
    pub fn create(target: &Path) -> Result<Self> {
        let (parent, name) = split_target(target)?;
        fs::create_dir_all(&parent).map_err(|e| EngineError::storage_write(&parent, e))?;
        remove_stale_siblings(&parent, &name);

        let path = parent.join(format!(".{}.staging-{}", name, Uuid::new_v4().simple()));
        fs::create_dir_all(&path).map_err(|e| EngineError::storage_write(&path, e))?;
        debug!("Staging store in {}", path.display());
        Ok(Self {
            path,
            target: target.to_path_buf(),
            published: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Swap the staged store into the target location.
    pub fn publish(mut self) -> Result<()> {
        let (parent, name) = split_target(&self.target)?;
        let retired = parent.join(format!(".{}.retired-{}", name, Uuid::new_v4().simple()));
        let had_previous = self.target.exists();
        if had_previous {
            fs::rename(&self.target, &retired)
                .map_err(|e| EngineError::storage_write(&self.target, e))?;
        }
        if let Err(e) = fs::rename(&self.path, &self.target) {
            if had_previous {
                // Put the previous store back so the run phase still sees it.
                let _ = fs::rename(&retired, &self.target);
            }
            return Err(EngineError::storage_write(&self.target, e));
        }
        self.published = true;
        if had_previous {
            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!("Could not remove retired store {}: {}", retired.display(), e);
            }
        }
        info!("Published store at {}", self.target.display());
        Ok(())
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.published {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                warn!("Could not remove staging dir {}: {}", self.path.display(), e);
            }
        }
    }
}

fn split_target(target: &Path) -> Result<(PathBuf, String)> {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            EngineError::Config(format!("invalid storage dir {}", target.display()))
        })?;
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((parent, name))
}

/// Remove leftovers of aborted or interrupted prepares for this target.
fn remove_stale_siblings(parent: &Path, name: &str) {
    let staging = format!(".{}.staging-", name);
    let retired = format!(".{}.retired-", name);
    let Ok(entries) = fs::read_dir(parent) else {
        return;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with(&staging) || file_name.starts_with(&retired) {
            info!("Removing stale directory {}", entry.path().display());
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!("Could not remove {}: {}", entry.path().display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LocalTime;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::Int64Type;
    use parquet::arrow::arrow_reader::RowSelector;

    fn event(event_type: EventType, ts_ms: i64) -> Event {
        Event {
            ts_ms,
            event_type,
            auction_id: Some("a".into()),
            advertiser_id: Some(1),
            publisher_id: None,
            bid_price: Some(0.5),
            user_id: None,
            total_price: None,
            country: "US".into(),
            local: LocalTime::derive(ts_ms, chrono_tz::UTC).unwrap(),
        }
    }

    #[test]
    fn writer_splits_by_type_and_day() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            timezone: "UTC".into(),
            batch_size: 2,
            ..EngineConfig::default()
        };
        let mut writers = PartitionWriterSet::new(dir.path(), &config);
        let day = 86_400_000;
        for i in 0..5 {
            writers.push(event(EventType::Impression, i * day / 2)).unwrap();
            writers.push(event(EventType::Click, i)).unwrap();
        }
        let metas = writers.finish().unwrap();

        let impressions: Vec<_> = metas
            .iter()
            .filter(|m| m.key.event_type == EventType::Impression)
            .collect();
        assert_eq!(impressions.len(), 3);
        assert_eq!(impressions.iter().map(|m| m.rows).sum::<u64>(), 5);
        assert!(impressions.iter().all(|m| m.key.day.is_some()));

        let clicks = metas
            .iter()
            .find(|m| m.key.event_type == EventType::Click)
            .unwrap();
        assert_eq!(clicks.rows, 5);
        assert_eq!(
            clicks.path,
            PathBuf::from("partitions/type=click/data.parquet")
        );
        for (i, meta) in metas.iter().enumerate() {
            assert_eq!(meta.id as usize, i);
        }

        let reader = PartitionReader::open(&dir.path().join(&clicks.path)).unwrap();
        assert_eq!(reader.num_rows(), 5);
        let batches: Vec<_> = reader
            .reader(&["country", "ts"], None, 1024)
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(batches[0].num_columns(), 2);
        assert_eq!(batches[0].column_by_name("ts").unwrap().len(), 5);
        assert!(matches!(
            reader.column_indices(&["revenue"]),
            Err(EngineError::FieldNotFound(_))
        ));
    }

    #[test]
    fn one_footer_serves_many_projections() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            timezone: "UTC".into(),
            batch_size: 2,
            ..EngineConfig::default()
        };
        let mut writers = PartitionWriterSet::new(dir.path(), &config);
        for i in 0..6 {
            writers.push(event(EventType::Serve, i)).unwrap();
        }
        let metas = writers.finish().unwrap();
        let reader = PartitionReader::open(&dir.path().join(&metas[0].path)).unwrap();
        assert_eq!(reader.schema().fields().len(), Column::ALL.len());

        let all: usize = reader
            .reader(&["ts"], None, 4)
            .unwrap()
            .map(|b| b.unwrap().num_rows())
            .sum();
        assert_eq!(all, 6);

        let selection = RowSelection::from(vec![
            RowSelector::skip(2),
            RowSelector::select(3),
            RowSelector::skip(1),
        ]);
        let batches: Vec<RecordBatch> = reader
            .reader(&["day", "ts"], Some(selection), 4)
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 3);
        let ts = batches[0].column_by_name("ts").unwrap().as_primitive::<Int64Type>();
        assert_eq!(ts.value(0), 2);
    }

    #[test]
    fn staging_publishes_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("store");

        // An aborted prepare leaves nothing behind.
        {
            let staging = StagingDir::create(&target).unwrap();
            fs::write(staging.path().join("partial"), b"x").unwrap();
        }
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        let staging = StagingDir::create(&target).unwrap();
        fs::write(staging.path().join("first"), b"1").unwrap();
        staging.publish().unwrap();
        assert!(target.join("first").exists());

        let staging = StagingDir::create(&target).unwrap();
        fs::write(staging.path().join("second"), b"2").unwrap();
        staging.publish().unwrap();
        assert!(target.join("second").exists());
        assert!(!target.join("first").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn stale_staging_dirs_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("store");
        fs::create_dir_all(dir.path().join(".store.staging-deadbeef")).unwrap();
        let staging = StagingDir::create(&target).unwrap();
        assert!(!dir.path().join(".store.staging-deadbeef").exists());
        drop(staging);
    }
}
