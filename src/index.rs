//! Inverted indexes over the type, day and country dimensions.
//!
//! Each index maps the dimension's sortable key to postings: for every
//! partition holding the key, the row ranges where it occurs.

use crate::art::{AdaptiveRadixTree, TreeStats};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::event::Column;
use crate::query::{Predicate, PredicateOp};
use crate::store::{PartitionMeta, PartitionReader};
use crate::value::{ColumnView, Value};
use arrow::array::{Array, ArrayRef, AsArray, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema, UInt32Type};
use arrow::record_batch::RecordBatch;
use log::{debug, info, warn};
use parquet::arrow::arrow_reader::{RowSelection, RowSelector};
use parquet::arrow::ArrowWriter;
use parquet::format::KeyValue;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File};
use std::ops::{Bound, Range};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub type PartitionId = u32;

pub const INDEXES_DIR: &str = "indexes";
const DIMENSION_TAG: &str = "index.dimension";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Type,
    Day,
    Country,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Type, Dimension::Day, Dimension::Country];

    pub fn column(&self) -> Column {
        match self {
            Dimension::Type => Column::Type,
            Dimension::Day => Column::Day,
            Dimension::Country => Column::Country,
        }
    }

    pub fn from_column(column: Column) -> Option<Dimension> {
        Dimension::ALL.into_iter().find(|d| d.column() == column)
    }

    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(INDEXES_DIR).join(format!("{}.parquet", self))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column().name())
    }
}

/// Sorted, non-overlapping, non-adjacent half-open row ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowRanges(Vec<Range<u32>>);

impl RowRanges {
    pub fn full(rows: u32) -> Self {
        let mut ranges = Self::default();
        ranges.push_range(0..rows);
        ranges
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = Range<u32>>) -> Self {
        let mut sorted: Vec<Range<u32>> = ranges.into_iter().collect();
        sorted.sort_by_key(|r| r.start);
        let mut out = Self::default();
        for range in sorted {
            out.push_range(range);
        }
        out
    }

    /// Append a range that starts at or after every range already held.
    pub fn push_range(&mut self, range: Range<u32>) {
        if range.is_empty() {
            return;
        }
        match self.0.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => self.0.push(range),
        }
    }

    /// Append a row; rows must arrive in ascending order.
    pub fn push_row(&mut self, row: u32) {
        self.push_range(row..row + 1);
    }

    pub fn ranges(&self) -> &[Range<u32>] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn row_count(&self) -> u64 {
        self.0.iter().map(|r| u64::from(r.end - r.start)).sum()
    }

    /// Merge `other` in place. Appends directly when `other` starts at or
    /// after every range already held.
    pub fn extend(&mut self, other: &RowRanges) {
        let appendable = match (self.0.last(), other.0.first()) {
            (Some(last), Some(first)) => first.start >= last.start,
            _ => true,
        };
        if appendable {
            for range in &other.0 {
                self.push_range(range.clone());
            }
        } else {
            *self = self.union(other);
        }
    }

    pub fn union(&self, other: &RowRanges) -> RowRanges {
        RowRanges::from_ranges(self.0.iter().chain(other.0.iter()).cloned())
    }

    pub fn intersect(&self, other: &RowRanges) -> RowRanges {
        let mut out = RowRanges::default();
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            let (a, b) = (&self.0[i], &other.0[j]);
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if start < end {
                out.push_range(start..end);
            }
            if a.end < b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        out
    }

    /// Parquet row selection over a file of `total_rows` rows.
    pub fn to_selection(&self, total_rows: usize) -> RowSelection {
        let mut selectors = Vec::with_capacity(self.0.len() * 2 + 1);
        let mut cursor = 0usize;
        for range in &self.0 {
            let start = (range.start as usize).min(total_rows);
            let end = (range.end as usize).min(total_rows);
            if start > cursor {
                selectors.push(RowSelector::skip(start - cursor));
            }
            if end > start {
                selectors.push(RowSelector::select(end - start));
            }
            cursor = end.max(cursor);
        }
        if cursor < total_rows {
            selectors.push(RowSelector::skip(total_rows - cursor));
        }
        RowSelection::from(selectors)
    }
}

pub type Postings = BTreeMap<PartitionId, RowRanges>;

pub fn union_postings(into: &mut Postings, other: &Postings) {
    for (partition, ranges) in other {
        into.entry(*partition)
            .and_modify(|existing| existing.extend(ranges))
            .or_insert_with(|| ranges.clone());
    }
}

pub fn intersect_postings(a: &Postings, b: &Postings) -> Postings {
    a.iter()
        .filter_map(|(partition, left)| {
            let right = b.get(partition)?;
            let both = left.intersect(right);
            (!both.is_empty()).then_some((*partition, both))
        })
        .collect()
}

/// One dimension's key → postings map.
pub struct DimensionIndex {
    dimension: Dimension,
    tree: AdaptiveRadixTree<Postings>,
}

impl DimensionIndex {
    pub fn new(dimension: Dimension) -> Self {
        Self {
            dimension,
            tree: AdaptiveRadixTree::new(),
        }
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    pub fn key_count(&self) -> usize {
        self.tree.len()
    }

    pub fn tree_stats(&self) -> TreeStats {
        self.tree.stats()
    }

    pub fn add(&mut self, key: &str, partition: PartitionId, ranges: RowRanges) {
        if let Some(postings) = self.tree.get_mut(key.as_bytes()) {
            postings
                .entry(partition)
                .and_modify(|existing| existing.extend(&ranges))
                .or_insert(ranges);
        } else {
            self.tree
                .insert(key.as_bytes(), BTreeMap::from([(partition, ranges)]));
        }
    }

    /// Build from the partition files. Partitions whose key fixes the
    /// dimension value get one whole-partition range without being read.
    pub fn build(
        dimension: Dimension,
        root: &Path,
        partitions: &[PartitionMeta],
        batch_size: usize,
    ) -> Result<Self> {
        let mut index = DimensionIndex::new(dimension);
        for partition in partitions {
            let rows = u32::try_from(partition.rows).map_err(|_| EngineError::IndexBuild {
                dimension: dimension.to_string(),
                reason: format!("partition {} exceeds u32 rows", partition.id),
            })?;
            let fixed = match dimension {
                Dimension::Type => Some(partition.key.event_type.as_str().to_string()),
                Dimension::Day => partition.key.day.map(|d| d.format("%Y-%m-%d").to_string()),
                Dimension::Country => None,
            };
            match fixed {
                Some(key) => {
                    if rows > 0 {
                        index.add(&key, partition.id, RowRanges::full(rows));
                    }
                }
                None => index.scan_partition(root, partition, batch_size)?,
            }
        }
        Ok(index)
    }

    fn scan_partition(
        &mut self,
        root: &Path,
        partition: &PartitionMeta,
        batch_size: usize,
    ) -> Result<()> {
        let reader = PartitionReader::open(&root.join(&partition.path))?;
        let column = self.dimension.column().name();
        let mut per_key: HashMap<String, RowRanges> = HashMap::new();
        let mut offset = 0u32;
        for batch in reader.reader(&[column], None, batch_size)? {
            let batch = batch?;
            let array = batch
                .column_by_name(column)
                .ok_or_else(|| EngineError::FieldNotFound(column.to_string()))?;
            let view = ColumnView::try_new(array)?;
            for row in 0..batch.num_rows() {
                if let Some(key) = view.value(row).index_key() {
                    per_key.entry(key).or_default().push_row(offset + row as u32);
                }
            }
            offset += batch.num_rows() as u32;
        }
        for (key, ranges) in per_key {
            self.add(&key, partition.id, ranges);
        }
        Ok(())
    }

    pub fn lookup_eq(&self, value: &Value) -> Postings {
        value
            .index_key()
            .and_then(|key| self.tree.get(key.as_bytes()).cloned())
            .unwrap_or_default()
    }

    pub fn lookup_range(&self, lower: Bound<&Value>, upper: Bound<&Value>) -> Postings {
        let Some(lower_key) = bound_key(lower) else {
            return Postings::new();
        };
        let Some(upper_key) = bound_key(upper) else {
            return Postings::new();
        };
        let mut out = Postings::new();
        for (_, postings) in self.tree.range(as_bytes(&lower_key), as_bytes(&upper_key)) {
            union_postings(&mut out, postings);
        }
        out
    }

    /// Postings of the rows that can satisfy the predicate, or `None` when
    /// the index cannot narrow it down (wrong column or `neq`).
    pub fn lookup_predicate(&self, predicate: &Predicate) -> Option<Postings> {
        if predicate.column != self.dimension.column() {
            return None;
        }
        let postings = match &predicate.op {
            PredicateOp::Eq(v) => self.lookup_eq(v),
            PredicateOp::In(values) => {
                let mut out = Postings::new();
                for v in values {
                    union_postings(&mut out, &self.lookup_eq(v));
                }
                out
            }
            PredicateOp::Between(lo, hi) => {
                self.lookup_range(Bound::Included(lo), Bound::Included(hi))
            }
            PredicateOp::Lt(v) => self.lookup_range(Bound::Unbounded, Bound::Excluded(v)),
            PredicateOp::Lte(v) => self.lookup_range(Bound::Unbounded, Bound::Included(v)),
            PredicateOp::Gt(v) => self.lookup_range(Bound::Excluded(v), Bound::Unbounded),
            PredicateOp::Gte(v) => self.lookup_range(Bound::Included(v), Bound::Unbounded),
            PredicateOp::Neq(_) => return None,
        };
        Some(postings)
    }

    /// All keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.tree
            .iter()
            .into_iter()
            .map(|(k, _)| String::from_utf8_lossy(&k).into_owned())
            .collect()
    }

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("key", DataType::Utf8, false),
            Field::new("partition", DataType::UInt32, false),
            Field::new("row_start", DataType::UInt32, false),
            Field::new("row_end", DataType::UInt32, false),
        ])
    }

    /// Persist as one parquet row per (key, partition, range). Returns the
    /// number of rows written.
    pub fn write(&self, path: &Path, config: &EngineConfig) -> Result<u64> {
        let mut keys = Vec::new();
        let mut partitions = Vec::new();
        let mut starts = Vec::new();
        let mut ends = Vec::new();
        for (key, postings) in self.tree.iter() {
            let key = String::from_utf8_lossy(&key).into_owned();
            for (partition, ranges) in postings {
                for range in ranges.ranges() {
                    keys.push(key.clone());
                    partitions.push(*partition);
                    starts.push(range.start);
                    ends.push(range.end);
                }
            }
        }
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(keys)),
            Arc::new(UInt32Array::from(partitions)),
            Arc::new(UInt32Array::from(starts)),
            Arc::new(UInt32Array::from(ends)),
        ];
        let batch = RecordBatch::try_new(Arc::new(Self::schema()), columns)?;

        let file = File::create(path).map_err(|e| EngineError::storage_write(path, e))?;
        let mut writer =
            ArrowWriter::try_new(file, batch.schema(), Some(config.writer_properties()))?;
        writer.append_key_value_metadata(KeyValue::new(
            DIMENSION_TAG.to_string(),
            self.dimension.to_string(),
        ));
        writer.write(&batch)?;
        writer.close()?;
        Ok(batch.num_rows() as u64)
    }

    pub fn load(dimension: Dimension, path: &Path) -> Result<Self> {
        let reader = PartitionReader::open(path)?;
        let tag = reader.key_value(DIMENSION_TAG);
        if tag.as_deref() != Some(dimension.to_string().as_str()) {
            return Err(EngineError::IndexBuild {
                dimension: dimension.to_string(),
                reason: format!("{} is tagged {:?}", path.display(), tag),
            });
        }
        let mut index = DimensionIndex::new(dimension);
        // Rows are stored in (key, partition, row_start) order, so each
        // posting list arrives as one contiguous run.
        let mut run: Option<(String, PartitionId, Vec<Range<u32>>)> = None;
        let names = ["key", "partition", "row_start", "row_end"];
        for batch in reader.reader(&names, None, 8192)? {
            let batch = batch?;
            let column = |name: &str| {
                batch
                    .column_by_name(name)
                    .ok_or_else(|| EngineError::FieldNotFound(name.to_string()))
            };
            let keys = column("key")?.as_string::<i32>();
            let partitions = column("partition")?.as_primitive::<UInt32Type>();
            let starts = column("row_start")?.as_primitive::<UInt32Type>();
            let ends = column("row_end")?.as_primitive::<UInt32Type>();
            for row in 0..batch.num_rows() {
                if keys.is_null(row) {
                    continue;
                }
                let (key, partition) = (keys.value(row), partitions.value(row));
                let range = starts.value(row)..ends.value(row);
                let same_run = matches!(&run, Some((k, p, _)) if k == key && *p == partition);
                if same_run {
                    if let Some((_, _, ranges)) = run.as_mut() {
                        ranges.push(range);
                    }
                } else if let Some((k, p, ranges)) =
                    run.replace((key.to_string(), partition, vec![range]))
                {
                    index.add(&k, p, RowRanges::from_ranges(ranges));
                }
            }
        }
        if let Some((k, p, ranges)) = run {
            index.add(&k, p, RowRanges::from_ranges(ranges));
        }
        Ok(index)
    }
}

fn bound_key(bound: Bound<&Value>) -> Option<Bound<String>> {
    match bound {
        Bound::Included(v) => v.index_key().map(Bound::Included),
        Bound::Excluded(v) => v.index_key().map(Bound::Excluded),
        Bound::Unbounded => Some(Bound::Unbounded),
    }
}

fn as_bytes(bound: &Bound<String>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_bytes()),
        Bound::Excluded(k) => Bound::Excluded(k.as_bytes()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub dimension: Dimension,
    pub path: PathBuf,
    pub keys: usize,
    pub entries: u64,
}

/// A dimension whose index could not be built or loaded. Queries still
/// run, without that index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFailure {
    pub dimension: Dimension,
    pub reason: String,
}

fn build_one(
    dimension: Dimension,
    root: &Path,
    partitions: &[PartitionMeta],
    config: &EngineConfig,
) -> Result<IndexMeta> {
    let start = Instant::now();
    let index = DimensionIndex::build(dimension, root, partitions, config.batch_size)?;

    let relative = dimension.relative_path();
    let path = root.join(&relative);
    let tmp = path.with_extension("parquet.tmp");
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| EngineError::storage_write(dir, e))?;
    }
    let entries = index.write(&tmp, config)?;
    fs::rename(&tmp, &path).map_err(|e| EngineError::storage_write(&path, e))?;

    let stats = index.tree_stats();
    info!(
        "Built {} index: {} keys, {} entries in {:?}",
        dimension,
        index.key_count(),
        entries,
        start.elapsed()
    );
    debug!("{} index tree: {:?}", dimension, stats);
    Ok(IndexMeta {
        dimension,
        path: relative,
        keys: index.key_count(),
        entries,
    })
}

/// Build every dimension index in parallel. A failing dimension is reported
/// and left out; it never affects the others.
pub fn build_all(
    root: &Path,
    partitions: &[PartitionMeta],
    config: &EngineConfig,
) -> (Vec<IndexMeta>, Vec<IndexFailure>) {
    let results: Vec<(Dimension, Result<IndexMeta>)> = Dimension::ALL
        .par_iter()
        .map(|&dimension| (dimension, build_one(dimension, root, partitions, config)))
        .collect();

    let mut built = Vec::new();
    let mut failed = Vec::new();
    for (dimension, result) in results {
        match result {
            Ok(meta) => built.push(meta),
            Err(e) => {
                warn!(
                    "Index on {} unavailable, queries will scan instead: {}",
                    dimension, e
                );
                let tmp = root.join(dimension.relative_path());
                let _ = fs::remove_file(tmp.with_extension("parquet.tmp"));
                failed.push(IndexFailure {
                    dimension,
                    reason: e.to_string(),
                });
            }
        }
    }
    (built, failed)
}

/// The indexes available to the planner.
#[derive(Default)]
pub struct IndexSet {
    indexes: BTreeMap<Dimension, DimensionIndex>,
}

impl IndexSet {
    /// Load the published indexes. Load failures degrade like build failures.
    pub fn load(root: &Path, metas: &[IndexMeta]) -> (Self, Vec<IndexFailure>) {
        let mut set = IndexSet::default();
        let mut failed = Vec::new();
        for meta in metas {
            match DimensionIndex::load(meta.dimension, &root.join(&meta.path)) {
                Ok(index) => set.insert(index),
                Err(e) => {
                    warn!("Could not load {} index: {}", meta.dimension, e);
                    failed.push(IndexFailure {
                        dimension: meta.dimension,
                        reason: e.to_string(),
                    });
                }
            }
        }
        (set, failed)
    }

    pub fn insert(&mut self, index: DimensionIndex) {
        self.indexes.insert(index.dimension(), index);
    }

    pub fn get(&self, dimension: Dimension) -> Option<&DimensionIndex> {
        self.indexes.get(&dimension)
    }

    pub fn dimensions(&self) -> Vec<Dimension> {
        self.indexes.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventType, LocalTime};
    use crate::store::{PartitionKey, PartitionWriterSet};
    use chrono::NaiveDate;

    fn ranges(r: &[Range<u32>]) -> RowRanges {
        RowRanges::from_ranges(r.iter().cloned())
    }

    #[test]
    fn row_ranges_merge_adjacent_rows() {
        let mut r = RowRanges::default();
        for row in [0, 1, 2, 5, 6, 9] {
            r.push_row(row);
        }
        assert_eq!(r.ranges(), &[0..3, 5..7, 9..10]);
        assert_eq!(r.row_count(), 6);
    }

    #[test]
    fn row_ranges_algebra() {
        let a = ranges(&[0..10, 20..30]);
        let b = ranges(&[5..25]);
        assert_eq!(a.intersect(&b).ranges(), &[5..10, 20..25]);
        assert_eq!(a.union(&b).ranges(), &[0..30]);
        assert!(a.intersect(&ranges(&[10..20])).is_empty());
    }

    #[test]
    fn extend_appends_or_merges() {
        let mut r = ranges(&[0..2, 4..6]);
        r.extend(&ranges(&[6..8, 10..11]));
        assert_eq!(r.ranges(), &[0..2, 4..8, 10..11]);
        r.extend(&ranges(&[2..4]));
        assert_eq!(r.ranges(), &[0..8, 10..11]);
    }

    #[test]
    fn selection_covers_whole_file() {
        let selection = ranges(&[2..4, 6..7]).to_selection(10);
        assert_eq!(selection.row_count(), 3);
        let selectors: Vec<RowSelector> = selection.into();
        let total: usize = selectors.iter().map(|s| s.row_count).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn postings_intersection_is_per_partition() {
        let a = Postings::from([(0, ranges(&[0..5])), (1, ranges(&[0..5]))]);
        let b = Postings::from([(1, ranges(&[3..8])), (2, ranges(&[0..1]))]);
        let both = intersect_postings(&a, &b);
        assert_eq!(both.len(), 1);
        assert_eq!(both[&1].ranges(), &[3..5]);
    }

    #[test]
    fn lookups_follow_key_order() {
        let mut index = DimensionIndex::new(Dimension::Day);
        for (day, partition) in [(1, 0), (2, 1), (3, 2), (4, 3)] {
            index.add(&format!("2024-06-0{}", day), partition, RowRanges::full(10));
        }
        let day = |d: u32| Value::Date(NaiveDate::from_ymd_opt(2024, 6, d).unwrap());

        let eq = index.lookup_eq(&day(2));
        assert_eq!(eq.keys().copied().collect::<Vec<_>>(), vec![1]);

        let between = index.lookup_predicate(&Predicate {
            column: Column::Day,
            op: PredicateOp::Between(day(2), day(3)),
        });
        assert_eq!(between.unwrap().len(), 2);

        let gt = index
            .lookup_predicate(&Predicate {
                column: Column::Day,
                op: PredicateOp::Gt(day(3)),
            })
            .unwrap();
        assert_eq!(gt.keys().copied().collect::<Vec<_>>(), vec![3]);

        assert!(index
            .lookup_predicate(&Predicate {
                column: Column::Day,
                op: PredicateOp::Neq(day(3)),
            })
            .is_none());
        assert!(index.lookup_eq(&Value::Null).is_empty());
    }

    fn event(event_type: EventType, country: &str, ts_ms: i64) -> Event {
        Event {
            ts_ms,
            event_type,
            auction_id: None,
            advertiser_id: Some(1),
            publisher_id: Some(1),
            bid_price: Some(1.0),
            user_id: None,
            total_price: None,
            country: country.to_string(),
            local: LocalTime::derive(ts_ms, chrono_tz::UTC).unwrap(),
        }
    }

    fn write_partitions(root: &Path) -> Vec<PartitionMeta> {
        let config = EngineConfig {
            timezone: "UTC".into(),
            ..EngineConfig::default()
        };
        let mut writers = PartitionWriterSet::new(root, &config);
        for (i, country) in ["US", "US", "JP", "US", "DE"].iter().enumerate() {
            writers
                .push(event(EventType::Click, country, i as i64))
                .unwrap();
            writers
                .push(event(EventType::Impression, country, i as i64 * 86_400_000))
                .unwrap();
        }
        writers.finish().unwrap()
    }

    #[test]
    fn build_write_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let partitions = write_partitions(dir.path());
        let config = EngineConfig::default();

        let country =
            DimensionIndex::build(Dimension::Country, dir.path(), &partitions, 1024).unwrap();
        assert_eq!(country.keys(), vec!["DE", "JP", "US"]);
        let clicks = partitions
            .iter()
            .find(|p| p.key == PartitionKey { event_type: EventType::Click, day: None })
            .unwrap();
        let us = country.lookup_eq(&Value::Str("US".into()));
        assert_eq!(us[&clicks.id].ranges(), &[0..2, 3..4]);

        let path = dir.path().join("country.parquet");
        let written = country.write(&path, &config).unwrap();
        let loaded = DimensionIndex::load(Dimension::Country, &path).unwrap();
        assert_eq!(loaded.keys(), country.keys());
        assert_eq!(loaded.lookup_eq(&Value::Str("US".into())), us);
        assert!(written >= 5);

        assert!(DimensionIndex::load(Dimension::Day, &path).is_err());
    }

    #[test]
    fn interleaved_postings_load_in_one_pass() {
        // Alternating countries give one range per row.
        let rows = 100_000u32;
        let mut us = RowRanges::default();
        let mut jp = RowRanges::default();
        for row in 0..rows {
            if row % 2 == 0 {
                us.push_row(row);
            } else {
                jp.push_row(row);
            }
        }
        let mut index = DimensionIndex::new(Dimension::Country);
        index.add("US", 0, us.clone());
        index.add("JP", 0, jp);
        index.add("US", 1, RowRanges::full(10));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("country.parquet");
        let written = index.write(&path, &EngineConfig::default()).unwrap();
        assert_eq!(written, u64::from(rows) + 1);

        let start = Instant::now();
        let loaded = DimensionIndex::load(Dimension::Country, &path).unwrap();
        let elapsed = start.elapsed();

        let found = loaded.lookup_eq(&Value::Str("US".into()));
        assert_eq!(found[&0], us);
        assert_eq!(found[&0].ranges().len(), (rows / 2) as usize);
        assert_eq!(found[&1].ranges(), &[0..10]);
        assert_eq!(
            loaded.lookup_eq(&Value::Str("JP".into()))[&0].row_count(),
            u64::from(rows / 2)
        );
        assert!(elapsed.as_secs() < 30, "load took {:?}", elapsed);
    }

    #[test]
    fn failing_dimension_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let partitions = write_partitions(dir.path());
        // Country needs to read every file; type never does.
        fs::remove_file(dir.path().join(&partitions[0].path)).unwrap();

        let (built, failed) = build_all(dir.path(), &partitions, &EngineConfig::default());
        assert!(built.iter().any(|m| m.dimension == Dimension::Type));
        assert!(failed.iter().any(|f| f.dimension == Dimension::Country));
        assert!(!dir.path().join(Dimension::Country.relative_path()).exists());
        assert!(dir.path().join(Dimension::Type.relative_path()).exists());
    }
}
