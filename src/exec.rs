//! Query execution shared by every plan: partition scans, grouping,
//! finalisation into result sets.

use crate::error::{EngineError, Result};
use crate::event::{Column, ColumnKind};
use crate::index::RowRanges;
use crate::query::{AggFunc, AggregateExpr, Predicate, QueryRequest, SelectItem};
use crate::store::{PartitionMeta, PartitionReader};
use crate::value::{infer_kind, values_to_array, ColumnView, Value};
use arrow::csv::WriterBuilder;
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use log::debug;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Neumaier compensated summation. Deterministic for a fixed input order.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StableSum {
    sum: f64,
    compensation: f64,
}

impl StableSum {
    pub fn add(&mut self, x: f64) {
        let t = self.sum + x;
        if self.sum.abs() >= x.abs() {
            self.compensation += (self.sum - t) + x;
        } else {
            self.compensation += (x - t) + self.sum;
        }
        self.sum = t;
    }

    pub fn merge(&mut self, other: &StableSum) {
        self.add(other.sum);
        self.compensation += other.compensation;
    }

    pub fn value(&self) -> f64 {
        self.sum + self.compensation
    }

    pub fn from_value(value: f64) -> Self {
        Self {
            sum: value,
            compensation: 0.0,
        }
    }
}

/// Partial aggregate of one column within one group.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeasureState {
    pub sum: StableSum,
    /// Non-null values seen.
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl MeasureState {
    pub fn add(&mut self, x: f64) {
        self.sum.add(x);
        self.count += 1;
        self.min = Some(self.min.map_or(x, |m| m.min(x)));
        self.max = Some(self.max.map_or(x, |m| m.max(x)));
    }

    /// Count a non-null value that has no numeric reading.
    pub fn add_non_numeric(&mut self) {
        self.count += 1;
    }

    pub fn merge(&mut self, other: &MeasureState) {
        self.sum.merge(&other.sum);
        self.count += other.count;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// What a grouped computation keeps per group: the key columns and the
/// columns aggregated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub keys: Vec<Column>,
    pub measures: Vec<Column>,
}

impl GroupSpec {
    pub fn for_query(query: &QueryRequest) -> Self {
        let mut measures: Vec<Column> = Vec::new();
        for agg in query.aggregates() {
            if let Some(column) = agg.column {
                if !measures.contains(&column) {
                    measures.push(column);
                }
            }
        }
        Self {
            keys: query.group_by.clone(),
            measures,
        }
    }

    fn measure_position(&self, column: Column) -> Option<usize> {
        self.measures.iter().position(|c| *c == column)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupState {
    pub rows: u64,
    pub measures: Vec<MeasureState>,
}

impl GroupState {
    fn new(measures: usize) -> Self {
        Self {
            rows: 0,
            measures: vec![MeasureState::default(); measures],
        }
    }
}

/// Groups keyed by their key values, iterated in key order.
#[derive(Debug, Clone)]
pub struct GroupTable {
    pub spec: GroupSpec,
    pub groups: BTreeMap<Vec<Value>, GroupState>,
}

impl GroupTable {
    pub fn new(spec: GroupSpec) -> Self {
        Self {
            spec,
            groups: BTreeMap::new(),
        }
    }

    pub fn add_row(&mut self, view: &BatchView<'_>, row: usize) {
        let key: Vec<Value> = self.spec.keys.iter().map(|c| view.value(*c, row)).collect();
        let width = self.spec.measures.len();
        let state = self
            .groups
            .entry(key)
            .or_insert_with(|| GroupState::new(width));
        state.rows += 1;
        for (i, column) in self.spec.measures.iter().enumerate() {
            match view.f64(*column, row) {
                Some(x) => state.measures[i].add(x),
                None if !view.value(*column, row).is_null() => {
                    state.measures[i].add_non_numeric()
                }
                None => {}
            }
        }
    }

    /// Fold an already-aggregated group into this table.
    pub fn merge_group(&mut self, key: Vec<Value>, partial: &GroupState) {
        let width = self.spec.measures.len();
        let state = self
            .groups
            .entry(key)
            .or_insert_with(|| GroupState::new(width));
        state.rows += partial.rows;
        for (mine, theirs) in state.measures.iter_mut().zip(&partial.measures) {
            mine.merge(theirs);
        }
    }

    /// Produce the query's rows: one per group in key order, or a single
    /// row for an ungrouped aggregate over no input. Then sort and limit.
    pub fn finalize(&self, query: &QueryRequest) -> Result<ResultSet> {
        let mut rows = Vec::with_capacity(self.groups.len().max(1));
        let empty_global = self.groups.is_empty() && self.spec.keys.is_empty();
        let empty_state = GroupState::new(self.spec.measures.len());
        let groups: Vec<(&[Value], &GroupState)> = if empty_global {
            vec![(&[][..], &empty_state)]
        } else {
            self.groups
                .iter()
                .map(|(k, s)| (k.as_slice(), s))
                .collect()
        };

        for (key, state) in groups {
            let mut row = Vec::with_capacity(query.select.len());
            for item in &query.select {
                let value = match item {
                    SelectItem::Column(column) => {
                        let pos = self
                            .spec
                            .keys
                            .iter()
                            .position(|c| c == column)
                            .ok_or_else(|| {
                                EngineError::query(format!("'{}' is not a group key", column))
                            })?;
                        key[pos].clone()
                    }
                    SelectItem::Aggregate(agg) => self.aggregate_value(agg, state)?,
                };
                row.push(value);
            }
            rows.push(row);
        }

        let mut result = ResultSet::new(query.output_columns(), rows);
        result.apply_order_and_limit(query);
        Ok(result)
    }

    fn aggregate_value(&self, agg: &AggregateExpr, state: &GroupState) -> Result<Value> {
        let Some(column) = agg.column else {
            return Ok(Value::Int(state.rows as i64));
        };
        let pos = self.spec.measure_position(column).ok_or_else(|| {
            EngineError::query(format!("'{}' is not measured", agg.output_name()))
        })?;
        let m = &state.measures[pos];
        let integral = column.kind() == ColumnKind::Int;
        let numeric = |x: f64| {
            if integral {
                Value::Int(x.round() as i64)
            } else {
                Value::Float(x)
            }
        };
        Ok(match agg.func {
            AggFunc::Count => Value::Int(m.count as i64),
            _ if m.count == 0 => Value::Null,
            AggFunc::Sum => numeric(m.sum.value()),
            AggFunc::Avg => Value::Float(m.sum.value() / m.count as f64),
            AggFunc::Min => m.min.map_or(Value::Null, numeric),
            AggFunc::Max => m.max.map_or(Value::Null, numeric),
        })
    }
}

/// Ordered result columns and rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Stable sort by the query's order keys, then truncate to its limit.
    fn apply_order_and_limit(&mut self, query: &QueryRequest) {
        let keys: Vec<(usize, bool)> = query
            .order_by
            .iter()
            .filter_map(|o| self.column_index(&o.key).map(|i| (i, o.descending)))
            .collect();
        if !keys.is_empty() {
            self.rows.sort_by(|a, b| {
                keys.iter()
                    .map(|&(i, desc)| {
                        let ord = a[i].cmp(&b[i]);
                        if desc {
                            ord.reverse()
                        } else {
                            ord
                        }
                    })
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }
        if let Some(limit) = query.limit {
            self.rows.truncate(limit);
        }
    }

    /// Row-for-row comparison with a relative tolerance on numbers.
    pub fn approx_eq(&self, other: &ResultSet, tolerance: f64) -> bool {
        self.columns == other.columns
            && self.rows.len() == other.rows.len()
            && self.rows.iter().zip(&other.rows).all(|(a, b)| {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| match (x.as_f64(), y.as_f64()) {
                        (Some(x), Some(y)) => {
                            (x - y).abs() <= tolerance * x.abs().max(y.abs()).max(1.0)
                        }
                        _ => x == y,
                    })
            })
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = Vec::with_capacity(self.columns.len());
        let mut arrays = Vec::with_capacity(self.columns.len());
        for (i, name) in self.columns.iter().enumerate() {
            let kind = infer_kind(self.rows.iter().map(|r| &r[i]));
            let array = values_to_array(kind, self.rows.iter().map(|r| &r[i]));
            fields.push(Field::new(name, array.data_type().clone(), true));
            arrays.push(array);
        }
        let schema = Arc::new(Schema::new(fields));
        if arrays.is_empty() {
            return Ok(RecordBatch::new_empty(schema));
        }
        RecordBatch::try_new(schema, arrays).map_err(EngineError::Arrow)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let batch = self.to_record_batch()?;
        let file = File::create(path).map_err(|e| EngineError::storage_write(path, e))?;
        let mut writer = WriterBuilder::new().with_header(true).build(file);
        writer.write(&batch)?;
        Ok(())
    }
}

/// Typed views of the projected columns of one record batch.
pub struct BatchView<'a> {
    columns: Vec<Column>,
    views: Vec<ColumnView<'a>>,
}

impl<'a> BatchView<'a> {
    pub fn new(batch: &'a RecordBatch, columns: &[Column]) -> Result<Self> {
        let views = columns
            .iter()
            .map(|c| {
                let array = batch
                    .column_by_name(c.name())
                    .ok_or_else(|| EngineError::FieldNotFound(c.name().to_string()))?;
                ColumnView::try_new(array)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            columns: columns.to_vec(),
            views,
        })
    }

    fn view(&self, column: Column) -> Option<&ColumnView<'a>> {
        self.columns
            .iter()
            .position(|c| *c == column)
            .map(|i| &self.views[i])
    }

    pub fn value(&self, column: Column, row: usize) -> Value {
        self.view(column).map_or(Value::Null, |v| v.value(row))
    }

    pub fn f64(&self, column: Column, row: usize) -> Option<f64> {
        self.view(column).and_then(|v| v.f64(row))
    }

    pub fn matches(&self, filters: &[Predicate], row: usize) -> bool {
        filters.iter().all(|p| p.matches(&self.value(p.column, row)))
    }
}

/// One partition to read, optionally restricted to some rows.
#[derive(Debug, Clone)]
pub struct ScanTarget<'a> {
    pub partition: &'a PartitionMeta,
    pub rows: Option<RowRanges>,
}

/// Counters of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub partitions: usize,
    pub rows_read: u64,
    pub rows_matched: u64,
}

/// Read `columns` from every target and call `visit` for each row passing
/// all `filters`. Targets are read in the given order.
pub fn scan_partitions<F>(
    root: &Path,
    targets: &[ScanTarget<'_>],
    columns: &[Column],
    filters: &[Predicate],
    batch_size: usize,
    mut visit: F,
) -> Result<ScanStats>
where
    F: FnMut(&BatchView<'_>, usize),
{
    let mut columns = columns.to_vec();
    if columns.is_empty() {
        // Row counting still needs one column to drive the reader.
        columns.push(Column::Type);
    }
    let names: Vec<&str> = columns.iter().map(Column::name).collect();

    let mut stats = ScanStats::default();
    for target in targets {
        if target.rows.as_ref().is_some_and(RowRanges::is_empty) {
            continue;
        }
        let reader = PartitionReader::open(&root.join(&target.partition.path))?;
        let selection = target
            .rows
            .as_ref()
            .map(|r| r.to_selection(reader.num_rows()));
        stats.partitions += 1;
        for batch in reader.reader(&names, selection, batch_size)? {
            let batch = batch?;
            let view = BatchView::new(&batch, &columns)?;
            stats.rows_read += batch.num_rows() as u64;
            for row in 0..batch.num_rows() {
                if view.matches(filters, row) {
                    stats.rows_matched += 1;
                    visit(&view, row);
                }
            }
        }
    }
    debug!(
        "Scanned {} partitions, {} rows read, {} matched",
        stats.partitions, stats.rows_read, stats.rows_matched
    );
    Ok(stats)
}

/// Run a query over the targets and produce its result.
pub fn execute_scan(
    root: &Path,
    targets: &[ScanTarget<'_>],
    query: &QueryRequest,
    batch_size: usize,
) -> Result<(ResultSet, ScanStats)> {
    let columns: Vec<Column> = query.referenced_columns().into_iter().collect();
    if query.is_grouped() {
        let mut table = GroupTable::new(GroupSpec::for_query(query));
        let filters = &query.filters;
        let stats = scan_partitions(root, targets, &columns, filters, batch_size, |view, row| {
            table.add_row(view, row)
        })?;
        Ok((table.finalize(query)?, stats))
    } else {
        let selected: Vec<Column> = query
            .select
            .iter()
            .filter_map(|item| match item {
                SelectItem::Column(c) => Some(*c),
                SelectItem::Aggregate(_) => None,
            })
            .collect();
        let mut rows: Vec<Vec<Value>> = Vec::new();
        let filters = &query.filters;
        let stats = scan_partitions(root, targets, &columns, filters, batch_size, |view, row| {
            rows.push(selected.iter().map(|c| view.value(*c, row)).collect())
        })?;
        let mut result = ResultSet::new(query.output_columns(), rows);
        result.apply_order_and_limit(query);
        Ok((result, stats))
    }
}
