//! Precomputed rollup tables.
//!
//! Each rollup groups one event type (or all of them) by a fixed key and
//! stores, per group, the row count and a [`MeasureState`] per measured
//! column. That is enough to re-derive SUM, COUNT, AVG, MIN and MAX after
//! filtering on key columns and coarsening to a subset of the key.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::event::{Column, EventType};
use crate::exec::{
    scan_partitions, GroupSpec, GroupState, GroupTable, MeasureState, ScanTarget, StableSum,
};
use crate::query::{QueryRequest, SelectItem};
use crate::store::{PartitionMeta, PartitionReader};
use crate::value::{values_to_array, ColumnView, Value};
use arrow::array::{ArrayRef, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use log::info;
use parquet::arrow::ArrowWriter;
use parquet::format::KeyValue;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub const ROLLUPS_DIR: &str = "rollups";
const DEFINITION_TAG: &str = "rollup.definition";
const ROW_COUNT: &str = "row_count";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupDefinition {
    pub name: String,
    /// Source event type; `None` aggregates every type.
    pub source: Option<EventType>,
    pub keys: Vec<Column>,
    pub measures: Vec<Column>,
}

impl RollupDefinition {
    fn new(name: &str, source: Option<EventType>, keys: &[Column], measures: &[Column]) -> Self {
        Self {
            name: name.to_string(),
            source,
            keys: keys.to_vec(),
            measures: measures.to_vec(),
        }
    }

    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(ROLLUPS_DIR).join(format!("{}.parquet", self.name))
    }

    /// Whether this rollup holds everything the query needs.
    pub fn covers(&self, query: &QueryRequest) -> bool {
        if !query.is_grouped() {
            return false;
        }
        match (self.source, query.event_types()) {
            (Some(source), Some(types)) => {
                if types.len() != 1 || !types.contains(&source) {
                    return false;
                }
            }
            (Some(_), None) => return false,
            (None, Some(_)) if !self.keys.contains(&Column::Type) => return false,
            (None, _) => {}
        }
        // Type predicates are implied by a single-type source.
        let filters_ok = query.filters.iter().all(|p| {
            self.keys.contains(&p.column) || (p.column == Column::Type && self.source.is_some())
        });
        let groups_ok = query.group_by.iter().all(|c| self.keys.contains(c));
        let measures_ok = query.select.iter().all(|item| match item {
            SelectItem::Column(_) => true,
            SelectItem::Aggregate(agg) => agg.column.map_or(true, |c| self.measures.contains(&c)),
        });
        filters_ok && groups_ok && measures_ok
    }
}

/// The fixed rollup catalogue.
pub fn catalogue() -> Vec<RollupDefinition> {
    use Column::*;
    let impression = Some(EventType::Impression);
    vec![
        RollupDefinition::new("daily_revenue", impression, &[Day], &[BidPrice]),
        RollupDefinition::new(
            "publisher_country_day",
            impression,
            &[PublisherId, Country, Day],
            &[BidPrice],
        ),
        RollupDefinition::new(
            "country_purchases",
            Some(EventType::Purchase),
            &[Country],
            &[TotalPrice],
        ),
        RollupDefinition::new("advertiser_type_counts", None, &[AdvertiserId, Type], &[]),
        RollupDefinition::new("impression_day_minute", impression, &[Day, Minute], &[BidPrice]),
        RollupDefinition::new(
            "advertiser_country",
            impression,
            &[AdvertiserId, Country],
            &[BidPrice],
        ),
        RollupDefinition::new("advertiser_week", impression, &[AdvertiserId, Week], &[BidPrice]),
        RollupDefinition::new("hourly_impressions", impression, &[Hour], &[BidPrice]),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupMeta {
    pub definition: RollupDefinition,
    pub path: PathBuf,
    pub rows: u64,
}

fn measure_field(column: Column, stat: &str) -> String {
    format!("{}_{}", column.name(), stat)
}

fn rollup_schema_fields(definition: &RollupDefinition, key_arrays: &[ArrayRef]) -> Vec<Field> {
    let mut fields: Vec<Field> = definition
        .keys
        .iter()
        .zip(key_arrays)
        .map(|(c, a)| Field::new(c.name(), a.data_type().clone(), true))
        .collect();
    fields.push(Field::new(ROW_COUNT, DataType::Int64, false));
    for column in &definition.measures {
        fields.push(Field::new(measure_field(*column, "sum"), DataType::Float64, false));
        fields.push(Field::new(measure_field(*column, "count"), DataType::Int64, false));
        fields.push(Field::new(measure_field(*column, "min"), DataType::Float64, true));
        fields.push(Field::new(measure_field(*column, "max"), DataType::Float64, true));
    }
    fields
}

fn table_to_batch(definition: &RollupDefinition, table: &GroupTable) -> Result<RecordBatch> {
    let mut arrays: Vec<ArrayRef> = definition
        .keys
        .iter()
        .enumerate()
        .map(|(i, column)| values_to_array(column.kind(), table.groups.keys().map(|k| &k[i])))
        .collect();
    let fields = rollup_schema_fields(definition, &arrays);

    let states: Vec<&GroupState> = table.groups.values().collect();
    arrays.push(Arc::new(
        states.iter().map(|s| s.rows as i64).collect::<Int64Array>(),
    ));
    for i in 0..definition.measures.len() {
        let measure = |s: &&GroupState| s.measures[i];
        arrays.push(Arc::new(
            states
                .iter()
                .map(|s| measure(s).sum.value())
                .collect::<Float64Array>(),
        ));
        arrays.push(Arc::new(
            states
                .iter()
                .map(|s| measure(s).count as i64)
                .collect::<Int64Array>(),
        ));
        arrays.push(Arc::new(
            states.iter().map(|s| measure(s).min).collect::<Float64Array>(),
        ));
        arrays.push(Arc::new(
            states.iter().map(|s| measure(s).max).collect::<Float64Array>(),
        ));
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).map_err(EngineError::Arrow)
}

/// Scan the source partitions once and write the rollup file.
pub fn build_rollup(
    definition: &RollupDefinition,
    root: &Path,
    partitions: &[PartitionMeta],
    config: &EngineConfig,
) -> Result<RollupMeta> {
    let start = Instant::now();
    let targets: Vec<ScanTarget<'_>> = partitions
        .iter()
        .filter(|p| definition.source.map_or(true, |t| p.key.event_type == t))
        .map(|partition| ScanTarget {
            partition,
            rows: None,
        })
        .collect();

    let spec = GroupSpec {
        keys: definition.keys.clone(),
        measures: definition.measures.clone(),
    };
    let mut columns = spec.keys.clone();
    columns.extend(spec.measures.iter().copied());
    let mut table = GroupTable::new(spec);
    let stats = scan_partitions(root, &targets, &columns, &[], config.batch_size, |view, row| {
        table.add_row(view, row)
    })?;

    let batch = table_to_batch(definition, &table)?;
    let relative = definition.relative_path();
    let path = root.join(&relative);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| EngineError::storage_write(dir, e))?;
    }
    let file = File::create(&path).map_err(|e| EngineError::storage_write(&path, e))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(config.writer_properties()))
        .map_err(|e| EngineError::storage_write(&path, e))?;
    writer.append_key_value_metadata(KeyValue::new(
        DEFINITION_TAG.to_string(),
        serde_json::to_string(definition)?,
    ));
    writer
        .write(&batch)
        .map_err(|e| EngineError::storage_write(&path, e))?;
    writer
        .close()
        .map_err(|e| EngineError::storage_write(&path, e))?;

    info!(
        "Built rollup {}: {} groups from {} rows in {:?}",
        definition.name,
        batch.num_rows(),
        stats.rows_read,
        start.elapsed()
    );
    Ok(RollupMeta {
        definition: definition.clone(),
        path: relative,
        rows: batch.num_rows() as u64,
    })
}

/// Build the whole catalogue in parallel. Any failure fails the batch.
pub fn build_all(
    root: &Path,
    partitions: &[PartitionMeta],
    config: &EngineConfig,
) -> Result<Vec<RollupMeta>> {
    catalogue()
        .par_iter()
        .map(|definition| build_rollup(definition, root, partitions, config))
        .collect()
}

/// A rollup loaded for query answering.
pub struct RollupTable {
    pub meta: RollupMeta,
    table: GroupTable,
}

impl RollupTable {
    pub fn load(root: &Path, meta: &RollupMeta) -> Result<Self> {
        let path = root.join(&meta.path);
        let reader = PartitionReader::open(&path)?;
        let expected = serde_json::to_string(&meta.definition)?;
        if reader.key_value(DEFINITION_TAG).as_deref() != Some(expected.as_str()) {
            return Err(EngineError::NotPrepared(format!(
                "rollup {} does not match its definition",
                path.display()
            )));
        }

        let definition = &meta.definition;
        let mut names: Vec<String> = definition.keys.iter().map(|c| c.name().to_string()).collect();
        names.push(ROW_COUNT.to_string());
        for column in &definition.measures {
            for stat in ["sum", "count", "min", "max"] {
                names.push(measure_field(*column, stat));
            }
        }
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();

        let mut table = GroupTable::new(GroupSpec {
            keys: definition.keys.clone(),
            measures: definition.measures.clone(),
        });
        for batch in reader.reader(&name_refs, None, 8192)? {
            let batch = batch?;
            let views = names
                .iter()
                .map(|name| {
                    let array = batch
                        .column_by_name(name)
                        .ok_or_else(|| EngineError::FieldNotFound(name.clone()))?;
                    ColumnView::try_new(array)
                })
                .collect::<Result<Vec<_>>>()?;
            let (key_views, rest) = views.split_at(definition.keys.len());
            for row in 0..batch.num_rows() {
                let key: Vec<Value> = key_views.iter().map(|v| v.value(row)).collect();
                let rows = rest[0].f64(row).unwrap_or(0.0) as u64;
                let measures = rest[1..]
                    .chunks(4)
                    .map(|m| MeasureState {
                        sum: StableSum::from_value(m[0].f64(row).unwrap_or(0.0)),
                        count: m[1].f64(row).unwrap_or(0.0) as u64,
                        min: m[2].f64(row),
                        max: m[3].f64(row),
                    })
                    .collect();
                table.merge_group(key, &GroupState { rows, measures });
            }
        }
        Ok(Self {
            meta: meta.clone(),
            table,
        })
    }

    pub fn definition(&self) -> &RollupDefinition {
        &self.meta.definition
    }

    pub fn rows(&self) -> u64 {
        self.meta.rows
    }

    /// Filter on key columns and coarsen to the query's grouping. Callers
    /// check [`RollupDefinition::covers`] first.
    pub fn answer(&self, query: &QueryRequest) -> Result<GroupTable> {
        let definition = self.definition();
        let key_pos = |column: Column| {
            definition
                .keys
                .iter()
                .position(|c| *c == column)
                .ok_or_else(|| {
                    EngineError::query(format!(
                        "rollup {} has no key '{}'",
                        definition.name, column
                    ))
                })
        };
        let filters = query
            .filters
            .iter()
            .filter(|p| definition.keys.contains(&p.column))
            .map(|p| Ok((key_pos(p.column)?, p)))
            .collect::<Result<Vec<_>>>()?;
        let group_pos = query
            .group_by
            .iter()
            .map(|c| key_pos(*c))
            .collect::<Result<Vec<_>>>()?;
        let spec = GroupSpec::for_query(query);
        let measure_pos = spec
            .measures
            .iter()
            .map(|c| {
                definition.measures.iter().position(|m| m == c).ok_or_else(|| {
                    EngineError::query(format!(
                        "rollup {} does not measure '{}'",
                        definition.name, c
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut out = GroupTable::new(spec);
        for (key, state) in &self.table.groups {
            if !filters.iter().all(|(pos, p)| p.matches(&key[*pos])) {
                continue;
            }
            let coarse: Vec<Value> = group_pos.iter().map(|&i| key[i].clone()).collect();
            let partial = GroupState {
                rows: state.rows,
                measures: measure_pos.iter().map(|&i| state.measures[i]).collect(),
            };
            out.merge_group(coarse, &partial);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryRequest;

    fn find(name: &str) -> RollupDefinition {
        catalogue().into_iter().find(|d| d.name == name).unwrap()
    }

    #[test]
    fn catalogue_names_are_unique() {
        let mut names: Vec<String> = catalogue().into_iter().map(|d| d.name).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
        assert_eq!(total, 8);
    }

    #[test]
    fn coverage_follows_keys_filters_and_measures() {
        let daily = QueryRequest::parse(
            r#"{"select": ["day", {"SUM": "bid_price"}],
                "where": [{"col": "type", "op": "eq", "val": "impression"}],
                "group_by": ["day"]}"#,
        )
        .unwrap();
        assert!(find("daily_revenue").covers(&daily));
        assert!(find("publisher_country_day").covers(&daily));
        assert!(!find("country_purchases").covers(&daily));

        let untyped = QueryRequest::parse(
            r#"{"select": ["day", {"SUM": "bid_price"}], "group_by": ["day"]}"#,
        )
        .unwrap();
        assert!(!find("daily_revenue").covers(&untyped));

        let counts = QueryRequest::parse(
            r#"{"select": ["advertiser_id", "type", {"COUNT": "*"}],
                "group_by": ["advertiser_id", "type"]}"#,
        )
        .unwrap();
        assert!(find("advertiser_type_counts").covers(&counts));

        let clicks = QueryRequest::parse(
            r#"{"select": ["advertiser_id", {"COUNT": "*"}],
                "where": [{"col": "type", "op": "eq", "val": "click"}],
                "group_by": ["advertiser_id"]}"#,
        )
        .unwrap();
        assert!(find("advertiser_type_counts").covers(&clicks));

        let user_filter = QueryRequest::parse(
            r#"{"select": ["day", {"SUM": "bid_price"}],
                "where": [{"col": "type", "op": "eq", "val": "impression"},
                          {"col": "user_id", "op": "eq", "val": 7}],
                "group_by": ["day"]}"#,
        )
        .unwrap();
        assert!(catalogue().iter().all(|d| !d.covers(&user_filter)));

        let projection = QueryRequest::parse(r#"{"select": ["day"]}"#).unwrap();
        assert!(catalogue().iter().all(|d| !d.covers(&projection)));
    }
}
