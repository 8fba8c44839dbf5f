//! Query routing: rollup match first, then a partition-pruned scan, then a
//! full scan. Every route ends in the same grouping and finalisation code.

use crate::error::{EngineError, Result};
use crate::event::Column;
use crate::exec::{execute_scan, ResultSet, ScanTarget};
use crate::index::{intersect_postings, Dimension, IndexSet, PartitionId, Postings};
use crate::query::QueryRequest;
use crate::query_stats::QueryStats;
use crate::rollup::RollupTable;
use crate::store::Manifest;
use crate::time_section;
use crate::value::Value;
use log::debug;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which route a query may take. `Auto` picks the cheapest available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    #[default]
    Auto,
    Rollup,
    PrunedScan,
    FullScan,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Strategy::Auto),
            "rollup" => Ok(Strategy::Rollup),
            "pruned" | "pruned-scan" => Ok(Strategy::PrunedScan),
            "full" | "full-scan" => Ok(Strategy::FullScan),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// The route chosen for one query, for logging and summaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Rollup { name: String, rows: u64 },
    PrunedScan {
        partitions: Vec<PartitionId>,
        indexes: Vec<Dimension>,
    },
    FullScan { partitions: usize },
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::Rollup { name, rows } => write!(f, "rollup {} ({} rows)", name, rows),
            Plan::PrunedScan {
                partitions,
                indexes,
            } => {
                write!(f, "pruned scan of {} partitions", partitions.len())?;
                if !indexes.is_empty() {
                    let names: Vec<String> = indexes.iter().map(|d| d.to_string()).collect();
                    write!(f, " via {} index", names.join("+"))?;
                }
                Ok(())
            }
            Plan::FullScan { partitions } => write!(f, "full scan of {} partitions", partitions),
        }
    }
}

/// How often each route ran.
#[derive(Debug, Default)]
pub struct PlannerCounters {
    rollup: AtomicU64,
    pruned_scan: AtomicU64,
    full_scan: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub rollup: u64,
    pub pruned_scan: u64,
    pub full_scan: u64,
}

impl CounterSnapshot {
    pub fn total(&self) -> u64 {
        self.rollup + self.pruned_scan + self.full_scan
    }
}

impl PlannerCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            rollup: self.rollup.load(Ordering::Relaxed),
            pruned_scan: self.pruned_scan.load(Ordering::Relaxed),
            full_scan: self.full_scan.load(Ordering::Relaxed),
        }
    }
}

enum Route<'a> {
    Rollup(&'a RollupTable),
    Scan {
        targets: Vec<ScanTarget<'a>>,
        plan: Plan,
    },
}

pub struct Planner {
    root: PathBuf,
    manifest: Manifest,
    rollups: Vec<RollupTable>,
    indexes: IndexSet,
    batch_size: usize,
    counters: PlannerCounters,
}

impl Planner {
    pub fn new(
        root: &Path,
        manifest: Manifest,
        rollups: Vec<RollupTable>,
        indexes: IndexSet,
        batch_size: usize,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            manifest,
            rollups,
            indexes,
            batch_size,
            counters: PlannerCounters::default(),
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Choose a route without executing it.
    pub fn plan(&self, query: &QueryRequest, strategy: Strategy) -> Result<Plan> {
        Ok(match self.route(query, strategy)? {
            Route::Rollup(table) => rollup_plan(table),
            Route::Scan { plan, .. } => plan,
        })
    }

    pub fn execute(
        &self,
        query: &QueryRequest,
        strategy: Strategy,
        stats: &mut QueryStats,
    ) -> Result<(ResultSet, Plan)> {
        let route = time_section!(stats, planning, { self.route(query, strategy)? });
        let (result, plan) = time_section!(stats, execution, {
            match route {
                Route::Rollup(table) => {
                    self.counters.rollup.fetch_add(1, Ordering::Relaxed);
                    stats.rows_scanned = table.rows();
                    let groups = table.answer(query)?;
                    (groups.finalize(query)?, rollup_plan(table))
                }
                Route::Scan { targets, plan } => {
                    let counter = match plan {
                        Plan::FullScan { .. } => &self.counters.full_scan,
                        _ => &self.counters.pruned_scan,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    let (result, scan) =
                        execute_scan(&self.root, &targets, query, self.batch_size)
                            .map_err(|e| missing_field_is_query_error(query, e))?;
                    stats.rows_scanned = scan.rows_read;
                    (result, plan)
                }
            }
        });
        debug!("{} answered by {}", query.id, plan);
        stats.set_plan(&plan);
        stats.set_result_rows(result.row_count());
        Ok((result, plan))
    }

    fn route(&self, query: &QueryRequest, strategy: Strategy) -> Result<Route<'_>> {
        match strategy {
            Strategy::Auto => {
                if let Some(table) = self.best_rollup(query) {
                    return Ok(Route::Rollup(table));
                }
                Ok(self.pruned_route(query).unwrap_or_else(|| self.full_route()))
            }
            Strategy::Rollup => self.best_rollup(query).map(Route::Rollup).ok_or_else(|| {
                EngineError::query(format!("{}: no rollup can answer this query", query.id))
            }),
            Strategy::PrunedScan => self.pruned_route(query).ok_or_else(|| {
                EngineError::query(format!(
                    "{}: a pruned scan needs a predicate on type",
                    query.id
                ))
            }),
            Strategy::FullScan => Ok(self.full_route()),
        }
    }

    /// Coarsest sufficient rollup, then the smallest, then by name.
    fn best_rollup(&self, query: &QueryRequest) -> Option<&RollupTable> {
        self.rollups
            .iter()
            .filter(|t| t.definition().covers(query))
            .min_by(|a, b| {
                let key = |t: &RollupTable| (t.definition().keys.len(), t.rows());
                key(*a)
                    .cmp(&key(*b))
                    .then_with(|| a.definition().name.cmp(&b.definition().name))
            })
    }

    fn full_route(&self) -> Route<'_> {
        let targets: Vec<ScanTarget<'_>> = self
            .manifest
            .partitions
            .iter()
            .map(|partition| ScanTarget {
                partition,
                rows: None,
            })
            .collect();
        let plan = Plan::FullScan {
            partitions: targets.len(),
        };
        Route::Scan { targets, plan }
    }

    /// Partitions admitted by the type index (or by partition key when the
    /// type index is unavailable), cut down by day for day-partitioned types,
    /// then narrowed to row ranges by the day and country indexes.
    fn pruned_route(&self, query: &QueryRequest) -> Option<Route<'_>> {
        let types = query.event_types()?;
        let day_filters: Vec<_> = query.filters_on(Column::Day).collect();

        let mut used = Vec::new();
        let mut types_indexed = false;
        let mut postings: Option<Postings> = None;
        for dimension in Dimension::ALL {
            let Some(index) = self.indexes.get(dimension) else {
                continue;
            };
            let mut all_indexed = true;
            for predicate in query.filters_on(dimension.column()) {
                match index.lookup_predicate(predicate) {
                    Some(found) => {
                        postings = Some(match postings {
                            Some(current) => intersect_postings(&current, &found),
                            None => found,
                        });
                        if !used.contains(&dimension) {
                            used.push(dimension);
                        }
                    }
                    None => all_indexed = false,
                }
            }
            if dimension == Dimension::Type {
                types_indexed = all_indexed;
            }
        }

        let mut targets = Vec::new();
        for partition in &self.manifest.partitions {
            if !types_indexed && !types.contains(&partition.key.event_type) {
                continue;
            }
            if let Some(day) = partition.key.day {
                let value = Value::Date(day);
                if !day_filters.iter().all(|p| p.matches(&value)) {
                    continue;
                }
            }
            let rows = match &postings {
                Some(postings) => match postings.get(&partition.id) {
                    Some(ranges) => Some(ranges.clone()),
                    None => continue,
                },
                None => None,
            };
            targets.push(ScanTarget { partition, rows });
        }

        let plan = Plan::PrunedScan {
            partitions: targets.iter().map(|t| t.partition.id).collect(),
            indexes: used,
        };
        Some(Route::Scan { targets, plan })
    }
}

fn rollup_plan(table: &RollupTable) -> Plan {
    Plan::Rollup {
        name: table.definition().name.clone(),
        rows: table.rows(),
    }
}

fn missing_field_is_query_error(query: &QueryRequest, e: EngineError) -> EngineError {
    match e {
        EngineError::FieldNotFound(field) => EngineError::query(format!(
            "{}: field '{}' is absent from the partitions",
            query.id, field
        )),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategies_parse_from_cli_names() {
        assert_eq!("auto".parse::<Strategy>(), Ok(Strategy::Auto));
        assert_eq!("pruned-scan".parse::<Strategy>(), Ok(Strategy::PrunedScan));
        assert_eq!("full".parse::<Strategy>(), Ok(Strategy::FullScan));
        assert!("fastest".parse::<Strategy>().is_err());
    }

    #[test]
    fn plans_render_for_logs() {
        let pruned = Plan::PrunedScan {
            partitions: vec![1 as PartitionId, 4],
            indexes: vec![Dimension::Day, Dimension::Country],
        };
        assert_eq!(
            pruned.to_string(),
            "pruned scan of 2 partitions via day+country index"
        );
        let rollup = Plan::Rollup {
            name: "daily_revenue".into(),
            rows: 30,
        };
        assert_eq!(rollup.to_string(), "rollup daily_revenue (30 rows)");
    }
}
