//! Prepare and run entry points.
//!
//! `prepare` builds a complete store in a staging directory and swaps it into
//! place; `Engine` opens a published store and answers queries through the
//! result cache and the planner.

use crate::cache::{CacheLookup, ResultCache};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::exec::ResultSet;
use crate::index::{self, Dimension, IndexFailure, IndexSet};
use crate::ingest::{self, IngestReport};
use crate::planner::{CounterSnapshot, Plan, Planner, Strategy};
use crate::query::{QueryRequest, QuerySignature};
use crate::query_stats::QueryStats;
use crate::rollup::{self, RollupTable};
use crate::store::{Manifest, PartitionWriterSet, StagingDir, FORMAT_VERSION};
use log::{info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What one prepare run produced.
#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub ingest: IngestReport,
    pub partitions: usize,
    pub indexes: Vec<Dimension>,
    pub degraded_indexes: Vec<IndexFailure>,
    pub rollups: Vec<String>,
    pub elapsed: Duration,
}

/// Ingest every CSV file of `data_dir` and publish a fresh store at
/// `storage_dir`. Any previous store stays readable until the swap.
pub fn prepare(config: &EngineConfig, data_dir: &Path, storage_dir: &Path) -> Result<PrepareReport> {
    let start = Instant::now();
    config.validate()?;
    let files = ingest::discover_files(data_dir)?;
    info!(
        "Preparing {} from {} input files in {}",
        storage_dir.display(),
        files.len(),
        data_dir.display()
    );

    let staging = StagingDir::create(storage_dir)?;
    let root = staging.path().to_path_buf();

    let mut writers = PartitionWriterSet::new(&root, config);
    let ingest = ingest::ingest_files(&files, config, |event| writers.push(event))?;
    let partitions = writers.finish()?;
    info!(
        "Wrote {} partitions holding {} events",
        partitions.len(),
        ingest.ingested
    );

    let pool = ThreadPoolBuilder::new()
        .num_threads(config.worker_threads())
        .thread_name(|i| format!("prepare-{}", i))
        .build()?;
    let ((indexes, degraded_indexes), rollups) = pool.install(|| {
        rayon::join(
            || index::build_all(&root, &partitions, config),
            || rollup::build_all(&root, &partitions, config),
        )
    });
    let rollups = rollups?;

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        timezone: config.timezone.clone(),
        day_partitioned_types: config.day_partitioned_types.clone(),
        partitions,
        ingest,
        indexes,
        degraded_indexes,
        rollups,
    };
    manifest.write(&root)?;
    staging.publish()?;

    let report = PrepareReport {
        partitions: manifest.partitions.len(),
        indexes: manifest.indexes.iter().map(|m| m.dimension).collect(),
        degraded_indexes: manifest.degraded_indexes,
        rollups: manifest
            .rollups
            .iter()
            .map(|r| r.definition.name.clone())
            .collect(),
        ingest: manifest.ingest,
        elapsed: start.elapsed(),
    };
    info!(
        "Prepare finished in {:?}: {} partitions, {} indexes ({} degraded), {} rollups",
        report.elapsed,
        report.partitions,
        report.indexes.len(),
        report.degraded_indexes.len(),
        report.rollups.len()
    );
    Ok(report)
}

/// The answer to one query.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub result: Arc<ResultSet>,
    /// `None` when the result came from the cache.
    pub plan: Option<Plan>,
    pub stats: QueryStats,
}

impl QueryOutcome {
    pub fn cached(&self) -> bool {
        self.plan.is_none()
    }
}

/// One entry of a query batch. A failed query carries its error and does
/// not affect the rest of the batch.
#[derive(Debug)]
pub struct QueryRun {
    pub id: String,
    pub signature: QuerySignature,
    pub outcome: Result<QueryOutcome>,
    pub elapsed: Duration,
}

/// A published store opened for querying.
pub struct Engine {
    root: PathBuf,
    planner: Planner,
    cache: ResultCache,
}

impl Engine {
    pub fn open(storage_dir: &Path, config: &EngineConfig) -> Result<Self> {
        let start = Instant::now();
        let manifest = Manifest::load(storage_dir)?;
        if manifest.timezone != config.timezone {
            warn!(
                "Store was prepared for timezone {}, not {}; buckets follow the store",
                manifest.timezone, config.timezone
            );
        }
        for failure in &manifest.degraded_indexes {
            warn!(
                "Index on {} was not built: {}",
                failure.dimension, failure.reason
            );
        }

        let rollups = manifest
            .rollups
            .iter()
            .map(|meta| RollupTable::load(storage_dir, meta))
            .collect::<Result<Vec<_>>>()?;
        let (indexes, failed) = IndexSet::load(storage_dir, &manifest.indexes);
        for failure in &failed {
            warn!(
                "Running without the {} index: {}",
                failure.dimension, failure.reason
            );
        }

        info!(
            "Opened {} in {:?}: {} partitions, indexes {:?}, {} rollups",
            storage_dir.display(),
            start.elapsed(),
            manifest.partitions.len(),
            indexes.dimensions(),
            rollups.len()
        );
        let planner = Planner::new(storage_dir, manifest, rollups, indexes, config.batch_size);
        Ok(Self {
            root: storage_dir.to_path_buf(),
            planner,
            cache: ResultCache::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &Manifest {
        self.planner.manifest()
    }

    pub fn planner_counters(&self) -> CounterSnapshot {
        self.planner.counters()
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Answer through the cache, planning on a miss.
    pub fn query(&self, query: &QueryRequest) -> Result<QueryOutcome> {
        let start = Instant::now();
        let signature = query.signature();
        let mut stats = QueryStats::new(&query.id);

        let (result, plan) = match self.cache.lookup(&signature) {
            CacheLookup::Hit(result) => {
                stats.cached = true;
                stats.set_plan("cache");
                stats.set_result_rows(result.row_count());
                (result, None)
            }
            CacheLookup::Miss => {
                let (result, plan) = self.planner.execute(query, Strategy::Auto, &mut stats)?;
                (self.cache.insert(signature, result), Some(plan))
            }
        };
        Ok(finish(result, plan, stats, start))
    }

    /// Answer with a fixed strategy, bypassing the cache.
    pub fn query_with(&self, query: &QueryRequest, strategy: Strategy) -> Result<QueryOutcome> {
        let start = Instant::now();
        let mut stats = QueryStats::new(&query.id);
        let (result, plan) = self.planner.execute(query, strategy, &mut stats)?;
        Ok(finish(Arc::new(result), Some(plan), stats, start))
    }

    pub fn explain(&self, query: &QueryRequest, strategy: Strategy) -> Result<Plan> {
        self.planner.plan(query, strategy)
    }

    /// Run a batch in parallel. Results keep the input order.
    pub fn run_batch(&self, queries: &[QueryRequest]) -> Vec<QueryRun> {
        queries
            .par_iter()
            .map(|query| {
                let start = Instant::now();
                let outcome = self.query(query);
                if let Err(e) = &outcome {
                    warn!("Query {} failed: {}", query.id, e);
                }
                QueryRun {
                    id: query.id.clone(),
                    signature: query.signature(),
                    outcome,
                    elapsed: start.elapsed(),
                }
            })
            .collect()
    }
}

fn finish(
    result: Arc<ResultSet>,
    plan: Option<Plan>,
    mut stats: QueryStats,
    start: Instant,
) -> QueryOutcome {
    stats.timing.total = start.elapsed();
    stats.update_memory();
    stats.print_summary();
    QueryOutcome {
        result,
        plan,
        stats,
    }
}

#[derive(Debug, Serialize)]
struct SummaryEntry<'a> {
    id: &'a str,
    file: Option<String>,
    rows: Option<usize>,
    plan: Option<String>,
    cached: bool,
    millis: f64,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    queries: Vec<SummaryEntry<'a>>,
    total_millis: f64,
    cache_hits: u64,
    cache_misses: u64,
    planner: CounterSnapshot,
}

/// Write `q<N>.csv` for every successful query (N by batch position) and
/// a `summary.json` covering the whole batch.
pub fn write_results(out_dir: &Path, runs: &[QueryRun], engine: &Engine) -> Result<PathBuf> {
    fs::create_dir_all(out_dir).map_err(|e| EngineError::storage_write(out_dir, e))?;

    let mut entries = Vec::with_capacity(runs.len());
    for (i, run) in runs.iter().enumerate() {
        let millis = run.elapsed.as_secs_f64() * 1000.0;
        let entry = match &run.outcome {
            Ok(outcome) => {
                let file = format!("q{}.csv", i + 1);
                outcome.result.write_csv(&out_dir.join(&file))?;
                SummaryEntry {
                    id: &run.id,
                    file: Some(file),
                    rows: Some(outcome.result.row_count()),
                    plan: Some(outcome.stats.plan.clone()),
                    cached: outcome.cached(),
                    millis,
                    error: None,
                }
            }
            Err(e) => SummaryEntry {
                id: &run.id,
                file: None,
                rows: None,
                plan: None,
                cached: false,
                millis,
                error: Some(e.to_string()),
            },
        };
        entries.push(entry);
    }

    let summary = RunSummary {
        total_millis: entries.iter().map(|e| e.millis).sum(),
        queries: entries,
        cache_hits: engine.cache().hits(),
        cache_misses: engine.cache().misses(),
        planner: engine.planner_counters(),
    };
    let path = out_dir.join("summary.json");
    fs::write(&path, serde_json::to_vec_pretty(&summary)?)
        .map_err(|e| EngineError::storage_write(&path, e))?;
    info!("Wrote {} results to {}", runs.len(), out_dir.display());
    Ok(path)
}
