use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use event_rollup::engine::{prepare, write_results, Engine, QueryRun};
use event_rollup::generate::{generate, GenerateOptions};
use event_rollup::planner::Strategy;
use event_rollup::query::{default_queries, QueryRequest};
use event_rollup::{EngineConfig, Result};
use log::info;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[cfg(feature = "enable_jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "event_rollup")]
#[command(about = "Rollup-accelerated aggregation queries over ad event logs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest raw CSV logs and build partitions, indexes and rollups
    Prepare {
        /// Directory of raw *.csv event files
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Where the store is published
        #[arg(short, long)]
        storage_dir: PathBuf,

        /// JSON engine configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the bucketing timezone
        #[arg(long)]
        timezone: Option<String>,

        /// Override the worker count
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Answer a batch of queries against a prepared store
    Run {
        #[arg(short, long)]
        storage_dir: PathBuf,

        /// Directory for q<N>.csv results and summary.json
        #[arg(short, long)]
        out_dir: PathBuf,

        /// JSON query list; the built-in catalogue when omitted
        #[arg(short, long)]
        queries: Option<PathBuf>,

        #[arg(short, long)]
        config: Option<PathBuf>,

        /// auto, rollup, pruned-scan or full-scan. Forced strategies skip the cache.
        #[arg(long, default_value = "auto")]
        strategy: Strategy,

        /// Print the chosen plans without executing
        #[arg(long)]
        explain: bool,
    },

    /// Write synthetic raw event files
    Generate {
        #[arg(short, long)]
        out_dir: PathBuf,

        #[arg(short, long, default_value = "1000000")]
        rows: usize,

        #[arg(short, long, default_value = "4")]
        files: usize,

        /// First local day covered, YYYY-MM-DD
        #[arg(long, default_value = "2024-06-01")]
        start: NaiveDate,

        #[arg(long, default_value = "30")]
        days: u32,

        #[arg(long, default_value = "42")]
        seed: u64,
    },
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path),
        None => Ok(EngineConfig::default()),
    }
}

fn load_queries(path: Option<&Path>) -> Result<Vec<QueryRequest>> {
    match path {
        Some(path) => QueryRequest::parse_list(&std::fs::read_to_string(path)?),
        None => default_queries(),
    }
}

fn run_forced(engine: &Engine, queries: &[QueryRequest], strategy: Strategy) -> Vec<QueryRun> {
    queries
        .iter()
        .map(|query| {
            let start = Instant::now();
            let outcome = engine.query_with(query, strategy);
            QueryRun {
                id: query.id.clone(),
                signature: query.signature(),
                outcome,
                elapsed: start.elapsed(),
            }
        })
        .collect()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Prepare {
            data_dir,
            storage_dir,
            config,
            timezone,
            workers,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(timezone) = timezone {
                config.timezone = timezone;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            let report = prepare(&config, &data_dir, &storage_dir)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Run {
            storage_dir,
            out_dir,
            queries,
            config,
            strategy,
            explain,
        } => {
            let config = load_config(config.as_deref())?;
            let queries = load_queries(queries.as_deref())?;
            let engine = Engine::open(&storage_dir, &config)?;

            if explain {
                for query in &queries {
                    match engine.explain(query, strategy) {
                        Ok(plan) => println!("{}: {}\n  {}", query.id, query, plan),
                        Err(e) => println!("{}: {}\n  error: {}", query.id, query, e),
                    }
                }
                return Ok(());
            }

            let start = Instant::now();
            let runs = match strategy {
                Strategy::Auto => engine.run_batch(&queries),
                forced => run_forced(&engine, &queries, forced),
            };
            let summary = write_results(&out_dir, &runs, &engine)?;
            let failed = runs.iter().filter(|r| r.outcome.is_err()).count();
            info!(
                "Ran {} queries ({} failed) in {:?}, summary at {}",
                runs.len(),
                failed,
                start.elapsed(),
                summary.display()
            );
        }

        Commands::Generate {
            out_dir,
            rows,
            files,
            start,
            days,
            seed,
        } => {
            let options = GenerateOptions {
                rows,
                files,
                start,
                days,
                seed,
            };
            let paths = generate(&out_dir, &options)?;
            println!("Wrote {} files to {}", paths.len(), out_dir.display());
        }
    }

    Ok(())
}
