//! Event rollup query engine.
//!
//! Ingests append-only ad-serving event logs once into partitioned parquet
//! files, secondary indexes and pre-aggregated rollups, then answers a fixed
//! catalogue of aggregation queries from the cheapest structure that can.

pub mod art;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod exec;
pub mod generate;
pub mod index;
pub mod ingest;
pub mod planner;
pub mod query;
pub mod query_stats;
pub mod rollup;
pub mod store;
pub mod value;

pub use config::EngineConfig;
pub use engine::{prepare, write_results, Engine, PrepareReport, QueryOutcome, QueryRun};
pub use error::{EngineError, Result};
pub use event::{Column, Event, EventType};
pub use exec::ResultSet;
pub use planner::{Plan, Strategy};
pub use query::{default_queries, QueryRequest};
pub use value::Value;
