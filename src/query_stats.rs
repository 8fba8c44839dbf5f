//! Per-query timings and process memory, logged as a run summary.

use log::info;
use serde::Serialize;
use std::time::Duration;
use sysinfo::{get_current_pid, ProcessExt, System, SystemExt};

/// Time a block into one of the [`QueryTiming`] sections.
#[macro_export]
macro_rules! time_section {
    ($stats:expr, $section:ident, $body:block) => {{
        let section_start = std::time::Instant::now();
        let result = $body;
        $stats.timing.$section += section_start.elapsed();
        result
    }};
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueryTiming {
    pub planning: Duration,
    pub execution: Duration,
    pub total: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryStats {
    pub query_id: String,
    pub plan: String,
    pub cached: bool,
    pub timing: QueryTiming,
    pub result_rows: usize,
    pub rows_scanned: u64,
    /// Resident memory of the process after the query, in bytes.
    pub memory_bytes: Option<u64>,
}

impl QueryStats {
    pub fn new(query_id: &str) -> Self {
        Self {
            query_id: query_id.to_string(),
            plan: String::new(),
            cached: false,
            timing: QueryTiming::default(),
            result_rows: 0,
            rows_scanned: 0,
            memory_bytes: None,
        }
    }

    pub fn set_plan(&mut self, plan: impl ToString) {
        self.plan = plan.to_string();
    }

    pub fn set_result_rows(&mut self, rows: usize) {
        self.result_rows = rows;
    }

    pub fn update_memory(&mut self) {
        let Ok(pid) = get_current_pid() else {
            return;
        };
        let mut system = System::new();
        if system.refresh_process(pid) {
            self.memory_bytes = system.process(pid).map(|p| p.memory());
        }
    }

    pub fn print_summary(&self) {
        let memory = self
            .memory_bytes
            .map_or_else(|| "n/a".to_string(), |b| format!("{:.1} MiB", b as f64 / 1048576.0));
        info!(
            "Query {} [{}{}]: {} rows in {:?} (planning {:?}, execution {:?}, {} rows scanned, rss {})",
            self.query_id,
            self.plan,
            if self.cached { ", cached" } else { "" },
            self.result_rows,
            self.timing.total,
            self.timing.planning,
            self.timing.execution,
            self.rows_scanned,
            memory
        );
    }
}
