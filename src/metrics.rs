//! Metrics for observability.
//!
//! Two layers:
//!
//! - Process-level Prometheus-compatible metrics through the `metrics` facade,
//!   prefixed with `region_agent_`. Counters end in `_total`, gauges represent
//!   current state, histograms track durations.
//! - [`MetricsRegistry`]: the in-process per-table counters that back
//!   [`RegionAgent::report()`](crate::RegionAgent::report). The registry is
//!   swapped wholesale every metrics interval; the previous interval stays
//!   readable for reporting while the new one accumulates.
//!
//! # Usage
//!
//! ```rust,no_run
//! use region_agent::metrics;
//! use std::time::Duration;
//!
//! metrics::record_request("add", "success");
//! metrics::record_stream_change("add", "success", Duration::from_millis(40));
//! ```

use crate::agent::AgentStatus;
use crate::checkpoint::CheckpointState;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Record a completed agent request.
pub fn record_request(kind: &str, outcome: &str) {
    counter!(
        "region_agent_requests_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record redelivery of a request after a retryable failure.
pub fn record_request_retry(kind: &str) {
    counter!("region_agent_request_retries_total", "kind" => kind.to_string()).increment(1);
}

/// Gauge for agent status (encoded numerically for alerting).
pub fn set_agent_status(status: AgentStatus) {
    let value = match status {
        AgentStatus::Idle => 0.0,
        AgentStatus::Streaming => 1.0,
        AgentStatus::InitializingTables => 2.0,
        AgentStatus::AddingTables => 3.0,
        AgentStatus::RemovingTables => 4.0,
        AgentStatus::ChangingParameter => 5.0,
        AgentStatus::Canceled => 6.0,
    };
    gauge!("region_agent_status").set(value);
}

/// Record an attempt to (re)establish the stream.
pub fn record_stream_start(mode: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("region_agent_stream_starts_total", "mode" => mode.to_string(), "status" => status)
        .increment(1);
}

/// Record a stream membership change and how long it took to drain.
pub fn record_stream_change(op: &str, outcome: &str, duration: Duration) {
    counter!(
        "region_agent_stream_changes_total",
        "op" => op.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("region_agent_stream_change_duration_seconds", "op" => op.to_string())
        .record(duration.as_secs_f64());
}

/// Record a persisted stream checkpoint.
pub fn record_stream_checkpoint(shards: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("region_agent_stream_checkpoints_total", "status" => status).increment(1);
    if success {
        gauge!("region_agent_stream_checkpoint_shards").set(shards as f64);
    }
}

/// Gauge for the number of tables streaming.
pub fn set_streaming_tables(count: usize) {
    gauge!("region_agent_streaming_tables").set(count as f64);
}

/// Gauge for tables waiting in the readiness poller.
pub fn set_pending_tables(count: usize) {
    gauge!("region_agent_pending_tables").set(count as f64);
}

/// Gauge for jobs waiting on the transfer lane.
pub fn set_transfer_queue_depth(depth: usize) {
    gauge!("region_agent_transfer_queue_depth").set(depth as f64);
}

/// Record rows copied to the target.
pub fn record_rows_transferred(table: &str, count: u64) {
    counter!("region_agent_rows_transferred_total", "table" => table.to_string()).increment(count);
}

/// Record the end of one transfer worker run.
pub fn record_transfer_outcome(table: &str, outcome: &str, duration: Duration) {
    counter!(
        "region_agent_transfers_total",
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("region_agent_transfer_duration_seconds", "table" => table.to_string())
        .record(duration.as_secs_f64());
}

/// Record a rescan after a transient fault.
pub fn record_transfer_retry(table: &str) {
    counter!("region_agent_transfer_retries_total", "table" => table.to_string()).increment(1);
}

/// Record a table checkpoint write by state.
pub fn record_checkpoint_write(state: &str) {
    counter!("region_agent_checkpoint_writes_total", "state" => state.to_string()).increment(1);
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn checkpoint_retries_total(operation: &str) {
    counter!("region_agent_checkpoint_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record a table dropped or recreated at the source.
pub fn record_table_recreated(table: &str) {
    counter!("region_agent_table_recreated_total", "table" => table.to_string()).increment(1);
}

/// Record errors by class.
pub fn record_error(error_class: &str) {
    counter!("region_agent_errors_total", "class" => error_class.to_string()).increment(1);
}

// =============================================================================
// Per-table registry
// =============================================================================

/// Counters for one table within one metrics interval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    pub rows_transferred: u64,
    /// Rows covered by a persisted checkpoint.
    pub rows_persisted: u64,
    pub attempts: u32,
    pub transfer_started: Option<DateTime<Utc>>,
    pub transfer_completed: Option<DateTime<Utc>>,
    pub init_state: Option<CheckpointState>,
}

/// Per-table counters of one metrics interval.
#[derive(Debug, Clone)]
pub struct PerTableMetrics {
    pub interval_start: DateTime<Utc>,
    pub tables: BTreeMap<String, TableStats>,
}

impl Default for PerTableMetrics {
    fn default() -> Self {
        Self {
            interval_start: Utc::now(),
            tables: BTreeMap::new(),
        }
    }
}

impl PerTableMetrics {
    pub fn get(&self, table: &str) -> Option<&TableStats> {
        self.tables.get(table)
    }
}

/// Current and previous [`PerTableMetrics`], shared by the agent tasks.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    current: Mutex<PerTableMetrics>,
    previous: Mutex<Option<PerTableMetrics>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, table: &str, f: impl FnOnce(&mut TableStats)) {
        let mut current = lock(&self.current);
        f(current.tables.entry(table.to_string()).or_default());
    }

    pub fn transfer_started(&self, table: &str) {
        self.update(table, |s| {
            s.attempts += 1;
            s.transfer_started.get_or_insert_with(Utc::now);
        });
    }

    pub fn rows_transferred(&self, table: &str, rows: u64) {
        self.update(table, |s| s.rows_transferred += rows);
        record_rows_transferred(table, rows);
    }

    pub fn rows_persisted(&self, table: &str, rows: u64) {
        self.update(table, |s| s.rows_persisted += rows);
    }

    pub fn transfer_completed(&self, table: &str) {
        self.update(table, |s| {
            s.transfer_completed = Some(Utc::now());
            s.init_state = Some(CheckpointState::Complete);
        });
    }

    pub fn set_init_state(&self, table: &str, state: CheckpointState) {
        self.update(table, |s| s.init_state = Some(state));
    }

    /// Forget a removed table in the current interval.
    pub fn remove(&self, table: &str) {
        lock(&self.current).tables.remove(table);
    }

    /// Start a new interval. The finished one becomes `previous()`.
    ///
    /// Init state carries over so a table mid-copy stays visible.
    pub fn rollover(&self) {
        let mut current = lock(&self.current);
        let mut next = PerTableMetrics::default();
        for (name, stats) in &current.tables {
            if let Some(state) = stats.init_state {
                next.tables.insert(
                    name.clone(),
                    TableStats {
                        init_state: Some(state),
                        ..Default::default()
                    },
                );
            }
        }
        let finished = std::mem::replace(&mut *current, next);
        *lock(&self.previous) = Some(finished);
    }

    pub fn current(&self) -> PerTableMetrics {
        lock(&self.current).clone()
    }

    pub fn previous(&self) -> Option<PerTableMetrics> {
        lock(&self.previous).clone()
    }
}
