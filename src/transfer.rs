// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table transfer worker: resumable snapshot copy of one table.
//!
//! ```text
//! load checkpoint ──► COMPLETE? ──yes──► AlreadyComplete
//!        │no
//!        ▼
//! scan(after = resume key) ──► put rows ──► flush IN_PROGRESS every N rows / T secs
//!        │ empty batch
//!        ▼
//! write COMPLETE
//! ```
//!
//! # Failure handling
//!
//! - Retryable faults (source unreachable, store timeouts, failed puts)
//!   rescan from the last *persisted* resume key after a backoff, forever.
//! - `TableNotFound` is verified against the source. A missing table or a
//!   different id ends the run with [`TransferOutcome::TableDropped`].
//! - Anything else persists an ERROR checkpoint before the run returns
//!   [`TransferOutcome::Failed`].
//!
//! # Stopping
//!
//! The owner signals a [`StopReason`] through a watch channel:
//!
//! | Reason | Checkpoint written | Outcome |
//! |--------|--------------------|---------|
//! | `Timeout` | IN_PROGRESS at the current key | `Stopped` |
//! | `Shutdown` | SHUTDOWN at the current key | `Shutdown` |
//! | `Cancel` | none (table was removed) | `Abandoned` |
//!
//! The resume key only moves forward: within a pass it follows the rows
//! written, and a rescan restarts from the persisted key, which never lags
//! behind a previously persisted key.

use crate::checkpoint::{CheckpointState, CheckpointStore, TableInitCheckpoint};
use crate::config::TransferConfig;
use crate::error::{AgentError, ErrorClass};
use crate::metrics::{self, MetricsRegistry};
use crate::region::{SourceRegion, TargetStore};
use crate::resilience::{RateLimiter, RetryConfig};
use crate::types::TableInfo;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Why a running transfer was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The transfer slot expired. Progress is kept and the job re-queued.
    Timeout,
    /// The agent is shutting down.
    Shutdown,
    /// The table was removed from replication.
    Cancel,
}

/// How one run of a [`TableTransferWorker`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Complete { rows: u64, attempts: u32 },
    AlreadyComplete,
    Stopped,
    Shutdown,
    Abandoned,
    TableDropped,
    Failed(String),
}

impl TransferOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Complete { .. } => "complete",
            Self::AlreadyComplete => "already_complete",
            Self::Stopped => "stopped",
            Self::Shutdown => "shutdown",
            Self::Abandoned => "abandoned",
            Self::TableDropped => "table_dropped",
            Self::Failed(_) => "failed",
        }
    }

    /// Table is fully copied.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::AlreadyComplete)
    }
}

/// Newest known definition of each replicated table, by name.
///
/// The agent loop publishes to it and workers read it before every write,
/// so an EVOLVE reaches copies that are already queued or running.
#[derive(Debug, Default)]
pub struct SchemaCache {
    tables: RwLock<HashMap<String, TableInfo>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `table`. For the same table id the schema version never goes
    /// down.
    pub fn publish(&self, table: &TableInfo) {
        let mut tables = self.tables.write().unwrap_or_else(|p| p.into_inner());
        match tables.get_mut(&table.name) {
            Some(known) if known.id == table.id => {
                known.schema_version = known.schema_version.max(table.schema_version);
            }
            _ => {
                tables.insert(table.name.clone(), table.clone());
            }
        }
    }

    pub fn forget(&self, name: &str) {
        self.tables
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
    }

    pub fn get(&self, name: &str) -> Option<TableInfo> {
        self.tables
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    /// Raise `table` to the cached schema version of the same table id.
    /// Returns true if it changed.
    pub fn refresh(&self, table: &mut TableInfo) -> bool {
        match self.get(&table.name) {
            Some(known) if known.id == table.id && known.schema_version > table.schema_version => {
                table.schema_version = known.schema_version;
                true
            }
            _ => false,
        }
    }
}

/// Everything a worker needs besides the table. Shared by all workers of an
/// agent.
pub struct TransferContext {
    pub region: String,
    pub agent_id: String,
    pub source: Arc<dyn SourceRegion>,
    pub target: Arc<dyn TargetStore>,
    pub store: Arc<CheckpointStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub config: TransferConfig,
    pub schemas: Arc<SchemaCache>,
    rate_limiter: Option<RateLimiter>,
}

impl TransferContext {
    pub fn new(
        region: impl Into<String>,
        agent_id: impl Into<String>,
        source: Arc<dyn SourceRegion>,
        target: Arc<dyn TargetStore>,
        store: Arc<CheckpointStore>,
        metrics: Arc<MetricsRegistry>,
        config: TransferConfig,
    ) -> Self {
        let rate_limiter = config.rate_limit_config().map(RateLimiter::new);
        Self {
            region: region.into(),
            agent_id: agent_id.into(),
            source,
            target,
            store,
            metrics,
            config,
            schemas: Arc::new(SchemaCache::new()),
            rate_limiter,
        }
    }
}

enum PassEnd {
    Exhausted,
    Stopped(StopReason),
}

/// Wait for a stop signal. A dropped sender counts as shutdown.
async fn stop_signal(rx: &mut watch::Receiver<Option<StopReason>>) -> StopReason {
    match rx.wait_for(Option::is_some).await {
        Ok(reason) => (*reason).unwrap_or(StopReason::Shutdown),
        Err(_) => StopReason::Shutdown,
    }
}

fn pending_stop(rx: &watch::Receiver<Option<StopReason>>) -> Option<StopReason> {
    *rx.borrow()
}

/// One-shot copy of a single table.
pub struct TableTransferWorker {
    ctx: Arc<TransferContext>,
    table: TableInfo,
    stop: watch::Receiver<Option<StopReason>>,
    checkpoint: TableInitCheckpoint,
    resume: Option<Vec<u8>>,
    rows: u64,
    rows_since_flush: u64,
    last_flush: Instant,
}

impl TableTransferWorker {
    pub fn new(
        ctx: Arc<TransferContext>,
        table: TableInfo,
        stop: watch::Receiver<Option<StopReason>>,
    ) -> Self {
        let checkpoint = TableInitCheckpoint::not_started(&ctx.region, &table, &ctx.agent_id);
        Self {
            ctx,
            table,
            stop,
            checkpoint,
            resume: None,
            rows: 0,
            rows_since_flush: 0,
            last_flush: Instant::now(),
        }
    }

    /// Run the copy to one of the [`TransferOutcome`]s.
    pub async fn run(mut self) -> TransferOutcome {
        let span = info_span!("table_transfer", table = %self.table.name, table_id = self.table.id);
        async move {
            let started = Instant::now();
            let outcome = self.run_inner().await;
            match &outcome {
                TransferOutcome::Complete { rows, attempts } => {
                    info!(rows, attempts, elapsed_ms = started.elapsed().as_millis() as u64, "Table transfer complete");
                }
                TransferOutcome::Failed(msg) => error!(error = %msg, "Table transfer failed"),
                other => debug!(outcome = other.label(), rows = self.rows, "Table transfer ended"),
            }
            metrics::record_transfer_outcome(&self.table.name, outcome.label(), started.elapsed());
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_inner(&mut self) -> TransferOutcome {
        let ctx = self.ctx.clone();
        self.checkpoint = match ctx
            .store
            .load_for_transfer(&ctx.region, &self.table, &ctx.agent_id)
            .await
        {
            Ok(cp) => cp,
            Err(e) => return TransferOutcome::Failed(e.to_string()),
        };

        if self.checkpoint.is_complete() {
            debug!("Checkpoint already COMPLETE, skipping");
            ctx.metrics.set_init_state(&self.table.name, CheckpointState::Complete);
            return TransferOutcome::AlreadyComplete;
        }

        self.resume = self.checkpoint.resume_after();
        ctx.schemas.refresh(&mut self.table);
        ctx.metrics.transfer_started(&self.table.name);
        ctx.metrics.set_init_state(&self.table.name, CheckpointState::InProgress);
        info!(
            state = %self.checkpoint.state,
            resume = self.resume.is_some(),
            "Starting table transfer"
        );

        let backoff = RetryConfig::daemon(ctx.config.retry_backoff_duration());
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let pass = self.scan_pass().await;
            let err = match pass {
                Ok(PassEnd::Exhausted) => return self.finish(attempt).await,
                Ok(PassEnd::Stopped(reason)) => return self.halt(reason).await,
                Err(e) => e,
            };

            match err.class() {
                ErrorClass::MetadataMismatch => match self.verify_table().await {
                    Ok(true) => {
                        warn!(error = %err, "Table lookup failed but table still exists, rescanning");
                    }
                    Ok(false) => {
                        info!("Table dropped or recreated at source");
                        metrics::record_table_recreated(&self.table.name);
                        return TransferOutcome::TableDropped;
                    }
                    Err(verify_err) if verify_err.is_retryable() => {
                        warn!(error = %verify_err, "Could not verify table, rescanning");
                    }
                    Err(verify_err) => return self.fail(verify_err).await,
                },
                ErrorClass::Retryable => {
                    warn!(attempt, error = %err, "Transient transfer fault, rescanning from checkpoint");
                }
                _ => return self.fail(err).await,
            }

            metrics::record_transfer_retry(&self.table.name);
            ctx.metrics.transfer_started(&self.table.name);
            // Rows after the persisted key are copied again by the rescan.
            self.resume = self.checkpoint.resume_after();
            self.rows = self.rows.saturating_sub(self.rows_since_flush);
            self.rows_since_flush = 0;

            let delay = backoff.delay_for_attempt(attempt as usize);
            tokio::select! {
                biased;
                reason = stop_signal(&mut self.stop) => return self.halt(reason).await,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn scan_pass(&mut self) -> Result<PassEnd, AgentError> {
        let ctx = self.ctx.clone();
        loop {
            if let Some(reason) = pending_stop(&self.stop) {
                return Ok(PassEnd::Stopped(reason));
            }

            let scan = ctx.source.scan(
                &self.table,
                self.resume.clone(),
                ctx.config.batch_size,
                ctx.config.include_tombstones,
            );
            let batch = tokio::select! {
                biased;
                reason = stop_signal(&mut self.stop) => return Ok(PassEnd::Stopped(reason)),
                batch = scan => batch?,
            };

            if batch.is_empty() {
                return Ok(PassEnd::Exhausted);
            }

            let mut written = 0u64;
            for row in batch {
                if let Some(reason) = pending_stop(&self.stop) {
                    ctx.metrics.rows_transferred(&self.table.name, written);
                    return Ok(PassEnd::Stopped(reason));
                }
                if let Some(limiter) = &ctx.rate_limiter {
                    limiter.acquire().await;
                }
                if ctx.schemas.refresh(&mut self.table) {
                    info!(version = self.table.schema_version, "Schema evolved mid-copy");
                }
                let key = row.key.clone();
                if let Err(e) = ctx.target.put(&self.table, row).await {
                    ctx.metrics.rows_transferred(&self.table.name, written);
                    return Err(e.into());
                }
                self.resume = Some(key);
                self.rows += 1;
                self.rows_since_flush += 1;
                written += 1;

                if self.rows_since_flush >= ctx.config.checkpoint_rows.max(1)
                    || self.last_flush.elapsed() >= ctx.config.checkpoint_interval_duration()
                {
                    self.flush(CheckpointState::InProgress).await?;
                }
            }
            ctx.metrics.rows_transferred(&self.table.name, written);
        }
    }

    /// Persist the current resume point with `state`.
    async fn flush(&mut self, state: CheckpointState) -> Result<(), AgentError> {
        let mut next = self.checkpoint.clone();
        next.resume_key = self.resume.clone().unwrap_or_default();
        next.state = state;
        next.error = None;
        self.ctx.store.write(&next).await?;
        self.checkpoint = next;
        self.ctx
            .metrics
            .rows_persisted(&self.table.name, self.rows_since_flush);
        self.ctx.metrics.set_init_state(&self.table.name, state);
        debug!(state = %state, rows = self.rows, "Transfer checkpoint flushed");
        self.rows_since_flush = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    async fn finish(&mut self, attempts: u32) -> TransferOutcome {
        if let Err(e) = self.flush(CheckpointState::Complete).await {
            return TransferOutcome::Failed(e.to_string());
        }
        self.ctx.metrics.transfer_completed(&self.table.name);
        TransferOutcome::Complete {
            rows: self.rows,
            attempts,
        }
    }

    async fn halt(&mut self, reason: StopReason) -> TransferOutcome {
        let (state, outcome) = match reason {
            StopReason::Cancel => {
                info!(rows = self.rows, "Transfer abandoned, table removed");
                return TransferOutcome::Abandoned;
            }
            StopReason::Timeout => (CheckpointState::InProgress, TransferOutcome::Stopped),
            StopReason::Shutdown => (CheckpointState::Shutdown, TransferOutcome::Shutdown),
        };
        match self.flush(state).await {
            Ok(()) => {
                info!(reason = ?reason, rows = self.rows, "Transfer stopped, progress checkpointed");
                outcome
            }
            Err(e) => TransferOutcome::Failed(e.to_string()),
        }
    }

    /// Persist ERROR, then report the failure.
    async fn fail(&mut self, err: AgentError) -> TransferOutcome {
        let message = err.to_string();
        self.checkpoint.state = CheckpointState::Error;
        self.checkpoint.error = Some(message.clone());
        if let Err(e) = self.ctx.store.write(&self.checkpoint).await {
            error!(error = %e, "Failed to persist ERROR checkpoint");
        }
        self.ctx
            .metrics
            .set_init_state(&self.table.name, CheckpointState::Error);
        metrics::record_error("fatal");
        TransferOutcome::Failed(message)
    }

    /// True if the table still exists at the source with the same id.
    async fn verify_table(&self) -> Result<bool, AgentError> {
        let current = self.ctx.source.table_info(&self.table.name).await?;
        Ok(matches!(current, Some(info) if info.id == self.table.id))
    }
}

/// Stop handle paired with a worker's receiver.
pub fn stop_channel() -> (
    watch::Sender<Option<StopReason>>,
    watch::Receiver<Option<StopReason>>,
) {
    watch::channel(None)
}

/// Grace period helper used by owners that stop a worker: signal, wait up to
/// `grace` for it to flush, then give up.
pub async fn stop_and_wait(
    stop: &watch::Sender<Option<StopReason>>,
    reason: StopReason,
    handle: &mut tokio::task::JoinHandle<TransferOutcome>,
    grace: Duration,
) -> Option<TransferOutcome> {
    let _ = stop.send(Some(reason));
    match tokio::time::timeout(grace, &mut *handle).await {
        Ok(Ok(outcome)) => Some(outcome),
        Ok(Err(join_err)) => Some(TransferOutcome::Failed(join_err.to_string())),
        Err(_) => {
            handle.abort();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRegion, MemoryTarget};
    use crate::types::Row;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        region: Arc<MemoryRegion>,
        target: Arc<MemoryTarget>,
        store: Arc<CheckpointStore>,
        ctx: Arc<TransferContext>,
    }

    async fn fixture(config: TransferConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CheckpointStore::new(dir.path().join("cp.db")).await.unwrap());
        let region = Arc::new(MemoryRegion::new());
        let target = Arc::new(MemoryTarget::new());
        let ctx = Arc::new(TransferContext::new(
            "eu",
            "a0",
            region.clone(),
            target.clone(),
            store.clone(),
            Arc::new(MetricsRegistry::new()),
            config,
        ));
        Fixture {
            _dir: dir,
            region,
            target,
            store,
            ctx,
        }
    }

    fn fast_config() -> TransferConfig {
        TransferConfig {
            batch_size: 10,
            checkpoint_rows: 25,
            checkpoint_interval: "1h".into(),
            retry_backoff: "1ms".into(),
            include_tombstones: true,
            rows_per_sec: None,
            stop_grace: "1s".into(),
        }
    }

    #[tokio::test]
    async fn test_full_copy_completes() {
        let f = fixture(fast_config()).await;
        let t = f.region.create_table("t", 1, 1);
        f.region.insert_rows("t", 100);
        f.region.insert("t", Row::tombstone("k999999"));

        let (_stop_tx, stop_rx) = stop_channel();
        let outcome = TableTransferWorker::new(f.ctx.clone(), t, stop_rx).run().await;
        assert_eq!(outcome, TransferOutcome::Complete { rows: 101, attempts: 1 });

        assert_eq!(f.target.rows("t"), f.region.rows("t"));
        let cp = f.store.read("eu", "t", "a0").await.unwrap().unwrap();
        assert_eq!(cp.state, CheckpointState::Complete);
        assert_eq!(cp.resume_key, b"k999999".to_vec());

        let stats = f.ctx.metrics.current();
        assert_eq!(stats.get("t").unwrap().rows_transferred, 101);
        assert_eq!(stats.get("t").unwrap().rows_persisted, 101);
    }

    #[tokio::test]
    async fn test_already_complete_is_skipped() {
        let f = fixture(fast_config()).await;
        let t = f.region.create_table("t", 1, 1);
        f.region.insert_rows("t", 10);
        let mut cp = TableInitCheckpoint::not_started("eu", &t, "a0");
        cp.state = CheckpointState::Complete;
        f.store.write(&cp).await.unwrap();

        let (_tx, rx) = stop_channel();
        let outcome = TableTransferWorker::new(f.ctx.clone(), t, rx).run().await;
        assert_eq!(outcome, TransferOutcome::AlreadyComplete);
        assert_eq!(f.target.put_count(), 0);
    }

    #[tokio::test]
    async fn test_resumes_strictly_after_checkpoint() {
        let f = fixture(fast_config()).await;
        let t = f.region.create_table("t", 1, 1);
        f.region.insert_rows("t", 100);
        let mut cp = TableInitCheckpoint::not_started("eu", &t, "a0");
        cp.state = CheckpointState::InProgress;
        cp.resume_key = b"k000049".to_vec();
        f.store.write(&cp).await.unwrap();

        let (_tx, rx) = stop_channel();
        let outcome = TableTransferWorker::new(f.ctx.clone(), t, rx).run().await;
        assert_eq!(outcome, TransferOutcome::Complete { rows: 50, attempts: 1 });
        assert_eq!(f.target.row_count("t"), 50);
        assert_eq!(f.target.rows("t")[0].key, b"k000050".to_vec());
    }

    #[tokio::test]
    async fn test_recreated_table_restarts_from_scratch() {
        let f = fixture(fast_config()).await;
        let old = TableInfo::new("t", 7, 1);
        let mut cp = TableInitCheckpoint::not_started("eu", &old, "a0");
        cp.state = CheckpointState::InProgress;
        cp.resume_key = b"k000089".to_vec();
        f.store.write(&cp).await.unwrap();

        let t = f.region.create_table("t", 9, 1);
        f.region.insert_rows("t", 100);

        let (_tx, rx) = stop_channel();
        let outcome = TableTransferWorker::new(f.ctx.clone(), t, rx).run().await;
        assert_eq!(outcome, TransferOutcome::Complete { rows: 100, attempts: 1 });
        assert_eq!(f.target.row_count("t"), 100);
    }

    #[tokio::test]
    async fn test_transient_faults_are_retried() {
        let f = fixture(fast_config()).await;
        let t = f.region.create_table("t", 1, 1);
        f.region.insert_rows("t", 60);
        f.region.timeout_next_scans(2);
        f.target.fail_next_puts(1);

        let (_tx, rx) = stop_channel();
        let outcome = TableTransferWorker::new(f.ctx.clone(), t, rx).run().await;
        match outcome {
            TransferOutcome::Complete { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(f.target.rows("t"), f.region.rows("t"));
    }

    #[tokio::test]
    async fn test_fatal_error_persists_error_checkpoint() {
        let f = fixture(fast_config()).await;
        let t = f.region.create_table("t", 1, 1);
        f.region.insert_rows("t", 5);
        f.region.set_fatal_scan(Some("corrupt page"));

        let (_tx, rx) = stop_channel();
        let outcome = TableTransferWorker::new(f.ctx.clone(), t, rx).run().await;
        assert!(matches!(outcome, TransferOutcome::Failed(ref m) if m.contains("corrupt page")));

        let cp = f.store.read("eu", "t", "a0").await.unwrap().unwrap();
        assert_eq!(cp.state, CheckpointState::Error);
        assert!(cp.error.unwrap().contains("corrupt page"));
    }

    #[tokio::test]
    async fn test_dropped_table_is_reported() {
        let f = fixture(fast_config()).await;
        let t = f.region.create_table("t", 1, 1);
        f.region.insert_rows("t", 5);
        f.region.recreate_table("t", 2);

        let (_tx, rx) = stop_channel();
        let outcome = TableTransferWorker::new(f.ctx.clone(), t, rx).run().await;
        assert_eq!(outcome, TransferOutcome::TableDropped);
    }

    async fn run_and_stop(reason: StopReason) -> (Fixture, TransferOutcome) {
        let f = fixture(fast_config()).await;
        let t = f.region.create_table("t", 1, 1);
        f.region.insert_rows("t", 200);
        f.region.set_scan_delay(Duration::from_millis(10));

        let (stop_tx, rx) = stop_channel();
        let mut handle = tokio::spawn(TableTransferWorker::new(f.ctx.clone(), t, rx).run());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let outcome = stop_and_wait(&stop_tx, reason, &mut handle, Duration::from_secs(5))
            .await
            .unwrap();
        (f, outcome)
    }

    #[tokio::test]
    async fn test_shutdown_checkpoints_and_resumes() {
        let (f, outcome) = run_and_stop(StopReason::Shutdown).await;
        assert_eq!(outcome, TransferOutcome::Shutdown);

        let cp = f.store.read("eu", "t", "a0").await.unwrap().unwrap();
        assert_eq!(cp.state, CheckpointState::Shutdown);
        let copied = f.target.row_count("t");
        assert!(copied > 0 && copied < 200);
        assert_eq!(f.target.rows("t").last().unwrap().key, cp.resume_key);

        f.region.set_scan_delay(Duration::ZERO);
        let t = TableInfo::new("t", 1, 1);
        let (_tx, rx) = stop_channel();
        let outcome = TableTransferWorker::new(f.ctx.clone(), t, rx).run().await;
        assert_eq!(
            outcome,
            TransferOutcome::Complete {
                rows: (200 - copied) as u64,
                attempts: 1
            }
        );
        assert_eq!(f.target.rows("t"), f.region.rows("t"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_in_progress() {
        let (f, outcome) = run_and_stop(StopReason::Timeout).await;
        assert_eq!(outcome, TransferOutcome::Stopped);
        let cp = f.store.read("eu", "t", "a0").await.unwrap().unwrap();
        assert_eq!(cp.state, CheckpointState::InProgress);
        assert!(!cp.resume_key.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_writes_nothing() {
        let (f, outcome) = run_and_stop(StopReason::Cancel).await;
        assert_eq!(outcome, TransferOutcome::Abandoned);
        let cp = f.store.read("eu", "t", "a0").await.unwrap().unwrap();
        assert!(matches!(
            cp.state,
            CheckpointState::NotStart | CheckpointState::InProgress
        ));
    }

    #[tokio::test]
    async fn test_rescan_counts_each_row_once() {
        let f = fixture(fast_config()).await;
        let t = f.region.create_table("t", 1, 1);
        f.region.insert_rows("t", 100);
        // Six rows past the flush at 25 are written again by the rescan.
        f.target.fail_after_puts(31);

        let (_tx, rx) = stop_channel();
        let outcome = TableTransferWorker::new(f.ctx.clone(), t, rx).run().await;
        assert_eq!(outcome, TransferOutcome::Complete { rows: 100, attempts: 2 });
        assert_eq!(f.target.put_count(), 106);
        assert_eq!(f.target.rows("t"), f.region.rows("t"));
    }

    #[tokio::test]
    async fn test_evolved_schema_reaches_running_copy() {
        let f = fixture(fast_config()).await;
        let t = f.region.create_table("t", 1, 1);
        f.region.insert_rows("t", 200);
        f.region.set_scan_delay(Duration::from_millis(5));
        f.ctx.schemas.publish(&t);

        let (_tx, rx) = stop_channel();
        let handle = tokio::spawn(TableTransferWorker::new(f.ctx.clone(), t, rx).run());
        while f.target.row_count("t") < 20 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        f.ctx.schemas.publish(&TableInfo::new("t", 1, 3));
        let evolved_at = f.target.put_versions("t").len();

        assert!(handle.await.unwrap().is_done());
        let versions = f.target.put_versions("t");
        assert!(evolved_at < versions.len());
        assert!(versions[..evolved_at].iter().all(|v| *v == 1));
        assert!(versions[evolved_at..].iter().all(|v| *v == 3));
    }

    #[test]
    fn test_schema_cache_only_raises_same_table() {
        let cache = SchemaCache::new();
        cache.publish(&TableInfo::new("t", 1, 4));
        cache.publish(&TableInfo::new("t", 1, 2));
        assert_eq!(cache.get("t").map(|t| t.schema_version), Some(4));

        let mut stale = TableInfo::new("t", 1, 1);
        assert!(cache.refresh(&mut stale));
        assert_eq!(stale.schema_version, 4);
        assert!(!cache.refresh(&mut stale));

        // A recreated table under the same name is a different table.
        let mut other = TableInfo::new("t", 2, 1);
        assert!(!cache.refresh(&mut other));
        cache.publish(&other);
        assert_eq!(cache.get("t"), Some(TableInfo::new("t", 2, 1)));

        cache.forget("t");
        assert!(cache.get("t").is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_copy_completes() {
        let mut config = fast_config();
        config.rows_per_sec = Some(1000);
        let f = fixture(config).await;
        let t = f.region.create_table("t", 1, 1);
        f.region.insert_rows("t", 20);

        let (_tx, rx) = stop_channel();
        let outcome = TableTransferWorker::new(f.ctx.clone(), t, rx).run().await;
        assert!(outcome.is_done());
        assert_eq!(f.target.row_count("t"), 20);
    }
}
