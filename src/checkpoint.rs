// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence.
//!
//! Two kinds of records live in one SQLite database:
//!
//! - **Table init checkpoints**: progress of the snapshot copy of one table,
//!   keyed by `(region, table_name, agent_id)`.
//! - **Stream checkpoints**: last acknowledged change-stream token per shard,
//!   keyed by `(agent_id, source_region, shard)`.
//!
//! The store holds no locks of its own. At most one agent owns a table's
//! checkpoint at a time; an agent that takes over a table from a peer copies
//! the peer's position under its own id and deletes the peer's record
//! (see [`CheckpointStore::load_for_transfer`]).
//!
//! # Table checkpoint lifecycle
//!
//! ```text
//! NOT_START ──► IN_PROGRESS ──► COMPLETE
//!     │             │  ▲
//!     │             ▼  │
//!     │          SHUTDOWN        (graceful stop, resumable)
//!     └──────────► ERROR         (unrecoverable)
//! ```
//!
//! A record whose `table_id` differs from the table's current id belongs to a
//! dropped table. It is reset to NOT_START with an empty resume key.
//!
//! # SQLite Busy Handling
//!
//! Every statement runs through `execute_with_retry`, which retries
//! SQLITE_BUSY/SQLITE_LOCKED with exponential backoff (5 attempts, 10ms to 500ms).

use crate::config::CheckpointConfig;
use crate::error::{AgentError, Result};
use crate::types::{ShardId, StreamPosition, TableInfo};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::checkpoint_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Progress state of a table's snapshot copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointState {
    NotStart,
    InProgress,
    Complete,
    Error,
    Shutdown,
}

impl CheckpointState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStart => "NOT_START",
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
            Self::Shutdown => "SHUTDOWN",
        }
    }

    /// A transfer started from this state continues from the stored resume key.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::InProgress | Self::Shutdown)
    }
}

impl fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointState {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NOT_START" => Ok(Self::NotStart),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETE" => Ok(Self::Complete),
            "ERROR" => Ok(Self::Error),
            "SHUTDOWN" => Ok(Self::Shutdown),
            other => Err(AgentError::Internal(format!("unknown checkpoint state '{}'", other))),
        }
    }
}

/// Persisted progress of one table's snapshot copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInitCheckpoint {
    /// Source region the table is copied from.
    pub region: String,
    pub table_name: String,
    pub table_id: u64,
    /// Agent currently owning the copy.
    pub agent_id: String,
    /// Last key written to the target. Empty means "from the first row".
    pub resume_key: Vec<u8>,
    pub state: CheckpointState,
    pub error: Option<String>,
    /// Millis since epoch of the last write.
    pub updated_at: i64,
}

impl TableInitCheckpoint {
    /// Fresh NOT_START record for `table`.
    pub fn not_started(region: &str, table: &TableInfo, agent_id: &str) -> Self {
        Self {
            region: region.to_string(),
            table_name: table.name.clone(),
            table_id: table.id,
            agent_id: agent_id.to_string(),
            resume_key: Vec::new(),
            state: CheckpointState::NotStart,
            error: None,
            updated_at: 0,
        }
    }

    /// Resume key as the scan's exclusive lower bound.
    pub fn resume_after(&self) -> Option<Vec<u8>> {
        if self.resume_key.is_empty() {
            None
        } else {
            Some(self.resume_key.clone())
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == CheckpointState::Complete
    }

    /// The copy was started or promised and has neither finished nor failed.
    pub fn awaits_copy(&self) -> bool {
        !matches!(self.state, CheckpointState::Complete | CheckpointState::Error)
    }
}

/// One persisted stream checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCheckpointRecord {
    pub agent_id: String,
    pub source_region: String,
    pub shard: ShardId,
    pub token: String,
    pub updated_at: i64,
}

type TableRow = (String, String, i64, String, Vec<u8>, String, Option<String>, i64);

fn table_row_to_checkpoint(row: TableRow) -> Result<TableInitCheckpoint> {
    let (region, table_name, table_id, agent_id, resume_key, state, error, updated_at) = row;
    Ok(TableInitCheckpoint {
        region,
        table_name,
        table_id: table_id as u64,
        agent_id,
        resume_key,
        state: state.parse()?,
        error,
        updated_at,
    })
}

const TABLE_COLUMNS: &str =
    "region, table_name, table_id, agent_id, resume_key, state, error, updated_at";

/// Checkpoint storage backed by SQLite.
pub struct CheckpointStore {
    pool: SqlitePool,
    path: String,
}

impl CheckpointStore {
    /// Open the store described by `config`.
    pub async fn open(config: &CheckpointConfig) -> Result<Self> {
        Self::with_journal(&config.sqlite_path, config.wal_mode).await
    }

    /// Open (or create) a WAL-mode store at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_journal(path, true).await
    }

    async fn with_journal(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing checkpoint store");

        let journal = if wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| AgentError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(1))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS table_checkpoints (
                region TEXT NOT NULL,
                table_name TEXT NOT NULL,
                table_id INTEGER NOT NULL,
                agent_id TEXT NOT NULL,
                resume_key BLOB NOT NULL,
                state TEXT NOT NULL,
                error TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (region, table_name, agent_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stream_checkpoints (
                agent_id TEXT NOT NULL,
                source_region TEXT NOT NULL,
                shard INTEGER NOT NULL,
                token TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (agent_id, source_region, shard)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM table_checkpoints")
            .fetch_one(&pool)
            .await?;
        if count > 0 {
            info!(count, "Found table checkpoints from previous run");
        }

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Table init checkpoints
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn read(
        &self,
        region: &str,
        table_name: &str,
        agent_id: &str,
    ) -> Result<Option<TableInitCheckpoint>> {
        let pool = &self.pool;
        let sql = format!(
            "SELECT {} FROM table_checkpoints WHERE region = ? AND table_name = ? AND agent_id = ?",
            TABLE_COLUMNS
        );
        let row: Option<TableRow> = execute_with_retry("checkpoint_read", || async {
            sqlx::query_as(&sql)
                .bind(region)
                .bind(table_name)
                .bind(agent_id)
                .fetch_optional(pool)
                .await
        })
        .await?;
        row.map(table_row_to_checkpoint).transpose()
    }

    /// Insert or overwrite a checkpoint. Sets `updated_at` to now.
    pub async fn write(&self, checkpoint: &TableInitCheckpoint) -> Result<()> {
        let pool = &self.pool;
        let now = chrono::Utc::now().timestamp_millis();

        execute_with_retry("checkpoint_write", || async {
            sqlx::query(
                r#"
                INSERT INTO table_checkpoints
                    (region, table_name, table_id, agent_id, resume_key, state, error, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(region, table_name, agent_id) DO UPDATE SET
                    table_id = excluded.table_id,
                    resume_key = excluded.resume_key,
                    state = excluded.state,
                    error = excluded.error,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&checkpoint.region)
            .bind(&checkpoint.table_name)
            .bind(checkpoint.table_id as i64)
            .bind(&checkpoint.agent_id)
            .bind(&checkpoint.resume_key)
            .bind(checkpoint.state.as_str())
            .bind(&checkpoint.error)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        debug!(
            region = %checkpoint.region,
            table = %checkpoint.table_name,
            state = %checkpoint.state,
            resume_key_len = checkpoint.resume_key.len(),
            "Checkpoint written"
        );
        crate::metrics::record_checkpoint_write(checkpoint.state.as_str());
        Ok(())
    }

    /// Delete this agent's checkpoint for a table. Missing records are fine.
    pub async fn delete(&self, region: &str, table_name: &str, agent_id: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint_delete", || async {
            sqlx::query(
                "DELETE FROM table_checkpoints WHERE region = ? AND table_name = ? AND agent_id = ?",
            )
            .bind(region)
            .bind(table_name)
            .bind(agent_id)
            .execute(pool)
            .await
        })
        .await?;
        debug!(region, table = table_name, agent_id, "Checkpoint deleted");
        Ok(())
    }

    /// All table checkpoints for a region, across every agent.
    pub async fn list_for_region(&self, region: &str) -> Result<Vec<TableInitCheckpoint>> {
        let pool = &self.pool;
        let sql = format!(
            "SELECT {} FROM table_checkpoints WHERE region = ? ORDER BY table_name, agent_id",
            TABLE_COLUMNS
        );
        let rows: Vec<TableRow> = execute_with_retry("checkpoint_list", || async {
            sqlx::query_as(&sql).bind(region).fetch_all(pool).await
        })
        .await?;
        rows.into_iter().map(table_row_to_checkpoint).collect()
    }

    /// This agent's checkpoints that are neither COMPLETE nor ERROR.
    pub async fn list_incomplete(
        &self,
        region: &str,
        agent_id: &str,
    ) -> Result<Vec<TableInitCheckpoint>> {
        Ok(self
            .list_for_region(region)
            .await?
            .into_iter()
            .filter(|c| c.agent_id == agent_id && c.awaits_copy())
            .collect())
    }

    /// Checkpoint a transfer of `table` should start from.
    ///
    /// - own record with matching id: returned as is
    /// - own record with a stale id: reset to NOT_START
    /// - no own record but a peer's: the peer's position is adopted under
    ///   `agent_id` and the peer's record deleted
    /// - nothing: a new NOT_START record
    ///
    /// The returned checkpoint is always persisted.
    pub async fn load_for_transfer(
        &self,
        region: &str,
        table: &TableInfo,
        agent_id: &str,
    ) -> Result<TableInitCheckpoint> {
        if let Some(own) = self.read(region, &table.name, agent_id).await? {
            if own.table_id == table.id {
                return Ok(own);
            }
            info!(
                table = %table.name,
                stored_id = own.table_id,
                current_id = table.id,
                "Table recreated since checkpoint, restarting copy"
            );
            let fresh = TableInitCheckpoint::not_started(region, table, agent_id);
            self.write(&fresh).await?;
            return Ok(fresh);
        }

        let peer = self
            .list_for_region(region)
            .await?
            .into_iter()
            .filter(|c| c.table_name == table.name && c.agent_id != agent_id)
            .max_by_key(|c| c.updated_at);

        let mut checkpoint = TableInitCheckpoint::not_started(region, table, agent_id);
        if let Some(peer) = peer {
            if peer.table_id == table.id {
                info!(
                    table = %table.name,
                    peer = %peer.agent_id,
                    state = %peer.state,
                    "Taking over table checkpoint from peer"
                );
                checkpoint.resume_key = peer.resume_key.clone();
                checkpoint.state = peer.state;
                checkpoint.error = peer.error.clone();
            }
            self.write(&checkpoint).await?;
            self.delete(region, &peer.table_name, &peer.agent_id).await?;
        } else {
            self.write(&checkpoint).await?;
        }
        Ok(checkpoint)
    }

    /// Prepare a table for a new INITIALIZE request.
    ///
    /// Keeps a resumable checkpoint with a matching id, otherwise writes a
    /// fresh NOT_START record.
    pub async fn reset_for_init(
        &self,
        region: &str,
        table: &TableInfo,
        agent_id: &str,
    ) -> Result<TableInitCheckpoint> {
        if let Some(existing) = self.read(region, &table.name, agent_id).await? {
            if existing.table_id == table.id && existing.state.is_resumable() {
                debug!(table = %table.name, state = %existing.state, "Reusing checkpoint");
                return Ok(existing);
            }
        }
        let fresh = TableInitCheckpoint::not_started(region, table, agent_id);
        self.write(&fresh).await?;
        Ok(fresh)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stream checkpoints
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist one row per shard of `position` for this agent.
    pub async fn write_stream_checkpoint(
        &self,
        agent_id: &str,
        source_region: &str,
        position: &StreamPosition,
    ) -> Result<usize> {
        let pool = &self.pool;
        let now = chrono::Utc::now().timestamp_millis();
        let mut written = 0;

        for (shard, token) in position.shards() {
            execute_with_retry("stream_checkpoint_write", || async {
                sqlx::query(
                    r#"
                    INSERT INTO stream_checkpoints (agent_id, source_region, shard, token, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(agent_id, source_region, shard) DO UPDATE SET
                        token = excluded.token,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(agent_id)
                .bind(source_region)
                .bind(shard as i64)
                .bind(token)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;
            written += 1;
        }

        debug!(agent_id, source_region, shards = written, "Stream checkpoint written");
        Ok(written)
    }

    /// This agent's stream position, `None` if it never checkpointed.
    pub async fn read_stream_checkpoint(
        &self,
        agent_id: &str,
        source_region: &str,
    ) -> Result<Option<StreamPosition>> {
        let records: Vec<_> = self
            .list_stream_checkpoints(source_region)
            .await?
            .into_iter()
            .filter(|r| r.agent_id == agent_id)
            .collect();
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(StreamPosition::from_shards(
            records.into_iter().map(|r| (r.shard, r.token)),
        )))
    }

    /// Stream checkpoints of every agent streaming `source_region`.
    pub async fn list_stream_checkpoints(
        &self,
        source_region: &str,
    ) -> Result<Vec<StreamCheckpointRecord>> {
        let pool = &self.pool;
        let rows: Vec<(String, String, i64, String, i64)> =
            execute_with_retry("stream_checkpoint_list", || async {
                sqlx::query_as(
                    "SELECT agent_id, source_region, shard, token, updated_at \
                     FROM stream_checkpoints WHERE source_region = ? ORDER BY agent_id, shard",
                )
                .bind(source_region)
                .fetch_all(pool)
                .await
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(agent_id, source_region, shard, token, updated_at)| StreamCheckpointRecord {
                agent_id,
                source_region,
                shard: shard as ShardId,
                token,
                updated_at,
            })
            .collect())
    }

    pub async fn delete_stream_checkpoint(&self, agent_id: &str, source_region: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("stream_checkpoint_delete", || async {
            sqlx::query("DELETE FROM stream_checkpoints WHERE agent_id = ? AND source_region = ?")
                .bind(agent_id)
                .bind(source_region)
                .execute(pool)
                .await
        })
        .await?;
        info!(agent_id, source_region, "Deleted stream checkpoint");
        Ok(())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn wal_checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = self.wal_checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}
