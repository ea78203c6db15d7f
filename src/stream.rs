// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-stream contract.
//!
//! The stream client owns the wire protocol, shard assignment and delivery of
//! row changes to the local store. The agent only needs the lifecycle
//! surface defined here:
//!
//! ```text
//! ChangeStreamClient::subscribe(StreamConfig) ──► Subscription
//!                                                  ├─ add_table / remove_table ──► ChangeHandle
//!                                                  ├─ cancel / is_canceled
//!                                                  └─ current_position / checkpoint
//! ```
//!
//! Membership changes complete asynchronously across all shards. The
//! returned [`ChangeHandle`] resolves once every shard applied the change,
//! and the agent never issues a second change on a subscription while a
//! previous handle is still pending.

use crate::types::{ShardId, StreamPosition, TableInfo};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Boxed future returned by stream client calls.
pub type StreamFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StreamError>> + Send + 'a>>;

/// Errors reported by the change-stream client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Source region not reachable. Retried with fixed backoff.
    #[error("source unreachable: {0}")]
    Unreachable(String),

    /// The source no longer retains the requested start position.
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),

    /// The stream is in a state the client cannot recover from.
    #[error("stream rejected: {0}")]
    Rejected(String),

    /// Invalid stream settings.
    #[error("invalid stream config: {0}")]
    Config(String),

    /// Operation on a canceled subscription.
    #[error("subscription canceled")]
    Canceled,

    #[error("{0}")]
    Other(String),
}

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Resume from the persisted stream checkpoint (or `start`, when given).
    ResumeFromCheckpoint,
    /// Start at the current head. Used before a snapshot copy so no write
    /// after the copy start is missed.
    FromNow,
}

/// Parameters for [`ChangeStreamClient::subscribe`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub source_region: String,
    pub agent_id: String,
    /// Shards this agent streams.
    pub shards: Vec<ShardId>,
    pub tables: Vec<TableInfo>,
    pub mode: StreamMode,
    /// Explicit start position. Only consulted in resume mode.
    pub start: Option<StreamPosition>,
}

/// Client for the source region's change stream.
pub trait ChangeStreamClient: Send + Sync + 'static {
    /// Open a subscription. Fails with `Unreachable` while the source is down.
    fn subscribe(&self, config: StreamConfig) -> StreamFuture<'_, Arc<dyn Subscription>>;

    /// All shards of the source region.
    fn source_shards(&self) -> StreamFuture<'_, Vec<ShardId>>;
}

/// A live subscription.
pub trait Subscription: Send + Sync + 'static {
    /// Graft a table into the stream.
    fn add_table(&self, table: &TableInfo) -> Result<ChangeHandle, StreamError>;

    /// Drop a table from the stream.
    fn remove_table(&self, table: &TableInfo) -> Result<ChangeHandle, StreamError>;

    /// True if a table with this name and id is part of the stream.
    fn contains(&self, table: &TableInfo) -> bool;

    fn tables(&self) -> Vec<TableInfo>;

    fn cancel(&self);

    fn is_canceled(&self) -> bool;

    fn current_position(&self) -> StreamPosition;

    /// Acknowledge that everything up to `position` is durable locally.
    fn checkpoint(&self, position: &StreamPosition) -> StreamFuture<'_, ()>;
}

/// Outcome of waiting on a [`ChangeHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeWait {
    Done(StreamPosition),
    Failed(StreamError),
    /// Still in flight after the budget. The handle stays usable.
    Pending,
}

/// Completion signal of one membership change.
#[derive(Debug)]
pub struct ChangeHandle {
    table: String,
    rx: Option<oneshot::Receiver<Result<StreamPosition, StreamError>>>,
}

impl ChangeHandle {
    /// Handle plus the sender the client completes it with.
    pub fn channel(
        table: impl Into<String>,
    ) -> (Self, oneshot::Sender<Result<StreamPosition, StreamError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                table: table.into(),
                rx: Some(rx),
            },
            tx,
        )
    }

    /// Handle that is already complete.
    pub fn completed(table: impl Into<String>, position: StreamPosition) -> Self {
        let (handle, tx) = Self::channel(table);
        let _ = tx.send(Ok(position));
        handle
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Wait up to `budget` for the change to complete.
    ///
    /// Returns [`ChangeWait::Pending`] on timeout, in which case the caller
    /// may keep the handle and wait again later.
    pub async fn wait(&mut self, budget: Duration) -> ChangeWait {
        let Some(rx) = self.rx.as_mut() else {
            return ChangeWait::Failed(StreamError::Other("change already consumed".into()));
        };
        match tokio::time::timeout(budget, rx).await {
            Err(_) => ChangeWait::Pending,
            Ok(result) => {
                self.rx = None;
                match result {
                    Ok(Ok(position)) => ChangeWait::Done(position),
                    Ok(Err(e)) => ChangeWait::Failed(e),
                    Err(_) => ChangeWait::Failed(StreamError::Canceled),
                }
            }
        }
    }
}
