// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row access interfaces for the source and target regions.
//!
//! The agent never talks to storage directly. The owning service hands it
//! implementations of these traits:
//!
//! - [`SourceRegion`]: table metadata lookup and ordered, resumable scans
//!   of the remote region
//! - [`TargetStore`]: point writes into the local region
//! - [`AgentGroup`]: readiness of the other agents that stream shards of
//!   the same source region
//!
//! # Example
//!
//! ```rust,no_run
//! use region_agent::region::{BoxFuture, RegionResult, TargetStore};
//! use region_agent::types::{Row, TableInfo};
//!
//! struct Discard;
//!
//! impl TargetStore for Discard {
//!     fn put(&self, _table: &TableInfo, _row: Row) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn table_info(&self, _name: &str) -> BoxFuture<'_, Option<TableInfo>> {
//!         Box::pin(async { Ok(None) })
//!     }
//! }
//! ```

use crate::types::{Row, TableInfo};
use std::future::Future;
use std::pin::Pin;

/// Result type for region operations.
pub type RegionResult<T> = std::result::Result<T, RegionError>;

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RegionResult<T>> + Send + 'a>>;

/// Errors reported by region implementations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegionError {
    /// The region could not be reached. Always transient.
    #[error("region unavailable: {0}")]
    Unavailable(String),

    /// A read or write timed out inside the store.
    #[error("store timeout: {0}")]
    Timeout(String),

    /// The table does not exist (dropped, or not yet created).
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Anything the store reports as permanent.
    #[error("store failure: {0}")]
    Fatal(String),
}

impl RegionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Read side: the remote region a table is initialized from.
pub trait SourceRegion: Send + Sync + 'static {
    /// Look up a table at the source. `None` means it does not exist.
    fn table_info(&self, name: &str) -> BoxFuture<'_, Option<TableInfo>>;

    /// Read up to `limit` rows strictly after `after` in primary-key order.
    ///
    /// `after = None` starts from the first row. An empty result means the
    /// scan is exhausted. Implementations must return a snapshot-consistent
    /// forward view and honor `include_tombstones`.
    fn scan(
        &self,
        table: &TableInfo,
        after: Option<Vec<u8>>,
        limit: usize,
        include_tombstones: bool,
    ) -> BoxFuture<'_, Vec<Row>>;
}

/// Write side: the local region rows are copied into.
pub trait TargetStore: Send + Sync + 'static {
    /// Write a row (or tombstone) to the target table.
    fn put(&self, table: &TableInfo, row: Row) -> BoxFuture<'_, ()>;

    /// Look up the local definition of a table.
    fn table_info(&self, name: &str) -> BoxFuture<'_, Option<TableInfo>>;

    /// Whether a source table definition can be replicated into the local
    /// table. Schema comparison lives with the owning service.
    fn is_compatible(&self, _source: &TableInfo) -> BoxFuture<'_, bool> {
        Box::pin(async { Ok(true) })
    }
}

/// View of the cooperating agents of the same source region.
pub trait AgentGroup: Send + Sync + 'static {
    /// True once every agent in the group reports the table as streaming.
    fn is_streaming_everywhere(&self, table: &TableInfo) -> BoxFuture<'_, bool>;
}

/// Group view for single-agent deployments: always ready.
#[derive(Debug, Clone, Default)]
pub struct SingleAgentGroup;

impl AgentGroup for SingleAgentGroup {
    fn is_streaming_everywhere(&self, _table: &TableInfo) -> BoxFuture<'_, bool> {
        Box::pin(async { Ok(true) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_error_retryable() {
        assert!(RegionError::Unavailable("x".into()).is_retryable());
        assert!(RegionError::Timeout("x".into()).is_retryable());
        assert!(!RegionError::TableNotFound("t".into()).is_retryable());
        assert!(!RegionError::Fatal("x".into()).is_retryable());
    }

    #[test]
    fn test_region_error_display() {
        let err = RegionError::TableNotFound("users".into());
        assert_eq!(err.to_string(), "table not found: users");
    }

    #[tokio::test]
    async fn test_single_agent_group_always_ready() {
        let group = SingleAgentGroup;
        let t = TableInfo::new("t", 1, 1);
        assert!(group.is_streaming_everywhere(&t).await.unwrap());
    }
}
