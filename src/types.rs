// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core value types shared by the agent, the transfer worker and the
//! external collaborators.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Numeric identifier of a source shard.
pub type ShardId = u32;

/// A replicated table as seen at one point in time.
///
/// The `id` changes when a table is dropped and recreated under the same
/// name, which is how the agent detects a stale checkpoint or a stale
/// stream membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableInfo {
    /// Full table name. Child tables use dotted names (`parent.child`).
    pub name: String,
    /// Numeric table id assigned by the owning region.
    pub id: u64,
    /// Schema version of the cached table definition.
    pub schema_version: u32,
}

impl TableInfo {
    pub fn new(name: impl Into<String>, id: u64, schema_version: u32) -> Self {
        Self {
            name: name.into(),
            id,
            schema_version,
        }
    }

    /// True if `other` is this table or one of its descendants.
    pub fn is_ancestor_of(&self, other: &str) -> bool {
        other == self.name
            || (other.len() > self.name.len()
                && other.starts_with(self.name.as_str())
                && other.as_bytes()[self.name.len()] == b'.')
    }
}

impl std::fmt::Display for TableInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(id={}, v{})", self.name, self.id, self.schema_version)
    }
}

/// A single row read from a source table.
///
/// Keys are compared bytewise; that is the primary-key order of every scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Soft-deleted row. Copied so the target converges on the delete.
    pub tombstone: bool,
    /// Last modification time at the source (millis since epoch).
    pub modified_at: i64,
}

impl Row {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            tombstone: false,
            modified_at: 0,
        }
    }

    pub fn tombstone(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            tombstone: true,
            modified_at: 0,
        }
    }
}

/// Position in the change stream, one opaque token per shard.
///
/// Owned by the stream client. The agent only stores, merges and hands
/// these back when resuming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    shards: BTreeMap<ShardId, String>,
}

impl StreamPosition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_shards(entries: impl IntoIterator<Item = (ShardId, String)>) -> Self {
        Self {
            shards: entries.into_iter().collect(),
        }
    }

    pub fn set(&mut self, shard: ShardId, token: impl Into<String>) {
        self.shards.insert(shard, token.into());
    }

    pub fn get(&self, shard: ShardId) -> Option<&str> {
        self.shards.get(&shard).map(String::as_str)
    }

    pub fn shards(&self) -> impl Iterator<Item = (ShardId, &str)> {
        self.shards.iter().map(|(s, t)| (*s, t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}
