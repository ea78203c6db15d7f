// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stream position reconciliation across cooperating agents.
//!
//! When an agent starts a stream in resume mode without a stream checkpoint
//! of its own (first start, or shards were re-partitioned), it seeds its
//! start position from whatever the other agents of the group persisted:
//!
//! ```text
//! peer records ──► keep shards assigned to me ──► newest row per shard ──► StreamPosition
//! ```
//!
//! Pure functions only. The caller does the I/O.

use crate::checkpoint::StreamCheckpointRecord;
use crate::types::{ShardId, StreamPosition};
use std::collections::BTreeMap;

/// Shards owned by agent `agent_index` in a group of `group_size`.
pub fn assigned_shards(all: &[ShardId], agent_index: u32, group_size: u32) -> Vec<ShardId> {
    let size = group_size.max(1);
    let mut mine: Vec<ShardId> = all
        .iter()
        .copied()
        .filter(|s| s % size == agent_index % size)
        .collect();
    mine.sort_unstable();
    mine.dedup();
    mine
}

/// Merge peer stream checkpoints into a start position for `my_shards`.
///
/// Last writer by `updated_at` wins per shard. Ties keep the record that
/// appears first. Returns `None` when no record covers any of `my_shards`.
pub fn reconcile_position(
    records: &[StreamCheckpointRecord],
    my_shards: &[ShardId],
) -> Option<StreamPosition> {
    let mut newest: BTreeMap<ShardId, &StreamCheckpointRecord> = BTreeMap::new();

    for record in records.iter().filter(|r| my_shards.contains(&r.shard)) {
        match newest.get(&record.shard) {
            Some(current) if current.updated_at >= record.updated_at => {}
            _ => {
                newest.insert(record.shard, record);
            }
        }
    }

    if newest.is_empty() {
        return None;
    }

    Some(StreamPosition::from_shards(
        newest.into_iter().map(|(shard, r)| (shard, r.token.clone())),
    ))
}
