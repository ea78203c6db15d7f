//! Property-based tests using proptest.
//!
//! Shard assignment, position reconciliation and transfer resumption must
//! hold for arbitrary groups, record sets and interruption points.

use proptest::prelude::*;
use region_agent::checkpoint::{CheckpointState, CheckpointStore, StreamCheckpointRecord};
use region_agent::config::TransferConfig;
use region_agent::memory::{MemoryRegion, MemoryTarget};
use region_agent::metrics::MetricsRegistry;
use region_agent::reconcile::{assigned_shards, reconcile_position};
use region_agent::transfer::{stop_channel, TableTransferWorker, TransferContext};
use region_agent::ShardId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

// =============================================================================
// Shard Assignment Properties
// =============================================================================

proptest! {
    /// Every shard belongs to exactly one agent of the group.
    #[test]
    fn shard_assignment_partitions(
        shards in prop::collection::btree_set(0u32..512, 0..64),
        group_size in 1u32..9,
    ) {
        let all: Vec<ShardId> = shards.iter().copied().collect();
        let mut seen: BTreeSet<ShardId> = BTreeSet::new();
        for idx in 0..group_size {
            for shard in assigned_shards(&all, idx, group_size) {
                prop_assert!(seen.insert(shard), "shard {} assigned twice", shard);
            }
        }
        prop_assert_eq!(seen, shards);
    }

    /// Assignment does not depend on the order shards are listed in.
    #[test]
    fn shard_assignment_order_independent(
        mut shards in prop::collection::vec(0u32..512, 0..64),
        group_size in 1u32..9,
        idx_seed in any::<u32>(),
    ) {
        let idx = idx_seed % group_size;
        let forward = assigned_shards(&shards, idx, group_size);
        shards.reverse();
        let backward = assigned_shards(&shards, idx, group_size);
        prop_assert_eq!(forward, backward);
    }
}

// =============================================================================
// Position Reconciliation Properties
// =============================================================================

fn record_strategy() -> impl Strategy<Value = StreamCheckpointRecord> {
    (0u8..4, 0u32..16, 0i64..1_000).prop_map(|(agent, shard, updated_at)| StreamCheckpointRecord {
        agent_id: format!("agent-{agent}"),
        source_region: "remote".to_string(),
        shard,
        token: format!("{agent}:{shard}:{updated_at}"),
        updated_at,
    })
}

proptest! {
    /// The reconciled position covers exactly my shards that have records.
    #[test]
    fn reconcile_covers_only_assigned_shards(
        records in prop::collection::vec(record_strategy(), 0..40),
        mine in prop::collection::btree_set(0u32..16, 0..16),
    ) {
        let mine: Vec<ShardId> = mine.into_iter().collect();
        let expected: BTreeSet<ShardId> = records
            .iter()
            .map(|r| r.shard)
            .filter(|s| mine.contains(s))
            .collect();

        match reconcile_position(&records, &mine) {
            None => prop_assert!(expected.is_empty()),
            Some(pos) => {
                let covered: BTreeSet<ShardId> = pos.shards().map(|(s, _)| s).collect();
                prop_assert_eq!(covered, expected);
            }
        }
    }

    /// Each shard resumes from its most recently written record.
    #[test]
    fn reconcile_picks_newest_per_shard(
        records in prop::collection::vec(record_strategy(), 1..40),
    ) {
        let mine: Vec<ShardId> = (0..16).collect();
        let Some(pos) = reconcile_position(&records, &mine) else {
            return Err(TestCaseError::fail("records present but no position"));
        };

        let mut newest: HashMap<ShardId, i64> = HashMap::new();
        for r in &records {
            let e = newest.entry(r.shard).or_insert(r.updated_at);
            *e = (*e).max(r.updated_at);
        }
        for (shard, token) in pos.shards() {
            let chosen = records
                .iter()
                .find(|r| r.shard == shard && r.token == token)
                .map(|r| r.updated_at);
            prop_assert_eq!(chosen, newest.get(&shard).copied());
        }
    }
}

// =============================================================================
// Transfer Resumption Properties
// =============================================================================

fn transfer_config(batch_size: usize, checkpoint_rows: u64) -> TransferConfig {
    TransferConfig {
        batch_size,
        checkpoint_rows,
        checkpoint_interval: "1h".into(),
        retry_backoff: "1ms".into(),
        include_tombstones: true,
        rows_per_sec: None,
        stop_grace: "1s".into(),
    }
}

/// Copy `rows` rows after a prior run stopped at `resumed_at`, with
/// `faults` transient scan timeouts along the way. Returns the sorted keys
/// in the target, the number of puts, and the final checkpoint.
fn run_resumed_copy(
    rows: usize,
    resumed_at: Option<usize>,
    faults: usize,
    batch_size: usize,
    checkpoint_rows: u64,
) -> (Vec<Vec<u8>>, u64, CheckpointState, Vec<u8>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async move {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CheckpointStore::new(dir.path().join("cp.db")).await.unwrap());
        let region = Arc::new(MemoryRegion::new());
        let target = Arc::new(MemoryTarget::new());
        let table = region.create_table("t", 1, 1);
        region.insert_rows("t", rows);

        if let Some(idx) = resumed_at {
            let mut cp = region_agent::TableInitCheckpoint::not_started("remote", &table, "a0");
            cp.state = CheckpointState::InProgress;
            cp.resume_key = format!("k{:06}", idx).into_bytes();
            store.write(&cp).await.unwrap();
        }
        region.timeout_next_scans(faults);

        let ctx = Arc::new(TransferContext::new(
            "remote",
            "a0",
            region.clone(),
            target.clone(),
            store.clone(),
            Arc::new(MetricsRegistry::new()),
            transfer_config(batch_size, checkpoint_rows),
        ));
        let (_stop, stop_rx) = stop_channel();
        let outcome = TableTransferWorker::new(ctx, table, stop_rx).run().await;
        assert!(outcome.is_done(), "unexpected outcome {outcome:?}");

        let mut keys: Vec<Vec<u8>> = target.rows("t").into_iter().map(|r| r.key).collect();
        keys.sort();
        let cp = store.read("remote", "t", "a0").await.unwrap().unwrap();
        (keys, target.put_count(), cp.state, cp.resume_key)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// A resumed copy writes exactly the rows after the checkpointed key.
    #[test]
    fn resumed_copy_writes_only_remaining_rows(
        rows in 1usize..120,
        cut in any::<prop::sample::Index>(),
        batch_size in 1usize..32,
        checkpoint_rows in 1u64..40,
    ) {
        let resumed_at = cut.index(rows);
        let (keys, puts, state, resume_key) =
            run_resumed_copy(rows, Some(resumed_at), 0, batch_size, checkpoint_rows);

        let expected: Vec<Vec<u8>> = ((resumed_at + 1)..rows)
            .map(|i| format!("k{:06}", i).into_bytes())
            .collect();
        prop_assert_eq!(puts as usize, expected.len());
        prop_assert_eq!(keys, expected);
        prop_assert_eq!(state, CheckpointState::Complete);
        prop_assert_eq!(resume_key, format!("k{:06}", rows - 1).into_bytes());
    }

    /// Transient scan faults never lose or invent rows.
    #[test]
    fn transient_faults_copy_every_row(
        rows in 0usize..120,
        faults in 0usize..5,
        batch_size in 1usize..32,
        checkpoint_rows in 1u64..40,
    ) {
        let (keys, puts, state, _) = run_resumed_copy(rows, None, faults, batch_size, checkpoint_rows);

        let expected: Vec<Vec<u8>> = (0..rows).map(|i| format!("k{:06}", i).into_bytes()).collect();
        prop_assert!(puts as usize >= rows);
        prop_assert_eq!(keys, expected);
        prop_assert_eq!(state, CheckpointState::Complete);
    }
}
