//! Fuzz target for stream position reconciliation.
//!
//! Arbitrary peer records must never panic, and the chosen position may
//! only cover the requested shards with tokens that some record carried.

#![no_main]

use libfuzzer_sys::fuzz_target;
use region_agent::checkpoint::StreamCheckpointRecord;
use region_agent::reconcile::reconcile_position;

fuzz_target!(|data: (Vec<(u8, u32, i64, String)>, Vec<u32>)| {
    let (raw, mine) = data;
    let records: Vec<StreamCheckpointRecord> = raw
        .into_iter()
        .map(|(agent, shard, updated_at, token)| StreamCheckpointRecord {
            agent_id: format!("agent-{agent}"),
            source_region: "remote".to_string(),
            shard,
            token,
            updated_at,
        })
        .collect();

    let Some(pos) = reconcile_position(&records, &mine) else {
        assert!(!records.iter().any(|r| mine.contains(&r.shard)));
        return;
    };
    for (shard, token) in pos.shards() {
        assert!(mine.contains(&shard));
        let newest = records
            .iter()
            .filter(|r| r.shard == shard)
            .map(|r| r.updated_at)
            .max();
        assert!(records
            .iter()
            .any(|r| r.shard == shard && r.token == token && Some(r.updated_at) == newest));
    }
});
