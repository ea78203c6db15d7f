//! Fuzz target for shard assignment across an agent group.
//!
//! Every listed shard must land on exactly one agent, whatever the group
//! size or the shard list looks like.

#![no_main]

use libfuzzer_sys::fuzz_target;
use region_agent::reconcile::assigned_shards;
use std::collections::BTreeSet;

fuzz_target!(|data: (Vec<u32>, u8)| {
    let (shards, group) = data;
    let group_size = u32::from(group).max(1);

    let mut seen = BTreeSet::new();
    for idx in 0..group_size {
        for shard in assigned_shards(&shards, idx, group_size) {
            assert!(seen.insert(shard), "shard {shard} assigned twice");
        }
    }
    let expected: BTreeSet<u32> = shards.into_iter().collect();
    assert_eq!(seen, expected);
});
