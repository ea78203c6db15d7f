// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: inject source, target and stream faults and verify the
//! agent degrades the way its error table says it should.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{eventually, wait_for, Harness, REGION};
use region_agent::checkpoint::CheckpointState;
use region_agent::{AgentStatus, ErrorClass, RequestOutcome, RequestTicket};
use std::time::Duration;

const AGENT: &str = "agent-0";
const WAIT: Duration = Duration::from_secs(5);

async fn outcome(ticket: RequestTicket) -> RequestOutcome {
    tokio::time::timeout(Duration::from_secs(10), ticket.wait())
        .await
        .expect("request never answered")
}

fn failed_with(outcome: &RequestOutcome, expected: ErrorClass) -> bool {
    matches!(outcome, RequestOutcome::Failed { class, .. } if *class == expected)
}

async fn streaming(h: &Harness) {
    let o = outcome(h.agent.create_stream(Vec::new()).await.unwrap()).await;
    assert!(o.is_success(), "{o:?}");
}

// =============================================================================
// Source and Target Faults
// =============================================================================

/// Test: An unreachable source during lookup and scan only delays the copy
#[tokio::test]
async fn unreachable_source_delays_initialize() {
    let h = Harness::start(1).await;
    let t = h.world.region.create_table("t", 1, 1);
    h.world.region.insert_rows("t", 120);
    h.world.region.fail_next(6);

    let o = outcome(h.agent.initialize_tables(vec![t]).await.unwrap()).await;
    assert!(o.is_success(), "{o:?}");
    assert_eq!(h.world.target.row_count("t"), 120);
    h.agent.shutdown().await;
}

/// Test: Scan timeouts rescan from the last checkpoint without losing rows
#[tokio::test]
async fn scan_timeouts_rescan_from_checkpoint() {
    let h = Harness::start(1).await;
    let t = h.world.region.create_table("t", 1, 1);
    h.world.region.insert_rows("t", 200);
    h.world.region.timeout_next_scans(4);

    let o = outcome(h.agent.initialize_tables(vec![t]).await.unwrap()).await;
    assert!(o.is_success(), "{o:?}");
    assert_eq!(h.world.target.row_count("t"), 200);

    let cp = h
        .agent
        .checkpoint_store()
        .read(REGION, "t", AGENT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cp.state, CheckpointState::Complete);
    assert_eq!(cp.resume_key, b"k000199".to_vec());
    h.agent.shutdown().await;
}

/// Test: Failing target writes are retried on the transfer lane
#[tokio::test]
async fn failing_puts_are_retried() {
    let h = Harness::start(1).await;
    streaming(&h).await;

    let t = h.world.region.create_table("t", 1, 1);
    h.world.region.insert_rows("t", 80);
    h.world.target.fail_next_puts(3);

    let o = outcome(h.agent.add_tables(vec![t]).await.unwrap()).await;
    assert!(o.is_success(), "{o:?}");
    assert!(wait_for(WAIT, || h.world.target.row_count("t") == 80).await);
    assert!(h.world.target.put_count() >= 80);
    h.agent.shutdown().await;
}

/// Test: A non-retryable scan error fails the request and stops the agent
#[tokio::test]
async fn fatal_scan_stops_agent() {
    let h = Harness::start(1).await;
    let t = h.world.region.create_table("t", 1, 1);
    h.world.region.insert_rows("t", 10);
    h.world.region.set_fatal_scan(Some("volume unreadable"));

    let o = outcome(h.agent.initialize_tables(vec![t.clone()]).await.unwrap()).await;
    assert!(failed_with(&o, ErrorClass::Fatal), "{o:?}");

    let exit = tokio::time::timeout(WAIT, h.agent.join()).await.expect("agent did not exit");
    assert!(exit.is_err());

    let cp = h
        .agent
        .checkpoint_store()
        .read(REGION, "t", AGENT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cp.state, CheckpointState::Error);
    assert!(cp.error.unwrap_or_default().contains("volume unreadable"));

    // A stopped agent takes no more requests.
    assert!(h.agent.add_tables(vec![t]).await.is_err());
    h.agent.shutdown().await;
}

/// Test: A transfer slower than its slot is re-queued and resumes
#[tokio::test]
async fn slow_transfer_is_requeued_until_complete() {
    let h = Harness::start_with(1, |c| c.poller.transfer_timeout = "60ms".into()).await;
    streaming(&h).await;

    let t = h.world.region.create_table("slow", 2, 1);
    h.world.region.insert_rows("slow", 300);
    h.world.region.set_scan_delay(Duration::from_millis(5));

    let o = outcome(h.agent.add_tables(vec![t]).await.unwrap()).await;
    assert!(o.is_success(), "{o:?}");
    assert!(
        eventually(Duration::from_secs(10), || async {
            h.agent
                .checkpoint_store()
                .read(REGION, "slow", AGENT)
                .await
                .unwrap()
                .is_some_and(|cp| cp.is_complete())
        })
        .await
    );
    assert_eq!(h.world.target.row_count("slow"), 300);
    assert!(h.agent.metrics().current().get("slow").map(|s| s.attempts).unwrap_or(0) > 1);
    h.agent.shutdown().await;
}

// =============================================================================
// Stream Faults
// =============================================================================

/// Test: A hung membership change times out, keeps the stream, and blocks
/// further changes until it drains
#[tokio::test]
async fn hung_change_is_single_flight() {
    let h = Harness::start(1).await;
    streaming(&h).await;
    let a = h.world.region.create_table("a", 1, 1);
    let b = h.world.region.create_table("b", 2, 1);
    h.world.client.set_hang_changes(true);

    let first = outcome(h.agent.add_tables(vec![a]).await.unwrap()).await;
    assert!(failed_with(&first, ErrorClass::ChangeTimeout), "{first:?}");
    assert_eq!(h.agent.status(), AgentStatus::Streaming);

    let second = outcome(h.agent.add_tables(vec![b.clone()]).await.unwrap()).await;
    assert!(failed_with(&second, ErrorClass::ChangeTimeout), "{second:?}");

    let sub = h.world.client.current().unwrap();
    assert_eq!(sub.change_calls(), 1);

    h.world.client.set_hang_changes(false);
    sub.release_hung();
    let third = outcome(h.agent.add_tables(vec![b]).await.unwrap()).await;
    assert!(third.is_success(), "{third:?}");
    assert_eq!(sub.change_calls(), 2);
    assert_eq!(sub.max_changes_in_flight(), 1);
    assert_eq!(h.world.client.subscribe_count(), 1);
    h.agent.shutdown().await;
}

/// Test: A rejected change cancels the stream and the agent reconnects
#[tokio::test]
async fn rejected_change_reconnects_stream() {
    let h = Harness::start(1).await;
    streaming(&h).await;
    let t = h.world.region.create_table("t", 1, 1);
    h.world.client.set_reject_changes(true);

    let o = outcome(h.agent.add_tables(vec![t.clone()]).await.unwrap()).await;
    assert!(failed_with(&o, ErrorClass::StreamRejected), "{o:?}");

    assert!(wait_for(WAIT, || h.world.client.subscribe_count() >= 2).await);
    assert!(wait_for(WAIT, || h.agent.status() == AgentStatus::Streaming).await);

    h.world.client.set_reject_changes(false);
    let retry = outcome(h.agent.add_tables(vec![t]).await.unwrap()).await;
    assert!(retry.is_success(), "{retry:?}");
    h.agent.shutdown().await;
}

/// Test: A rejected subscription is answered and then retried in the
/// background
#[tokio::test]
async fn rejected_subscribe_reconnects() {
    let h = Harness::start(1).await;
    h.world.client.reject_next_subscribes(1);

    let o = outcome(h.agent.create_stream(Vec::new()).await.unwrap()).await;
    assert!(failed_with(&o, ErrorClass::StreamRejected), "{o:?}");

    assert!(wait_for(WAIT, || h.agent.status() == AgentStatus::Streaming).await);
    assert!(h.world.client.configs().len() >= 2);
    h.agent.shutdown().await;
}

/// Test: Shutdown interrupts a change wait instead of sitting out its budget
#[tokio::test]
async fn shutdown_interrupts_hung_change() {
    let h = Harness::start_with(1, |c| c.stream.change_timeout_per_shard = "30s".into()).await;
    streaming(&h).await;
    let t = h.world.region.create_table("t", 1, 1);
    h.world.client.set_hang_changes(true);

    let ticket = h.agent.add_tables(vec![t]).await.unwrap();
    assert!(
        wait_for(WAIT, || {
            h.world.client.current().map(|s| s.change_calls()).unwrap_or(0) == 1
        })
        .await
    );

    let started = std::time::Instant::now();
    h.agent.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let o = outcome(ticket).await;
    assert_eq!(o.label(), "stopped");
    assert_eq!(h.agent.status(), AgentStatus::Canceled);
}

/// Test: Requests racing a dropped table settle without wedging the loop
#[tokio::test]
async fn table_dropped_mid_copy_is_abandoned() {
    let h = Harness::start(1).await;
    streaming(&h).await;
    let t = h.world.region.create_table("t", 1, 1);
    h.world.region.insert_rows("t", 400);
    h.world.region.set_scan_delay(Duration::from_millis(5));

    let o = outcome(h.agent.add_tables(vec![t]).await.unwrap()).await;
    assert!(o.is_success(), "{o:?}");
    assert!(wait_for(WAIT, || h.world.target.row_count("t") > 0).await);
    h.world.region.drop_table("t");

    // The loop keeps serving requests.
    let other = h.world.region.create_table("other", 5, 1);
    let next = outcome(h.agent.add_tables(vec![other]).await.unwrap()).await;
    assert!(next.is_success(), "{next:?}");
    assert!(h.world.target.row_count("t") < 400);

    h.agent.shutdown().await;
}
