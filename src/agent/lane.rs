// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transfer lane: runs table transfers one at a time.
//!
//! Every copy of the agent goes through this lane, whether the agent waits
//! for it (INITIALIZE) or not (ADD, poller admission). The lane owns the
//! table id → {queued, running} map, so a table is never copied by two
//! workers at once.
//!
//! ```text
//! enqueue ──► [queued jobs] ──► running worker ──► outcome
//!                  ▲                 │
//!                  └── tail ◄────────┘ slot expired (timed jobs only)
//! ```
//!
//! Jobs somebody waits on jump to the head of the queue and have no
//! deadline. Background jobs get `poller.transfer_timeout`; when it
//! expires the worker checkpoints, stops, and the job goes to the tail.

use super::actor::AgentEvent;
use super::types::TransferState;
use super::AgentShared;
use crate::metrics;
use crate::transfer::{
    stop_and_wait, stop_channel, StopReason, TableTransferWorker, TransferContext, TransferOutcome,
};
use crate::types::TableInfo;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

pub(crate) enum LaneCommand {
    Enqueue {
        table: TableInfo,
        done: Option<oneshot::Sender<TransferOutcome>>,
    },
    Cancel {
        table: String,
        ack: oneshot::Sender<()>,
    },
}

/// Sending side of the lane. Cheap to clone.
#[derive(Clone)]
pub(crate) struct LaneHandle {
    tx: mpsc::UnboundedSender<LaneCommand>,
}

impl LaneHandle {
    /// Queue a background copy. Ignored if the table is already queued or
    /// running.
    pub(crate) fn enqueue(&self, table: TableInfo) {
        let _ = self.tx.send(LaneCommand::Enqueue { table, done: None });
    }

    /// Copy `table` ahead of background work and wait for the final outcome.
    pub(crate) async fn run(&self, table: TableInfo) -> TransferOutcome {
        let (done, rx) = oneshot::channel();
        if self
            .tx
            .send(LaneCommand::Enqueue {
                table,
                done: Some(done),
            })
            .is_err()
        {
            return TransferOutcome::Shutdown;
        }
        rx.await.unwrap_or(TransferOutcome::Shutdown)
    }

    /// Drop any queued or running copy of `table`. Returns once a running
    /// worker has stopped, so nothing writes the table's checkpoint after.
    pub(crate) async fn cancel(&self, table: &str) {
        let (ack, rx) = oneshot::channel();
        let sent = self.tx.send(LaneCommand::Cancel {
            table: table.to_string(),
            ack,
        });
        if sent.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Job {
    table: TableInfo,
    timed: bool,
    waiters: Vec<oneshot::Sender<TransferOutcome>>,
}

impl Job {
    fn finish(self, outcome: &TransferOutcome) {
        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

pub(crate) struct TransferLane {
    ctx: Arc<TransferContext>,
    rx: mpsc::UnboundedReceiver<LaneCommand>,
    events: mpsc::UnboundedSender<AgentEvent>,
    shared: Arc<AgentShared>,
    queue: VecDeque<Job>,
    transfer_timeout: Duration,
    stop_grace: Duration,
    shutdown: watch::Receiver<bool>,
}

impl TransferLane {
    pub(crate) fn new(
        ctx: Arc<TransferContext>,
        events: mpsc::UnboundedSender<AgentEvent>,
        shared: Arc<AgentShared>,
        transfer_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, LaneHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop_grace = ctx.config.stop_grace_duration();
        let lane = Self {
            ctx,
            rx,
            events,
            shared,
            queue: VecDeque::new(),
            transfer_timeout,
            stop_grace,
            shutdown,
        };
        (lane, LaneHandle { tx })
    }

    pub(crate) async fn run(mut self) {
        let span = info_span!("transfer_lane");
        async move {
            debug!("Transfer lane started");
            loop {
                if *self.shutdown.borrow() {
                    break;
                }
                match self.queue.pop_front() {
                    Some(job) => {
                        if !self.run_job(job).await {
                            break;
                        }
                    }
                    None => {
                        tokio::select! {
                            biased;
                            changed = self.shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            cmd = self.rx.recv() => match cmd {
                                Some(cmd) => {
                                    if let Some(ack) = self.apply(cmd, None) {
                                        let _ = ack.send(());
                                    }
                                }
                                None => break,
                            },
                        }
                    }
                }
            }

            let dropped = self.queue.len();
            for job in self.queue.drain(..) {
                job.finish(&TransferOutcome::Shutdown);
            }
            self.rx.close();
            while let Ok(cmd) = self.rx.try_recv() {
                match cmd {
                    LaneCommand::Enqueue { done: Some(done), .. } => {
                        let _ = done.send(TransferOutcome::Shutdown);
                    }
                    LaneCommand::Enqueue { done: None, .. } => {}
                    LaneCommand::Cancel { ack, .. } => {
                        let _ = ack.send(());
                    }
                }
            }
            self.shared.clear_transfers();
            metrics::set_transfer_queue_depth(0);
            info!(dropped, "Transfer lane stopped");
        }
        .instrument(span)
        .await
    }

    /// Apply a command. `running` is the job currently on the worker, if any.
    ///
    /// Returns the cancel ack when the running job itself must be canceled;
    /// the caller sends it once the worker has stopped.
    fn apply(
        &mut self,
        cmd: LaneCommand,
        running: Option<&mut Job>,
    ) -> Option<oneshot::Sender<()>> {
        match cmd {
            LaneCommand::Enqueue { table, done } => {
                if let Some(job) = running {
                    if job.table.id == table.id {
                        debug!(table = %table.name, "Transfer already running");
                        job.waiters.extend(done);
                        return None;
                    }
                }
                if let Some(pos) = self.queue.iter().position(|j| j.table.id == table.id) {
                    debug!(table = %table.name, "Transfer already queued");
                    if let Some(done) = done {
                        if let Some(mut job) = self.queue.remove(pos) {
                            job.timed = false;
                            job.waiters.push(done);
                            self.queue.push_front(job);
                        }
                    }
                    return None;
                }

                self.shared.set_transfer(&table.name, TransferState::Queued);
                let job = Job {
                    timed: done.is_none(),
                    waiters: done.into_iter().collect(),
                    table,
                };
                if job.timed {
                    self.queue.push_back(job);
                } else {
                    self.queue.push_front(job);
                }
                metrics::set_transfer_queue_depth(self.queue.len());
                None
            }
            LaneCommand::Cancel { table, ack } => {
                let mut kept = VecDeque::with_capacity(self.queue.len());
                for job in self.queue.drain(..) {
                    if job.table.name == table {
                        debug!(table = %table, "Dropping queued transfer");
                        job.finish(&TransferOutcome::Abandoned);
                    } else {
                        kept.push_back(job);
                    }
                }
                self.queue = kept;
                metrics::set_transfer_queue_depth(self.queue.len());

                match running {
                    Some(job) if job.table.name == table => Some(ack),
                    _ => {
                        self.shared.remove_transfer(&table);
                        let _ = ack.send(());
                        None
                    }
                }
            }
        }
    }

    /// Run one job to an outcome. Returns `false` once the lane must stop.
    async fn run_job(&mut self, mut job: Job) -> bool {
        let name = job.table.name.clone();
        self.shared.set_transfer(&name, TransferState::Running);
        metrics::set_transfer_queue_depth(self.queue.len());

        let (stop_tx, stop_rx) = stop_channel();
        let worker = TableTransferWorker::new(self.ctx.clone(), job.table.clone(), stop_rx);
        let mut handle = tokio::spawn(worker.run());

        let deadline = job.timed.then(|| Instant::now() + self.transfer_timeout);
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        let mut cancel_ack = None;
        let finish = loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break Finish::Stop(StopReason::Shutdown);
                    }
                }
                joined = &mut handle => {
                    break Finish::Done(joined.unwrap_or_else(|e| TransferOutcome::Failed(e.to_string())));
                }
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(ack) = self.apply(cmd, Some(&mut job)) {
                            cancel_ack = Some(ack);
                            break Finish::Stop(StopReason::Cancel);
                        }
                    }
                    None => break Finish::Stop(StopReason::Shutdown),
                },
                _ = &mut expiry => {
                    info!(table = %name, timeout_ms = self.transfer_timeout.as_millis() as u64, "Transfer slot expired");
                    break Finish::Stop(StopReason::Timeout);
                }
            }
        };

        let outcome = match finish {
            Finish::Done(outcome) => outcome,
            Finish::Stop(reason) => {
                match stop_and_wait(&stop_tx, reason, &mut handle, self.stop_grace).await {
                    Some(outcome) => outcome,
                    None => {
                        warn!(table = %name, reason = ?reason, "Transfer did not stop within grace period, aborted");
                        match reason {
                            StopReason::Timeout => TransferOutcome::Stopped,
                            StopReason::Shutdown => TransferOutcome::Shutdown,
                            StopReason::Cancel => TransferOutcome::Abandoned,
                        }
                    }
                }
            }
        };

        let keep_going = outcome != TransferOutcome::Shutdown && !*self.shutdown.borrow();
        self.settle(job, outcome);
        if let Some(ack) = cancel_ack {
            let _ = ack.send(());
        }
        keep_going
    }

    /// Route a finished job's outcome to its waiters, the queue, or the agent.
    fn settle(&mut self, mut job: Job, outcome: TransferOutcome) {
        let name = job.table.name.clone();
        self.shared.remove_transfer(&name);

        match &outcome {
            TransferOutcome::Stopped => {
                self.shared.set_transfer(&name, TransferState::Queued);
                if job.waiters.is_empty() {
                    debug!(table = %name, "Re-queueing partially copied table");
                    self.queue.push_back(job);
                } else {
                    job.timed = false;
                    self.queue.push_front(job);
                }
                metrics::set_transfer_queue_depth(self.queue.len());
                return;
            }
            TransferOutcome::TableDropped => {
                let _ = self.events.send(AgentEvent::TableDropped(job.table.clone()));
            }
            TransferOutcome::Failed(message) if job.waiters.is_empty() => {
                let _ = self.events.send(AgentEvent::TransferFailed {
                    table: name.clone(),
                    message: message.clone(),
                });
            }
            _ => {}
        }
        job.finish(&outcome);
    }
}

enum Finish {
    Done(TransferOutcome),
    Stop(StopReason),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointState, CheckpointStore};
    use crate::config::TransferConfig;
    use crate::memory::{MemoryRegion, MemoryTarget};
    use crate::metrics::MetricsRegistry;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        region: Arc<MemoryRegion>,
        target: Arc<MemoryTarget>,
        store: Arc<CheckpointStore>,
        shared: Arc<AgentShared>,
        lane: LaneHandle,
        events: mpsc::UnboundedReceiver<AgentEvent>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn fixture(transfer_timeout: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CheckpointStore::new(dir.path().join("cp.db")).await.unwrap());
        let region = Arc::new(MemoryRegion::new());
        let target = Arc::new(MemoryTarget::new());
        let config = TransferConfig {
            batch_size: 8,
            checkpoint_rows: 8,
            retry_backoff: "5ms".into(),
            stop_grace: "500ms".into(),
            ..Default::default()
        };
        let ctx = Arc::new(TransferContext::new(
            "eu",
            "a0",
            region.clone(),
            target.clone(),
            store.clone(),
            Arc::new(MetricsRegistry::new()),
            config,
        ));
        let shared = Arc::new(AgentShared::default());
        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (lane, handle) = TransferLane::new(
            ctx,
            events_tx,
            shared.clone(),
            transfer_timeout,
            shutdown_rx,
        );
        let task = tokio::spawn(lane.run());
        Fixture {
            _dir: dir,
            region,
            target,
            store,
            shared,
            lane: handle,
            events,
            shutdown,
            task,
        }
    }

    #[tokio::test]
    async fn test_run_waits_for_completion() {
        let f = fixture(Duration::from_secs(5)).await;
        let t = f.region.create_table("users", 1, 1);
        f.region.insert_rows("users", 30);

        let outcome = f.lane.run(t).await;
        assert!(outcome.is_done());
        assert_eq!(f.target.row_count("users"), 30);
        assert!(f.shared.transfers().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_runs_once() {
        let f = fixture(Duration::from_secs(5)).await;
        let t = f.region.create_table("users", 1, 1);
        f.region.insert_rows("users", 40);
        f.region.set_scan_delay(Duration::from_millis(5));

        f.lane.enqueue(t.clone());
        f.lane.enqueue(t.clone());
        let outcome = f.lane.run(t).await;

        assert!(outcome.is_done());
        assert_eq!(f.region.max_concurrent_scans("users"), 1);
        assert_eq!(f.target.put_count(), 40);
    }

    #[tokio::test]
    async fn test_timed_job_is_requeued_and_finishes() {
        let f = fixture(Duration::from_millis(30)).await;
        let t = f.region.create_table("big", 1, 1);
        f.region.insert_rows("big", 120);
        f.region.set_scan_delay(Duration::from_millis(5));

        f.lane.enqueue(t);
        let done = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(cp) = f.store.read("eu", "big", "a0").await.unwrap() {
                    if cp.state == CheckpointState::Complete {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(done.is_ok());
        assert_eq!(f.target.row_count("big"), 120);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let f = fixture(Duration::from_secs(5)).await;
        let t = f.region.create_table("users", 1, 1);
        f.region.insert_rows("users", 500);
        f.region.set_scan_delay(Duration::from_millis(10));

        f.lane.enqueue(t);
        tokio::time::sleep(Duration::from_millis(40)).await;
        f.lane.cancel("users").await;

        assert!(f.shared.transfers().is_empty());
        let copied = f.target.row_count("users");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.target.row_count("users"), copied);
        assert!(copied < 500);
    }

    #[tokio::test]
    async fn test_dropped_table_is_reported() {
        let mut f = fixture(Duration::from_secs(5)).await;
        let t = f.region.create_table("gone", 3, 1);
        f.region.drop_table("gone");

        f.lane.enqueue(t.clone());
        let event = tokio::time::timeout(Duration::from_secs(2), f.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, AgentEvent::TableDropped(ref d) if d == &t));
    }

    #[tokio::test]
    async fn test_shutdown_answers_waiters() {
        let f = fixture(Duration::from_secs(5)).await;
        let t = f.region.create_table("users", 1, 1);
        f.region.insert_rows("users", 500);
        f.region.set_scan_delay(Duration::from_millis(10));

        let lane = f.lane.clone();
        let waiter = tokio::spawn(async move { lane.run(t).await });
        tokio::time::sleep(Duration::from_millis(40)).await;
        f.shutdown.send(true).unwrap();

        assert_eq!(waiter.await.unwrap(), TransferOutcome::Shutdown);
        f.task.await.unwrap();
        let cp = f.store.read("eu", "users", "a0").await.unwrap().unwrap();
        assert_eq!(cp.state, CheckpointState::Shutdown);
    }
}
