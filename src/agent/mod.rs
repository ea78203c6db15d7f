// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Region replication agent.
//!
//! [`RegionAgent`] is the control handle the owning service holds. Starting
//! it spawns four tasks:
//!
//! - the agent loop ([`actor`]), the only owner of the change stream
//! - the readiness [`poller`], holding tables that cannot be admitted yet
//! - the transfer [`lane`], running one table copy at a time
//! - a metrics rollover timer
//!
//! Requests go through a bounded queue and are answered through a
//! [`RequestTicket`]. ADD is answered once the table is part of the stream;
//! its copy runs on the lane afterwards.
//!
//! # Shutdown
//!
//! [`RegionAgent::shutdown()`] broadcasts a stop flag. The loop answers
//! queued requests (REMOVE succeeds, everything else reports stopped), the
//! lane stops its worker with a SHUTDOWN checkpoint, a last stream checkpoint
//! is attempted, and the checkpoint store is closed.

mod actor;
mod lane;
mod poller;
mod types;

pub use types::{
    AgentReport, AgentRequest, AgentStatus, RequestKind, RequestOutcome, RequestTicket,
    TransferState,
};

use crate::checkpoint::CheckpointStore;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::metrics::{self, MetricsRegistry};
use crate::region::{AgentGroup, SingleAgentGroup, SourceRegion, TargetStore};
use crate::stream::ChangeStreamClient;
use crate::transfer::TransferContext;
use crate::types::TableInfo;
use actor::{Actor, ActorParts};
use lane::TransferLane;
use poller::ReadinessPoller;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, error, info, warn};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State the agent loop publishes to the poller, the lane and [`RegionAgent::report()`].
#[derive(Debug, Default)]
pub(crate) struct AgentShared {
    next_id: AtomicU64,
    next_epoch: AtomicU64,
    streaming: Mutex<Vec<TableInfo>>,
    /// Tables waiting for the readiness poller, by name, with the epoch they
    /// were watched at.
    checklist: Mutex<BTreeMap<String, (TableInfo, u64)>>,
    transfers: Mutex<BTreeMap<String, TransferState>>,
}

impl AgentShared {
    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Orders checklist entries against removals.
    pub(crate) fn next_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn streaming(&self) -> Vec<TableInfo> {
        lock(&self.streaming).clone()
    }

    pub(crate) fn set_streaming(&self, tables: Vec<TableInfo>) {
        *lock(&self.streaming) = tables;
    }

    pub(crate) fn checklist(&self) -> Vec<TableInfo> {
        lock(&self.checklist)
            .values()
            .map(|(table, _)| table.clone())
            .collect()
    }

    /// Returns the checklist size after the insert.
    pub(crate) fn watch_table(&self, table: TableInfo) -> usize {
        let epoch = self.next_epoch();
        let mut checklist = lock(&self.checklist);
        checklist.insert(table.name.clone(), (table, epoch));
        checklist.len()
    }

    /// Returns the epoch the table was watched at, if it was present, and
    /// the remaining size.
    pub(crate) fn unwatch_table(&self, name: &str) -> (Option<u64>, usize) {
        let mut checklist = lock(&self.checklist);
        let removed = checklist.remove(name).map(|(_, epoch)| epoch);
        (removed, checklist.len())
    }

    pub(crate) fn set_transfer(&self, table: &str, state: TransferState) {
        lock(&self.transfers).insert(table.to_string(), state);
    }

    pub(crate) fn remove_transfer(&self, table: &str) {
        lock(&self.transfers).remove(table);
    }

    pub(crate) fn clear_transfers(&self) {
        lock(&self.transfers).clear();
    }

    pub(crate) fn transfers(&self) -> BTreeMap<String, TransferState> {
        lock(&self.transfers).clone()
    }
}

/// External collaborators of an agent.
#[derive(Clone)]
pub struct Deps {
    pub source: Arc<dyn SourceRegion>,
    pub target: Arc<dyn TargetStore>,
    pub stream: Arc<dyn ChangeStreamClient>,
    pub group: Arc<dyn AgentGroup>,
}

impl Deps {
    /// Collaborators for an agent that streams its source region alone.
    pub fn new(
        source: Arc<dyn SourceRegion>,
        target: Arc<dyn TargetStore>,
        stream: Arc<dyn ChangeStreamClient>,
    ) -> Self {
        Self::with_group(source, target, stream, Arc::new(SingleAgentGroup))
    }

    pub fn with_group(
        source: Arc<dyn SourceRegion>,
        target: Arc<dyn TargetStore>,
        stream: Arc<dyn ChangeStreamClient>,
        group: Arc<dyn AgentGroup>,
    ) -> Self {
        Self {
            source,
            target,
            stream,
            group,
        }
    }
}

/// How the agent loop ended. `None` while it runs.
type ExitState = Option<std::result::Result<(), String>>;

/// Handle to a running region agent.
///
/// # Example
///
/// ```rust,no_run
/// use region_agent::config::{AgentConfig, CheckpointConfig};
/// use region_agent::memory::{MemoryRegion, MemoryStreamClient, MemoryTarget};
/// use region_agent::{Deps, RegionAgent, TableInfo};
/// use std::sync::Arc;
///
/// # async fn example() -> region_agent::Result<()> {
/// let mut config = AgentConfig::for_testing("agent-0");
/// config.checkpoint = CheckpointConfig::at("/tmp/region_agent.db");
///
/// let region = Arc::new(MemoryRegion::new());
/// let users = region.create_table("users", 1, 1);
/// let deps = Deps::new(
///     region,
///     Arc::new(MemoryTarget::new()),
///     Arc::new(MemoryStreamClient::new(4)),
/// );
///
/// let agent = RegionAgent::start(config, deps).await?;
/// let outcome = agent.initialize_tables(vec![users]).await?.wait().await;
/// assert!(outcome.is_success());
/// agent.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct RegionAgent {
    config: AgentConfig,
    queue_tx: mpsc::Sender<AgentRequest>,
    status_rx: watch::Receiver<AgentStatus>,
    exit_rx: watch::Receiver<ExitState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shared: Arc<AgentShared>,
    store: Arc<CheckpointStore>,
    metrics: Arc<MetricsRegistry>,
    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl RegionAgent {
    /// Validate `config`, open the checkpoint store and spawn the agent's
    /// tasks. The agent starts `Idle`; send [`create_stream`](Self::create_stream)
    /// or an initialization to get it going.
    pub async fn start(config: AgentConfig, deps: Deps) -> Result<Self> {
        config.validate()?;

        info!(
            agent_id = %config.agent_id,
            source = %config.source_region,
            local = %config.local_region,
            agent_index = config.group.agent_index,
            group_size = config.group.group_size,
            "Starting region agent"
        );

        let store = Arc::new(CheckpointStore::open(&config.checkpoint).await?);
        info!(path = %store.path(), "Checkpoint store initialized");

        let metrics_registry = Arc::new(MetricsRegistry::new());
        let shared = Arc::new(AgentShared::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = mpsc::channel(config.queue.capacity);
        let (status_tx, status_rx) = watch::channel(AgentStatus::Idle);
        let (exit_tx, exit_rx) = watch::channel(None);
        metrics::set_agent_status(AgentStatus::Idle);

        let ctx = Arc::new(TransferContext::new(
            config.source_region.clone(),
            config.agent_id.clone(),
            deps.source.clone(),
            deps.target.clone(),
            store.clone(),
            metrics_registry.clone(),
            config.transfer.clone(),
        ));
        let schemas = ctx.schemas.clone();
        let (lane, lane_handle) = TransferLane::new(
            ctx,
            events_tx.clone(),
            shared.clone(),
            config.poller.transfer_timeout_duration(),
            shutdown_rx.clone(),
        );
        let (poller, poller_handle) = ReadinessPoller::new(
            deps.source.clone(),
            deps.target.clone(),
            deps.group.clone(),
            shared.clone(),
            events_tx.clone(),
            config.poller.interval_duration(),
            shutdown_rx.clone(),
        );
        let actor = Actor::new(ActorParts {
            config: config.clone(),
            source: deps.source,
            target: deps.target,
            client: deps.stream,
            group: deps.group,
            store: store.clone(),
            metrics: metrics_registry.clone(),
            schemas,
            shared: shared.clone(),
            queue: queue_rx,
            events_tx,
            events: events_rx,
            status: status_tx,
            shutdown_tx: shutdown_tx.clone(),
            poller: poller_handle,
            lane: lane_handle,
        });

        let mut handles = Vec::with_capacity(4);
        handles.push(tokio::spawn(async move {
            let result = actor.run().await.map_err(|e| e.to_string());
            let _ = exit_tx.send(Some(result));
        }));
        handles.push(tokio::spawn(lane.run()));
        handles.push(tokio::spawn(poller.run()));
        handles.push(spawn_rollover_task(
            metrics_registry.clone(),
            config.metrics.interval_duration(),
            shutdown_rx,
        ));

        info!(tasks = handles.len(), "Region agent running");

        Ok(Self {
            config,
            queue_tx,
            status_rx,
            exit_rx,
            shutdown_tx,
            shared,
            store,
            metrics: metrics_registry,
            handles: RwLock::new(handles),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Start (or restart) the stream for `tables`, resuming from checkpoints
    /// and picking up copies a previous run left unfinished.
    pub async fn create_stream(&self, tables: Vec<TableInfo>) -> Result<RequestTicket> {
        self.submit(RequestKind::Stream, tables).await
    }

    /// Copy `tables` from scratch and stream them. Answered after the copies
    /// finish.
    pub async fn initialize_tables(&self, tables: Vec<TableInfo>) -> Result<RequestTicket> {
        self.submit(RequestKind::InitializeTables, tables).await
    }

    /// Re-copy every table this agent knows of.
    pub async fn initialize_from_region(&self) -> Result<RequestTicket> {
        self.submit(RequestKind::InitializeRegion, Vec::new()).await
    }

    /// Add tables to the live stream. Answered at stream admission; the copy
    /// runs afterwards.
    pub async fn add_tables(&self, tables: Vec<TableInfo>) -> Result<RequestTicket> {
        self.submit(RequestKind::Add, tables).await
    }

    pub async fn remove_tables(&self, tables: Vec<TableInfo>) -> Result<RequestTicket> {
        self.submit(RequestKind::Remove, tables).await
    }

    /// Raise the cached schema version of each table and its descendants.
    pub async fn evolve_tables(&self, tables: Vec<TableInfo>) -> Result<RequestTicket> {
        self.submit(RequestKind::Evolve, tables).await
    }

    /// Offer a request to the queue, retrying every `queue.offer_timeout`
    /// until it is accepted or the agent stops.
    async fn submit(&self, kind: RequestKind, tables: Vec<TableInfo>) -> Result<RequestTicket> {
        let id = self.shared.next_request_id();
        let (tx, rx) = oneshot::channel();
        let mut request = AgentRequest::new(id, kind, tables, Some(tx));
        let offer_timeout = self.config.queue.offer_timeout_duration();
        let mut offers = 0u32;

        loop {
            if *self.shutdown_tx.borrow() {
                return Err(AgentError::Shutdown);
            }
            offers += 1;
            match self.queue_tx.send_timeout(request, offer_timeout).await {
                Ok(()) => {
                    debug!(request_id = id, kind = %kind, offers, "Request queued");
                    return Ok(RequestTicket::new(id, kind, rx));
                }
                Err(SendTimeoutError::Timeout(back)) => {
                    if offers % 10 == 0 {
                        warn!(request_id = id, kind = %kind, offers, "Request queue full");
                    }
                    request = back;
                }
                Err(SendTimeoutError::Closed(_)) => return Err(AgentError::Shutdown),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    pub fn status(&self) -> AgentStatus {
        *self.status_rx.borrow()
    }

    /// Get a receiver to watch status changes.
    pub fn status_receiver(&self) -> watch::Receiver<AgentStatus> {
        self.status_rx.clone()
    }

    /// Snapshot of the agent for status pages. No I/O.
    pub fn report(&self) -> AgentReport {
        AgentReport {
            agent_id: self.config.agent_id.clone(),
            source_region: self.config.source_region.clone(),
            status: self.status(),
            streaming: self.shared.streaming(),
            pending: self.shared.checklist().into_iter().map(|t| t.name).collect(),
            transfers: self.shared.transfers(),
            metrics: self.metrics.current(),
            previous_metrics: self.metrics.previous(),
        }
    }

    /// Get the checkpoint store (for diagnostics).
    pub fn checkpoint_store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Resolve when the agent loop exits.
    ///
    /// `Err` if it terminated on a hard error; the owning service is expected
    /// to restart the agent then.
    pub async fn join(&self) -> Result<()> {
        let mut exit_rx = self.exit_rx.clone();
        let exit = match exit_rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone(),
            // Sender dropped without a value: the loop task panicked.
            Err(_) => Some(Err("agent task ended without reporting".to_string())),
        };
        match exit {
            Some(Ok(())) | None => Ok(()),
            Some(Err(message)) => Err(AgentError::Internal(message)),
        }
    }

    /// Shut the agent down gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal every task to stop
    /// 2. Wait for the tasks (the loop answers pending requests and writes
    ///    the final stream checkpoint)
    /// 3. Close the checkpoint store (includes WAL checkpoint)
    pub async fn shutdown(&self) {
        info!(agent_id = %self.config.agent_id, "Shutting down region agent");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let drain_timeout = Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    error!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        self.store.close().await;
        metrics::set_agent_status(AgentStatus::Canceled);
        info!("Region agent stopped");
    }
}

/// Move the per-table metrics window every `interval`.
fn spawn_rollover_task(
    registry: Arc<MetricsRegistry>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    registry.rollover();
                    debug!("Per-table metrics rolled over");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Metrics rollover task stopping");
                        break;
                    }
                }
            }
        }
    })
}
