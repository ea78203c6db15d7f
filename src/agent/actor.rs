// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The agent loop.
//!
//! A single task owns the subscription, the table cache and the status, and
//! executes one request at a time. Nothing else mutates stream membership,
//! so the loop itself is the serialization point.
//!
//! # Request selection
//!
//! Each iteration takes the first of:
//!
//! 1. A synthesized INITIALIZE_REGION, if the stream position was lost
//! 2. A synthesized STREAM, if the stream was rejected and must reconnect
//! 3. The previous request, if it failed with a retryable error
//! 4. Events from the poller and the transfer lane
//! 5. The request queue, waiting at most `queue.poll_interval`
//!
//! The periodic stream checkpoint runs alongside (4) and (5).
//!
//! # Error reaction
//!
//! | Class | Reaction |
//! |-------|----------|
//! | Retryable | redeliver after `queue.retry_backoff`, up to `max_request_retries` |
//! | MetadataMismatch | answer success, remove and re-add the table internally |
//! | ChangeTimeout / Config | fail the request, keep the stream |
//! | StreamRejected | fail the request, cancel the stream, reconnect |
//! | Shutdown | keep the request for the shutdown drain |
//! | Fatal | persist ERROR checkpoints, fail the request, exit with the error |

use super::lane::LaneHandle;
use super::poller::PollerHandle;
use super::types::{AgentRequest, AgentStatus, RequestKind, RequestOutcome};
use super::AgentShared;
use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::config::AgentConfig;
use crate::error::{AgentError, ErrorClass, Result};
use crate::metrics::{self, MetricsRegistry};
use crate::reconcile::{assigned_shards, reconcile_position};
use crate::region::{AgentGroup, RegionError, SourceRegion, TargetStore};
use crate::resilience::{sleep_or_shutdown, wait_until, RetryConfig, WaitOutcome};
use crate::stream::{
    ChangeHandle, ChangeStreamClient, ChangeWait, StreamConfig, StreamMode, Subscription,
};
use crate::transfer::{SchemaCache, TransferOutcome};
use crate::types::{ShardId, StreamPosition, TableInfo};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Messages from the poller and the transfer lane.
#[derive(Debug)]
pub(crate) enum AgentEvent {
    /// A pending table passed the readiness checks. `since` is the checklist
    /// epoch it was watched at.
    Admit { table: TableInfo, since: u64 },
    /// A streaming table no longer exists at the source under this id.
    TableDropped(TableInfo),
    /// A background transfer hit a hard error. Its ERROR checkpoint is
    /// already persisted.
    TransferFailed { table: String, message: String },
    /// A synthesized request.
    Request(AgentRequest),
}

/// Collaborators and channels the loop is built from.
pub(crate) struct ActorParts {
    pub config: AgentConfig,
    pub source: Arc<dyn SourceRegion>,
    pub target: Arc<dyn TargetStore>,
    pub client: Arc<dyn ChangeStreamClient>,
    pub group: Arc<dyn AgentGroup>,
    pub store: Arc<CheckpointStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub schemas: Arc<SchemaCache>,
    pub shared: Arc<AgentShared>,
    pub queue: mpsc::Receiver<AgentRequest>,
    pub events_tx: mpsc::UnboundedSender<AgentEvent>,
    pub events: mpsc::UnboundedReceiver<AgentEvent>,
    pub status: watch::Sender<AgentStatus>,
    pub shutdown_tx: Arc<watch::Sender<bool>>,
    pub poller: PollerHandle,
    pub lane: LaneHandle,
}

enum Membership {
    Add,
    Remove,
}

impl Membership {
    fn as_str(&self) -> &'static str {
        match self {
            Membership::Add => "add",
            Membership::Remove => "remove",
        }
    }
}

enum Wake {
    Shutdown,
    Event(Option<AgentEvent>),
    Checkpoint,
    Queue(Option<AgentRequest>),
    Idle,
}

enum Next {
    Request(AgentRequest),
    Idle,
    Shutdown,
    Fatal(AgentError),
}

pub(crate) struct Actor {
    config: AgentConfig,
    source: Arc<dyn SourceRegion>,
    target: Arc<dyn TargetStore>,
    client: Arc<dyn ChangeStreamClient>,
    group: Arc<dyn AgentGroup>,
    store: Arc<CheckpointStore>,
    metrics: Arc<MetricsRegistry>,
    schemas: Arc<SchemaCache>,
    shared: Arc<AgentShared>,
    queue: mpsc::Receiver<AgentRequest>,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    status: watch::Sender<AgentStatus>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
    poller: PollerHandle,
    lane: LaneHandle,

    subscription: Option<Arc<dyn Subscription>>,
    /// Membership change that did not complete within its budget.
    in_flight: Option<ChangeHandle>,
    shards: Vec<ShardId>,
    /// Replicated tables by name, with the source id and cached schema.
    tables: BTreeMap<String, TableInfo>,
    /// Checklist epoch of each table's latest REMOVE.
    removed: BTreeMap<String, u64>,
    reinit_region: bool,
    reconnect: bool,
    redeliver: Option<AgentRequest>,
    redeliveries: u32,
}

impl Actor {
    pub(crate) fn new(parts: ActorParts) -> Self {
        let shutdown = parts.shutdown_tx.subscribe();
        Self {
            config: parts.config,
            source: parts.source,
            target: parts.target,
            client: parts.client,
            group: parts.group,
            store: parts.store,
            metrics: parts.metrics,
            schemas: parts.schemas,
            shared: parts.shared,
            queue: parts.queue,
            events_tx: parts.events_tx,
            events: parts.events,
            status: parts.status,
            shutdown_tx: parts.shutdown_tx,
            shutdown,
            poller: parts.poller,
            lane: parts.lane,
            subscription: None,
            in_flight: None,
            shards: Vec::new(),
            tables: BTreeMap::new(),
            removed: BTreeMap::new(),
            reinit_region: false,
            reconnect: false,
            redeliver: None,
            redeliveries: 0,
        }
    }

    /// Run until shutdown or a hard error.
    pub(crate) async fn run(mut self) -> Result<()> {
        let span = info_span!(
            "agent",
            agent_id = %self.config.agent_id,
            source = %self.config.source_region,
        );
        async move {
            info!("Agent loop started");
            let result = self.run_loop().await;
            if let Err(e) = &result {
                error!(error = %e, "Agent terminating on unrecoverable error");
            }
            // Stop the poller and the lane before the final checkpoint.
            let _ = self.shutdown_tx.send(true);
            self.drain().await;
            result
        }
        .instrument(span)
        .await
    }

    fn region(&self) -> &str {
        &self.config.source_region
    }

    fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn next_id(&self) -> u64 {
        self.shared.next_request_id()
    }

    fn set_status(&self, status: AgentStatus) {
        if *self.status.borrow() == AgentStatus::Canceled {
            return;
        }
        metrics::set_agent_status(status);
        let _ = self.status.send(status);
    }

    fn active_subscription(&self) -> Option<Arc<dyn Subscription>> {
        self.subscription.clone().filter(|s| !s.is_canceled())
    }

    fn settle_status(&self) {
        let status = if self.active_subscription().is_some() {
            AgentStatus::Streaming
        } else {
            AgentStatus::Idle
        };
        self.set_status(status);
    }

    fn publish_streaming(&self) {
        let tables = self
            .active_subscription()
            .map(|s| s.tables())
            .unwrap_or_default();
        metrics::set_streaming_tables(tables.len());
        self.shared.set_streaming(tables);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loop
    // ─────────────────────────────────────────────────────────────────────────

    async fn run_loop(&mut self) -> Result<()> {
        let period = self.config.stream.checkpoint_interval_duration();
        let mut checkpoint_timer = tokio::time::interval_at(Instant::now() + period, period);
        checkpoint_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.is_shutdown() {
                return Ok(());
            }
            match self.next_request(&mut checkpoint_timer).await {
                Next::Request(request) => self.dispatch(request).await?,
                Next::Idle => {}
                Next::Shutdown => return Ok(()),
                Next::Fatal(e) => return Err(e),
            }
        }
    }

    async fn next_request(&mut self, checkpoint_timer: &mut Interval) -> Next {
        if self.reinit_region {
            self.reinit_region = false;
            let tables: Vec<TableInfo> = self.tables.values().cloned().collect();
            info!(tables = tables.len(), "Re-initializing region after lost stream position");
            return Next::Request(AgentRequest::internal(
                self.next_id(),
                RequestKind::InitializeRegion,
                tables,
            ));
        }

        if self.reconnect && self.active_subscription().is_none() {
            self.reconnect = false;
            let backoff = self.config.stream.reconnect_backoff_duration();
            if sleep_or_shutdown(backoff, &mut self.shutdown).await {
                return Next::Shutdown;
            }
            let tables: Vec<TableInfo> = self.tables.values().cloned().collect();
            info!(tables = tables.len(), "Reconnecting stream");
            return Next::Request(AgentRequest::internal(
                self.next_id(),
                RequestKind::Stream,
                tables,
            ));
        }

        if let Some(request) = self.redeliver.take() {
            return Next::Request(request);
        }

        let poll = self.config.queue.poll_interval_duration();
        let wake = tokio::select! {
            biased;
            changed = self.shutdown.changed() => {
                if changed.is_err() { Wake::Shutdown } else { Wake::Idle }
            }
            event = self.events.recv() => Wake::Event(event),
            _ = checkpoint_timer.tick() => Wake::Checkpoint,
            received = tokio::time::timeout(poll, self.queue.recv()) => match received {
                Ok(request) => Wake::Queue(request),
                Err(_) => Wake::Idle,
            },
        };

        match wake {
            Wake::Shutdown => Next::Shutdown,
            Wake::Idle | Wake::Event(None) => Next::Idle,
            Wake::Checkpoint => {
                self.checkpoint_stream().await;
                Next::Idle
            }
            Wake::Queue(Some(request)) => Next::Request(request),
            // Every handle is gone; nobody can ask for anything anymore.
            Wake::Queue(None) => Next::Shutdown,
            Wake::Event(Some(event)) => self.on_event(event),
        }
    }

    fn on_event(&mut self, event: AgentEvent) -> Next {
        match event {
            AgentEvent::Request(request) => Next::Request(request),
            AgentEvent::Admit { table, since } => {
                if self.removed.get(&table.name).is_some_and(|at| *at > since) {
                    debug!(table = %table, "Admission predates removal, dropped");
                    return Next::Idle;
                }
                Next::Request(AgentRequest::admitted(self.next_id(), table))
            }
            AgentEvent::TableDropped(stale) => match self.readd_requests(stale) {
                Some((remove, add)) => {
                    let _ = self.events_tx.send(AgentEvent::Request(add));
                    Next::Request(remove)
                }
                None => Next::Idle,
            },
            AgentEvent::TransferFailed { table, message } => {
                metrics::record_error(ErrorClass::Fatal.as_str());
                Next::Fatal(AgentError::Internal(format!(
                    "transfer of {table} failed: {message}"
                )))
            }
        }
    }

    /// Internal REMOVE and re-ADD of a stale table. `None` if the table is no
    /// longer replicated under that id.
    fn readd_requests(&mut self, stale: TableInfo) -> Option<(AgentRequest, AgentRequest)> {
        match self.tables.get(&stale.name) {
            Some(cached) if cached.id == stale.id => {}
            _ => {
                debug!(table = %stale, "Stale table already handled");
                return None;
            }
        }
        info!(table = %stale, "Table dropped or recreated at source, re-adding");
        metrics::record_table_recreated(&stale.name);
        let remove = AgentRequest::internal(self.next_id(), RequestKind::Remove, vec![stale.clone()]);
        let add = AgentRequest::internal(self.next_id(), RequestKind::Add, vec![stale]);
        Some((remove, add))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    async fn dispatch(&mut self, mut request: AgentRequest) -> Result<()> {
        debug!(
            request_id = request.id,
            kind = %request.kind,
            tables = ?request.table_names(),
            internal = request.response.is_none(),
            "Handling request"
        );

        let result = match request.kind {
            RequestKind::Stream => self.handle_stream(&request).await,
            RequestKind::InitializeTables => self.handle_initialize(&request, false).await,
            RequestKind::InitializeRegion => self.handle_initialize(&request, true).await,
            RequestKind::Add => self.handle_add(&request).await,
            RequestKind::Remove => self.handle_remove(&request).await,
            RequestKind::Evolve => self.handle_evolve(&request).await,
        };
        self.settle_status();
        self.publish_streaming();

        match result {
            Ok(position) => {
                self.redeliveries = 0;
                request.respond(RequestOutcome::Success { position });
                Ok(())
            }
            Err(e) => self.on_request_error(request, e).await,
        }
    }

    async fn on_request_error(&mut self, mut request: AgentRequest, err: AgentError) -> Result<()> {
        let class = err.class();
        if class != ErrorClass::Shutdown {
            metrics::record_error(class.as_str());
        }

        match class {
            ErrorClass::Retryable => {
                self.redeliveries += 1;
                if self.redeliveries >= self.config.queue.max_request_retries {
                    error!(
                        request_id = request.id,
                        kind = %request.kind,
                        attempts = self.redeliveries,
                        error = %err,
                        "Request retries exhausted"
                    );
                    self.redeliveries = 0;
                    request.respond(RequestOutcome::failed(&err));
                    return Ok(());
                }
                warn!(
                    request_id = request.id,
                    kind = %request.kind,
                    attempt = self.redeliveries,
                    error = %err,
                    "Request failed, will redeliver"
                );
                metrics::record_request_retry(request.kind.as_str());
                let backoff = self.config.queue.retry_backoff_duration();
                self.redeliver = Some(request);
                sleep_or_shutdown(backoff, &mut self.shutdown).await;
                Ok(())
            }
            ErrorClass::MetadataMismatch => {
                let name = match &err {
                    AgentError::TableNotFound(name) => name.clone(),
                    AgentError::TableIdMismatch { table, .. } => table.clone(),
                    _ => String::new(),
                };
                warn!(table = %name, error = %err, "Table metadata changed under request");
                if let Some(stale) = self.tables.get(&name).cloned() {
                    if let Some((remove, add)) = self.readd_requests(stale) {
                        let _ = self.events_tx.send(AgentEvent::Request(remove));
                        let _ = self.events_tx.send(AgentEvent::Request(add));
                    }
                }
                request.respond(RequestOutcome::success());
                Ok(())
            }
            ErrorClass::ChangeTimeout | ErrorClass::Config => {
                warn!(request_id = request.id, kind = %request.kind, error = %err, "Request failed");
                request.respond(RequestOutcome::failed(&err));
                Ok(())
            }
            ErrorClass::StreamRejected => {
                warn!(request_id = request.id, error = %err, "Stream rejected, canceling and reconnecting");
                self.cancel_stream();
                self.reconnect = true;
                self.settle_status();
                request.respond(RequestOutcome::failed(&err));
                Ok(())
            }
            ErrorClass::Shutdown => {
                self.redeliver = Some(request);
                Ok(())
            }
            ErrorClass::Fatal => {
                self.persist_error(&request, &err).await;
                request.respond(RequestOutcome::failed(&err));
                Err(err)
            }
        }
    }

    /// Mark unfinished table copies of a failed request as ERROR before the
    /// caller hears about it.
    async fn persist_error(&self, request: &AgentRequest, err: &AgentError) {
        if !matches!(
            request.kind,
            RequestKind::InitializeTables | RequestKind::InitializeRegion | RequestKind::Add
        ) {
            return;
        }
        for table in &request.tables {
            let existing = self.store.read(self.region(), &table.name, self.agent_id()).await;
            match existing {
                Ok(Some(mut cp))
                    if cp.state != CheckpointState::Complete && cp.state != CheckpointState::Error =>
                {
                    cp.state = CheckpointState::Error;
                    cp.error = Some(err.to_string());
                    if let Err(e) = self.store.write(&cp).await {
                        warn!(table = %table.name, error = %e, "Could not persist ERROR checkpoint");
                    }
                    self.metrics.set_init_state(&table.name, CheckpointState::Error);
                }
                Ok(_) => {}
                Err(e) => warn!(table = %table.name, error = %e, "Could not read checkpoint"),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Handlers
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_stream(&mut self, request: &AgentRequest) -> Result<Option<StreamPosition>> {
        for table in &request.tables {
            match self.resolve(table).await? {
                Some(found) => self.cache(found),
                None => {
                    info!(table = %table.name, "Table not visible at source yet");
                    self.poller.watch(table.clone());
                }
            }
        }

        if !self.start_stream(StreamMode::ResumeFromCheckpoint).await? {
            return Ok(None);
        }
        self.set_status(AgentStatus::Streaming);
        self.resume_incomplete().await?;
        Ok(self.active_subscription().map(|s| s.current_position()))
    }

    async fn handle_initialize(
        &mut self,
        request: &AgentRequest,
        whole_region: bool,
    ) -> Result<Option<StreamPosition>> {
        self.set_status(AgentStatus::InitializingTables);

        let mut targets: BTreeMap<String, TableInfo> = BTreeMap::new();
        if whole_region {
            for table in self.tables.values().chain(self.shared.checklist().iter()) {
                targets.insert(table.name.clone(), table.clone());
            }
        }
        for table in &request.tables {
            targets.insert(table.name.clone(), table.clone());
        }

        let mut found = Vec::new();
        for table in targets.into_values() {
            match self.resolve(&table).await? {
                Some(current) => {
                    let cp = self
                        .store
                        .reset_for_init(self.region(), &current, self.agent_id())
                        .await?;
                    self.metrics.set_init_state(&current.name, cp.state);
                    self.poller.unwatch(&current.name);
                    self.cache(current.clone());
                    found.push(current);
                }
                None => {
                    info!(table = %table.name, "Table not visible at source, deferring initialization");
                    self.poller.watch(table);
                }
            }
        }

        // Stream from now before copying, so no write after the copy
        // starts is missed.
        self.start_stream(StreamMode::FromNow).await?;
        self.set_status(AgentStatus::InitializingTables);

        for table in &found {
            match self.lane.run(table.clone()).await {
                outcome if outcome.is_done() => {}
                TransferOutcome::Shutdown | TransferOutcome::Stopped => {
                    return Err(AgentError::Shutdown)
                }
                TransferOutcome::Abandoned => {
                    debug!(table = %table.name, "Initialization abandoned");
                }
                TransferOutcome::TableDropped => {
                    info!(table = %table.name, "Table dropped during initialization");
                }
                TransferOutcome::Failed(message) => {
                    return Err(AgentError::Internal(format!(
                        "transfer of {} failed: {message}",
                        table.name
                    )))
                }
                other => {
                    return Err(AgentError::InvalidState {
                        expected: "finished transfer".into(),
                        actual: other.label().into(),
                    })
                }
            }
        }

        info!(tables = found.len(), "Initialization complete");
        Ok(self.active_subscription().map(|s| s.current_position()))
    }

    async fn handle_add(&mut self, request: &AgentRequest) -> Result<Option<StreamPosition>> {
        self.set_status(AgentStatus::AddingTables);
        let mut position = None;

        for table in &request.tables {
            let Some(current) = self.resolve(table).await? else {
                info!(table = %table.name, "Table not visible at source yet");
                self.poller.watch(table.clone());
                continue;
            };
            if !self.target.is_compatible(&current).await? {
                info!(table = %current, "Schema not compatible yet");
                self.poller.watch(current);
                continue;
            }
            self.poller.unwatch(&current.name);
            let known = self.tables.contains_key(&current.name);
            self.cache(current.clone());
            match self.admit(&current, request.admitted).await {
                Ok(at) => position = Some(at),
                Err(e) => {
                    // A reconnect must not stream a table whose copy was never scheduled.
                    if !known {
                        self.tables.remove(&current.name);
                    }
                    return Err(e);
                }
            }
        }
        Ok(position)
    }

    /// Put a table into the stream and schedule its copy.
    ///
    /// The owed copy is recorded as a checkpoint before the table joins the
    /// stream, so a redelivered ADD finds it even though the table already
    /// streams.
    async fn admit(&mut self, table: &TableInfo, force_copy: bool) -> Result<StreamPosition> {
        let position = match self.active_subscription() {
            Some(sub) if sub.contains(table) => {
                if !force_copy && !self.copy_pending(table).await? {
                    debug!(table = %table, "Table already streaming");
                    return Ok(sub.current_position());
                }
                sub.current_position()
            }
            active => {
                let cp = self
                    .store
                    .load_for_transfer(self.region(), table, self.agent_id())
                    .await?;
                self.metrics.set_init_state(&table.name, cp.state);
                match active {
                    Some(_) => self.change_membership(Membership::Add, table).await?,
                    None => {
                        if !self.start_stream(StreamMode::ResumeFromCheckpoint).await? {
                            // Region re-initialization will copy the table.
                            return Ok(StreamPosition::new());
                        }
                        self.active_subscription()
                            .map(|s| s.current_position())
                            .unwrap_or_default()
                    }
                }
            }
        };
        self.publish_streaming();

        if self.group.is_streaming_everywhere(table).await? {
            self.lane.enqueue(table.clone());
        } else {
            info!(table = %table, "Waiting for the agent group before copying");
            self.poller.watch(table.clone());
        }
        Ok(position)
    }

    /// True if `table` has a recorded copy that has not finished.
    async fn copy_pending(&self, table: &TableInfo) -> Result<bool> {
        let cp = self
            .store
            .read(self.region(), &table.name, self.agent_id())
            .await?;
        Ok(cp.is_some_and(|cp| cp.table_id == table.id && cp.awaits_copy()))
    }

    async fn handle_remove(&mut self, request: &AgentRequest) -> Result<Option<StreamPosition>> {
        self.set_status(AgentStatus::RemovingTables);
        let mut position = None;

        for table in &request.tables {
            let cached = self.tables.remove(&table.name).unwrap_or_else(|| table.clone());
            self.schemas.forget(&table.name);
            self.removed.insert(table.name.clone(), self.shared.next_epoch());
            self.poller.unwatch(&table.name);
            self.lane.cancel(&table.name).await;

            if let Some(sub) = self.active_subscription() {
                if sub.contains(&cached) {
                    position = Some(self.change_membership(Membership::Remove, &cached).await?);
                }
            }

            self.store
                .delete(self.region(), &table.name, self.agent_id())
                .await?;
            self.metrics.remove(&table.name);
            info!(table = %cached, "Table removed");
        }
        self.publish_streaming();
        Ok(position)
    }

    async fn handle_evolve(&mut self, request: &AgentRequest) -> Result<Option<StreamPosition>> {
        self.set_status(AgentStatus::ChangingParameter);

        for table in &request.tables {
            let mut touched = 0;
            for (name, cached) in self.tables.iter_mut() {
                if table.is_ancestor_of(name) && cached.schema_version < table.schema_version {
                    cached.schema_version = table.schema_version;
                    self.schemas.publish(cached);
                    touched += 1;
                }
            }
            if touched == 0 {
                debug!(table = %table.name, "No cached schema to evolve");
            } else {
                info!(table = %table.name, version = table.schema_version, tables = touched, "Schema evolved");
            }
        }
        Ok(None)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tables
    // ─────────────────────────────────────────────────────────────────────────

    fn cache(&mut self, table: TableInfo) {
        self.schemas.publish(&table);
        match self.tables.get_mut(&table.name) {
            // Same table: keep a schema version raised by EVOLVE.
            Some(cached) if cached.id == table.id => {
                cached.schema_version = cached.schema_version.max(table.schema_version);
            }
            _ => {
                self.tables.insert(table.name.clone(), table);
            }
        }
    }

    /// Wait up to `stream.table_wait_timeout` for a table to show up at the
    /// source. `Ok(None)` if it did not.
    async fn resolve(&mut self, table: &TableInfo) -> Result<Option<TableInfo>> {
        let source = &self.source;
        let name = table.name.as_str();
        let last_error: Mutex<Option<RegionError>> = Mutex::new(None);
        let errors = &last_error;

        let outcome = wait_until(
            move || async move {
                match source.table_info(name).await {
                    Ok(found) => found,
                    Err(e) => {
                        if let Ok(mut slot) = errors.lock() {
                            *slot = Some(e);
                        }
                        None
                    }
                }
            },
            self.config.queue.poll_interval_duration(),
            self.config.stream.table_wait_timeout_duration(),
            &mut self.shutdown,
        )
        .await;

        match outcome {
            WaitOutcome::Ready(found) => Ok(Some(found)),
            WaitOutcome::Shutdown => Err(AgentError::Shutdown),
            WaitOutcome::TimedOut => {
                match last_error.into_inner().unwrap_or_else(|p| p.into_inner()) {
                    Some(RegionError::TableNotFound(_)) | None => Ok(None),
                    Some(e) => Err(e.into()),
                }
            }
        }
    }

    /// Queue copies of tables whose initialization did not finish, both this
    /// agent's and ones a peer agent left behind.
    async fn resume_incomplete(&mut self) -> Result<()> {
        let Some(sub) = self.active_subscription() else {
            return Ok(());
        };
        let mut names: Vec<String> = self
            .store
            .list_incomplete(self.region(), self.agent_id())
            .await?
            .into_iter()
            .map(|cp| cp.table_name)
            .collect();
        for cp in self.store.list_for_region(self.region()).await? {
            if cp.agent_id != self.agent_id()
                && cp.state.is_resumable()
                && !names.contains(&cp.table_name)
            {
                names.push(cp.table_name);
            }
        }

        for name in names {
            if let Some(table) = self.tables.get(&name) {
                if sub.contains(table) {
                    info!(table = %table, "Resuming unfinished initialization");
                    self.lane.enqueue(table.clone());
                }
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stream lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    fn cancel_stream(&mut self) {
        if let Some(sub) = self.subscription.take() {
            if !sub.is_canceled() {
                info!("Canceling stream");
                sub.cancel();
            }
        }
        self.in_flight = None;
        self.publish_streaming();
    }

    /// (Re)start the subscription over all cached tables.
    ///
    /// Retries an unreachable source forever. Returns `Ok(false)` when the
    /// resume position is gone and a region re-initialization was flagged.
    async fn start_stream(&mut self, mode: StreamMode) -> Result<bool> {
        self.cancel_stream();
        let label = match mode {
            StreamMode::ResumeFromCheckpoint => "resume",
            StreamMode::FromNow => "from_now",
        };
        let backoff = RetryConfig::fixed(self.config.stream.reconnect_backoff_duration());
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.subscribe(mode).await {
                Ok(sub) => {
                    metrics::record_stream_start(label, true);
                    info!(
                        mode = label,
                        attempt,
                        shards = self.shards.len(),
                        tables = self.tables.len(),
                        "Stream started"
                    );
                    self.subscription = Some(sub);
                    self.publish_streaming();
                    return Ok(true);
                }
                Err(AgentError::SourceUnreachable(msg)) => {
                    metrics::record_stream_start(label, false);
                    warn!(attempt, error = %msg, "Source region unreachable, retrying");
                    if sleep_or_shutdown(backoff.delay_for_attempt(attempt), &mut self.shutdown).await
                    {
                        return Err(AgentError::Shutdown);
                    }
                }
                Err(AgentError::PositionUnavailable(msg)) => {
                    metrics::record_stream_start(label, false);
                    warn!(error = %msg, "Stream position no longer available");
                    self.store
                        .delete_stream_checkpoint(self.agent_id(), self.region())
                        .await?;
                    self.reinit_region = true;
                    return Ok(false);
                }
                Err(e) => {
                    metrics::record_stream_start(label, false);
                    return Err(e);
                }
            }
        }
    }

    async fn subscribe(&mut self, mode: StreamMode) -> Result<Arc<dyn Subscription>> {
        if self.shards.is_empty() {
            let all = self.client.source_shards().await?;
            self.shards = assigned_shards(
                &all,
                self.config.group.agent_index,
                self.config.group.group_size,
            );
            debug!(shards = ?self.shards, "Shards assigned");
        }

        let start = match mode {
            StreamMode::ResumeFromCheckpoint => self.resume_position().await?,
            StreamMode::FromNow => None,
        };
        let config = StreamConfig {
            source_region: self.config.source_region.clone(),
            agent_id: self.config.agent_id.clone(),
            shards: self.shards.clone(),
            tables: self.tables.values().cloned().collect(),
            mode,
            start,
        };
        Ok(self.client.subscribe(config).await?)
    }

    /// Own stream checkpoint, else a position merged from the peers'.
    async fn resume_position(&self) -> Result<Option<StreamPosition>> {
        if let Some(own) = self
            .store
            .read_stream_checkpoint(self.agent_id(), self.region())
            .await?
        {
            return Ok(Some(own));
        }
        let peers: Vec<_> = self
            .store
            .list_stream_checkpoints(self.region())
            .await?
            .into_iter()
            .filter(|r| r.agent_id != self.agent_id())
            .collect();
        let merged = reconcile_position(&peers, &self.shards);
        if let Some(position) = &merged {
            info!(shards = position.len(), "Resuming from peer stream checkpoints");
        }
        Ok(merged)
    }

    /// Add or remove one table, one change at a time.
    async fn change_membership(&mut self, op: Membership, table: &TableInfo) -> Result<StreamPosition> {
        let sub = self
            .active_subscription()
            .ok_or_else(|| AgentError::StreamRejected("no active stream".into()))?;
        let budget = self.config.stream.change_timeout(self.shards.len());

        if let Some(mut previous) = self.in_flight.take() {
            match self.wait_change(&mut previous, budget).await? {
                ChangeWait::Pending => {
                    metrics::record_stream_change("drain", "timeout", budget);
                    let err = AgentError::ChangeTimeout {
                        table: previous.table().to_string(),
                        waited: budget,
                    };
                    self.in_flight = Some(previous);
                    return Err(err);
                }
                ChangeWait::Failed(e) => {
                    warn!(table = previous.table(), error = %e, "Earlier stream change failed");
                }
                ChangeWait::Done(_) => {
                    debug!(table = previous.table(), "Earlier stream change drained");
                }
            }
        }

        let started = Instant::now();
        let mut handle = match op {
            Membership::Add => sub.add_table(table)?,
            Membership::Remove => sub.remove_table(table)?,
        };
        match self.wait_change(&mut handle, budget).await? {
            ChangeWait::Done(position) => {
                metrics::record_stream_change(op.as_str(), "success", started.elapsed());
                debug!(table = %table, op = op.as_str(), "Stream change complete");
                Ok(position)
            }
            ChangeWait::Pending => {
                metrics::record_stream_change(op.as_str(), "timeout", started.elapsed());
                self.in_flight = Some(handle);
                Err(AgentError::ChangeTimeout {
                    table: table.name.clone(),
                    waited: budget,
                })
            }
            ChangeWait::Failed(e) => {
                metrics::record_stream_change(op.as_str(), "failure", started.elapsed());
                Err(e.into())
            }
        }
    }

    /// Wait for a change in poll-interval slices so shutdown is noticed.
    async fn wait_change(&self, handle: &mut ChangeHandle, budget: Duration) -> Result<ChangeWait> {
        let deadline = Instant::now() + budget;
        let slice = self.config.queue.poll_interval_duration();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(ChangeWait::Pending);
            }
            match handle.wait(slice.min(deadline - now)).await {
                ChangeWait::Pending => {
                    if self.is_shutdown() {
                        return Err(AgentError::Shutdown);
                    }
                }
                done => return Ok(done),
            }
        }
    }

    /// Persist this agent's stream position and acknowledge it upstream.
    async fn checkpoint_stream(&self) {
        let Some(sub) = self.active_subscription() else {
            return;
        };
        let position = sub.current_position();
        if position.is_empty() {
            return;
        }
        let written = match self
            .store
            .write_stream_checkpoint(self.agent_id(), self.region(), &position)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                metrics::record_stream_checkpoint(0, false);
                warn!(error = %e, "Failed to persist stream checkpoint");
                return;
            }
        };
        if let Err(e) = sub.checkpoint(&position).await {
            warn!(error = %e, "Stream client rejected checkpoint");
        }
        metrics::record_stream_checkpoint(written, true);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────

    /// Answer everything still pending, write the last stream checkpoint,
    /// cancel the stream.
    async fn drain(&mut self) {
        self.set_status(AgentStatus::Canceled);
        self.queue.close();

        let mut answered = 0;
        if let Some(request) = self.redeliver.take() {
            answer_on_shutdown(request);
            answered += 1;
        }
        while let Ok(event) = self.events.try_recv() {
            if let AgentEvent::Request(request) = event {
                answer_on_shutdown(request);
                answered += 1;
            }
        }
        while let Ok(request) = self.queue.try_recv() {
            answer_on_shutdown(request);
            answered += 1;
        }
        if answered > 0 {
            info!(answered, "Drained pending requests");
        }

        let budget = self.config.stream.shutdown_checkpoint_timeout_duration();
        if tokio::time::timeout(budget, self.checkpoint_stream()).await.is_err() {
            warn!(timeout_ms = budget.as_millis() as u64, "Final stream checkpoint timed out");
        }
        if let Some(sub) = self.subscription.take() {
            sub.cancel();
        }
        self.shared.set_streaming(Vec::new());
        metrics::set_streaming_tables(0);
        // The status sender ignores updates after Canceled.
        let _ = self.status.send(AgentStatus::Canceled);
        info!("Agent loop stopped");
    }
}

/// Queued REMOVEs count as done: the table will not be streamed by a stopped
/// agent either way. Everything else failed.
fn answer_on_shutdown(mut request: AgentRequest) {
    if request.kind == RequestKind::Remove {
        request.respond(RequestOutcome::success());
    } else {
        request.respond(RequestOutcome::stopped());
    }
}
