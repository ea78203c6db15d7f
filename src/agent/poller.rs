// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table readiness poller.
//!
//! Runs every `poller.interval`, or sooner when the agent adds a table to
//! the checklist. Each cycle:
//!
//! 1. Re-verifies every streaming table against the source, all lookups at
//!    once. A missing table or a different id means it was dropped (and
//!    maybe recreated); the agent is told, and it removes and re-adds it.
//! 2. Checks the checklist. A table is admitted once it is visible at the
//!    source, the target can take its schema, and, if this agent already
//!    streams it, every agent of the group streams it too.
//!
//! Admission is only a message to the agent. Stream membership stays with
//! the agent loop, and the copy runs on the transfer lane.

use super::actor::AgentEvent;
use super::AgentShared;
use crate::metrics;
use crate::region::{AgentGroup, RegionResult, SourceRegion, TargetStore};
use crate::types::TableInfo;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, info_span, warn, Instrument};

/// Agent-side view of the checklist.
#[derive(Clone)]
pub(crate) struct PollerHandle {
    shared: Arc<AgentShared>,
    notify: Arc<Notify>,
}

impl PollerHandle {
    /// Put a table on the checklist and wake the poller.
    pub(crate) fn watch(&self, table: TableInfo) {
        debug!(table = %table.name, "Table handed to readiness poller");
        let pending = self.shared.watch_table(table);
        metrics::set_pending_tables(pending);
        self.notify.notify_one();
    }

    /// Returns `true` if the table was on the checklist.
    pub(crate) fn unwatch(&self, table: &str) -> bool {
        let (removed, pending) = self.shared.unwatch_table(table);
        metrics::set_pending_tables(pending);
        removed.is_some()
    }
}

pub(crate) struct ReadinessPoller {
    source: Arc<dyn SourceRegion>,
    target: Arc<dyn TargetStore>,
    group: Arc<dyn AgentGroup>,
    shared: Arc<AgentShared>,
    notify: Arc<Notify>,
    events: mpsc::UnboundedSender<AgentEvent>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
    /// Streaming tables already reported as dropped, by (name, id).
    reported: HashSet<(String, u64)>,
}

impl ReadinessPoller {
    pub(crate) fn new(
        source: Arc<dyn SourceRegion>,
        target: Arc<dyn TargetStore>,
        group: Arc<dyn AgentGroup>,
        shared: Arc<AgentShared>,
        events: mpsc::UnboundedSender<AgentEvent>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, PollerHandle) {
        let notify = Arc::new(Notify::new());
        let handle = PollerHandle {
            shared: shared.clone(),
            notify: notify.clone(),
        };
        let poller = Self {
            source,
            target,
            group,
            shared,
            notify,
            events,
            interval,
            shutdown,
            reported: HashSet::new(),
        };
        (poller, handle)
    }

    pub(crate) async fn run(mut self) {
        let span = info_span!("poller");
        async move {
            info!(interval_ms = self.interval.as_millis() as u64, "Readiness poller started");
            loop {
                tokio::select! {
                    biased;
                    changed = self.shutdown.changed() => {
                        if changed.is_err() || *self.shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(self.interval) => {}
                }
                if *self.shutdown.borrow() {
                    break;
                }
                self.verify_streaming().await;
                self.admit_ready().await;
            }
            info!("Readiness poller stopped");
        }
        .instrument(span)
        .await
    }

    async fn verify_streaming(&mut self) {
        let streaming = self.shared.streaming();
        self.reported
            .retain(|(name, id)| streaming.iter().any(|t| &t.name == name && t.id == *id));

        let unverified: Vec<TableInfo> = streaming
            .into_iter()
            .filter(|t| !self.reported.contains(&(t.name.clone(), t.id)))
            .collect();
        let source = &self.source;
        let lookups = futures::future::join_all(
            unverified.iter().map(|t| source.table_info(&t.name)),
        )
        .await;

        for (table, lookup) in unverified.into_iter().zip(lookups) {
            match lookup {
                Ok(Some(current)) if current.id == table.id => {}
                Ok(current) => {
                    warn!(
                        table = %table.name,
                        streaming_id = table.id,
                        source_id = current.as_ref().map(|t| t.id),
                        "Streaming table dropped or recreated at source"
                    );
                    self.reported.insert((table.name.clone(), table.id));
                    let _ = self.events.send(AgentEvent::TableDropped(table));
                }
                Err(e) => {
                    debug!(table = %table.name, error = %e, "Could not verify streaming table");
                }
            }
        }
    }

    async fn admit_ready(&mut self) {
        for table in self.shared.checklist() {
            match self.check(&table).await {
                Ok(Some(ready)) => {
                    // The agent may have removed it while we were checking.
                    if let Some(since) = self.shared.unwatch_table(&table.name).0 {
                        info!(table = %ready, "Table ready, admitting");
                        let _ = self.events.send(AgentEvent::Admit { table: ready, since });
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(table = %table.name, error = %e, "Readiness check failed, will retry");
                }
            }
        }
        metrics::set_pending_tables(self.shared.checklist().len());
    }

    async fn check(&self, table: &TableInfo) -> RegionResult<Option<TableInfo>> {
        let Some(current) = self.source.table_info(&table.name).await? else {
            return Ok(None);
        };
        if !self.target.is_compatible(&current).await? {
            debug!(table = %current, "Schema not yet compatible");
            return Ok(None);
        }
        let streaming_here = self
            .shared
            .streaming()
            .iter()
            .any(|t| t.name == current.name && t.id == current.id);
        if streaming_here && !self.group.is_streaming_everywhere(&current).await? {
            debug!(table = %current, "Waiting for the rest of the agent group");
            return Ok(None);
        }
        Ok(Some(current))
    }
}
