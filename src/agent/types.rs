//! Agent request and status types.
//!
//! # Status Transitions
//!
//! ```text
//!                 STREAM ok
//! Idle ─────────────────────────→ Streaming ←──────────────────┐
//!  │ │                              │  │  │                    │
//!  │ │ INITIALIZE_*                 │  │  │ ADD / REMOVE /     │ (request done)
//!  │ └──→ InitializingTables ───────┘  │  └──→ AddingTables ───┤
//!  │                                   │       RemovingTables ─┤
//!  │                                   │       ChangingParameter
//!  │                                   │
//!  │             shutdown()            ↓
//!  └───────────────────────────────→ Canceled
//! ```
//!
//! Status is advisory. After a restart the checkpoints, not the last status,
//! decide what gets resumed.

use crate::error::{AgentError, ErrorClass};
use crate::metrics::PerTableMetrics;
use crate::types::{StreamPosition, TableInfo};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Agent-wide status, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// No stream running.
    Idle,

    /// Stream running, no request in progress.
    Streaming,

    /// Snapshot copy of an INITIALIZE request in progress.
    InitializingTables,

    AddingTables,

    RemovingTables,

    /// Schema evolution of cached tables.
    ChangingParameter,

    /// Shut down. Terminal.
    Canceled,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "Idle",
            AgentStatus::Streaming => "Streaming",
            AgentStatus::InitializingTables => "InitializingTables",
            AgentStatus::AddingTables => "AddingTables",
            AgentStatus::RemovingTables => "RemovingTables",
            AgentStatus::ChangingParameter => "ChangingParameter",
            AgentStatus::Canceled => "Canceled",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a request asks the agent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Start or restart the stream, resuming from checkpoints.
    Stream,
    /// Snapshot-copy the given tables, then stream them.
    InitializeTables,
    /// Snapshot-copy every known table of the source region.
    InitializeRegion,
    /// Graft tables into the live stream; copy runs in the background.
    Add,
    Remove,
    /// Refresh cached schemas without touching the stream.
    Evolve,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Stream => "stream",
            RequestKind::InitializeTables => "initialize_tables",
            RequestKind::InitializeRegion => "initialize_region",
            RequestKind::Add => "add",
            RequestKind::Remove => "remove",
            RequestKind::Evolve => "evolve",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final answer to a request. Sent exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Done. Stream membership changes carry the stream position at which
    /// the change took effect.
    Success { position: Option<StreamPosition> },
    Failed { class: ErrorClass, message: String },
}

impl RequestOutcome {
    pub fn success() -> Self {
        Self::Success { position: None }
    }

    pub fn at(position: StreamPosition) -> Self {
        Self::Success {
            position: Some(position),
        }
    }

    pub fn failed(error: &AgentError) -> Self {
        Self::Failed {
            class: error.class(),
            message: error.to_string(),
        }
    }

    /// Answer for requests still queued when the agent stops.
    pub fn stopped() -> Self {
        Self::failed(&AgentError::Shutdown)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn position(&self) -> Option<&StreamPosition> {
        match self {
            Self::Success { position } => position.as_ref(),
            Self::Failed { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failed {
                class: ErrorClass::Shutdown,
                ..
            } => "stopped",
            Self::Failed { .. } => "failure",
        }
    }
}

/// A unit of work for the agent loop.
///
/// Requests made through [`RegionAgent`](super::RegionAgent) carry a
/// response sink. Requests the agent synthesizes itself (reconnects,
/// re-adds of recreated tables, region re-initialization) do not.
#[derive(Debug)]
pub struct AgentRequest {
    pub id: u64,
    pub kind: RequestKind,
    pub tables: Vec<TableInfo>,
    pub(crate) response: Option<oneshot::Sender<RequestOutcome>>,
    /// Set on ADDs synthesized by the readiness poller: the table already
    /// passed the readiness checks and its copy is scheduled even when it
    /// is already part of the stream.
    pub(crate) admitted: bool,
}

impl AgentRequest {
    pub(crate) fn new(
        id: u64,
        kind: RequestKind,
        tables: Vec<TableInfo>,
        response: Option<oneshot::Sender<RequestOutcome>>,
    ) -> Self {
        Self {
            id,
            kind,
            tables,
            response,
            admitted: false,
        }
    }

    /// Request without a response sink.
    pub(crate) fn internal(id: u64, kind: RequestKind, tables: Vec<TableInfo>) -> Self {
        Self::new(id, kind, tables, None)
    }

    /// ADD for a table the readiness poller found ready.
    pub(crate) fn admitted(id: u64, table: TableInfo) -> Self {
        Self {
            admitted: true,
            ..Self::internal(id, RequestKind::Add, vec![table])
        }
    }

    /// Answer the caller, if there is one. Consumes the sink so a request
    /// is answered at most once.
    pub(crate) fn respond(&mut self, outcome: RequestOutcome) {
        crate::metrics::record_request(self.kind.as_str(), outcome.label());
        if let Some(tx) = self.response.take() {
            let _ = tx.send(outcome);
        }
    }

    pub(crate) fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }
}

/// Handle to a submitted request.
#[derive(Debug)]
pub struct RequestTicket {
    id: u64,
    kind: RequestKind,
    rx: oneshot::Receiver<RequestOutcome>,
}

impl RequestTicket {
    pub(crate) fn new(id: u64, kind: RequestKind, rx: oneshot::Receiver<RequestOutcome>) -> Self {
        Self { id, kind, rx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Wait for the agent's answer.
    ///
    /// If the agent goes away without answering (it terminated on a hard
    /// error) the request counts as stopped.
    pub async fn wait(self) -> RequestOutcome {
        self.rx.await.unwrap_or_else(|_| RequestOutcome::stopped())
    }
}

/// Where a table sits on the transfer lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Running,
}

/// Point-in-time view of the agent for status pages.
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub agent_id: String,
    pub source_region: String,
    pub status: AgentStatus,
    /// Tables in the live stream.
    pub streaming: Vec<TableInfo>,
    /// Tables waiting in the readiness poller.
    pub pending: Vec<String>,
    pub transfers: BTreeMap<String, TransferState>,
    pub metrics: PerTableMetrics,
    pub previous_metrics: Option<PerTableMetrics>,
}
