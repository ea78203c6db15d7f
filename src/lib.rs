//! # Region Agent
//!
//! A replication agent that keeps tables of a local region in sync with a
//! remote source region.
//!
//! ## Architecture
//!
//! The agent sits between a source region's change stream and the local
//! target store. One agent loop owns the stream; table copies and readiness
//! checks run beside it:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              region-agent                                 │
//! │                                                                           │
//! │  control ──► ┌──────────────┐  add/remove   ┌───────────────────────────┐ │
//! │  requests    │ Agent loop   │──────────────►│ Change stream subscription│ │
//! │  (bounded)   │ (actor)      │               │ (per-shard position)      │ │
//! │              └──────────────┘               └───────────────────────────┘ │
//! │               │  ▲      │                                                 │
//! │       watch   │  │ admit│ enqueue / run                                   │
//! │               ▼  │      ▼                                                 │
//! │  ┌──────────────────┐  ┌──────────────────┐   ┌─────────────────────────┐ │
//! │  │ Readiness poller │  │ Transfer lane    │──►│ Table transfer worker   │ │
//! │  │ (checklist)      │  │ (one at a time)  │   │ scan ─► put ─► checkpt  │ │
//! │  └──────────────────┘  └──────────────────┘   └─────────────────────────┘ │
//! │                                                             │             │
//! │                                                             ▼             │
//! │                                               ┌─────────────────────────┐ │
//! │                                               │ CheckpointStore (SQLite)│ │
//! │                                               └─────────────────────────┘ │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Ways In
//!
//! 1. **Initialization**: stream from "now", then copy each table's existing
//!    rows. The caller waits for the copies.
//! 2. **Add**: graft a table into the running stream and answer at once; the
//!    copy follows on the transfer lane.
//!
//! Both copies checkpoint their last written key and resume from it after a
//! restart, including copies another agent of the group left behind.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use region_agent::config::{AgentConfig, CheckpointConfig};
//! use region_agent::memory::{MemoryRegion, MemoryStreamClient, MemoryTarget};
//! use region_agent::{Deps, RegionAgent};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = AgentConfig::for_testing("agent-0");
//!     config.checkpoint = CheckpointConfig::at("/tmp/region_agent.db");
//!
//!     let region = Arc::new(MemoryRegion::new());
//!     let users = region.create_table("users", 1, 1);
//!     let deps = Deps::new(
//!         region,
//!         Arc::new(MemoryTarget::new()),
//!         Arc::new(MemoryStreamClient::new(4)),
//!     );
//!
//!     let agent = RegionAgent::start(config, deps).await.expect("Failed to start");
//!     let ticket = agent.create_stream(vec![users]).await.expect("queue closed");
//!     println!("stream: {:?}", ticket.wait().await);
//!
//!     agent.shutdown().await;
//! }
//! ```

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod reconcile;
pub mod region;
pub mod resilience;
pub mod stream;
pub mod transfer;
pub mod types;

// Re-exports for convenience
pub use agent::{
    AgentReport, AgentStatus, Deps, RegionAgent, RequestKind, RequestOutcome, RequestTicket,
    TransferState,
};
pub use checkpoint::{CheckpointState, CheckpointStore, StreamCheckpointRecord, TableInitCheckpoint};
pub use config::{AgentConfig, CheckpointConfig, GroupConfig, PollerConfig, QueueConfig, StreamSettings, TransferConfig};
pub use error::{AgentError, ErrorClass, Result};
pub use region::{AgentGroup, RegionError, SingleAgentGroup, SourceRegion, TargetStore};
pub use stream::{ChangeStreamClient, StreamError, StreamMode, Subscription};
pub use types::{Row, ShardId, StreamPosition, TableInfo};
