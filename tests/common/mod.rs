//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An agent harness wired to the in-memory collaborators
//! - Bounded polling for assertions on background work

#![allow(dead_code)]

use region_agent::config::{AgentConfig, CheckpointConfig};
use region_agent::memory::{MemoryRegion, MemoryStreamClient, MemoryTarget, StaticGroup};
use region_agent::{Deps, RegionAgent};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const REGION: &str = "remote";

/// In-memory world an agent runs against.
pub struct World {
    pub region: Arc<MemoryRegion>,
    pub target: Arc<MemoryTarget>,
    pub client: Arc<MemoryStreamClient>,
    pub group: Arc<StaticGroup>,
}

impl World {
    pub fn new(shards: u32) -> Self {
        Self {
            region: Arc::new(MemoryRegion::new()),
            target: Arc::new(MemoryTarget::new()),
            client: Arc::new(MemoryStreamClient::new(shards)),
            group: Arc::new(StaticGroup::new()),
        }
    }

    pub fn deps(&self) -> Deps {
        Deps::with_group(
            self.region.clone(),
            self.target.clone(),
            self.client.clone(),
            self.group.clone(),
        )
    }
}

pub fn db_path(dir: &Path) -> PathBuf {
    dir.join("checkpoints.db")
}

/// Fast-timing config with its checkpoint store under `dir`.
pub fn config(agent_id: &str, dir: &Path) -> AgentConfig {
    let mut config = AgentConfig::for_testing(agent_id);
    config.checkpoint = CheckpointConfig::at(db_path(dir).to_string_lossy().into_owned());
    config
}

/// One agent over a fresh world and checkpoint file.
pub struct Harness {
    pub dir: TempDir,
    pub world: World,
    pub agent: RegionAgent,
}

impl Harness {
    pub async fn start(shards: u32) -> Self {
        Self::start_with(shards, |_| {}).await
    }

    pub async fn start_with(shards: u32, tweak: impl FnOnce(&mut AgentConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let world = World::new(shards);
        let mut cfg = config("agent-0", dir.path());
        tweak(&mut cfg);
        let agent = RegionAgent::start(cfg, world.deps()).await.expect("agent start");
        Self { dir, world, agent }
    }

    /// Stop the agent and start a new one over the same world and
    /// checkpoint file.
    pub async fn restart(self) -> Self {
        let config = self.agent.config().clone();
        self.agent.shutdown().await;
        let agent = RegionAgent::start(config, self.world.deps())
            .await
            .expect("agent restart");
        Self {
            dir: self.dir,
            world: self.world,
            agent,
        }
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// [`eventually`] for plain predicates.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    eventually(timeout, || std::future::ready(condition())).await
}
