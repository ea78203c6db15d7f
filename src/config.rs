//! Configuration for the region agent.
//!
//! Configuration is passed to [`RegionAgent::start()`](crate::RegionAgent::start)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use region_agent::config::AgentConfig;
//!
//! let config = AgentConfig {
//!     agent_id: "agent-0".into(),
//!     local_region: "us-east".into(),
//!     source_region: "eu-west".into(),
//!     ..Default::default()
//! };
//! assert_eq!(config.group.group_size, 1);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! AgentConfig
//! ├── agent_id, local_region, source_region
//! ├── group: GroupConfig            # agent_index, group_size
//! ├── queue: QueueConfig            # request queue and retry of failed requests
//! ├── stream: StreamSettings        # membership change budget, reconnect, checkpoints
//! ├── transfer: TransferConfig      # scan batch, checkpoint thresholds, rate limit
//! ├── poller: PollerConfig          # readiness interval, per-table transfer slot
//! ├── metrics: MetricsConfig        # rollover interval
//! └── checkpoint: CheckpointConfig  # SQLite persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! agent_id: "us-east.agent-0"
//! local_region: "us-east"
//! source_region: "eu-west"
//!
//! group:
//!   agent_index: 0
//!   group_size: 2
//!
//! stream:
//!   change_timeout_per_shard: "5s"
//!   reconnect_backoff: "10s"
//!
//! transfer:
//!   batch_size: 500
//!   checkpoint_rows: 10000
//!
//! checkpoint:
//!   sqlite_path: "/var/lib/app/region_agent.db"
//! ```
//!
//! Duration fields are humantime strings. An unparseable string falls back to
//! the field's default rather than failing startup.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_or(value: &str, default: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(default)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `RegionAgent::start()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Identity of this agent. Owner column of every checkpoint it writes.
    pub agent_id: String,

    /// Region this agent writes into.
    pub local_region: String,

    /// Region this agent replicates from.
    pub source_region: String,

    #[serde(default)]
    pub group: GroupConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub stream: StreamSettings,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub poller: PollerConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "local.dev.agent.default".to_string(),
            local_region: "local".to_string(),
            source_region: "remote".to_string(),
            group: GroupConfig::default(),
            queue: QueueConfig::default(),
            stream: StreamSettings::default(),
            transfer: TransferConfig::default(),
            poller: PollerConfig::default(),
            metrics: MetricsConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Config with millisecond-scale timings for tests.
    ///
    /// The checkpoint path must still be pointed at a real file; see
    /// [`CheckpointConfig::at`].
    pub fn for_testing(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            local_region: "local".to_string(),
            source_region: "remote".to_string(),
            group: GroupConfig::default(),
            queue: QueueConfig {
                capacity: 16,
                offer_timeout: "20ms".to_string(),
                poll_interval: "10ms".to_string(),
                max_request_retries: 1_000,
                retry_backoff: "10ms".to_string(),
            },
            stream: StreamSettings {
                change_timeout_per_shard: "200ms".to_string(),
                change_timeout_margin: 0.5,
                reconnect_backoff: "10ms".to_string(),
                table_wait_timeout: "50ms".to_string(),
                checkpoint_interval: "1h".to_string(),
                shutdown_checkpoint_timeout: "500ms".to_string(),
            },
            transfer: TransferConfig {
                batch_size: 16,
                checkpoint_rows: 50,
                checkpoint_interval: "1h".to_string(),
                retry_backoff: "5ms".to_string(),
                include_tombstones: true,
                rows_per_sec: None,
                stop_grace: "200ms".to_string(),
            },
            poller: PollerConfig {
                interval: "20ms".to_string(),
                transfer_timeout: "5s".to_string(),
            },
            metrics: MetricsConfig {
                interval: "1h".to_string(),
            },
            checkpoint: CheckpointConfig::default(),
        }
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.is_empty() {
            return Err(AgentError::Config("agent_id must not be empty".into()));
        }
        if self.source_region.is_empty() {
            return Err(AgentError::Config("source_region must not be empty".into()));
        }
        if self.source_region == self.local_region {
            return Err(AgentError::Config(format!(
                "source_region and local_region are both '{}'",
                self.source_region
            )));
        }
        if self.group.group_size == 0 || self.group.agent_index >= self.group.group_size {
            return Err(AgentError::Config(format!(
                "agent_index {} out of range for group_size {}",
                self.group.agent_index, self.group.group_size
            )));
        }
        if self.queue.capacity == 0 {
            return Err(AgentError::Config("queue.capacity must be positive".into()));
        }
        if self.transfer.batch_size == 0 {
            return Err(AgentError::Config("transfer.batch_size must be positive".into()));
        }
        if self.transfer.rows_per_sec == Some(0) {
            return Err(AgentError::Config("transfer.rows_per_sec must be positive".into()));
        }
        let margin = self.stream.change_timeout_margin;
        if !margin.is_finite() || margin < 0.0 {
            return Err(AgentError::Config(format!(
                "stream.change_timeout_margin must be a non-negative number, got {margin}"
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GroupConfig: multi-agent shard partitioning
// ═══════════════════════════════════════════════════════════════════════════════

/// Position of this agent among the agents streaming the same source region.
///
/// Shard `s` belongs to agent `s % group_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub agent_index: u32,

    #[serde(default = "default_group_size")]
    pub group_size: u32,
}

fn default_group_size() -> u32 {
    1
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            agent_index: 0,
            group_size: 1,
        }
    }
}

impl GroupConfig {
    pub fn is_multi_agent(&self) -> bool {
        self.group_size > 1
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueConfig: request queue
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Bounded request queue size.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// How long a producer waits for a queue slot before re-checking shutdown.
    #[serde(default = "default_offer_timeout")]
    pub offer_timeout: String,

    /// How long the actor blocks on an empty queue before re-running its
    /// per-iteration checks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Redelivery ceiling for a request that failed with a retryable error.
    #[serde(default = "default_max_request_retries")]
    pub max_request_retries: u32,

    /// Delay between redeliveries.
    #[serde(default = "default_request_retry_backoff")]
    pub retry_backoff: String,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_offer_timeout() -> String {
    "1s".to_string()
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_max_request_retries() -> u32 {
    1_000_000
}

fn default_request_retry_backoff() -> String {
    "1s".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            offer_timeout: "1s".to_string(),
            poll_interval: "1s".to_string(),
            max_request_retries: 1_000_000,
            retry_backoff: "1s".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn offer_timeout_duration(&self) -> Duration {
        parse_or(&self.offer_timeout, Duration::from_secs(1))
    }

    pub fn poll_interval_duration(&self) -> Duration {
        parse_or(&self.poll_interval, Duration::from_secs(1))
    }

    pub fn retry_backoff_duration(&self) -> Duration {
        parse_or(&self.retry_backoff, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StreamSettings: change-stream lifecycle
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Budget for one shard to apply a membership change.
    #[serde(default = "default_change_timeout_per_shard")]
    pub change_timeout_per_shard: String,

    /// Extra fraction added on top of `per_shard * shards`.
    #[serde(default = "default_change_timeout_margin")]
    pub change_timeout_margin: f64,

    /// Fixed delay between attempts to reach an unreachable source.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff: String,

    /// How long STREAM/INITIALIZE wait for a table to appear at the source
    /// before handing it to the poller.
    #[serde(default = "default_table_wait_timeout")]
    pub table_wait_timeout: String,

    /// Interval of the periodic stream checkpoint.
    #[serde(default = "default_stream_checkpoint_interval")]
    pub checkpoint_interval: String,

    /// Budget for the final stream checkpoint written during shutdown.
    #[serde(default = "default_shutdown_checkpoint_timeout")]
    pub shutdown_checkpoint_timeout: String,
}

/// Upper bound of [`StreamSettings::change_timeout`].
pub const MAX_CHANGE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

fn default_change_timeout_per_shard() -> String {
    "5s".to_string()
}

fn default_change_timeout_margin() -> f64 {
    0.5
}

fn default_reconnect_backoff() -> String {
    "10s".to_string()
}

fn default_table_wait_timeout() -> String {
    "10s".to_string()
}

fn default_stream_checkpoint_interval() -> String {
    "30s".to_string()
}

fn default_shutdown_checkpoint_timeout() -> String {
    "5s".to_string()
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            change_timeout_per_shard: default_change_timeout_per_shard(),
            change_timeout_margin: default_change_timeout_margin(),
            reconnect_backoff: default_reconnect_backoff(),
            table_wait_timeout: default_table_wait_timeout(),
            checkpoint_interval: default_stream_checkpoint_interval(),
            shutdown_checkpoint_timeout: default_shutdown_checkpoint_timeout(),
        }
    }
}

impl StreamSettings {
    pub fn change_timeout_per_shard_duration(&self) -> Duration {
        parse_or(&self.change_timeout_per_shard, Duration::from_secs(5))
    }

    /// Budget for draining an in-flight membership change:
    /// `per_shard * shards * (1 + margin)`, at most [`MAX_CHANGE_TIMEOUT`].
    pub fn change_timeout(&self, shard_count: usize) -> Duration {
        let shards = shard_count.max(1) as f64;
        let margin = if self.change_timeout_margin.is_finite() {
            self.change_timeout_margin.max(0.0)
        } else {
            0.0
        };
        let per_shard = self.change_timeout_per_shard_duration().as_secs_f64();
        let secs = per_shard * shards * (1.0 + margin);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_CHANGE_TIMEOUT)
            .min(MAX_CHANGE_TIMEOUT)
    }

    pub fn reconnect_backoff_duration(&self) -> Duration {
        parse_or(&self.reconnect_backoff, Duration::from_secs(10))
    }

    pub fn table_wait_timeout_duration(&self) -> Duration {
        parse_or(&self.table_wait_timeout, Duration::from_secs(10))
    }

    pub fn checkpoint_interval_duration(&self) -> Duration {
        parse_or(&self.checkpoint_interval, Duration::from_secs(30))
    }

    pub fn shutdown_checkpoint_timeout_duration(&self) -> Duration {
        parse_or(&self.shutdown_checkpoint_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TransferConfig: table snapshot copy
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Rows per source scan call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Persist an IN_PROGRESS checkpoint after this many rows.
    #[serde(default = "default_checkpoint_rows")]
    pub checkpoint_rows: u64,

    /// ...or after this much time, whichever comes first.
    #[serde(default = "default_transfer_checkpoint_interval")]
    pub checkpoint_interval: String,

    /// Delay before rescanning from the last checkpoint after a transient fault.
    #[serde(default = "default_transfer_retry_backoff")]
    pub retry_backoff: String,

    #[serde(default = "default_true")]
    pub include_tombstones: bool,

    /// Optional per-agent write throttle.
    #[serde(default)]
    pub rows_per_sec: Option<u32>,

    /// How long a stopped worker gets to flush before it is aborted.
    #[serde(default = "default_stop_grace")]
    pub stop_grace: String,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    1000
}

fn default_checkpoint_rows() -> u64 {
    10_000
}

fn default_transfer_checkpoint_interval() -> String {
    "10s".to_string()
}

fn default_transfer_retry_backoff() -> String {
    "1s".to_string()
}

fn default_stop_grace() -> String {
    "5s".to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            checkpoint_rows: 10_000,
            checkpoint_interval: "10s".to_string(),
            retry_backoff: "1s".to_string(),
            include_tombstones: true,
            rows_per_sec: None,
            stop_grace: "5s".to_string(),
        }
    }
}

impl TransferConfig {
    pub fn checkpoint_interval_duration(&self) -> Duration {
        parse_or(&self.checkpoint_interval, Duration::from_secs(10))
    }

    pub fn retry_backoff_duration(&self) -> Duration {
        parse_or(&self.retry_backoff, Duration::from_secs(1))
    }

    pub fn stop_grace_duration(&self) -> Duration {
        parse_or(&self.stop_grace, Duration::from_secs(5))
    }

    /// Rate limit settings, `None` when unthrottled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        self.rows_per_sec.map(|rate| crate::resilience::RateLimitConfig {
            burst_size: rate.min(self.batch_size.min(u32::MAX as usize) as u32).max(1),
            refill_rate: rate,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PollerConfig: readiness poller
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poller_interval")]
    pub interval: String,

    /// Slot a poller-driven transfer gets before it is checkpointed and
    /// re-queued behind the other pending tables.
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout: String,
}

fn default_poller_interval() -> String {
    "10s".to_string()
}

fn default_transfer_timeout() -> String {
    "10m".to_string()
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: default_poller_interval(),
            transfer_timeout: default_transfer_timeout(),
        }
    }
}

impl PollerConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(10))
    }

    pub fn transfer_timeout_duration(&self) -> Duration {
        parse_or(&self.transfer_timeout, Duration::from_secs(600))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MetricsConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Rollover interval of the per-table metrics registry.
    #[serde(default = "default_metrics_interval")]
    pub interval: String,
}

fn default_metrics_interval() -> String {
    "1m".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: default_metrics_interval(),
        }
    }
}

impl MetricsConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to the SQLite database holding table and stream checkpoints.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "region_agent.db".to_string(),
            wal_mode: true,
        }
    }
}

impl CheckpointConfig {
    /// Config for a database file at `path`.
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            sqlite_path: path.into(),
            wal_mode: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.group.group_size, 1);
        assert!(!config.group.is_multi_agent());
        assert_eq!(config.checkpoint.sqlite_path, "region_agent.db");
    }

    #[test]
    fn test_validate_rejects_same_regions() {
        let config = AgentConfig {
            source_region: "local".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_group() {
        let mut config = AgentConfig::default();
        config.group = GroupConfig {
            agent_index: 2,
            group_size: 2,
        };
        assert!(config.validate().is_err());
        config.group.group_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let mut config = AgentConfig::default();
        config.transfer.rows_per_sec = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_parsing_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = PollerConfig {
                interval: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.interval_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_duration_invalid_fallback() {
        let config = StreamSettings {
            reconnect_backoff: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.reconnect_backoff_duration(), Duration::from_secs(10));
    }

    #[test]
    fn test_change_timeout_scales_with_shards() {
        let settings = StreamSettings {
            change_timeout_per_shard: "2s".to_string(),
            change_timeout_margin: 0.5,
            ..Default::default()
        };
        assert_eq!(settings.change_timeout(4), Duration::from_secs(12));
        // zero shards is treated as one
        assert_eq!(settings.change_timeout(0), Duration::from_secs(3));
    }

    #[test]
    fn test_change_timeout_is_bounded() {
        let mut settings = StreamSettings {
            change_timeout_per_shard: "1000000h".to_string(),
            change_timeout_margin: 1e300,
            ..Default::default()
        };
        assert_eq!(settings.change_timeout(usize::MAX), MAX_CHANGE_TIMEOUT);

        settings.change_timeout_per_shard = "1s".to_string();
        for margin in [f64::NAN, f64::INFINITY, -3.0] {
            settings.change_timeout_margin = margin;
            assert_eq!(settings.change_timeout(2), Duration::from_secs(2));
        }
    }

    #[test]
    fn test_validate_rejects_bad_margin() {
        for margin in [f64::NAN, f64::INFINITY, -0.5] {
            let mut config = AgentConfig::for_testing("a");
            config.stream.change_timeout_margin = margin;
            assert!(matches!(config.validate(), Err(AgentError::Config(_))));
        }
    }

    #[test]
    fn test_rate_limit_config() {
        let mut config = TransferConfig::default();
        assert!(config.rate_limit_config().is_none());

        config.rows_per_sec = Some(5000);
        config.batch_size = 100;
        let rate = config.rate_limit_config().unwrap();
        assert_eq!(rate.refill_rate, 5000);
        assert_eq!(rate.burst_size, 100);
    }

    #[test]
    fn test_for_testing_config() {
        let config = AgentConfig::for_testing("agent-t");
        assert_eq!(config.agent_id, "agent-t");
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.poll_interval_duration(), Duration::from_millis(10));
        assert_eq!(config.poller.interval_duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = AgentConfig::for_testing("agent-rt");
        config.group = GroupConfig {
            agent_index: 1,
            group_size: 3,
        };
        config.transfer.rows_per_sec = Some(250);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: AgentConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.agent_id, "agent-rt");
        assert_eq!(parsed.group.agent_index, 1);
        assert_eq!(parsed.group.group_size, 3);
        assert_eq!(parsed.transfer.rows_per_sec, Some(250));
        assert_eq!(parsed.queue.offer_timeout, "20ms");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "agent_id": "a",
            "local_region": "us",
            "source_region": "eu",
            "checkpoint": { "sqlite_path": "/tmp/x.db" }
        }"#;
        let parsed: AgentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.queue.capacity, 64);
        assert_eq!(parsed.transfer.batch_size, 1000);
        assert!(parsed.transfer.include_tombstones);
        assert!(parsed.checkpoint.wal_mode);
        assert_eq!(parsed.stream.change_timeout_margin, 0.5);
    }
}
