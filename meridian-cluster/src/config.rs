//! Cluster coordination settings
//!
//! Mirrors the dynamic settings surface of the engine:
//!
//! - `cluster.routing.allocation.*`: allocation switch, recovery
//!   concurrency, disk watermarks, balance factors
//! - `indices.replication.*`: replication retry budget
//! - `discovery.leader_check.*`: leader liveness (consumed by the
//!   discovery layer, validated here)

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level settings bag for the coordination core
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClusterSettings {
    /// Shard allocation settings
    #[serde(default)]
    pub allocation: AllocationSettings,

    /// Replication operation settings
    #[serde(default)]
    pub replication: ReplicationSettings,

    /// Leader-check liveness settings
    #[serde(default)]
    pub leader_check: LeaderCheckSettings,
}

/// Global switch for which shards the allocator may place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationEnable {
    /// Allocate every shard
    #[default]
    All,
    /// Only allocate primaries
    Primaries,
    /// Only allocate primaries of newly created indices
    NewPrimaries,
    /// Only allocate replicas
    Replicas,
    /// Allocate nothing
    None,
}

impl AllocationEnable {
    /// Parse the `cluster.routing.allocation.enable` setting value
    pub fn from_setting_string(s: &str) -> Self {
        match s {
            "primaries" => AllocationEnable::Primaries,
            "new_primaries" => AllocationEnable::NewPrimaries,
            "replicas" => AllocationEnable::Replicas,
            "none" => AllocationEnable::None,
            _ => AllocationEnable::All,
        }
    }
}

/// Shard allocation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AllocationSettings {
    /// Which shards the allocator may place
    #[serde(default)]
    pub enable: AllocationEnable,

    /// Maximum concurrent incoming recoveries per node
    #[serde(default = "default_concurrent_recoveries")]
    pub node_concurrent_incoming_recoveries: usize,

    /// Maximum concurrent outgoing recoveries per node
    #[serde(default = "default_concurrent_recoveries")]
    pub node_concurrent_outgoing_recoveries: usize,

    /// Delay before replicas lost to a node departure are reallocated
    #[serde(default = "default_node_left_delay")]
    pub node_left_delayed_timeout_ms: u64,

    /// Disk watermark settings
    #[serde(default)]
    pub disk: DiskSettings,

    /// Balanced-allocator weight settings
    #[serde(default)]
    pub balance: BalanceSettings,
}

fn default_concurrent_recoveries() -> usize {
    2
}

fn default_node_left_delay() -> u64 {
    60_000
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            enable: AllocationEnable::All,
            node_concurrent_incoming_recoveries: default_concurrent_recoveries(),
            node_concurrent_outgoing_recoveries: default_concurrent_recoveries(),
            node_left_delayed_timeout_ms: default_node_left_delay(),
            disk: DiskSettings::default(),
            balance: BalanceSettings::default(),
        }
    }
}

impl AllocationSettings {
    /// Delay before replicas lost to a node departure are reallocated
    pub fn node_left_delayed_timeout(&self) -> Duration {
        Duration::from_millis(self.node_left_delayed_timeout_ms)
    }
}

/// Disk watermark settings. Each watermark accepts a percentage string
/// ("85%", of used space) or an absolute size ("500mb", of free space).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiskSettings {
    /// Turns the disk threshold decider on or off
    #[serde(default = "default_threshold_enabled")]
    pub threshold_enabled: bool,

    /// No new shards above this usage
    #[serde(default = "default_watermark_low")]
    pub watermark_low: String,

    /// Shards must move off above this usage
    #[serde(default = "default_watermark_high")]
    pub watermark_high: String,

    /// Writes are blocked above this usage
    #[serde(default = "default_watermark_flood_stage")]
    pub watermark_flood_stage: String,
}

fn default_threshold_enabled() -> bool {
    true
}

fn default_watermark_low() -> String {
    "85%".to_string()
}

fn default_watermark_high() -> String {
    "90%".to_string()
}

fn default_watermark_flood_stage() -> String {
    "95%".to_string()
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            threshold_enabled: default_threshold_enabled(),
            watermark_low: default_watermark_low(),
            watermark_high: default_watermark_high(),
            watermark_flood_stage: default_watermark_flood_stage(),
        }
    }
}

/// Weight factors for the balanced allocator
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalanceSettings {
    /// Weight of per-index shard balance
    #[serde(default = "default_index_balance_factor")]
    pub index_balance_factor: f64,

    /// Weight of total shard balance
    #[serde(default = "default_shard_balance_factor")]
    pub shard_balance_factor: f64,

    /// Minimum weight delta before a rebalancing move is worth it
    #[serde(default = "default_balance_threshold")]
    pub threshold: f64,
}

fn default_index_balance_factor() -> f64 {
    0.55
}

fn default_shard_balance_factor() -> f64 {
    0.45
}

fn default_balance_threshold() -> f64 {
    1.0
}

impl Default for BalanceSettings {
    fn default() -> Self {
        Self {
            index_balance_factor: default_index_balance_factor(),
            shard_balance_factor: default_shard_balance_factor(),
            threshold: default_balance_threshold(),
        }
    }
}

/// Replication operation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationSettings {
    /// Maximum wall time spent retrying transient replica failures
    #[serde(default = "default_retry_timeout")]
    pub retry_timeout_ms: u64,

    /// First backoff between transient retries; doubles per attempt
    #[serde(default = "default_initial_retry_backoff")]
    pub initial_retry_backoff_ms: u64,
}

fn default_retry_timeout() -> u64 {
    60_000
}

fn default_initial_retry_backoff() -> u64 {
    50
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            retry_timeout_ms: default_retry_timeout(),
            initial_retry_backoff_ms: default_initial_retry_backoff(),
        }
    }
}

impl ReplicationSettings {
    /// Retry budget as a Duration
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    /// Initial backoff as a Duration
    pub fn initial_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_retry_backoff_ms)
    }
}

/// Leader-check liveness settings, surfaced here for the discovery layer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeaderCheckSettings {
    /// Timeout of a single leader check
    #[serde(default = "default_leader_check_timeout")]
    pub timeout_ms: u64,

    /// Consecutive failed checks before the leader is considered gone
    #[serde(default = "default_leader_check_retry_count")]
    pub retry_count: u32,
}

fn default_leader_check_timeout() -> u64 {
    10_000
}

fn default_leader_check_retry_count() -> u32 {
    3
}

impl Default for LeaderCheckSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_leader_check_timeout(),
            retry_count: default_leader_check_retry_count(),
        }
    }
}

impl LeaderCheckSettings {
    /// Timeout of a single leader check as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
