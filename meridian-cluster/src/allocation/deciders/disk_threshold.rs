//! Disk watermark decider
//!
//! Three watermarks gate placement, expressed either as a used-space
//! percentage ("85%") or an absolute free-space floor ("500mb"):
//!
//! - `low`: no new shards on a node above it;
//! - `high`: shards must move off a node above it;
//! - `flood_stage`: writes to indices with a copy on the node are blocked.
//!
//! Allocation decisions simulate post-placement usage; remain decisions
//! credit bytes that are already relocating away.

use serde::{Deserialize, Serialize};

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::RoutingAllocation;
use crate::config::DiskSettings;
use crate::error::{ClusterError, Result};
use crate::routing::{RecoverySource, ShardRouting};

/// Disk capacity and headroom of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn new(total_bytes: u64, free_bytes: u64) -> Self {
        Self {
            total_bytes,
            free_bytes,
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.used_bytes() as f64 / self.total_bytes as f64) * 100.0
        }
    }

    /// Usage after placing `bytes` more on the node
    pub fn after_allocating(&self, bytes: u64) -> DiskUsage {
        DiskUsage {
            total_bytes: self.total_bytes,
            free_bytes: self.free_bytes.saturating_sub(bytes),
        }
    }

    /// Usage after `bytes` finish relocating away from the node
    pub fn after_freeing(&self, bytes: u64) -> DiskUsage {
        DiskUsage {
            total_bytes: self.total_bytes,
            free_bytes: (self.free_bytes + bytes).min(self.total_bytes),
        }
    }
}

/// A parsed watermark threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Watermark {
    /// Breached when used space exceeds this percentage
    UsedPercent(f64),
    /// Breached when free space drops below this many bytes
    FreeBytes(u64),
}

impl Watermark {
    /// Parse a watermark setting: a percentage string ("85%") or a byte
    /// size ("500mb"; accepts b, kb, mb, gb, tb).
    pub fn parse(key: &str, value: &str) -> Result<Self> {
        let value = value.trim();
        if let Some(percent) = value.strip_suffix('%') {
            let percent: f64 = percent.parse().map_err(|_| ClusterError::InvalidSetting {
                key: key.to_string(),
                reason: format!("not a percentage: {value}"),
            })?;
            if !(0.0..=100.0).contains(&percent) {
                return Err(ClusterError::InvalidSetting {
                    key: key.to_string(),
                    reason: format!("percentage out of range: {value}"),
                });
            }
            return Ok(Watermark::UsedPercent(percent));
        }

        let lower = value.to_ascii_lowercase();
        let (digits, multiplier) = if let Some(d) = lower.strip_suffix("kb") {
            (d, 1u64 << 10)
        } else if let Some(d) = lower.strip_suffix("mb") {
            (d, 1 << 20)
        } else if let Some(d) = lower.strip_suffix("gb") {
            (d, 1 << 30)
        } else if let Some(d) = lower.strip_suffix("tb") {
            (d, 1 << 40)
        } else if let Some(d) = lower.strip_suffix('b') {
            (d, 1)
        } else {
            return Err(ClusterError::InvalidSetting {
                key: key.to_string(),
                reason: format!("neither a percentage nor a byte size: {value}"),
            });
        };
        let amount: u64 = digits.trim().parse().map_err(|_| ClusterError::InvalidSetting {
            key: key.to_string(),
            reason: format!("not a byte size: {value}"),
        })?;
        Ok(Watermark::FreeBytes(amount * multiplier))
    }

    /// Whether `usage` is beyond this watermark
    pub fn breached(&self, usage: &DiskUsage) -> bool {
        match self {
            Watermark::UsedPercent(percent) => usage.used_percent() > *percent,
            Watermark::FreeBytes(bytes) => usage.free_bytes < *bytes,
        }
    }
}

pub struct DiskThresholdDecider {
    enabled: bool,
    low: Watermark,
    high: Watermark,
    flood_stage: Watermark,
}

impl DiskThresholdDecider {
    pub fn new(settings: &DiskSettings) -> Result<Self> {
        Ok(Self {
            enabled: settings.threshold_enabled,
            low: Watermark::parse(
                "cluster.routing.allocation.disk.watermark.low",
                &settings.watermark_low,
            )?,
            high: Watermark::parse(
                "cluster.routing.allocation.disk.watermark.high",
                &settings.watermark_high,
            )?,
            flood_stage: Watermark::parse(
                "cluster.routing.allocation.disk.watermark.flood_stage",
                &settings.watermark_flood_stage,
            )?,
        })
    }

    /// Whether writes to copies on this node must be blocked
    pub fn flood_stage_breached(&self, usage: &DiskUsage) -> bool {
        self.enabled && self.flood_stage.breached(usage)
    }

    /// Bytes currently relocating away from a node
    fn relocating_away_bytes(node_id: &str, allocation: &RoutingAllocation<'_>) -> u64 {
        allocation
            .routing_nodes()
            .shards_on_node(node_id)
            .iter()
            .filter(|s| s.relocating())
            .map(|s| allocation.shard_size(s))
            .sum()
    }
}

impl AllocationDecider for DiskThresholdDecider {
    fn name(&self) -> &'static str {
        "disk_threshold"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node_id: &str,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        if !self.enabled {
            return Decision::Yes;
        }
        let Some(usage) = allocation.disk_usage(node_id) else {
            // No usage info yet; do not block allocation on it.
            return Decision::Yes;
        };

        let simulated = usage.after_allocating(allocation.shard_size(shard));
        if self.low.breached(&simulated) {
            return Decision::No(format!(
                "allocating {} to node [{node_id}] would put disk usage at \
                 {:.1}%, above the low watermark",
                shard.shard_id,
                simulated.used_percent()
            ));
        }
        Decision::Yes
    }

    fn can_remain(
        &self,
        shard: &ShardRouting,
        node_id: &str,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        if !self.enabled {
            return Decision::Yes;
        }
        let Some(usage) = allocation.disk_usage(node_id) else {
            return Decision::Yes;
        };

        // Credit what is already on its way out.
        let adjusted = usage.after_freeing(Self::relocating_away_bytes(node_id, allocation));
        if self.high.breached(&adjusted) {
            return Decision::No(format!(
                "disk usage on node [{node_id}] is {:.1}%, above the high \
                 watermark; {} must move off",
                adjusted.used_percent(),
                shard.shard_id
            ));
        }
        Decision::Yes
    }

    fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node_id: &str,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        if !self.enabled {
            return Decision::Yes;
        }
        // A primary that has never held data takes no meaningful space yet:
        // admit it anywhere below the high watermark.
        if matches!(shard.recovery_source, Some(RecoverySource::EmptyStore)) {
            let Some(usage) = allocation.disk_usage(node_id) else {
                return Decision::Yes;
            };
            if self.high.breached(usage) {
                return Decision::No(format!(
                    "disk usage on node [{node_id}] is above the high watermark, \
                     refusing even an empty primary"
                ));
            }
            return Decision::Yes;
        }
        self.can_allocate(shard, node_id, allocation)
    }
}
