//! All copies of a single shard
//!
//! Invariants: at most one copy is an assigned primary, and no two copies
//! share an allocation id. Violations panic: the builder is the only way to
//! construct a table and misuse is a programming error.

use serde::{Deserialize, Serialize};

use super::shard::{AllocationId, ShardId, ShardRouting};

/// The replication group of one shard: primary plus replicas, in all states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexShardRoutingTable {
    shard_id: ShardId,
    shards: Vec<ShardRouting>,
}

impl IndexShardRoutingTable {
    /// Start building a table for `shard_id`
    pub fn builder(shard_id: ShardId) -> IndexShardRoutingTableBuilder {
        IndexShardRoutingTableBuilder {
            shard_id,
            shards: Vec::new(),
        }
    }

    /// Shard identity
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// All copies, unassigned included
    pub fn shards(&self) -> &[ShardRouting] {
        &self.shards
    }

    /// Number of copies (primary + replicas)
    pub fn size(&self) -> usize {
        self.shards.len()
    }

    /// The primary copy, whatever its state
    pub fn primary_shard(&self) -> Option<&ShardRouting> {
        self.shards.iter().find(|s| s.primary)
    }

    /// Replica copies, whatever their state
    pub fn replica_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| !s.primary)
    }

    /// Copies in STARTED or RELOCATING
    pub fn active_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.active())
    }

    /// Copies allocated to a node
    pub fn assigned_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.assigned())
    }

    /// Copies not allocated to any node
    pub fn unassigned_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.unassigned())
    }

    /// Number of copies in STARTED or RELOCATING
    pub fn active_shard_count(&self) -> usize {
        self.active_shards().count()
    }

    /// Whether every copy is unassigned
    pub fn all_unassigned(&self) -> bool {
        self.shards.iter().all(|s| s.unassigned())
    }

    /// Allocation ids of all active copies
    pub fn active_allocation_ids(&self) -> impl Iterator<Item = &AllocationId> {
        self.active_shards().filter_map(|s| s.allocation_id.as_ref())
    }

    /// Find the copy with the given allocation id
    pub fn by_allocation_id(&self, allocation_id: &AllocationId) -> Option<&ShardRouting> {
        self.shards
            .iter()
            .find(|s| s.allocation_id.as_ref() == Some(allocation_id))
    }

    /// A deterministic representative of the group for client routing:
    /// the primary if active, otherwise the first active copy.
    pub fn representative(&self) -> Option<&ShardRouting> {
        self.primary_shard()
            .filter(|p| p.active())
            .or_else(|| self.active_shards().next())
    }
}

/// Single-use builder; `build` consumes it.
#[derive(Debug)]
pub struct IndexShardRoutingTableBuilder {
    shard_id: ShardId,
    shards: Vec<ShardRouting>,
}

impl IndexShardRoutingTableBuilder {
    /// Add one copy
    pub fn add(&mut self, shard: ShardRouting) -> &mut Self {
        assert_eq!(
            shard.shard_id, self.shard_id,
            "copy of {} added to table of {}",
            shard.shard_id, self.shard_id
        );
        if let Some(id) = &shard.allocation_id {
            assert!(
                self.shards
                    .iter()
                    .all(|s| s.allocation_id.as_ref() != Some(id)),
                "duplicate allocation id {id} for {}",
                self.shard_id
            );
        }
        self.shards.push(shard);
        self
    }

    /// Finish the table, validating the single-assigned-primary invariant.
    pub fn build(self) -> IndexShardRoutingTable {
        let assigned_primaries = self
            .shards
            .iter()
            .filter(|s| s.primary && s.assigned())
            .count();
        assert!(
            assigned_primaries <= 1,
            "{} has {assigned_primaries} assigned primaries",
            self.shard_id
        );
        IndexShardRoutingTable {
            shard_id: self.shard_id,
            shards: self.shards,
        }
    }
}
