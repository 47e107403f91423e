//! The replication group of one shard
//!
//! Derived from the shard's routing table and the master's in-sync
//! allocation id set: which copies a write must reach, which in-sync ids
//! have no live copy (candidates for mark-as-stale), and the counts feeding
//! the response's shard-info arithmetic.

use std::collections::BTreeSet;

use crate::routing::{AllocationId, IndexShardRoutingTable, ShardRouting};

/// Resolved view of who participates in a replicated write.
#[derive(Debug, Clone)]
pub struct ReplicationGroup {
    /// The active primary
    primary: ShardRouting,

    /// Copies a write is replicated to, the primary excluded
    replication_targets: Vec<ShardRouting>,

    /// Assigned copies the primary does not yet track (early peer
    /// recoveries); counted in totals, not written to
    untracked: Vec<ShardRouting>,

    /// Unassigned rows of the shard
    unassigned: usize,

    /// In-sync ids with no assigned copy; eligible for mark-as-stale
    unavailable_in_sync_ids: BTreeSet<AllocationId>,
}

impl ReplicationGroup {
    /// Resolve the group. Returns `None` when the shard has no active
    /// primary.
    pub fn resolve(
        shard_table: &IndexShardRoutingTable,
        in_sync_ids: &BTreeSet<AllocationId>,
    ) -> Option<Self> {
        let primary = shard_table.primary_shard().filter(|p| p.active())?.clone();

        let mut replication_targets = Vec::new();
        let mut untracked = Vec::new();
        let mut assigned_ids: BTreeSet<AllocationId> = BTreeSet::new();
        let mut unassigned = 0;

        let mut consider = |copy: ShardRouting| {
            if let Some(id) = &copy.allocation_id {
                assigned_ids.insert(id.clone());
            }
            if copy.is_same_allocation(&primary) {
                return;
            }
            let tracked = copy.active()
                || copy.is_relocation_target()
                || copy
                    .allocation_id
                    .as_ref()
                    .is_some_and(|id| in_sync_ids.contains(id));
            if tracked {
                replication_targets.push(copy);
            } else {
                untracked.push(copy);
            }
        };

        for copy in shard_table.shards() {
            if copy.unassigned() {
                unassigned += 1;
                continue;
            }
            consider(copy.clone());
            if copy.relocating() {
                consider(copy.build_target_relocating_shard());
            }
        }

        let unavailable_in_sync_ids = in_sync_ids
            .iter()
            .filter(|id| !assigned_ids.contains(*id))
            .cloned()
            .collect();

        Some(Self {
            primary,
            replication_targets,
            untracked,
            unassigned,
            unavailable_in_sync_ids,
        })
    }

    pub fn primary(&self) -> &ShardRouting {
        &self.primary
    }

    /// Copies a write is sent to (the primary's own copy excluded)
    pub fn replication_targets(&self) -> &[ShardRouting] {
        &self.replication_targets
    }

    /// Assigned copies not yet tracked by the primary
    pub fn untracked(&self) -> &[ShardRouting] {
        &self.untracked
    }

    pub fn unassigned(&self) -> usize {
        self.unassigned
    }

    /// In-sync ids with no live copy
    pub fn unavailable_in_sync_ids(&self) -> &BTreeSet<AllocationId> {
        &self.unavailable_in_sync_ids
    }

    /// Total shard count reported in the response:
    /// primary + replication targets + unassigned + untracked.
    pub fn total_shards(&self) -> u32 {
        1 + self.replication_targets.len() as u32
            + self.unassigned as u32
            + self.untracked.len() as u32
    }

    /// Replicas a write actually waits for
    pub fn expected_replicas(&self) -> u32 {
        self.replication_targets.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{
        IndexShardRoutingTable, RecoverySource, ShardId, UnassignedInfo, UnassignedReason,
    };

    fn shard_id() -> ShardId {
        ShardId::new("idx", 0)
    }

    fn unassigned(primary: bool) -> ShardRouting {
        ShardRouting::new_unassigned(
            shard_id(),
            primary,
            if primary {
                RecoverySource::EmptyStore
            } else {
                RecoverySource::Peer
            },
            UnassignedInfo::new(UnassignedReason::IndexCreated),
        )
    }

    #[test]
    fn test_no_group_without_active_primary() {
        let mut builder = IndexShardRoutingTable::builder(shard_id());
        builder.add(unassigned(true).initialize("node-1", None, None));
        builder.add(unassigned(false));
        let table = builder.build();

        assert!(ReplicationGroup::resolve(&table, &BTreeSet::new()).is_none());
    }

    #[test]
    fn test_counts_and_targets() {
        let primary = unassigned(true).initialize("node-1", None, None).moved_to_started();
        let started_replica = unassigned(false).initialize("node-2", None, None).moved_to_started();
        // Early peer recovery: assigned, fresh id, not in-sync.
        let recovering_replica = unassigned(false).initialize("node-3", None, None);

        let in_sync: BTreeSet<AllocationId> = [
            primary.allocation_id.clone().unwrap(),
            started_replica.allocation_id.clone().unwrap(),
        ]
        .into_iter()
        .collect();

        let mut builder = IndexShardRoutingTable::builder(shard_id());
        builder.add(primary.clone());
        builder.add(started_replica.clone());
        builder.add(recovering_replica);
        builder.add(unassigned(false));
        let table = builder.build();

        let group = ReplicationGroup::resolve(&table, &in_sync).unwrap();
        assert_eq!(group.primary().allocation_id, primary.allocation_id);
        assert_eq!(group.expected_replicas(), 1);
        assert_eq!(group.untracked().len(), 1);
        assert_eq!(group.unassigned(), 1);
        // 1 primary + 1 target + 1 untracked + 1 unassigned.
        assert_eq!(group.total_shards(), 4);
        assert!(group.unavailable_in_sync_ids().is_empty());
    }

    #[test]
    fn test_relocation_target_receives_writes() {
        let primary = unassigned(true).initialize("node-1", None, None).moved_to_started();
        let relocating_replica = unassigned(false)
            .initialize("node-2", None, None)
            .moved_to_started()
            .relocate("node-3", None);

        let in_sync: BTreeSet<AllocationId> = [
            primary.allocation_id.clone().unwrap(),
            relocating_replica.allocation_id.clone().unwrap(),
        ]
        .into_iter()
        .collect();

        let mut builder = IndexShardRoutingTable::builder(shard_id());
        builder.add(primary);
        builder.add(relocating_replica.clone());
        let table = builder.build();

        let group = ReplicationGroup::resolve(&table, &in_sync).unwrap();
        // The relocating copy and its target both get the write.
        assert_eq!(group.expected_replicas(), 2);
        assert!(group
            .replication_targets()
            .iter()
            .any(|t| t.is_relocation_target()
                && t.allocation_id == relocating_replica.target_allocation_id));
    }

    #[test]
    fn test_departed_in_sync_copy_is_stale_candidate() {
        let primary = unassigned(true).initialize("node-1", None, None).moved_to_started();
        let departed = AllocationId::from_string("departed-copy");

        let in_sync: BTreeSet<AllocationId> =
            [primary.allocation_id.clone().unwrap(), departed.clone()]
                .into_iter()
                .collect();

        let mut builder = IndexShardRoutingTable::builder(shard_id());
        builder.add(primary);
        builder.add(unassigned(false));
        let table = builder.build();

        let group = ReplicationGroup::resolve(&table, &in_sync).unwrap();
        assert_eq!(
            group.unavailable_in_sync_ids().iter().collect::<Vec<_>>(),
            vec![&departed]
        );
    }
}
