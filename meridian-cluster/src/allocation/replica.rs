//! Unassigned-replica allocation
//!
//! Replicas always recover from the primary, so placement is free in
//! principle; this allocator's job is to prefer nodes that already hold a
//! copy of the shard (recovery reuses the local files) and to wait out the
//! node-left delay before rebuilding a replica whose node may come right
//! back. Replicas it has no opinion on are left for the balancer.

use std::sync::Arc;

use tracing::debug;

use super::deciders::AllocationDeciders;
use super::decision::DecisionKind;
use super::{RoutingAllocation, ShardStateProvider};
use crate::routing::{AllocationStatus, ShardRouting, UnassignedReason};

pub struct ReplicaShardAllocator {
    provider: Arc<dyn ShardStateProvider>,
}

impl ReplicaShardAllocator {
    pub fn new(provider: Arc<dyn ShardStateProvider>) -> Self {
        Self { provider }
    }

    /// Run one pass over the unassigned queue.
    pub fn allocate_unassigned(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
    ) {
        let unassigned = allocation.routing_nodes_mut().take_unassigned();
        for shard in unassigned {
            if shard.primary {
                allocation.routing_nodes_mut().push_unassigned(shard);
                continue;
            }
            self.allocate_one(shard, allocation, deciders);
        }
    }

    fn allocate_one(
        &self,
        shard: ShardRouting,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
    ) {
        // A replica recovers from its primary; without an active primary
        // there is nothing to recover from yet.
        if allocation
            .routing_nodes()
            .active_primary(&shard.shard_id)
            .is_none()
        {
            allocation.routing_nodes_mut().push_unassigned(shard);
            return;
        }

        // A node departure is often transient; give it a grace period
        // before copying the whole shard elsewhere.
        if let Some(info) = &shard.unassigned_info {
            if info.reason == UnassignedReason::NodeLeft {
                let delay = allocation
                    .settings()
                    .allocation
                    .node_left_delayed_timeout()
                    .as_millis() as u64;
                let elapsed = allocation.now_millis().saturating_sub(info.unassigned_at_millis);
                if elapsed < delay {
                    allocation.ignore_shard(shard, AllocationStatus::DelayedAllocation);
                    return;
                }
            }
        }

        let fetch = self.provider.shard_state(&shard, allocation.nodes());
        if !fetch.has_data {
            allocation.ignore_shard(shard, AllocationStatus::FetchingShardData);
            return;
        }

        // Among nodes with a reusable copy, take the first the deciders
        // admit; leave everything else to the balancer.
        let mut throttled = false;
        for (node_id, state) in &fetch.data {
            let has_copy = state.allocation_id.is_some()
                && !state.failure.as_ref().is_some_and(|f| !f.copy_usable());
            if !has_copy {
                continue;
            }
            let decision = deciders.can_allocate(&shard, node_id, allocation);
            match decision.kind() {
                DecisionKind::Yes => {
                    debug!(
                        shard = %shard.shard_id,
                        node = %node_id,
                        "allocating replica onto an existing copy"
                    );
                    let node_id = node_id.clone();
                    allocation.initialize_shard(&shard, &node_id, None, None);
                    return;
                }
                DecisionKind::Throttle => throttled = true,
                DecisionKind::No => {}
            }
        }

        if throttled {
            // A matching copy exists but its node is busy; wait rather than
            // copy the shard from scratch elsewhere.
            allocation.ignore_shard(shard, AllocationStatus::DecidersThrottled);
        } else {
            allocation.routing_nodes_mut().push_unassigned(shard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::tests_support::{AllocationParts, StaticShardStateProvider};
    use crate::allocation::{
        AllocationDeciders, DiskThresholdDecider, EnableAllocationDecider, NodeShardState,
        SameShardAllocationDecider, ThrottlingAllocationDecider,
    };
    use crate::config::DiskSettings;
    use crate::routing::{AllocationId, RoutingTable, UnassignedInfo};
    use crate::state::{DiscoveryNode, DiscoveryNodes, IndexMetadata, Metadata};

    fn deciders() -> AllocationDeciders {
        AllocationDeciders::new(vec![
            Box::new(EnableAllocationDecider),
            Box::new(SameShardAllocationDecider),
            Box::new(ThrottlingAllocationDecider),
            Box::new(DiskThresholdDecider::new(&DiskSettings::default()).unwrap()),
        ])
    }

    fn nodes(ids: &[&str]) -> DiscoveryNodes {
        let mut builder = DiscoveryNodes::builder();
        for id in ids {
            builder = builder.add(DiscoveryNode::new(*id, *id, format!("{id}:4300")));
        }
        builder.build()
    }

    fn parts(node_ids: &[&str]) -> AllocationParts {
        let meta = IndexMetadata::builder("logs")
            .number_of_shards(1)
            .number_of_replicas(1)
            .build();
        let table = RoutingTable::builder().add_as_new(&meta).build();
        AllocationParts::new(
            Metadata::builder().put(meta).build(),
            table,
            nodes(node_ids),
        )
    }

    /// Take the unassigned queue, start the primary on `primary_node`, and
    /// return the replica row.
    fn start_primary(
        allocation: &mut RoutingAllocation<'_>,
        primary_node: &str,
    ) -> ShardRouting {
        let unassigned = allocation.routing_nodes_mut().take_unassigned();
        let (primaries, replicas): (Vec<_>, Vec<_>) =
            unassigned.into_iter().partition(|s| s.primary);
        let init =
            allocation
                .routing_nodes_mut()
                .initialize_shard(&primaries[0], primary_node, None, None);
        allocation.routing_nodes_mut().start_shard(&init);
        let replica = replicas.into_iter().next().unwrap();
        allocation.routing_nodes_mut().push_unassigned(replica.clone());
        replica
    }

    #[test]
    fn test_replica_waits_for_primary() {
        let parts = parts(&["node-1", "node-2"]);
        let mut allocation = parts.allocation();

        let allocator = ReplicaShardAllocator::new(Arc::new(StaticShardStateProvider::empty()));
        allocator.allocate_unassigned(&mut allocation, &deciders());

        // Primary unassigned: both rows untouched in the queue.
        assert_eq!(allocation.routing_nodes().unassigned().len(), 2);
        assert!(!allocation.changed());
    }

    #[test]
    fn test_replica_prefers_node_with_copy() {
        let parts = parts(&["node-1", "node-2", "node-3"]);
        let mut allocation = parts.allocation();
        start_primary(&mut allocation, "node-1");

        let allocator = ReplicaShardAllocator::new(Arc::new(StaticShardStateProvider::with(
            vec![
                ("node-2", NodeShardState::empty()),
                (
                    "node-3",
                    NodeShardState::with_copy(AllocationId::from_string("old-replica")),
                ),
            ],
        )));
        allocator.allocate_unassigned(&mut allocation, &deciders());

        let on_node_3 = allocation.routing_nodes().shards_on_node("node-3");
        assert_eq!(on_node_3.len(), 1);
        assert!(on_node_3[0].initializing());
        assert!(!on_node_3[0].primary);
        // Fresh allocation id for the new copy.
        assert_ne!(
            on_node_3[0].allocation_id,
            Some(AllocationId::from_string("old-replica"))
        );
    }

    #[test]
    fn test_replica_without_copy_left_for_balancer() {
        let parts = parts(&["node-1", "node-2"]);
        let mut allocation = parts.allocation();
        start_primary(&mut allocation, "node-1");

        let allocator = ReplicaShardAllocator::new(Arc::new(StaticShardStateProvider::empty()));
        allocator.allocate_unassigned(&mut allocation, &deciders());

        assert_eq!(allocation.routing_nodes().unassigned().len(), 1);
        assert!(allocation.routing_nodes().ignored().is_empty());
    }

    #[test]
    fn test_node_left_delay_is_respected() {
        let parts = parts(&["node-1", "node-2"]);
        let mut allocation = parts.allocation();
        start_primary(&mut allocation, "node-1");

        // Replace the replica row with one that just lost its node.
        let replica = allocation
            .routing_nodes_mut()
            .take_unassigned()
            .into_iter()
            .next()
            .unwrap();
        let mut row = replica.clone();
        row.unassigned_info = Some(UnassignedInfo::new(UnassignedReason::NodeLeft));
        allocation.routing_nodes_mut().push_unassigned(row);

        let allocator = ReplicaShardAllocator::new(Arc::new(StaticShardStateProvider::with(
            vec![(
                "node-2",
                NodeShardState::with_copy(AllocationId::from_string("old-replica")),
            )],
        )));
        allocator.allocate_unassigned(&mut allocation, &deciders());

        let ignored = allocation.routing_nodes().ignored();
        assert_eq!(ignored.len(), 1);
        assert_eq!(
            ignored[0].unassigned_info.as_ref().unwrap().allocation_status,
            AllocationStatus::DelayedAllocation
        );
    }
}
