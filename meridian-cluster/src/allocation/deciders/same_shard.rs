//! Forbids two copies of the same shard on one node.

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::RoutingAllocation;
use crate::routing::ShardRouting;

pub struct SameShardAllocationDecider;

impl AllocationDecider for SameShardAllocationDecider {
    fn name(&self) -> &'static str {
        "same_shard"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node_id: &str,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        if allocation
            .routing_nodes()
            .has_shard_copy_on_node(&shard.shard_id, node_id)
        {
            Decision::No(format!(
                "a copy of {} is already allocated to node [{node_id}]",
                shard.shard_id
            ))
        } else {
            Decision::Yes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::tests_support::AllocationParts;
    use crate::routing::RoutingTable;
    use crate::state::{DiscoveryNode, DiscoveryNodes, IndexMetadata, Metadata};

    #[test]
    fn test_rejects_node_already_holding_a_copy() {
        let meta = IndexMetadata::builder("logs")
            .number_of_shards(1)
            .number_of_replicas(1)
            .build();
        let table = RoutingTable::builder().add_as_new(&meta).build();
        let nodes = DiscoveryNodes::builder()
            .add(DiscoveryNode::new("node-1", "alpha", "10.0.0.1:4300"))
            .add(DiscoveryNode::new("node-2", "beta", "10.0.0.2:4300"))
            .build();
        let parts = AllocationParts::new(
            Metadata::builder().put(meta.clone()).build(),
            table,
            nodes,
        );
        let mut allocation = parts.allocation();

        // Put the primary on node-1.
        let unassigned = allocation.routing_nodes_mut().take_unassigned();
        let (primary, replica): (Vec<_>, Vec<_>) =
            unassigned.into_iter().partition(|s| s.primary);
        allocation
            .routing_nodes_mut()
            .initialize_shard(&primary[0], "node-1", None, None);

        let decider = SameShardAllocationDecider;
        assert!(decider
            .can_allocate(&replica[0], "node-1", &allocation)
            .is_no());
        assert!(decider
            .can_allocate(&replica[0], "node-2", &allocation)
            .is_yes());
    }
}
