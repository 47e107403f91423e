//! Caps concurrent recoveries per node.
//!
//! Incoming: at most `node_concurrent_incoming_recoveries` INITIALIZING
//! copies per node. Outgoing: the same cap on RELOCATING sources, applied to
//! the node data would stream from (the relocation source, or the primary's
//! node for a peer-recovering replica).

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::RoutingAllocation;
use crate::routing::ShardRouting;

pub struct ThrottlingAllocationDecider;

impl AllocationDecider for ThrottlingAllocationDecider {
    fn name(&self) -> &'static str {
        "throttling"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node_id: &str,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        let settings = &allocation.settings().allocation;

        let incoming = allocation.routing_nodes().incoming_recoveries(node_id);
        if incoming >= settings.node_concurrent_incoming_recoveries {
            return Decision::Throttle(format!(
                "node [{node_id}] already has {incoming} incoming recoveries \
                 (limit {})",
                settings.node_concurrent_incoming_recoveries
            ));
        }

        // Recoveries stream from somewhere: a relocation streams from the
        // current node, a replica recovery streams from the primary.
        let source_node = if shard.assigned() {
            shard.current_node_id.clone()
        } else if !shard.primary {
            allocation
                .routing_nodes()
                .active_primary(&shard.shard_id)
                .and_then(|p| p.current_node_id.clone())
        } else {
            None
        };

        if let Some(source) = source_node {
            let outgoing = allocation.routing_nodes().outgoing_recoveries(&source);
            if outgoing >= settings.node_concurrent_outgoing_recoveries {
                return Decision::Throttle(format!(
                    "source node [{source}] already has {outgoing} outgoing \
                     recoveries (limit {})",
                    settings.node_concurrent_outgoing_recoveries
                ));
            }
        }

        Decision::Yes
    }
}
