//! Weight-based shard balancing
//!
//! Weighs every node by its total shard count and its per-index shard
//! count, both relative to the cluster average. Unassigned shards the
//! gateway allocators left behind go to the lightest admissible node;
//! started shards move off nodes the deciders evict them from; and while
//! the weight spread of an index exceeds the configured threshold, shards
//! relocate from the heaviest node to the lightest.

use tracing::debug;

use super::deciders::AllocationDeciders;
use super::decision::DecisionKind;
use super::RoutingAllocation;
use crate::routing::{AllocationStatus, ShardRouting};

const MAX_REBALANCE_PASSES: usize = 10;

pub struct BalancedShardsAllocator;

impl BalancedShardsAllocator {
    /// Run the three balancing stages in order.
    pub fn allocate(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
    ) {
        self.allocate_unassigned(allocation, deciders);
        self.move_shards(allocation, deciders);
        self.rebalance(allocation, deciders);
    }

    /// Weight of a node for shards of one index; positive means heavier
    /// than average.
    fn weight(
        &self,
        allocation: &RoutingAllocation<'_>,
        node_id: &str,
        index_uuid: &str,
    ) -> f64 {
        let balance = &allocation.settings().allocation.balance;
        let node_count = allocation
            .nodes()
            .data_nodes()
            .count()
            .max(1) as f64;
        let total_shards = allocation.routing_nodes().assigned_shards().count() as f64;
        let index_shards = allocation
            .routing_nodes()
            .assigned_shards()
            .filter(|s| s.shard_id.index_uuid == index_uuid)
            .count() as f64;

        let shard_term = allocation.routing_nodes().node_shard_count(node_id) as f64
            - total_shards / node_count;
        let index_term = allocation
            .routing_nodes()
            .node_index_shard_count(node_id, index_uuid) as f64
            - index_shards / node_count;

        balance.shard_balance_factor * shard_term + balance.index_balance_factor * index_term
    }

    /// Place whatever is still unassigned on the lightest admissible node.
    fn allocate_unassigned(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
    ) {
        let unassigned = allocation.routing_nodes_mut().take_unassigned();
        for shard in unassigned {
            // A replica cannot recover before its primary is active.
            if !shard.primary
                && allocation
                    .routing_nodes()
                    .active_primary(&shard.shard_id)
                    .is_none()
            {
                allocation.ignore_shard(shard, AllocationStatus::NoAttempt);
                continue;
            }

            let mut best: Option<(String, f64)> = None;
            let mut throttled = false;
            let node_ids: Vec<String> = allocation
                .nodes()
                .data_nodes()
                .map(|n| n.node_id.clone())
                .collect();
            for node_id in node_ids {
                let decision = deciders.can_allocate(&shard, &node_id, allocation);
                match decision.kind() {
                    DecisionKind::Yes => {
                        let weight =
                            self.weight(allocation, &node_id, &shard.shard_id.index_uuid);
                        let better = match &best {
                            None => true,
                            Some((best_node, best_weight)) => {
                                weight < *best_weight
                                    || (weight == *best_weight && node_id < *best_node)
                            }
                        };
                        if better {
                            best = Some((node_id, weight));
                        }
                    }
                    DecisionKind::Throttle => throttled = true,
                    DecisionKind::No => {}
                }
            }

            match best {
                Some((node_id, _)) => {
                    debug!(shard = %shard.shard_id, node = %node_id, "balancer allocating shard");
                    allocation.initialize_shard(&shard, &node_id, None, None);
                }
                None if throttled => {
                    allocation.ignore_shard(shard, AllocationStatus::DecidersThrottled)
                }
                None => allocation.ignore_shard(shard, AllocationStatus::DecidersNo),
            }
        }
    }

    /// Relocate started shards the deciders no longer allow to remain.
    fn move_shards(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
    ) {
        let node_ids: Vec<String> = allocation
            .routing_nodes()
            .node_ids()
            .map(str::to_string)
            .collect();
        for node_id in &node_ids {
            let evictees: Vec<ShardRouting> = allocation
                .routing_nodes()
                .shards_on_node(node_id)
                .iter()
                .filter(|s| s.started())
                .filter(|s| deciders.can_remain(s, node_id, allocation).decision().is_no())
                .cloned()
                .collect();

            for shard in evictees {
                match self.pick_move_target(&shard, node_id, allocation, deciders) {
                    Some(target) => {
                        debug!(
                            shard = %shard.shard_id,
                            from = %node_id,
                            to = %target,
                            "moving shard off its node"
                        );
                        let size = allocation.shard_size(&shard);
                        allocation
                            .routing_nodes_mut()
                            .relocate_shard(&shard, &target, Some(size));
                        allocation.mark_changed();
                    }
                    None => {
                        debug!(
                            shard = %shard.shard_id,
                            node = %node_id,
                            "shard must move but no node can take it"
                        );
                    }
                }
            }
        }
    }

    fn pick_move_target(
        &self,
        shard: &ShardRouting,
        from_node: &str,
        allocation: &RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
    ) -> Option<String> {
        allocation
            .nodes()
            .data_nodes()
            .filter(|n| n.node_id != from_node)
            .filter(|n| deciders.can_allocate(shard, &n.node_id, allocation).is_yes())
            .map(|n| {
                let weight = self.weight(allocation, &n.node_id, &shard.shard_id.index_uuid);
                (n.node_id.clone(), weight)
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(node_id, _)| node_id)
    }

    /// While an index's weight spread exceeds the threshold, relocate one of
    /// its started shards from the heaviest node to the lightest.
    fn rebalance(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
    ) {
        let threshold = allocation.settings().allocation.balance.threshold;
        let index_uuids: Vec<String> =
            allocation.metadata().indices.keys().cloned().collect();

        for _ in 0..MAX_REBALANCE_PASSES {
            let mut moved = false;
            for uuid in &index_uuids {
                let mut weights: Vec<(String, f64)> = allocation
                    .nodes()
                    .data_nodes()
                    .map(|n| (n.node_id.clone(), self.weight(allocation, &n.node_id, uuid)))
                    .collect();
                if weights.len() < 2 {
                    continue;
                }
                weights.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                let (lightest, light_weight) = weights.first().cloned().expect("non-empty");
                let (heaviest, heavy_weight) = weights.last().cloned().expect("non-empty");
                if heavy_weight - light_weight <= threshold {
                    continue;
                }

                let candidates: Vec<ShardRouting> = allocation
                    .routing_nodes()
                    .shards_on_node(&heaviest)
                    .iter()
                    .filter(|s| s.started() && s.shard_id.index_uuid == *uuid)
                    .cloned()
                    .collect();
                for shard in candidates {
                    if deciders.can_allocate(&shard, &lightest, allocation).is_yes() {
                        debug!(
                            shard = %shard.shard_id,
                            from = %heaviest,
                            to = %lightest,
                            "rebalancing shard"
                        );
                        let size = allocation.shard_size(&shard);
                        allocation
                            .routing_nodes_mut()
                            .relocate_shard(&shard, &lightest, Some(size));
                        allocation.mark_changed();
                        moved = true;
                        break;
                    }
                }
            }
            if !moved {
                break;
            }
        }
    }
}
