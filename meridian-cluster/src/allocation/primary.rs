//! Unassigned-primary allocation
//!
//! Primaries recovering from an existing store or a snapshot may only be
//! placed where a usable copy lives; promoting a copy the master does not
//! consider in-sync would silently lose acknowledged writes. The allocator
//! therefore works exclusively from fetched per-node store state and the
//! shard's in-sync allocation id set.

use std::sync::Arc;

use tracing::debug;

use super::deciders::AllocationDeciders;
use super::decision::DecisionKind;
use super::{NodeShardState, RoutingAllocation, ShardStateProvider};
use crate::routing::{
    AllocationId, AllocationStatus, RecoverySource, ShardRouting, UnassignedReason,
};

/// A node holding an in-sync copy of the shard.
#[derive(Debug, Clone)]
struct CopyCandidate {
    node_id: String,
    allocation_id: AllocationId,
}

pub struct PrimaryShardAllocator {
    provider: Arc<dyn ShardStateProvider>,
}

impl PrimaryShardAllocator {
    pub fn new(provider: Arc<dyn ShardStateProvider>) -> Self {
        Self { provider }
    }

    /// Whether this allocator owns the decision for a shard. Fresh empty
    /// primaries and replicas belong to the balancer.
    fn is_responsible(shard: &ShardRouting) -> bool {
        shard.primary
            && shard.unassigned()
            && matches!(
                shard.recovery_source,
                Some(RecoverySource::ExistingStore) | Some(RecoverySource::Snapshot { .. })
            )
    }

    /// Run one pass over the unassigned queue.
    pub fn allocate_unassigned(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
    ) {
        let unassigned = allocation.routing_nodes_mut().take_unassigned();
        for shard in unassigned {
            if !Self::is_responsible(&shard) {
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
        let in_sync = allocation.in_sync_ids(&shard.shard_id);
        let reason = shard.unassigned_info.as_ref().map(|i| i.reason);

        // A just-created index has no copies anywhere yet; the shard engine
        // creates them once routing assigns the shard elsewhere.
        if in_sync.is_empty() && reason == Some(UnassignedReason::IndexCreated) {
            allocation.routing_nodes_mut().push_unassigned(shard);
            return;
        }

        let fetch = self.provider.shard_state(&shard, allocation.nodes());
        if !fetch.has_data {
            allocation.ignore_shard(shard, AllocationStatus::FetchingShardData);
            return;
        }

        if matches!(shard.recovery_source, Some(RecoverySource::Snapshot { .. })) {
            self.allocate_restore(shard, allocation, deciders, &fetch.data);
            return;
        }

        // Nodes reporting an in-sync id with a usable store. A held shard
        // lock means the data is there, just busy; a corrupt store does not
        // qualify.
        let candidates: Vec<CopyCandidate> = fetch
            .data
            .iter()
            .filter_map(|(node_id, state)| {
                let allocation_id = state.allocation_id.clone()?;
                if !in_sync.contains(&allocation_id) {
                    return None;
                }
                if state.failure.as_ref().is_some_and(|f| !f.copy_usable()) {
                    return None;
                }
                Some(CopyCandidate {
                    node_id: node_id.clone(),
                    allocation_id,
                })
            })
            .collect();

        if candidates.is_empty() {
            debug!(shard = %shard.shard_id, "no node holds an in-sync copy");
            allocation.ignore_shard(shard, AllocationStatus::NoValidShardCopy);
            return;
        }

        // Prefer the node that last held the primary; otherwise order by
        // descending allocation id, which is arbitrary but stable.
        let previous_node = shard
            .unassigned_info
            .as_ref()
            .and_then(|i| i.last_allocated_node_id.clone());
        let chosen = candidates
            .iter()
            .find(|c| Some(&c.node_id) == previous_node.as_ref())
            .cloned()
            .unwrap_or_else(|| {
                candidates
                    .iter()
                    .max_by(|a, b| a.allocation_id.cmp(&b.allocation_id))
                    .expect("candidates is non-empty")
                    .clone()
            });

        let decision = deciders.can_allocate(&shard, &chosen.node_id, allocation);
        match decision.kind() {
            DecisionKind::Yes => {
                debug!(shard = %shard.shard_id, node = %chosen.node_id, "allocating primary");
                allocation.initialize_shard(
                    &shard,
                    &chosen.node_id,
                    Some(chosen.allocation_id),
                    None,
                );
            }
            DecisionKind::Throttle => {
                allocation.ignore_shard(shard, AllocationStatus::DecidersThrottled);
            }
            DecisionKind::No => {
                let force = deciders.can_force_allocate_primary(&shard, &chosen.node_id, allocation);
                if force.is_yes() {
                    debug!(
                        shard = %shard.shard_id,
                        node = %chosen.node_id,
                        "force-allocating primary despite deciders"
                    );
                    allocation.initialize_shard(
                        &shard,
                        &chosen.node_id,
                        Some(chosen.allocation_id),
                        None,
                    );
                } else {
                    allocation.ignore_shard(shard, AllocationStatus::DecidersNo);
                }
            }
        }
    }

    /// Snapshot restore: the copy need not exist locally. A restore onto a
    /// node whose store lock is held stays unassigned rather than forcing.
    fn allocate_restore(
        &self,
        shard: ShardRouting,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
        fetched: &std::collections::BTreeMap<String, NodeShardState>,
    ) {
        let size = allocation.shard_size(&shard);
        if size == 0 {
            // Snapshot size not known yet; retried once stats arrive.
            allocation.ignore_shard(shard, AllocationStatus::FetchingShardData);
            return;
        }

        let node_ids: Vec<String> = allocation
            .nodes()
            .data_nodes()
            .map(|n| n.node_id.clone())
            .collect();

        let mut throttled = false;
        for node_id in &node_ids {
            let decision = deciders.can_allocate(&shard, node_id, allocation);
            match decision.kind() {
                DecisionKind::Yes => {
                    allocation.initialize_shard(&shard, node_id, None, Some(size));
                    return;
                }
                DecisionKind::Throttle => throttled = true,
                DecisionKind::No => {}
            }
        }
        if throttled {
            allocation.ignore_shard(shard, AllocationStatus::DecidersThrottled);
            return;
        }

        // Every decider said no: a fresh restore is forgiving, force onto
        // the first node without a held store lock.
        let forced = node_ids.iter().find(|node_id| {
            !matches!(
                fetched.get(*node_id).and_then(|s| s.failure.as_ref()),
                Some(failure) if failure.copy_usable()
            )
        });
        match forced {
            Some(node_id) => {
                debug!(shard = %shard.shard_id, node = %node_id, "force-allocating restore");
                let node_id = node_id.clone();
                allocation.initialize_shard(&shard, &node_id, None, Some(size));
            }
            None => {
                allocation.ignore_shard(shard, AllocationStatus::DecidersNo);
            }
        }
    }
}
