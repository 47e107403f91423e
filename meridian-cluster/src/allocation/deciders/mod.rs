//! Pluggable allocation deciders
//!
//! A decider answers three questions: may this copy be allocated to this
//! node, may it remain there, and (primaries only) may it be force-allocated
//! there even though regular allocation said no.

mod disk_threshold;
mod enable;
mod same_shard;
mod throttling;

pub use disk_threshold::{DiskThresholdDecider, DiskUsage, Watermark};
pub use enable::EnableAllocationDecider;
pub use same_shard::SameShardAllocationDecider;
pub use throttling::ThrottlingAllocationDecider;

use super::decision::{AggregatedDecision, DeciderDecision, Decision, DecisionKind};
use super::RoutingAllocation;
use crate::routing::ShardRouting;

/// One allocation rule.
pub trait AllocationDecider: Send + Sync {
    /// Name used in explain output and logs
    fn name(&self) -> &'static str;

    /// May `shard` be allocated to `node_id`?
    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        _node_id: &str,
        _allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Decision::Yes
    }

    /// May `shard` remain on `node_id`?
    fn can_remain(
        &self,
        _shard: &ShardRouting,
        _node_id: &str,
        _allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        Decision::Yes
    }

    /// May an unassignable primary be forced onto `node_id` anyway?
    fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node_id: &str,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.can_allocate(shard, node_id, allocation)
    }
}

/// An ordered decider list with fold semantics.
pub struct AllocationDeciders {
    deciders: Vec<Box<dyn AllocationDecider>>,
    debug: bool,
}

impl AllocationDeciders {
    pub fn new(deciders: Vec<Box<dyn AllocationDecider>>) -> Self {
        Self {
            deciders,
            debug: false,
        }
    }

    /// Preserve every individual decision for explain output. Disables the
    /// short-circuit on the first no.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn can_allocate(
        &self,
        shard: &ShardRouting,
        node_id: &str,
        allocation: &RoutingAllocation<'_>,
    ) -> AggregatedDecision {
        self.fold(|decider| decider.can_allocate(shard, node_id, allocation))
    }

    pub fn can_remain(
        &self,
        shard: &ShardRouting,
        node_id: &str,
        allocation: &RoutingAllocation<'_>,
    ) -> AggregatedDecision {
        self.fold(|decider| decider.can_remain(shard, node_id, allocation))
    }

    pub fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node_id: &str,
        allocation: &RoutingAllocation<'_>,
    ) -> AggregatedDecision {
        self.fold(|decider| decider.can_force_allocate_primary(shard, node_id, allocation))
    }

    fn fold(&self, ask: impl Fn(&dyn AllocationDecider) -> Decision) -> AggregatedDecision {
        let mut explanations = Vec::new();
        let mut worst = Decision::Yes;
        for decider in &self.deciders {
            let decision = ask(decider.as_ref());
            if decision.kind() > worst.kind() {
                worst = decision.clone();
            }
            if self.debug {
                explanations.push(DeciderDecision {
                    decider: decider.name(),
                    decision,
                });
            } else if worst.kind() == DecisionKind::No {
                // Nothing can override a no; skip the rest.
                return AggregatedDecision::new(worst, explanations);
            }
        }
        AggregatedDecision::new(worst, explanations)
    }
}
