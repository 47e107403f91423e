//! The `cluster.routing.allocation.enable` switch.

use super::AllocationDecider;
use crate::allocation::decision::Decision;
use crate::allocation::RoutingAllocation;
use crate::config::AllocationEnable;
use crate::routing::{RecoverySource, ShardRouting};

pub struct EnableAllocationDecider;

impl AllocationDecider for EnableAllocationDecider {
    fn name(&self) -> &'static str {
        "enable"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node_id: &str,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        let enable = allocation.settings().allocation.enable;
        let allowed = match enable {
            AllocationEnable::All => true,
            AllocationEnable::None => false,
            AllocationEnable::Primaries => shard.primary,
            AllocationEnable::Replicas => !shard.primary,
            AllocationEnable::NewPrimaries => {
                shard.primary
                    && matches!(shard.recovery_source, Some(RecoverySource::EmptyStore))
            }
        };
        if allowed {
            Decision::Yes
        } else {
            Decision::No(format!("allocation is disabled by setting [{enable:?}]"))
        }
    }
}
