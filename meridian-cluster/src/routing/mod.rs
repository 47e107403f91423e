//! Shard routing: who hosts which copy of which shard
//!
//! The routing table is an immutable, versioned value; a reroute pass turns
//! it into a mutable by-node view ([`RoutingNodes`]), mutates that, and
//! builds a fresh table from the result.

mod index_table;
mod nodes;
mod shard;
mod shard_table;
mod table;

pub use index_table::{IndexRoutingTable, IndexRoutingTableBuilder};
pub use nodes::RoutingNodes;
pub use shard::{
    AllocationId, AllocationStatus, IndexUuid, RecoverySource, ShardId, ShardRouting,
    ShardRoutingState, UnassignedInfo, UnassignedReason,
};
pub use shard_table::{IndexShardRoutingTable, IndexShardRoutingTableBuilder};
pub use table::{RoutingTable, RoutingTableBuilder, ShardGroup, ShardPredicate};
