//! Meridian Cluster - cluster coordination for distributed Meridian deployments
//!
//! This crate keeps a globally-replicated cluster state consistent across
//! nodes and drives the placement and replication of sharded data.
//!
//! # Architecture
//!
//! - **State**: immutable, versioned, diffable cluster state (nodes,
//!   metadata, routing, blocks); masters publish diffs once followers know a
//!   baseline
//! - **Routing**: per-index, per-shard copy assignments with a mutable
//!   by-node view for allocation passes
//! - **Fetch**: background per-node shard-state gathering with round-based
//!   staleness detection
//! - **Allocation**: pluggable deciders (disk watermark, same-shard,
//!   throttling, enable) under gateway allocators and a weight balancer
//! - **Replication**: primary → replica write coordination with checkpoint
//!   bookkeeping, bounded retries, and stale-copy demotion
//! - **Persistence**: checksummed, atomically-renamed snapshots on every
//!   data path (via the `meridian-state` crate)
//!
//! # Threading
//!
//! Cluster states are immutable values published by pointer swap; a single
//! applier thread produces transitions and runs allocation passes. Fetch and
//! replication are async and never block the applier.

pub mod allocation;
pub mod config;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod persistence;
pub mod replication;
pub mod routing;
pub mod state;

/// Version of the coordination wire/disk protocol spoken by this build.
/// Serializers accept any peer version down to the legacy format.
pub const PROTOCOL_VERSION: u64 = 4;

pub use allocation::{
    AllocationDecider, AllocationDeciders, AllocationService, AsyncShardStateProvider,
    BalancedShardsAllocator, ClusterInfo, Decision, DecisionKind, DiskThresholdDecider, DiskUsage,
    FailedShard, NodeShardState, PrimaryShardAllocator, ReplicaShardAllocator, RoutingAllocation,
    ShardStateProvider, StoreFailure, Watermark,
};
pub use config::{AllocationEnable, ClusterSettings};
pub use error::ClusterError;
pub use fetch::{AsyncShardFetch, FetchResult, RerouteNotifier, ShardStateLister};
pub use persistence::ClusterStatePersistence;
pub use replication::{
    ActiveShardCount, PrimaryContext, ReplicasProxy, ReplicationError, ReplicationGroup,
    ReplicationOperation, ShardInfo,
};
pub use routing::{
    AllocationId, IndexRoutingTable, IndexShardRoutingTable, RoutingNodes, RoutingTable, ShardId,
    ShardRouting, ShardRoutingState, UnassignedInfo, UnassignedReason,
};
pub use state::{ClusterState, ClusterStateDiff, DiscoveryNode, DiscoveryNodes, Diffable, Metadata};
