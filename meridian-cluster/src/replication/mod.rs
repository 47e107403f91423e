//! Primary/replica replication
//!
//! Coordinates one write across a primary and its tracked replicas,
//! maintaining per-copy local and global checkpoints and handling partial
//! failure: stale copies are reported to the master, transient errors are
//! retried, and a demoted primary fails itself rather than acknowledge a
//! write it no longer owns.

mod active_shards;
mod group;
mod operation;

pub use active_shards::ActiveShardCount;
pub use group::ReplicationGroup;
pub use operation::{
    CheckpointError, PrimaryContext, PrimaryResult, ReplicaResponse, ReplicasProxy,
    ReplicationError, ReplicationFailure, ReplicationOperation, ShardInfo,
};
