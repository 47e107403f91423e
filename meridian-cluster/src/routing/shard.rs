//! Shard-level routing types
//!
//! A [`ShardRouting`] describes one copy of a shard: where it lives, whether
//! it is the primary, and how it is (or will be) recovered. Routing values
//! are immutable; state transitions produce new values and panic on illegal
//! source states, which are programming errors by contract.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an index, stable across renames.
pub type IndexUuid = String;

/// Identity of one shard of one index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    /// Index the shard belongs to
    pub index_uuid: IndexUuid,

    /// Shard number within the index
    pub shard: u32,
}

impl ShardId {
    /// Create a new shard id
    pub fn new(index_uuid: impl Into<IndexUuid>, shard: u32) -> Self {
        Self {
            index_uuid: index_uuid.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index_uuid, self.shard)
    }
}

/// Unique identity of a shard *copy*, minted when the copy is first
/// initialized. A relocation target gets its own id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllocationId(String);

impl AllocationId {
    /// Mint a fresh allocation id
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing id (e.g. one reported by a node's store)
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a shard copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRoutingState {
    /// Not allocated to any node
    Unassigned,
    /// Allocated, recovery in progress
    Initializing,
    /// Active and serving
    Started,
    /// Active, moving to another node
    Relocating,
}

/// How a shard copy obtains its initial data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySource {
    /// Fresh empty store (new index)
    EmptyStore,
    /// Re-use an existing on-disk copy
    ExistingStore,
    /// Copy over the wire from the primary
    Peer,
    /// Restore from a snapshot
    Snapshot {
        snapshot_id: String,
        index_id: String,
    },
    /// Build from other local shards (shrink/split)
    LocalShards,
}

/// Why a shard copy is unassigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedReason {
    /// Index was just created
    IndexCreated,
    /// Full-cluster recovery found the index
    ClusterRecovered,
    /// Replica count was raised
    ReplicaAdded,
    /// A previous allocation attempt failed
    AllocationFailed,
    /// The hosting node left the cluster
    NodeLeft,
    /// Explicitly rerouted
    Rerouted,
    /// A closed index was reinitialized
    ReinitializedClosedIndex,
    /// A closed index was reopened
    IndexReopened,
    /// A new index is being restored from a snapshot
    NewIndexRestored,
    /// An existing index is being restored from a snapshot
    ExistingIndexRestored,
}

/// Outcome of the most recent allocation attempt for an unassigned copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// No allocator has looked at the shard yet
    #[default]
    NoAttempt,
    /// Every decider said no
    DecidersNo,
    /// No node holds a usable copy
    NoValidShardCopy,
    /// The chosen node is currently throttled
    DecidersThrottled,
    /// Waiting for shard-state fetch results
    FetchingShardData,
    /// Waiting out the node-left reallocation delay
    DelayedAllocation,
}

/// Metadata about why and when a copy became unassigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignedInfo {
    /// Why the copy is unassigned
    pub reason: UnassignedReason,

    /// Human-readable detail, if any
    pub message: Option<String>,

    /// Consecutive failed allocation attempts
    pub failed_allocations: u32,

    /// Outcome of the latest allocation attempt
    pub allocation_status: AllocationStatus,

    /// When the copy became unassigned (Unix epoch milliseconds)
    pub unassigned_at_millis: u64,

    /// Node that last held this copy, if it was ever allocated
    pub last_allocated_node_id: Option<String>,
}

impl UnassignedInfo {
    /// Create an unassigned-info record timestamped now
    pub fn new(reason: UnassignedReason) -> Self {
        Self {
            reason,
            message: None,
            failed_allocations: 0,
            allocation_status: AllocationStatus::NoAttempt,
            unassigned_at_millis: now_millis(),
            last_allocated_node_id: None,
        }
    }

    /// Attach a human-readable message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Record the node that last held the copy
    pub fn with_last_allocated_node(mut self, node_id: impl Into<String>) -> Self {
        self.last_allocated_node_id = Some(node_id.into());
        self
    }

    /// Copy of this record with a new allocation status
    pub fn with_status(&self, status: AllocationStatus) -> Self {
        let mut info = self.clone();
        info.allocation_status = status;
        info
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One copy of one shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRouting {
    /// Shard this copy belongs to
    pub shard_id: ShardId,

    /// Node hosting the copy; `None` iff unassigned
    pub current_node_id: Option<String>,

    /// For a RELOCATING source: the target node. For a relocation target
    /// (INITIALIZING): the source node.
    pub relocating_node_id: Option<String>,

    /// Whether this copy is the primary
    pub primary: bool,

    /// Lifecycle state
    pub state: ShardRoutingState,

    /// Identity of the copy; `None` while unassigned
    pub allocation_id: Option<AllocationId>,

    /// Allocation id minted for the relocation target, present only on a
    /// RELOCATING source so the synthesized target entry is stable.
    pub target_allocation_id: Option<AllocationId>,

    /// How the copy recovers; cleared once started
    pub recovery_source: Option<RecoverySource>,

    /// Why the copy is unassigned; cleared once started
    pub unassigned_info: Option<UnassignedInfo>,

    /// Expected on-disk size in bytes, when known
    pub expected_shard_size: Option<u64>,
}

impl ShardRouting {
    /// Create an unassigned copy
    pub fn new_unassigned(
        shard_id: ShardId,
        primary: bool,
        recovery_source: RecoverySource,
        unassigned_info: UnassignedInfo,
    ) -> Self {
        Self {
            shard_id,
            current_node_id: None,
            relocating_node_id: None,
            primary,
            state: ShardRoutingState::Unassigned,
            allocation_id: None,
            target_allocation_id: None,
            recovery_source: Some(recovery_source),
            unassigned_info: Some(unassigned_info),
            expected_shard_size: None,
        }
    }

    // ========================================
    // Predicates
    // ========================================

    /// Not allocated to any node
    pub fn unassigned(&self) -> bool {
        self.state == ShardRoutingState::Unassigned
    }

    /// Recovery in progress
    pub fn initializing(&self) -> bool {
        self.state == ShardRoutingState::Initializing
    }

    /// Active and serving
    pub fn started(&self) -> bool {
        self.state == ShardRoutingState::Started
    }

    /// Active, moving to another node
    pub fn relocating(&self) -> bool {
        self.state == ShardRoutingState::Relocating
    }

    /// Started or relocating
    pub fn active(&self) -> bool {
        self.started() || self.relocating()
    }

    /// Allocated to a node
    pub fn assigned(&self) -> bool {
        self.current_node_id.is_some()
    }

    /// Initializing as the target of a relocation
    pub fn is_relocation_target(&self) -> bool {
        self.initializing() && self.relocating_node_id.is_some()
    }

    /// Whether this copy and `other` are the same allocation
    pub fn is_same_allocation(&self, other: &ShardRouting) -> bool {
        self.shard_id == other.shard_id && self.allocation_id == other.allocation_id
    }

    /// Whether the copy currently lives on `node_id`
    pub fn assigned_to_node(&self, node_id: &str) -> bool {
        self.current_node_id.as_deref() == Some(node_id)
    }

    // ========================================
    // Transitions
    // ========================================

    /// Unassigned → initializing on `node_id`.
    ///
    /// Passing `existing_allocation_id` re-adopts a copy already on disk at
    /// the node (existing-store primary recovery); otherwise a fresh id is
    /// minted.
    pub fn initialize(
        &self,
        node_id: &str,
        existing_allocation_id: Option<AllocationId>,
        expected_shard_size: Option<u64>,
    ) -> Self {
        assert!(
            self.unassigned(),
            "cannot initialize {} in state {:?}",
            self.shard_id,
            self.state
        );
        let mut shard = self.clone();
        shard.state = ShardRoutingState::Initializing;
        shard.current_node_id = Some(node_id.to_string());
        shard.allocation_id = Some(existing_allocation_id.unwrap_or_else(AllocationId::new_random));
        shard.expected_shard_size = expected_shard_size;
        shard
    }

    /// Initializing → started. Clears recovery bookkeeping.
    pub fn moved_to_started(&self) -> Self {
        assert!(
            self.initializing(),
            "cannot start {} in state {:?}",
            self.shard_id,
            self.state
        );
        let mut shard = self.clone();
        shard.state = ShardRoutingState::Started;
        shard.relocating_node_id = None;
        shard.recovery_source = None;
        shard.unassigned_info = None;
        shard.expected_shard_size = None;
        shard
    }

    /// Started → relocating towards `target_node`.
    pub fn relocate(&self, target_node: &str, expected_shard_size: Option<u64>) -> Self {
        assert!(
            self.started(),
            "cannot relocate {} in state {:?}",
            self.shard_id,
            self.state
        );
        let mut shard = self.clone();
        shard.state = ShardRoutingState::Relocating;
        shard.relocating_node_id = Some(target_node.to_string());
        shard.target_allocation_id = Some(AllocationId::new_random());
        shard.expected_shard_size = expected_shard_size;
        shard
    }

    /// Relocating → started (the move was cancelled).
    pub fn cancel_relocation(&self) -> Self {
        assert!(
            self.relocating(),
            "cannot cancel relocation of {} in state {:?}",
            self.shard_id,
            self.state
        );
        let mut shard = self.clone();
        shard.state = ShardRoutingState::Started;
        shard.relocating_node_id = None;
        shard.target_allocation_id = None;
        shard.expected_shard_size = None;
        shard
    }

    /// The INITIALIZING entry representing the target of this relocation.
    pub fn build_target_relocating_shard(&self) -> Self {
        assert!(
            self.relocating(),
            "{} has no relocation target in state {:?}",
            self.shard_id,
            self.state
        );
        Self {
            shard_id: self.shard_id.clone(),
            current_node_id: self.relocating_node_id.clone(),
            relocating_node_id: self.current_node_id.clone(),
            primary: self.primary,
            state: ShardRoutingState::Initializing,
            allocation_id: self.target_allocation_id.clone(),
            target_allocation_id: None,
            recovery_source: Some(RecoverySource::Peer),
            unassigned_info: None,
            expected_shard_size: self.expected_shard_size,
        }
    }

    /// Any assigned state → unassigned. Primaries fall back to their on-disk
    /// copy, replicas re-recover from the primary.
    pub fn moved_to_unassigned(&self, unassigned_info: UnassignedInfo) -> Self {
        assert!(
            self.assigned(),
            "{} is already unassigned",
            self.shard_id
        );
        let recovery_source = if self.primary {
            RecoverySource::ExistingStore
        } else {
            RecoverySource::Peer
        };
        Self {
            shard_id: self.shard_id.clone(),
            current_node_id: None,
            relocating_node_id: None,
            primary: self.primary,
            state: ShardRoutingState::Unassigned,
            allocation_id: None,
            target_allocation_id: None,
            recovery_source: Some(recovery_source),
            unassigned_info: Some(unassigned_info),
            expected_shard_size: None,
        }
    }

    /// Panic unless the §3-style structural invariants hold.
    pub fn assert_consistent(&self) {
        match self.state {
            ShardRoutingState::Unassigned => {
                assert!(self.current_node_id.is_none() && self.relocating_node_id.is_none());
                assert!(self.allocation_id.is_none());
                assert!(self.unassigned_info.is_some());
            }
            ShardRoutingState::Initializing => {
                assert!(self.current_node_id.is_some());
                assert!(self.allocation_id.is_some());
            }
            ShardRoutingState::Started => {
                assert!(self.current_node_id.is_some() && self.relocating_node_id.is_none());
                assert!(self.allocation_id.is_some());
            }
            ShardRoutingState::Relocating => {
                assert!(self.current_node_id.is_some() && self.relocating_node_id.is_some());
                assert_ne!(self.current_node_id, self.relocating_node_id);
                assert!(self.allocation_id.is_some() && self.target_allocation_id.is_some());
            }
        }
    }
}

impl fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] {:?} on {:?}",
            self.shard_id,
            if self.primary { "P" } else { "R" },
            self.state,
            self.current_node_id.as_deref().unwrap_or("-"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unassigned_primary() -> ShardRouting {
        ShardRouting::new_unassigned(
            ShardId::new("idx-uuid", 0),
            true,
            RecoverySource::EmptyStore,
            UnassignedInfo::new(UnassignedReason::IndexCreated),
        )
    }

    #[test]
    fn test_full_lifecycle() {
        let shard = unassigned_primary();
        shard.assert_consistent();

        let initializing = shard.initialize("node-1", None, None);
        assert!(initializing.initializing());
        assert_eq!(initializing.current_node_id.as_deref(), Some("node-1"));
        assert!(initializing.allocation_id.is_some());
        initializing.assert_consistent();

        let started = initializing.moved_to_started();
        assert!(started.started());
        assert!(started.recovery_source.is_none());
        assert!(started.unassigned_info.is_none());
        started.assert_consistent();

        let relocating = started.relocate("node-2", Some(1024));
        assert!(relocating.relocating());
        assert_eq!(relocating.relocating_node_id.as_deref(), Some("node-2"));
        relocating.assert_consistent();

        let target = relocating.build_target_relocating_shard();
        assert!(target.is_relocation_target());
        assert_eq!(target.current_node_id.as_deref(), Some("node-2"));
        assert_eq!(target.relocating_node_id.as_deref(), Some("node-1"));
        assert_eq!(target.allocation_id, relocating.target_allocation_id);
        assert_ne!(target.allocation_id, relocating.allocation_id);
        target.assert_consistent();
    }

    #[test]
    fn test_initialize_adopts_existing_allocation_id() {
        let existing = AllocationId::from_string("copy-on-disk");
        let shard = unassigned_primary().initialize("node-1", Some(existing.clone()), None);
        assert_eq!(shard.allocation_id, Some(existing));
    }

    #[test]
    fn test_cancel_relocation() {
        let relocating = unassigned_primary()
            .initialize("node-1", None, None)
            .moved_to_started()
            .relocate("node-2", None);

        let back = relocating.cancel_relocation();
        assert!(back.started());
        assert!(back.relocating_node_id.is_none());
        assert!(back.target_allocation_id.is_none());
        assert_eq!(back.allocation_id, relocating.allocation_id);
    }

    #[test]
    fn test_failed_primary_recovers_from_existing_store() {
        let started = unassigned_primary()
            .initialize("node-1", None, None)
            .moved_to_started();

        let info = UnassignedInfo::new(UnassignedReason::NodeLeft)
            .with_last_allocated_node("node-1");
        let unassigned = started.moved_to_unassigned(info);
        assert!(unassigned.unassigned());
        assert_eq!(
            unassigned.recovery_source,
            Some(RecoverySource::ExistingStore)
        );
        assert_eq!(
            unassigned
                .unassigned_info
                .as_ref()
                .unwrap()
                .last_allocated_node_id
                .as_deref(),
            Some("node-1")
        );
        unassigned.assert_consistent();
    }

    #[test]
    fn test_failed_replica_recovers_from_peer() {
        let replica = ShardRouting::new_unassigned(
            ShardId::new("idx-uuid", 0),
            false,
            RecoverySource::Peer,
            UnassignedInfo::new(UnassignedReason::ReplicaAdded),
        )
        .initialize("node-2", None, None)
        .moved_to_started();

        let unassigned =
            replica.moved_to_unassigned(UnassignedInfo::new(UnassignedReason::NodeLeft));
        assert_eq!(unassigned.recovery_source, Some(RecoverySource::Peer));
    }

    #[test]
    #[should_panic(expected = "cannot relocate")]
    fn test_relocating_an_initializing_shard_panics() {
        unassigned_primary()
            .initialize("node-1", None, None)
            .relocate("node-2", None);
    }

    #[test]
    #[should_panic(expected = "cannot initialize")]
    fn test_double_initialize_panics() {
        unassigned_primary()
            .initialize("node-1", None, None)
            .initialize("node-2", None, None);
    }
}
