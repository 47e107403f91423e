//! The allocation engine
//!
//! `reroute` is a single pass over the cluster state: gateway allocators
//! place unassigned primaries and replicas from fetched per-node store
//! state, the balancer fills in the rest and keeps nodes even, and the
//! result is folded back into a fresh routing table. A pass that changes
//! nothing returns the input state unchanged, so reroute is a fixed point
//! after one application.

pub mod balancer;
pub mod decision;
pub mod deciders;
pub mod primary;
pub mod replica;

pub use balancer::BalancedShardsAllocator;
pub use decision::{AggregatedDecision, DeciderDecision, Decision, DecisionKind};
pub use deciders::{
    AllocationDecider, AllocationDeciders, DiskThresholdDecider, DiskUsage,
    EnableAllocationDecider, SameShardAllocationDecider, ThrottlingAllocationDecider, Watermark,
};
pub use primary::PrimaryShardAllocator;
pub use replica::ReplicaShardAllocator;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ClusterSettings;
use crate::error::Result;
use crate::fetch::{AsyncShardFetch, FetchResult, RerouteNotifier, ShardStateLister};
use crate::metrics;
use crate::routing::{
    AllocationId, AllocationStatus, RoutingNodes, ShardId, ShardRouting, UnassignedInfo,
    UnassignedReason,
};
use crate::state::{flood_stage_block, ClusterBlocks, ClusterState, DiscoveryNodes, Metadata};

/// Per-node view of what a node has on disk for one shard, as gathered by
/// the shard-state fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeShardState {
    /// Allocation id of the on-disk copy; `None` when the node has none
    pub allocation_id: Option<AllocationId>,

    /// Store-level failure observed while opening the copy
    pub failure: Option<StoreFailure>,
}

impl NodeShardState {
    /// A node with no copy of the shard
    pub fn empty() -> Self {
        Self {
            allocation_id: None,
            failure: None,
        }
    }

    /// A node holding a healthy copy
    pub fn with_copy(allocation_id: AllocationId) -> Self {
        Self {
            allocation_id: Some(allocation_id),
            failure: None,
        }
    }
}

/// Kinds of store failure a node can report for a shard copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailure {
    /// The copy exists but its directory lock is held (e.g. a lingering
    /// recovery); the data itself is fine
    ShardLockObtainFailed(String),
    /// The copy failed checksum verification
    Corrupt(String),
    /// Any other I/O failure
    Io(String),
}

impl StoreFailure {
    /// Whether the reported copy may still be used for allocation
    pub fn copy_usable(&self) -> bool {
        matches!(self, StoreFailure::ShardLockObtainFailed(_))
    }
}

/// Per-node disk usages and per-shard sizes, supplied by the stats layer.
#[derive(Debug, Clone, Default)]
pub struct ClusterInfo {
    pub disk_usages: BTreeMap<String, DiskUsage>,
    pub shard_sizes: BTreeMap<ShardId, u64>,
}

/// Source of fetched shard state for the gateway allocators. The production
/// implementation is [`AsyncShardStateProvider`]; tests substitute fixed
/// data.
pub trait ShardStateProvider: Send + Sync {
    /// Latest fetch state for `shard`; `has_data` is false while any node
    /// request is still in flight.
    fn shard_state(&self, shard: &ShardRouting, nodes: &DiscoveryNodes)
        -> FetchResult<NodeShardState>;
}

/// [`ShardStateProvider`] backed by one [`AsyncShardFetch`] per shard.
pub struct AsyncShardStateProvider {
    lister: Arc<dyn ShardStateLister<NodeShardState>>,
    notifier: Arc<dyn RerouteNotifier>,
    fetchers: Mutex<BTreeMap<ShardId, AsyncShardFetch<NodeShardState>>>,
}

impl AsyncShardStateProvider {
    pub fn new(
        lister: Arc<dyn ShardStateLister<NodeShardState>>,
        notifier: Arc<dyn RerouteNotifier>,
    ) -> Self {
        Self {
            lister,
            notifier,
            fetchers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Invalidate every fetcher's cache entry for a node (e.g. after it
    /// rejoined with a fresh store).
    pub fn clear_cache_for_node(&self, node_id: &str) {
        for fetcher in self.fetchers.lock().values() {
            fetcher.clear_cache_for_node(node_id);
        }
    }

    /// Drop the fetcher of a shard that no longer needs gateway allocation.
    pub fn release(&self, shard_id: &ShardId) {
        if let Some(fetcher) = self.fetchers.lock().remove(shard_id) {
            fetcher.close();
        }
    }
}

impl ShardStateProvider for AsyncShardStateProvider {
    fn shard_state(
        &self,
        shard: &ShardRouting,
        nodes: &DiscoveryNodes,
    ) -> FetchResult<NodeShardState> {
        let mut fetchers = self.fetchers.lock();
        let fetcher = fetchers.entry(shard.shard_id.clone()).or_insert_with(|| {
            AsyncShardFetch::new(
                shard.shard_id.clone(),
                Arc::clone(&self.lister),
                Arc::clone(&self.notifier),
            )
        });
        fetcher
            .fetch_data(nodes, &BTreeSet::new())
            .unwrap_or_else(|_| FetchResult::fetching())
    }
}

/// Everything one reroute pass works with: the immutable inputs, the mutable
/// by-node routing view, and a change flag that decides whether a new
/// cluster state is produced at all.
pub struct RoutingAllocation<'a> {
    settings: &'a ClusterSettings,
    metadata: &'a Metadata,
    nodes: &'a DiscoveryNodes,
    cluster_info: &'a ClusterInfo,
    routing_nodes: RoutingNodes,
    changed: bool,
    now_millis: u64,
}

impl<'a> RoutingAllocation<'a> {
    pub fn new(
        settings: &'a ClusterSettings,
        metadata: &'a Metadata,
        nodes: &'a DiscoveryNodes,
        cluster_info: &'a ClusterInfo,
        routing_nodes: RoutingNodes,
    ) -> Self {
        Self {
            settings,
            metadata,
            nodes,
            cluster_info,
            routing_nodes,
            changed: false,
            now_millis: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    pub fn settings(&self) -> &ClusterSettings {
        self.settings
    }

    pub fn metadata(&self) -> &Metadata {
        self.metadata
    }

    pub fn nodes(&self) -> &DiscoveryNodes {
        self.nodes
    }

    pub fn routing_nodes(&self) -> &RoutingNodes {
        &self.routing_nodes
    }

    pub fn routing_nodes_mut(&mut self) -> &mut RoutingNodes {
        &mut self.routing_nodes
    }

    pub fn disk_usage(&self, node_id: &str) -> Option<&DiskUsage> {
        self.cluster_info.disk_usages.get(node_id)
    }

    /// Best known size of a shard copy, in bytes
    pub fn shard_size(&self, shard: &ShardRouting) -> u64 {
        shard
            .expected_shard_size
            .or_else(|| self.cluster_info.shard_sizes.get(&shard.shard_id).copied())
            .unwrap_or(0)
    }

    /// In-sync allocation ids of a shard; empty when the index is unknown
    pub fn in_sync_ids(&self, shard_id: &ShardId) -> BTreeSet<AllocationId> {
        self.metadata
            .in_sync_ids(shard_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    pub fn now_millis(&self) -> u64 {
        self.now_millis
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Leave a copy unassigned this pass. Counts as a change only when the
    /// recorded allocation status actually moved, which keeps repeated
    /// reroutes at a fixed point.
    pub fn ignore_shard(&mut self, shard: ShardRouting, status: AllocationStatus) {
        let previous = shard
            .unassigned_info
            .as_ref()
            .map(|i| i.allocation_status)
            .unwrap_or_default();
        if previous != status {
            self.changed = true;
        }
        self.routing_nodes.ignore_shard(shard, status);
    }

    /// Initialize a copy on a node and record the change.
    pub fn initialize_shard(
        &mut self,
        shard: &ShardRouting,
        node_id: &str,
        existing_allocation_id: Option<AllocationId>,
        expected_shard_size: Option<u64>,
    ) -> ShardRouting {
        self.changed = true;
        self.routing_nodes
            .initialize_shard(shard, node_id, existing_allocation_id, expected_shard_size)
    }
}

/// A shard failure reported to the master.
#[derive(Debug, Clone)]
pub struct FailedShard {
    pub routing: ShardRouting,
    pub message: String,
}

/// Drives allocation passes over cluster states.
pub struct AllocationService {
    settings: ClusterSettings,
    deciders: AllocationDeciders,
    disk_decider: DiskThresholdDecider,
    primary_allocator: PrimaryShardAllocator,
    replica_allocator: ReplicaShardAllocator,
    balancer: BalancedShardsAllocator,
}

impl AllocationService {
    /// Build the service with the standard decider stack: enable,
    /// same-shard, throttling, disk threshold.
    pub fn new(settings: ClusterSettings, provider: Arc<dyn ShardStateProvider>) -> Result<Self> {
        let deciders = AllocationDeciders::new(vec![
            Box::new(EnableAllocationDecider),
            Box::new(SameShardAllocationDecider),
            Box::new(ThrottlingAllocationDecider),
            Box::new(DiskThresholdDecider::new(&settings.allocation.disk)?),
        ]);
        let disk_decider = DiskThresholdDecider::new(&settings.allocation.disk)?;
        Ok(Self {
            settings,
            deciders,
            disk_decider,
            primary_allocator: PrimaryShardAllocator::new(Arc::clone(&provider)),
            replica_allocator: ReplicaShardAllocator::new(provider),
            balancer: BalancedShardsAllocator,
        })
    }

    /// One allocation pass. Returns the input state unchanged (same version)
    /// when nothing moved.
    pub fn reroute(
        &self,
        state: &ClusterState,
        cluster_info: &ClusterInfo,
        reason: &str,
    ) -> ClusterState {
        debug!(reason, "starting reroute");
        let routing_nodes = RoutingNodes::new(&state.routing_table, &state.nodes);
        let mut allocation = RoutingAllocation::new(
            &self.settings,
            &state.metadata,
            &state.nodes,
            cluster_info,
            routing_nodes,
        );

        self.primary_allocator
            .allocate_unassigned(&mut allocation, &self.deciders);
        self.replica_allocator
            .allocate_unassigned(&mut allocation, &self.deciders);
        self.balancer.allocate(&mut allocation, &self.deciders);

        let blocks = self.flood_stage_blocks(state, cluster_info, allocation.routing_nodes());

        if !allocation.changed() && blocks == state.blocks {
            debug!(reason, "reroute changed nothing");
            return state.clone();
        }

        let routing_table = state
            .routing_table
            .to_builder()
            .update_nodes(state.routing_table.version + 1, allocation.routing_nodes())
            .build();

        metrics::record_reroute(reason);
        info!(
            reason,
            version = state.version + 1,
            "reroute produced a new routing table"
        );
        let new_state = state
            .to_builder()
            .version(state.version + 1)
            .routing_table(routing_table)
            .blocks(blocks)
            .build();
        metrics::update_cluster_state_metrics(&new_state);
        new_state
    }

    /// Apply shard-started events from the nodes: the copies move to
    /// STARTED and their allocation ids join the in-sync set.
    pub fn apply_started_shards(
        &self,
        state: &ClusterState,
        started: &[ShardRouting],
    ) -> ClusterState {
        if started.is_empty() {
            return state.clone();
        }
        let mut routing_nodes = RoutingNodes::new(&state.routing_table, &state.nodes);
        let mut indices: BTreeMap<String, crate::state::IndexMetadata> = BTreeMap::new();

        for shard in started {
            // A completed relocation hands the in-sync slot over from the
            // source copy to the target.
            let relocation_source_id = if shard.is_relocation_target() {
                state
                    .routing_table
                    .shard(&shard.shard_id.index_uuid, shard.shard_id.shard)
                    .and_then(|t| {
                        t.shards()
                            .iter()
                            .find(|s| {
                                s.relocating() && s.target_allocation_id == shard.allocation_id
                            })
                            .and_then(|s| s.allocation_id.clone())
                    })
            } else {
                None
            };

            let started_shard = routing_nodes.start_shard(shard);
            let uuid = &started_shard.shard_id.index_uuid;
            if let Some(meta) = indices
                .remove(uuid)
                .or_else(|| state.metadata.index(uuid).cloned())
            {
                let id = started_shard
                    .allocation_id
                    .clone()
                    .expect("started shard has an allocation id");
                let mut builder = meta
                    .to_builder()
                    .add_in_sync_id(started_shard.shard_id.shard, id);
                if let Some(source_id) = &relocation_source_id {
                    builder = builder.remove_in_sync_id(started_shard.shard_id.shard, source_id);
                }
                indices.insert(uuid.clone(), builder.build());
            }
        }

        let mut metadata_builder = state.metadata.to_builder();
        for meta in indices.into_values() {
            metadata_builder = metadata_builder.put(meta);
        }

        let routing_table = state
            .routing_table
            .to_builder()
            .update_nodes(state.routing_table.version + 1, &routing_nodes)
            .build();

        state
            .to_builder()
            .version(state.version + 1)
            .metadata(metadata_builder.build())
            .routing_table(routing_table)
            .build()
    }

    /// Apply shard-failed events: copies are removed from their nodes and
    /// queued for reallocation; a failed primary bumps the shard's primary
    /// term.
    pub fn apply_failed_shards(&self, state: &ClusterState, failed: &[FailedShard]) -> ClusterState {
        if failed.is_empty() {
            return state.clone();
        }
        let mut routing_nodes = RoutingNodes::new(&state.routing_table, &state.nodes);
        let mut indices: BTreeMap<String, crate::state::IndexMetadata> = BTreeMap::new();

        for failure in failed {
            let shard = &failure.routing;
            let mut info = UnassignedInfo::new(UnassignedReason::AllocationFailed)
                .with_message(failure.message.clone());
            info.failed_allocations = 1;
            if let Some(node) = &shard.current_node_id {
                info = info.with_last_allocated_node(node.clone());
            }
            routing_nodes.fail_shard(shard, info);

            if shard.primary {
                let uuid = &shard.shard_id.index_uuid;
                if let Some(meta) = indices
                    .remove(uuid)
                    .or_else(|| state.metadata.index(uuid).cloned())
                {
                    let updated = meta
                        .to_builder()
                        .bump_primary_term(shard.shard_id.shard)
                        .build();
                    indices.insert(uuid.clone(), updated);
                }
            }
        }

        let mut metadata_builder = state.metadata.to_builder();
        for meta in indices.into_values() {
            metadata_builder = metadata_builder.put(meta);
        }

        let routing_table = state
            .routing_table
            .to_builder()
            .update_nodes(state.routing_table.version + 1, &routing_nodes)
            .build();

        state
            .to_builder()
            .version(state.version + 1)
            .metadata(metadata_builder.build())
            .routing_table(routing_table)
            .build()
    }

    /// Master-side handler for a replication operation's mark-as-stale
    /// request: drop the allocation id from the shard's in-sync set.
    pub fn mark_shard_copy_stale(
        &self,
        state: &ClusterState,
        shard_id: &ShardId,
        allocation_id: &AllocationId,
    ) -> Result<ClusterState> {
        let meta = state.metadata.index_or_err(&shard_id.index_uuid)?;
        let updated = meta
            .to_builder()
            .remove_in_sync_id(shard_id.shard, allocation_id)
            .build();
        Ok(state
            .to_builder()
            .version(state.version + 1)
            .metadata(state.metadata.to_builder().put(updated).build())
            .build())
    }

    /// Recompute flood-stage write blocks: an index gets the block while any
    /// node hosting one of its copies is beyond the flood-stage watermark.
    fn flood_stage_blocks(
        &self,
        state: &ClusterState,
        cluster_info: &ClusterInfo,
        routing_nodes: &RoutingNodes,
    ) -> ClusterBlocks {
        let flooded_nodes: BTreeSet<&str> = cluster_info
            .disk_usages
            .iter()
            .filter(|(_, usage)| self.disk_decider.flood_stage_breached(usage))
            .map(|(node, _)| node.as_str())
            .collect();

        let mut blocked_indices: BTreeSet<String> = BTreeSet::new();
        for node in &flooded_nodes {
            for shard in routing_nodes.shards_on_node(node) {
                blocked_indices.insert(shard.shard_id.index_uuid.clone());
            }
        }

        let mut builder = state.blocks.to_builder();
        for uuid in state.metadata.indices.keys() {
            let blocked = blocked_indices.contains(uuid);
            let has_block = state
                .blocks
                .has_index_block(uuid, crate::state::blocks::FLOOD_STAGE_BLOCK_ID);
            if blocked && !has_block {
                info!(index = %uuid, "installing flood-stage write block");
                builder = builder.add_index_block(uuid.clone(), flood_stage_block());
            } else if !blocked && has_block {
                info!(index = %uuid, "releasing flood-stage write block");
                builder =
                    builder.remove_index_block(uuid, crate::state::blocks::FLOOD_STAGE_BLOCK_ID);
            }
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::StaticShardStateProvider;
    use super::*;
    use crate::routing::{RoutingTable, ShardPredicate, ShardRoutingState};
    use crate::state::{ClusterBlockLevel, DiscoveryNode, IndexMetadata};

    fn node(id: &str) -> DiscoveryNode {
        DiscoveryNode::new(id, id, format!("{id}:4300"))
    }

    fn usage(total: u64, used: u64) -> DiskUsage {
        DiskUsage::new(total, total - used)
    }

    fn watermark_settings(low: &str, high: &str, flood: &str) -> ClusterSettings {
        let mut settings = ClusterSettings::default();
        settings.allocation.disk.watermark_low = low.to_string();
        settings.allocation.disk.watermark_high = high.to_string();
        settings.allocation.disk.watermark_flood_stage = flood.to_string();
        settings
    }

    fn service(settings: ClusterSettings) -> AllocationService {
        AllocationService::new(settings, Arc::new(StaticShardStateProvider::empty())).unwrap()
    }

    fn state_with(nodes: Vec<DiscoveryNode>, meta: &IndexMetadata) -> ClusterState {
        let mut builder = DiscoveryNodes::builder();
        for n in nodes {
            builder = builder.add(n);
        }
        ClusterState::builder()
            .term(1)
            .version(1)
            .nodes(builder.build())
            .metadata(Metadata::builder().put(meta.clone()).build())
            .routing_table(RoutingTable::builder().add_as_new(meta).build())
            .build()
    }

    fn initializing_shards(state: &ClusterState) -> Vec<crate::routing::ShardRouting> {
        state
            .routing_table
            .all_shards(None, ShardPredicate::Assigned, true)
            .unwrap()
            .into_iter()
            .filter(|s| s.initializing())
            .collect()
    }

    #[test]
    fn test_disk_watermark_blocks_allocation_until_a_node_has_room() {
        let meta = IndexMetadata::builder("logs")
            .number_of_shards(1)
            .number_of_replicas(1)
            .build();
        let service = service(watermark_settings("70%", "80%", "95%"));
        let state = state_with(vec![node("node-1"), node("node-2")], &meta);

        let mut info = ClusterInfo::default();
        info.disk_usages.insert("node-1".to_string(), usage(100, 90));
        info.disk_usages.insert("node-2".to_string(), usage(100, 65));

        // The primary lands on node-2; node-1 is over the low watermark.
        let state = service.reroute(&state, &info, "index created");
        let primary = initializing_shards(&state)
            .into_iter()
            .find(|s| s.primary)
            .expect("primary must be initializing");
        assert_eq!(primary.current_node_id.as_deref(), Some("node-2"));

        let state = service.apply_started_shards(&state, &[primary]);

        // The replica has nowhere to go: node-1 is full, node-2 holds the
        // primary.
        let state = service.reroute(&state, &info, "primary started");
        let replica = state
            .routing_table
            .shard(&meta.index_uuid, 0)
            .unwrap()
            .replica_shards()
            .next()
            .unwrap()
            .clone();
        assert_eq!(replica.state, ShardRoutingState::Unassigned);

        // A roomy node-3 joins: the replica initializes there and starts.
        let nodes = DiscoveryNodes::builder()
            .add(node("node-1"))
            .add(node("node-2"))
            .add(node("node-3"))
            .build();
        let state = state
            .to_builder()
            .version(state.version + 1)
            .nodes(nodes)
            .build();
        info.disk_usages.insert("node-3".to_string(), usage(100, 40));

        let state = service.reroute(&state, &info, "node joined");
        let replica = initializing_shards(&state)
            .into_iter()
            .find(|s| !s.primary)
            .expect("replica must be initializing");
        assert_eq!(replica.current_node_id.as_deref(), Some("node-3"));

        let state = service.apply_started_shards(&state, &[replica]);
        let shard_table = state.routing_table.shard(&meta.index_uuid, 0).unwrap();
        assert_eq!(shard_table.active_shard_count(), 2);
    }

    #[test]
    fn test_reroute_is_a_fixed_point() {
        let meta = IndexMetadata::builder("logs")
            .number_of_shards(2)
            .number_of_replicas(1)
            .build();
        let service = service(ClusterSettings::default());
        let state = state_with(vec![node("node-1"), node("node-2")], &meta);
        let info = ClusterInfo::default();

        let once = service.reroute(&state, &info, "test");
        assert_ne!(once.version, state.version, "first pass allocates");

        let twice = service.reroute(&once, &info, "test");
        assert_eq!(once, twice, "second pass with unchanged inputs is a no-op");
    }

    #[test]
    fn test_started_shards_join_in_sync_set() {
        let meta = IndexMetadata::builder("logs")
            .number_of_shards(1)
            .number_of_replicas(0)
            .build();
        let service = service(ClusterSettings::default());
        let state = state_with(vec![node("node-1")], &meta);

        let state = service.reroute(&state, &ClusterInfo::default(), "test");
        let primary = initializing_shards(&state).pop().unwrap();
        let state = service.apply_started_shards(&state, &[primary.clone()]);

        let in_sync = state
            .metadata
            .in_sync_ids(&primary.shard_id)
            .unwrap();
        assert_eq!(in_sync.len(), 1);
        assert!(in_sync.contains(primary.allocation_id.as_ref().unwrap()));
    }

    #[test]
    fn test_failed_primary_bumps_term_and_requeues() {
        let meta = IndexMetadata::builder("logs")
            .number_of_shards(1)
            .number_of_replicas(0)
            .build();
        let service = service(ClusterSettings::default());
        let state = state_with(vec![node("node-1")], &meta);

        let state = service.reroute(&state, &ClusterInfo::default(), "test");
        let primary = initializing_shards(&state).pop().unwrap();
        let state = service.apply_started_shards(&state, &[primary.clone()]);
        let started = state
            .routing_table
            .shard(&primary.shard_id.index_uuid, 0)
            .unwrap()
            .primary_shard()
            .unwrap()
            .clone();

        let state = service.apply_failed_shards(
            &state,
            &[FailedShard {
                routing: started,
                message: "engine failure".to_string(),
            }],
        );

        let meta = state.metadata.index(&primary.shard_id.index_uuid).unwrap();
        assert_eq!(meta.primary_term(0), 2);
        let row = &state
            .routing_table
            .shard(&primary.shard_id.index_uuid, 0)
            .unwrap()
            .shards()[0];
        assert!(row.unassigned());
        assert_eq!(
            row.unassigned_info.as_ref().unwrap().reason,
            UnassignedReason::AllocationFailed
        );
        assert_eq!(
            row.unassigned_info
                .as_ref()
                .unwrap()
                .last_allocated_node_id
                .as_deref(),
            Some("node-1")
        );
    }

    #[test]
    fn test_mark_shard_copy_stale_shrinks_in_sync_set() {
        let meta = IndexMetadata::builder("logs")
            .number_of_shards(1)
            .number_of_replicas(1)
            .build();
        let service = service(ClusterSettings::default());
        let state = state_with(vec![node("node-1"), node("node-2")], &meta);

        let state = service.reroute(&state, &ClusterInfo::default(), "test");
        let primaries = initializing_shards(&state);
        let state = service.apply_started_shards(&state, &primaries);
        let state = service.reroute(&state, &ClusterInfo::default(), "test");
        let replicas = initializing_shards(&state);
        let state = service.apply_started_shards(&state, &replicas);

        let shard_id = crate::routing::ShardId::new(meta.index_uuid.clone(), 0);
        assert_eq!(state.metadata.in_sync_ids(&shard_id).unwrap().len(), 2);

        let stale_id = replicas[0].allocation_id.clone().unwrap();
        let state = service
            .mark_shard_copy_stale(&state, &shard_id, &stale_id)
            .unwrap();
        let in_sync = state.metadata.in_sync_ids(&shard_id).unwrap();
        assert_eq!(in_sync.len(), 1);
        assert!(!in_sync.contains(&stale_id));
    }

    #[test]
    fn test_flood_stage_installs_and_releases_write_block() {
        let meta = IndexMetadata::builder("logs")
            .number_of_shards(1)
            .number_of_replicas(0)
            .build();
        let service = service(watermark_settings("70%", "80%", "95%"));
        let state = state_with(vec![node("node-1")], &meta);

        let mut info = ClusterInfo::default();
        info.disk_usages.insert("node-1".to_string(), usage(100, 50));
        let state = service.reroute(&state, &info, "test");
        let primary = initializing_shards(&state).pop().unwrap();
        let state = service.apply_started_shards(&state, &[primary]);

        // Disk fills past flood stage: the index gets a write block.
        info.disk_usages.insert("node-1".to_string(), usage(100, 97));
        let state = service.reroute(&state, &info, "disk filled");
        assert!(state
            .blocks
            .index_blocked(ClusterBlockLevel::Write, &meta.index_uuid));

        // Space is reclaimed: the block lifts again.
        info.disk_usages.insert("node-1".to_string(), usage(100, 50));
        let state = service.reroute(&state, &info, "disk freed");
        assert!(!state
            .blocks
            .index_blocked(ClusterBlockLevel::Write, &meta.index_uuid));
    }
}
