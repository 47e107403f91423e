//! The cluster-wide routing table
//!
//! A versioned, immutable mapping from index uuid to per-index routing.
//! Mutation happens through [`RoutingTableBuilder`], which is single-use:
//! `build` consumes it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::index_table::IndexRoutingTable;
use super::nodes::RoutingNodes;
use super::shard::{IndexUuid, RecoverySource, ShardId, ShardRouting, UnassignedReason};
use super::shard_table::IndexShardRoutingTable;
use crate::error::{ClusterError, Result};
use crate::state::metadata::IndexMetadata;

/// Filter for flat shard enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPredicate {
    /// Every copy, unassigned included
    All,
    /// Copies allocated to a node
    Assigned,
    /// Copies in STARTED or RELOCATING
    Active,
    /// Primary copies only
    Primary,
}

impl ShardPredicate {
    fn matches(&self, shard: &ShardRouting) -> bool {
        match self {
            ShardPredicate::All => true,
            ShardPredicate::Assigned => shard.assigned(),
            ShardPredicate::Active => shard.active(),
            ShardPredicate::Primary => shard.primary,
        }
    }
}

/// One replication group with a single representative copy, for clients that
/// want one target per shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardGroup {
    /// The group's shard id
    pub shard_id: ShardId,

    /// Representative copy; `None` when the group has no active copy
    pub representative: Option<ShardRouting>,
}

/// Versioned routing for every index in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Monotonic per master term
    pub version: u64,

    indices: BTreeMap<IndexUuid, IndexRoutingTable>,
}

impl RoutingTable {
    /// Start building an empty table
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder {
            version: 0,
            indices: BTreeMap::new(),
        }
    }

    /// Start a builder seeded with this table
    pub fn to_builder(&self) -> RoutingTableBuilder {
        RoutingTableBuilder {
            version: self.version,
            indices: self.indices.clone(),
        }
    }

    /// Routing of one index
    pub fn index(&self, uuid: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(uuid)
    }

    /// Routing of one index, with a domain error when missing
    pub fn index_or_err(&self, uuid: &str) -> Result<&IndexRoutingTable> {
        self.index(uuid)
            .ok_or_else(|| ClusterError::IndexNotFound(uuid.to_string()))
    }

    /// Replication group of one shard
    pub fn shard(&self, uuid: &str, number: u32) -> Option<&IndexShardRoutingTable> {
        self.indices.get(uuid).and_then(|t| t.shard(number))
    }

    /// Replication group of one shard, with a domain error when missing
    pub fn shard_or_err(&self, shard_id: &ShardId) -> Result<&IndexShardRoutingTable> {
        self.index_or_err(&shard_id.index_uuid)?
            .shard(shard_id.shard)
            .ok_or_else(|| ClusterError::ShardNotFound(shard_id.clone()))
    }

    /// All index routing tables
    pub fn index_tables(&self) -> impl Iterator<Item = &IndexRoutingTable> {
        self.indices.values()
    }

    /// The underlying ordered map, for the diff machinery.
    pub(crate) fn indices_map(&self) -> &BTreeMap<IndexUuid, IndexRoutingTable> {
        &self.indices
    }

    /// Rebuild from an ordered map, for the diff machinery.
    pub(crate) fn from_indices_map(
        version: u64,
        indices: BTreeMap<IndexUuid, IndexRoutingTable>,
    ) -> Self {
        Self { version, indices }
    }

    /// Whether the table has an index
    pub fn has_index(&self, uuid: &str) -> bool {
        self.indices.contains_key(uuid)
    }

    /// Number of indices
    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Flat enumeration of shard copies.
    ///
    /// `indices = None` enumerates every index; naming a missing index is an
    /// error. With `include_relocation_targets`, a RELOCATING copy also
    /// yields its synthesized INITIALIZING target entry.
    pub fn all_shards(
        &self,
        indices: Option<&[IndexUuid]>,
        predicate: ShardPredicate,
        include_relocation_targets: bool,
    ) -> Result<Vec<ShardRouting>> {
        let mut result = Vec::new();
        for table in self.selected_indices(indices)? {
            for shard in table.all_shards() {
                if predicate.matches(shard) {
                    result.push(shard.clone());
                }
                if include_relocation_targets && shard.relocating() {
                    let target = shard.build_target_relocating_shard();
                    if predicate.matches(&target) {
                        result.push(target);
                    }
                }
            }
        }
        Ok(result)
    }

    /// One representative per replication group. Groups with no active copy
    /// are included only with `include_empty`.
    pub fn all_active_shards_grouped(
        &self,
        indices: Option<&[IndexUuid]>,
        include_empty: bool,
    ) -> Result<Vec<ShardGroup>> {
        let mut groups = Vec::new();
        for table in self.selected_indices(indices)? {
            for shard_table in table.shard_tables() {
                let representative = shard_table.representative().cloned();
                if representative.is_some() || include_empty {
                    groups.push(ShardGroup {
                        shard_id: shard_table.shard_id().clone(),
                        representative,
                    });
                }
            }
        }
        Ok(groups)
    }

    fn selected_indices(
        &self,
        indices: Option<&[IndexUuid]>,
    ) -> Result<Vec<&IndexRoutingTable>> {
        match indices {
            None => Ok(self.indices.values().collect()),
            Some(uuids) => uuids.iter().map(|u| self.index_or_err(u)).collect(),
        }
    }
}

/// Single-use builder; `build` consumes it.
#[derive(Debug)]
pub struct RoutingTableBuilder {
    version: u64,
    indices: BTreeMap<IndexUuid, IndexRoutingTable>,
}

impl RoutingTableBuilder {
    /// Set the table version
    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Routing for a newly created OPEN index
    pub fn add_as_new(self, meta: &IndexMetadata) -> Self {
        self.add_seeded(
            meta,
            RecoverySource::EmptyStore,
            UnassignedReason::IndexCreated,
        )
    }

    /// Routing for an index found during full-cluster recovery
    pub fn add_as_recovery(self, meta: &IndexMetadata) -> Self {
        self.add_seeded(
            meta,
            RecoverySource::ExistingStore,
            UnassignedReason::ClusterRecovered,
        )
    }

    /// Routing for a closed index being reopened
    pub fn add_as_from_close_to_open(self, meta: &IndexMetadata) -> Self {
        self.add_seeded(
            meta,
            RecoverySource::ExistingStore,
            UnassignedReason::IndexReopened,
        )
    }

    /// Routing for an open index being closed. The close must have been
    /// verified (flushed) first; anything else is a programming error.
    pub fn add_as_from_open_to_close(self, meta: &IndexMetadata) -> Self {
        assert!(
            meta.verified_before_close,
            "index {} was not verified before close",
            meta.name
        );
        self.add_seeded(
            meta,
            RecoverySource::ExistingStore,
            UnassignedReason::ReinitializedClosedIndex,
        )
    }

    /// Routing for an index restored from a snapshot
    pub fn add_as_restore(
        mut self,
        meta: &IndexMetadata,
        snapshot_id: impl Into<String>,
        index_id: impl Into<String>,
        new_index: bool,
    ) -> Self {
        let reason = if new_index {
            UnassignedReason::NewIndexRestored
        } else {
            UnassignedReason::ExistingIndexRestored
        };
        let recovery = RecoverySource::Snapshot {
            snapshot_id: snapshot_id.into(),
            index_id: index_id.into(),
        };
        let table = IndexRoutingTable::builder(meta.index_uuid.clone())
            .initialize_empty(meta, recovery, reason)
            .build();
        self.indices.insert(meta.index_uuid.clone(), table);
        self
    }

    fn add_seeded(
        mut self,
        meta: &IndexMetadata,
        primary_recovery: RecoverySource,
        reason: UnassignedReason,
    ) -> Self {
        let table = IndexRoutingTable::builder(meta.index_uuid.clone())
            .initialize_empty(meta, primary_recovery, reason)
            .build();
        self.indices.insert(meta.index_uuid.clone(), table);
        self
    }

    /// Insert a fully-built index routing table
    pub fn add_index_table(mut self, table: IndexRoutingTable) -> Self {
        self.indices.insert(table.index_uuid().clone(), table);
        self
    }

    /// Remove an index
    pub fn remove(mut self, uuid: &str) -> Self {
        self.indices.remove(uuid);
        self
    }

    /// Grow or shrink every named index (all indices when `None`) to `n`
    /// replicas per shard. Rows are added unassigned with reason
    /// `ReplicaAdded`; removals take unassigned copies before initializing
    /// ones. Applying the same `n` twice is a no-op.
    pub fn update_number_of_replicas(
        mut self,
        n: u32,
        indices: Option<&[IndexUuid]>,
    ) -> Result<Self> {
        let uuids: Vec<IndexUuid> = match indices {
            None => self.indices.keys().cloned().collect(),
            Some(uuids) => {
                for uuid in uuids {
                    if !self.indices.contains_key(uuid) {
                        return Err(ClusterError::IndexNotFound(uuid.clone()));
                    }
                }
                uuids.to_vec()
            }
        };

        for uuid in uuids {
            let table = self.indices.remove(&uuid).expect("uuid checked above");
            let current = table
                .shard_tables()
                .next()
                .map_or(0, |t| t.size().saturating_sub(1)) as u32;

            let mut builder = IndexRoutingTable::builder(uuid.clone());
            for shard_table in table.shard_tables() {
                builder = builder.add_shard_table(shard_table.clone());
            }
            for _ in current..n {
                builder = builder.add_replica();
            }
            for _ in n..current {
                builder = builder.remove_replica();
            }
            self.indices.insert(uuid, builder.build());
        }
        Ok(self)
    }

    /// Rebuild every index from the by-node view after an allocation pass.
    /// Relocation-target entries are skipped (the table stores only the
    /// RELOCATING source); ignored unassigned copies come back as unassigned
    /// rows carrying their updated allocation status.
    pub fn update_nodes(mut self, version: u64, routing_nodes: &RoutingNodes) -> Self {
        let mut by_index: BTreeMap<IndexUuid, BTreeMap<u32, Vec<ShardRouting>>> = BTreeMap::new();
        let unassigned = routing_nodes
            .unassigned()
            .iter()
            .chain(routing_nodes.ignored());
        for shard in routing_nodes.assigned_shards().chain(unassigned) {
            if shard.is_relocation_target() {
                continue;
            }
            by_index
                .entry(shard.shard_id.index_uuid.clone())
                .or_default()
                .entry(shard.shard_id.shard)
                .or_default()
                .push(shard.clone());
        }

        self.indices = by_index
            .into_iter()
            .map(|(uuid, shards)| {
                let mut builder = IndexRoutingTable::builder(uuid.clone());
                for (number, copies) in shards {
                    let mut shard_builder =
                        IndexShardRoutingTable::builder(ShardId::new(uuid.clone(), number));
                    for copy in copies {
                        shard_builder.add(copy);
                    }
                    builder = builder.add_shard_table(shard_builder.build());
                }
                (uuid, builder.build())
            })
            .collect();
        self.version = version;
        self
    }

    pub fn build(self) -> RoutingTable {
        RoutingTable {
            version: self.version,
            indices: self.indices,
        }
    }
}
