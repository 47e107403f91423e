//! Cluster-state diffs
//!
//! Once a follower knows a baseline state, the master sends only diffs.
//! For any diffable value, `apply_diff(before, diff(before, after))` must
//! reproduce `after` exactly, byte-for-byte after re-serialization, which is
//! why every diffable map is ordered.
//!
//! Map diffs follow the shape `(deleted keys, upserted values, sub-diffs for
//! changed values)` and compose: the cluster-state diff contains map diffs
//! whose changed-value entries are themselves diffs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ClusterError, Result};
use crate::routing::{IndexRoutingTable, IndexShardRoutingTable, IndexUuid, RoutingTable};
use crate::state::blocks::ClusterBlocks;
use crate::state::metadata::{IndexMetadata, Metadata};
use crate::state::nodes::DiscoveryNodes;
use crate::state::ClusterState;

/// A value that can express the change between two of its versions.
pub trait Diffable: Sized {
    /// The change representation
    type Diff;

    /// Compute the change from `before` to `after`
    fn diff(before: &Self, after: &Self) -> Self::Diff;

    /// Apply a change computed against `before`
    fn apply_diff(before: &Self, diff: &Self::Diff) -> Result<Self>;
}

/// Diff of an ordered map: deleted keys, upserted values, and sub-diffs for
/// values present on both sides but changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapDiff<K: Ord, V, D> {
    pub deleted: Vec<K>,
    pub upserted: BTreeMap<K, V>,
    pub changed: BTreeMap<K, D>,
}

impl<K, V, D> MapDiff<K, V, D>
where
    K: Ord + Clone,
    V: Diffable<Diff = D> + Clone + PartialEq,
{
    /// Compute the diff between two maps
    pub fn compute(before: &BTreeMap<K, V>, after: &BTreeMap<K, V>) -> Self {
        let deleted = before
            .keys()
            .filter(|k| !after.contains_key(k))
            .cloned()
            .collect();

        let mut upserted = BTreeMap::new();
        let mut changed = BTreeMap::new();
        for (key, value) in after {
            match before.get(key) {
                None => {
                    upserted.insert(key.clone(), value.clone());
                }
                Some(old) if old != value => {
                    changed.insert(key.clone(), V::diff(old, value));
                }
                Some(_) => {}
            }
        }

        Self {
            deleted,
            upserted,
            changed,
        }
    }

    /// Apply this diff to a map
    pub fn apply(&self, before: &BTreeMap<K, V>) -> Result<BTreeMap<K, V>> {
        let mut result = before.clone();
        for key in &self.deleted {
            result.remove(key);
        }
        for (key, diff) in &self.changed {
            let old = result.get(key).ok_or_else(|| {
                ClusterError::IllegalState("map diff changes a key absent from the base".to_string())
            })?;
            let new = V::apply_diff(old, diff)?;
            result.insert(key.clone(), new);
        }
        for (key, value) in &self.upserted {
            result.insert(key.clone(), value.clone());
        }
        Ok(result)
    }

    /// Whether the diff changes nothing
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.upserted.is_empty() && self.changed.is_empty()
    }
}

// A single shard's replication group is small; its diff is a replacement.
impl Diffable for IndexShardRoutingTable {
    type Diff = IndexShardRoutingTable;

    fn diff(_before: &Self, after: &Self) -> Self::Diff {
        after.clone()
    }

    fn apply_diff(_before: &Self, diff: &Self::Diff) -> Result<Self> {
        Ok(diff.clone())
    }
}

/// Diff of one index's routing: a map diff over its shard tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRoutingTableDiff {
    pub index_uuid: IndexUuid,
    pub shards: MapDiff<u32, IndexShardRoutingTable, IndexShardRoutingTable>,
}

impl Diffable for IndexRoutingTable {
    type Diff = IndexRoutingTableDiff;

    fn diff(before: &Self, after: &Self) -> Self::Diff {
        IndexRoutingTableDiff {
            index_uuid: after.index_uuid().clone(),
            shards: MapDiff::compute(before.shards_map(), after.shards_map()),
        }
    }

    fn apply_diff(before: &Self, diff: &Self::Diff) -> Result<Self> {
        Ok(IndexRoutingTable::from_shards_map(
            diff.index_uuid.clone(),
            diff.shards.apply(before.shards_map())?,
        ))
    }
}

/// Diff of the whole routing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingTableDiff {
    pub version: u64,
    pub indices: MapDiff<IndexUuid, IndexRoutingTable, IndexRoutingTableDiff>,
}

impl Diffable for RoutingTable {
    type Diff = RoutingTableDiff;

    fn diff(before: &Self, after: &Self) -> Self::Diff {
        RoutingTableDiff {
            version: after.version,
            indices: MapDiff::compute(before.indices_map(), after.indices_map()),
        }
    }

    fn apply_diff(before: &Self, diff: &Self::Diff) -> Result<Self> {
        Ok(RoutingTable::from_indices_map(
            diff.version,
            diff.indices.apply(before.indices_map())?,
        ))
    }
}

// Index metadata changes rarely and is compact; its diff is a replacement.
impl Diffable for IndexMetadata {
    type Diff = IndexMetadata;

    fn diff(_before: &Self, after: &Self) -> Self::Diff {
        after.clone()
    }

    fn apply_diff(_before: &Self, diff: &Self::Diff) -> Result<Self> {
        Ok(diff.clone())
    }
}

/// Diff of the cluster metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDiff {
    pub version: u64,
    pub indices: MapDiff<IndexUuid, IndexMetadata, IndexMetadata>,
}

impl Diffable for Metadata {
    type Diff = MetadataDiff;

    fn diff(before: &Self, after: &Self) -> Self::Diff {
        MetadataDiff {
            version: after.version,
            indices: MapDiff::compute(&before.indices, &after.indices),
        }
    }

    fn apply_diff(before: &Self, diff: &Self::Diff) -> Result<Self> {
        Ok(Metadata {
            version: diff.version,
            indices: diff.indices.apply(&before.indices)?,
        })
    }
}

/// Diff between two cluster states. Carries the `(term, version)` pair it
/// was computed from so followers can detect a wrong baseline, and the pair
/// it advances to so non-advancing updates are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStateDiff {
    pub from_term: u64,
    pub from_version: u64,
    pub to_term: u64,
    pub to_version: u64,

    /// Replacement node set, when membership changed
    pub nodes: Option<DiscoveryNodes>,

    pub metadata: MetadataDiff,
    pub routing_table: RoutingTableDiff,

    /// Replacement block set, when blocks changed
    pub blocks: Option<ClusterBlocks>,
}

impl Diffable for ClusterState {
    type Diff = ClusterStateDiff;

    fn diff(before: &Self, after: &Self) -> Self::Diff {
        ClusterStateDiff {
            from_term: before.term,
            from_version: before.version,
            to_term: after.term,
            to_version: after.version,
            nodes: (before.nodes != after.nodes).then(|| after.nodes.clone()),
            metadata: Metadata::diff(&before.metadata, &after.metadata),
            routing_table: RoutingTable::diff(&before.routing_table, &after.routing_table),
            blocks: (before.blocks != after.blocks).then(|| after.blocks.clone()),
        }
    }

    fn apply_diff(before: &Self, diff: &Self::Diff) -> Result<Self> {
        if before.term != diff.from_term || before.version != diff.from_version {
            return Err(ClusterError::DiffBaseMismatch {
                expected: diff.from_version,
                actual: before.version,
            });
        }
        if (diff.to_term, diff.to_version) <= (before.term, before.version) {
            return Err(ClusterError::StaleClusterState {
                have_term: before.term,
                have_version: before.version,
                got_term: diff.to_term,
                got_version: diff.to_version,
            });
        }
        Ok(ClusterState {
            version: diff.to_version,
            term: diff.to_term,
            nodes: diff.nodes.clone().unwrap_or_else(|| before.nodes.clone()),
            metadata: Metadata::apply_diff(&before.metadata, &diff.metadata)?,
            routing_table: RoutingTable::apply_diff(&before.routing_table, &diff.routing_table)?,
            blocks: diff.blocks.clone().unwrap_or_else(|| before.blocks.clone()),
        })
    }
}

impl ClusterStateDiff {
    /// Serialize into the versioned wire envelope (same as the on-disk body).
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>> {
        meridian_state::format::encode_payload(self, crate::PROTOCOL_VERSION)
            .map_err(ClusterError::from)
    }

    /// Deserialize from the versioned wire envelope.
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self> {
        let (diff, _version) = meridian_state::format::decode_payload(bytes)?;
        Ok(diff)
    }
}
