//! Index metadata
//!
//! Per-index settings the coordination core operates on: shard and replica
//! counts, open/close state, per-shard primary terms and in-sync allocation
//! id sets.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ClusterError, Result};
use crate::routing::{AllocationId, IndexUuid, ShardId};

/// Whether an index accepts operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Open,
    Close,
}

/// Settings and replication bookkeeping of one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Stable identity, survives renames
    pub index_uuid: IndexUuid,

    /// Human-facing name
    pub name: String,

    /// Open or closed
    pub state: IndexState,

    /// Number of primary shards; fixed at creation
    pub number_of_shards: u32,

    /// Number of replicas per shard
    pub number_of_replicas: u32,

    /// Per-shard primary term, bumped on every primary election
    pub primary_terms: Vec<u64>,

    /// Per-shard set of allocation ids the master considers current
    pub in_sync_allocation_ids: Vec<BTreeSet<AllocationId>>,

    /// Protocol version the index was created under
    pub created_version: u64,

    /// Set once a close has been verified by a flush on every shard;
    /// required before routing may transition the index open → close
    pub verified_before_close: bool,
}

impl IndexMetadata {
    /// Start building metadata for a new index
    pub fn builder(name: impl Into<String>) -> IndexMetadataBuilder {
        IndexMetadataBuilder {
            index_uuid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            state: IndexState::Open,
            number_of_shards: 1,
            number_of_replicas: 0,
            primary_terms: None,
            in_sync_allocation_ids: None,
            created_version: crate::PROTOCOL_VERSION,
            verified_before_close: false,
        }
    }

    /// Start a builder from this metadata (copy-on-write updates)
    pub fn to_builder(&self) -> IndexMetadataBuilder {
        IndexMetadataBuilder {
            index_uuid: self.index_uuid.clone(),
            name: self.name.clone(),
            state: self.state,
            number_of_shards: self.number_of_shards,
            number_of_replicas: self.number_of_replicas,
            primary_terms: Some(self.primary_terms.clone()),
            in_sync_allocation_ids: Some(self.in_sync_allocation_ids.clone()),
            created_version: self.created_version,
            verified_before_close: self.verified_before_close,
        }
    }

    /// Primary term of one shard
    pub fn primary_term(&self, shard: u32) -> u64 {
        self.primary_terms[shard as usize]
    }

    /// In-sync allocation ids of one shard
    pub fn in_sync_ids(&self, shard: u32) -> &BTreeSet<AllocationId> {
        &self.in_sync_allocation_ids[shard as usize]
    }

    /// Ids of every shard of the index
    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> + '_ {
        (0..self.number_of_shards).map(|n| ShardId::new(self.index_uuid.clone(), n))
    }
}

/// Single-use builder; `build` consumes it.
#[derive(Debug)]
pub struct IndexMetadataBuilder {
    index_uuid: IndexUuid,
    name: String,
    state: IndexState,
    number_of_shards: u32,
    number_of_replicas: u32,
    primary_terms: Option<Vec<u64>>,
    in_sync_allocation_ids: Option<Vec<BTreeSet<AllocationId>>>,
    created_version: u64,
    verified_before_close: bool,
}

impl IndexMetadataBuilder {
    /// Override the generated index uuid (restores keep the original)
    pub fn index_uuid(mut self, uuid: impl Into<IndexUuid>) -> Self {
        self.index_uuid = uuid.into();
        self
    }

    pub fn state(mut self, state: IndexState) -> Self {
        self.state = state;
        self
    }

    pub fn number_of_shards(mut self, n: u32) -> Self {
        assert!(n >= 1, "an index needs at least one shard");
        self.number_of_shards = n;
        self
    }

    pub fn number_of_replicas(mut self, n: u32) -> Self {
        self.number_of_replicas = n;
        self
    }

    pub fn created_version(mut self, version: u64) -> Self {
        self.created_version = version;
        self
    }

    pub fn verified_before_close(mut self, verified: bool) -> Self {
        self.verified_before_close = verified;
        self
    }

    /// Bump the primary term of one shard (new primary elected)
    pub fn bump_primary_term(mut self, shard: u32) -> Self {
        let terms = self
            .primary_terms
            .get_or_insert_with(|| vec![1; self.number_of_shards as usize]);
        terms[shard as usize] += 1;
        self
    }

    /// Replace the in-sync set of one shard
    pub fn in_sync_ids(mut self, shard: u32, ids: BTreeSet<AllocationId>) -> Self {
        let sets = self
            .in_sync_allocation_ids
            .get_or_insert_with(|| vec![BTreeSet::new(); self.number_of_shards as usize]);
        sets[shard as usize] = ids;
        self
    }

    /// Add one allocation id to a shard's in-sync set
    pub fn add_in_sync_id(mut self, shard: u32, id: AllocationId) -> Self {
        let sets = self
            .in_sync_allocation_ids
            .get_or_insert_with(|| vec![BTreeSet::new(); self.number_of_shards as usize]);
        sets[shard as usize].insert(id);
        self
    }

    /// Remove one allocation id from a shard's in-sync set
    pub fn remove_in_sync_id(mut self, shard: u32, id: &AllocationId) -> Self {
        if let Some(sets) = self.in_sync_allocation_ids.as_mut() {
            sets[shard as usize].remove(id);
        }
        self
    }

    pub fn build(self) -> IndexMetadata {
        let shards = self.number_of_shards as usize;
        let primary_terms = self.primary_terms.unwrap_or_else(|| vec![1; shards]);
        let in_sync = self
            .in_sync_allocation_ids
            .unwrap_or_else(|| vec![BTreeSet::new(); shards]);
        assert_eq!(primary_terms.len(), shards, "one primary term per shard");
        assert_eq!(in_sync.len(), shards, "one in-sync set per shard");
        IndexMetadata {
            index_uuid: self.index_uuid,
            name: self.name,
            state: self.state,
            number_of_shards: self.number_of_shards,
            number_of_replicas: self.number_of_replicas,
            primary_terms,
            in_sync_allocation_ids: in_sync,
            created_version: self.created_version,
            verified_before_close: self.verified_before_close,
        }
    }
}

/// Cluster-wide metadata: every index, keyed by uuid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Metadata version, bumped on every change
    pub version: u64,

    /// Indices by uuid (ordered for deterministic serialization)
    pub indices: BTreeMap<IndexUuid, IndexMetadata>,
}

impl Metadata {
    /// Start building from scratch
    pub fn builder() -> MetadataBuilder {
        MetadataBuilder {
            version: 0,
            indices: BTreeMap::new(),
        }
    }

    /// Start a builder seeded with this metadata
    pub fn to_builder(&self) -> MetadataBuilder {
        MetadataBuilder {
            version: self.version,
            indices: self.indices.clone(),
        }
    }

    /// Look up an index by uuid
    pub fn index(&self, uuid: &str) -> Option<&IndexMetadata> {
        self.indices.get(uuid)
    }

    /// Look up an index by uuid, with a domain error when missing
    pub fn index_or_err(&self, uuid: &str) -> Result<&IndexMetadata> {
        self.index(uuid)
            .ok_or_else(|| ClusterError::IndexNotFound(uuid.to_string()))
    }

    /// Look up an index by name
    pub fn index_by_name(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.values().find(|m| m.name == name)
    }

    /// In-sync allocation ids of a shard
    pub fn in_sync_ids(&self, shard_id: &ShardId) -> Result<&BTreeSet<AllocationId>> {
        Ok(self
            .index_or_err(&shard_id.index_uuid)?
            .in_sync_ids(shard_id.shard))
    }
}

/// Single-use builder; `build` consumes it.
#[derive(Debug)]
pub struct MetadataBuilder {
    version: u64,
    indices: BTreeMap<IndexUuid, IndexMetadata>,
}

impl MetadataBuilder {
    /// Insert or replace an index
    pub fn put(mut self, index: IndexMetadata) -> Self {
        self.indices.insert(index.index_uuid.clone(), index);
        self
    }

    /// Remove an index
    pub fn remove(mut self, uuid: &str) -> Self {
        self.indices.remove(uuid);
        self
    }

    pub fn build(self) -> Metadata {
        Metadata {
            version: self.version + 1,
            indices: self.indices,
        }
    }
}
