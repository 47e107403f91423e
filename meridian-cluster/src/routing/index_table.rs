//! Per-index routing: every shard number mapped to its replication group.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::shard::{
    IndexUuid, RecoverySource, ShardId, ShardRouting, UnassignedInfo, UnassignedReason,
};
use super::shard_table::IndexShardRoutingTable;
use crate::state::metadata::IndexMetadata;

/// Routing of one index: an ordered mapping from shard number to the copies
/// of that shard. Every shard number in `[0, number_of_shards)` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    index_uuid: IndexUuid,
    shards: BTreeMap<u32, IndexShardRoutingTable>,
}

impl IndexRoutingTable {
    /// Start building routing for an index
    pub fn builder(index_uuid: impl Into<IndexUuid>) -> IndexRoutingTableBuilder {
        IndexRoutingTableBuilder {
            index_uuid: index_uuid.into(),
            shards: BTreeMap::new(),
        }
    }

    /// Index identity
    pub fn index_uuid(&self) -> &IndexUuid {
        &self.index_uuid
    }

    /// The replication group of one shard number
    pub fn shard(&self, number: u32) -> Option<&IndexShardRoutingTable> {
        self.shards.get(&number)
    }

    /// All replication groups, in shard-number order
    pub fn shard_tables(&self) -> impl Iterator<Item = &IndexShardRoutingTable> {
        self.shards.values()
    }

    /// The underlying ordered map, for the diff machinery.
    pub(crate) fn shards_map(&self) -> &BTreeMap<u32, IndexShardRoutingTable> {
        &self.shards
    }

    /// Rebuild from an ordered map, for the diff machinery.
    pub(crate) fn from_shards_map(
        index_uuid: IndexUuid,
        shards: BTreeMap<u32, IndexShardRoutingTable>,
    ) -> Self {
        Self { index_uuid, shards }
    }

    /// Flat iteration over every copy of every shard
    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.values().flat_map(|t| t.shards().iter())
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Whether every copy of every shard is active
    pub fn all_primary_shards_active(&self) -> bool {
        self.shards
            .values()
            .all(|t| t.primary_shard().is_some_and(|p| p.active()))
    }

    /// Panic unless the table covers `[0, number_of_shards)` with consistent
    /// uuids. Programming-error class.
    pub fn validate(&self, meta: &IndexMetadata) {
        assert_eq!(self.index_uuid, meta.index_uuid, "uuid mismatch");
        assert_eq!(
            self.shards.len(),
            meta.number_of_shards as usize,
            "index {} routing covers {} shards, metadata says {}",
            meta.name,
            self.shards.len(),
            meta.number_of_shards
        );
        for number in 0..meta.number_of_shards {
            assert!(
                self.shards.contains_key(&number),
                "shard {number} missing from routing of {}",
                meta.name
            );
        }
    }
}

/// Single-use builder; `build` consumes it.
#[derive(Debug)]
pub struct IndexRoutingTableBuilder {
    index_uuid: IndexUuid,
    shards: BTreeMap<u32, IndexShardRoutingTable>,
}

impl IndexRoutingTableBuilder {
    /// Seed unassigned rows for every shard of `meta`: one primary with the
    /// given recovery source, `number_of_replicas` peer-recovering replicas.
    pub fn initialize_empty(
        mut self,
        meta: &IndexMetadata,
        primary_recovery: RecoverySource,
        reason: UnassignedReason,
    ) -> Self {
        for number in 0..meta.number_of_shards {
            let shard_id = ShardId::new(self.index_uuid.clone(), number);
            let mut builder = IndexShardRoutingTable::builder(shard_id.clone());
            builder.add(ShardRouting::new_unassigned(
                shard_id.clone(),
                true,
                primary_recovery.clone(),
                UnassignedInfo::new(reason),
            ));
            for _ in 0..meta.number_of_replicas {
                builder.add(ShardRouting::new_unassigned(
                    shard_id.clone(),
                    false,
                    RecoverySource::Peer,
                    UnassignedInfo::new(reason),
                ));
            }
            self.shards.insert(number, builder.build());
        }
        self
    }

    /// Insert a fully-built replication group
    pub fn add_shard_table(mut self, table: IndexShardRoutingTable) -> Self {
        assert_eq!(
            table.shard_id().index_uuid,
            self.index_uuid,
            "table of {} added to index {}",
            table.shard_id(),
            self.index_uuid
        );
        self.shards.insert(table.shard_id().shard, table);
        self
    }

    /// Add one unassigned replica row to every shard
    pub fn add_replica(mut self) -> Self {
        let numbers: Vec<u32> = self.shards.keys().copied().collect();
        for number in numbers {
            let table = self.shards.remove(&number).expect("number comes from keys");
            let shard_id = table.shard_id().clone();
            let mut builder = IndexShardRoutingTable::builder(shard_id.clone());
            for shard in table.shards() {
                builder.add(shard.clone());
            }
            builder.add(ShardRouting::new_unassigned(
                shard_id,
                false,
                RecoverySource::Peer,
                UnassignedInfo::new(UnassignedReason::ReplicaAdded),
            ));
            self.shards.insert(number, builder.build());
        }
        self
    }

    /// Remove one replica row from every shard, preferring unassigned copies
    /// over initializing ones, then relocating, then started.
    pub fn remove_replica(mut self) -> Self {
        use super::shard::ShardRoutingState::*;

        let numbers: Vec<u32> = self.shards.keys().copied().collect();
        for number in numbers {
            let table = self.shards.remove(&number).expect("number comes from keys");
            let shard_id = table.shard_id().clone();

            let removable = [Unassigned, Initializing, Relocating, Started]
                .iter()
                .find_map(|state| {
                    table
                        .shards()
                        .iter()
                        .position(|s| !s.primary && s.state == *state)
                });

            let mut builder = IndexShardRoutingTable::builder(shard_id);
            for (i, shard) in table.shards().iter().enumerate() {
                if Some(i) != removable {
                    builder.add(shard.clone());
                }
            }
            self.shards.insert(number, builder.build());
        }
        self
    }

    pub fn build(self) -> IndexRoutingTable {
        IndexRoutingTable {
            index_uuid: self.index_uuid,
            shards: self.shards,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::metadata::IndexMetadata;

    fn meta(shards: u32, replicas: u32) -> IndexMetadata {
        IndexMetadata::builder("logs")
            .number_of_shards(shards)
            .number_of_replicas(replicas)
            .build()
    }

    #[test]
    fn test_initialize_empty_covers_all_shards() {
        let meta = meta(3, 2);
        let table = IndexRoutingTable::builder(meta.index_uuid.clone())
            .initialize_empty(
                &meta,
                RecoverySource::EmptyStore,
                UnassignedReason::IndexCreated,
            )
            .build();

        table.validate(&meta);
        assert_eq!(table.shard_count(), 3);
        for shard_table in table.shard_tables() {
            assert_eq!(shard_table.size(), 3);
            assert_eq!(shard_table.replica_shards().count(), 2);
            assert!(shard_table.all_unassigned());
            assert_eq!(
                shard_table.primary_shard().unwrap().recovery_source,
                Some(RecoverySource::EmptyStore)
            );
        }
    }

    #[test]
    fn test_add_replica_appends_unassigned_row() {
        let meta = meta(2, 0);
        let table = IndexRoutingTable::builder(meta.index_uuid.clone())
            .initialize_empty(
                &meta,
                RecoverySource::EmptyStore,
                UnassignedReason::IndexCreated,
            )
            .add_replica()
            .build();

        for shard_table in table.shard_tables() {
            assert_eq!(shard_table.size(), 2);
            let replica = shard_table.replica_shards().next().unwrap();
            assert_eq!(
                replica.unassigned_info.as_ref().unwrap().reason,
                UnassignedReason::ReplicaAdded
            );
            assert_eq!(replica.recovery_source, Some(RecoverySource::Peer));
        }
    }

    #[test]
    fn test_remove_replica_prefers_unassigned() {
        let meta = meta(1, 2);
        let seeded = IndexRoutingTable::builder(meta.index_uuid.clone())
            .initialize_empty(
                &meta,
                RecoverySource::EmptyStore,
                UnassignedReason::IndexCreated,
            )
            .build();

        // Initialize exactly one replica so the other stays unassigned.
        let shard_table = seeded.shard(0).unwrap();
        let shard_id = shard_table.shard_id().clone();
        let mut builder = IndexShardRoutingTable::builder(shard_id);
        let mut initialized_one = false;
        for shard in shard_table.shards() {
            if !shard.primary && !initialized_one {
                builder.add(shard.initialize("node-1", None, None));
                initialized_one = true;
            } else {
                builder.add(shard.clone());
            }
        }

        let table = IndexRoutingTable::builder(meta.index_uuid.clone())
            .add_shard_table(builder.build())
            .remove_replica()
            .build();

        let shard_table = table.shard(0).unwrap();
        assert_eq!(shard_table.size(), 2);
        // The unassigned replica went away; the initializing one survived.
        assert!(shard_table
            .replica_shards()
            .all(|r| r.initializing()));
    }

    #[test]
    #[should_panic(expected = "routing covers")]
    fn test_validate_catches_missing_shard() {
        let meta = meta(2, 0);
        let table = IndexRoutingTable::builder(meta.index_uuid.clone()).build();
        table.validate(&meta);
    }
}
