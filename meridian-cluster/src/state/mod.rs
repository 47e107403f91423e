//! The cluster state: one immutable, versioned value describing everything
//! the coordination core knows
//!
//! A state is produced by the single applier thread and published by an
//! atomic pointer swap (`Arc<ClusterState>`); readers never see a partially
//! updated value. Followers accept an update only when its `(term, version)`
//! advances lexicographically.

pub mod blocks;
pub mod diff;
pub mod metadata;
pub mod nodes;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::routing::RoutingTable;

pub use blocks::{flood_stage_block, ClusterBlock, ClusterBlockLevel, ClusterBlocks};
pub use diff::{ClusterStateDiff, Diffable, MapDiff};
pub use metadata::{IndexMetadata, IndexState, Metadata};
pub use nodes::{DiscoveryNode, DiscoveryNodes, NodeRole};

/// Everything the cluster agrees on: membership, metadata, routing, blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Version, monotonic within a master term
    pub version: u64,

    /// Master term this state was published under
    pub term: u64,

    /// Known nodes and the elected master
    pub nodes: DiscoveryNodes,

    /// Index metadata
    pub metadata: Metadata,

    /// Shard routing
    pub routing_table: RoutingTable,

    /// Operation blocks in force
    pub blocks: ClusterBlocks,
}

impl ClusterState {
    /// Start building an empty state
    pub fn builder() -> ClusterStateBuilder {
        ClusterStateBuilder {
            version: 0,
            term: 0,
            nodes: DiscoveryNodes::default(),
            metadata: Metadata::default(),
            routing_table: RoutingTable::default(),
            blocks: ClusterBlocks::default(),
        }
    }

    /// Start a builder seeded with this state (copy-on-write transition)
    pub fn to_builder(&self) -> ClusterStateBuilder {
        ClusterStateBuilder {
            version: self.version,
            term: self.term,
            nodes: self.nodes.clone(),
            metadata: self.metadata.clone(),
            routing_table: self.routing_table.clone(),
            blocks: self.blocks.clone(),
        }
    }

    /// Whether this state supersedes `other`: `(term, version)` advances
    /// lexicographically.
    pub fn supersedes(&self, other: &ClusterState) -> bool {
        (self.term, self.version) > (other.term, other.version)
    }

    /// Serialize into the versioned wire envelope (same bytes as the on-disk
    /// body).
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>> {
        meridian_state::format::encode_payload(self, crate::PROTOCOL_VERSION)
            .map_err(crate::error::ClusterError::from)
    }

    /// Deserialize from the versioned wire envelope.
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self> {
        let (state, _version) = meridian_state::format::decode_payload(bytes)?;
        Ok(state)
    }
}

/// Single-use builder; `build` consumes it.
#[derive(Debug)]
pub struct ClusterStateBuilder {
    version: u64,
    term: u64,
    nodes: DiscoveryNodes,
    metadata: Metadata,
    routing_table: RoutingTable,
    blocks: ClusterBlocks,
}

impl ClusterStateBuilder {
    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn term(mut self, term: u64) -> Self {
        self.term = term;
        self
    }

    pub fn nodes(mut self, nodes: DiscoveryNodes) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn routing_table(mut self, routing_table: RoutingTable) -> Self {
        self.routing_table = routing_table;
        self
    }

    pub fn blocks(mut self, blocks: ClusterBlocks) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn build(self) -> ClusterState {
        ClusterState {
            version: self.version,
            term: self.term,
            nodes: self.nodes,
            metadata: self.metadata,
            routing_table: self.routing_table,
            blocks: self.blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::metadata::IndexMetadata;
    use meridian_state::StateFormat;
    use tempfile::TempDir;

    fn sample_state() -> ClusterState {
        let logs = IndexMetadata::builder("logs")
            .number_of_shards(2)
            .number_of_replicas(1)
            .build();
        ClusterState::builder()
            .term(2)
            .version(17)
            .nodes(
                DiscoveryNodes::builder()
                    .add(DiscoveryNode::new("node-1", "alpha", "10.0.0.1:4300"))
                    .master_node_id("node-1")
                    .build(),
            )
            .metadata(Metadata::builder().put(logs.clone()).build())
            .routing_table(RoutingTable::builder().add_as_new(&logs).build())
            .build()
    }

    #[test]
    fn test_supersedes_is_lexicographic() {
        let state = sample_state();

        let newer_version = state.to_builder().version(state.version + 1).build();
        assert!(newer_version.supersedes(&state));

        let newer_term = state.to_builder().term(state.term + 1).version(0).build();
        assert!(newer_term.supersedes(&state));

        assert!(!state.supersedes(&state));
        assert!(!state.supersedes(&newer_version));
    }

    #[test]
    fn test_wire_roundtrip() {
        let state = sample_state();
        let bytes = state.to_wire_bytes().unwrap();
        let decoded = ClusterState::from_wire_bytes(&bytes).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_persist_and_reload_is_identity() {
        let temp = [TempDir::new().unwrap(), TempDir::new().unwrap()];
        let dirs: Vec<_> = temp.iter().map(|t| t.path().to_path_buf()).collect();
        let format: StateFormat<ClusterState> =
            StateFormat::new("cluster-", crate::PROTOCOL_VERSION);

        let state = sample_state();
        let generation = format.write_and_cleanup(&state, &dirs).unwrap();

        let (loaded, gen) = format.load_latest(&dirs).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(gen, generation);
    }
}
