//! Cluster and index-level operation blocks
//!
//! A block forbids a class of operations either cluster-wide or for one
//! index. The coordination core installs the flood-stage write block when a
//! node's disk crosses the flood-stage watermark.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::routing::IndexUuid;

/// Class of operations a block forbids
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBlockLevel {
    Read,
    Write,
    Metadata,
}

/// One block with its identity and the levels it covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlock {
    /// Stable numeric id
    pub id: u32,

    /// Human-readable description
    pub description: String,

    /// Whether blocked operations may be retried once the block lifts
    pub retryable: bool,

    /// Levels the block covers
    pub levels: BTreeSet<ClusterBlockLevel>,
}

/// Id of the flood-stage write block
pub const FLOOD_STAGE_BLOCK_ID: u32 = 12;

/// The block installed on an index when a hosting node crosses the
/// flood-stage disk watermark.
pub fn flood_stage_block() -> ClusterBlock {
    ClusterBlock {
        id: FLOOD_STAGE_BLOCK_ID,
        description: "disk usage exceeded flood-stage watermark, index has read-only-allow-delete block".to_string(),
        retryable: false,
        levels: BTreeSet::from([ClusterBlockLevel::Write]),
    }
}

/// All blocks in force, cluster-wide and per index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterBlocks {
    global: BTreeMap<u32, ClusterBlock>,
    indices: BTreeMap<IndexUuid, BTreeMap<u32, ClusterBlock>>,
}

impl ClusterBlocks {
    /// Start building a block set
    pub fn builder() -> ClusterBlocksBuilder {
        ClusterBlocksBuilder {
            global: BTreeMap::new(),
            indices: BTreeMap::new(),
        }
    }

    /// Start a builder seeded with these blocks
    pub fn to_builder(&self) -> ClusterBlocksBuilder {
        ClusterBlocksBuilder {
            global: self.global.clone(),
            indices: self.indices.clone(),
        }
    }

    /// Whether a global block with this id is in force
    pub fn has_global_block(&self, id: u32) -> bool {
        self.global.contains_key(&id)
    }

    /// Whether an index block with this id is in force
    pub fn has_index_block(&self, uuid: &str, id: u32) -> bool {
        self.indices.get(uuid).is_some_and(|b| b.contains_key(&id))
    }

    /// Whether operations at `level` are blocked for `uuid`, either globally
    /// or by an index block
    pub fn index_blocked(&self, level: ClusterBlockLevel, uuid: &str) -> bool {
        let global = self.global.values().any(|b| b.levels.contains(&level));
        let index = self
            .indices
            .get(uuid)
            .is_some_and(|blocks| blocks.values().any(|b| b.levels.contains(&level)));
        global || index
    }
}

/// Single-use builder; `build` consumes it.
#[derive(Debug)]
pub struct ClusterBlocksBuilder {
    global: BTreeMap<u32, ClusterBlock>,
    indices: BTreeMap<IndexUuid, BTreeMap<u32, ClusterBlock>>,
}

impl ClusterBlocksBuilder {
    /// Add a cluster-wide block
    pub fn add_global_block(mut self, block: ClusterBlock) -> Self {
        self.global.insert(block.id, block);
        self
    }

    /// Add a block on one index
    pub fn add_index_block(mut self, uuid: impl Into<IndexUuid>, block: ClusterBlock) -> Self {
        self.indices.entry(uuid.into()).or_default().insert(block.id, block);
        self
    }

    /// Remove one block from one index
    pub fn remove_index_block(mut self, uuid: &str, id: u32) -> Self {
        if let Some(blocks) = self.indices.get_mut(uuid) {
            blocks.remove(&id);
            if blocks.is_empty() {
                self.indices.remove(uuid);
            }
        }
        self
    }

    pub fn build(self) -> ClusterBlocks {
        ClusterBlocks {
            global: self.global,
            indices: self.indices,
        }
    }
}
