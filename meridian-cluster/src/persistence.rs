//! Durable persistence of cluster states
//!
//! Thin glue over [`meridian_state::StateFormat`]: the master writes every
//! published state to the configured data directories and recovers the
//! latest one at startup. Writers are serialized by the applier thread.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::Result;
use crate::metrics;
use crate::state::ClusterState;
use meridian_state::{StateFormat, WriteStateError};

/// File prefix of persisted cluster states.
pub const CLUSTER_STATE_PREFIX: &str = "cluster-state-";

/// Writes and recovers cluster-state snapshots on the local data paths.
pub struct ClusterStatePersistence {
    format: StateFormat<ClusterState>,
    dirs: Vec<PathBuf>,
}

impl ClusterStatePersistence {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            format: StateFormat::new(CLUSTER_STATE_PREFIX, crate::PROTOCOL_VERSION),
            dirs,
        }
    }

    /// Persist a state, cleaning up superseded generations. On a dirty
    /// failure the on-disk generations may disagree; the caller decides
    /// between retrying the write and accepting what `load_latest` reports.
    pub fn write(&self, state: &ClusterState) -> std::result::Result<u64, WriteStateError> {
        let generation = self.format.write_and_cleanup(state, &self.dirs)?;
        metrics::record_state_write(generation);
        info!(
            generation,
            version = state.version,
            term = state.term,
            "persisted cluster state"
        );
        Ok(generation)
    }

    /// Recover the newest persisted state, if any.
    pub fn load_latest(&self) -> Result<Option<(ClusterState, u64)>> {
        let loaded = self.format.load_latest(&self.dirs)?;
        match &loaded {
            Some((state, generation)) => info!(
                generation,
                version = state.version,
                term = state.term,
                "recovered persisted cluster state"
            ),
            None => warn!("no persisted cluster state found"),
        }
        Ok(loaded)
    }

    /// Repair pass after a dirty write: keep only `generation`.
    pub fn cleanup_old_files(&self, generation: u64) -> Result<()> {
        Ok(self.format.cleanup_old_files(generation, &self.dirs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{IndexMetadata, Metadata};
    use tempfile::TempDir;

    fn sample_state(version: u64) -> ClusterState {
        let logs = IndexMetadata::builder("logs").number_of_shards(1).build();
        ClusterState::builder()
            .term(1)
            .version(version)
            .metadata(Metadata::builder().put(logs.clone()).build())
            .routing_table(crate::routing::RoutingTable::builder().add_as_new(&logs).build())
            .build()
    }

    #[test]
    fn test_write_then_recover() {
        let temp = [TempDir::new().unwrap(), TempDir::new().unwrap()];
        let persistence = ClusterStatePersistence::new(
            temp.iter().map(|t| t.path().to_path_buf()).collect(),
        );

        persistence.write(&sample_state(1)).unwrap();
        let generation = persistence.write(&sample_state(2)).unwrap();
        assert_eq!(generation, 2);

        let (state, gen) = persistence.load_latest().unwrap().unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(gen, 2);
    }

    #[test]
    fn test_recover_empty() {
        let temp = TempDir::new().unwrap();
        let persistence = ClusterStatePersistence::new(vec![temp.path().to_path_buf()]);
        assert!(persistence.load_latest().unwrap().is_none());
    }
}
