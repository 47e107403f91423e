//! Coordination observability metrics
//!
//! Prometheus-compatible metrics for the coordination core:
//! - reroute passes and what triggered them
//! - shard counts by state
//! - replication outcomes
//! - cluster-state version/term gauges

use crate::replication::ShardInfo;
use crate::routing::{ShardId, ShardPredicate};
use crate::state::ClusterState;

/// Record one allocation pass
pub fn record_reroute(reason: &str) {
    metrics::counter!(
        "meridian_reroute_total",
        "reason" => reason.to_string(),
    )
    .increment(1);
}

/// Record the outcome of one replicated write
pub fn record_replication(shard_id: &ShardId, info: &ShardInfo) {
    let status = if info.failed == 0 { "ok" } else { "partial" };
    metrics::counter!(
        "meridian_replication_operations_total",
        "index" => shard_id.index_uuid.clone(),
        "status" => status.to_string(),
    )
    .increment(1);

    if info.failed > 0 {
        metrics::counter!(
            "meridian_replication_failed_copies_total",
            "index" => shard_id.index_uuid.clone(),
        )
        .increment(u64::from(info.failed));
    }
}

/// Record a state-file write
pub fn record_state_write(generation: u64) {
    metrics::counter!("meridian_state_writes_total").increment(1);
    metrics::gauge!("meridian_state_generation").set(generation as f64);
}

/// Update shard-state and version gauges from a cluster state
pub fn update_cluster_state_metrics(state: &ClusterState) {
    metrics::gauge!("meridian_cluster_state_version").set(state.version as f64);
    metrics::gauge!("meridian_cluster_state_term").set(state.term as f64);
    metrics::gauge!("meridian_cluster_nodes_total").set(state.nodes.len() as f64);

    let all = state
        .routing_table
        .all_shards(None, ShardPredicate::All, false)
        .unwrap_or_default();
    let mut unassigned = 0u64;
    let mut initializing = 0u64;
    let mut started = 0u64;
    let mut relocating = 0u64;
    for shard in &all {
        use crate::routing::ShardRoutingState::*;
        match shard.state {
            Unassigned => unassigned += 1,
            Initializing => initializing += 1,
            Started => started += 1,
            Relocating => relocating += 1,
        }
    }
    metrics::gauge!("meridian_shards_unassigned").set(unassigned as f64);
    metrics::gauge!("meridian_shards_initializing").set(initializing as f64);
    metrics::gauge!("meridian_shards_started").set(started as f64);
    metrics::gauge!("meridian_shards_relocating").set(relocating as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RoutingTable;
    use crate::state::{IndexMetadata, Metadata};

    #[test]
    fn test_update_cluster_state_metrics() {
        let logs = IndexMetadata::builder("logs")
            .number_of_shards(2)
            .number_of_replicas(1)
            .build();
        let state = ClusterState::builder()
            .metadata(Metadata::builder().put(logs.clone()).build())
            .routing_table(RoutingTable::builder().add_as_new(&logs).build())
            .build();

        // Should not panic without a recorder installed.
        update_cluster_state_metrics(&state);
        record_reroute("test");
        record_state_write(3);
    }
}
