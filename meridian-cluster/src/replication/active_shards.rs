//! Wait-for-active-shards policy
//!
//! Before touching the primary, a replication operation checks that enough
//! copies of the shard are active. The policy is a count, `all`, or `none`
//! (the default of one: just the primary).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::routing::IndexShardRoutingTable;

/// How many active copies a write waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveShardCount {
    /// Every copy: the primary and all configured replicas
    All,
    /// No copies at all (the check always passes)
    None,
    /// A specific number of copies
    Count(u32),
}

impl Default for ActiveShardCount {
    fn default() -> Self {
        // Just the primary.
        ActiveShardCount::Count(1)
    }
}

impl ActiveShardCount {
    /// Parse a request parameter: "all", "none"/"0", or an integer.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "all" => Some(ActiveShardCount::All),
            "none" => Some(ActiveShardCount::None),
            number => number.parse().ok().map(|n: u32| {
                if n == 0 {
                    ActiveShardCount::None
                } else {
                    ActiveShardCount::Count(n)
                }
            }),
        }
    }

    /// The concrete count for an index with `number_of_replicas` replicas
    pub fn resolved(&self, number_of_replicas: u32) -> u32 {
        match self {
            ActiveShardCount::All => 1 + number_of_replicas,
            ActiveShardCount::None => 0,
            ActiveShardCount::Count(n) => *n,
        }
    }

    /// Whether the shard currently has enough active (STARTED or
    /// RELOCATING) copies.
    pub fn enough_shards_active(
        &self,
        shard_table: &IndexShardRoutingTable,
        number_of_replicas: u32,
    ) -> bool {
        shard_table.active_shard_count() as u32 >= self.resolved(number_of_replicas)
    }
}

impl fmt::Display for ActiveShardCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveShardCount::All => f.write_str("all"),
            ActiveShardCount::None => f.write_str("none"),
            ActiveShardCount::Count(n) => write!(f, "{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{
        IndexShardRoutingTable, RecoverySource, ShardId, ShardRouting, UnassignedInfo,
        UnassignedReason,
    };

    fn shard_table(active_replicas: usize, total_replicas: usize) -> IndexShardRoutingTable {
        let shard_id = ShardId::new("idx", 0);
        let unassigned = |primary: bool| {
            ShardRouting::new_unassigned(
                shard_id.clone(),
                primary,
                if primary {
                    RecoverySource::EmptyStore
                } else {
                    RecoverySource::Peer
                },
                UnassignedInfo::new(UnassignedReason::IndexCreated),
            )
        };

        let mut builder = IndexShardRoutingTable::builder(shard_id.clone());
        builder.add(
            unassigned(true)
                .initialize("node-p", None, None)
                .moved_to_started(),
        );
        for i in 0..total_replicas {
            let replica = unassigned(false).initialize(&format!("node-{i}"), None, None);
            if i < active_replicas {
                builder.add(replica.moved_to_started());
            } else {
                builder.add(replica);
            }
        }
        builder.build()
    }

    #[test]
    fn test_parse() {
        assert_eq!(ActiveShardCount::parse("all"), Some(ActiveShardCount::All));
        assert_eq!(ActiveShardCount::parse("none"), Some(ActiveShardCount::None));
        assert_eq!(ActiveShardCount::parse("0"), Some(ActiveShardCount::None));
        assert_eq!(ActiveShardCount::parse("2"), Some(ActiveShardCount::Count(2)));
        assert_eq!(ActiveShardCount::parse("two"), None);
    }

    #[test]
    fn test_all_requires_every_copy() {
        let policy = ActiveShardCount::All;
        assert!(policy.enough_shards_active(&shard_table(2, 2), 2));
        assert!(!policy.enough_shards_active(&shard_table(1, 2), 2));
    }

    #[test]
    fn test_default_waits_for_primary_only() {
        let policy = ActiveShardCount::default();
        assert!(policy.enough_shards_active(&shard_table(0, 2), 2));
    }

    #[test]
    fn test_none_always_passes() {
        let policy = ActiveShardCount::None;
        assert!(policy.enough_shards_active(&shard_table(0, 2), 2));
    }

    #[test]
    fn test_count_compares_against_active() {
        let policy = ActiveShardCount::Count(2);
        assert!(policy.enough_shards_active(&shard_table(1, 2), 2));
        assert!(!policy.enough_shards_active(&shard_table(0, 2), 2));
    }
}
