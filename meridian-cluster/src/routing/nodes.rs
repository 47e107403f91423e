//! The mutable by-node view the allocation engine works on
//!
//! [`RoutingNodes`] is built from an immutable [`RoutingTable`] at the start
//! of a reroute pass, mutated by the allocators (initialize, start, relocate,
//! fail, ignore), and turned back into a table via
//! [`RoutingTableBuilder::update_nodes`]. It is strictly single-threaded.
//!
//! [`RoutingTableBuilder::update_nodes`]: super::table::RoutingTableBuilder::update_nodes

use std::collections::BTreeMap;

use super::shard::{AllocationId, ShardId, ShardRouting, UnassignedInfo};
use super::table::RoutingTable;
use crate::state::nodes::DiscoveryNodes;

/// Per-node shard lists plus the unassigned queue.
#[derive(Debug)]
pub struct RoutingNodes {
    /// Assigned copies per node, relocation-target entries included
    nodes: BTreeMap<String, Vec<ShardRouting>>,

    /// Copies waiting for allocation
    unassigned: Vec<ShardRouting>,

    /// Copies an allocator looked at and deliberately left unassigned this
    /// pass, with their allocation status updated
    ignored: Vec<ShardRouting>,
}

impl RoutingNodes {
    /// Build the by-node view of a routing table. Every data node gets an
    /// entry even when it holds nothing; nodes that left the cluster but
    /// still appear in the table are carried so their shards can be failed.
    pub fn new(table: &RoutingTable, nodes: &DiscoveryNodes) -> Self {
        let mut by_node: BTreeMap<String, Vec<ShardRouting>> = BTreeMap::new();
        for node in nodes.data_nodes() {
            by_node.entry(node.node_id.clone()).or_default();
        }

        let mut unassigned = Vec::new();
        for index_table in table.index_tables() {
            for shard in index_table.all_shards() {
                match &shard.current_node_id {
                    None => unassigned.push(shard.clone()),
                    Some(node_id) => {
                        by_node.entry(node_id.clone()).or_default().push(shard.clone());
                        if shard.relocating() {
                            let target = shard.build_target_relocating_shard();
                            let target_node = target
                                .current_node_id
                                .clone()
                                .expect("relocation target is assigned");
                            by_node.entry(target_node).or_default().push(target);
                        }
                    }
                }
            }
        }

        Self {
            nodes: by_node,
            unassigned,
            ignored: Vec::new(),
        }
    }

    // ========================================
    // Read access
    // ========================================

    /// Node ids with an entry (all data nodes plus stragglers)
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Copies on one node
    pub fn shards_on_node(&self, node_id: &str) -> &[ShardRouting] {
        self.nodes.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every assigned copy, across all nodes
    pub fn assigned_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.nodes.values().flatten()
    }

    /// Copies waiting for allocation
    pub fn unassigned(&self) -> &[ShardRouting] {
        &self.unassigned
    }

    /// Copies deliberately left unassigned this pass
    pub fn ignored(&self) -> &[ShardRouting] {
        &self.ignored
    }

    /// Whether `node_id` holds any copy of `shard_id` (relocation targets
    /// count)
    pub fn has_shard_copy_on_node(&self, shard_id: &ShardId, node_id: &str) -> bool {
        self.shards_on_node(node_id)
            .iter()
            .any(|s| &s.shard_id == shard_id)
    }

    /// Number of copies on a node
    pub fn node_shard_count(&self, node_id: &str) -> usize {
        self.shards_on_node(node_id).len()
    }

    /// Number of copies of one index on a node
    pub fn node_index_shard_count(&self, node_id: &str, index_uuid: &str) -> usize {
        self.shards_on_node(node_id)
            .iter()
            .filter(|s| s.shard_id.index_uuid == index_uuid)
            .count()
    }

    /// INITIALIZING copies on a node (recoveries flowing in)
    pub fn incoming_recoveries(&self, node_id: &str) -> usize {
        self.shards_on_node(node_id)
            .iter()
            .filter(|s| s.initializing())
            .count()
    }

    /// RELOCATING sources on a node (recoveries flowing out)
    pub fn outgoing_recoveries(&self, node_id: &str) -> usize {
        self.shards_on_node(node_id)
            .iter()
            .filter(|s| s.relocating())
            .count()
    }

    /// The active primary of a shard, if any
    pub fn active_primary(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.assigned_shards()
            .find(|s| &s.shard_id == shard_id && s.primary && s.active())
    }

    // ========================================
    // Mutations
    // ========================================

    /// Take the unassigned queue for an allocation pass. The caller must
    /// either allocate, ignore, or push back every entry.
    pub fn take_unassigned(&mut self) -> Vec<ShardRouting> {
        std::mem::take(&mut self.unassigned)
    }

    /// Return an untouched copy to the unassigned queue
    pub fn push_unassigned(&mut self, shard: ShardRouting) {
        debug_assert!(shard.unassigned());
        self.unassigned.push(shard);
    }

    /// Leave a copy unassigned this pass, recording why
    pub fn ignore_shard(&mut self, shard: ShardRouting, status: super::shard::AllocationStatus) {
        debug_assert!(shard.unassigned());
        let mut shard = shard;
        if let Some(info) = shard.unassigned_info.take() {
            shard.unassigned_info = Some(info.with_status(status));
        }
        self.ignored.push(shard);
    }

    /// Initialize an unassigned copy on a node. The caller got the copy from
    /// [`take_unassigned`](Self::take_unassigned).
    pub fn initialize_shard(
        &mut self,
        shard: &ShardRouting,
        node_id: &str,
        existing_allocation_id: Option<AllocationId>,
        expected_shard_size: Option<u64>,
    ) -> ShardRouting {
        let initialized = shard.initialize(node_id, existing_allocation_id, expected_shard_size);
        self.nodes
            .entry(node_id.to_string())
            .or_default()
            .push(initialized.clone());
        initialized
    }

    /// Move an INITIALIZING copy to STARTED. Completing a relocation target
    /// removes its RELOCATING source entry.
    pub fn start_shard(&mut self, shard: &ShardRouting) -> ShardRouting {
        assert!(shard.initializing(), "cannot start {shard}");
        let started = shard.moved_to_started();

        if shard.is_relocation_target() {
            let source_node = shard
                .relocating_node_id
                .clone()
                .expect("relocation target knows its source");
            let target_id = shard.allocation_id.clone();
            if let Some(entries) = self.nodes.get_mut(&source_node) {
                entries.retain(|s| s.target_allocation_id != target_id || !s.relocating());
            }
        }

        self.replace_entry(shard, started.clone());
        started
    }

    /// Begin relocating a STARTED copy to `target_node`. Returns the updated
    /// source and the new target entry.
    pub fn relocate_shard(
        &mut self,
        shard: &ShardRouting,
        target_node: &str,
        expected_shard_size: Option<u64>,
    ) -> (ShardRouting, ShardRouting) {
        let source = shard.relocate(target_node, expected_shard_size);
        let target = source.build_target_relocating_shard();
        self.replace_entry(shard, source.clone());
        self.nodes
            .entry(target_node.to_string())
            .or_default()
            .push(target.clone());
        (source, target)
    }

    /// Fail an assigned copy: remove it from its node and queue it
    /// unassigned. Failing a RELOCATING source drops the target entry too;
    /// failing a relocation target cancels the source's move; failing a
    /// primary promotes an active replica so the group keeps a primary.
    pub fn fail_shard(&mut self, shard: &ShardRouting, unassigned_info: UnassignedInfo) {
        assert!(shard.assigned(), "cannot fail unassigned {shard}");

        self.remove_entry(shard);

        if shard.relocating() {
            // Drop the half-built target.
            if let Some(target_node) = &shard.relocating_node_id {
                let target_id = &shard.target_allocation_id;
                if let Some(entries) = self.nodes.get_mut(target_node) {
                    entries.retain(|s| &s.allocation_id != target_id);
                }
            }
        } else if shard.is_relocation_target() {
            // The source keeps serving; its move is off.
            let source_node = shard
                .relocating_node_id
                .clone()
                .expect("relocation target knows its source");
            if let Some(entries) = self.nodes.get_mut(&source_node) {
                if let Some(source) = entries
                    .iter_mut()
                    .find(|s| s.relocating() && s.target_allocation_id == shard.allocation_id)
                {
                    *source = source.cancel_relocation();
                }
            }
            // The target never was a tracked copy; nothing becomes
            // unassigned.
            return;
        }

        if shard.primary && self.promote_replica(&shard.shard_id) {
            // The group has a new primary; the failed copy comes back as a
            // replica.
            let mut demoted = shard.clone();
            demoted.primary = false;
            self.unassigned.push(demoted.moved_to_unassigned(unassigned_info));
            return;
        }

        self.unassigned.push(shard.moved_to_unassigned(unassigned_info));
    }

    /// Promote the active replica with the lowest allocation id, keeping the
    /// one-primary-per-group invariant after a primary failure. Returns
    /// whether a replica was promoted.
    fn promote_replica(&mut self, shard_id: &ShardId) -> bool {
        let candidate = self
            .nodes
            .values()
            .flatten()
            .filter(|s| &s.shard_id == shard_id && !s.primary && s.active())
            .min_by(|a, b| a.allocation_id.cmp(&b.allocation_id))
            .cloned();

        let Some(replica) = candidate else {
            return false;
        };
        for entries in self.nodes.values_mut() {
            for entry in entries.iter_mut() {
                if entry.is_same_allocation(&replica)
                    || (entry.is_relocation_target()
                        && entry.shard_id == replica.shard_id
                        && entry.relocating_node_id == replica.current_node_id)
                {
                    entry.primary = true;
                }
            }
        }
        true
    }

    fn replace_entry(&mut self, old: &ShardRouting, new: ShardRouting) {
        let node = old
            .current_node_id
            .as_ref()
            .expect("assigned shard has a node");
        let entries = self.nodes.get_mut(node).expect("node entry exists");
        let slot = entries
            .iter_mut()
            .find(|s| s.is_same_allocation(old))
            .unwrap_or_else(|| panic!("{old} not found on {node}"));
        *slot = new;
    }

    fn remove_entry(&mut self, shard: &ShardRouting) {
        let node = shard
            .current_node_id
            .as_ref()
            .expect("assigned shard has a node");
        if let Some(entries) = self.nodes.get_mut(node) {
            entries.retain(|s| !s.is_same_allocation(shard));
        }
    }
}
