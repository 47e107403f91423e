//! Cluster membership as observed by the coordination core
//!
//! The discovery/election layer produces these values; the core only reads
//! them (which nodes hold data, who the master is).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Eligible to be elected master
    Master,
    /// Hosts shard data
    Data,
}

/// One known cluster node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// Unique node identifier (stable for the process lifetime)
    pub node_id: String,

    /// Human-facing node name
    pub name: String,

    /// Transport address (host:port)
    pub address: String,

    /// Roles this node carries
    pub roles: BTreeSet<NodeRole>,
}

impl DiscoveryNode {
    /// Create a node with both master and data roles
    pub fn new(node_id: impl Into<String>, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            address: address.into(),
            roles: BTreeSet::from([NodeRole::Master, NodeRole::Data]),
        }
    }

    /// Restrict the node to the given roles
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = NodeRole>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    /// Whether the node hosts shard data
    pub fn is_data_node(&self) -> bool {
        self.roles.contains(&NodeRole::Data)
    }

    /// Whether the node can be elected master
    pub fn is_master_eligible(&self) -> bool {
        self.roles.contains(&NodeRole::Master)
    }
}

/// The set of known nodes plus the current master, if any
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<String, DiscoveryNode>,
    master_node_id: Option<String>,
    local_node_id: Option<String>,
}

impl DiscoveryNodes {
    /// Start building a node set
    pub fn builder() -> DiscoveryNodesBuilder {
        DiscoveryNodesBuilder {
            nodes: BTreeMap::new(),
            master_node_id: None,
            local_node_id: None,
        }
    }

    /// Look up a node
    pub fn get(&self, node_id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(node_id)
    }

    /// Whether a node is known
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// All nodes
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    /// Nodes carrying the data role
    pub fn data_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.is_data_node())
    }

    /// The elected master, if known
    pub fn master_node(&self) -> Option<&DiscoveryNode> {
        self.master_node_id.as_deref().and_then(|id| self.nodes.get(id))
    }

    /// Id of the elected master, if known
    pub fn master_node_id(&self) -> Option<&str> {
        self.master_node_id.as_deref()
    }

    /// Id of the local node, if set
    pub fn local_node_id(&self) -> Option<&str> {
        self.local_node_id.as_deref()
    }

    /// Total node count
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no nodes are known
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Single-use builder; `build` consumes it.
#[derive(Debug)]
pub struct DiscoveryNodesBuilder {
    nodes: BTreeMap<String, DiscoveryNode>,
    master_node_id: Option<String>,
    local_node_id: Option<String>,
}

impl DiscoveryNodesBuilder {
    /// Add a node
    pub fn add(mut self, node: DiscoveryNode) -> Self {
        self.nodes.insert(node.node_id.clone(), node);
        self
    }

    /// Remove a node
    pub fn remove(mut self, node_id: &str) -> Self {
        self.nodes.remove(node_id);
        if self.master_node_id.as_deref() == Some(node_id) {
            self.master_node_id = None;
        }
        self
    }

    /// Record the elected master
    pub fn master_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.master_node_id = Some(node_id.into());
        self
    }

    /// Record the local node
    pub fn local_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.local_node_id = Some(node_id.into());
        self
    }

    pub fn build(self) -> DiscoveryNodes {
        if let Some(master) = &self.master_node_id {
            assert!(
                self.nodes.contains_key(master),
                "master {master} is not a known node"
            );
        }
        DiscoveryNodes {
            nodes: self.nodes,
            master_node_id: self.master_node_id,
            local_node_id: self.local_node_id,
        }
    }
}
