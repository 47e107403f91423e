//! Asynchronous per-node shard-state fetch
//!
//! The allocators need per-node shard metadata (allocation ids, store
//! health) before they can place existing-store primaries and replicas.
//! [`AsyncShardFetch`] gathers it in the background:
//!
//! - at most one request is in flight per node for the fetcher's lifetime;
//! - every batch of requests carries a fresh round id, and responses from an
//!   earlier round are dropped silently (they still kick a reroute so a new
//!   pass gets scheduled);
//! - once every polled node has responded or errored, results carry only the
//!   successes; failed entries are cleared so the next poll re-requests them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{ClusterError, Result};
use crate::routing::ShardId;
use crate::state::DiscoveryNodes;

/// Issues the actual per-node shard-state request. Implemented by the
/// transport layer; the fetcher only orchestrates.
#[async_trait]
pub trait ShardStateLister<T>: Send + Sync {
    /// Ask `node_id` for its state of `shard_id`
    async fn list(&self, shard_id: &ShardId, node_id: &str) -> anyhow::Result<T>;
}

/// Receives the "something changed, run the allocator again" kicks.
pub trait RerouteNotifier: Send + Sync {
    fn reroute(&self, shard_id: &ShardId, reason: &str);
}

/// Outcome of one [`AsyncShardFetch::fetch_data`] poll.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult<T> {
    /// False while any polled node still has a request in flight
    pub has_data: bool,

    /// Successful responses by node id; empty unless `has_data`
    pub data: BTreeMap<String, T>,
}

impl<T> FetchResult<T> {
    /// A result that reports requests still in flight
    pub fn fetching() -> Self {
        Self {
            has_data: false,
            data: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
enum NodeEntry<T> {
    /// Request in flight, tagged with the round that issued it
    Fetching { round: u64 },
    /// Response cached
    Data(T),
    /// Request failed; cleared (and re-issued) by the next poll
    Failed { error: Arc<anyhow::Error> },
}

#[derive(Debug)]
struct Inner<T> {
    round: u64,
    cache: BTreeMap<String, NodeEntry<T>>,
    closed: bool,
}

/// Background fetcher for one shard's per-node state.
pub struct AsyncShardFetch<T> {
    shard_id: ShardId,
    lister: Arc<dyn ShardStateLister<T>>,
    notifier: Arc<dyn RerouteNotifier>,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for AsyncShardFetch<T> {
    fn clone(&self) -> Self {
        Self {
            shard_id: self.shard_id.clone(),
            lister: Arc::clone(&self.lister),
            notifier: Arc::clone(&self.notifier),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> AsyncShardFetch<T> {
    /// Create a fetcher for `shard_id`
    pub fn new(
        shard_id: ShardId,
        lister: Arc<dyn ShardStateLister<T>>,
        notifier: Arc<dyn RerouteNotifier>,
    ) -> Self {
        Self {
            shard_id,
            lister,
            notifier,
            inner: Arc::new(Mutex::new(Inner {
                round: 0,
                cache: BTreeMap::new(),
                closed: false,
            })),
        }
    }

    /// The shard this fetcher serves
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Poll the fetch state, issuing requests to data nodes that have no
    /// cache entry. Nodes in `ignore_nodes` are neither fetched nor
    /// reported.
    pub fn fetch_data(
        &self,
        nodes: &DiscoveryNodes,
        ignore_nodes: &BTreeSet<String>,
    ) -> Result<FetchResult<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ClusterError::IllegalState(format!(
                "fetcher for {} is closed",
                self.shard_id
            )));
        }

        let relevant: Vec<String> = nodes
            .data_nodes()
            .map(|n| n.node_id.clone())
            .filter(|id| !ignore_nodes.contains(id))
            .collect();

        let to_fetch: Vec<String> = relevant
            .iter()
            .filter(|id| !inner.cache.contains_key(*id))
            .cloned()
            .collect();

        if !to_fetch.is_empty() {
            inner.round += 1;
            let round = inner.round;
            debug!(
                shard = %self.shard_id,
                round,
                "fetching shard state from {} nodes",
                to_fetch.len()
            );
            for node_id in to_fetch {
                inner
                    .cache
                    .insert(node_id.clone(), NodeEntry::Fetching { round });
                let fetcher = self.clone();
                tokio::spawn(async move {
                    let result = fetcher.lister.list(&fetcher.shard_id, &node_id).await;
                    fetcher.process_response(&node_id, round, result);
                });
            }
        }

        let any_fetching = relevant
            .iter()
            .any(|id| matches!(inner.cache.get(id), Some(NodeEntry::Fetching { .. })));
        if any_fetching {
            return Ok(FetchResult::fetching());
        }

        // Everything responded. Report the successes; drop failures so the
        // next poll re-requests them.
        let mut data = BTreeMap::new();
        for id in &relevant {
            match inner.cache.get(id) {
                Some(NodeEntry::Data(value)) => {
                    data.insert(id.clone(), value.clone());
                }
                Some(NodeEntry::Failed { .. }) => {
                    inner.cache.remove(id);
                }
                _ => {}
            }
        }
        Ok(FetchResult {
            has_data: true,
            data,
        })
    }

    /// Invalidate the cached entry for a node. An in-flight request is left
    /// running; its response will find no entry for its round and be
    /// dropped, and the next poll re-requests.
    pub fn clear_cache_for_node(&self, node_id: &str) {
        self.inner.lock().cache.remove(node_id);
    }

    /// Shut the fetcher down; subsequent polls fail with an illegal-state
    /// error.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Record one node's response for the round that requested it. Stale
    /// rounds and cleared entries are dropped silently; either way a reroute
    /// is kicked so the allocator runs again.
    fn process_response(&self, node_id: &str, round: u64, result: anyhow::Result<T>) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            match inner.cache.get(node_id) {
                Some(NodeEntry::Fetching { round: entry_round }) if *entry_round == round => {
                    let entry = match result {
                        Ok(value) => NodeEntry::Data(value),
                        Err(error) => {
                            warn!(
                                shard = %self.shard_id,
                                node = node_id,
                                "shard state fetch failed: {error:#}"
                            );
                            NodeEntry::Failed {
                                error: Arc::new(error),
                            }
                        }
                    };
                    inner.cache.insert(node_id.to_string(), entry);
                }
                _ => {
                    trace!(
                        shard = %self.shard_id,
                        node = node_id,
                        round,
                        "dropping response from a stale round"
                    );
                }
            }
        }
        self.notifier
            .reroute(&self.shard_id, "async shard fetch response");
    }
}
