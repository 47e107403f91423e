//! One replicated write, coordinated from the primary
//!
//! The operation is an explicit state machine: check active shards, apply
//! on the primary, fan out to every tracked replica, mark departed in-sync
//! copies stale, and only then run the primary's post-replication hook,
//! exactly once, however the fanout went.
//!
//! Failure handling follows the error taxonomy: transient replica errors
//! are retried with capped exponential backoff inside a wall-clock budget;
//! anything else fails the replica through the master. A master answer of
//! "you are no longer the primary" demotes: the primary fails itself and
//! the caller gets a retryable error.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::active_shards::ActiveShardCount;
use super::group::ReplicationGroup;
use crate::config::ReplicationSettings;
use crate::metrics;
use crate::routing::{AllocationId, IndexShardRoutingTable, ShardId, ShardRouting};

/// Upper bound of a single backoff step between transient retries.
const MAX_RETRY_BACKOFF_MS: u64 = 500;

/// Errors of the replication protocol, grouped by how the operation reacts.
#[derive(Error, Debug)]
pub enum ReplicationError {
    // Transient: retried with backoff inside the retry budget.
    #[error("circuit breaking: {0}")]
    CircuitBreaking(String),

    #[error("rejected execution: {0}")]
    RejectedExecution(String),

    #[error("connect transport: {0}")]
    ConnectTransport(String),

    // Critical on a replica: the copy is failed through the master.
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    // Master answers.
    #[error("no longer primary: {0}")]
    NoLongerPrimary(String),

    #[error("node closed: {0}")]
    NodeClosed(String),

    #[error("send request failed: {0}")]
    SendRequestFailed(String),

    // Operation-level outcomes.
    #[error("not enough active shard copies for {shard_id}: {message}")]
    Unavailable { shard_id: ShardId, message: String },

    #[error("retry on new primary for {shard_id}: {message}")]
    RetryOnPrimary { shard_id: ShardId, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReplicationError {
    /// Whether the replication loop retries this error itself
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplicationError::CircuitBreaking(_)
                | ReplicationError::RejectedExecution(_)
                | ReplicationError::ConnectTransport(_)
        )
    }

    /// Whether the caller may safely retry the whole operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::Unavailable { .. } | ReplicationError::RetryOnPrimary { .. }
        )
    }
}

/// Failure updating a checkpoint tracker.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The tracker for this allocation id was already closed (the copy left)
    #[error("checkpoint tracker already closed")]
    AlreadyClosed,

    #[error("checkpoint update failed: {0}")]
    Failed(String),
}

/// What the primary produced for one request.
#[derive(Debug, Clone)]
pub struct PrimaryResult<Rep> {
    /// Request to forward to replicas; `None` when nothing needs
    /// replicating
    pub replica_request: Option<Rep>,

    /// The primary's local checkpoint after the write
    pub local_checkpoint: i64,

    /// The primary's global checkpoint after the write
    pub global_checkpoint: i64,
}

/// A replica's answer: its checkpoints after applying the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaResponse {
    pub local_checkpoint: i64,
    pub global_checkpoint: i64,
}

/// The primary-side seam: the shard engine underneath the operation.
#[async_trait]
pub trait PrimaryContext<Req: Send + 'static, Rep: Send + 'static>: Send + Sync {
    /// Routing entry of the primary copy
    fn routing(&self) -> ShardRouting;

    /// Current primary term
    fn primary_term(&self) -> u64;

    /// Current replication group
    fn replication_group(&self) -> ReplicationGroup;

    /// The primary's view of the global checkpoint
    fn global_checkpoint(&self) -> i64;

    /// Highest sequence number of an update or delete on the primary
    fn max_seq_no_of_updates(&self) -> i64;

    /// Apply the request on the primary
    async fn perform(&self, request: Req) -> Result<PrimaryResult<Rep>, ReplicationError>;

    /// Record a copy's local checkpoint
    fn update_local_checkpoint(
        &self,
        allocation_id: &AllocationId,
        checkpoint: i64,
    ) -> Result<(), CheckpointError>;

    /// Record a copy's global checkpoint
    fn update_global_checkpoint(
        &self,
        allocation_id: &AllocationId,
        checkpoint: i64,
    ) -> Result<(), CheckpointError>;

    /// Fail the primary itself (demotion, fatal bookkeeping error)
    async fn fail_shard(&self, reason: &str);

    /// Runs exactly once, after every replica path has completed
    async fn post_replication(&self);
}

/// The replica-side seam: transport to the replicas and the master.
#[async_trait]
pub trait ReplicasProxy<Rep: Send + 'static>: Send + Sync {
    /// Apply the replica request on one copy
    async fn perform_on(
        &self,
        replica: &ShardRouting,
        request: Rep,
        primary_term: u64,
        global_checkpoint: i64,
        max_seq_no_of_updates: i64,
    ) -> Result<ReplicaResponse, ReplicationError>;

    /// Ask the master to fail a replica copy
    async fn fail_shard_if_needed(
        &self,
        replica: &ShardRouting,
        primary_term: u64,
        message: &str,
    ) -> Result<(), ReplicationError>;

    /// Ask the master to drop an in-sync id with no live copy
    async fn mark_copy_as_stale(
        &self,
        shard_id: &ShardId,
        allocation_id: &AllocationId,
        primary_term: u64,
    ) -> Result<(), ReplicationError>;
}

/// One replica failure reported in the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationFailure {
    pub node_id: Option<String>,
    pub allocation_id: Option<AllocationId>,
    pub message: String,
}

/// Outcome summary of a replicated write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Primary + expected replicas + unassigned + untracked copies
    pub total: u32,

    /// Primary + replicas that applied the write
    pub successful: u32,

    /// Replicas that failed and were reported to the master
    pub failed: u32,

    pub failures: Vec<ReplicationFailure>,
}

/// How one replica's fanout leg ended.
enum ReplicaOutcome {
    Success,
    Failed(ReplicationFailure),
    /// The master said we are not the primary anymore
    DemotePrimary { message: String },
    /// Primary-side bookkeeping failed; the primary cannot continue
    FatalPrimary { message: String },
}

/// A single replicated write in flight.
pub struct ReplicationOperation<Req, Rep, P, R> {
    /// Taken when the operation executes
    request: Option<Req>,
    primary: Arc<P>,
    replicas: Arc<R>,
    shard_table: IndexShardRoutingTable,
    number_of_replicas: u32,
    wait_for_active_shards: ActiveShardCount,
    settings: ReplicationSettings,
    post_replication_done: AtomicBool,
    _replica_request: PhantomData<fn() -> Rep>,
}

impl<Req, Rep, P, R> ReplicationOperation<Req, Rep, P, R>
where
    Req: Send + 'static,
    Rep: Clone + Send + Sync + 'static,
    P: PrimaryContext<Req, Rep>,
    R: ReplicasProxy<Rep>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request: Req,
        primary: Arc<P>,
        replicas: Arc<R>,
        shard_table: IndexShardRoutingTable,
        number_of_replicas: u32,
        wait_for_active_shards: ActiveShardCount,
        settings: ReplicationSettings,
    ) -> Self {
        Self {
            request: Some(request),
            primary,
            replicas,
            shard_table,
            number_of_replicas,
            wait_for_active_shards,
            settings,
            post_replication_done: AtomicBool::new(false),
            _replica_request: PhantomData,
        }
    }

    /// Run the operation to completion.
    pub async fn execute(mut self) -> Result<ShardInfo, ReplicationError> {
        let shard_id = self.shard_table.shard_id().clone();

        // Nothing may touch the primary until enough copies are active;
        // the caller can retry this error freely.
        if !self
            .wait_for_active_shards
            .enough_shards_active(&self.shard_table, self.number_of_replicas)
        {
            return Err(ReplicationError::Unavailable {
                shard_id,
                message: format!(
                    "requested {} active copies, have {}",
                    self.wait_for_active_shards,
                    self.shard_table.active_shard_count()
                ),
            });
        }

        let request = self.request.take().expect("an operation executes once");
        let primary_result = self.primary.perform(request).await?;
        let primary_routing = self.primary.routing();
        if let Err(message) = self.update_checkpoints(
            &primary_routing,
            primary_result.local_checkpoint,
            primary_result.global_checkpoint,
        ) {
            self.primary.fail_shard(&message).await;
            return Err(ReplicationError::RetryOnPrimary { shard_id, message });
        }

        // Resolve the group after the primary apply; copies that joined
        // since the request was routed still get the write.
        let group = self.primary.replication_group();
        let primary_term = self.primary.primary_term();
        let global_checkpoint = self.primary.global_checkpoint();
        let max_seq_no_of_updates = self.primary.max_seq_no_of_updates();

        let mut legs = Vec::new();
        if let Some(replica_request) = &primary_result.replica_request {
            for replica in group.replication_targets() {
                legs.push(self.replicate_to(
                    replica,
                    replica_request.clone(),
                    primary_term,
                    global_checkpoint,
                    max_seq_no_of_updates,
                ));
            }
        }
        let stale_legs = group
            .unavailable_in_sync_ids()
            .iter()
            .map(|id| self.mark_stale(&shard_id, id, primary_term));

        let (outcomes, stale_outcomes) = futures::join!(join_all(legs), join_all(stale_legs));

        let mut failed = 0;
        let mut failures = Vec::new();
        let mut demotion: Option<String> = None;
        for outcome in outcomes.into_iter().chain(stale_outcomes) {
            match outcome {
                ReplicaOutcome::Success => {}
                ReplicaOutcome::Failed(failure) => {
                    failed += 1;
                    failures.push(failure);
                }
                ReplicaOutcome::DemotePrimary { message }
                | ReplicaOutcome::FatalPrimary { message } => {
                    demotion.get_or_insert(message);
                }
            }
        }

        if let Some(message) = demotion {
            warn!(shard = %shard_id, "failing primary: {message}");
            self.primary.fail_shard(&message).await;
            return Err(ReplicationError::RetryOnPrimary { shard_id, message });
        }

        // Post-replication actions happen-after every leg above, and only
        // once even when the caller retries.
        if !self.post_replication_done.swap(true, Ordering::SeqCst) {
            self.primary.post_replication().await;
        }

        let expected = group.expected_replicas();
        let info = ShardInfo {
            total: group.total_shards(),
            successful: 1 + expected.saturating_sub(failed),
            failed,
            failures,
        };
        metrics::record_replication(&shard_id, &info);
        Ok(info)
    }

    /// Drive one replica: retry transient errors within the budget, then
    /// report anything terminal to the master.
    async fn replicate_to(
        &self,
        replica: &ShardRouting,
        request: Rep,
        primary_term: u64,
        global_checkpoint: i64,
        max_seq_no_of_updates: i64,
    ) -> ReplicaOutcome {
        let start = Instant::now();
        let mut backoff = self.settings.initial_retry_backoff();
        let budget = self.settings.retry_timeout();

        loop {
            let attempt = self
                .replicas
                .perform_on(
                    replica,
                    request.clone(),
                    primary_term,
                    global_checkpoint,
                    max_seq_no_of_updates,
                )
                .await;
            match attempt {
                Ok(response) => {
                    return match self.update_checkpoints(
                        replica,
                        response.local_checkpoint,
                        response.global_checkpoint,
                    ) {
                        Ok(()) => ReplicaOutcome::Success,
                        Err(message) => ReplicaOutcome::FatalPrimary { message },
                    };
                }
                Err(err) if err.is_transient() && start.elapsed() + backoff < budget => {
                    debug!(
                        replica = %replica,
                        "transient replica failure, retrying in {backoff:?}: {err}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2)
                        .min(std::time::Duration::from_millis(MAX_RETRY_BACKOFF_MS));
                }
                Err(err) => return self.handle_replica_failure(replica, primary_term, err).await,
            }
        }
    }

    /// A replica leg failed terminally: report it to the master and fold
    /// the master's answer into the outcome.
    async fn handle_replica_failure(
        &self,
        replica: &ShardRouting,
        primary_term: u64,
        error: ReplicationError,
    ) -> ReplicaOutcome {
        warn!(replica = %replica, "replica operation failed: {error}");
        let message = format!("failed to perform operation on replica: {error}");
        let failure = ReplicationFailure {
            node_id: replica.current_node_id.clone(),
            allocation_id: replica.allocation_id.clone(),
            message: message.clone(),
        };

        match self
            .replicas
            .fail_shard_if_needed(replica, primary_term, &message)
            .await
        {
            Ok(()) => ReplicaOutcome::Failed(failure),
            Err(ReplicationError::NoLongerPrimary(reason)) => ReplicaOutcome::DemotePrimary {
                message: format!("master rejected shard failure report: {reason}"),
            },
            // The master being briefly unreachable does not demote us; the
            // replica failure itself still counts.
            Err(
                ReplicationError::NodeClosed(_) | ReplicationError::SendRequestFailed(_),
            ) => ReplicaOutcome::Failed(failure),
            Err(other) => {
                warn!(replica = %replica, "reporting shard failure failed: {other}");
                ReplicaOutcome::Failed(failure)
            }
        }
    }

    /// Tell the master about an in-sync id with no live copy.
    async fn mark_stale(
        &self,
        shard_id: &ShardId,
        allocation_id: &AllocationId,
        primary_term: u64,
    ) -> ReplicaOutcome {
        match self
            .replicas
            .mark_copy_as_stale(shard_id, allocation_id, primary_term)
            .await
        {
            Ok(()) => ReplicaOutcome::Success,
            Err(ReplicationError::NoLongerPrimary(reason)) => ReplicaOutcome::DemotePrimary {
                message: format!("master rejected mark-as-stale: {reason}"),
            },
            Err(err) => {
                // Not a write target; a failed stale-marking does not count
                // against the response.
                warn!(shard = %shard_id, allocation_id = %allocation_id, "mark-as-stale failed: {err}");
                ReplicaOutcome::Success
            }
        }
    }

    /// Feed a copy's reported checkpoints into the primary's trackers. A
    /// closed tracker for a non-primary copy is fine (the copy left);
    /// anything else poisons the primary.
    fn update_checkpoints(
        &self,
        copy: &ShardRouting,
        local_checkpoint: i64,
        global_checkpoint: i64,
    ) -> Result<(), String> {
        let Some(id) = copy.allocation_id.as_ref() else {
            return Ok(());
        };
        let results = [
            self.primary.update_local_checkpoint(id, local_checkpoint),
            self.primary.update_global_checkpoint(id, global_checkpoint),
        ];
        for result in results {
            match result {
                Ok(()) => {}
                Err(CheckpointError::AlreadyClosed) if !copy.primary => {}
                Err(err) => {
                    return Err(format!("checkpoint update for [{id}] failed: {err}"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{
        IndexShardRoutingTable, RecoverySource, UnassignedInfo, UnassignedReason,
    };
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone)]
    struct DocRequest;

    type Outcomes = Mutex<BTreeMap<String, VecDeque<Result<ReplicaResponse, ReplicationError>>>>;

    struct TestPrimary {
        routing: ShardRouting,
        group: ReplicationGroup,
        local_checkpoints: Mutex<BTreeMap<AllocationId, i64>>,
        global_checkpoints: Mutex<BTreeMap<AllocationId, i64>>,
        /// Updates for this allocation id answer `AlreadyClosed`
        closed_tracker: Option<AllocationId>,
        post_replication_count: AtomicUsize,
        failed: Mutex<Option<String>>,
    }

    impl TestPrimary {
        fn new(routing: ShardRouting, group: ReplicationGroup) -> Self {
            Self {
                routing,
                group,
                local_checkpoints: Mutex::new(BTreeMap::new()),
                global_checkpoints: Mutex::new(BTreeMap::new()),
                closed_tracker: None,
                post_replication_count: AtomicUsize::new(0),
                failed: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl PrimaryContext<DocRequest, DocRequest> for TestPrimary {
        fn routing(&self) -> ShardRouting {
            self.routing.clone()
        }

        fn primary_term(&self) -> u64 {
            3
        }

        fn replication_group(&self) -> ReplicationGroup {
            self.group.clone()
        }

        fn global_checkpoint(&self) -> i64 {
            40
        }

        fn max_seq_no_of_updates(&self) -> i64 {
            42
        }

        async fn perform(
            &self,
            _request: DocRequest,
        ) -> Result<PrimaryResult<DocRequest>, ReplicationError> {
            Ok(PrimaryResult {
                replica_request: Some(DocRequest),
                local_checkpoint: 42,
                global_checkpoint: 40,
            })
        }

        fn update_local_checkpoint(
            &self,
            allocation_id: &AllocationId,
            checkpoint: i64,
        ) -> Result<(), CheckpointError> {
            if self.closed_tracker.as_ref() == Some(allocation_id) {
                return Err(CheckpointError::AlreadyClosed);
            }
            self.local_checkpoints
                .lock()
                .insert(allocation_id.clone(), checkpoint);
            Ok(())
        }

        fn update_global_checkpoint(
            &self,
            allocation_id: &AllocationId,
            checkpoint: i64,
        ) -> Result<(), CheckpointError> {
            if self.closed_tracker.as_ref() == Some(allocation_id) {
                return Err(CheckpointError::AlreadyClosed);
            }
            self.global_checkpoints
                .lock()
                .insert(allocation_id.clone(), checkpoint);
            Ok(())
        }

        async fn fail_shard(&self, reason: &str) {
            *self.failed.lock() = Some(reason.to_string());
        }

        async fn post_replication(&self) {
            self.post_replication_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TestReplicas {
        outcomes: Outcomes,
        master_answer: Mutex<Option<ReplicationError>>,
        failed_shards: Mutex<Vec<(ShardRouting, String)>>,
        stale_marks: Mutex<Vec<(ShardId, AllocationId, u64)>>,
    }

    impl TestReplicas {
        fn new(outcomes: Vec<(&str, Vec<Result<ReplicaResponse, ReplicationError>>)>) -> Self {
            Self {
                outcomes: Mutex::new(
                    outcomes
                        .into_iter()
                        .map(|(node, answers)| (node.to_string(), answers.into_iter().collect()))
                        .collect(),
                ),
                master_answer: Mutex::new(None),
                failed_shards: Mutex::new(Vec::new()),
                stale_marks: Mutex::new(Vec::new()),
            }
        }

        fn with_master_answer(self, answer: ReplicationError) -> Self {
            *self.master_answer.lock() = Some(answer);
            self
        }
    }

    #[async_trait]
    impl ReplicasProxy<DocRequest> for TestReplicas {
        async fn perform_on(
            &self,
            replica: &ShardRouting,
            _request: DocRequest,
            primary_term: u64,
            _global_checkpoint: i64,
            _max_seq_no_of_updates: i64,
        ) -> Result<ReplicaResponse, ReplicationError> {
            assert_eq!(primary_term, 3);
            let node = replica.current_node_id.clone().unwrap();
            self.outcomes
                .lock()
                .get_mut(&node)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(ReplicaResponse {
                    local_checkpoint: 42,
                    global_checkpoint: 40,
                }))
        }

        async fn fail_shard_if_needed(
            &self,
            replica: &ShardRouting,
            _primary_term: u64,
            message: &str,
        ) -> Result<(), ReplicationError> {
            self.failed_shards
                .lock()
                .push((replica.clone(), message.to_string()));
            match self.master_answer.lock().take() {
                None => Ok(()),
                Some(err) => Err(err),
            }
        }

        async fn mark_copy_as_stale(
            &self,
            shard_id: &ShardId,
            allocation_id: &AllocationId,
            primary_term: u64,
        ) -> Result<(), ReplicationError> {
            self.stale_marks
                .lock()
                .push((shard_id.clone(), allocation_id.clone(), primary_term));
            Ok(())
        }
    }

    fn shard_id() -> ShardId {
        ShardId::new("idx", 0)
    }

    fn unassigned(primary: bool) -> ShardRouting {
        ShardRouting::new_unassigned(
            shard_id(),
            primary,
            if primary {
                RecoverySource::EmptyStore
            } else {
                RecoverySource::Peer
            },
            UnassignedInfo::new(UnassignedReason::IndexCreated),
        )
    }

    /// Primary on node-p, `replicas` started replicas on node-r0.., all
    /// in-sync.
    fn group_fixture(
        replicas: usize,
    ) -> (IndexShardRoutingTable, ReplicationGroup, ShardRouting) {
        let primary = unassigned(true).initialize("node-p", None, None).moved_to_started();
        let mut builder = IndexShardRoutingTable::builder(shard_id());
        builder.add(primary.clone());
        let mut in_sync: std::collections::BTreeSet<AllocationId> =
            [primary.allocation_id.clone().unwrap()].into_iter().collect();
        for i in 0..replicas {
            let replica = unassigned(false)
                .initialize(&format!("node-r{i}"), None, None)
                .moved_to_started();
            in_sync.insert(replica.allocation_id.clone().unwrap());
            builder.add(replica);
        }
        let table = builder.build();
        let group = ReplicationGroup::resolve(&table, &in_sync).unwrap();
        (table, group, primary)
    }

    fn settings() -> ReplicationSettings {
        ReplicationSettings {
            retry_timeout_ms: 1_000,
            initial_retry_backoff_ms: 1,
        }
    }

    fn operation(
        primary: Arc<TestPrimary>,
        replicas: Arc<TestReplicas>,
        table: IndexShardRoutingTable,
        wait_for: ActiveShardCount,
    ) -> ReplicationOperation<DocRequest, DocRequest, TestPrimary, TestReplicas> {
        let number_of_replicas = table.size() as u32 - 1;
        ReplicationOperation::new(
            DocRequest,
            primary,
            replicas,
            table,
            number_of_replicas,
            wait_for,
            settings(),
        )
    }

    #[tokio::test]
    async fn test_success_path_reports_full_shard_info() {
        let (table, group, primary_routing) = group_fixture(2);
        let primary = Arc::new(TestPrimary::new(primary_routing, group.clone()));
        let replicas = Arc::new(TestReplicas::new(vec![
            (
                "node-r0",
                vec![Ok(ReplicaResponse {
                    local_checkpoint: 41,
                    global_checkpoint: 40,
                })],
            ),
            (
                "node-r1",
                vec![Ok(ReplicaResponse {
                    local_checkpoint: 42,
                    global_checkpoint: 39,
                })],
            ),
        ]));

        let info = operation(
            Arc::clone(&primary),
            Arc::clone(&replicas),
            table,
            ActiveShardCount::default(),
        )
        .execute()
        .await
        .unwrap();

        assert_eq!(info.total, 3);
        assert_eq!(info.successful, 3);
        assert_eq!(info.failed, 0);
        assert!(info.failures.is_empty());
        assert_eq!(primary.post_replication_count.load(Ordering::SeqCst), 1);

        // The primary's trackers saw exactly what the replicas reported.
        let locals = primary.local_checkpoints.lock();
        for target in group.replication_targets() {
            let id = target.allocation_id.as_ref().unwrap();
            let node = target.current_node_id.as_deref().unwrap();
            let expected = if node == "node-r0" { 41 } else { 42 };
            assert_eq!(locals.get(id), Some(&expected), "checkpoint of {node}");
        }
    }

    #[tokio::test]
    async fn test_unavailable_when_too_few_active_copies() {
        // One started primary, one *unassigned* replica: "all" cannot be
        // satisfied.
        let primary = unassigned(true).initialize("node-p", None, None).moved_to_started();
        let mut builder = IndexShardRoutingTable::builder(shard_id());
        builder.add(primary.clone());
        builder.add(unassigned(false));
        let table = builder.build();
        let in_sync = [primary.allocation_id.clone().unwrap()].into_iter().collect();
        let group = ReplicationGroup::resolve(&table, &in_sync).unwrap();

        let test_primary = Arc::new(TestPrimary::new(primary, group));
        let replicas = Arc::new(TestReplicas::new(vec![]));

        let err = operation(
            Arc::clone(&test_primary),
            replicas,
            table,
            ActiveShardCount::All,
        )
        .execute()
        .await
        .unwrap_err();

        assert!(matches!(err, ReplicationError::Unavailable { .. }));
        assert!(err.is_retryable());
        // The primary was never touched.
        assert!(test_primary.local_checkpoints.lock().is_empty());
        assert_eq!(test_primary.post_replication_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_then_succeeds() {
        let (table, group, primary_routing) = group_fixture(2);
        let primary = Arc::new(TestPrimary::new(primary_routing, group));
        let replicas = Arc::new(TestReplicas::new(vec![(
            "node-r0",
            vec![
                Err(ReplicationError::CircuitBreaking("breaker tripped".to_string())),
                Ok(ReplicaResponse {
                    local_checkpoint: 42,
                    global_checkpoint: 40,
                }),
            ],
        )]));

        let info = operation(
            Arc::clone(&primary),
            Arc::clone(&replicas),
            table,
            ActiveShardCount::default(),
        )
        .execute()
        .await
        .unwrap();

        assert_eq!(info.successful, 3);
        assert_eq!(info.failed, 0);
        // No shard was failed and the hook ran exactly once.
        assert!(replicas.failed_shards.lock().is_empty());
        assert_eq!(primary.post_replication_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_fails_the_replica() {
        let (table, group, primary_routing) = group_fixture(1);
        let primary = Arc::new(TestPrimary::new(primary_routing, group));
        // Far more transient failures than a 20ms budget allows.
        let failures: Vec<Result<ReplicaResponse, ReplicationError>> = (0..64)
            .map(|_| Err(ReplicationError::ConnectTransport("unreachable".to_string())))
            .collect();
        let replicas = Arc::new(TestReplicas::new(vec![("node-r0", failures)]));

        let number_of_replicas = table.size() as u32 - 1;
        let op = ReplicationOperation::new(
            DocRequest,
            Arc::clone(&primary),
            Arc::clone(&replicas),
            table,
            number_of_replicas,
            ActiveShardCount::default(),
            ReplicationSettings {
                retry_timeout_ms: 20,
                initial_retry_backoff_ms: 1,
            },
        );
        let info = op.execute().await.unwrap();

        assert_eq!(info.failed, 1);
        assert_eq!(info.successful, 1);
        assert_eq!(replicas.failed_shards.lock().len(), 1);
        assert!(info.failures[0].message.contains("connect transport"));
    }

    #[tokio::test]
    async fn test_corrupt_replica_failed_through_master() {
        let (table, group, primary_routing) = group_fixture(2);
        let primary = Arc::new(TestPrimary::new(primary_routing, group));
        let replicas = Arc::new(TestReplicas::new(vec![(
            "node-r1",
            vec![Err(ReplicationError::CorruptIndex("bad segment".to_string()))],
        )]));

        let info = operation(
            Arc::clone(&primary),
            Arc::clone(&replicas),
            table,
            ActiveShardCount::default(),
        )
        .execute()
        .await
        .unwrap();

        assert_eq!(info.total, 3);
        assert_eq!(info.successful, 2);
        assert_eq!(info.failed, 1);
        let failed = replicas.failed_shards.lock();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0.current_node_id.as_deref(), Some("node-r1"));
        // Handled failure still counts as completion: the hook ran.
        assert_eq!(primary.post_replication_count.load(Ordering::SeqCst), 1);
        assert!(primary.failed.lock().is_none());
    }

    #[tokio::test]
    async fn test_no_longer_primary_demotes() {
        let (table, group, primary_routing) = group_fixture(1);
        let primary = Arc::new(TestPrimary::new(primary_routing, group));
        let replicas = Arc::new(
            TestReplicas::new(vec![(
                "node-r0",
                vec![Err(ReplicationError::CorruptIndex("bad segment".to_string()))],
            )])
            .with_master_answer(ReplicationError::NoLongerPrimary(
                "term 3 is stale".to_string(),
            )),
        );

        let err = operation(
            Arc::clone(&primary),
            replicas,
            table,
            ActiveShardCount::default(),
        )
        .execute()
        .await
        .unwrap_err();

        assert!(matches!(err, ReplicationError::RetryOnPrimary { .. }));
        assert!(primary.failed.lock().is_some(), "primary must self-fail");
        // Demotion skips the post-replication hook.
        assert_eq!(primary.post_replication_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_master_node_closed_does_not_demote() {
        let (table, group, primary_routing) = group_fixture(1);
        let primary = Arc::new(TestPrimary::new(primary_routing, group));
        let replicas = Arc::new(
            TestReplicas::new(vec![(
                "node-r0",
                vec![Err(ReplicationError::CorruptIndex("bad segment".to_string()))],
            )])
            .with_master_answer(ReplicationError::NodeClosed("master restarting".to_string())),
        );

        let info = operation(
            Arc::clone(&primary),
            replicas,
            table,
            ActiveShardCount::default(),
        )
        .execute()
        .await
        .unwrap();

        assert_eq!(info.failed, 1);
        assert!(primary.failed.lock().is_none());
        assert_eq!(primary.post_replication_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_in_sync_ids_are_marked() {
        let primary = unassigned(true).initialize("node-p", None, None).moved_to_started();
        let departed = AllocationId::from_string("departed-copy");
        let mut builder = IndexShardRoutingTable::builder(shard_id());
        builder.add(primary.clone());
        let table = builder.build();
        let in_sync = [primary.allocation_id.clone().unwrap(), departed.clone()]
            .into_iter()
            .collect();
        let group = ReplicationGroup::resolve(&table, &in_sync).unwrap();

        let test_primary = Arc::new(TestPrimary::new(primary, group));
        let replicas = Arc::new(TestReplicas::new(vec![]));

        let info = operation(
            Arc::clone(&test_primary),
            Arc::clone(&replicas),
            table,
            ActiveShardCount::default(),
        )
        .execute()
        .await
        .unwrap();

        assert_eq!(info.total, 1);
        assert_eq!(info.successful, 1);
        let marks = replicas.stale_marks.lock();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].1, departed);
        assert_eq!(marks[0].2, 3);
    }

    #[tokio::test]
    async fn test_closed_tracker_for_replica_is_swallowed() {
        let (table, group, primary_routing) = group_fixture(2);
        let departed_replica = group.replication_targets()[0].clone();
        let mut test_primary = TestPrimary::new(primary_routing, group);
        test_primary.closed_tracker = departed_replica.allocation_id.clone();
        let primary = Arc::new(test_primary);
        let replicas = Arc::new(TestReplicas::new(vec![]));

        // The replica responded fine but its tracker is gone (the copy
        // left): swallowed, the write still fully succeeds.
        let info = operation(
            Arc::clone(&primary),
            replicas,
            table,
            ActiveShardCount::default(),
        )
        .execute()
        .await
        .unwrap();

        assert_eq!(info.failed, 0);
        assert_eq!(info.successful, 3);
        assert!(primary.failed.lock().is_none());
        assert!(!primary
            .local_checkpoints
            .lock()
            .contains_key(departed_replica.allocation_id.as_ref().unwrap()));
    }

    #[tokio::test]
    async fn test_closed_tracker_for_primary_is_fatal() {
        let (table, group, primary_routing) = group_fixture(1);
        let mut test_primary = TestPrimary::new(primary_routing.clone(), group);
        test_primary.closed_tracker = primary_routing.allocation_id.clone();
        let primary = Arc::new(test_primary);
        let replicas = Arc::new(TestReplicas::new(vec![]));

        let err = operation(
            Arc::clone(&primary),
            replicas,
            table,
            ActiveShardCount::default(),
        )
        .execute()
        .await
        .unwrap_err();

        assert!(matches!(err, ReplicationError::RetryOnPrimary { .. }));
        assert!(primary.failed.lock().is_some());
        assert_eq!(primary.post_replication_count.load(Ordering::SeqCst), 0);
    }
}
