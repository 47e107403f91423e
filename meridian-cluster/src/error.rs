//! Cluster-specific error types

use thiserror::Error;

use crate::routing::ShardId;

/// Errors that can occur during cluster coordination
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("stale cluster state: have ({have_term}, {have_version}), got ({got_term}, {got_version})")]
    StaleClusterState {
        have_term: u64,
        have_version: u64,
        got_term: u64,
        got_version: u64,
    },

    #[error("diff base mismatch: diff built on version {expected}, applying to {actual}")]
    DiffBaseMismatch { expected: u64, actual: u64 },

    #[error("state error: {0}")]
    State(#[from] meridian_state::StateError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClusterError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            ClusterError::IndexNotFound(_) => "index_not_found",
            ClusterError::ShardNotFound(_) => "shard_not_found",
            ClusterError::IllegalState(_) => "illegal_state",
            ClusterError::InvalidSetting { .. } => "invalid_setting",
            ClusterError::StaleClusterState { .. } => "stale_cluster_state",
            ClusterError::DiffBaseMismatch { .. } => "diff_base_mismatch",
            ClusterError::State(_) => "state",
            ClusterError::Serialization(_) => "serialization",
        }
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
