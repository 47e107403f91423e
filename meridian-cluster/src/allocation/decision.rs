//! Allocation decisions
//!
//! Every decider answers with yes, throttle, or no. The aggregate over a
//! decider list is a left-fold: any no wins, otherwise any throttle,
//! otherwise yes. In debug mode every individual answer is preserved so the
//! allocator can explain itself.

use serde::{Deserialize, Serialize};

/// Severity-ordered decision kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Yes,
    Throttle,
    No,
}

/// One decider's answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    Yes,
    Throttle(String),
    No(String),
}

impl Decision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::Yes => DecisionKind::Yes,
            Decision::Throttle(_) => DecisionKind::Throttle,
            Decision::No(_) => DecisionKind::No,
        }
    }

    pub fn is_yes(&self) -> bool {
        matches!(self, Decision::Yes)
    }

    pub fn is_no(&self) -> bool {
        matches!(self, Decision::No(_))
    }

    /// The reason string, empty for yes
    pub fn reason(&self) -> &str {
        match self {
            Decision::Yes => "",
            Decision::Throttle(reason) | Decision::No(reason) => reason,
        }
    }
}

/// One decider's answer, labeled for explain output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeciderDecision {
    pub decider: &'static str,
    pub decision: Decision,
}

/// The folded answer of a decider list
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedDecision {
    decision: Decision,
    explanations: Vec<DeciderDecision>,
}

impl AggregatedDecision {
    pub(crate) fn new(decision: Decision, explanations: Vec<DeciderDecision>) -> Self {
        Self {
            decision,
            explanations,
        }
    }

    /// The overall decision
    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    pub fn kind(&self) -> DecisionKind {
        self.decision.kind()
    }

    pub fn is_yes(&self) -> bool {
        self.decision.is_yes()
    }

    /// Individual answers; populated only in debug mode
    pub fn explanations(&self) -> &[DeciderDecision] {
        &self.explanations
    }
}
