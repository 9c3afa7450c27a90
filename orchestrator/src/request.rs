//! Request, outcome and metrics types

use concordia_bridge::ConsensusResult;
use concordia_core::{ChainId, ChainVerificationResult, Timestamp, VerificationData, VerificationStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Claim to verify across chains
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub request_id: String,
    pub agent_id: String,
    pub data: VerificationData,
    /// Requested chains; empty means every registered adapter
    pub chains: Vec<ChainId>,
    /// Consensus score required for VERIFIED; the configured one if unset
    pub threshold: Option<f64>,
}

impl VerificationRequest {
    pub fn new(request_id: impl Into<String>, agent_id: impl Into<String>, data: VerificationData) -> Self {
        Self {
            request_id: request_id.into(),
            agent_id: agent_id.into(),
            data,
            chains: Vec::new(),
            threshold: None,
        }
    }
    
    pub fn with_chains(mut self, chains: Vec<ChainId>) -> Self {
        self.chains = chains;
        self
    }
    
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestPhase {
    Init,
    Verify,
    Vote,
    Aggregate,
    Finalize,
    Completed,
    Failed,
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestPhase::Init => "INIT",
            RequestPhase::Verify => "VERIFY",
            RequestPhase::Vote => "VOTE",
            RequestPhase::Aggregate => "AGGREGATE",
            RequestPhase::Finalize => "FINALIZE",
            RequestPhase::Completed => "COMPLETED",
            RequestPhase::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Decision reached by the algorithm cluster in advanced mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedDecision {
    pub algorithm: String,
    /// Agreed value, `None` when replicas did not decide or disagreed
    pub decided_value: Option<String>,
    pub deciders: usize,
    pub undecided: usize,
    pub messages_delivered: usize,
    pub view_changes: usize,
    /// Hex BLS signature over the decision
    pub threshold_signature: Option<String>,
    pub group_key: Option<String>,
}

/// Terminal result of a request. Every processed request yields one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub request_id: String,
    pub status: VerificationStatus,
    /// Weight of VERIFIED chains over the weight of all participants
    pub score: f64,
    /// Weight-averaged confidence of the chains that answered
    pub confidence: f64,
    pub participants: Vec<ChainId>,
    pub chain_results: Vec<ChainVerificationResult>,
    /// On-chain references returned by vote submission
    pub vote_references: BTreeMap<ChainId, String>,
    pub bridge_result: Option<ConsensusResult>,
    pub advanced: Option<AdvancedDecision>,
    pub byzantine_suspect: bool,
    pub outliers: Vec<ChainId>,
    pub errors: Vec<String>,
    /// Phase that failed, if the request failed
    pub failed_phase: Option<RequestPhase>,
    pub execution_time_ms: u64,
    pub timestamp: Timestamp,
}

impl ConsensusOutcome {
    pub fn is_failed(&self) -> bool {
        self.status == VerificationStatus::Failed
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorMetrics {
    pub total_requests: u64,
    pub verified: u64,
    pub rejected: u64,
    pub pending: u64,
    pub failed: u64,
    pub byzantine_detections: u64,
    total_execution_ms: u64,
}

impl OrchestratorMetrics {
    pub(crate) fn record(&mut self, outcome: &ConsensusOutcome) {
        self.total_requests += 1;
        self.total_execution_ms += outcome.execution_time_ms;
        match outcome.status {
            VerificationStatus::Verified => self.verified += 1,
            VerificationStatus::Rejected => self.rejected += 1,
            VerificationStatus::Pending => self.pending += 1,
            VerificationStatus::Failed => self.failed += 1,
        }
    }
    
    pub fn average_execution_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_execution_ms as f64 / self.total_requests as f64
        }
    }
}
