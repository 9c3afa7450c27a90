//! Bridge vote processes and their results

use crate::detector::DetectionReport;
use crate::vote::ConsensusVote;
use concordia_consensus::max_faulty;
use concordia_core::{ChainId, ConsensusMode, MessageId, ProcessId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Per-process parameters handed to `initialize`
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub mode: ConsensusMode,
    /// Weighted-mode threshold; the engine default when `None`
    pub threshold: Option<f64>,
    /// Engine default when `None`
    pub timeout: Option<Duration>,
    /// Static chain weights; participants not listed weigh 1.0
    pub chain_weights: HashMap<ChainId, f64>,
}

impl ProcessConfig {
    pub fn new(mode: ConsensusMode) -> Self {
        Self {
            mode,
            threshold: None,
            timeout: None,
            chain_weights: HashMap::new(),
        }
    }
    
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }
    
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
    
    pub fn with_weight(mut self, chain: ChainId, weight: f64) -> Self {
        self.chain_weights.insert(chain, weight);
        self
    }
}

/// How a process reached completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Completion {
    /// A value reached quorum
    Quorum,
    /// No value can reach quorum any more
    NoQuorum,
    /// The deadline elapsed first
    Timeout,
    /// Force-completed on an internal error or shutdown
    Failed(String),
}

/// Detection and support figures attached to a result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub completion: Completion,
    /// Weighted (or counted) support of the final value
    pub support: f64,
    pub byzantine_suspect: bool,
    pub outliers: Vec<ChainId>,
    pub confidence_mean: f64,
    pub confidence_std_dev: f64,
}

/// Immutable outcome of a process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub process_id: ProcessId,
    pub message_id: MessageId,
    pub mode: ConsensusMode,
    pub participants: Vec<ChainId>,
    /// Votes actually received, whatever the outcome
    pub total_votes: usize,
    pub achieved: bool,
    pub final_value: Option<String>,
    pub confidence: f64,
    pub execution_time_ms: u64,
    pub timestamp: Timestamp,
    /// Recorded votes, kept for audit
    pub votes: Vec<ConsensusVote>,
    pub metadata: ResultMetadata,
}

/// Result of evaluating the current votes
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Achieved {
        value: String,
        support: f64,
        confidence: f64,
    },
    /// No value can reach quorum with the remaining voters
    Impossible,
    Pending,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    weight: f64,
    count: usize,
    confidence_sum: f64,
}

/// One vote process. Its participant set is fixed at creation.
#[derive(Debug, Clone)]
pub struct ConsensusProcess {
    pub id: ProcessId,
    pub message_id: MessageId,
    pub mode: ConsensusMode,
    pub participants: Vec<ChainId>,
    pub votes: BTreeMap<ChainId, ConsensusVote>,
    pub chain_weights: HashMap<ChainId, f64>,
    pub threshold: f64,
    pub timeout: Duration,
    pub started_at: Instant,
    pub started: Timestamp,
}

impl ConsensusProcess {
    pub fn new(
        message_id: MessageId,
        mode: ConsensusMode,
        participants: Vec<ChainId>,
        chain_weights: HashMap<ChainId, f64>,
        threshold: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            id: ProcessId::new(),
            message_id,
            mode,
            participants,
            votes: BTreeMap::new(),
            chain_weights,
            threshold,
            timeout,
            started_at: Instant::now(),
            started: Timestamp::now(),
        }
    }
    
    pub fn deadline(&self) -> Instant {
        self.started_at + self.timeout
    }
    
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }
    
    pub fn is_participant(&self, chain: &ChainId) -> bool {
        self.participants.contains(chain)
    }
    
    pub fn has_voted(&self, chain: &ChainId) -> bool {
        self.votes.contains_key(chain)
    }
    
    pub fn chain_weight(&self, chain: &ChainId) -> f64 {
        self.chain_weights.get(chain).copied().unwrap_or(1.0)
    }
    
    pub fn total_weight(&self) -> f64 {
        self.participants.iter().map(|c| self.chain_weight(c)).sum()
    }
    
    /// Distinct voters BFT mode requires: N − f
    pub fn bft_min_voters(&self) -> usize {
        let n = self.participants.len();
        n - max_faulty(n)
    }
    
    fn tally(&self) -> BTreeMap<&str, Tally> {
        let mut tallies: BTreeMap<&str, Tally> = BTreeMap::new();
        for vote in self.votes.values() {
            let t = tallies.entry(vote.value.as_str()).or_default();
            t.weight += self.chain_weight(&vote.voter) * vote.weight;
            t.count += 1;
            t.confidence_sum += vote.confidence;
        }
        tallies
    }
    
    /// Support of a value as the mode measures it
    fn support(&self, t: &Tally) -> f64 {
        match self.mode {
            ConsensusMode::SimpleMajority => t.count as f64 / self.participants.len() as f64,
            ConsensusMode::Weighted | ConsensusMode::Bft => {
                let total = self.total_weight();
                if total > 0.0 {
                    t.weight / total
                } else {
                    0.0
                }
            }
        }
    }
    
    fn reaches_quorum(&self, t: &Tally) -> bool {
        let n = self.participants.len();
        match self.mode {
            ConsensusMode::SimpleMajority => t.count * 2 > n,
            ConsensusMode::Weighted => self.support(t) >= self.threshold,
            ConsensusMode::Bft => self.support(t) >= self.threshold && t.count >= self.bft_min_voters(),
        }
    }
    
    /// Whether some value, existing or new, could still reach quorum if
    /// every remaining participant voted for it at full weight
    fn quorum_possible(&self, tallies: &BTreeMap<&str, Tally>) -> bool {
        let mut remaining = Tally::default();
        for chain in self.participants.iter().filter(|c| !self.has_voted(c)) {
            remaining.weight += self.chain_weight(chain);
            remaining.count += 1;
        }
        
        tallies
            .values()
            .copied()
            .chain(std::iter::once(Tally::default()))
            .any(|t| {
                self.reaches_quorum(&Tally {
                    weight: t.weight + remaining.weight,
                    count: t.count + remaining.count,
                    confidence_sum: 0.0,
                })
            })
    }
    
    /// Evaluate the recorded votes. Idempotent.
    pub fn evaluate(&self) -> Evaluation {
        let tallies = self.tally();
        let winner = tallies
            .iter()
            .filter(|(_, t)| self.reaches_quorum(t))
            .max_by(|a, b| self.support(a.1).total_cmp(&self.support(b.1)));
        
        if let Some((value, t)) = winner {
            let support = self.support(t);
            let mean_confidence = t.confidence_sum / t.count as f64;
            return Evaluation::Achieved {
                value: value.to_string(),
                support,
                confidence: mean_confidence * support,
            };
        }
        if self.votes.len() == self.participants.len() || !self.quorum_possible(&tallies) {
            Evaluation::Impossible
        } else {
            Evaluation::Pending
        }
    }
    
    /// Build the final result. Only `Completion::Quorum` carries a value.
    pub fn into_result(self, evaluation: Evaluation, completion: Completion, detection: DetectionReport) -> ConsensusResult {
        let (achieved, final_value, confidence, support) = match (&completion, evaluation) {
            (Completion::Quorum, Evaluation::Achieved { value, support, confidence }) => {
                (true, Some(value), confidence, support)
            }
            _ => (false, None, 0.0, 0.0),
        };
        let execution_time_ms = self.started_at.elapsed().as_millis() as u64;
        
        ConsensusResult {
            process_id: self.id,
            message_id: self.message_id,
            mode: self.mode,
            participants: self.participants,
            total_votes: self.votes.len(),
            achieved,
            final_value,
            confidence,
            execution_time_ms,
            timestamp: Timestamp::now(),
            votes: self.votes.into_values().collect(),
            metadata: ResultMetadata {
                completion,
                support,
                byzantine_suspect: detection.suspect,
                outliers: detection.outliers,
                confidence_mean: detection.mean,
                confidence_std_dev: detection.std_dev,
            },
        }
    }
}
