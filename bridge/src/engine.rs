//! Cross-chain consensus engine
//!
//! Runs one vote process per cross-chain message. A process completes
//! exactly once: on quorum, when quorum becomes impossible, on its deadline
//! or when force-failed. Completed results move to a bounded history and
//! late votes are rejected, never queued.

use crate::detector::ByzantineDetector;
use crate::envelope::{BridgeMessage, BridgeMessageType};
use crate::process::{Completion, ConsensusProcess, ConsensusResult, Evaluation, ProcessConfig};
use crate::vote::ConsensusVote;
use concordia_core::{
    BridgeConfig, ChainId, ConcordiaError, ConcordiaResult, ConsensusMode, MessageId, ProcessId,
};
use concordia_crypto::keys::KeyRegistry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Events emitted by the bridge engine
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    ProcessStarted(ProcessId, MessageId),
    VoteAccepted(ProcessId, ChainId),
    ProcessCompleted(ConsensusResult),
}

/// Status of a process as seen by callers
#[derive(Debug, Clone)]
pub enum ProcessStatus {
    Pending { votes: usize, participants: usize },
    Complete(ConsensusResult),
}

/// Engine counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct BridgeStats {
    pub started: u64,
    pub completed: u64,
    pub achieved: u64,
    pub no_quorum: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub byzantine_suspect: u64,
    pub late_votes: u64,
    total_execution_ms: u64,
}

impl BridgeStats {
    pub fn average_execution_ms(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.total_execution_ms as f64 / self.completed as f64
        }
    }
}

/// Completed results, oldest evicted first
struct ResultHistory {
    results: HashMap<ProcessId, ConsensusResult>,
    order: VecDeque<ProcessId>,
    limit: usize,
}

impl ResultHistory {
    fn new(limit: usize) -> Self {
        Self {
            results: HashMap::new(),
            order: VecDeque::new(),
            limit: limit.max(1),
        }
    }
    
    /// Store a result, returning any evicted ones
    fn push(&mut self, result: ConsensusResult) -> Vec<ConsensusResult> {
        self.order.push_back(result.process_id);
        self.results.insert(result.process_id, result);
        let mut evicted = Vec::new();
        while self.order.len() > self.limit {
            if let Some(old) = self.order.pop_front().and_then(|id| self.results.remove(&id)) {
                evicted.push(old);
            }
        }
        evicted
    }
    
    fn get(&self, id: &ProcessId) -> Option<&ConsensusResult> {
        self.results.get(id)
    }
    
    fn recent(&self, limit: usize) -> Vec<ConsensusResult> {
        self.order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| self.results.get(id).cloned())
            .collect()
    }
}

/// Bridge-level voting engine
pub struct CrossChainConsensusEngine {
    config: BridgeConfig,
    detector: ByzantineDetector,
    active: DashMap<ProcessId, ConsensusProcess>,
    by_message: DashMap<MessageId, ProcessId>,
    history: RwLock<ResultHistory>,
    stats: RwLock<BridgeStats>,
    shutting_down: AtomicBool,
    event_tx: Option<mpsc::Sender<BridgeEvent>>,
}

impl CrossChainConsensusEngine {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            detector: ByzantineDetector::new(config.detector),
            history: RwLock::new(ResultHistory::new(config.max_history)),
            config,
            active: DashMap::new(),
            by_message: DashMap::new(),
            stats: RwLock::new(BridgeStats::default()),
            shutting_down: AtomicBool::new(false),
            event_tx: None,
        }
    }
    
    /// Set event channel
    pub fn set_event_channel(&mut self, tx: mpsc::Sender<BridgeEvent>) {
        self.event_tx = Some(tx);
    }
    
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
    
    /// Open a process for `message_id`. The participant set is fixed here.
    pub fn initialize(
        &self,
        message_id: MessageId,
        participants: Vec<ChainId>,
        config: ProcessConfig,
    ) -> ConcordiaResult<ProcessId> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ConcordiaError::ShuttingDown);
        }
        let mode = config.mode;
        let distinct: HashSet<&ChainId> = participants.iter().collect();
        if distinct.len() != participants.len() {
            return Err(ConcordiaError::Validation(format!("duplicate participants for {}", message_id)));
        }
        if participants.len() < mode.min_participants() {
            return Err(ConcordiaError::InsufficientParticipants {
                mode,
                required: mode.min_participants(),
                available: participants.len(),
            });
        }
        if let Some((chain, w)) = config.chain_weights.iter().find(|(_, w)| !(w.is_finite() && **w > 0.0)) {
            return Err(ConcordiaError::Validation(format!("weight {} of {} must be positive", w, chain)));
        }
        
        let threshold = match mode {
            ConsensusMode::Weighted => config.threshold.unwrap_or(self.config.weighted_threshold),
            ConsensusMode::Bft => self.config.bft_threshold,
            ConsensusMode::SimpleMajority => 0.5,
        };
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConcordiaError::Validation(format!("threshold {} outside (0, 1]", threshold)));
        }
        let in_flight = self
            .by_message
            .get(&message_id)
            .map_or(false, |pid| self.active.contains_key(&*pid));
        if in_flight {
            return Err(ConcordiaError::Validation(format!("{} already has an active process", message_id)));
        }
        
        let timeout = config
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.timeout_ms));
        let process = ConsensusProcess::new(
            message_id.clone(),
            mode,
            participants,
            config.chain_weights,
            threshold,
            timeout,
        );
        let id = process.id;
        info!(
            "Consensus process {} started for {} ({}, {} participants, threshold {:.2})",
            id,
            message_id,
            mode,
            process.participants.len(),
            threshold
        );
        self.active.insert(id, process);
        self.by_message.insert(message_id.clone(), id);
        self.stats.write().started += 1;
        self.emit_event(BridgeEvent::ProcessStarted(id, message_id));
        
        Ok(id)
    }
    
    /// Record a vote. Returns `Ok(false)` when the vote arrives after
    /// completion or repeats an earlier vote.
    pub fn submit_vote(&self, process_id: &ProcessId, vote: ConsensusVote) -> ConcordiaResult<bool> {
        vote.validate()?;
        
        let (accepted, completion) = {
            let Some(mut process) = self.active.get_mut(process_id) else {
                if self.history.read().get(process_id).is_some() {
                    self.stats.write().late_votes += 1;
                    warn!("Rejected late vote from {} on completed process {}", vote.voter, process_id);
                    return Ok(false);
                }
                return Err(ConcordiaError::ProcessNotFound(process_id.to_string()));
            };
            
            if !process.is_participant(&vote.voter) {
                return Err(ConcordiaError::Validation(format!(
                    "{} is not a participant of {}",
                    vote.voter, process_id
                )));
            }
            if process.is_expired(Instant::now()) {
                warn!("Vote from {} arrived after the deadline of {}", vote.voter, process_id);
                (false, Some((Evaluation::Pending, Completion::Timeout)))
            } else if process.has_voted(&vote.voter) {
                debug!("Duplicate vote from {} on {}", vote.voter, process_id);
                return Ok(false);
            } else {
                let voter = vote.voter.clone();
                debug!(
                    "Vote received for process {}: {} from {} (confidence {:.2})",
                    process_id, vote.value, voter, vote.confidence
                );
                process.votes.insert(voter.clone(), vote);
                self.emit_event(BridgeEvent::VoteAccepted(*process_id, voter));
                
                match process.evaluate() {
                    Evaluation::Pending => (true, None),
                    e @ Evaluation::Achieved { .. } => (true, Some((e, Completion::Quorum))),
                    e @ Evaluation::Impossible => (true, Some((e, Completion::NoQuorum))),
                }
            }
        };
        
        if let Some((evaluation, completion)) = completion {
            self.finish(process_id, evaluation, completion);
        }
        Ok(accepted)
    }
    
    /// Accept a signed vote envelope from the wire
    pub fn handle_envelope(&self, envelope: &BridgeMessage, keys: &KeyRegistry) -> ConcordiaResult<bool> {
        if envelope.message_type != BridgeMessageType::ConsensusVote {
            return Err(ConcordiaError::Validation(format!(
                "expected consensus_vote, got {}",
                envelope.message_type
            )));
        }
        envelope.verify(keys)?;
        
        let vote: ConsensusVote = envelope.decode_payload()?;
        if vote.voter != envelope.sender_id {
            return Err(ConcordiaError::Validation(format!(
                "vote of {} sent by {}",
                vote.voter, envelope.sender_id
            )));
        }
        let process_id = self
            .process_for_message(&envelope.message_id)
            .ok_or_else(|| ConcordiaError::ProcessNotFound(envelope.message_id.to_string()))?;
        self.submit_vote(&process_id, vote)
    }
    
    pub fn check_status(&self, process_id: &ProcessId) -> ConcordiaResult<ProcessStatus> {
        if let Some(result) = self.history.read().get(process_id) {
            return Ok(ProcessStatus::Complete(result.clone()));
        }
        match self.active.get(process_id) {
            Some(p) if !p.is_expired(Instant::now()) => {
                return Ok(ProcessStatus::Pending {
                    votes: p.votes.len(),
                    participants: p.participants.len(),
                });
            }
            Some(_) => {}
            // Completed between the two lookups
            None => {
                return self
                    .history
                    .read()
                    .get(process_id)
                    .map(|result| ProcessStatus::Complete(result.clone()))
                    .ok_or_else(|| ConcordiaError::ProcessNotFound(process_id.to_string()));
            }
        }
        
        self.force_complete(process_id, Completion::Timeout)
            .map(ProcessStatus::Complete)
    }
    
    /// Result of a completed process
    pub fn finalize(&self, process_id: &ProcessId) -> ConcordiaResult<ConsensusResult> {
        match self.check_status(process_id)? {
            ProcessStatus::Complete(result) => Ok(result),
            ProcessStatus::Pending { .. } => Err(ConcordiaError::ProcessNotComplete(process_id.to_string())),
        }
    }
    
    /// Force-complete a process on an internal error. A process already
    /// complete keeps its result.
    pub fn fail(&self, process_id: &ProcessId, reason: &str) -> ConcordiaResult<ConsensusResult> {
        if let Some(result) = self.history.read().get(process_id) {
            return Ok(result.clone());
        }
        warn!("Failing consensus process {}: {}", process_id, reason);
        self.force_complete(process_id, Completion::Failed(reason.to_string()))
    }
    
    fn force_complete(&self, process_id: &ProcessId, completion: Completion) -> ConcordiaResult<ConsensusResult> {
        self.finish(process_id, Evaluation::Pending, completion)
            .or_else(|| self.history.read().get(process_id).cloned())
            .ok_or_else(|| ConcordiaError::ProcessNotFound(process_id.to_string()))
    }
    
    /// Time out every process past its deadline
    pub fn expire_stale(&self) -> Vec<ConsensusResult> {
        let now = Instant::now();
        let expired: Vec<ProcessId> = self
            .active
            .iter()
            .filter(|p| p.is_expired(now))
            .map(|p| *p.key())
            .collect();
        expired
            .iter()
            .filter_map(|id| self.finish(id, Evaluation::Pending, Completion::Timeout))
            .collect()
    }
    
    /// Reject new processes and fail every open one
    pub fn shutdown(&self) -> Vec<ConsensusResult> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let open: Vec<ProcessId> = self.active.iter().map(|p| *p.key()).collect();
        if !open.is_empty() {
            info!("Closing {} open consensus processes on shutdown", open.len());
        }
        open.iter()
            .filter_map(|id| self.finish(id, Evaluation::Pending, Completion::Failed("engine shutdown".into())))
            .collect()
    }
    
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
    
    pub fn process_for_message(&self, message_id: &MessageId) -> Option<ProcessId> {
        self.by_message.get(message_id).map(|p| *p)
    }
    
    pub fn is_active(&self, process_id: &ProcessId) -> bool {
        self.active.contains_key(process_id)
    }
    
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
    
    pub fn result(&self, process_id: &ProcessId) -> Option<ConsensusResult> {
        self.history.read().get(process_id).cloned()
    }
    
    /// Most recent results first
    pub fn recent_results(&self, limit: usize) -> Vec<ConsensusResult> {
        self.history.read().recent(limit)
    }
    
    pub fn stats(&self) -> BridgeStats {
        self.stats.read().clone()
    }
    
    /// Complete a process exactly once; `None` if another caller did first
    /// Complete a process exactly once. The result reaches history before
    /// the process leaves the active set, so readers always find one of them.
    fn finish(&self, process_id: &ProcessId, evaluation: Evaluation, completion: Completion) -> Option<ConsensusResult> {
        let Entry::Occupied(entry) = self.active.entry(*process_id) else {
            return None;
        };
        let process = entry.get().clone();
        
        let detection = self
            .detector
            .analyze(process.votes.values().map(|v| (&v.voter, v.confidence)));
        if detection.suspect {
            warn!(
                "Process {} flagged Byzantine-suspect: outliers {:?}",
                process_id, detection.outliers
            );
        }
        let result = process.into_result(evaluation, completion, detection);
        
        {
            let mut stats = self.stats.write();
            stats.completed += 1;
            stats.total_execution_ms += result.execution_time_ms;
            match result.metadata.completion {
                Completion::Quorum => stats.achieved += 1,
                Completion::NoQuorum => stats.no_quorum += 1,
                Completion::Timeout => stats.timed_out += 1,
                Completion::Failed(_) => stats.failed += 1,
            }
            if result.metadata.byzantine_suspect {
                stats.byzantine_suspect += 1;
            }
        }
        
        info!(
            "Consensus process {} complete: {:?}, achieved={}, value={:?}, confidence={:.3}, votes={}/{}",
            process_id,
            result.metadata.completion,
            result.achieved,
            result.final_value,
            result.confidence,
            result.total_votes,
            result.participants.len()
        );
        
        let evicted = self.history.write().push(result.clone());
        entry.remove();
        for old in evicted {
            self.by_message
                .remove_if(&old.message_id, |_, pid| *pid == old.process_id);
        }
        self.emit_event(BridgeEvent::ProcessCompleted(result.clone()));
        Some(result)
    }
    
    fn emit_event(&self, event: BridgeEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }
}

/// Shared bridge engine
pub type SharedBridgeEngine = Arc<CrossChainConsensusEngine>;

/// Create bridge event channel
pub fn create_bridge_channel() -> (mpsc::Sender<BridgeEvent>, mpsc::Receiver<BridgeEvent>) {
    mpsc::channel(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use concordia_crypto::keys::KeyPair;
    
    fn chains(ids: &[&str]) -> Vec<ChainId> {
        ids.iter().map(|s| ChainId::from(*s)).collect()
    }
    
    fn vote(voter: &str, value: &str, confidence: f64) -> ConsensusVote {
        ConsensusVote::new(ChainId::from(voter), value, confidence, 1.0)
    }
    
    #[test]
    fn test_bft_end_to_end_with_byzantine_dissenter() {
        let engine = CrossChainConsensusEngine::new(BridgeConfig::default());
        let pid = engine
            .initialize(MessageId::new("msg-1"), chains(&["A", "B", "C", "D"]), ProcessConfig::new(ConsensusMode::Bft))
            .unwrap();
        
        assert!(engine.submit_vote(&pid, vote("A", "VERIFIED", 0.9)).unwrap());
        assert!(engine.submit_vote(&pid, vote("B", "VERIFIED", 0.9)).unwrap());
        assert!(engine.submit_vote(&pid, vote("C", "VERIFIED", 0.9)).unwrap());
        // Quorum was reached with three votes; D is late
        assert!(!engine.submit_vote(&pid, vote("D", "REJECTED", 0.1)).unwrap());
        
        let result = engine.finalize(&pid).unwrap();
        assert!(result.achieved);
        assert_eq!(result.final_value.as_deref(), Some("VERIFIED"));
        assert!((result.confidence - 0.9 * 0.75).abs() < 1e-9);
        assert_eq!(result.total_votes, 3);
        assert_eq!(result.metadata.completion, Completion::Quorum);
        assert_eq!(engine.stats().late_votes, 1);
    }
    
    #[test]
    fn test_weighted_end_to_end_without_quorum() {
        let engine = CrossChainConsensusEngine::new(BridgeConfig::default());
        let config = ProcessConfig::new(ConsensusMode::Weighted)
            .with_weight(ChainId::from("A"), 2.0)
            .with_weight(ChainId::from("B"), 1.5)
            .with_weight(ChainId::from("C"), 1.0)
            .with_weight(ChainId::from("D"), 1.0);
        let pid = engine
            .initialize(MessageId::new("msg-2"), chains(&["A", "B", "C", "D"]), config)
            .unwrap();
        
        for (voter, value) in [("A", "X"), ("B", "X"), ("C", "Y"), ("D", "Y")] {
            assert!(engine.submit_vote(&pid, vote(voter, value, 0.8)).unwrap());
        }
        
        let result = engine.finalize(&pid).unwrap();
        assert!(!result.achieved);
        assert_eq!(result.final_value, None);
        assert_eq!(result.total_votes, 4);
        assert_eq!(result.metadata.completion, Completion::NoQuorum);
        assert_eq!(engine.stats().no_quorum, 1);
    }
    
    #[test]
    fn test_minimum_participants_per_mode() {
        let engine = CrossChainConsensusEngine::new(BridgeConfig::default());
        let cases = [
            (ConsensusMode::Bft, 3),
            (ConsensusMode::SimpleMajority, 2),
            (ConsensusMode::Weighted, 1),
        ];
        for (mode, available) in cases {
            let ids: Vec<ChainId> = (0..available).map(|i| ChainId::new(format!("c{}", i))).collect();
            let err = engine
                .initialize(MessageId::random(), ids, ProcessConfig::new(mode))
                .unwrap_err();
            assert!(matches!(
                err,
                ConcordiaError::InsufficientParticipants { required, .. } if required == available + 1
            ));
        }
        assert_eq!(engine.active_count(), 0);
    }
    
    #[test]
    fn test_invalid_votes_rejected() {
        let engine = CrossChainConsensusEngine::new(BridgeConfig::default());
        let pid = engine
            .initialize(MessageId::new("msg-3"), chains(&["A", "B", "C"]), ProcessConfig::new(ConsensusMode::SimpleMajority))
            .unwrap();
        
        assert!(matches!(
            engine.submit_vote(&pid, vote("Z", "X", 0.5)),
            Err(ConcordiaError::Validation(_))
        ));
        assert!(matches!(
            engine.submit_vote(&pid, vote("A", "X", 1.5)),
            Err(ConcordiaError::Validation(_))
        ));
        assert!(engine.submit_vote(&pid, vote("A", "X", 0.5)).unwrap());
        assert!(!engine.submit_vote(&pid, vote("A", "Y", 0.5)).unwrap());
        assert!(matches!(
            engine.submit_vote(&ProcessId::new(), vote("A", "X", 0.5)),
            Err(ConcordiaError::ProcessNotFound(_))
        ));
    }
    
    #[test]
    fn test_late_vote_never_changes_result() {
        let engine = CrossChainConsensusEngine::new(BridgeConfig::default());
        let pid = engine
            .initialize(MessageId::new("msg-4"), chains(&["A", "B", "C"]), ProcessConfig::new(ConsensusMode::SimpleMajority))
            .unwrap();
        engine.submit_vote(&pid, vote("A", "X", 0.7)).unwrap();
        engine.submit_vote(&pid, vote("B", "X", 0.7)).unwrap();
        let before = engine.finalize(&pid).unwrap();
        
        assert!(!engine.submit_vote(&pid, vote("C", "Y", 1.0)).unwrap());
        let after = engine.finalize(&pid).unwrap();
        assert_eq!(before.final_value, after.final_value);
        assert_eq!(after.total_votes, 2);
    }
    
    #[test]
    fn test_status_never_lost_while_completing() {
        let engine = CrossChainConsensusEngine::new(BridgeConfig::default());
        for round in 0..50 {
            let pid = engine
                .initialize(
                    MessageId::new(format!("msg-race-{}", round)),
                    chains(&["A", "B", "C"]),
                    ProcessConfig::new(ConsensusMode::SimpleMajority),
                )
                .unwrap();
            engine.submit_vote(&pid, vote("A", "X", 0.9)).unwrap();
            
            let done = AtomicBool::new(false);
            std::thread::scope(|s| {
                s.spawn(|| {
                    while !done.load(Ordering::SeqCst) {
                        assert!(engine.check_status(&pid).is_ok());
                    }
                });
                engine.submit_vote(&pid, vote("B", "X", 0.9)).unwrap();
                done.store(true, Ordering::SeqCst);
            });
            assert!(matches!(engine.check_status(&pid), Ok(ProcessStatus::Complete(_))));
        }
        assert_eq!(engine.stats().achieved, 50);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_deadline_forces_timeout_result() {
        let engine = CrossChainConsensusEngine::new(BridgeConfig::default());
        let config = ProcessConfig::new(ConsensusMode::Bft).with_timeout(Duration::from_secs(5));
        let pid = engine
            .initialize(MessageId::new("msg-5"), chains(&["A", "B", "C", "D"]), config)
            .unwrap();
        engine.submit_vote(&pid, vote("A", "VERIFIED", 0.9)).unwrap();
        engine.submit_vote(&pid, vote("B", "VERIFIED", 0.9)).unwrap();
        
        assert!(matches!(engine.finalize(&pid), Err(ConcordiaError::ProcessNotComplete(_))));
        
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!engine.submit_vote(&pid, vote("C", "VERIFIED", 0.9)).unwrap());
        
        let result = engine.finalize(&pid).unwrap();
        assert!(!result.achieved);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.total_votes, 2);
        assert_eq!(result.metadata.completion, Completion::Timeout);
        assert_eq!(engine.stats().timed_out, 1);
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_expire_stale_sweeps_only_expired() {
        let engine = CrossChainConsensusEngine::new(BridgeConfig::default());
        let short = ProcessConfig::new(ConsensusMode::Weighted).with_timeout(Duration::from_secs(1));
        let long = ProcessConfig::new(ConsensusMode::Weighted).with_timeout(Duration::from_secs(60));
        let a = engine.initialize(MessageId::new("short"), chains(&["A", "B"]), short).unwrap();
        let b = engine.initialize(MessageId::new("long"), chains(&["A", "B"]), long).unwrap();
        
        tokio::time::advance(Duration::from_secs(2)).await;
        let swept = engine.expire_stale();
        
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].process_id, a);
        assert!(engine.is_active(&b));
    }
    
    #[test]
    fn test_history_is_bounded() {
        let engine = CrossChainConsensusEngine::new(BridgeConfig {
            max_history: 2,
            ..Default::default()
        });
        let mut ids = Vec::new();
        for i in 0..3 {
            let pid = engine
                .initialize(MessageId::new(format!("m{}", i)), chains(&["A", "B"]), ProcessConfig::new(ConsensusMode::Weighted))
                .unwrap();
            engine.submit_vote(&pid, vote("A", "X", 0.9)).unwrap();
            engine.submit_vote(&pid, vote("B", "X", 0.9)).unwrap();
            ids.push(pid);
        }
        
        assert!(matches!(engine.check_status(&ids[0]), Err(ConcordiaError::ProcessNotFound(_))));
        assert!(engine.result(&ids[2]).unwrap().achieved);
        assert_eq!(engine.recent_results(10).len(), 2);
        assert!(engine.process_for_message(&MessageId::new("m0")).is_none());
    }
    
    #[test]
    fn test_signed_envelope_votes() {
        let engine = CrossChainConsensusEngine::new(BridgeConfig::default());
        let keys = KeyRegistry::new();
        let kp = KeyPair::generate();
        keys.register(ChainId::from("A"), kp.public_key());
        let message_id = MessageId::new("msg-6");
        let pid = engine
            .initialize(message_id.clone(), chains(&["A", "B"]), ProcessConfig::new(ConsensusMode::Weighted))
            .unwrap();
        
        let mut envelope = BridgeMessage::with_payload(
            message_id.clone(),
            BridgeMessageType::ConsensusVote,
            ChainId::from("A"),
            &vote("A", "X", 0.9),
        )
        .unwrap();
        assert!(matches!(engine.handle_envelope(&envelope, &keys), Err(ConcordiaError::InvalidSignature)));
        
        envelope.sign(&kp);
        assert!(engine.handle_envelope(&envelope, &keys).unwrap());
        assert!(matches!(engine.check_status(&pid).unwrap(), ProcessStatus::Pending { votes: 1, .. }));
        
        let mut spoofed = BridgeMessage::with_payload(
            message_id,
            BridgeMessageType::ConsensusVote,
            ChainId::from("A"),
            &vote("B", "X", 0.9),
        )
        .unwrap();
        spoofed.sign(&kp);
        assert!(matches!(engine.handle_envelope(&spoofed, &keys), Err(ConcordiaError::Validation(_))));
    }
    
    #[test]
    fn test_shutdown_fails_open_processes() {
        let engine = CrossChainConsensusEngine::new(BridgeConfig::default());
        let pid = engine
            .initialize(MessageId::new("msg-7"), chains(&["A", "B"]), ProcessConfig::new(ConsensusMode::Weighted))
            .unwrap();
        engine.submit_vote(&pid, vote("A", "X", 0.9)).unwrap();
        
        let closed = engine.shutdown();
        assert_eq!(closed.len(), 1);
        assert!(!closed[0].achieved);
        assert_eq!(closed[0].total_votes, 1);
        assert!(matches!(closed[0].metadata.completion, Completion::Failed(_)));
        assert!(matches!(
            engine.initialize(MessageId::new("msg-8"), chains(&["A", "B"]), ProcessConfig::new(ConsensusMode::Weighted)),
            Err(ConcordiaError::ShuttingDown)
        ));
    }
    
    #[tokio::test]
    async fn test_events_emitted() {
        let mut engine = CrossChainConsensusEngine::new(BridgeConfig::default());
        let (tx, mut rx) = create_bridge_channel();
        engine.set_event_channel(tx);
        
        let pid = engine
            .initialize(MessageId::new("msg-9"), chains(&["A", "B"]), ProcessConfig::new(ConsensusMode::Weighted))
            .unwrap();
        engine.submit_vote(&pid, vote("A", "X", 0.9)).unwrap();
        engine.submit_vote(&pid, vote("B", "X", 0.9)).unwrap();
        
        assert!(matches!(rx.recv().await, Some(BridgeEvent::ProcessStarted(id, _)) if id == pid));
        assert!(matches!(rx.recv().await, Some(BridgeEvent::VoteAccepted(_, _))));
        assert!(matches!(rx.recv().await, Some(BridgeEvent::VoteAccepted(_, _))));
        match rx.recv().await {
            Some(BridgeEvent::ProcessCompleted(result)) => assert!(result.achieved),
            other => panic!("unexpected {:?}", other),
        }
    }
}
