//! Multi-chain consensus engine
//!
//! Each request moves INIT → VERIFY → VOTE → AGGREGATE → FINALIZE and ends
//! COMPLETED or FAILED. Adapter failures degrade only the failing chain;
//! a request fails once fewer than half its participants answered.

use crate::request::{AdvancedDecision, ConsensusOutcome, OrchestratorMetrics, RequestPhase, VerificationRequest};
use concordia_bridge::{ByzantineDetector, ConsensusResult, ConsensusVote, ProcessConfig, ProcessStatus, SharedBridgeEngine};
use concordia_consensus::{quorum_size, select_optimal, LocalCluster};
use concordia_core::{
    ChainAdapter, ChainId, ChainVerificationResult, ConcordiaError, ConcordiaResult, EngineConfig, MessageId,
    OrchestratorConfig, ProcessId, SharedAdapterRegistry, Timestamp, VerificationStatus, VoteData,
};
use concordia_crypto::hashing::hash_multiple;
use concordia_crypto::threshold::{combine_partials, generate_shares, partial_sign, verify_threshold_signature};
use concordia_monitor::BridgeHealthMonitor;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Events emitted by the orchestrator
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    PhaseChanged(String, RequestPhase),
    Completed(ConsensusOutcome),
}

struct Participant {
    chain: ChainId,
    adapter: Arc<dyn ChainAdapter>,
    weight: f64,
}

/// Working state of one request
struct RequestState {
    phase: RequestPhase,
    participants: Vec<Participant>,
    results: Vec<ChainVerificationResult>,
    vote_references: BTreeMap<ChainId, String>,
    bridge_result: Option<ConsensusResult>,
    advanced: Option<AdvancedDecision>,
    errors: Vec<String>,
}

impl RequestState {
    fn new(participants: Vec<Participant>) -> Self {
        Self {
            phase: RequestPhase::Init,
            participants,
            results: Vec::new(),
            vote_references: BTreeMap::new(),
            bridge_result: None,
            advanced: None,
            errors: Vec::new(),
        }
    }
    
    /// Participants paired with their successful verification result
    fn voters(&self) -> Vec<(&Participant, &ChainVerificationResult)> {
        self.participants
            .iter()
            .zip(&self.results)
            .filter(|(_, r)| r.is_success())
            .collect()
    }
}

struct Aggregate {
    status: VerificationStatus,
    score: f64,
    confidence: f64,
    suspect: bool,
    outliers: Vec<ChainId>,
}

pub struct MultiChainConsensusEngine {
    config: OrchestratorConfig,
    engine_config: EngineConfig,
    adapters: SharedAdapterRegistry,
    bridge: SharedBridgeEngine,
    cluster: LocalCluster,
    detector: ByzantineDetector,
    monitor: Option<Arc<BridgeHealthMonitor>>,
    in_flight: DashMap<String, RequestPhase>,
    history: RwLock<VecDeque<ConsensusOutcome>>,
    metrics: RwLock<OrchestratorMetrics>,
    shutting_down: AtomicBool,
    idle: Notify,
    event_tx: Option<mpsc::Sender<OrchestratorEvent>>,
}

impl MultiChainConsensusEngine {
    pub fn new(
        config: OrchestratorConfig,
        engine_config: EngineConfig,
        adapters: SharedAdapterRegistry,
        bridge: SharedBridgeEngine,
    ) -> Self {
        Self {
            detector: ByzantineDetector::new(bridge.config().detector),
            cluster: LocalCluster::new(engine_config.clone()),
            config,
            engine_config,
            adapters,
            bridge,
            monitor: None,
            in_flight: DashMap::new(),
            history: RwLock::new(VecDeque::new()),
            metrics: RwLock::new(OrchestratorMetrics::default()),
            shutting_down: AtomicBool::new(false),
            idle: Notify::new(),
            event_tx: None,
        }
    }
    
    /// Report chain health hints and Byzantine anomalies to `monitor`
    pub fn with_monitor(mut self, monitor: Arc<BridgeHealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }
    
    pub fn set_event_channel(&mut self, tx: mpsc::Sender<OrchestratorEvent>) {
        self.event_tx = Some(tx);
    }
    
    pub fn bridge(&self) -> &SharedBridgeEngine {
        &self.bridge
    }
    
    /// Run a request to its terminal outcome.
    ///
    /// Fails only before any state exists: on shutdown, a duplicate request
    /// id or too few healthy participants. Later failures yield a FAILED
    /// outcome.
    pub async fn process(&self, request: VerificationRequest) -> ConcordiaResult<ConsensusOutcome> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ConcordiaError::ShuttingDown);
        }
        match self.in_flight.entry(request.request_id.clone()) {
            Entry::Occupied(_) => {
                return Err(ConcordiaError::Validation(format!(
                    "request {} is already in flight",
                    request.request_id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(RequestPhase::Init);
            }
        }
        
        let started = Instant::now();
        let participants = match self.select_participants(&request).await {
            Ok(p) => p,
            Err(e) => {
                self.release(&request.request_id);
                return Err(e);
            }
        };
        info!(
            "Request {} started with {} participants",
            request.request_id,
            participants.len()
        );
        
        let mut state = RequestState::new(participants);
        let result = self.run_phases(&request, &mut state).await;
        let outcome = match result {
            Ok(aggregate) => {
                self.set_phase(&request.request_id, &mut state, RequestPhase::Completed);
                self.build_outcome(&request, state, aggregate, None, started)
            }
            Err(e) => {
                let failed_phase = state.phase;
                warn!("Request {} failed in {}: {}", request.request_id, failed_phase, e);
                state.errors.push(e.to_string());
                self.set_phase(&request.request_id, &mut state, RequestPhase::Failed);
                let aggregate = Aggregate {
                    status: VerificationStatus::Failed,
                    score: 0.0,
                    confidence: 0.0,
                    suspect: false,
                    outliers: Vec::new(),
                };
                self.build_outcome(&request, state, aggregate, Some(failed_phase), started)
            }
        };
        
        info!(
            "Request {} finished: {} (score {:.3}, confidence {:.3}, {}ms)",
            outcome.request_id, outcome.status, outcome.score, outcome.confidence, outcome.execution_time_ms
        );
        self.metrics.write().record(&outcome);
        {
            let mut history = self.history.write();
            history.push_back(outcome.clone());
            while history.len() > self.config.max_history.max(1) {
                history.pop_front();
            }
        }
        self.emit_event(OrchestratorEvent::Completed(outcome.clone()));
        self.release(&request.request_id);
        Ok(outcome)
    }
    
    async fn run_phases(&self, request: &VerificationRequest, state: &mut RequestState) -> ConcordiaResult<Aggregate> {
        self.set_phase(&request.request_id, state, RequestPhase::Verify);
        state.results = self.verify(request, &state.participants).await;
        let answered = state.results.iter().filter(|r| r.is_success()).count();
        for failed in state.results.iter().filter(|r| !r.is_success()) {
            state.errors.push(format!("{}: verification failed", failed.chain));
        }
        if answered * 2 < state.participants.len() {
            return Err(ConcordiaError::InsufficientParticipants {
                mode: self.config.voting_mode,
                required: (state.participants.len() + 1) / 2,
                available: answered,
            });
        }
        
        self.set_phase(&request.request_id, state, RequestPhase::Vote);
        if self.config.advanced_mode {
            self.vote_advanced(request, state).await?;
        } else {
            self.vote_bridge(request, state).await?;
        }
        
        self.set_phase(&request.request_id, state, RequestPhase::Aggregate);
        let aggregate = self.aggregate(request, state);
        
        self.set_phase(&request.request_id, state, RequestPhase::Finalize);
        Ok(aggregate)
    }
    
    /// INIT: requested chains that have an adapter and pass a health probe
    async fn select_participants(&self, request: &VerificationRequest) -> ConcordiaResult<Vec<Participant>> {
        let requested: Vec<ChainId> = if request.chains.is_empty() {
            self.adapters.chains()
        } else {
            request.chains.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
        };
        let probe_timeout = Duration::from_millis(self.config.verification_timeout_ms);
        
        let probes = requested.into_iter().map(|chain| async move {
            let adapter = self.adapters.get(&chain)?;
            let healthy = adapter.is_connected() && timeout(probe_timeout, adapter.is_healthy()).await.unwrap_or(false);
            let marked_down = self.monitor.as_ref().map_or(false, |m| m.is_chain_down(&chain));
            if !healthy || marked_down {
                debug!("Excluding {} from request {}", chain, request.request_id);
                return None;
            }
            Some(Participant {
                weight: adapter.consensus_weight(),
                chain,
                adapter,
            })
        });
        let participants: Vec<Participant> = join_all(probes).await.into_iter().flatten().collect();
        
        let required = self.config.min_participants.max(1);
        if participants.len() < required {
            return Err(ConcordiaError::InsufficientParticipants {
                mode: self.config.voting_mode,
                required,
                available: participants.len(),
            });
        }
        Ok(participants)
    }
    
    /// VERIFY: concurrent fan-out under one shared deadline
    async fn verify(&self, request: &VerificationRequest, participants: &[Participant]) -> Vec<ChainVerificationResult> {
        let deadline = Instant::now() + Duration::from_millis(self.config.verification_timeout_ms);
        let calls = participants.iter().map(|p| async move {
            match timeout_at(deadline, p.adapter.verify(&request.agent_id, &request.data)).await {
                Ok(Ok(mut result)) => {
                    if !(result.confidence.is_finite() && (0.0..=1.0).contains(&result.confidence)) {
                        warn!("{} reported confidence {} for {}", p.chain, result.confidence, request.request_id);
                        return ChainVerificationResult::failed(p.chain.clone(), "confidence out of range");
                    }
                    result.chain = p.chain.clone();
                    debug!("{} verified {}: {}", p.chain, request.request_id, result.status);
                    result
                }
                Ok(Err(e)) => {
                    warn!("Adapter {} failed to verify {}: {}", p.chain, request.request_id, e);
                    ChainVerificationResult::failed(p.chain.clone(), &e.to_string())
                }
                Err(_) => {
                    warn!("Adapter {} missed the verification deadline of {}", p.chain, request.request_id);
                    ChainVerificationResult::failed(p.chain.clone(), "verification timed out")
                }
            }
        });
        join_all(calls).await
    }
    
    /// Record one chain's vote on its own chain. A failure degrades that
    /// chain's vote only.
    async fn submit_chain_vote(
        &self,
        process_id: &ProcessId,
        participant: &Participant,
        vote: &VoteData,
        state_refs: &mut BTreeMap<ChainId, String>,
        errors: &mut Vec<String>,
    ) -> bool {
        match participant.adapter.submit_vote(process_id, vote).await {
            Ok(reference) => {
                state_refs.insert(participant.chain.clone(), reference);
                true
            }
            Err(e) => {
                warn!("Vote submission on {} failed: {}", participant.chain, e);
                errors.push(format!("{}: {}", participant.chain, e));
                false
            }
        }
    }
    
    /// VOTE through the bridge vote engine
    async fn vote_bridge(&self, request: &VerificationRequest, state: &mut RequestState) -> ConcordiaResult<()> {
        let threshold = request.threshold.unwrap_or(self.config.consensus_threshold);
        let voters: Vec<(ChainId, VoteData)> = state
            .voters()
            .into_iter()
            .map(|(p, r)| (p.chain.clone(), chain_vote(p, r)))
            .collect();
        
        let mut process_config = ProcessConfig::new(self.config.voting_mode).with_threshold(threshold);
        for p in &state.participants {
            process_config = process_config.with_weight(p.chain.clone(), p.weight);
        }
        let process_id = self.bridge.initialize(
            MessageId::new(request.request_id.clone()),
            voters.iter().map(|(c, _)| c.clone()).collect(),
            process_config,
        )?;
        
        let mut references = BTreeMap::new();
        let mut errors = Vec::new();
        for (chain, vote) in voters {
            let Some(participant) = state.participants.iter().find(|p| p.chain == chain) else {
                continue;
            };
            if !self
                .submit_chain_vote(&process_id, participant, &vote, &mut references, &mut errors)
                .await
            {
                continue;
            }
            if let Err(e) = self.bridge.submit_vote(&process_id, ConsensusVote::from(vote)) {
                warn!("Bridge rejected the vote of {}: {}", chain, e);
                errors.push(format!("{}: {}", chain, e));
            }
        }
        state.vote_references = references;
        state.errors.extend(errors);
        
        let result = match self.bridge.check_status(&process_id)? {
            ProcessStatus::Complete(result) => result,
            ProcessStatus::Pending { votes, participants } => self.bridge.fail(
                &process_id,
                &format!("only {} of {} votes could be submitted", votes, participants),
            )?,
        };
        debug!(
            "Bridge process {} for {}: achieved={}, value={:?}",
            process_id, request.request_id, result.achieved, result.final_value
        );
        state.bridge_result = Some(result);
        Ok(())
    }
    
    /// VOTE through the algorithm cluster, optionally sealing the decision
    /// with a threshold signature
    async fn vote_advanced(&self, request: &VerificationRequest, state: &mut RequestState) -> ConcordiaResult<()> {
        let voters: Vec<(ChainId, VoteData)> = state
            .voters()
            .into_iter()
            .map(|(p, r)| (p.chain.clone(), chain_vote(p, r)))
            .collect();
        for p in &state.participants {
            if !self.cluster.contains(&p.chain) {
                self.cluster.add_node(p.chain.clone())?;
            }
            self.cluster.set_weight(p.chain.clone(), p.weight)?;
        }
        
        let kind = self.config.algorithm.unwrap_or_else(|| {
            select_optimal(
                voters.len(),
                Duration::from_millis(self.engine_config.latency_budget_ms),
                self.engine_config.assumed_byzantine_fraction,
            )
        });
        let inputs: Vec<(ChainId, Vec<u8>)> = voters
            .iter()
            .map(|(c, v)| (c.clone(), v.value.as_bytes().to_vec()))
            .collect();
        let run = self.cluster.run(&request.request_id, &inputs, kind)?;
        if run.decisions.is_empty() {
            // Undecided rounds are recorded; AGGREGATE still scores the votes
            let timeout = ConcordiaError::ConsensusTimeout(format!(
                "no replica decided {} after {} view changes",
                request.request_id, run.view_changes
            ));
            warn!("{}", timeout);
            state.errors.push(timeout.to_string());
        }
        
        let mut decision = AdvancedDecision {
            algorithm: kind.default_name().to_string(),
            decided_value: run.agreed_value().map(|v| String::from_utf8_lossy(v).into_owned()),
            deciders: run.decisions.len(),
            undecided: run.undecided.len(),
            messages_delivered: run.messages_delivered,
            view_changes: run.view_changes,
            threshold_signature: None,
            group_key: None,
        };
        if self.config.threshold_signatures {
            if let Some(value) = &decision.decided_value {
                let signers: Vec<ChainId> = inputs.iter().map(|(c, _)| c.clone()).collect();
                match seal_decision(&request.request_id, value, &signers, &run.decisions) {
                    Ok((signature, group_key)) => {
                        decision.threshold_signature = Some(signature);
                        decision.group_key = Some(group_key);
                    }
                    Err(e) => {
                        warn!("Could not seal decision of {}: {}", request.request_id, e);
                        state.errors.push(e.to_string());
                    }
                }
            }
        }
        
        let process_id = ProcessId::new();
        let mut references = BTreeMap::new();
        let mut errors = Vec::new();
        for (chain, vote) in &voters {
            if let Some(participant) = state.participants.iter().find(|p| &p.chain == chain) {
                self.submit_chain_vote(&process_id, participant, vote, &mut references, &mut errors)
                    .await;
            }
        }
        state.vote_references = references;
        state.errors.extend(errors);
        state.advanced = Some(decision);
        Ok(())
    }
    
    /// AGGREGATE: weighted score, confidence and the advisory outlier check
    fn aggregate(&self, request: &VerificationRequest, state: &RequestState) -> Aggregate {
        let total_weight: f64 = state.participants.iter().map(|p| p.weight).sum();
        let voters = state.voters();
        let verified_weight: f64 = voters
            .iter()
            .filter(|(_, r)| r.status == VerificationStatus::Verified)
            .map(|(p, _)| p.weight)
            .sum();
        let answered_weight: f64 = voters.iter().map(|(p, _)| p.weight).sum();
        
        let score = if total_weight > 0.0 { verified_weight / total_weight } else { 0.0 };
        let confidence = if answered_weight > 0.0 {
            voters.iter().map(|(p, r)| p.weight * r.confidence).sum::<f64>() / answered_weight
        } else {
            0.0
        };
        
        let threshold = request.threshold.unwrap_or(self.config.consensus_threshold);
        let status = if score >= threshold {
            VerificationStatus::Verified
        } else if score < self.config.rejection_threshold {
            VerificationStatus::Rejected
        } else {
            VerificationStatus::Pending
        };
        
        let detection = self.detector.analyze(voters.iter().map(|(p, r)| (&p.chain, r.confidence)));
        if detection.suspect {
            warn!(
                "Request {} looks Byzantine: outliers {:?}",
                request.request_id, detection.outliers
            );
            self.metrics.write().byzantine_detections += 1;
        }
        if let Some(monitor) = &self.monitor {
            monitor.report_byzantine_anomaly(&detection.outliers, &format!("request {}", request.request_id));
        }
        
        Aggregate {
            status,
            score,
            confidence,
            suspect: detection.suspect,
            outliers: detection.outliers,
        }
    }
    
    fn build_outcome(
        &self,
        request: &VerificationRequest,
        state: RequestState,
        aggregate: Aggregate,
        failed_phase: Option<RequestPhase>,
        started: Instant,
    ) -> ConsensusOutcome {
        ConsensusOutcome {
            request_id: request.request_id.clone(),
            status: aggregate.status,
            score: aggregate.score,
            confidence: aggregate.confidence,
            participants: state.participants.iter().map(|p| p.chain.clone()).collect(),
            chain_results: state.results,
            vote_references: state.vote_references,
            bridge_result: state.bridge_result,
            advanced: state.advanced,
            byzantine_suspect: aggregate.suspect,
            outliers: aggregate.outliers,
            errors: state.errors,
            failed_phase,
            execution_time_ms: started.elapsed().as_millis() as u64,
            timestamp: Timestamp::now(),
        }
    }
    
    fn set_phase(&self, request_id: &str, state: &mut RequestState, phase: RequestPhase) {
        debug!("Request {}: {} -> {}", request_id, state.phase, phase);
        state.phase = phase;
        if let Some(mut entry) = self.in_flight.get_mut(request_id) {
            *entry = phase;
        }
        self.emit_event(OrchestratorEvent::PhaseChanged(request_id.to_string(), phase));
    }
    
    fn release(&self, request_id: &str) {
        self.in_flight.remove(request_id);
        if self.in_flight.is_empty() {
            self.idle.notify_waiters();
        }
    }
    
    /// Current phase of an in-flight request
    pub fn request_phase(&self, request_id: &str) -> Option<RequestPhase> {
        self.in_flight.get(request_id).map(|p| *p)
    }
    
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
    
    pub fn outcome(&self, request_id: &str) -> Option<ConsensusOutcome> {
        self.history
            .read()
            .iter()
            .rev()
            .find(|o| o.request_id == request_id)
            .cloned()
    }
    
    /// Most recent outcomes first
    pub fn recent_outcomes(&self, limit: usize) -> Vec<ConsensusOutcome> {
        self.history.read().iter().rev().take(limit).cloned().collect()
    }
    
    pub fn metrics(&self) -> OrchestratorMetrics {
        self.metrics.read().clone()
    }
    
    /// Reject new requests, wait up to the drain timeout for in-flight ones
    /// and force-close whatever the bridge still holds. Returns the number
    /// of requests still in flight when the drain gave up.
    pub async fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_millis(self.config.drain_timeout_ms);
        info!("Draining {} in-flight requests", self.in_flight.len());
        
        loop {
            let idle = self.idle.notified();
            if self.in_flight.is_empty() {
                break;
            }
            if timeout_at(deadline, idle).await.is_err() {
                warn!("Drain timed out with {} requests in flight", self.in_flight.len());
                break;
            }
        }
        
        let abandoned = self.in_flight.len();
        let closed = self.bridge.shutdown();
        info!(
            "Orchestrator stopped ({} requests abandoned, {} bridge processes closed)",
            abandoned,
            closed.len()
        );
        abandoned
    }
    
    fn emit_event(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }
}

fn chain_vote(participant: &Participant, result: &ChainVerificationResult) -> VoteData {
    VoteData {
        chain: participant.chain.clone(),
        value: result.status.as_str().to_string(),
        confidence: result.confidence,
        weight: 1.0,
        timestamp: Timestamp::now(),
    }
}

/// Sign the decision with a fresh t-of-n key set, t being the consensus
/// quorum. Only replicas that decided `value` contribute a partial.
fn seal_decision(
    request_id: &str,
    value: &str,
    signers: &[ChainId],
    decisions: &BTreeMap<ChainId, Vec<u8>>,
) -> ConcordiaResult<(String, String)> {
    let n = signers.len();
    let threshold = quorum_size(n).min(n);
    let key_set = generate_shares(threshold, n)?;
    let message = hash_multiple(&[request_id.as_bytes(), value.as_bytes()]);
    
    let partials: Vec<_> = signers
        .iter()
        .enumerate()
        .filter(|(_, chain)| decisions.get(*chain).map_or(false, |v| v.as_slice() == value.as_bytes()))
        .filter_map(|(i, _)| key_set.share(i as u64 + 1))
        .map(|share| partial_sign(message.as_bytes(), share))
        .collect();
    let signature = combine_partials(&partials, threshold)?;
    if !verify_threshold_signature(&signature, message.as_bytes(), &key_set.group_key()) {
        return Err(ConcordiaError::InvalidSignature);
    }
    Ok((signature.to_hex(), key_set.group_key().to_hex()))
}

/// Shared orchestrator
pub type SharedOrchestrator = Arc<MultiChainConsensusEngine>;

/// Create orchestrator event channel
pub fn create_orchestrator_channel() -> (mpsc::Sender<OrchestratorEvent>, mpsc::Receiver<OrchestratorEvent>) {
    mpsc::channel(100)
}
