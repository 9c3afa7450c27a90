//! Algorithm-level consensus engine
//!
//! Owns every instance this replica takes part in, routes messages to the
//! registered algorithm and keeps rolling decision-latency statistics.

use crate::algorithm::{ConsensusAlgorithm, ConsensusInstance, InstanceContext};
use crate::message::ConsensusMessage;
use crate::state::ConsensusState;
use concordia_core::{AlgorithmKind, ChainId, ConcordiaError, ConcordiaResult, EngineConfig};
use concordia_crypto::keys::{KeyPair, KeyRegistry};
use concordia_crypto::signing::verify_if_registered;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Events emitted by the algorithm engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Instance started under an algorithm
    InstanceStarted(String, String),
    /// Instance decided a value after the given latency
    Decided(String, Vec<u8>, Duration),
    /// Instance closed; `true` if it had decided
    InstanceClosed(String, bool),
}

/// Rolling statistics of one algorithm
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlgorithmStats {
    pub started: u64,
    pub decided: u64,
    /// Closed without a decision
    pub expired: u64,
    #[serde(skip)]
    latencies: VecDeque<Duration>,
}

impl AlgorithmStats {
    fn record_latency(&mut self, elapsed: Duration, window: usize) {
        self.decided += 1;
        self.latencies.push_back(elapsed);
        while self.latencies.len() > window.max(1) {
            self.latencies.pop_front();
        }
    }
    
    /// Mean decision latency over the window
    pub fn average_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }
    
    pub fn samples(&self) -> usize {
        self.latencies.len()
    }
}

/// Pick an algorithm family for the given constraints.
///
/// Small groups with a tight latency budget get HotStuff; a high assumed
/// Byzantine fraction gets PBFT; everything else the weighted variant.
pub fn select_optimal(participant_count: usize, latency_budget: Duration, byzantine_fraction: f64) -> AlgorithmKind {
    if participant_count <= 10 && latency_budget < Duration::from_secs(1) {
        AlgorithmKind::HotStuff
    } else if byzantine_fraction >= 1.0 / 3.0 {
        AlgorithmKind::Pbft
    } else {
        AlgorithmKind::WeightedByzantine
    }
}

/// Consensus engine of one replica
pub struct AdvancedConsensusEngine {
    config: EngineConfig,
    local_id: ChainId,
    keypair: Option<KeyPair>,
    keys: Option<Arc<KeyRegistry>>,
    algorithms: RwLock<HashMap<String, Arc<dyn ConsensusAlgorithm>>>,
    instances: DashMap<String, ConsensusInstance>,
    stats: RwLock<HashMap<String, AlgorithmStats>>,
    event_tx: Option<mpsc::Sender<EngineEvent>>,
}

impl AdvancedConsensusEngine {
    pub fn new(config: EngineConfig, local_id: ChainId) -> Self {
        Self {
            config,
            local_id,
            keypair: None,
            keys: None,
            algorithms: RwLock::new(HashMap::new()),
            instances: DashMap::new(),
            stats: RwLock::new(HashMap::new()),
            event_tx: None,
        }
    }
    
    /// Sign outgoing messages and verify incoming ones from registered keys
    pub fn with_keys(mut self, keypair: KeyPair, registry: Arc<KeyRegistry>) -> Self {
        self.keypair = Some(keypair);
        self.keys = Some(registry);
        self
    }
    
    /// Set event channel
    pub fn set_event_channel(&mut self, tx: mpsc::Sender<EngineEvent>) {
        self.event_tx = Some(tx);
    }
    
    pub fn local_id(&self) -> &ChainId {
        &self.local_id
    }
    
    /// Register an algorithm under a name, replacing any previous one
    pub fn register(&self, name: impl Into<String>, algorithm: Arc<dyn ConsensusAlgorithm>) {
        let name = name.into();
        debug!("Registered algorithm {} ({})", name, algorithm.kind());
        self.algorithms.write().insert(name, algorithm);
    }
    
    pub fn algorithm(&self, name: &str) -> Option<Arc<dyn ConsensusAlgorithm>> {
        self.algorithms.read().get(name).cloned()
    }
    
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.algorithms.read().keys().cloned().collect();
        names.sort();
        names
    }
    
    /// Start an instance with this replica's input; returns the messages
    /// to broadcast
    pub fn start(
        &self,
        id: &str,
        value: Vec<u8>,
        participants: Vec<ChainId>,
        algorithm: &str,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let alg = self
            .algorithm(algorithm)
            .ok_or_else(|| ConcordiaError::AlgorithmNotFound(algorithm.to_string()))?;
        if self.instances.contains_key(id) {
            return Err(ConcordiaError::DuplicateInstance(id.to_string()));
        }
        let distinct: HashSet<&ChainId> = participants.iter().collect();
        if distinct.len() != participants.len() {
            return Err(ConcordiaError::Validation(format!("duplicate participants in {}", id)));
        }
        if !distinct.contains(&self.local_id) {
            return Err(ConcordiaError::Validation(format!(
                "{} is not a participant of {}",
                self.local_id, id
            )));
        }
        
        let mut ctx = InstanceContext::new(id, self.local_id.clone(), participants, self.keypair.clone());
        if let Some(keys) = &self.keys {
            ctx = ctx.with_keys(keys.clone());
        }
        let mut instance = ConsensusInstance::new(alg.as_ref(), algorithm, ctx);
        let out = alg.start(&mut instance, value)?;
        
        self.stats.write().entry(algorithm.to_string()).or_default().started += 1;
        info!(
            "Started instance {} with {} on {} ({} participants)",
            id,
            algorithm,
            self.local_id,
            instance.ctx.n()
        );
        self.emit_event(EngineEvent::InstanceStarted(id.to_string(), algorithm.to_string()));
        self.after_step(&mut instance);
        self.instances.insert(id.to_string(), instance);
        
        Ok(out)
    }
    
    /// Route a message to the instance's algorithm
    pub fn dispatch(&self, id: &str, message: &ConsensusMessage) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let mut instance = self
            .instances
            .get_mut(id)
            .ok_or_else(|| ConcordiaError::InstanceNotFound(id.to_string()))?;
        
        if message.sender == self.local_id {
            return Ok(Vec::new());
        }
        if !instance.ctx.is_participant(&message.sender) {
            return Err(ConcordiaError::Validation(format!(
                "{} is not a participant of {}",
                message.sender, id
            )));
        }
        if let Some(keys) = &self.keys {
            if let Err(e) = verify_if_registered(keys, &message.sender, &message.get_signing_message(), &message.signature) {
                warn!("Dropping {} from {} with bad signature", message.msg_type, message.sender);
                return Err(e);
            }
        }
        
        let alg = self
            .algorithm(&instance.algorithm)
            .ok_or_else(|| ConcordiaError::AlgorithmNotFound(instance.algorithm.clone()))?;
        let out = alg.handle(&mut instance, message)?;
        self.after_step(&mut instance);
        Ok(out)
    }
    
    /// Local timeout on an instance
    pub fn request_view_change(&self, id: &str) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let mut instance = self
            .instances
            .get_mut(id)
            .ok_or_else(|| ConcordiaError::InstanceNotFound(id.to_string()))?;
        let alg = self
            .algorithm(&instance.algorithm)
            .ok_or_else(|| ConcordiaError::AlgorithmNotFound(instance.algorithm.clone()))?;
        alg.view_change(&mut instance)
    }
    
    /// Remove an instance, returning its decided value if any
    pub fn close(&self, id: &str) -> ConcordiaResult<Option<Vec<u8>>> {
        let (_, mut instance) = self
            .instances
            .remove(id)
            .ok_or_else(|| ConcordiaError::InstanceNotFound(id.to_string()))?;
        if let Some(alg) = self.algorithm(&instance.algorithm) {
            alg.expire(&mut instance);
        }
        
        let decided = instance.is_decided();
        if !decided {
            self.stats.write().entry(instance.algorithm.clone()).or_default().expired += 1;
            info!("Instance {} closed on {} without decision", id, self.local_id);
        }
        self.emit_event(EngineEvent::InstanceClosed(id.to_string(), decided));
        Ok(instance.state.decided_value().map(<[u8]>::to_vec))
    }
    
    pub fn decision(&self, id: &str) -> Option<Vec<u8>> {
        self.instances
            .get(id)
            .and_then(|i| i.state.decided_value().map(<[u8]>::to_vec))
    }
    
    pub fn is_decided(&self, id: &str) -> bool {
        self.instances.get(id).map_or(false, |i| i.is_decided())
    }
    
    /// Snapshot of an instance's replica state
    pub fn state(&self, id: &str) -> Option<ConsensusState> {
        self.instances.get(id).map(|i| i.state.clone())
    }
    
    pub fn active_instances(&self) -> usize {
        self.instances.len()
    }
    
    /// Name of a registered algorithm suited to `participant_count`, using
    /// the configured latency budget and Byzantine fraction
    pub fn select_algorithm(&self, participant_count: usize) -> ConcordiaResult<String> {
        let kind = select_optimal(
            participant_count,
            Duration::from_millis(self.config.latency_budget_ms),
            self.config.assumed_byzantine_fraction,
        );
        self.algorithms
            .read()
            .iter()
            .filter(|(_, alg)| alg.kind() == kind)
            .map(|(name, _)| name.clone())
            .min()
            .ok_or_else(|| ConcordiaError::AlgorithmNotFound(kind.to_string()))
    }
    
    pub fn stats(&self, algorithm: &str) -> Option<AlgorithmStats> {
        self.stats.read().get(algorithm).cloned()
    }
    
    fn after_step(&self, instance: &mut ConsensusInstance) {
        if !instance.is_decided() || instance.decision_recorded {
            return;
        }
        instance.decision_recorded = true;
        let elapsed = instance.started_at.elapsed();
        self.stats
            .write()
            .entry(instance.algorithm.clone())
            .or_default()
            .record_latency(elapsed, self.config.stats_window);
        
        let value = instance.state.decided_value().map(<[u8]>::to_vec).unwrap_or_default();
        info!(
            "Instance {} decided on {} after {:?}",
            instance.id(),
            self.local_id,
            elapsed
        );
        self.emit_event(EngineEvent::Decided(instance.id().to_string(), value, elapsed));
    }
    
    fn emit_event(&self, event: EngineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }
}

/// Shared algorithm engine
pub type SharedEngine = Arc<AdvancedConsensusEngine>;

/// Create engine event channel
pub fn create_engine_channel() -> (mpsc::Sender<EngineEvent>, mpsc::Receiver<EngineEvent>) {
    mpsc::channel(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotstuff::HotStuffConsensus;
    use crate::message::MessageType;
    use crate::pbft::PbftConsensus;
    
    fn engine(local: &str) -> AdvancedConsensusEngine {
        let engine = AdvancedConsensusEngine::new(EngineConfig::default(), ChainId::from(local));
        engine.register("pbft", Arc::new(PbftConsensus::new()));
        engine.register("hotstuff", Arc::new(HotStuffConsensus::new()));
        engine
    }
    
    fn chains(ids: &[&str]) -> Vec<ChainId> {
        ids.iter().map(|s| ChainId::from(*s)).collect()
    }
    
    #[test]
    fn test_select_optimal() {
        assert_eq!(select_optimal(4, Duration::from_millis(500), 0.1), AlgorithmKind::HotStuff);
        assert_eq!(select_optimal(4, Duration::from_secs(2), 0.34), AlgorithmKind::Pbft);
        assert_eq!(select_optimal(20, Duration::from_millis(500), 0.4), AlgorithmKind::Pbft);
        assert_eq!(select_optimal(20, Duration::from_secs(5), 0.2), AlgorithmKind::WeightedByzantine);
    }
    
    #[test]
    fn test_start_validation() {
        let engine = engine("a");
        let participants = chains(&["a", "b", "c", "d"]);
        
        assert!(matches!(
            engine.start("x", b"v".to_vec(), participants.clone(), "raft"),
            Err(ConcordiaError::AlgorithmNotFound(_))
        ));
        assert!(matches!(
            engine.start("x", b"v".to_vec(), chains(&["b", "c"]), "pbft"),
            Err(ConcordiaError::Validation(_))
        ));
        assert!(matches!(
            engine.start("x", b"v".to_vec(), chains(&["a", "a", "b"]), "pbft"),
            Err(ConcordiaError::Validation(_))
        ));
        
        let out = engine.start("x", b"v".to_vec(), participants.clone(), "pbft").unwrap();
        assert_eq!(out[0].msg_type, MessageType::Propose);
        assert!(matches!(
            engine.start("x", b"v".to_vec(), participants, "pbft"),
            Err(ConcordiaError::DuplicateInstance(_))
        ));
    }
    
    #[test]
    fn test_dispatch_rejects_outsiders_and_ignores_self() {
        let engine = engine("a");
        let out = engine.start("x", b"v".to_vec(), chains(&["a", "b", "c", "d"]), "pbft").unwrap();
        
        assert!(engine.dispatch("x", &out[0]).unwrap().is_empty());
        
        let outsider = ConsensusMessage::unsigned(MessageType::Prepare, 0, out[0].sequence, ChainId::from("z"), vec![]);
        assert!(matches!(engine.dispatch("x", &outsider), Err(ConcordiaError::Validation(_))));
        assert!(matches!(engine.dispatch("y", &outsider), Err(ConcordiaError::InstanceNotFound(_))));
    }
    
    #[test]
    fn test_bad_signature_rejected() {
        let registry = Arc::new(KeyRegistry::new());
        let kp_a = KeyPair::generate();
        let kp_b = KeyPair::generate();
        registry.register(ChainId::from("a"), kp_a.public_key());
        registry.register(ChainId::from("b"), kp_b.public_key());
        
        let a = engine("a").with_keys(kp_a, registry.clone());
        let b = engine("b").with_keys(kp_b, registry);
        let participants = chains(&["a", "b", "c", "d"]);
        
        let out = a.start("x", b"v".to_vec(), participants.clone(), "pbft").unwrap();
        b.start("x", b"v".to_vec(), participants, "pbft").unwrap();
        
        let mut forged = out[0].clone();
        forged.content = b"tampered".to_vec();
        assert!(matches!(b.dispatch("x", &forged), Err(ConcordiaError::InvalidSignature)));
        assert!(!b.dispatch("x", &out[0]).unwrap().is_empty());
    }
    
    #[test]
    fn test_decision_latency_recorded() {
        let engine = engine("solo");
        engine.start("x", b"v".to_vec(), chains(&["solo"]), "pbft").unwrap();
        
        assert!(engine.is_decided("x"));
        assert_eq!(engine.decision("x"), Some(b"v".to_vec()));
        let stats = engine.stats("pbft").unwrap();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.decided, 1);
        assert_eq!(stats.samples(), 1);
        
        assert_eq!(engine.close("x").unwrap(), Some(b"v".to_vec()));
        assert_eq!(engine.active_instances(), 0);
    }
    
    #[test]
    fn test_lifecycle_events() {
        let mut engine = engine("b");
        let (tx, mut rx) = create_engine_channel();
        engine.set_event_channel(tx);
        
        engine.start("x", b"v".to_vec(), chains(&["a", "b", "c", "d"]), "pbft").unwrap();
        assert_eq!(engine.close("x").unwrap(), None);
        
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::InstanceStarted(id, alg)) if id == "x" && alg == "pbft"));
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::InstanceClosed(id, false)) if id == "x"));
        assert!(rx.try_recv().is_err());
    }
    
    #[test]
    fn test_select_algorithm_requires_registration() {
        let engine = engine("a");
        // Default budget 5 s and fraction 0.2 select the weighted variant
        assert!(matches!(engine.select_algorithm(4), Err(ConcordiaError::AlgorithmNotFound(_))));
        
        engine.register("weighted", Arc::new(crate::weighted::WeightedByzantine::new()));
        assert_eq!(engine.select_algorithm(4).unwrap(), "weighted");
    }
}
