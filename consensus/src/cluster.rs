//! In-process cluster of replicas
//!
//! Drives one engine per participating chain to a decision by delivering
//! every broadcast to every other replica in FIFO order. Used by the
//! orchestrator's advanced voting mode.

use crate::engine::{AdvancedConsensusEngine, SharedEngine};
use crate::hotstuff::HotStuffConsensus;
use crate::message::ConsensusMessage;
use crate::pbft::PbftConsensus;
use crate::weighted::WeightedByzantine;
use concordia_core::{AlgorithmKind, ChainId, ConcordiaError, ConcordiaResult, EngineConfig};
use concordia_crypto::keys::{KeyPair, KeyRegistry};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct ClusterNode {
    engine: SharedEngine,
    weighted: Arc<WeightedByzantine>,
}

/// Result of driving one instance across the cluster
#[derive(Debug, Clone, Default)]
pub struct ClusterOutcome {
    pub decisions: BTreeMap<ChainId, Vec<u8>>,
    pub undecided: Vec<ChainId>,
    pub messages_delivered: usize,
    /// View changes requested before the run went quiet
    pub view_changes: usize,
}

impl ClusterOutcome {
    /// The common decision, if at least one replica decided and all
    /// deciding replicas agree
    pub fn agreed_value(&self) -> Option<&[u8]> {
        let mut values = self.decisions.values();
        let first = values.next()?;
        values.all(|v| v == first).then_some(first.as_slice())
    }
}

/// Replicas keyed by chain, sharing one key registry
pub struct LocalCluster {
    config: EngineConfig,
    keys: Arc<KeyRegistry>,
    nodes: RwLock<BTreeMap<ChainId, ClusterNode>>,
    weights: RwLock<HashMap<ChainId, f64>>,
    /// Crashed replicas: they neither send nor receive
    silent: RwLock<HashSet<ChainId>>,
}

impl LocalCluster {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            keys: Arc::new(KeyRegistry::new()),
            nodes: RwLock::new(BTreeMap::new()),
            weights: RwLock::new(HashMap::new()),
            silent: RwLock::new(HashSet::new()),
        }
    }
    
    /// Add a replica with a fresh signing key and the default algorithms
    pub fn add_node(&self, chain: ChainId) -> ConcordiaResult<()> {
        let keypair = KeyPair::generate();
        self.keys.register(chain.clone(), keypair.public_key());
        
        let engine = AdvancedConsensusEngine::new(self.config.clone(), chain.clone())
            .with_keys(keypair, self.keys.clone());
        let weighted = Arc::new(WeightedByzantine::new());
        for (other, weight) in self.weights.read().iter() {
            weighted.reputation().set_base_weight(other.clone(), *weight)?;
        }
        engine.register(AlgorithmKind::Pbft.default_name(), Arc::new(PbftConsensus::new()));
        engine.register(AlgorithmKind::HotStuff.default_name(), Arc::new(HotStuffConsensus::new()));
        engine.register(AlgorithmKind::WeightedByzantine.default_name(), weighted.clone());
        
        debug!("Cluster node {} added", chain);
        self.nodes.write().insert(
            chain,
            ClusterNode {
                engine: Arc::new(engine),
                weighted,
            },
        );
        Ok(())
    }
    
    pub fn remove_node(&self, chain: &ChainId) {
        self.nodes.write().remove(chain);
        self.keys.remove(chain);
    }
    
    pub fn contains(&self, chain: &ChainId) -> bool {
        self.nodes.read().contains_key(chain)
    }
    
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }
    
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
    
    /// Base weight of `chain` as seen by every replica
    pub fn set_weight(&self, chain: ChainId, weight: f64) -> ConcordiaResult<()> {
        for node in self.nodes.read().values() {
            node.weighted.reputation().set_base_weight(chain.clone(), weight)?;
        }
        self.weights.write().insert(chain, weight);
        Ok(())
    }
    
    /// Reputation of `chain` as seen by replica `observer`
    pub fn reputation(&self, observer: &ChainId, chain: &ChainId) -> Option<f64> {
        self.nodes
            .read()
            .get(observer)
            .map(|n| n.weighted.reputation().reputation(chain))
    }
    
    pub fn set_silent(&self, chain: ChainId, silent: bool) {
        let mut set = self.silent.write();
        if silent {
            set.insert(chain);
        } else {
            set.remove(&chain);
        }
    }
    
    pub fn engine(&self, chain: &ChainId) -> Option<SharedEngine> {
        self.nodes.read().get(chain).map(|n| n.engine.clone())
    }
    
    /// Run one instance where each participant starts with its own input.
    ///
    /// Replicas still undecided once the network is quiet time out and
    /// request a view change, at most once per participant. Every instance
    /// is closed before returning.
    pub fn run(
        &self,
        instance_id: &str,
        inputs: &[(ChainId, Vec<u8>)],
        algorithm: AlgorithmKind,
    ) -> ConcordiaResult<ClusterOutcome> {
        let participants: Vec<ChainId> = inputs.iter().map(|(c, _)| c.clone()).collect();
        let silent = self.silent.read().clone();
        let mut engines: Vec<(ChainId, SharedEngine)> = Vec::new();
        for chain in &participants {
            let engine = self
                .engine(chain)
                .ok_or_else(|| ConcordiaError::Validation(format!("{} is not a cluster node", chain)))?;
            if !silent.contains(chain) {
                engines.push((chain.clone(), engine));
            }
        }
        
        let name = algorithm.default_name();
        let mut queue: VecDeque<ConsensusMessage> = VecDeque::new();
        for (started, ((chain, value), engine)) in inputs
            .iter()
            .filter(|(c, _)| !silent.contains(c))
            .zip(engines.iter().map(|(_, e)| e))
            .enumerate()
        {
            debug!("Starting {} on {}", instance_id, chain);
            match engine.start(instance_id, value.clone(), participants.clone(), name) {
                Ok(out) => queue.extend(out),
                Err(e) => {
                    warn!("Starting {} on {} failed: {}", instance_id, chain, e);
                    for (chain, engine) in engines.iter().take(started) {
                        if let Err(e) = engine.close(instance_id) {
                            warn!("Closing {} on {} failed: {}", instance_id, chain, e);
                        }
                    }
                    return Err(e);
                }
            }
        }
        
        let mut outcome = ClusterOutcome::default();
        let result = self.drive(instance_id, &engines, queue, &mut outcome);
        
        for (chain, engine) in &engines {
            match engine.close(instance_id) {
                Ok(Some(value)) => {
                    outcome.decisions.insert(chain.clone(), value);
                }
                Ok(None) => outcome.undecided.push(chain.clone()),
                Err(e) => warn!("Closing {} on {} failed: {}", instance_id, chain, e),
            }
        }
        result?;
        
        info!(
            "Cluster run {} with {}: {} decided, {} undecided, {} deliveries",
            instance_id,
            name,
            outcome.decisions.len(),
            outcome.undecided.len(),
            outcome.messages_delivered
        );
        Ok(outcome)
    }
    
    fn drive(
        &self,
        instance_id: &str,
        engines: &[(ChainId, SharedEngine)],
        mut queue: VecDeque<ConsensusMessage>,
        outcome: &mut ClusterOutcome,
    ) -> ConcordiaResult<()> {
        let mut timeouts = 0;
        loop {
            while let Some(msg) = queue.pop_front() {
                for (chain, engine) in engines {
                    if *chain == msg.sender {
                        continue;
                    }
                    outcome.messages_delivered += 1;
                    match engine.dispatch(instance_id, &msg) {
                        Ok(out) => queue.extend(out),
                        Err(e) => debug!("{} dropped {} from {}: {}", chain, msg.msg_type, msg.sender, e),
                    }
                }
                if outcome.messages_delivered >= self.config.max_messages_per_instance {
                    warn!("Instance {} hit the message limit", instance_id);
                    return Ok(());
                }
            }
            
            let undecided: Vec<&SharedEngine> = engines
                .iter()
                .filter(|(_, e)| !e.is_decided(instance_id))
                .map(|(_, e)| e)
                .collect();
            if undecided.is_empty() || timeouts >= engines.len() {
                return Ok(());
            }
            
            timeouts += 1;
            for engine in undecided {
                let out = engine.request_view_change(instance_id)?;
                outcome.view_changes += usize::from(!out.is_empty());
                queue.extend(out);
            }
            if queue.is_empty() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    fn cluster(ids: &[&str]) -> LocalCluster {
        let cluster = LocalCluster::new(EngineConfig::default());
        for id in ids {
            cluster.add_node(ChainId::from(*id)).unwrap();
        }
        cluster
    }
    
    fn inputs(values: &[(&str, &str)]) -> Vec<(ChainId, Vec<u8>)> {
        values
            .iter()
            .map(|(c, v)| (ChainId::from(*c), v.as_bytes().to_vec()))
            .collect()
    }
    
    #[test]
    fn test_all_algorithms_tolerate_one_dissenter() {
        for kind in [AlgorithmKind::Pbft, AlgorithmKind::HotStuff, AlgorithmKind::WeightedByzantine] {
            let cluster = cluster(&["a", "b", "c", "d"]);
            let outcome = cluster
                .run(
                    "req-1",
                    &inputs(&[("a", "VERIFIED"), ("b", "VERIFIED"), ("c", "VERIFIED"), ("d", "REJECTED")]),
                    kind,
                )
                .unwrap();
            
            assert_eq!(outcome.agreed_value(), Some(&b"VERIFIED"[..]), "{}", kind);
            for honest in ["a", "b", "c"] {
                assert!(outcome.decisions.contains_key(&ChainId::from(honest)), "{} {}", kind, honest);
            }
        }
    }
    
    #[test]
    fn test_dissenting_leader_is_replaced() {
        for kind in [AlgorithmKind::Pbft, AlgorithmKind::HotStuff] {
            let cluster = cluster(&["a", "b", "c", "d"]);
            let outcome = cluster
                .run(
                    "req-2",
                    &inputs(&[("a", "REJECTED"), ("b", "VERIFIED"), ("c", "VERIFIED"), ("d", "VERIFIED")]),
                    kind,
                )
                .unwrap();
            
            assert!(outcome.view_changes > 0, "{}", kind);
            assert_eq!(outcome.agreed_value(), Some(&b"VERIFIED"[..]), "{}", kind);
        }
    }
    
    #[test]
    fn test_crashed_leader_is_replaced() {
        let cluster = cluster(&["a", "b", "c", "d"]);
        cluster.set_silent(ChainId::from("a"), true);
        let outcome = cluster
            .run(
                "req-3",
                &inputs(&[("a", "OK"), ("b", "OK"), ("c", "OK"), ("d", "OK")]),
                AlgorithmKind::Pbft,
            )
            .unwrap();
        
        assert_eq!(outcome.decisions.len(), 3);
        assert_eq!(outcome.agreed_value(), Some(&b"OK"[..]));
    }
    
    #[test]
    fn test_even_split_never_decides() {
        let cluster = cluster(&["a", "b", "c", "d"]);
        let outcome = cluster
            .run(
                "req-4",
                &inputs(&[("a", "X"), ("b", "X"), ("c", "Y"), ("d", "Y")]),
                AlgorithmKind::Pbft,
            )
            .unwrap();
        
        assert!(outcome.decisions.is_empty());
        assert_eq!(outcome.undecided.len(), 4);
        assert!(cluster.engine(&ChainId::from("a")).unwrap().active_instances() == 0);
    }
    
    #[test]
    fn test_weighted_round_updates_reputation() {
        let cluster = cluster(&["a", "b", "c", "d"]);
        cluster
            .run(
                "req-5",
                &inputs(&[("a", "V"), ("b", "V"), ("c", "V"), ("d", "R")]),
                AlgorithmKind::WeightedByzantine,
            )
            .unwrap();
        
        let observer = ChainId::from("a");
        assert!(cluster.reputation(&observer, &ChainId::from("a")).unwrap() > 1.0);
        assert!(cluster.reputation(&observer, &ChainId::from("d")).unwrap() < 1.0);
    }
    
    #[test]
    fn test_failed_start_closes_started_instances() {
        let cluster = cluster(&["a", "b", "c", "d"]);
        let values = inputs(&[("a", "V"), ("b", "V"), ("c", "V"), ("d", "V")]);
        let participants: Vec<ChainId> = values.iter().map(|(c, _)| c.clone()).collect();
        let c = cluster.engine(&ChainId::from("c")).unwrap();
        c.start("req-7", b"V".to_vec(), participants, "pbft").unwrap();
        
        let result = cluster.run("req-7", &values, AlgorithmKind::Pbft);
        assert!(matches!(result, Err(ConcordiaError::DuplicateInstance(_))));
        for id in ["a", "b", "d"] {
            assert_eq!(cluster.engine(&ChainId::from(id)).unwrap().active_instances(), 0, "{}", id);
        }
        assert_eq!(c.active_instances(), 1);
    }
    
    #[test]
    fn test_unknown_participant_rejected() {
        let cluster = cluster(&["a", "b"]);
        let result = cluster.run("req-6", &inputs(&[("a", "V"), ("z", "V")]), AlgorithmKind::Pbft);
        assert!(matches!(result, Err(ConcordiaError::Validation(_))));
    }
}
