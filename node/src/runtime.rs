//! Node runtime combining all components

use concordia_bridge::{CrossChainConsensusEngine, SharedBridgeEngine};
use concordia_core::{
    AdapterRegistry, ChainAdapter, ChainId, ConcordiaResult, NodeConfig, SharedAdapterRegistry,
};
use concordia_monitor::{BridgeHealthMonitor, HealthReport, RouteId};
use concordia_orchestrator::{ConsensusOutcome, MultiChainConsensusEngine, SharedOrchestrator, VerificationRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Node runtime managing all components
pub struct NodeRuntime {
    config: NodeConfig,
    adapters: SharedAdapterRegistry,
    bridge: SharedBridgeEngine,
    orchestrator: SharedOrchestrator,
    monitor: Arc<BridgeHealthMonitor>,
}

impl NodeRuntime {
    /// Create a runtime with an empty adapter registry
    pub fn new(config: NodeConfig) -> Self {
        Self::with_adapters(config, Arc::new(AdapterRegistry::new()))
    }
    
    pub fn with_adapters(config: NodeConfig, adapters: SharedAdapterRegistry) -> Self {
        let bridge = Arc::new(CrossChainConsensusEngine::new(config.bridge.clone()));
        let monitor = Arc::new(BridgeHealthMonitor::new(config.monitor.clone(), adapters.clone()));
        let orchestrator = Arc::new(
            MultiChainConsensusEngine::new(
                config.orchestrator.clone(),
                config.engine.clone(),
                adapters.clone(),
                bridge.clone(),
            )
            .with_monitor(monitor.clone()),
        );
        
        info!(
            "Runtime {} ready ({} adapters, voting mode {}, advanced={})",
            config.name,
            adapters.len(),
            config.orchestrator.voting_mode,
            config.orchestrator.advanced_mode
        );
        
        Self {
            config,
            adapters,
            bridge,
            orchestrator,
            monitor,
        }
    }
    
    pub fn register_adapter(&self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.add(adapter);
    }
    
    pub fn remove_adapter(&self, chain: &ChainId) -> bool {
        self.adapters.remove(chain).is_some()
    }
    
    /// Track the health of a bridge route
    pub fn add_route(&self, source: ChainId, target: ChainId) -> RouteId {
        self.monitor.add_route(source, target)
    }
    
    /// Verify a claim across the participating chains
    pub async fn verify(&self, request: VerificationRequest) -> ConcordiaResult<ConsensusOutcome> {
        self.orchestrator.process(request).await
    }
    
    pub fn health_report(&self) -> HealthReport {
        self.monitor.health_report()
    }
    
    /// Periodically time out bridge processes past their deadline
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let bridge = self.bridge.clone();
        let period = Duration::from_millis(self.config.monitor.alert_check_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = bridge.expire_stale();
                        if !expired.is_empty() {
                            warn!("Timed out {} bridge processes", expired.len());
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Bridge sweeper stopped");
        })
    }
    
    /// Drain the orchestrator and close the bridge
    pub async fn shutdown(&self) -> usize {
        self.orchestrator.shutdown().await
    }
    
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
    
    pub fn adapters(&self) -> &SharedAdapterRegistry {
        &self.adapters
    }
    
    pub fn bridge(&self) -> &SharedBridgeEngine {
        &self.bridge
    }
    
    pub fn orchestrator(&self) -> &SharedOrchestrator {
        &self.orchestrator
    }
    
    pub fn monitor(&self) -> &Arc<BridgeHealthMonitor> {
        &self.monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use concordia_bridge::{ConsensusVote, ProcessConfig};
    use concordia_core::{
        ChainVerificationResult, ConsensusMode, Hash, MessageId, ProcessId, VerificationData, VerificationStatus,
        VoteData,
    };
    
    struct StaticAdapter {
        chain: ChainId,
    }
    
    #[async_trait]
    impl ChainAdapter for StaticAdapter {
        fn chain_id(&self) -> &ChainId {
            &self.chain
        }
        
        async fn verify(&self, _agent_id: &str, _data: &VerificationData) -> ConcordiaResult<ChainVerificationResult> {
            Ok(ChainVerificationResult::new(self.chain.clone(), VerificationStatus::Verified, 0.8))
        }
        
        async fn submit_vote(&self, _process_id: &ProcessId, _vote: &VoteData) -> ConcordiaResult<String> {
            Ok(format!("ref-{}", self.chain))
        }
        
        fn consensus_weight(&self) -> f64 {
            1.0
        }
        
        async fn is_healthy(&self) -> bool {
            true
        }
        
        fn is_connected(&self) -> bool {
            true
        }
    }
    
    fn runtime() -> NodeRuntime {
        let runtime = NodeRuntime::new(NodeConfig::default());
        for chain in ["ethereum", "polygon", "solana"] {
            runtime.register_adapter(Arc::new(StaticAdapter { chain: ChainId::from(chain) }));
        }
        runtime
    }
    
    #[tokio::test]
    async fn test_runtime_verifies_claim() {
        let runtime = runtime();
        let request = VerificationRequest::new(
            "req-1",
            "agent-1",
            VerificationData::new(Hash::from_bytes([1u8; 32]), serde_json::json!({})),
        );
        
        let outcome = runtime.verify(request).await.unwrap();
        assert_eq!(outcome.status, VerificationStatus::Verified);
        assert_eq!(outcome.participants.len(), 3);
        assert!(runtime.bridge().result(&outcome.bridge_result.unwrap().process_id).is_some());
    }
    
    #[tokio::test]
    async fn test_removed_adapter_leaves_too_few_participants() {
        let runtime = runtime();
        assert!(runtime.remove_adapter(&ChainId::from("solana")));
        let request = VerificationRequest::new(
            "req-2",
            "agent-1",
            VerificationData::new(Hash::from_bytes([2u8; 32]), serde_json::json!({})),
        );
        assert!(runtime.verify(request).await.is_err());
    }
    
    #[tokio::test(start_paused = true)]
    async fn test_sweeper_times_out_abandoned_processes() {
        let mut config = NodeConfig::default();
        config.bridge.timeout_ms = 5_000;
        config.monitor.alert_check_interval_ms = 1_000;
        let runtime = NodeRuntime::new(config);
        
        let chains = vec![ChainId::from("a"), ChainId::from("b")];
        let pid = runtime
            .bridge()
            .initialize(MessageId::new("orphan"), chains, ProcessConfig::new(ConsensusMode::Weighted))
            .unwrap();
        runtime
            .bridge()
            .submit_vote(&pid, ConsensusVote::new(ChainId::from("a"), "X", 0.5, 1.0))
            .unwrap();
        
        let (tx, rx) = watch::channel(false);
        let sweeper = runtime.spawn_sweeper(rx);
        tokio::time::sleep(Duration::from_secs(7)).await;
        
        let result = runtime.bridge().result(&pid).unwrap();
        assert!(!result.achieved);
        assert_eq!(result.total_votes, 1);
        
        tx.send(true).unwrap();
        sweeper.await.unwrap();
    }
}
