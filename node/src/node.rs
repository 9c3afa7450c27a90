//! Full node lifecycle

use crate::runtime::NodeRuntime;
use concordia_core::{AdapterRegistry, ChainAdapter, ChainId, NodeConfig};
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Concordia node
pub struct ConcordiaNode {
    runtime: Arc<NodeRuntime>,
}

impl ConcordiaNode {
    pub fn new(runtime: NodeRuntime) -> Self {
        Self {
            runtime: Arc::new(runtime),
        }
    }
    
    /// Run until ctrl-c
    pub async fn start(&self) -> anyhow::Result<()> {
        self.run_until(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received, stopping node..."),
                Err(e) => error!("Error waiting for shutdown signal: {}", e),
            }
        })
        .await
    }
    
    /// Start the monitor loops and the bridge sweeper, run until `shutdown`
    /// resolves, then drain in-flight requests
    pub async fn run_until<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting Concordia node {}...", self.runtime.config().name);
        
        let monitor = self.runtime.monitor().clone().start();
        let (stop_tx, stop_rx) = watch::channel(false);
        let sweeper = self.runtime.spawn_sweeper(stop_rx);
        
        info!(
            "Node started with {} adapters and {} monitored routes",
            self.runtime.adapters().len(),
            self.runtime.monitor().routes().len()
        );
        
        shutdown.await;
        
        let abandoned = self.runtime.shutdown().await;
        if abandoned > 0 {
            warn!("{} requests were still in flight at shutdown", abandoned);
        }
        let _ = stop_tx.send(true);
        if let Err(e) = sweeper.await {
            warn!("Bridge sweeper ended abnormally: {}", e);
        }
        monitor.stop().await;
        
        info!("Node stopped");
        Ok(())
    }
    
    pub fn runtime(&self) -> &Arc<NodeRuntime> {
        &self.runtime
    }
}

/// Node builder for easier configuration
pub struct NodeBuilder {
    config: NodeConfig,
    adapters: Vec<Arc<dyn ChainAdapter>>,
    routes: Vec<(ChainId, ChainId)>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            adapters: Vec::new(),
            routes: Vec::new(),
        }
    }
    
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }
    
    pub fn name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }
    
    pub fn adapter(mut self, adapter: Arc<dyn ChainAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }
    
    pub fn route(mut self, source: ChainId, target: ChainId) -> Self {
        self.routes.push((source, target));
        self
    }
    
    pub fn build(self) -> ConcordiaNode {
        let registry = Arc::new(AdapterRegistry::new());
        for adapter in self.adapters {
            registry.add(adapter);
        }
        let runtime = NodeRuntime::with_adapters(self.config, registry);
        for (source, target) in self.routes {
            runtime.add_route(source, target);
        }
        ConcordiaNode::new(runtime)
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concordia_core::{ConcordiaError, Hash, VerificationData};
    use concordia_orchestrator::VerificationRequest;
    use std::time::Duration;
    
    #[tokio::test(start_paused = true)]
    async fn test_node_runs_and_drains() {
        let node = NodeBuilder::new()
            .name("test-node")
            .route(ChainId::from("ethereum"), ChainId::from("solana"))
            .build();
        let runtime = node.runtime().clone();
        
        node.run_until(tokio::time::sleep(Duration::from_secs(90))).await.unwrap();
        
        // No adapters: both ends of the route were probed down
        let report = runtime.health_report();
        assert_eq!(report.routes.len(), 1);
        assert_eq!(report.routes[0].health_score, 0.0);
        assert_eq!(report.down_chains.len(), 2);
        
        let request = VerificationRequest::new(
            "late",
            "agent",
            VerificationData::new(Hash::from_bytes([0u8; 32]), serde_json::json!(null)),
        );
        assert!(matches!(runtime.verify(request).await, Err(ConcordiaError::ShuttingDown)));
    }
}
