//! Core traits defining Concordia interfaces
//! 
//! These traits define the contracts that engines and external chain
//! collaborators implement.

use crate::types::*;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Result type for Concordia operations
pub type ConcordiaResult<T> = Result<T, crate::error::ConcordiaError>;

/// Trait for hashable types
pub trait Hashable {
    /// Compute the hash of this object
    fn hash(&self) -> Hash;
}

/// Trait for signable types
pub trait Signable: Hashable {
    /// Get the bytes to be signed
    fn signing_bytes(&self) -> Vec<u8>;
}

/// Capability interface implemented by every external blockchain collaborator
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Chain this adapter talks to
    fn chain_id(&self) -> &ChainId;
    
    /// Verify a claim on this chain.
    ///
    /// A failure here degrades this chain's result only.
    async fn verify(
        &self,
        agent_id: &str,
        data: &VerificationData,
    ) -> ConcordiaResult<ChainVerificationResult>;
    
    /// Record a vote on this chain, returning an on-chain reference handle.
    ///
    /// Fails with `ConcordiaError::VoteSubmission`.
    async fn submit_vote(&self, process_id: &ProcessId, vote: &VoteData) -> ConcordiaResult<String>;
    
    /// Static voting weight of this chain, strictly positive
    fn consensus_weight(&self) -> f64;
    
    /// Active health probe
    async fn is_healthy(&self) -> bool;
    
    /// Whether the underlying connection is currently open
    fn is_connected(&self) -> bool;
}

/// Registry of chain adapters.
///
/// Mutated only through `add`/`remove`; read-mostly while requests run.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<ChainId, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Register an adapter, replacing any previous one for the same chain
    pub fn add(&self, adapter: Arc<dyn ChainAdapter>) {
        let chain = adapter.chain_id().clone();
        info!("Registered adapter for chain {}", chain);
        self.adapters.insert(chain, adapter);
    }
    
    /// Remove an adapter
    pub fn remove(&self, chain: &ChainId) -> Option<Arc<dyn ChainAdapter>> {
        let removed = self.adapters.remove(chain).map(|(_, a)| a);
        if removed.is_some() {
            info!("Removed adapter for chain {}", chain);
        }
        removed
    }
    
    pub fn get(&self, chain: &ChainId) -> Option<Arc<dyn ChainAdapter>> {
        self.adapters.get(chain).map(|a| a.value().clone())
    }
    
    pub fn contains(&self, chain: &ChainId) -> bool {
        self.adapters.contains_key(chain)
    }
    
    /// Registered chains in a stable order
    pub fn chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<ChainId> = self.adapters.iter().map(|a| a.key().clone()).collect();
        chains.sort();
        chains
    }
    
    pub fn len(&self) -> usize {
        self.adapters.len()
    }
    
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Shared adapter registry
pub type SharedAdapterRegistry = Arc<AdapterRegistry>;
