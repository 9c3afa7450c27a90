//! Error types for Concordia

use crate::types::{ChainId, ConsensusMode};
use thiserror::Error;

/// Main error type for Concordia
#[derive(Error, Debug)]
pub enum ConcordiaError {
    // ============ Validation Errors ============
    #[error("Validation failed: {0}")]
    Validation(String),
    
    #[error("Invalid signature")]
    InvalidSignature,
    
    #[error("Invalid public key")]
    InvalidPublicKey,
    
    // ============ Consensus Errors ============
    #[error("Insufficient participants for {mode}: required {required}, available {available}")]
    InsufficientParticipants {
        mode: ConsensusMode,
        required: usize,
        available: usize,
    },
    
    #[error("Consensus timeout: {0}")]
    ConsensusTimeout(String),
    
    #[error("Consensus process not found: {0}")]
    ProcessNotFound(String),
    
    #[error("Consensus process not complete: {0}")]
    ProcessNotComplete(String),
    
    #[error("Consensus instance not found: {0}")]
    InstanceNotFound(String),
    
    #[error("Consensus instance already exists: {0}")]
    DuplicateInstance(String),
    
    #[error("Consensus algorithm not registered: {0}")]
    AlgorithmNotFound(String),
    
    // ============ Adapter Errors ============
    #[error("Adapter failure on {chain}: {reason}")]
    AdapterFailure { chain: ChainId, reason: String },
    
    #[error("Vote submission failed: {0}")]
    VoteSubmission(String),
    
    // ============ Threshold Signature Errors ============
    #[error("Insufficient signature shares: required {required}, provided {provided}")]
    InsufficientShares { required: usize, provided: usize },
    
    // ============ Serialization Errors ============
    #[error("Serialization failed: {0}")]
    Serialization(String),
    
    // ============ Configuration Errors ============
    #[error("Configuration error: {0}")]
    Config(String),
    
    // ============ General Errors ============
    #[error("Engine is shutting down")]
    ShuttingDown,
    
    #[error("Internal error: {0}")]
    Internal(String),
    
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for ConcordiaError {
    fn from(err: std::io::Error) -> Self {
        ConcordiaError::Config(err.to_string())
    }
}

impl From<bincode::Error> for ConcordiaError {
    fn from(err: bincode::Error) -> Self {
        ConcordiaError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ConcordiaError {
    fn from(err: serde_json::Error) -> Self {
        ConcordiaError::Serialization(err.to_string())
    }
}
