//! Core types for Concordia
//! 
//! Defines fundamental data structures used across the system.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of a participating blockchain (e.g. `ethereum`, `solana`)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainId(pub String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        ChainId(id.into())
    }
    
    pub fn as_str(&self) -> &str {
        &self.0
    }
    
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for ChainId {
    fn from(s: &str) -> Self {
        ChainId(s.to_string())
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({})", self.0)
    }
}

/// 32-byte hash type
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);
    
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
    
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
    
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
    
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Hash(arr))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", &self.to_hex()[..16])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(0x{})", self.to_hex())
    }
}

/// 64-byte Ed25519 signature
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde_as(as = "[_; 64]")] pub [u8; 64]);

impl Signature {
    /// Placeholder carried by messages produced without a signing key
    pub const EMPTY: Signature = Signature([0u8; 64]);
    
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Signature(bytes)
    }
    
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
    
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
    
    pub fn is_empty(&self) -> bool {
        self == &Self::EMPTY
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{}...)", &self.to_hex()[..16])
    }
}

/// 32-byte public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
    
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
    
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(0x{})", self.to_hex())
    }
}

/// Timestamp in milliseconds since Unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis() as u64)
    }
    
    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }
    
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Identifier of a bridge-level consensus process
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub Uuid);

impl ProcessId {
    pub fn new() -> Self {
        ProcessId(Uuid::new_v4())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessId({})", self.0)
    }
}

/// Identifier of a cross-chain message (or verification request)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }
    
    pub fn random() -> Self {
        MessageId(Uuid::new_v4().to_string())
    }
    
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

/// Low-level BFT algorithm families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlgorithmKind {
    Pbft,
    HotStuff,
    WeightedByzantine,
}

impl AlgorithmKind {
    /// Name under which the algorithm is registered by default
    pub fn default_name(&self) -> &'static str {
        match self {
            AlgorithmKind::Pbft => "pbft",
            AlgorithmKind::HotStuff => "hotstuff",
            AlgorithmKind::WeightedByzantine => "weighted_byzantine",
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_name())
    }
}

/// Bridge-level voting mode of a consensus process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsensusMode {
    SimpleMajority,
    Weighted,
    Bft,
}

impl ConsensusMode {
    /// Minimum number of participants accepted at initialization
    pub fn min_participants(&self) -> usize {
        match self {
            ConsensusMode::Bft => 4,
            ConsensusMode::SimpleMajority => 3,
            ConsensusMode::Weighted => 2,
        }
    }
}

impl fmt::Display for ConsensusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusMode::SimpleMajority => write!(f, "simple_majority"),
            ConsensusMode::Weighted => write!(f, "weighted"),
            ConsensusMode::Bft => write!(f, "bft"),
        }
    }
}

/// Outcome of verifying a claim, per chain or aggregated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationStatus {
    Verified,
    Rejected,
    Pending,
    Failed,
}

impl VerificationStatus {
    /// Vote value used on the bridge for this outcome
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Verified => "VERIFIED",
            VerificationStatus::Rejected => "REJECTED",
            VerificationStatus::Pending => "PENDING",
            VerificationStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim handed to every chain adapter for independent verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationData {
    /// Hash of the attested AI verification outcome
    pub claim_hash: Hash,
    /// Opaque claim payload
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, String>,
}

impl VerificationData {
    pub fn new(claim_hash: Hash, payload: serde_json::Value) -> Self {
        Self {
            claim_hash,
            payload,
            metadata: HashMap::new(),
        }
    }
}

/// Per-chain verification outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerificationResult {
    pub chain: ChainId,
    pub status: VerificationStatus,
    pub confidence: f64,
    pub evidence: serde_json::Value,
    /// On-chain reference (transaction hash, event id)
    pub reference: Option<String>,
}

impl ChainVerificationResult {
    pub fn new(chain: ChainId, status: VerificationStatus, confidence: f64) -> Self {
        Self {
            chain,
            status,
            confidence,
            evidence: serde_json::Value::Null,
            reference: None,
        }
    }
    
    /// Result recorded for a chain whose adapter call failed
    pub fn failed(chain: ChainId, reason: &str) -> Self {
        Self {
            chain,
            status: VerificationStatus::Failed,
            confidence: 0.0,
            evidence: serde_json::json!({ "error": reason }),
            reference: None,
        }
    }
    
    pub fn is_success(&self) -> bool {
        self.status != VerificationStatus::Failed
    }
}

/// Vote payload submitted to a chain adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteData {
    pub chain: ChainId,
    pub value: String,
    pub confidence: f64,
    pub weight: f64,
    pub timestamp: Timestamp,
}
