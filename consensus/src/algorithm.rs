//! Common interface of the low-level BFT algorithms
//!
//! Every algorithm drives a [`ConsensusInstance`] through its own state
//! machine. The engine owns the instance and hands it to the algorithm on
//! each step; algorithm-private round data lives in [`InstanceExt`].

use crate::hotstuff::HotStuffRound;
use crate::message::{ConsensusMessage, MessageType};
use crate::pbft::PbftRound;
use crate::state::ConsensusState;
use crate::weighted::WeightedRound;
use concordia_core::{AlgorithmKind, ChainId, ConcordiaResult, Signature};
use concordia_crypto::hashing::hash;
use concordia_crypto::keys::{KeyPair, KeyRegistry};
use concordia_crypto::signing::{sign, verify_if_registered};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Fault tolerance for `n` participants: f = ⌊(n-1)/3⌋
pub fn max_faulty(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Matching votes needed to decide among `n` participants: ⌊2n/3⌋+1.
///
/// Equals 2f+1 when n = 3f+1. For other sizes it is larger than 2f+1
/// (n = 5 needs 4, not 3), so any two quorums still overlap in more than
/// n/3 replicas and therefore in at least one correct one.
pub fn quorum_size(n: usize) -> usize {
    2 * n / 3 + 1
}

/// Sequence number shared by every replica of an instance
pub fn instance_sequence(instance_id: &str) -> u64 {
    let h = hash(instance_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&h.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Encode an algorithm payload
pub(crate) fn encode<T: Serialize>(content: &T) -> ConcordiaResult<Vec<u8>> {
    Ok(bincode::serialize(content)?)
}

/// Fixed facts about an instance, as seen by one replica
#[derive(Debug, Clone)]
pub struct InstanceContext {
    pub instance_id: String,
    pub local_id: ChainId,
    /// Fixed at creation
    pub participants: Vec<ChainId>,
    /// Value this replica was started with
    pub input: Option<Vec<u8>>,
    signer: Option<KeyPair>,
    keys: Option<Arc<KeyRegistry>>,
}

impl InstanceContext {
    pub fn new(
        instance_id: impl Into<String>,
        local_id: ChainId,
        participants: Vec<ChainId>,
        signer: Option<KeyPair>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            local_id,
            participants,
            input: None,
            signer,
            keys: None,
        }
    }
    
    /// Check embedded signatures of registered participants against `keys`
    pub fn with_keys(mut self, keys: Arc<KeyRegistry>) -> Self {
        self.keys = Some(keys);
        self
    }
    
    pub fn n(&self) -> usize {
        self.participants.len()
    }
    
    pub fn max_faulty(&self) -> usize {
        max_faulty(self.n())
    }
    
    pub fn quorum(&self) -> usize {
        quorum_size(self.n())
    }
    
    /// Leader of view `v` is participant `v mod n`
    pub fn leader_for(&self, view: u64) -> &ChainId {
        let idx = (view % self.n().max(1) as u64) as usize;
        &self.participants[idx]
    }
    
    pub fn is_leader(&self, view: u64) -> bool {
        !self.participants.is_empty() && self.leader_for(view) == &self.local_id
    }
    
    pub fn is_participant(&self, chain: &ChainId) -> bool {
        self.participants.contains(chain)
    }
    
    /// Sign a statement with this replica's key, or leave it unsigned
    pub fn sign(&self, statement: &[u8]) -> Signature {
        self.signer.as_ref().map_or(Signature::EMPTY, |kp| sign(kp, statement))
    }
    
    /// Whether `signer` really made `signature` over `statement`. Without a
    /// registry, or for a participant with no registered key, nothing can
    /// be checked and the signature is taken as given.
    pub fn authentic(&self, signer: &ChainId, statement: &[u8], signature: &Signature) -> bool {
        self.keys
            .as_ref()
            .map_or(true, |keys| verify_if_registered(keys, signer, statement, signature).is_ok())
    }
    
    /// Build a message from this replica, signed when a key is available
    pub fn message<T: Serialize>(
        &self,
        msg_type: MessageType,
        view: u64,
        sequence: u64,
        content: &T,
    ) -> ConcordiaResult<ConsensusMessage> {
        let content = encode(content)?;
        let sender = self.local_id.clone();
        Ok(match &self.signer {
            Some(kp) => ConsensusMessage::new(msg_type, view, sequence, sender, content, |m| sign(kp, m)),
            None => ConsensusMessage::unsigned(msg_type, view, sequence, sender, content),
        })
    }
}

/// Algorithm-private round data
#[derive(Debug, Clone)]
pub enum InstanceExt {
    Pbft(PbftRound),
    HotStuff(HotStuffRound),
    Weighted(WeightedRound),
}

/// One consensus instance as owned by a single replica's engine
#[derive(Debug)]
pub struct ConsensusInstance {
    /// Registered name of the driving algorithm
    pub algorithm: String,
    pub ctx: InstanceContext,
    pub state: ConsensusState,
    pub ext: InstanceExt,
    pub started_at: Instant,
    /// Set once the decision latency has been recorded
    pub decision_recorded: bool,
}

impl ConsensusInstance {
    pub fn new(algorithm: &dyn ConsensusAlgorithm, name: impl Into<String>, ctx: InstanceContext) -> Self {
        let state = ConsensusState::new(instance_sequence(&ctx.instance_id));
        let ext = algorithm.new_round(&ctx);
        Self {
            algorithm: name.into(),
            ctx,
            state,
            ext,
            started_at: Instant::now(),
            decision_recorded: false,
        }
    }
    
    pub fn id(&self) -> &str {
        &self.ctx.instance_id
    }
    
    pub fn is_decided(&self) -> bool {
        self.state.is_decided()
    }
}

/// A low-level BFT algorithm.
///
/// Handlers return the messages this replica broadcasts in response. Messages
/// a replica produces are already applied to its own state; the engine does
/// not loop them back.
pub trait ConsensusAlgorithm: Send + Sync {
    fn kind(&self) -> AlgorithmKind;
    
    /// Fresh round data for a new instance
    fn new_round(&self, ctx: &InstanceContext) -> InstanceExt;
    
    /// Begin the instance with this replica's input value
    fn start(&self, instance: &mut ConsensusInstance, value: Vec<u8>) -> ConcordiaResult<Vec<ConsensusMessage>>;
    
    /// Handle a message from another participant
    fn handle(
        &self,
        instance: &mut ConsensusInstance,
        message: &ConsensusMessage,
    ) -> ConcordiaResult<Vec<ConsensusMessage>>;
    
    /// Local timeout: ask to move past the current view
    fn view_change(&self, _instance: &mut ConsensusInstance) -> ConcordiaResult<Vec<ConsensusMessage>> {
        Ok(Vec::new())
    }
    
    /// The instance is being closed without further messages
    fn expire(&self, _instance: &mut ConsensusInstance) {}
}
