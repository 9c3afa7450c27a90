//! Consensus messages exchanged between replicas

use concordia_core::{ChainId, ConcordiaResult, Hash, Hashable, Signable, Signature, Timestamp};
use concordia_crypto::hashing::hash;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message kinds of the replica protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Propose,
    Prepare,
    Commit,
    ViewChange,
    NewView,
    Decision,
}

impl MessageType {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            MessageType::Propose => 0,
            MessageType::Prepare => 1,
            MessageType::Commit => 2,
            MessageType::ViewChange => 3,
            MessageType::NewView => 4,
            MessageType::Decision => 5,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Propose => "PROPOSE",
            MessageType::Prepare => "PREPARE",
            MessageType::Commit => "COMMIT",
            MessageType::ViewChange => "VIEW_CHANGE",
            MessageType::NewView => "NEW_VIEW",
            MessageType::Decision => "DECISION",
        };
        f.write_str(name)
    }
}

/// Immutable, content-addressed consensus message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusMessage {
    pub msg_type: MessageType,
    pub view: u64,
    pub sequence: u64,
    pub sender: ChainId,
    /// Algorithm-defined payload
    pub content: Vec<u8>,
    pub signature: Signature,
    pub timestamp: Timestamp,
}

impl ConsensusMessage {
    /// Create and sign a new message
    pub fn new(
        msg_type: MessageType,
        view: u64,
        sequence: u64,
        sender: ChainId,
        content: Vec<u8>,
        sign_fn: impl FnOnce(&[u8]) -> Signature,
    ) -> Self {
        let timestamp = Timestamp::now();
        let sign_msg = Self::signing_message(msg_type, view, sequence, &sender, &content, &timestamp);
        let signature = sign_fn(&sign_msg);
        
        Self {
            msg_type,
            view,
            sequence,
            sender,
            content,
            signature,
            timestamp,
        }
    }
    
    /// Create a message without a signature
    pub fn unsigned(
        msg_type: MessageType,
        view: u64,
        sequence: u64,
        sender: ChainId,
        content: Vec<u8>,
    ) -> Self {
        Self::new(msg_type, view, sequence, sender, content, |_| Signature::EMPTY)
    }
    
    fn signing_message(
        msg_type: MessageType,
        view: u64,
        sequence: u64,
        sender: &ChainId,
        content: &[u8],
        timestamp: &Timestamp,
    ) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(b"CONCORDIA_CONSENSUS:");
        msg.push(msg_type.tag());
        msg.extend_from_slice(&view.to_le_bytes());
        msg.extend_from_slice(&sequence.to_le_bytes());
        msg.extend_from_slice(&(sender.as_bytes().len() as u32).to_le_bytes());
        msg.extend_from_slice(sender.as_bytes());
        msg.extend_from_slice(&(content.len() as u32).to_le_bytes());
        msg.extend_from_slice(content);
        msg.extend_from_slice(&timestamp.0.to_le_bytes());
        msg
    }
    
    /// Get signing message for verification
    pub fn get_signing_message(&self) -> Vec<u8> {
        Self::signing_message(
            self.msg_type,
            self.view,
            self.sequence,
            &self.sender,
            &self.content,
            &self.timestamp,
        )
    }
    
    /// Decode a bincode payload
    pub fn decode_content<T: DeserializeOwned>(&self) -> ConcordiaResult<T> {
        Ok(bincode::deserialize(&self.content)?)
    }
}

impl Hashable for ConsensusMessage {
    fn hash(&self) -> Hash {
        hash(&self.get_signing_message())
    }
}

impl Signable for ConsensusMessage {
    fn signing_bytes(&self) -> Vec<u8> {
        self.get_signing_message()
    }
}
