//! Wire envelope for bridge traffic

use concordia_consensus::{ConsensusMessage, MessageType};
use concordia_core::{ChainId, ConcordiaError, ConcordiaResult, MessageId, Signature, Timestamp};
use concordia_crypto::keys::{KeyPair, KeyRegistry};
use concordia_crypto::signing::{sign, verify_from};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Envelope protocol version
pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BridgeMessageType {
    VerificationRequest,
    ConsensusVote,
    HealthCheck,
    ViewChange,
    NewView,
    Decision,
}

impl BridgeMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeMessageType::VerificationRequest => "verification_request",
            BridgeMessageType::ConsensusVote => "consensus_vote",
            BridgeMessageType::HealthCheck => "health_check",
            BridgeMessageType::ViewChange => "view_change",
            BridgeMessageType::NewView => "new_view",
            BridgeMessageType::Decision => "decision",
        }
    }
    
    /// Envelope type that carries a replica message
    pub fn for_consensus(msg_type: MessageType) -> Self {
        match msg_type {
            MessageType::Propose => BridgeMessageType::VerificationRequest,
            MessageType::Prepare | MessageType::Commit => BridgeMessageType::ConsensusVote,
            MessageType::ViewChange => BridgeMessageType::ViewChange,
            MessageType::NewView => BridgeMessageType::NewView,
            MessageType::Decision => BridgeMessageType::Decision,
        }
    }
}

impl fmt::Display for BridgeMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed bridge message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub version: u32,
    pub message_id: MessageId,
    pub message_type: BridgeMessageType,
    pub view_number: u64,
    pub sequence_number: u64,
    pub sender_id: ChainId,
    /// Opaque, usually bincode
    pub payload: Vec<u8>,
    pub signature: Signature,
    pub timestamp: Timestamp,
}

impl BridgeMessage {
    pub fn new(
        message_id: MessageId,
        message_type: BridgeMessageType,
        view_number: u64,
        sequence_number: u64,
        sender_id: ChainId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            message_id,
            message_type,
            view_number,
            sequence_number,
            sender_id,
            payload,
            signature: Signature::EMPTY,
            timestamp: Timestamp::now(),
        }
    }
    
    /// Envelope with a bincode payload
    pub fn with_payload<T: Serialize>(
        message_id: MessageId,
        message_type: BridgeMessageType,
        sender_id: ChainId,
        payload: &T,
    ) -> ConcordiaResult<Self> {
        Ok(Self::new(message_id, message_type, 0, 0, sender_id, bincode::serialize(payload)?))
    }
    
    /// Wrap a replica message; the replica message keeps its own signature
    pub fn wrap_consensus(message_id: MessageId, message: &ConsensusMessage) -> ConcordiaResult<Self> {
        Ok(Self::new(
            message_id,
            BridgeMessageType::for_consensus(message.msg_type),
            message.view,
            message.sequence,
            message.sender.clone(),
            bincode::serialize(message)?,
        ))
    }
    
    fn signing_bytes(&self) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(b"CONCORDIA_BRIDGE:");
        msg.extend_from_slice(&self.version.to_le_bytes());
        for part in [
            self.message_id.as_str().as_bytes(),
            self.message_type.as_str().as_bytes(),
            self.sender_id.as_bytes(),
            self.payload.as_slice(),
        ] {
            msg.extend_from_slice(&(part.len() as u32).to_le_bytes());
            msg.extend_from_slice(part);
        }
        msg.extend_from_slice(&self.view_number.to_le_bytes());
        msg.extend_from_slice(&self.sequence_number.to_le_bytes());
        msg.extend_from_slice(&self.timestamp.as_millis().to_le_bytes());
        msg
    }
    
    pub fn sign(&mut self, keypair: &KeyPair) {
        self.signature = sign(keypair, &self.signing_bytes());
    }
    
    /// Check the signature against the sender's registered key
    pub fn verify(&self, keys: &KeyRegistry) -> ConcordiaResult<()> {
        verify_from(keys, &self.sender_id, &self.signing_bytes(), &self.signature)
    }
    
    pub fn decode_payload<T: DeserializeOwned>(&self) -> ConcordiaResult<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }
    
    pub fn to_bytes(&self) -> ConcordiaResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
    
    pub fn from_bytes(bytes: &[u8]) -> ConcordiaResult<Self> {
        let msg: Self = bincode::deserialize(bytes)?;
        if msg.version != ENVELOPE_VERSION {
            return Err(ConcordiaError::Validation(format!(
                "unsupported envelope version {}",
                msg.version
            )));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vote::ConsensusVote;
    
    #[test]
    fn test_signed_envelope_survives_the_wire() {
        let kp = KeyPair::generate();
        let vote = ConsensusVote::new(ChainId::from("polygon"), "VERIFIED", 0.8, 1.0);
        let mut msg = BridgeMessage::with_payload(
            MessageId::new("msg-1"),
            BridgeMessageType::ConsensusVote,
            ChainId::from("polygon"),
            &vote,
        )
        .unwrap();
        msg.sign(&kp);
        let keys = KeyRegistry::new();
        keys.register(ChainId::from("polygon"), kp.public_key());
        
        let restored = BridgeMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert!(restored.verify(&keys).is_ok());
        assert_eq!(restored.decode_payload::<ConsensusVote>().unwrap(), vote);
    }
    
    #[test]
    fn test_tampered_or_unsigned_envelope_fails() {
        let kp = KeyPair::generate();
        let mut msg = BridgeMessage::new(
            MessageId::new("msg-2"),
            BridgeMessageType::HealthCheck,
            0,
            0,
            ChainId::from("solana"),
            vec![1, 2, 3],
        );
        let keys = KeyRegistry::new();
        keys.register(ChainId::from("solana"), kp.public_key());
        assert!(msg.verify(&keys).is_err());
        
        msg.sign(&kp);
        assert!(msg.verify(&keys).is_ok());
        assert!(matches!(msg.verify(&KeyRegistry::new()), Err(ConcordiaError::InvalidPublicKey)));
        msg.view_number = 7;
        assert!(matches!(msg.verify(&keys), Err(ConcordiaError::InvalidSignature)));
    }
    
    #[test]
    fn test_wraps_replica_messages() {
        let inner = ConsensusMessage::unsigned(MessageType::ViewChange, 3, 9, ChainId::from("a"), vec![]);
        let msg = BridgeMessage::wrap_consensus(MessageId::new("m"), &inner).unwrap();
        
        assert_eq!(msg.message_type, BridgeMessageType::ViewChange);
        assert_eq!(msg.view_number, 3);
        assert_eq!(msg.sequence_number, 9);
        let decoded: ConsensusMessage = msg.decode_payload().unwrap();
        assert_eq!(decoded.sender, ChainId::from("a"));
    }
}
