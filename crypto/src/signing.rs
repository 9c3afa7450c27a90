//! Ed25519 signatures of participant traffic
//!
//! Two checks exist against a [`KeyRegistry`]. [`verify_from`] requires the
//! signer to be registered, as bridge envelopes do. [`verify_if_registered`]
//! lets chains without a registered key through and holds registered chains
//! to a valid signature; replica messages, quorum-certificate votes and
//! view-change proofs are checked this way.

use ed25519_dalek::{Signer, Verifier};
use concordia_core::{ChainId, ConcordiaError, ConcordiaResult, PublicKey, Signature};

use crate::keys::{public_key_to_ed25519, KeyPair, KeyRegistry};

/// Sign a message using Ed25519
pub fn sign(keypair: &KeyPair, message: &[u8]) -> Signature {
    let signature = keypair.signing_key().sign(message);
    Signature::from_bytes(signature.to_bytes())
}

/// Verify a signature using Ed25519
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> ConcordiaResult<()> {
    if signature.is_empty() {
        return Err(ConcordiaError::InvalidSignature);
    }
    let verifying_key = public_key_to_ed25519(public_key)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    
    verifying_key
        .verify(message, &sig)
        .map_err(|_| ConcordiaError::InvalidSignature)
}

/// Verify `signer`'s signature; the signer must have a registered key
pub fn verify_from(keys: &KeyRegistry, signer: &ChainId, message: &[u8], signature: &Signature) -> ConcordiaResult<()> {
    let key = keys.get(signer).ok_or(ConcordiaError::InvalidPublicKey)?;
    verify(&key, message, signature)
}

/// Verify `signer`'s signature when its key is registered
pub fn verify_if_registered(
    keys: &KeyRegistry,
    signer: &ChainId,
    message: &[u8],
    signature: &Signature,
) -> ConcordiaResult<()> {
    match keys.get(signer) {
        Some(key) => verify(&key, message, signature),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    fn registry(chain: &str, kp: &KeyPair) -> KeyRegistry {
        let keys = KeyRegistry::new();
        keys.register(ChainId::from(chain), kp.public_key());
        keys
    }
    
    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let message = b"COMMIT view 3";
        
        let signature = sign(&keypair, message);
        assert!(verify(&keypair.public_key(), message, &signature).is_ok());
        assert!(verify(&keypair.public_key(), b"COMMIT view 4", &signature).is_err());
        assert!(verify(&KeyPair::generate().public_key(), message, &signature).is_err());
    }
    
    #[test]
    fn test_empty_signature_rejected() {
        let keypair = KeyPair::generate();
        assert!(matches!(
            verify(&keypair.public_key(), b"vote", &Signature::EMPTY),
            Err(ConcordiaError::InvalidSignature)
        ));
    }
    
    #[test]
    fn test_verify_from_requires_registration() {
        let kp = KeyPair::generate();
        let keys = registry("ethereum", &kp);
        let sig = sign(&kp, b"vote");
        
        assert!(verify_from(&keys, &ChainId::from("ethereum"), b"vote", &sig).is_ok());
        assert!(matches!(
            verify_from(&keys, &ChainId::from("solana"), b"vote", &sig),
            Err(ConcordiaError::InvalidPublicKey)
        ));
    }
    
    #[test]
    fn test_verify_if_registered() {
        let kp = KeyPair::generate();
        let keys = registry("ethereum", &kp);
        let ethereum = ChainId::from("ethereum");
        
        assert!(verify_if_registered(&keys, &ethereum, b"vote", &sign(&kp, b"vote")).is_ok());
        assert!(verify_if_registered(&keys, &ethereum, b"vote", &Signature::EMPTY).is_err());
        // Another chain's key does not pass for a registered one
        let other = KeyPair::generate();
        assert!(verify_if_registered(&keys, &ethereum, b"vote", &sign(&other, b"vote")).is_err());
        // Unregistered chains are not checked
        assert!(verify_if_registered(&keys, &ChainId::from("solana"), b"vote", &Signature::EMPTY).is_ok());
    }
}
