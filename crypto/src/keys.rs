//! Key management for Concordia participants

use concordia_core::{ChainId, ConcordiaError, ConcordiaResult, PublicKey};
use dashmap::DashMap;
use ed25519_dalek::{
    SigningKey as Ed25519SigningKey,
    VerifyingKey as Ed25519VerifyingKey,
    SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// A keypair for signing and verification
#[derive(Clone)]
pub struct KeyPair {
    signing_key: Ed25519SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = Ed25519SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }
    
    /// Create keypair from seed bytes
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = Ed25519SigningKey::from_bytes(seed);
        Self { signing_key }
    }
    
    /// Create keypair from secret key bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> ConcordiaResult<Self> {
        if bytes.len() != SECRET_KEY_LENGTH {
            return Err(ConcordiaError::Validation(format!(
                "secret key must be {} bytes, got {}",
                SECRET_KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(bytes);
        Ok(Self::from_seed(&seed))
    }
    
    /// Get the public key
    pub fn public_key(&self) -> PublicKey {
        let verifying_key = self.signing_key.verifying_key();
        PublicKey::from_bytes(verifying_key.to_bytes())
    }
    
    /// Get the internal signing key for signing operations
    pub(crate) fn signing_key(&self) -> &Ed25519SigningKey {
        &self.signing_key
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({:?})", self.public_key())
    }
}

/// Convert our PublicKey type to Ed25519 verifying key
pub fn public_key_to_ed25519(key: &PublicKey) -> ConcordiaResult<Ed25519VerifyingKey> {
    Ed25519VerifyingKey::from_bytes(key.as_bytes())
        .map_err(|_| ConcordiaError::InvalidPublicKey)
}

/// Known participant public keys, keyed by chain
#[derive(Debug, Default)]
pub struct KeyRegistry {
    keys: DashMap<ChainId, PublicKey>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    
    pub fn register(&self, chain: ChainId, key: PublicKey) {
        self.keys.insert(chain, key);
    }
    
    pub fn get(&self, chain: &ChainId) -> Option<PublicKey> {
        self.keys.get(chain).map(|k| *k)
    }
    
    pub fn remove(&self, chain: &ChainId) {
        self.keys.remove(chain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_keypair_from_seed() {
        let seed = [42u8; 32];
        let kp1 = KeyPair::from_seed(&seed);
        let kp2 = KeyPair::from_seed(&seed);
        
        assert_eq!(kp1.public_key(), kp2.public_key());
        assert_ne!(kp1.public_key(), KeyPair::generate().public_key());
    }
    
    #[test]
    fn test_secret_bytes_length() {
        assert!(KeyPair::from_secret_bytes(&[1u8; 31]).is_err());
        assert!(KeyPair::from_secret_bytes(&[1u8; 32]).is_ok());
    }
    
    #[test]
    fn test_key_registry() {
        let registry = KeyRegistry::new();
        let kp = KeyPair::generate();
        let chain = ChainId::from("polygon");
        
        registry.register(chain.clone(), kp.public_key());
        assert_eq!(registry.get(&chain), Some(kp.public_key()));
        
        registry.remove(&chain);
        assert!(registry.get(&chain).is_none());
    }
}
