//! Concordia Cryptography Module
//! 
//! Provides cryptographic primitives using standard, audited algorithms:
//! - Ed25519 for participant signatures
//! - BLAKE3 for hashing
//! - BLS12-381 threshold signatures for finalizing decisions

pub mod keys;
pub mod signing;
pub mod hashing;
pub mod threshold;

pub use keys::*;
pub use signing::*;
pub use hashing::*;
pub use threshold::*;
