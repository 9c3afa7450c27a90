//! t-of-n BLS threshold signatures over BLS12-381.
//!
//! A trusted dealer samples a random polynomial of degree `t - 1` and hands
//! share `i` the evaluation `f(i)`. Each share holder signs `H(m)` in G2 with
//! its share; any `t` partial signatures interpolate (in the exponent) to
//! `f(0) * H(m)`, which verifies against the single group key `f(0) * G1`.
//! Fewer than `t` partials never combine.

use blstrs::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use concordia_core::{ConcordiaError, ConcordiaResult, Hash};
use ff::Field;
use group::{Curve, Group};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::BTreeMap;
use std::fmt;

use crate::hashing::hash;

/// Domain separation tag for hashing messages to G2
pub const SIGNATURE_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// One participant's share of the group signing key
#[derive(Clone)]
pub struct KeyShare {
    index: u64,
    secret: Scalar,
    public: G1Affine,
}

impl KeyShare {
    /// 1-based share index (the polynomial evaluation point)
    pub fn index(&self) -> u64 {
        self.index
    }
    
    /// Public key of this share, `f(i) * G1`
    pub fn public_key(&self) -> G1Affine {
        self.public
    }
}

impl Drop for KeyShare {
    fn drop(&mut self) {
        self.secret = Scalar::ZERO;
    }
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyShare(index={})", self.index)
    }
}

/// Group public key every combined signature verifies against
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupPublicKey(G1Affine);

impl GroupPublicKey {
    pub fn to_bytes(&self) -> [u8; 48] {
        self.0.to_compressed()
    }
    
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

/// Output of the dealer: `total` shares, any `threshold` of which can sign
pub struct ThresholdKeySet {
    threshold: usize,
    total: usize,
    group_key: GroupPublicKey,
    shares: Vec<KeyShare>,
}

impl ThresholdKeySet {
    pub fn threshold(&self) -> usize {
        self.threshold
    }
    
    pub fn total(&self) -> usize {
        self.total
    }
    
    pub fn group_key(&self) -> GroupPublicKey {
        self.group_key
    }
    
    pub fn shares(&self) -> &[KeyShare] {
        &self.shares
    }
    
    /// Share at 1-based index
    pub fn share(&self, index: u64) -> Option<&KeyShare> {
        self.shares.iter().find(|s| s.index == index)
    }
}

impl fmt::Debug for ThresholdKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdKeySet")
            .field("threshold", &self.threshold)
            .field("total", &self.total)
            .field("group_key", &self.group_key.to_hex())
            .finish()
    }
}

/// A share holder's signature on one message
#[derive(Clone, Debug)]
pub struct PartialSignature {
    pub index: u64,
    /// Hash of the signed message, used to refuse mixing messages
    pub message_hash: Hash,
    point: G2Affine,
}

/// Combined signature, verifiable with the group key alone
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThresholdSignature {
    pub message_hash: Hash,
    point: G2Affine,
}

impl ThresholdSignature {
    pub fn to_bytes(&self) -> [u8; 96] {
        self.point.to_compressed()
    }
    
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

/// Generate `total` key shares with reconstruction threshold `threshold`
pub fn generate_shares(threshold: usize, total: usize) -> ConcordiaResult<ThresholdKeySet> {
    generate_shares_with_rng(threshold, total, &mut OsRng)
}

/// Generate key shares from a caller-supplied RNG
pub fn generate_shares_with_rng<R: RngCore>(
    threshold: usize,
    total: usize,
    rng: &mut R,
) -> ConcordiaResult<ThresholdKeySet> {
    if threshold == 0 || threshold > total {
        return Err(ConcordiaError::Validation(format!(
            "threshold must be in 1..={}, got {}",
            total, threshold
        )));
    }
    
    let mut coefficients: Vec<Scalar> = (0..threshold).map(|_| Scalar::random(&mut *rng)).collect();
    let generator = G1Projective::generator();
    
    let group_key = GroupPublicKey((generator * coefficients[0]).to_affine());
    let shares = (1..=total as u64)
        .map(|index| {
            let secret = evaluate_polynomial(&coefficients, index);
            KeyShare {
                index,
                secret,
                public: (generator * secret).to_affine(),
            }
        })
        .collect();
    
    coefficients.iter_mut().for_each(|c| *c = Scalar::ZERO);
    
    Ok(ThresholdKeySet {
        threshold,
        total,
        group_key,
        shares,
    })
}

/// Sign a message with one key share
pub fn partial_sign(message: &[u8], share: &KeyShare) -> PartialSignature {
    let point = (hash_to_g2(message) * share.secret).to_affine();
    PartialSignature {
        index: share.index,
        message_hash: hash(message),
        point,
    }
}

/// Check a single partial signature against its share's public key
pub fn verify_partial(partial: &PartialSignature, message: &[u8], share_public: &G1Affine) -> bool {
    partial.message_hash == hash(message)
        && pairing_check(&partial.point, message, share_public)
}

/// Combine partial signatures into one group signature.
///
/// Partials are deduplicated by index and the `threshold` lowest indices are
/// interpolated, so the same input set always yields the same signature.
pub fn combine_partials(
    partials: &[PartialSignature],
    threshold: usize,
) -> ConcordiaResult<ThresholdSignature> {
    if threshold == 0 {
        return Err(ConcordiaError::Validation("threshold must be positive".into()));
    }
    
    let message_hash = match partials.first() {
        Some(p) => p.message_hash,
        None => {
            return Err(ConcordiaError::InsufficientShares {
                required: threshold,
                provided: 0,
            })
        }
    };
    
    let mut by_index: BTreeMap<u64, &PartialSignature> = BTreeMap::new();
    for partial in partials {
        if partial.message_hash != message_hash {
            return Err(ConcordiaError::Validation(
                "partial signatures cover different messages".into(),
            ));
        }
        if partial.index == 0 {
            return Err(ConcordiaError::Validation("share index 0 is reserved".into()));
        }
        by_index.entry(partial.index).or_insert(partial);
    }
    
    if by_index.len() < threshold {
        return Err(ConcordiaError::InsufficientShares {
            required: threshold,
            provided: by_index.len(),
        });
    }
    
    let selected: Vec<&PartialSignature> = by_index.into_values().take(threshold).collect();
    let indices: Vec<u64> = selected.iter().map(|p| p.index).collect();
    
    let mut combined = G2Projective::identity();
    for partial in &selected {
        let lambda = lagrange_at_zero(partial.index, &indices)?;
        combined += G2Projective::from(partial.point) * lambda;
    }
    
    Ok(ThresholdSignature {
        message_hash,
        point: combined.to_affine(),
    })
}

/// Verify a combined signature against the group key
pub fn verify_threshold_signature(
    signature: &ThresholdSignature,
    message: &[u8],
    group_key: &GroupPublicKey,
) -> bool {
    signature.message_hash == hash(message) && pairing_check(&signature.point, message, &group_key.0)
}

fn hash_to_g2(message: &[u8]) -> G2Projective {
    G2Projective::hash_to_curve(message, SIGNATURE_DST, &[])
}

/// e(G1, sig) == e(pk, H(m))
fn pairing_check(signature: &G2Affine, message: &[u8], public_key: &G1Affine) -> bool {
    let generator = G1Projective::generator().to_affine();
    let hashed = hash_to_g2(message).to_affine();
    pairing(&generator, signature) == pairing(public_key, &hashed)
}

fn evaluate_polynomial(coefficients: &[Scalar], x: u64) -> Scalar {
    let x = Scalar::from(x);
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coefficient| acc * x + *coefficient)
}

/// Lagrange basis polynomial for `index` over `indices`, evaluated at zero
fn lagrange_at_zero(index: u64, indices: &[u64]) -> ConcordiaResult<Scalar> {
    let xi = Scalar::from(index);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    
    for &other in indices.iter().filter(|&&j| j != index) {
        let xj = Scalar::from(other);
        numerator *= xj;
        denominator *= xj - xi;
    }
    
    let inverse: Option<Scalar> = denominator.invert().into();
    inverse
        .map(|inv| numerator * inv)
        .ok_or_else(|| ConcordiaError::Internal("duplicate share index in interpolation".into()))
}
