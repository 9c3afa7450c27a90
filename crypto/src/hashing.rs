//! BLAKE3 hashing with domain-separated helpers

use concordia_core::Hash;

/// BLAKE3 digest of `data`
pub fn hash(data: &[u8]) -> Hash {
    Hash::from_bytes(*blake3::hash(data).as_bytes())
}

/// Hash multiple pieces of data.
///
/// Each part is length-prefixed so that `["ab", "c"]` and `["a", "bc"]`
/// hash differently.
pub fn hash_multiple(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let hash = hasher.finalize();
    Hash::from_bytes(*hash.as_bytes())
}

/// Hash of a consensus value, used to match votes on the same value
pub fn value_hash(value: &[u8]) -> Hash {
    hash_multiple(&[b"CONCORDIA_VALUE", value])
}
