//! Stable fingerprints for region signatures.

use serde::Serialize;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(FNV1A_OFFSET, bytes)
}

/// Hashes the JSON encoding of `value`.
///
/// JSON keeps the fingerprint independent of `Hash` impls, which differ across std versions and
/// are unavailable for float-carrying attributes.
pub fn hash_serializable<T: Serialize>(value: &T) -> Result<u64, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(fnv1a_hash(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_matches_reference_vector() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn serializable_hash_tracks_content() {
        let a = hash_serializable(&vec![1u32, 2, 3]).unwrap();
        let b = hash_serializable(&vec![1u32, 2, 3]).unwrap();
        let c = hash_serializable(&vec![1u32, 2, 4]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
