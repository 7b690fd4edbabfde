// Correlation Hashing — internal tracking keys for in-flight requests
//
// Digests here never leave the process. The backend is always called with
// the original identifier; the key only links a mixed backend completion
// back to the caller waiting for it.

use crate::cache::{CacheError, HashCache};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Length of a rendered digest (SHA-256, lowercase hex)
pub const DIGEST_HEX_LEN: usize = 64;

/// Salted SHA-256 of `input`, rendered as 64 lowercase hex characters.
///
/// The salt is applied on both sides: `salt || input || salt`.
pub fn hash(salt: &str, input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(input.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Opaque fixed-length token identifying one pending request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Wrap an already-derived digest
    pub fn from_digest(digest: String) -> Self {
        Self(digest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Derives correlation keys from client identifiers under a secret salt.
pub struct CorrelationHasher {
    salt: Zeroizing<String>,
    cache: HashCache,
}

impl CorrelationHasher {
    pub fn new(salt: &str, cache_max_size: usize, eviction_block: usize) -> Result<Self, CacheError> {
        Ok(Self {
            salt: Zeroizing::new(salt.to_string()),
            cache: HashCache::new(cache_max_size, eviction_block)?,
        })
    }

    /// Salted digest of an identifier, memoized in the hash cache
    pub fn digest(&self, input: &str) -> String {
        self.cache.get_or_compute(input, |value| hash(&self.salt, value))
    }

    /// Key for the `sequence`-th submission of `input`.
    ///
    /// Mixing the submission sequence into the digest keeps keys unique when
    /// the same identifier is in flight more than once; a duplicate key then
    /// means a digest collision or a sequence bug.
    pub fn correlation_key(&self, input: &str, sequence: u64) -> CorrelationKey {
        let identity = self.digest(input);
        CorrelationKey(hash(&self.salt, &format!("{}:{}", identity, sequence)))
    }

    pub fn cache(&self) -> &HashCache {
        &self.cache
    }

    pub fn has_salt(&self) -> bool {
        !self.salt.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_vector_without_salt() {
        // sha256("abc")
        assert_eq!(
            hash("", "abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_salt_changes_digest() {
        assert_ne!(hash("s", "user123"), hash("t", "user123"));
        assert_ne!(hash("s", "user123"), hash("", "user123"));
    }

    #[test]
    fn test_salt_wraps_both_sides() {
        assert_eq!(hash("s", "user123"), hash("", "suser123s"));
    }

    #[test]
    fn test_digest_uses_cache() {
        let hasher = CorrelationHasher::new("s", 16, 4).unwrap();
        let first = hasher.digest("user123");
        let second = hasher.digest("user123");
        assert_eq!(first, second);
        assert_eq!(first, hash("s", "user123"));
        assert_eq!(hasher.cache().len(), 1);
        assert_eq!(hasher.cache().hit_stats(), (1, 1));
    }

    #[test]
    fn test_correlation_key_unique_per_sequence() {
        let hasher = CorrelationHasher::new("s", 16, 4).unwrap();
        let a = hasher.correlation_key("user123", 1);
        let b = hasher.correlation_key("user123", 2);
        assert_ne!(a, b);
        assert_eq!(a, hasher.correlation_key("user123", 1));
        assert_eq!(a.as_str().len(), DIGEST_HEX_LEN);
    }

    #[test]
    fn test_correlation_key_is_not_identifier_digest() {
        let hasher = CorrelationHasher::new("s", 16, 4).unwrap();
        let key = hasher.correlation_key("user123", 0);
        assert_ne!(key.as_str(), hasher.digest("user123"));
        assert!(!key.as_str().contains("user123"));
    }

    #[test]
    fn test_has_salt() {
        assert!(!CorrelationHasher::new("", 4, 1).unwrap().has_salt());
        assert!(CorrelationHasher::new("pepper", 4, 1).unwrap().has_salt());
    }

    proptest! {
        #[test]
        fn prop_hash_deterministic_fixed_length_hex(salt in ".{0,16}", input in ".{0,64}") {
            let first = hash(&salt, &input);
            let second = hash(&salt, &input);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.len(), DIGEST_HEX_LEN);
            prop_assert!(first.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        }
    }
}
