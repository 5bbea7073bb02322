//! Bounded LRU cache mapping an observed `kid` to its validation key.
//!
//! Capacity is fixed at 1000 entries per the specification; eviction is strict
//! LRU, and a successful `get` counts as a use. Thread-safe for concurrent
//! readers and writers — every upbridge shares one instance.

use std::num::NonZeroUsize;

use bridge_keys::ValidationKey;
use lru::LruCache;
use parking_lot::Mutex;

const CAPACITY: usize = 1000;

pub struct KeyCache {
    inner: Mutex<LruCache<String, ValidationKey>>,
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(CAPACITY).expect("capacity is nonzero"))),
        }
    }

    /// Look up `kid`, promoting it to most-recently-used on a hit.
    pub fn get(&self, kid: &str) -> Option<ValidationKey> {
        self.inner.lock().get(kid).cloned()
    }

    /// Insert or overwrite the entry for `kid`. The cache key is the *observed*
    /// `kid` (from the JWS header or the resolver request), not necessarily the
    /// `kid` embedded in the JWK itself — the two may legitimately mismatch,
    /// which callers log but do not treat as fatal.
    pub fn put(&self, kid: impl Into<String>, key: ValidationKey) {
        self.inner.lock().put(kid.into(), key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dummy_key(x_seed: u8) -> ValidationKey {
        use base64::Engine as _;
        let seed = [x_seed; 32];
        let public = picky::key::ed25519_public_from_private(&seed).unwrap();
        let x = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(public);
        bridge_keys::parse_validation(format!(r#"{{"kty":"OKP","crv":"Ed25519","x":"{x}"}}"#).as_bytes()).unwrap()
    }

    #[test]
    fn overwrites_existing_entry_for_same_kid() {
        let cache = KeyCache::new();
        cache.put("k1", dummy_key(1));
        cache.put("k1", dummy_key(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_least_recently_used_beyond_capacity() {
        let cache = KeyCache::new();
        for i in 0..CAPACITY {
            cache.put(format!("k{i}"), dummy_key((i % 250) as u8));
        }
        assert_eq!(cache.len(), CAPACITY);

        // Touch k0 so it is no longer the least-recently-used entry.
        assert!(cache.get("k0").is_some());

        cache.put("overflow", dummy_key(1));
        assert_eq!(cache.len(), CAPACITY);
        assert!(cache.get("k0").is_some());
        assert!(cache.get("k1").is_none());
    }

    #[test]
    fn miss_returns_none() {
        let cache = KeyCache::new();
        assert!(cache.get("missing").is_none());
    }
}
