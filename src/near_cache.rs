use moka::sync::Cache;

/// A bounded, local negative cache of bucket keys already known to be over
/// limit, consulted before any backend call. Values are absolute
/// unix-second deadlines (not TTLs), so repeated reads never drift.
/// `get` treats an entry whose stored expiry is `<= now` as a miss —
/// strictly, not relying on moka's own (eventually-consistent) background
/// eviction, since spec correctness depends on that boundary being exact.
pub trait LocalCache: Send + Sync {
    fn get(&self, key: &str, now: i64) -> bool;
    fn set(&self, key: &str, expiry_unix_seconds: i64);
}

/// A [`LocalCache`] backed by `moka`. `local_cache_size_bytes == 0`
/// disables the cache (every lookup a miss, every set a no-op), matching
/// spec §6.
pub struct MokaLocalCache {
    cache: Option<Cache<String, i64>>,
}

impl MokaLocalCache {
    pub fn new(capacity_entries: u64) -> Self {
        if capacity_entries == 0 {
            return Self { cache: None };
        }
        Self {
            cache: Some(Cache::builder().max_capacity(capacity_entries).build()),
        }
    }
}

impl LocalCache for MokaLocalCache {
    fn get(&self, key: &str, now: i64) -> bool {
        match &self.cache {
            None => false,
            Some(cache) => match cache.get(key) {
                Some(expiry) => expiry > now,
                None => false,
            },
        }
    }

    fn set(&self, key: &str, expiry_unix_seconds: i64) {
        if let Some(cache) = &self.cache {
            cache.insert(key.to_string(), expiry_unix_seconds);
        }
    }
}
