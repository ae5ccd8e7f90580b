//! Bounded, content-addressed embedding cache with single-flight computation.

use crate::error::VisionError;
use crate::models::Embedding;
use image::RgbImage;
use lru::LruCache;
use maskwork_core::{DatasetId, ImageId, SessionId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

const PURPOSE_EMBED: &str = "embed";
const FINGERPRINT_PREFIX_LEN: usize = 16;

/// `{scope}:{owner}:{image}:{fingerprint16}:{purpose}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_session(session: &SessionId, fingerprint: &str) -> Self {
        Self::compose("session", session.as_str(), "image", fingerprint)
    }

    pub fn for_dataset_image(dataset: &DatasetId, image: &ImageId, fingerprint: &str) -> Self {
        Self::compose("dataset", dataset.as_str(), image.as_str(), fingerprint)
    }

    /// Prefix shared by every key owned by `session`
    pub fn session_prefix(session: &SessionId) -> String {
        format!("session:{}:", session.as_str())
    }

    pub fn dataset_prefix(dataset: &DatasetId) -> String {
        format!("dataset:{}:", dataset.as_str())
    }

    fn compose(scope: &str, owner: &str, image: &str, fingerprint: &str) -> Self {
        let short = fingerprint
            .get(..FINGERPRINT_PREFIX_LEN)
            .unwrap_or(fingerprint);
        Self(format!("{}:{}:{}:{}:{}", scope, owner, image, short, PURPOSE_EMBED))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

type Flight = Arc<OnceLock<Result<Arc<Embedding>, String>>>;

pub struct EmbeddingCache {
    entries: Mutex<LruCache<CacheKey, Arc<Embedding>>>,
    inflight: Mutex<HashMap<CacheKey, Flight>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Lookup that refreshes recency
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Embedding>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, value: Arc<Embedding>) {
        let evicted = self.entries.lock().push(key.clone(), value);
        if let Some((old_key, _)) = evicted {
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("maskwork_embedding_cache_evictions_total").increment(1);
                debug!("Evicted embedding {}", old_key);
            }
        }
    }

    /// Return the cached embedding for `key`, computing it from `image` on a miss.
    ///
    /// Concurrent callers for the same key share one computation. A hit never
    /// calls `compute` or reads the image. Failures are not cached.
    pub fn get_or_compute<F>(
        &self,
        key: &CacheKey,
        image: &RgbImage,
        compute: F,
    ) -> Result<Arc<Embedding>, VisionError>
    where
        F: FnOnce(&RgbImage) -> Result<Embedding, VisionError>,
    {
        if let Some(hit) = self.get(key) {
            self.record_hit();
            return Ok(hit);
        }

        let flight = self
            .inflight
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceLock::new()))
            .clone();

        let mut computed_here = false;
        let outcome = flight
            .get_or_init(|| {
                computed_here = true;
                // another flight may have finished between our miss and now
                if let Some(existing) = self.get(key) {
                    return Ok(existing);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("maskwork_embedding_cache_misses_total").increment(1);
                debug!("Computing embedding for {}", key);
                let embedding = Arc::new(compute(image).map_err(|e| e.to_string())?);
                self.insert(key.clone(), embedding.clone());
                Ok(embedding)
            })
            .clone();

        {
            let mut inflight = self.inflight.lock();
            if inflight.get(key).map_or(false, |current| Arc::ptr_eq(current, &flight)) {
                inflight.remove(key);
            }
        }

        if !computed_here && outcome.is_ok() {
            self.record_hit();
        }
        outcome.map_err(VisionError::Model)
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("maskwork_embedding_cache_hits_total").increment(1);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains(key)
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Drop every entry whose key starts with `prefix`; returns how many went
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock();
        let doomed: Vec<CacheKey> = entries
            .iter()
            .filter(|(k, _)| k.as_str().starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            entries: entries.len(),
            capacity: entries.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn embedding(v: f32) -> Embedding {
        Embedding::new(vec![1], vec![v]).unwrap()
    }

    fn key(n: u32) -> CacheKey {
        CacheKey::for_session(&SessionId::from(format!("s{}", n)), "0123456789abcdef0123")
    }

    #[test]
    fn test_key_format() {
        let k = CacheKey::for_dataset_image(
            &DatasetId::from("d1"),
            &ImageId::from("i1"),
            "0123456789abcdef99999",
        );
        assert_eq!(k.as_str(), "dataset:d1:i1:0123456789abcdef:embed");
        let s = CacheKey::for_session(&SessionId::from("s1"), "abc");
        assert_eq!(s.as_str(), "session:s1:image:abc:embed");
        assert!(s.as_str().starts_with(&CacheKey::session_prefix(&SessionId::from("s1"))));
    }

    #[test]
    fn test_hit_skips_compute() {
        let cache = EmbeddingCache::new(4);
        let image = RgbImage::new(1, 1);
        let calls = AtomicUsize::new(0);
        let compute = |_: &RgbImage| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(embedding(1.0))
        };
        let a = cache.get_or_compute(&key(1), &image, compute).unwrap();
        let b = cache
            .get_or_compute(&key(1), &image, |_| panic!("must not recompute"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_lru_eviction_bound() {
        let cache = EmbeddingCache::new(2);
        cache.insert(key(1), Arc::new(embedding(1.0)));
        cache.insert(key(2), Arc::new(embedding(2.0)));
        cache.get(&key(1));
        cache.insert(key(3), Arc::new(embedding(3.0)));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_failure_not_cached() {
        let cache = EmbeddingCache::new(2);
        let image = RgbImage::new(1, 1);
        let err = cache.get_or_compute(&key(1), &image, |_| Err(VisionError::Model("boom".into())));
        assert!(err.is_err());
        assert!(cache.is_empty());
        assert!(cache.get_or_compute(&key(1), &image, |_| Ok(embedding(1.0))).is_ok());
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = EmbeddingCache::new(8);
        let s1 = SessionId::from("s1");
        cache.insert(CacheKey::for_session(&s1, "aaaa"), Arc::new(embedding(1.0)));
        cache.insert(key(2), Arc::new(embedding(2.0)));
        assert_eq!(cache.invalidate_prefix(&CacheKey::session_prefix(&s1)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_floor() {
        assert_eq!(EmbeddingCache::new(0).stats().capacity, 1);
    }
}
