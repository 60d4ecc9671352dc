//! Lifecycle-managed predictor cache
//!
//! One process-wide cache keyed by head identity (never by file),
//! owned by whoever constructs it and injected into callers. All
//! mutation happens under a single lock; idle eviction is a
//! best-effort check invoked by the caller, never a background timer.
//! Handles are `Arc<Mutex<P>>`, so a caller holding a local reference
//! is unaffected by a concurrent `clear`.

use crate::models::{BackboneModel, DiscoveredModels, HeadModel};
use crate::services::inference::Predictor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cache key identity: `{head_name}::{backbone}::{head_type}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphKey {
    pub head_name: String,
    pub backbone: String,
    pub head_type: String,
}

impl GraphKey {
    pub fn for_head(head: &HeadModel) -> Self {
        Self {
            head_name: head.name.clone(),
            backbone: head.backbone.clone(),
            head_type: head.head_type.clone(),
        }
    }

    pub fn for_backbone(backbone: &BackboneModel) -> Self {
        Self {
            head_name: backbone.name.clone(),
            backbone: backbone.name.clone(),
            head_type: "embedding".to_string(),
        }
    }

    fn key(&self) -> String {
        format!("{}::{}::{}", self.head_name, self.backbone, self.head_type)
    }
}

struct CacheInner<P> {
    entries: HashMap<String, Arc<Mutex<P>>>,
    last_access: Instant,
}

/// Warm model-predictor cache.
///
/// Generic over the handle type so lifecycle behavior is testable
/// without ONNX weights on disk; production code uses the default.
pub struct PredictorCache<P = Predictor> {
    inner: Mutex<CacheInner<P>>,
    idle_timeout: Duration,
}

impl<P> PredictorCache<P> {
    /// `idle_timeout` of zero means never evict.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                last_access: Instant::now(),
            }),
            idle_timeout,
        }
    }

    /// Look up a warm handle, touching the idle timestamp on hit.
    pub fn get(&self, graph: &GraphKey) -> Option<Arc<Mutex<P>>> {
        let mut inner = self.lock();
        let hit = inner.entries.get(&graph.key()).cloned();
        if hit.is_some() {
            inner.last_access = Instant::now();
        }
        hit
    }

    /// Insert (or replace) a handle, returning it for immediate use.
    pub fn put(&self, graph: &GraphKey, predictor: P) -> Arc<Mutex<P>> {
        let handle = Arc::new(Mutex::new(predictor));
        let mut inner = self.lock();
        inner.entries.insert(graph.key(), Arc::clone(&handle));
        inner.last_access = Instant::now();
        handle
    }

    /// Clear everything if the cache has sat idle past the timeout.
    ///
    /// No-op (always false) when the timeout is zero.
    pub fn evict_if_idle(&self) -> bool {
        if self.idle_timeout.is_zero() {
            return false;
        }

        let mut inner = self.lock();
        if inner.entries.is_empty() {
            return false;
        }
        if inner.last_access.elapsed() <= self.idle_timeout {
            return false;
        }

        let count = inner.entries.len();
        inner.entries.clear();
        debug!(count, "Predictor cache evicted after idle timeout");
        true
    }

    /// Drop every entry, releasing model memory. Returns the count.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn backdate_last_access(&self, age: Duration) {
        self.lock().last_access = Instant::now() - age;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner<P>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PredictorCache<Predictor> {
    /// Best-effort load of every discovered backbone and head.
    ///
    /// A single unloadable entry (missing weights, `.pb` stem, corrupt
    /// file) must not abort the rest; it is logged and skipped.
    /// Returns the number actually loaded.
    pub fn warmup(&self, models: &DiscoveredModels) -> usize {
        let discovered = models.backbones.len() + models.heads.len();
        let mut loaded = 0usize;

        for backbone in models.backbones.values() {
            match Predictor::load(
                &backbone.weights_path,
                &backbone.input_name,
                &backbone.output_name,
            ) {
                Ok(predictor) => {
                    self.put(&GraphKey::for_backbone(backbone), predictor);
                    loaded += 1;
                }
                Err(e) => warn!(
                    backbone = %backbone.name,
                    weights = %backbone.weights_path.display(),
                    error = %e,
                    "Backbone warmup failed; continuing"
                ),
            }
        }

        for head in &models.heads {
            match Predictor::load(&head.weights_path, &head.input_name, &head.output_name) {
                Ok(predictor) => {
                    self.put(&GraphKey::for_head(head), predictor);
                    loaded += 1;
                }
                Err(e) => warn!(
                    head = %head.name,
                    weights = %head.weights_path.display(),
                    error = %e,
                    "Head warmup failed; continuing"
                ),
            }
        }

        info!(loaded, discovered, "Predictor warmup complete");
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> GraphKey {
        GraphKey {
            head_name: name.to_string(),
            backbone: "effnet".to_string(),
            head_type: "mood".to_string(),
        }
    }

    #[test]
    fn test_key_format() {
        assert_eq!(key("mood_happy").key(), "mood_happy::effnet::mood");
    }

    #[test]
    fn test_get_missing_is_none() {
        let cache: PredictorCache<u32> = PredictorCache::new(Duration::from_secs(60));
        assert!(cache.get(&key("absent")).is_none());
    }

    #[test]
    fn test_put_then_get() {
        let cache: PredictorCache<u32> = PredictorCache::new(Duration::from_secs(60));
        cache.put(&key("mood_happy"), 7);

        let handle = cache.get(&key("mood_happy")).unwrap();
        assert_eq!(*handle.lock().unwrap(), 7);
    }

    #[test]
    fn test_idle_eviction_clears_all_entries() {
        let cache: PredictorCache<u32> = PredictorCache::new(Duration::from_secs(1));
        cache.put(&key("mood_happy"), 1);
        cache.put(&key("mood_sad"), 2);

        cache.backdate_last_access(Duration::from_secs(5));
        assert!(cache.evict_if_idle());

        assert!(cache.get(&key("mood_happy")).is_none());
        assert!(cache.get(&key("mood_sad")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_not_idle_long_enough_keeps_entries() {
        let cache: PredictorCache<u32> = PredictorCache::new(Duration::from_secs(3600));
        cache.put(&key("mood_happy"), 1);

        assert!(!cache.evict_if_idle());
        assert!(cache.get(&key("mood_happy")).is_some());
    }

    #[test]
    fn test_zero_timeout_never_evicts() {
        let cache: PredictorCache<u32> = PredictorCache::new(Duration::ZERO);
        cache.put(&key("mood_happy"), 1);
        cache.backdate_last_access(Duration::from_secs(86_400));

        assert!(!cache.evict_if_idle());
        assert!(cache.get(&key("mood_happy")).is_some());
    }

    #[test]
    fn test_get_touches_idle_clock() {
        let cache: PredictorCache<u32> = PredictorCache::new(Duration::from_secs(2));
        cache.put(&key("mood_happy"), 1);
        cache.backdate_last_access(Duration::from_secs(10));

        // A hit resets the clock, so the follow-up check sees a warm cache
        let _ = cache.get(&key("mood_happy")).unwrap();
        assert!(!cache.evict_if_idle());
    }

    #[test]
    fn test_clear_counts_entries() {
        let cache: PredictorCache<u32> = PredictorCache::new(Duration::from_secs(60));
        cache.put(&key("a"), 1);
        cache.put(&key("b"), 2);

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.clear(), 0);
    }

    #[test]
    fn test_captured_handle_survives_clear() {
        let cache: PredictorCache<u32> = PredictorCache::new(Duration::from_secs(60));
        cache.put(&key("mood_happy"), 42);

        let handle = cache.get(&key("mood_happy")).unwrap();
        cache.clear();

        // In-flight reference is unaffected by the scrub
        assert_eq!(*handle.lock().unwrap(), 42);
    }
}
