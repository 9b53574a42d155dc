use crate::models::{DocType, MappingSuggestion};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Optional second-level store (e.g. a shared cache service) the local map mirrors into.
///
/// Implementations must be best-effort: failures are swallowed and logged by the caller.
pub trait CacheMirror: Send + Sync {
    fn get(&self, key: &str) -> Option<MappingSuggestion>;
    fn set(&self, key: &str, suggestion: &MappingSuggestion, ttl: Duration);
}

struct Entry {
    suggestion: MappingSuggestion,
    stored_at: Instant,
}

/// Content-addressed suggestion cache keyed by header set, doc type and tenant.
///
/// Readers share the lock; writers replace whole entries (last writer wins).
pub struct MappingCache {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
    mirror: Option<Arc<dyn CacheMirror>>,
}

/// Stable key: SHA-256 over sorted headers, doc type and tenant.
///
/// Every part is length-prefixed, so header text cannot forge a boundary.
pub fn cache_key(headers: &[String], doc_type: DocType, tenant_id: &str) -> String {
    let mut sorted: Vec<&str> = headers.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update((sorted.len() as u64).to_le_bytes());
    for part in sorted
        .into_iter()
        .chain([doc_type.as_str(), tenant_id])
    {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

impl MappingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn CacheMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn get(&self, key: &str) -> Option<MappingSuggestion> {
        let local = self.entries.read().ok().and_then(|guard| {
            guard
                .get(key)
                .filter(|e| e.stored_at.elapsed() < self.ttl)
                .map(|e| e.suggestion.clone())
        });
        if local.is_some() {
            return local;
        }
        let mirrored = self.mirror.as_ref()?.get(key)?;
        // Warm the local map from the mirror.
        self.put_local(key, mirrored.clone());
        Some(mirrored)
    }

    pub fn set(&self, key: &str, suggestion: MappingSuggestion) {
        if let Some(mirror) = &self.mirror {
            mirror.set(key, &suggestion, self.ttl);
        }
        self.put_local(key, suggestion);
    }

    fn put_local(&self, key: &str, suggestion: MappingSuggestion) {
        if let Ok(mut guard) = self.entries.write() {
            guard.insert(
                key.to_string(),
                Entry {
                    suggestion,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Ok(mut guard) = self.entries.write() {
            guard.remove(key);
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut guard) = self.entries.write() else {
            return 0;
        };
        let before = guard.len();
        guard.retain(|_, e| e.stored_at.elapsed() < self.ttl);
        before - guard.len()
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.entries.write() {
            guard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MappingProvider;
    use std::sync::Mutex;

    fn suggestion() -> MappingSuggestion {
        let mut s = MappingSuggestion::empty(DocType::Product, MappingProvider::Heuristics);
        s.mappings.insert("SKU".into(), "product.sku".into());
        s.confidence = 1.0;
        s
    }

    #[test]
    fn key_ignores_header_order_but_not_tenant() {
        let a = vec!["SKU".to_string(), "Precio".to_string()];
        let b = vec!["Precio".to_string(), "SKU".to_string()];
        assert_eq!(
            cache_key(&a, DocType::Product, "t1"),
            cache_key(&b, DocType::Product, "t1")
        );
        assert_ne!(
            cache_key(&a, DocType::Product, "t1"),
            cache_key(&a, DocType::Product, "t2")
        );
        assert_ne!(
            cache_key(&a, DocType::Product, "t1"),
            cache_key(&a, DocType::Invoice, "t1")
        );
    }

    #[test]
    fn separators_inside_headers_do_not_collide() {
        let joined = vec!["a|b".to_string()];
        let split = vec!["a".to_string(), "b".to_string()];
        assert_ne!(
            cache_key(&joined, DocType::Product, "t1"),
            cache_key(&split, DocType::Product, "t1")
        );
        assert_ne!(
            cache_key(&["x#product".to_string()], DocType::Product, "t1"),
            cache_key(&["x".to_string(), "product".to_string()], DocType::Product, "t1")
        );
        assert_ne!(
            cache_key(&[], DocType::Product, "t1"),
            cache_key(&[String::new()], DocType::Product, "t1")
        );
    }

    #[test]
    fn set_get_and_expire() {
        let cache = MappingCache::new(Duration::from_secs(60));
        assert!(cache.get("k").is_none());
        cache.set("k", suggestion());
        assert_eq!(cache.get("k"), Some(suggestion()));
        cache.invalidate("k");
        assert!(cache.is_empty());

        let short = MappingCache::new(Duration::from_millis(0));
        short.set("k", suggestion());
        assert!(short.get("k").is_none());
        assert_eq!(short.purge_expired(), 1);
    }

    #[derive(Default)]
    struct RecordingMirror {
        store: Mutex<HashMap<String, MappingSuggestion>>,
    }

    impl CacheMirror for RecordingMirror {
        fn get(&self, key: &str) -> Option<MappingSuggestion> {
            self.store.lock().unwrap().get(key).cloned()
        }
        fn set(&self, key: &str, suggestion: &MappingSuggestion, _ttl: Duration) {
            self.store
                .lock()
                .unwrap()
                .insert(key.to_string(), suggestion.clone());
        }
    }

    #[test]
    fn mirror_is_written_and_read_through() {
        let mirror = Arc::new(RecordingMirror::default());
        let cache = MappingCache::new(Duration::from_secs(60)).with_mirror(mirror.clone());
        cache.set("k", suggestion());
        assert!(mirror.store.lock().unwrap().contains_key("k"));

        // A second process sharing the mirror sees the entry.
        let other = MappingCache::new(Duration::from_secs(60)).with_mirror(mirror);
        assert_eq!(other.get("k"), Some(suggestion()));
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn concurrent_writers_leave_a_readable_entry() {
        let cache = Arc::new(MappingCache::new(Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let mut s = suggestion();
                    s.confidence = i as f64 / 10.0;
                    cache.set("shared", s);
                    cache.get("shared").is_some()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert!(cache.get("shared").is_some());
    }
}
