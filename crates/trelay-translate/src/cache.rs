use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Bounded key→value store with per-entry TTL and LRU eviction.
///
/// Process-global and shared by every relay handler; one mutex guards the
/// whole map, which is ample at the default capacity of 1000.
pub struct TranslationCache {
    inner: Mutex<CacheInner>,
    max_size: usize,
    ttl: Duration,
}

struct CacheInner {
    map: HashMap<String, Entry>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

struct Entry {
    value: String,
    expires_at: Instant,
    touched: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total: u64,
    pub hit_rate: f64,
}

impl TranslationCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                tick: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_size: max_size.max(1),
            ttl,
        }
    }

    /// Cache key: `trans:` + first 16 hex chars of
    /// SHA-256("source:target:text").
    pub fn key(source: &str, target: &str, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update(b":");
        hasher.update(target.as_bytes());
        hasher.update(b":");
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest
            .iter()
            .take(8)
            .map(|byte| format!("{byte:02x}"))
            .collect();
        format!("trans:{hex}")
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tick += 1;
        let tick = inner.tick;
        let now = Instant::now();

        let hit = match inner.map.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.touched = tick;
                Some(entry.value.clone())
            }
            Some(_) => {
                inner.map.remove(key);
                None
            }
            None => None,
        };

        match hit {
            Some(value) => {
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, key: &str, value: String) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tick += 1;
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
            touched: inner.tick,
        };
        inner.map.insert(key.to_string(), entry);

        while inner.map.len() > self.max_size {
            let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            inner.map.remove(&oldest);
            inner.evictions += 1;
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.map.len(),
            max_size: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            total,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
        }
    }
}
