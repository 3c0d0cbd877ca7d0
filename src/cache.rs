//! The Cache (C4): fingerprint-keyed, TTL-bounded, size-bounded memoisation
//! of completed responses (`spec.md` §4.4).

use crate::request::Response;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CacheEntry {
    response: Response,
    created_at: Instant,
    expires_at: Instant,
    access_count: u64,
    size_bytes: u64,
}

/// `spec.md` §4.4 `stats()` shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_requests as f64
        }
    }
}

/// In-memory response cache, bounded by entry count and (optionally) total
/// estimated bytes. Write-through persistence to the store is the
/// dispatcher's responsibility — the cache itself only tracks the
/// authoritative in-memory map for the lifetime of one run.
pub struct Cache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_entries: usize,
    max_bytes: u64,
    default_ttl: Duration,
    total_requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Cache {
    pub fn new(max_entries: usize, max_bytes: u64, default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
            max_bytes,
            default_ttl,
            total_requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// `spec.md` §4.4 "Read path". Returns `None` on miss; on hit, returns a
    /// clone with `cacheHit = true` and increments the entry's access counter.
    pub async fn get(&self, fingerprint: &str) -> Option<Response> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        // Fast path under a read lock; expired entries are pruned separately
        // under a write lock so a hot read path never blocks on eviction.
        {
            let entries = self.entries.read().await;
            match entries.get(fingerprint) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    let response = entry.response.clone();
                    drop(entries);
                    self.bump_access_count(fingerprint).await;
                    return Some(response.as_cache_hit(0));
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Present but expired: remove it and report a miss.
        let mut entries = self.entries.write().await;
        entries.remove(fingerprint);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn bump_access_count(&self, fingerprint: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(fingerprint) {
            entry.access_count += 1;
        }
    }

    /// `spec.md` §4.4 "Write path". Evicts before inserting if bounds would
    /// otherwise be exceeded.
    pub async fn put(&self, fingerprint: String, response: Response, ttl: Option<Duration>) {
        let size_bytes = estimate_size(&response);
        let now = Instant::now();
        let entry = CacheEntry {
            response,
            created_at: now,
            expires_at: now + ttl.unwrap_or(self.default_ttl),
            access_count: 0,
            size_bytes,
        };

        let mut entries = self.entries.write().await;
        if entries.len() + 1 > self.max_entries {
            evict_oldest_quarter(&mut entries);
        }
        if self.max_bytes > 0 {
            let mut total: u64 = entries.values().map(|e| e.size_bytes).sum::<u64>() + size_bytes;
            if total > self.max_bytes {
                evict_by_access_then_age(&mut entries, total - self.max_bytes);
                total = entries.values().map(|e| e.size_bytes).sum::<u64>() + size_bytes;
                let _ = total;
            }
        }
        entries.insert(fingerprint, entry);
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        CacheStats {
            entries: entries.len(),
            bytes: entries.values().map(|e| e.size_bytes).sum(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn estimate_size(response: &Response) -> u64 {
    serde_json::to_vec(response).map(|b| b.len() as u64).unwrap_or(0)
}

/// Evict the oldest 25% by `createdAt` in a single pass, per `spec.md` §4.4.
fn evict_oldest_quarter(entries: &mut HashMap<String, CacheEntry>) {
    let evict_count = (entries.len() / 4).max(1);
    let mut by_age: Vec<(String, Instant)> = entries
        .iter()
        .map(|(k, v)| (k.clone(), v.created_at))
        .collect();
    by_age.sort_by_key(|(_, created_at)| *created_at);
    for (key, _) in by_age.into_iter().take(evict_count) {
        entries.remove(&key);
    }
}

/// Evict ascending by `(accessCount, createdAt)` until at least `need_to_free`
/// bytes have been reclaimed, per `spec.md` §4.4's byte-bound write path.
fn evict_by_access_then_age(entries: &mut HashMap<String, CacheEntry>, need_to_free: u64) {
    let mut by_access: Vec<(String, u64, Instant, u64)> = entries
        .iter()
        .map(|(k, v)| (k.clone(), v.access_count, v.created_at, v.size_bytes))
        .collect();
    by_access.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

    let mut freed = 0u64;
    for (key, _, _, size_bytes) in by_access {
        if freed >= need_to_free {
            break;
        }
        entries.remove(&key);
        freed += size_bytes;
    }
}
