// Ticket Store
//
// Bounded TTL cache with LRU eviction. Holds the tickets handed out by get_info until
// the client redeems them with do_get, and remembers forwarded request ids so a
// request that loops back through the mesh is answered only once.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::services::dispatcher::EndpointTarget;

#[derive(Debug, Clone)]
struct CachedEntry<V> {
    value: V,
    inserted_at: Instant,
    last_accessed: Instant,
    ttl: Duration,
}

impl<V> CachedEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner<V> {
    entries: HashMap<String, CachedEntry<V>>,
    stats: CacheStats,
}

/// TTL cache with least-recently-used eviction once `max_size` is reached
pub struct TtlCache<V> {
    inner: Mutex<Inner<V>>,
    max_size: usize,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    /// # Arguments
    ///
    /// * `max_size` - Maximum number of live entries
    /// * `default_ttl` - Lifetime of an entry from insertion
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        // Entries stay consistent even if a holder panicked mid-update
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live value for `key`, refreshing its recency
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let expired = match inner.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_accessed = now;
                let value = entry.value.clone();
                inner.stats.hits += 1;
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(key);
            inner.stats.expirations += 1;
            tracing::debug!("Cache entry expired: {}", key);
        }
        inner.stats.misses += 1;
        None
    }

    pub fn put(&self, key: String, value: V) {
        let mut inner = self.lock();
        self.insert_locked(&mut inner, key, value, Instant::now());
    }

    /// Insert only if no live entry exists. Returns whether the value was inserted.
    pub fn insert_if_absent(&self, key: &str, value: V) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get(key) {
            if !entry.is_expired(now) {
                return false;
            }
        }
        self.insert_locked(&mut inner, key.to_string(), value, now);
        true
    }

    fn insert_locked(&self, inner: &mut Inner<V>, key: String, value: V, now: Instant) {
        if inner.entries.len() >= self.max_size && !inner.entries.contains_key(&key) {
            Self::evict(inner, now);
        }

        inner.entries.insert(
            key,
            CachedEntry {
                value,
                inserted_at: now,
                last_accessed: now,
                ttl: self.default_ttl,
            },
        );
    }

    /// Remove and return the live value for `key` if `accept` agrees, in one step.
    /// A rejected entry stays in place untouched.
    pub fn take_if(&self, key: &str, accept: impl FnOnce(&V) -> bool) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let (expired, accepted) = match inner.entries.get(key) {
            Some(entry) if entry.is_expired(now) => (true, false),
            Some(entry) => (false, accept(&entry.value)),
            None => (false, false),
        };
        if expired {
            inner.entries.remove(key);
            inner.stats.expirations += 1;
        }
        if !accepted {
            inner.stats.misses += 1;
            return None;
        }
        inner.stats.hits += 1;
        inner.entries.remove(key).map(|entry| entry.value)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.lock().entries.remove(key).map(|entry| entry.value)
    }

    /// Drop expired entries first, then the least recently used one if still full
    fn evict(inner: &mut Inner<V>, now: Instant) {
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        inner.stats.expirations += (before - inner.entries.len()) as u64;
        if before != inner.entries.len() {
            return;
        }

        let oldest = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            inner.entries.remove(&key);
            inner.stats.evictions += 1;
            tracing::debug!("Evicted cache entry: {}", key);
        }
    }

    /// Remove expired entries
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - inner.entries.len();
        inner.stats.expirations += removed as u64;
        if removed > 0 {
            tracing::debug!("Cleaned up {} expired cache entries", removed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a ticket redeems: one local source with its expanded query, or one peer
#[derive(Debug, Clone)]
pub struct IssuedTicket {
    pub request_id: Uuid,
    pub target: EndpointTarget,
    /// Fingerprints allowed to redeem the ticket: the direct caller and the user it acts for
    pub owners: Vec<String>,
}

pub type TicketStore = TtlCache<IssuedTicket>;
