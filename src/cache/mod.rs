//! Fingerprint-keyed response cache with single-flight de-duplication.
//!
//! Two structures share the keyspace:
//!
//! - ready entries in an LRU map with per-entry TTL;
//! - in-flight markers for requests currently executing, carrying the
//!   wake-up channel their waiters subscribe to.
//!
//! At any instant a fingerprint has a ready entry, an in-flight marker,
//! or neither. Lookups consult ready entries first, so the brief overlap
//! during `publish` is never observable.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::GatewayError;
use crate::metrics;

/// Capacity of one marker's wake-up channel. Lagging waiters treat the
/// overflow as a miss and re-dispatch, so this only needs to cover the
/// common fan-in.
const WAKEUP_CHANNEL_CAPACITY: usize = 64;

/// What a coalesced waiter learns when its origin settles.
#[derive(Debug, Clone)]
pub enum InFlightOutcome {
    Completed(Arc<Value>),
    Failed(GatewayError),
    /// The origin was cancelled; one waiter should take over as the new
    /// origin by re-running `lookup`.
    OriginCancelled,
}

/// Result of a cache lookup.
pub enum Lookup {
    /// A live entry; short-circuit to completion.
    Hit(Arc<Value>),
    /// Another job is already executing this fingerprint; await the
    /// channel for its outcome.
    Join(broadcast::Receiver<InFlightOutcome>),
    /// Nothing cached or in flight: the caller installed a marker and is
    /// now the origin. It must later `publish`, `fail`, or
    /// `cancel_origin`.
    MissInstalled,
}

struct CacheEntry {
    result: Arc<Value>,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

struct InFlightMarker {
    origin_job: String,
    tx: broadcast::Sender<InFlightOutcome>,
}

/// Counters for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub joined: u64,
}

/// The response cache.
pub struct ResponseCache {
    entries: Mutex<LruCache<u128, CacheEntry>>,
    in_flight: DashMap<u128, InFlightMarker>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
}

impl ResponseCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: DashMap::new(),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Whether storing results is enabled at all. Single-flight markers
    /// work either way.
    pub fn storage_enabled(&self) -> bool {
        !self.default_ttl.is_zero()
    }

    /// Look up `fp`, atomically installing an in-flight marker on miss.
    pub fn lookup(&self, fp: u128, origin_job: &str) -> Lookup {
        if let Some(result) = self.get_ready(fp) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_lookup("hit");
            return Lookup::Hit(result);
        }

        match self.in_flight.entry(fp) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                let rx = occupied.get().tx.subscribe();
                self.joined.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup("joined");
                Lookup::Join(rx)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                // A publish may have settled between the ready check and
                // taking this entry; re-check before claiming origin.
                if let Some(result) = self.get_ready(fp) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    metrics::record_cache_lookup("hit");
                    return Lookup::Hit(result);
                }
                let (tx, _) = broadcast::channel(WAKEUP_CHANNEL_CAPACITY);
                vacant.insert(InFlightMarker { origin_job: origin_job.to_string(), tx });
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup("miss");
                Lookup::MissInstalled
            }
        }
    }

    /// Check for a live entry without installing a marker on miss.
    pub fn peek(&self, fp: u128) -> Option<Arc<Value>> {
        let hit = self.get_ready(fp);
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_lookup("hit");
        }
        hit
    }

    fn get_ready(&self, fp: u128) -> Option<Arc<Value>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&fp) {
            if entry.is_expired() {
                entries.pop(&fp);
                return None;
            }
            return Some(Arc::clone(&entry.result));
        }
        None
    }

    /// Replace the in-flight marker with a ready entry and wake waiters.
    pub fn publish(&self, fp: u128, result: Arc<Value>, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        if !ttl.is_zero() {
            let mut entries = self.entries.lock();
            if self.evict_for_insert(&mut entries) {
                entries.put(
                    fp,
                    CacheEntry { result: Arc::clone(&result), inserted_at: Instant::now(), ttl },
                );
            }
        }
        if let Some((_, marker)) = self.in_flight.remove(&fp) {
            let _ = marker.tx.send(InFlightOutcome::Completed(result));
        }
    }

    /// Remove the in-flight marker and wake waiters with the error.
    pub fn fail(&self, fp: u128, error: GatewayError) {
        if let Some((_, marker)) = self.in_flight.remove(&fp) {
            let _ = marker.tx.send(InFlightOutcome::Failed(error));
        }
    }

    /// Origin cancellation: drop the marker and promote the waiters. The
    /// first waiter to re-run `lookup` installs itself as the new origin;
    /// the rest re-join it.
    pub fn cancel_origin(&self, fp: u128, origin_job: &str) {
        let removed = self
            .in_flight
            .remove_if(&fp, |_, marker| marker.origin_job == origin_job);
        if let Some((_, marker)) = removed {
            debug!(origin = %origin_job, "in-flight origin cancelled, promoting waiters");
            let _ = marker.tx.send(InFlightOutcome::OriginCancelled);
        }
    }

    /// Make room for one insert, skipping entries still referenced
    /// outside the cache. Returns false when every resident entry is
    /// referenced and nothing may be evicted; the insert is then skipped
    /// (waiters already received the result directly).
    fn evict_for_insert(&self, entries: &mut LruCache<u128, CacheEntry>) -> bool {
        if entries.len() < entries.cap().get() {
            return true;
        }
        let limit = entries.len();
        for _ in 0..limit {
            if let Some((fp, entry)) = entries.pop_lru() {
                if Arc::strong_count(&entry.result) > 1 {
                    // Still referenced by a holder; keep it and try the
                    // next-coldest entry.
                    entries.put(fp, entry);
                } else {
                    return true;
                }
            }
        }
        false
    }

    /// Drop expired entries. Called by the janitor.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<u128> = entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(fp, _)| *fp)
            .collect();
        let count = expired.len();
        for fp in expired {
            entries.pop(&fp);
        }
        count
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.lock().len(),
            in_flight: self.in_flight.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn cache() -> ResponseCache {
        ResponseCache::new(4, Duration::from_secs(60))
    }

    #[test]
    fn test_miss_installs_origin() {
        let cache = cache();
        assert!(matches!(cache.lookup(1, "job-a"), Lookup::MissInstalled));
        // Second lookup joins, it does not become another origin.
        assert!(matches!(cache.lookup(1, "job-b"), Lookup::Join(_)));
    }

    #[test]
    fn test_publish_then_hit() {
        let cache = cache();
        assert!(matches!(cache.lookup(1, "job-a"), Lookup::MissInstalled));
        cache.publish(1, Arc::new(json!({"text": "ok"})), None);
        match cache.lookup(1, "job-b") {
            Lookup::Hit(v) => assert_eq!(v["text"], "ok"),
            _ => panic!("expected hit after publish"),
        }
    }

    #[tokio::test]
    async fn test_waiters_receive_result() {
        let cache = cache();
        assert!(matches!(cache.lookup(7, "origin"), Lookup::MissInstalled));
        let mut rx = match cache.lookup(7, "waiter") {
            Lookup::Join(rx) => rx,
            _ => panic!("expected join"),
        };
        cache.publish(7, Arc::new(json!("done")), None);
        match rx.recv().await.unwrap() {
            InFlightOutcome::Completed(v) => assert_eq!(*v, json!("done")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_waiters_receive_error() {
        let cache = cache();
        assert!(matches!(cache.lookup(7, "origin"), Lookup::MissInstalled));
        let mut rx = match cache.lookup(7, "waiter") {
            Lookup::Join(rx) => rx,
            _ => panic!("expected join"),
        };
        cache.fail(7, GatewayError::new(ErrorKind::UpstreamServer, "backend failed"));
        match rx.recv().await.unwrap() {
            InFlightOutcome::Failed(e) => assert_eq!(e.kind(), ErrorKind::UpstreamServer),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // The marker is gone: a fresh lookup becomes origin again.
        assert!(matches!(cache.lookup(7, "retry"), Lookup::MissInstalled));
    }

    #[tokio::test]
    async fn test_origin_cancel_promotes_waiter() {
        let cache = cache();
        assert!(matches!(cache.lookup(3, "origin"), Lookup::MissInstalled));
        let mut rx = match cache.lookup(3, "waiter") {
            Lookup::Join(rx) => rx,
            _ => panic!("expected join"),
        };
        cache.cancel_origin(3, "origin");
        assert!(matches!(rx.recv().await.unwrap(), InFlightOutcome::OriginCancelled));
        // The promoted waiter re-looks-up and becomes the new origin.
        assert!(matches!(cache.lookup(3, "waiter"), Lookup::MissInstalled));
    }

    #[test]
    fn test_cancel_origin_ignores_non_origin() {
        let cache = cache();
        assert!(matches!(cache.lookup(3, "origin"), Lookup::MissInstalled));
        cache.cancel_origin(3, "someone-else");
        // Marker still present: new lookups join rather than install.
        assert!(matches!(cache.lookup(3, "late"), Lookup::Join(_)));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ResponseCache::new(4, Duration::from_millis(1));
        assert!(matches!(cache.lookup(9, "a"), Lookup::MissInstalled));
        cache.publish(9, Arc::new(json!("v")), None);
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(cache.lookup(9, "b"), Lookup::MissInstalled));
    }

    #[test]
    fn test_zero_ttl_disables_storage() {
        let cache = ResponseCache::new(4, Duration::ZERO);
        assert!(!cache.storage_enabled());
        assert!(matches!(cache.lookup(9, "a"), Lookup::MissInstalled));
        cache.publish(9, Arc::new(json!("v")), None);
        assert!(matches!(cache.lookup(9, "b"), Lookup::MissInstalled));
    }

    #[test]
    fn test_lru_eviction_skips_referenced() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        assert!(matches!(cache.lookup(1, "a"), Lookup::MissInstalled));
        cache.publish(1, Arc::new(json!(1)), None);
        let held = match cache.lookup(1, "h") {
            Lookup::Hit(v) => v,
            _ => panic!("expected hit"),
        };
        assert!(matches!(cache.lookup(2, "b"), Lookup::MissInstalled));
        cache.publish(2, Arc::new(json!(2)), None);
        // Cache is full; inserting a third entry must evict, but entry 1
        // is referenced by `held`, so entry 2 goes instead.
        assert!(matches!(cache.lookup(3, "c"), Lookup::MissInstalled));
        cache.publish(3, Arc::new(json!(3)), None);
        assert!(matches!(cache.lookup(1, "x"), Lookup::Hit(_)));
        drop(held);
    }

    #[test]
    fn test_evict_expired_sweep() {
        let cache = ResponseCache::new(8, Duration::from_millis(1));
        for fp in 0..4u128 {
            assert!(matches!(cache.lookup(fp, "a"), Lookup::MissInstalled));
            cache.publish(fp, Arc::new(json!(fp.to_string())), None);
        }
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.evict_expired(), 4);
        assert_eq!(cache.stats().entries, 0);
    }
}
