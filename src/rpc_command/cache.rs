// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A bounded, cost/benefit-ranked store of command responses.
//!
//! Serves two purposes at once: it lets an idempotent command's response be reused across
//! distinct invokers without re-running the handler, and it deduplicates concurrent or
//! re-delivered requests sharing the same correlation data by handing every caller the same
//! pending future rather than running the handler more than once.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Identifies a cached (or in-flight) response.
///
/// `correlation_data` distinguishes requests that must only ever dedup against themselves
/// (retries/redeliveries of the exact same invocation) from requests that may additionally
/// reuse another invocation's result when `is_idempotent` allows cross-correlation reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// The command name this response belongs to.
    pub command_name: String,
    /// The MQTT client id of the invoker that sent the request.
    pub invoker_id: String,
    /// The request's correlation data.
    pub correlation_data: Bytes,
}

/// Identifies a family of interchangeable idempotent requests: the same command, invoker, and
/// request payload, irrespective of correlation data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IdempotentKey {
    command_name: String,
    invoker_id: String,
    request_payload_hash: u64,
}

/// A resolved entry in the cache: the serialized response and the bookkeeping needed to decide
/// eviction order and staleness.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// The serialized response payload.
    pub payload: Bytes,
    /// The response's content type.
    pub content_type: Option<String>,
    /// The response's custom user properties, as they were originally published.
    pub user_properties: Vec<(String, String)>,
    /// How long the handler took to produce this response.
    pub execution_duration: Duration,
}

struct CacheEntry {
    response: CachedResponse,
    is_idempotent: bool,
    request_payload_hash: u64,
    /// Point beyond which the entry is no longer offered for cross-correlation (idempotent)
    /// reuse; an identical retry of the entry's own correlation data keeps deduping past this,
    /// up to `stale_at`.
    expires_at: Instant,
    /// Point (`>= expires_at`) beyond which the entry is purged outright and no retrieval of
    /// any kind, exact-correlation or idempotent, is permitted.
    stale_at: Instant,
    caching_benefit: f64,
}

impl CacheEntry {
    fn payload_bytes(&self) -> usize {
        self.response.payload.len()
    }
}

/// A future shared by every concurrent caller retrieving the same in-flight request.
pub struct PendingCell {
    notify: Notify,
    result: Mutex<Option<Option<CachedResponse>>>,
    /// Cancelled if the in-flight handler is dropped/cancelled before producing a result.
    pub cancellation_token: CancellationToken,
}

impl PendingCell {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            result: Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        }
    }

    fn resolve(&self, response: Option<CachedResponse>) {
        *self.result.lock().unwrap() = Some(response);
        self.notify.notify_waiters();
    }

    /// Waits for the pending request to resolve, returning the response if one was produced, or
    /// `None` if the request ultimately failed to produce a cacheable response.
    pub async fn wait(&self) -> Option<CachedResponse> {
        loop {
            if let Some(result) = self.result.lock().unwrap().clone() {
                return result;
            }
            self.notify.notified().await;
        }
    }
}

/// The result of a [`ResponseCache::retrieve`] call.
pub enum RetrieveOutcome {
    /// A resolved response is available immediately.
    Hit(CachedResponse),
    /// An identical request is already in flight; await `cell` for its eventual result.
    Pending(Arc<PendingCell>),
    /// No cached or in-flight entry exists. The caller becomes responsible for producing a
    /// response and calling [`ResponseCache::store`] (or [`ResponseCache::fail`] on handler
    /// failure) with the [`PendingCell`] returned alongside.
    Miss(Arc<PendingCell>),
}

/// Options controlling [`ResponseCache`] bounds.
#[derive(Builder, Clone)]
#[builder(setter(into))]
pub struct CacheOptions {
    /// Maximum number of entries retained at once.
    #[builder(default = "1024")]
    pub max_entry_count: usize,
    /// Maximum sum of payload bytes retained across all entries at once.
    #[builder(default = "16 * 1024 * 1024")]
    pub max_aggregate_payload_bytes: usize,
}

struct Inner {
    entries: HashMap<CacheKey, CacheEntry>,
    pending: HashMap<CacheKey, Arc<PendingCell>>,
    idempotent_index: HashMap<IdempotentKey, CacheKey>,
    aggregate_payload_bytes: usize,
}

/// The Command Response Cache.
pub struct ResponseCache {
    inner: Mutex<Inner>,
    options: CacheOptions,
    expirer_cancellation: CancellationToken,
}

impl ResponseCache {
    /// Constructs a new, empty cache. Call [`ResponseCache::start`] to begin background
    /// expiry of stale entries.
    #[must_use]
    pub fn new(options: CacheOptions) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                pending: HashMap::new(),
                idempotent_index: HashMap::new(),
                aggregate_payload_bytes: 0,
            }),
            options,
            expirer_cancellation: CancellationToken::new(),
        })
    }

    /// Starts a background task that periodically sweeps expired entries. Returns immediately;
    /// the task runs until [`ResponseCache::stop`] is called or every clone of `self` is
    /// dropped.
    pub fn start(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        let cancellation = self.expirer_cancellation.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancellation.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_secs(30)) => {
                        cache.sweep_expired();
                    }
                }
            }
        });
    }

    /// Stops the background expiry task, if running.
    pub fn stop(&self) {
        self.expirer_cancellation.cancel();
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let expired_idempotent_keys: Vec<IdempotentKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.stale_at)
            .filter_map(|(key, entry)| {
                if entry.is_idempotent {
                    Some(IdempotentKey {
                        command_name: key.command_name.clone(),
                        invoker_id: key.invoker_id.clone(),
                        request_payload_hash: entry.request_payload_hash,
                    })
                } else {
                    None
                }
            })
            .collect();
        let mut removed_bytes = 0usize;
        inner.entries.retain(|_, entry| {
            if now >= entry.stale_at {
                removed_bytes += entry.payload_bytes();
                false
            } else {
                true
            }
        });
        inner.aggregate_payload_bytes = inner.aggregate_payload_bytes.saturating_sub(removed_bytes);
        for key in expired_idempotent_keys {
            inner.idempotent_index.remove(&key);
        }
    }

    /// Looks up `key` for an exact (same-correlation) dedup match, falling back to a
    /// cross-correlation idempotent match via `idempotent_key` when `idempotent_key` is
    /// `Some` and no exact entry exists.
    ///
    /// On a clean miss, registers `key` as pending and returns [`RetrieveOutcome::Miss`]
    /// carrying the [`PendingCell`] the caller must resolve via [`ResponseCache::store`] or
    /// [`ResponseCache::fail`].
    pub fn retrieve(
        &self,
        key: &CacheKey,
        idempotent_request_payload_hash: Option<u64>,
    ) -> RetrieveOutcome {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.entries.get(key) {
            // An exact-correlation match dedups past its own `expires_at`, all the way to
            // `stale_at`: a retry with the same correlation data is still the same logical
            // request, whether or not the command was declared idempotent.
            if now < entry.stale_at {
                return RetrieveOutcome::Hit(entry.response.clone());
            }
        }
        if let Some(cell) = inner.pending.get(key) {
            return RetrieveOutcome::Pending(Arc::clone(cell));
        }

        if let Some(payload_hash) = idempotent_request_payload_hash {
            let idem_key = IdempotentKey {
                command_name: key.command_name.clone(),
                invoker_id: key.invoker_id.clone(),
                request_payload_hash: payload_hash,
            };
            if let Some(canonical_key) = inner.idempotent_index.get(&idem_key).cloned() {
                if let Some(entry) = inner.entries.get(&canonical_key) {
                    // Cross-correlation reuse only lives for the normal validity window; the
                    // extra grace period up to `stale_at` is reserved for the exact-correlation
                    // retry path above.
                    if now < entry.expires_at {
                        return RetrieveOutcome::Hit(entry.response.clone());
                    }
                } else if let Some(cell) = inner.pending.get(&canonical_key) {
                    return RetrieveOutcome::Pending(Arc::clone(cell));
                }
            }
        }

        let cell = Arc::new(PendingCell::new());
        inner.pending.insert(key.clone(), Arc::clone(&cell));
        RetrieveOutcome::Miss(cell)
    }

    /// Stores a resolved response for `key`, resolving any [`PendingCell`] waiters, and evicts
    /// lower-benefit entries as needed to respect the configured bounds.
    ///
    /// `request_payload_hash` enables future cross-correlation reuse when `is_idempotent` is
    /// true. `staleness` is how much earlier than `expiry` the entry stops being offered for
    /// cross-correlation reuse (clamped to `expiry`).
    pub fn store(
        &self,
        key: CacheKey,
        response: CachedResponse,
        is_idempotent: bool,
        request_payload_hash: u64,
        expiry: Duration,
        staleness: Duration,
    ) {
        let now = Instant::now();
        let caching_benefit = Self::caching_benefit(response.execution_duration, response.payload.len());
        let new_bytes = response.payload.len();
        let entry = CacheEntry {
            response: response.clone(),
            is_idempotent,
            request_payload_hash,
            expires_at: now + expiry,
            // `staleness` extends the window past `expires_at` during which an exact-correlation
            // retry still dedups; it never shrinks the normal cross-correlation validity window.
            stale_at: now + expiry + staleness,
            caching_benefit,
        };

        let mut inner = self.inner.lock().unwrap();
        if let Some(cell) = inner.pending.remove(&key) {
            cell.resolve(Some(response));
        }

        self.make_room(&mut inner, new_bytes, caching_benefit);

        if is_idempotent {
            inner.idempotent_index.insert(
                IdempotentKey {
                    command_name: key.command_name.clone(),
                    invoker_id: key.invoker_id.clone(),
                    request_payload_hash,
                },
                key.clone(),
            );
        }
        inner.aggregate_payload_bytes += new_bytes;
        inner.entries.insert(key, entry);
    }

    /// Releases a pending entry without caching a result, e.g. because the handler errored or
    /// was cancelled. Subsequent identical requests will be retried rather than deduplicated.
    pub fn fail(&self, key: &CacheKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cell) = inner.pending.remove(key) {
            cell.resolve(None);
        }
    }

    fn caching_benefit(execution_duration: Duration, payload_bytes: usize) -> f64 {
        execution_duration.as_secs_f64() / (payload_bytes as f64 + 1.0)
    }

    /// Evicts entries in ascending caching-benefit order until `incoming_bytes` fits within
    /// `max_aggregate_payload_bytes` and the entry count has room, or no further eviction is
    /// possible. Pending entries are never evicted.
    fn make_room(&self, inner: &mut Inner, incoming_bytes: usize, incoming_benefit: f64) {
        loop {
            let over_count = inner.entries.len() + 1 > self.options.max_entry_count;
            let over_bytes =
                inner.aggregate_payload_bytes + incoming_bytes > self.options.max_aggregate_payload_bytes;
            if !over_count && !over_bytes {
                return;
            }

            let victim = inner
                .entries
                .iter()
                .min_by(|(_, a), (_, b)| a.caching_benefit.total_cmp(&b.caching_benefit))
                .map(|(key, entry)| (key.clone(), entry.caching_benefit));

            match victim {
                Some((victim_key, victim_benefit)) if victim_benefit <= incoming_benefit => {
                    if let Some(entry) = inner.entries.remove(&victim_key) {
                        inner.aggregate_payload_bytes =
                            inner.aggregate_payload_bytes.saturating_sub(entry.payload_bytes());
                        if entry.is_idempotent {
                            inner.idempotent_index.remove(&IdempotentKey {
                                command_name: victim_key.command_name.clone(),
                                invoker_id: victim_key.invoker_id.clone(),
                                request_payload_hash: entry.request_payload_hash,
                            });
                        }
                    }
                }
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(correlation: &[u8]) -> CacheKey {
        CacheKey {
            command_name: "test".to_string(),
            invoker_id: "invoker-1".to_string(),
            correlation_data: Bytes::copy_from_slice(correlation),
        }
    }

    fn response(payload: &str) -> CachedResponse {
        CachedResponse {
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            content_type: Some("application/json".to_string()),
            user_properties: vec![],
            execution_duration: Duration::from_millis(10),
        }
    }

    #[test]
    fn miss_then_store_then_hit() {
        let cache = ResponseCache::new(CacheOptionsBuilder::default().build().unwrap());
        let k = key(b"a");
        let cell = match cache.retrieve(&k, None) {
            RetrieveOutcome::Miss(cell) => cell,
            _ => panic!("expected miss"),
        };
        cache.store(
            k.clone(),
            response("hello"),
            false,
            0,
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        assert!(cell.result.lock().unwrap().is_some());
        match cache.retrieve(&k, None) {
            RetrieveOutcome::Hit(r) => assert_eq!(r.payload, Bytes::from_static(b"hello")),
            _ => panic!("expected hit"),
        }
    }

    #[test]
    fn second_concurrent_request_observes_pending() {
        let cache = ResponseCache::new(CacheOptionsBuilder::default().build().unwrap());
        let k = key(b"a");
        let _first_cell = match cache.retrieve(&k, None) {
            RetrieveOutcome::Miss(cell) => cell,
            _ => panic!("expected miss"),
        };
        match cache.retrieve(&k, None) {
            RetrieveOutcome::Pending(_) => {}
            _ => panic!("expected pending"),
        }
    }

    #[test]
    fn idempotent_entry_is_reused_across_correlation_ids() {
        let cache = ResponseCache::new(CacheOptionsBuilder::default().build().unwrap());
        let k1 = key(b"a");
        let k2 = key(b"b");
        let _cell = match cache.retrieve(&k1, Some(42)) {
            RetrieveOutcome::Miss(cell) => cell,
            _ => panic!("expected miss"),
        };
        cache.store(
            k1,
            response("reused"),
            true,
            42,
            Duration::from_secs(60),
            Duration::from_secs(10),
        );
        match cache.retrieve(&k2, Some(42)) {
            RetrieveOutcome::Hit(r) => assert_eq!(r.payload, Bytes::from_static(b"reused")),
            _ => panic!("expected hit via idempotent reuse"),
        }
    }

    #[test]
    fn exact_correlation_hit_survives_past_expiry_until_stale() {
        let cache = ResponseCache::new(CacheOptionsBuilder::default().build().unwrap());
        let k = key(b"a");
        let _cell = match cache.retrieve(&k, None) {
            RetrieveOutcome::Miss(cell) => cell,
            _ => panic!("expected miss"),
        };
        // Not idempotent and not declared cacheable: exact-correlation dedup must still hold
        // past expires_at, up to stale_at.
        cache.store(k.clone(), response("hello"), false, 0, Duration::from_millis(20), Duration::from_millis(200));
        std::thread::sleep(Duration::from_millis(50));
        match cache.retrieve(&k, None) {
            RetrieveOutcome::Hit(r) => assert_eq!(r.payload, Bytes::from_static(b"hello")),
            RetrieveOutcome::Pending(_) => panic!("expected hit past expiry while within stale window, got pending"),
            RetrieveOutcome::Miss(_) => panic!("expected hit past expiry while within stale window, got miss"),
        }
    }

    #[test]
    fn eviction_drops_lowest_benefit_entry_first() {
        let cache = ResponseCache::new(
            CacheOptionsBuilder::default()
                .max_entry_count(1usize)
                .build()
                .unwrap(),
        );
        let low = key(b"low");
        let _c1 = match cache.retrieve(&low, None) {
            RetrieveOutcome::Miss(cell) => cell,
            _ => panic!(),
        };
        cache.store(
            low.clone(),
            response("x"),
            false,
            0,
            Duration::from_secs(60),
            Duration::from_secs(30),
        );

        let high = key(b"high");
        let _c2 = match cache.retrieve(&high, None) {
            RetrieveOutcome::Miss(cell) => cell,
            _ => panic!(),
        };
        let mut high_response = response("y");
        high_response.execution_duration = Duration::from_secs(5);
        cache.store(
            high.clone(),
            high_response,
            false,
            0,
            Duration::from_secs(60),
            Duration::from_secs(30),
        );

        assert!(matches!(cache.retrieve(&high, None), RetrieveOutcome::Hit(_)));
        assert!(matches!(cache.retrieve(&low, None), RetrieveOutcome::Miss(_)));
    }
}
