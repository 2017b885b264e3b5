// Read-through cache over the upstream route API.
//
// Routes and each route's stops are cached independently, each with its own
// fetch instant. An entry younger than the TTL is served as-is; an older one
// triggers one upstream fetch. If that fetch fails the last good value keeps
// being served and its timestamp is left untouched, so the next caller
// retries.
//
// Every key owns an async mutex that is held across the fetch, which gives
// single-flight behaviour: callers that queued while a fetch was running
// take its result instead of starting another one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::models::{Route, Stop, stops_from_features};
use crate::upstream::{RouteSource, UpstreamUnavailable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Fetched from upstream by this call.
    Fetched,
    /// Served from cache within the TTL.
    Hit,
    /// Upstream failed; the last good value was served.
    Stale,
    /// Upstream failed and nothing was cached yet.
    Empty,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fetched => "fetched",
            Freshness::Hit => "hit",
            Freshness::Stale => "stale",
            Freshness::Empty => "empty",
        }
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Lookup<T> {
    pub value: Arc<Vec<T>>,
    pub freshness: Freshness,
}

#[derive(Debug)]
struct CacheEntry<T> {
    value: Arc<Vec<T>>,
    fetched_at: Instant,
}

#[derive(Debug)]
struct Slot<T> {
    entry: Mutex<Option<CacheEntry<T>>>,
    // Bumped after every completed fetch attempt, successful or not.
    attempts: AtomicU64,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            entry: Mutex::new(None),
            attempts: AtomicU64::new(0),
        }
    }

    async fn read_through<F, Fut>(&self, ttl: Duration, key: &str, fetch: F) -> Lookup<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>, UpstreamUnavailable>>,
    {
        let seen = self.attempts.load(Ordering::Acquire);
        let mut guard = self.entry.lock().await;

        if let Some(entry) = guard.as_ref() {
            if entry.fetched_at.elapsed() <= ttl {
                return Lookup {
                    value: entry.value.clone(),
                    freshness: Freshness::Hit,
                };
            }
        }

        // Someone finished a fetch while we waited for the lock and it failed
        // (a success would have been a hit above). Share that result.
        if self.attempts.load(Ordering::Acquire) != seen {
            return Self::fallback(guard.as_ref());
        }

        let result = fetch().await;
        self.attempts.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(value) => {
                info!(key, count = value.len(), "Cache refreshed from upstream");
                let value = Arc::new(value);
                *guard = Some(CacheEntry {
                    value: value.clone(),
                    fetched_at: Instant::now(),
                });
                Lookup {
                    value,
                    freshness: Freshness::Fetched,
                }
            }
            Err(e) => {
                warn!(key, error = %e, "Upstream fetch failed, serving last known data");
                Self::fallback(guard.as_ref())
            }
        }
    }

    fn fallback(entry: Option<&CacheEntry<T>>) -> Lookup<T> {
        match entry {
            Some(entry) => Lookup {
                value: entry.value.clone(),
                freshness: Freshness::Stale,
            },
            None => Lookup {
                value: Arc::new(Vec::new()),
                freshness: Freshness::Empty,
            },
        }
    }
}

pub struct RouteCache<S> {
    source: S,
    ttl: Duration,
    routes: Slot<Route>,
    stops: StdMutex<HashMap<String, Arc<Slot<Stop>>>>,
}

impl<S: RouteSource> RouteCache<S> {
    pub fn new(source: S, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            routes: Slot::new(),
            stops: StdMutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get_routes(&self) -> Lookup<Route> {
        self.routes
            .read_through(self.ttl, "routes", || async move {
                self.source
                    .fetch_routes()
                    .await
                    .map(|raw| raw.into_iter().map(Route::from).collect::<Vec<_>>())
            })
            .await
    }

    pub async fn get_stops(&self, route_id: &str) -> Lookup<Stop> {
        let slot = self.stop_slot(route_id);

        let lookup = slot
            .read_through(self.ttl, route_id, || async move {
                self.source
                    .fetch_stops(route_id)
                    .await
                    .map(|features| stops_from_features(&features))
            })
            .await;

        if lookup.freshness == Freshness::Empty {
            self.forget_empty_slot(route_id, &slot);
        }
        lookup
    }

    /// Number of routes currently holding cached stops (or a fetch in flight).
    pub fn stop_keys(&self) -> usize {
        self.stops_map().len()
    }

    fn stop_slot(&self, route_id: &str) -> Arc<Slot<Stop>> {
        // The map lock is only held to look up or insert a slot, never across a fetch.
        self.stops_map()
            .entry(route_id.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    // Route ids that never produced data must not pin a slot forever. A slot
    // that is locked (fetch running) or already holds data is left alone.
    fn forget_empty_slot(&self, route_id: &str, slot: &Arc<Slot<Stop>>) {
        let mut map = self.stops_map();
        let Some(current) = map.get(route_id) else {
            return;
        };
        if !Arc::ptr_eq(current, slot) {
            return;
        }
        let vacant = slot
            .entry
            .try_lock()
            .map(|entry| entry.is_none())
            .unwrap_or(false);
        if vacant {
            map.remove(route_id);
        }
    }

    fn stops_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Slot<Stop>>>> {
        self.stops.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
