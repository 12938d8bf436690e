//! Route index: maps `(host, method, uri)` to ordered handler lists.
//!
//! Lookups merge the universal fallbacks `(all, all)`, `(all, method)`,
//! `(host, all)`, `(host, method)` in that order, keeping entries whose
//! anchored case-insensitive pattern matches the URI. Results are memoized
//! in an LRU keyed `method:host:uri`; the effective `Allow` string is
//! memoized separately and invalidated by a staleness flag raised on every
//! registration.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use lru::LruCache;
use regex::Regex;
use tracing::debug;

use super::Handler;
use std::sync::Arc;

pub const ALL: &str = "all";

const METHODS: [&str; 5] = ["DELETE", "GET", "PATCH", "POST", "PUT"];

struct RouteEntry {
    pattern: String,
    regex: Regex,
    handlers: Vec<Arc<Handler>>,
}

pub struct RouteIndex {
    table: RwLock<HashMap<(String, String), Vec<RouteEntry>>>,
    route_lru: Mutex<LruCache<String, Arc<[Arc<Handler>]>>>,
    allow_lru: Mutex<LruCache<String, String>>,
    blacklist: Mutex<HashSet<u32>>,
    stale: AtomicBool,
}

impl RouteIndex {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(1000).unwrap());
        Self {
            table: RwLock::new(HashMap::new()),
            route_lru: Mutex::new(LruCache::new(capacity)),
            allow_lru: Mutex::new(LruCache::new(capacity)),
            blacklist: Mutex::new(HashSet::new()),
            stale: AtomicBool::new(false),
        }
    }

    /// Register a handler under `(host, method, pattern)`.
    ///
    /// Patterns are matched anchored and case-insensitively. Registration
    /// appends: an existing `(host, method, pattern)` entry grows its
    /// handler list in order.
    pub fn register(
        &self,
        host: &str,
        method: &str,
        pattern: &str,
        handler: Arc<Handler>,
    ) -> anyhow::Result<()> {
        let method = normalize_method(method);
        let regex = Regex::new(&format!("(?i)^{}$", pattern))?;

        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        let entries = table
            .entry((host.to_string(), method.to_string()))
            .or_default();

        if let Some(entry) = entries.iter_mut().find(|e| e.pattern == pattern) {
            entry.handlers.push(handler);
        } else {
            entries.push(RouteEntry {
                pattern: pattern.to_string(),
                regex,
                handlers: vec![handler],
            });
        }
        drop(table);

        debug!(host, method, pattern, "route registered");
        self.stale.store(true, Ordering::Release);
        self.route_lru
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    /// Suppress a handler's contribution to the effective `Allow` set.
    pub fn blacklist(&self, hash: u32) {
        self.blacklist
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hash);
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_blacklisted(&self, hash: u32) -> bool {
        self.blacklist
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&hash)
    }

    /// Ordered handler list for a request; memoized.
    pub fn routes(&self, uri: &str, host: &str, method: &str) -> Arc<[Arc<Handler>]> {
        let method = normalize_method(method);
        let key = format!("{}:{}:{}", method, host, uri);

        if let Some(cached) = self
            .route_lru
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Arc::clone(cached);
        }

        let selected: Arc<[Arc<Handler>]> = self.collect(uri, host, method).into();
        self.route_lru
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, Arc::clone(&selected));
        selected
    }

    fn collect(&self, uri: &str, host: &str, method: &str) -> Vec<Arc<Handler>> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        // Requests against the "all" host collapse the key groups; visit
        // each distinct key once.
        let mut seen: Vec<(&str, &str)> = Vec::with_capacity(4);
        for pair in [(ALL, ALL), (ALL, method), (host, ALL), (host, method)] {
            if seen.contains(&pair) {
                continue;
            }
            seen.push(pair);
            if let Some(entries) = table.get(&(pair.0.to_string(), pair.1.to_string())) {
                for entry in entries {
                    if entry.regex.is_match(uri) {
                        out.extend(entry.handlers.iter().cloned());
                    }
                }
            }
        }
        out
    }

    /// True when any non-blacklisted handler matches `(host, method, uri)`.
    pub fn permits(&self, uri: &str, host: &str, method: &str) -> bool {
        let method = normalize_method(method);
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let blacklist = self.blacklist.lock().unwrap_or_else(|e| e.into_inner());
        let mut seen: Vec<(&str, &str)> = Vec::with_capacity(4);
        for pair in [(ALL, ALL), (ALL, method), (host, ALL), (host, method)] {
            if seen.contains(&pair) {
                continue;
            }
            seen.push(pair);
            if let Some(entries) = table.get(&(pair.0.to_string(), pair.1.to_string())) {
                for entry in entries {
                    if entry.regex.is_match(uri)
                        && entry.handlers.iter().any(|hd| !blacklist.contains(&hd.hash))
                    {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Effective `Allow` string for `(host, uri)`; memoized until the next
    /// registration raises the staleness flag.
    pub fn allows(&self, uri: &str, host: &str) -> String {
        if self.stale.swap(false, Ordering::AcqRel) {
            self.allow_lru
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }

        let key = format!("{}_{}", host, uri);
        if let Some(cached) = self
            .allow_lru
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return cached.clone();
        }

        let mut verbs: Vec<&str> = Vec::new();
        for method in METHODS {
            if self.permits(uri, host, method) {
                if method == "GET" {
                    verbs.extend(["GET", "HEAD", "OPTIONS"]);
                } else {
                    verbs.push(method);
                }
            }
        }
        verbs.sort_unstable();
        let allow = verbs.join(", ");

        self.allow_lru
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, allow.clone());
        allow
    }

    /// Drop all routes and memoized state.
    pub fn clear(&self) {
        self.table
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.route_lru
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.allow_lru
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.blacklist
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.stale.store(false, Ordering::Release);
    }
}

/// HEAD and OPTIONS route as GET.
fn normalize_method(method: &str) -> &str {
    match method {
        "HEAD" | "OPTIONS" => "GET",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Flow;

    fn noop(name: &str) -> Arc<Handler> {
        Handler::plain(name, 625, |_| Box::pin(async { Flow::Continue }))
    }

    #[test]
    fn lookup_merges_key_groups_in_order() {
        let index = RouteIndex::new(100);
        index.register("all", "all", "/.*", noop("generic")).unwrap();
        index.register("all", "GET", "/.*", noop("get-any")).unwrap();
        index.register("main", "all", "/.*", noop("host-any")).unwrap();
        index.register("main", "GET", "/x", noop("host-get")).unwrap();

        let selected = index.routes("/x", "main", "GET");
        let names: Vec<&str> = selected.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["generic", "get-any", "host-any", "host-get"]);
    }

    #[test]
    fn patterns_anchor_and_ignore_case() {
        let index = RouteIndex::new(100);
        index.register("main", "GET", "/file", noop("f")).unwrap();
        assert_eq!(index.routes("/file", "main", "GET").len(), 1);
        assert_eq!(index.routes("/FILE", "main", "GET").len(), 1);
        assert_eq!(index.routes("/file/x", "main", "GET").len(), 0);
    }

    #[test]
    fn head_and_options_route_as_get() {
        let index = RouteIndex::new(100);
        index.register("main", "GET", "/f", noop("f")).unwrap();
        assert_eq!(index.routes("/f", "main", "HEAD").len(), 1);
        assert_eq!(index.routes("/f", "main", "OPTIONS").len(), 1);
    }

    #[test]
    fn memoized_lookup_agrees_with_cold_recompute() {
        let index = RouteIndex::new(100);
        index.register("main", "GET", "/f", noop("f")).unwrap();
        let warm = index.routes("/f", "main", "GET");
        let cold = index.collect("/f", "main", "GET");
        assert_eq!(warm.len(), cold.len());

        // Registration invalidates the memo.
        index.register("main", "GET", "/f", noop("g")).unwrap();
        assert_eq!(index.routes("/f", "main", "GET").len(), 2);
    }

    #[test]
    fn allows_expands_get_and_sorts() {
        let index = RouteIndex::new(100);
        index.register("main", "GET", "/f", noop("f")).unwrap();
        index.register("main", "PUT", "/f", noop("w")).unwrap();
        assert_eq!(index.allows("/f", "main"), "GET, HEAD, OPTIONS, PUT");
    }

    #[test]
    fn blacklisted_handlers_grant_nothing() {
        let index = RouteIndex::new(100);
        let gate = noop("gate");
        let hash = gate.hash;
        index.register("all", "GET", "/.*", gate).unwrap();
        assert_eq!(index.allows("/f", "main"), "GET, HEAD, OPTIONS");

        index.blacklist(hash);
        assert_eq!(index.allows("/f", "main"), "");
    }

    #[test]
    fn registration_refreshes_allows() {
        let index = RouteIndex::new(100);
        index.register("main", "GET", "/f", noop("f")).unwrap();
        assert_eq!(index.allows("/f", "main"), "GET, HEAD, OPTIONS");
        index.register("main", "DELETE", "/f", noop("d")).unwrap();
        assert_eq!(index.allows("/f", "main"), "DELETE, GET, HEAD, OPTIONS");
    }
}
