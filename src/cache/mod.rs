//! Representation cache keyed by strong validators.
//!
//! One entry per canonical URL: the unquoted ETag, the sanitized response
//! headers, the mimetype and the registration timestamp. Each entry owns at
//! most two on-disk side files holding the pre-compressed representation
//! (`<tmp>/<etag>.gz`, `<tmp>/<etag>.zz`); side files may be deleted
//! externally at any time and readers fall back to re-compressing.

pub mod gate;
pub mod validator;
pub mod watcher;

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tracing::{debug, warn};

/// Response headers never stored in a cache entry.
const STRIPPED: [&str; 6] = [
    "content-encoding",
    "server",
    "status",
    "transfer-encoding",
    "x-powered-by",
    "x-response-time",
];

#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Stored without surrounding quotes.
    pub etag: String,
    /// Sanitized headers; hop-by-hop and dynamic fields removed.
    pub headers: BTreeMap<String, String>,
    pub mimetype: String,
    /// Registration time, epoch seconds.
    pub timestamp: i64,
}

pub struct EtagCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    tmp: PathBuf,
}

impl EtagCache {
    pub fn new(capacity: usize, tmp: PathBuf) -> Self {
        let capacity =
            NonZeroUsize::new(capacity).unwrap_or_else(|| NonZeroUsize::new(1000).unwrap());
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            tmp,
        }
    }

    /// Strip hop-by-hop, dynamic and CORS fields from response headers.
    pub fn sanitize(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        headers
            .iter()
            .filter(|(name, _)| {
                !STRIPPED.contains(&name.as_str()) && !name.starts_with("access-control-")
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Register (or replace) the entry for a URL.
    ///
    /// A replacement with a different validator deletes the stale side
    /// files; entry replacement is serialized so concurrent registers for
    /// the same URL cannot interleave deletion with a fresh write.
    pub fn register(
        &self,
        url: &str,
        etag: &str,
        headers: &BTreeMap<String, String>,
        mimetype: &str,
        timestamp: i64,
    ) {
        let etag = validator::unquote(etag).to_string();
        let entry = CacheEntry {
            headers: Self::sanitize(headers),
            mimetype: mimetype.to_string(),
            timestamp,
            etag: etag.clone(),
        };

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = entries.peek(url) {
            if previous.etag != etag {
                self.remove_side_files(&previous.etag.clone());
            }
        }
        if let Some((_, evicted)) = entries.push(url.to_string(), entry) {
            // push returns the displaced LRU victim when capacity overflows.
            if evicted.etag != etag {
                self.remove_side_files(&evicted.etag);
            }
        }
        debug!(url, etag = %etag, "cache entry registered");
    }

    pub fn get(&self, url: &str) -> Option<CacheEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
    }

    /// Refresh the validator and timestamp in place (watcher change event).
    /// Returns false when the entry is already gone.
    pub fn touch(&self, url: &str, etag: &str, timestamp: i64) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(url) {
            Some(entry) => {
                if entry.etag != etag {
                    self.remove_side_files(&entry.etag.clone());
                    entry.etag = validator::unquote(etag).to_string();
                }
                entry.timestamp = timestamp;
                true
            }
            None => false,
        }
    }

    /// Drop the entry for a URL along with its side files.
    pub fn unregister(&self, url: &str) -> Option<CacheEntry> {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop(url);
        if let Some(entry) = &removed {
            self.remove_side_files(&entry.etag);
            debug!(url, "cache entry unregistered");
        }
        removed
    }

    /// Schedule removal once the upstream freshness lifetime lapses.
    ///
    /// The task re-reads the entry at the deadline and only unregisters
    /// when the validator still matches; an explicit unregister or a
    /// re-register with a new etag cancels the expiry by value.
    pub fn expire_after(self: &Arc<Self>, url: &str, etag: &str, ttl: Duration) {
        let cache = Arc::clone(self);
        let url = url.to_string();
        let etag = validator::unquote(etag).to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let current = cache.get(&url);
            if current.map(|e| e.etag == etag).unwrap_or(false) {
                debug!(url = %url, "cache entry expired");
                cache.unregister(&url);
            }
        });
    }

    /// Side-file path for a validator and compression extension.
    pub fn side_file(&self, etag: &str, ext: &str) -> PathBuf {
        self.tmp.join(format!("{}.{}", etag, ext))
    }

    fn remove_side_files(&self, etag: &str) {
        for ext in ["gz", "zz"] {
            let path = self.side_file(etag, ext);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "side file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "side file removal failed"),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let tags: Vec<String> = entries.iter().map(|(_, e)| e.etag.clone()).collect();
        entries.clear();
        drop(entries);
        for tag in tags {
            self.remove_side_files(&tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> EtagCache {
        EtagCache::new(4, std::env::temp_dir())
    }

    fn headers() -> BTreeMap<String, String> {
        let mut h = BTreeMap::new();
        h.insert("content-type".to_string(), "text/html".to_string());
        h.insert("content-encoding".to_string(), "gzip".to_string());
        h.insert("server".to_string(), "x".to_string());
        h.insert("x-response-time".to_string(), "1 ms".to_string());
        h.insert("access-control-allow-origin".to_string(), "*".to_string());
        h.insert("etag".to_string(), "\"abc\"".to_string());
        h
    }

    #[test]
    fn sanitize_strips_dynamic_fields() {
        let clean = EtagCache::sanitize(&headers());
        assert!(clean.contains_key("content-type"));
        assert!(clean.contains_key("etag"));
        assert!(!clean.contains_key("content-encoding"));
        assert!(!clean.contains_key("server"));
        assert!(!clean.contains_key("x-response-time"));
        assert!(!clean.contains_key("access-control-allow-origin"));
    }

    #[test]
    fn register_stores_unquoted_etag() {
        let c = cache();
        c.register("http://h/p", "\"abc\"", &headers(), "text/html", 100);
        let entry = c.get("http://h/p").unwrap();
        assert_eq!(entry.etag, "abc");
        assert_eq!(entry.mimetype, "text/html");
        assert_eq!(entry.timestamp, 100);
    }

    #[test]
    fn one_entry_per_url() {
        let c = cache();
        c.register("http://h/p", "a1", &headers(), "text/html", 100);
        c.register("http://h/p", "a2", &headers(), "text/html", 200);
        assert_eq!(c.len(), 1);
        assert_eq!(c.get("http://h/p").unwrap().etag, "a2");
    }

    #[test]
    fn touch_updates_in_place() {
        let c = cache();
        c.register("http://h/p", "a1", &headers(), "text/html", 100);
        assert!(c.touch("http://h/p", "a2", 300));
        let entry = c.get("http://h/p").unwrap();
        assert_eq!(entry.etag, "a2");
        assert_eq!(entry.timestamp, 300);
        assert!(!c.touch("http://h/gone", "a3", 400));
    }

    #[test]
    fn unregister_removes_entry() {
        let c = cache();
        c.register("http://h/p", "a1", &headers(), "text/html", 100);
        assert!(c.unregister("http://h/p").is_some());
        assert!(c.get("http://h/p").is_none());
        assert!(c.unregister("http://h/p").is_none());
    }

    #[test]
    fn lru_overflow_evicts_oldest() {
        let c = cache();
        for i in 0..5 {
            c.register(&format!("http://h/{}", i), &format!("t{}", i), &headers(), "x", i);
        }
        assert_eq!(c.len(), 4);
        assert!(c.get("http://h/0").is_none());
        assert!(c.get("http://h/4").is_some());
    }

    #[tokio::test]
    async fn expiry_respects_validator() {
        let c = Arc::new(cache());
        c.register("http://h/p", "a1", &headers(), "x", 1);
        c.expire_after("http://h/p", "a1", Duration::from_millis(10));
        // Replacing the entry before the deadline cancels the expiry.
        c.register("http://h/p", "a2", &headers(), "x", 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(c.get("http://h/p").unwrap().etag, "a2");
    }

    #[tokio::test]
    async fn expiry_fires_on_matching_validator() {
        let c = Arc::new(cache());
        c.register("http://h/q", "b1", &headers(), "x", 1);
        c.expire_after("http://h/q", "b1", Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(c.get("http://h/q").is_none());
    }
}
