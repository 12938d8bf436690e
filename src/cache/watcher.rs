//! Filesystem watch registry for cache coherence.
//!
//! One watch per served local path, created on the first successful GET.
//! A rename (or a path that no longer stats) tears the watch down and
//! unregisters the cache entry for the URL it served; a content change
//! refreshes the entry's validator and timestamp in place.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use super::{validator, EtagCache};

pub struct WatchRegistry {
    watcher: Mutex<RecommendedWatcher>,
    paths: DashMap<PathBuf, String>,
    cache: Arc<EtagCache>,
    seed: u32,
}

impl WatchRegistry {
    pub fn new(cache: Arc<EtagCache>, seed: u32) -> anyhow::Result<Arc<Self>> {
        let (tx, rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        let registry = Arc::new(Self {
            watcher: Mutex::new(watcher),
            paths: DashMap::new(),
            cache,
            seed,
        });

        let weak = Arc::downgrade(&registry);
        std::thread::Builder::new()
            .name("fs-watch".to_string())
            .spawn(move || {
                while let Ok(res) = rx.recv() {
                    let Some(registry) = weak.upgrade() else { break };
                    match res {
                        Ok(event) => registry.handle_event(event),
                        Err(e) => warn!(error = %e, "watch stream error"),
                    }
                }
            })?;

        Ok(registry)
    }

    /// Watch `path` on behalf of `url`; idempotent per path.
    pub fn watch(&self, url: &str, path: &Path) {
        if self.paths.contains_key(path) {
            return;
        }
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        match watcher.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => {
                self.paths.insert(path.to_path_buf(), url.to_string());
                debug!(url, path = %path.display(), "watch registered");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "watch failed"),
        }
    }

    fn handle_event(&self, event: Event) {
        for path in &event.paths {
            let Some(url) = self.paths.get(path).map(|e| e.value().clone()) else {
                continue;
            };
            match event.kind {
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                    self.cleanup(path, &url);
                }
                EventKind::Modify(_) | EventKind::Create(_) => {
                    self.refresh(path, &url);
                }
                _ => {}
            }
        }
    }

    /// Content changed: refresh the entry's validator in place.
    fn refresh(&self, path: &Path, url: &str) {
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or_default();
                let etag = validator::file_tag(url, meta.len(), mtime, self.seed);
                let now = chrono::Utc::now().timestamp();
                if !self.cache.touch(url, &etag, now) {
                    // Entry already evicted; the watch has nothing to serve.
                    self.cleanup(path, url);
                } else {
                    debug!(url, etag = %etag, "watched entry refreshed");
                }
            }
            Err(_) => self.cleanup(path, url),
        }
    }

    /// Single-shot teardown: drop the watch and the cache entry.
    fn cleanup(&self, path: &Path, url: &str) {
        if self.paths.remove(path).is_none() {
            return;
        }
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = watcher.unwatch(path) {
            debug!(path = %path.display(), error = %e, "unwatch failed");
        }
        drop(watcher);
        self.cache.unregister(url);
        debug!(url, path = %path.display(), "watch cleaned up");
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn clear(&self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        for entry in self.paths.iter() {
            let _ = watcher.unwatch(entry.key());
        }
        drop(watcher);
        self.paths.clear();
    }
}
