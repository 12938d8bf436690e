//! File-backed resource handler.
//!
//! Serves RESTful CRUD against a virtual host's document root: GET streams
//! the file (with conditional-request support), PUT/POST write the buffered
//! request body, DELETE unlinks. Path resolution is jailed to the vhost
//! root; directory GETs resolve the configured index names.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::http::Method;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::cache::{validator, EtagCache};
use crate::config::Config;
use crate::emit::http_date;
use crate::error::{Result, ServerError};
use crate::pipeline::{Exchange, Payload};

pub struct FileHandler {
    config: Arc<Config>,
    cache: Arc<EtagCache>,
}

impl FileHandler {
    pub fn new(config: Arc<Config>, cache: Arc<EtagCache>) -> Self {
        Self { config, cache }
    }

    pub async fn handle(&self, ex: &mut Exchange) -> Result<()> {
        let rel = safe_relative(&ex.req.parsed.path)
            .ok_or_else(|| ServerError::NotFound(ex.req.parsed.path.clone()))?;
        let lpath = self.config.vhost_root(&ex.req.vhost).join(&rel);

        match tokio::fs::metadata(&lpath).await {
            Err(_) => match ex.req.method {
                // A write to a path that does not stat yet creates it.
                Method::PUT | Method::POST => self.write(ex, &lpath, true).await,
                _ => Err(ServerError::NotFound(ex.req.parsed.path.clone())),
            },
            Ok(meta) if meta.is_file() => self.dispatch(ex, &lpath, meta.len(), &meta).await,
            Ok(_) => self.directory(ex, &lpath).await,
        }
    }

    async fn dispatch(
        &self,
        ex: &mut Exchange,
        lpath: &Path,
        size: u64,
        meta: &std::fs::Metadata,
    ) -> Result<()> {
        match ex.req.method {
            Method::GET | Method::HEAD | Method::OPTIONS => {
                self.serve(ex, lpath, size, meta).await
            }
            Method::PUT | Method::POST => {
                self.check_precondition(ex, lpath, size, meta)?;
                self.write(ex, lpath, false).await
            }
            Method::DELETE => self.delete(ex, lpath).await,
            _ => Err(ServerError::MethodNotAllowed(ex.req.method.to_string())),
        }
    }

    /// GET/HEAD/OPTIONS for a regular file.
    async fn serve(
        &self,
        ex: &mut Exchange,
        lpath: &Path,
        size: u64,
        meta: &std::fs::Metadata,
    ) -> Result<()> {
        let mtime = modified(meta);
        let etag = validator::file_tag(&ex.req.url, size, mtime.timestamp(), self.config.seed);
        let mimetype = mime_guess::from_path(lpath)
            .first_or_octet_stream()
            .to_string();

        ex.res.header("allow", ex.req.allow.clone());
        ex.res.header("content-length", size.to_string());
        ex.res.header("content-type", mimetype);
        ex.res.header("etag", format!("\"{}\"", etag));
        ex.res.header("last-modified", http_date(mtime));

        let fresh = ex
            .req
            .header("if-none-match")
            .map(|inm| validator::unquote(inm) == etag)
            .unwrap_or(false)
            || ex
                .req
                .header("if-modified-since")
                .and_then(parse_http_date)
                .map(|since| since >= mtime)
                .unwrap_or(false);

        if fresh {
            ex.res.status = 304;
            ex.res.body = Payload::Empty;
        } else {
            ex.res.status = 200;
            ex.res.body = Payload::File {
                path: lpath.to_path_buf(),
                size,
                range: None,
            };
            ex.req.local_path = Some(lpath.to_path_buf());
        }
        ex.res.finished = true;
        debug!(path = %lpath.display(), status = ex.res.status, "file served");
        Ok(())
    }

    /// Directory resolution: redirect, index lookup or non-GET dispatch.
    async fn directory(&self, ex: &mut Exchange, lpath: &Path) -> Result<()> {
        if ex.req.method == Method::GET && !ex.req.parsed.path.ends_with('/') {
            let mut location = format!("{}/", ex.req.parsed.path);
            if !ex.req.parsed.query.is_empty() {
                location.push('?');
                location.push_str(&ex.req.parsed.query);
            }
            ex.res.redirect(&location);
            return Ok(());
        }

        if !ex.req.is_get_like() {
            return match ex.req.method {
                Method::PUT | Method::POST => self.write(ex, lpath, false).await,
                Method::DELETE => self.delete(ex, lpath).await,
                _ => Err(ServerError::MethodNotAllowed(ex.req.method.to_string())),
            };
        }

        for index in &self.config.index {
            let candidate = lpath.join(index);
            if let Ok(meta) = tokio::fs::metadata(&candidate).await {
                if meta.is_file() {
                    return self.serve(ex, &candidate, meta.len(), &meta).await;
                }
            }
        }
        Err(ServerError::NotFound(ex.req.parsed.path.clone()))
    }

    /// `If-Match`/`ETag` write preconditions against the current stat.
    fn check_precondition(
        &self,
        ex: &Exchange,
        _lpath: &Path,
        size: u64,
        meta: &std::fs::Metadata,
    ) -> Result<()> {
        let candidate = ex
            .req
            .header("if-match")
            .or_else(|| ex.req.header("etag"));
        if let Some(candidate) = candidate {
            let current =
                validator::file_tag(&ex.req.url, size, modified(meta).timestamp(), self.config.seed);
            if validator::unquote(candidate) != current {
                return Err(ServerError::PreconditionFailed(ex.req.parsed.path.clone()));
            }
        }
        Ok(())
    }

    async fn write(&self, ex: &mut Exchange, lpath: &Path, create: bool) -> Result<()> {
        tokio::fs::write(lpath, &ex.req.body).await.map_err(|e| {
            warn!(path = %lpath.display(), error = %e, "file write failed");
            ServerError::Internal(format!("write failed: {}", e))
        })?;

        // The representation changed; the next GET re-registers it.
        self.cache.unregister(&ex.req.url);

        ex.res.status = if create { 201 } else { 204 };
        ex.res.body = Payload::Empty;
        ex.res.finished = true;
        debug!(path = %lpath.display(), created = create, "file written");
        Ok(())
    }

    async fn delete(&self, ex: &mut Exchange, lpath: &Path) -> Result<()> {
        self.cache.unregister(&ex.req.url);
        tokio::fs::remove_file(lpath).await.map_err(|e| {
            warn!(path = %lpath.display(), error = %e, "unlink failed");
            ServerError::Internal(format!("unlink failed: {}", e))
        })?;

        ex.res.status = 204;
        ex.res.body = Payload::Empty;
        ex.res.finished = true;
        debug!(path = %lpath.display(), "file deleted");
        Ok(())
    }
}

/// Jail a request path to the document root.
///
/// Rejects paths that begin with `..` after stripping the leading slash, or
/// whose parent-traversal count reaches the named-segment count.
fn safe_relative(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.starts_with("..") {
        return None;
    }
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    let ups = segments.iter().filter(|s| **s == "..").count();
    let named = segments.len() - ups;
    if ups > 0 && ups >= named {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

fn modified(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .ok()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(Utc::now)
}

fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
