//! Response emission.
//!
//! Every response leaves through [`Emitter::finalize`]: header discipline,
//! body shaping (JSON encoding, CSV projection, degenerate methods), ranged
//! delivery, content-encoding negotiation with side-file reuse, and the
//! cache write-through that stamps successful GETs with a validator.

pub mod csv;
pub mod negotiate;
pub mod range;

use std::io::SeekFrom;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

use crate::cache::{validator, EtagCache};
use crate::cache::watcher::WatchRegistry;
use crate::config::Config;
use crate::pipeline::{Exchange, Payload};

pub struct Emitter {
    config: Arc<Config>,
    cache: Arc<EtagCache>,
    watchers: Arc<WatchRegistry>,
}

impl Emitter {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<EtagCache>,
        watchers: Arc<WatchRegistry>,
    ) -> Self {
        Self {
            config,
            cache,
            watchers,
        }
    }

    /// Finalize an exchange into a wire response.
    pub async fn finalize(&self, mut ex: Exchange) -> Response {
        self.shape_body(&mut ex);
        self.decorate(&mut ex);
        self.apply_range(&mut ex);

        let encoding = self.select_encoding(&ex);
        self.write_through(&mut ex).await;

        self.emit(ex, encoding).await
    }

    /// JSON encoding, CSV projection, degenerate methods, content-length.
    fn shape_body(&self, ex: &mut Exchange) {
        // JSON payloads are serialized with the client's requested indent.
        if let Payload::Json(value) = &ex.res.body {
            let indent = self.json_indent(ex.req.header("accept"));
            let text = to_json_string(value, indent);
            ex.res.body = Payload::Buffer(Bytes::from(text));
            ex.res.header("content-type", "application/json");
        }

        if let Payload::Buffer(buf) = &ex.res.body {
            let head = buf.iter().copied().find(|b| !b.is_ascii_whitespace());
            if matches!(head, Some(b'[') | Some(b'{')) {
                ex.res.header("content-type", "application/json");
            }
        }

        // JSON representations project to CSV on request.
        if ex.req.method == Method::GET
            && ex.res.status == 200
            && ex
                .res
                .get_header("content-type")
                .map(|ct| ct.contains("json"))
                .unwrap_or(false)
            && ex
                .req
                .header("accept")
                .map(|a| a.contains("text/csv"))
                .unwrap_or(false)
        {
            if let Payload::Buffer(buf) = &ex.res.body {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(buf) {
                    let projected = csv::project(&value);
                    ex.res.body = Payload::Buffer(Bytes::from(projected));
                    ex.res.header("content-type", "text/csv");
                    ex.res.header(
                        "content-disposition",
                        csv::disposition(&ex.req.parsed.path, &ex.req.parsed.query),
                    );
                }
            }
        }

        // Length of the identity representation, unless a handler pinned it.
        if ex.res.get_header("content-length").is_none() {
            match &ex.res.body {
                Payload::Buffer(buf) => {
                    let len = buf.len().to_string();
                    ex.res.header("content-length", len);
                }
                Payload::File { size, .. } => {
                    let len = size.to_string();
                    ex.res.header("content-length", len);
                }
                Payload::Empty => ex.res.header("content-length", "0"),
                Payload::Json(_) | Payload::Stream(_) => {}
            }
        }

        match ex.req.method {
            Method::HEAD => ex.res.body = Payload::Empty,
            Method::OPTIONS => {
                ex.res.body = Payload::Empty;
                ex.res.remove_header("content-type");
                ex.res.header("content-length", "0");
            }
            _ => {}
        }
    }

    /// Header discipline across status classes.
    fn decorate(&self, ex: &mut Exchange) {
        let status = ex.res.status;

        // Redirect control: the handler's headers go out verbatim.
        let redirect = (300..400).contains(&status) && status != 304;
        if !redirect {
            for (name, value) in &self.config.headers {
                ex.res
                    .headers
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }

            ex.res.header("allow", ex.req.allow.clone());
            if ex.res.get_header("date").is_none() {
                ex.res.header("date", http_date(chrono::Utc::now()));
            }
            if ex.res.get_header("transfer-encoding").is_none() {
                ex.res.header("transfer-encoding", "identity");
            }

            if ex.req.cors {
                let origin = ex
                    .req
                    .header("origin")
                    .map(str::to_string)
                    .or_else(|| {
                        ex.req
                            .header("referer")
                            .map(|r| r.trim_end_matches('/').to_string())
                    })
                    .unwrap_or_default();
                ex.res.header("access-control-allow-origin", origin);
                ex.res.header("access-control-allow-credentials", "true");
                ex.res
                    .header("access-control-allow-methods", ex.req.allow.clone());
            } else {
                let cors_keys: Vec<String> = ex
                    .res
                    .headers
                    .keys()
                    .filter(|k| k.starts_with("access-control-"))
                    .cloned()
                    .collect();
                for key in cors_keys {
                    ex.res.headers.remove(&key);
                }
            }

            let rate_limited = ex.res.get_header("x-ratelimit-limit").is_some()
                || ex.req.headers.contains_key("x-ratelimit-limit");
            if !ex.req.is_get_like() || status >= 400 || rate_limited {
                ex.res.remove_header("cache-control");
                ex.res.remove_header("etag");
                ex.res.remove_header("last-modified");
                if rate_limited {
                    ex.res.header("cache-control", "no-cache");
                }
            }

            if status == 304 {
                for name in [
                    "accept-ranges",
                    "content-encoding",
                    "content-length",
                    "content-type",
                    "date",
                    "transfer-encoding",
                    "last-modified",
                ] {
                    ex.res.remove_header(name);
                }
            }

            if (status == 404 && !ex.req.allow.is_empty()) || status >= 500 {
                ex.res.remove_header("accept-ranges");
            }
        }

        let reason = StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown");
        ex.res.header("status", format!("{} {}", status, reason));
    }

    /// Partial-content negotiation.
    fn apply_range(&self, ex: &mut Exchange) {
        if ex.res.status != 200 {
            return;
        }
        let Some(spec) = ex.req.header("range").map(str::to_string) else {
            return;
        };
        let total = match &ex.res.body {
            Payload::Buffer(buf) => buf.len() as u64,
            Payload::File { size, .. } => *size,
            _ => return,
        };

        match range::parse(&spec, total) {
            Some(r) => {
                ex.res.status = 206;
                ex.res.header("content-range", r.content_range());
                ex.res.header("content-length", r.length().to_string());
                match &mut ex.res.body {
                    Payload::Buffer(buf) => {
                        *buf = buf.slice(r.start as usize..=r.end as usize);
                    }
                    Payload::File { range, .. } => *range = Some((r.start, r.end)),
                    _ => {}
                }
                ex.res.header("status", "206 Partial Content");
            }
            None => {
                ex.req.headers.remove("range");
                debug!(range = %spec, "unsatisfiable range");
                ex.res.status = 416;
                ex.res.body = Payload::Empty;
                ex.res.header("content-range", format!("bytes */{}", total));
                // Decoration ran at 200; shed the success-only fields.
                for name in ["content-length", "cache-control", "etag", "last-modified"] {
                    ex.res.remove_header(name);
                }
                ex.res.header("status", "416 Range Not Satisfiable");
            }
        }
    }

    fn select_encoding(&self, ex: &Exchange) -> Option<negotiate::Encoding> {
        // Content-Range advertises the identity representation; compressing
        // the slice would leave it describing a different byte stream.
        // Whole representations only.
        if ex.res.status == 206 {
            return None;
        }
        let body_empty = ex.res.body.is_empty()
            && !matches!(ex.res.body, Payload::File { .. } | Payload::Stream(_));
        negotiate::select(
            self.config.compress,
            ex.res.status,
            body_empty,
            ex.res.get_header("content-type").unwrap_or(""),
            ex.req.header("user-agent"),
            ex.req.header("accept-encoding"),
        )
    }

    /// Register successful GET representations, stamped with a validator.
    async fn write_through(&self, ex: &mut Exchange) {
        if ex.req.method != Method::GET {
            return;
        }
        if !(ex.res.status == 200 || ex.res.status == 304) {
            return;
        }
        let cacheable = ex
            .res
            .get_header("cache-control")
            .map(|cc| {
                !(cc.contains("no-cache") || cc.contains("no-store") || cc.contains("private"))
            })
            .unwrap_or(true);
        if !cacheable {
            return;
        }

        if ex.res.get_header("etag").is_none() {
            let length = ex
                .res
                .get_header("content-length")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or_else(|| match &ex.res.body {
                    Payload::Buffer(buf) => buf.len() as u64,
                    Payload::File { size, .. } => *size,
                    _ => 0,
                });
            let last_modified = ex.res.get_header("last-modified").unwrap_or("");
            let body = match &ex.res.body {
                Payload::Buffer(buf) => &buf[..],
                _ => &[],
            };
            let tag = validator::body_tag(
                &ex.req.url,
                length,
                last_modified,
                body,
                self.config.seed,
            );
            ex.res.header("etag", format!("\"{}\"", tag));
        }

        if self.cache.get(&ex.req.url).is_none() {
            let etag = ex.res.get_header("etag").unwrap_or("").to_string();
            let mimetype = ex
                .res
                .get_header("content-type")
                .unwrap_or("text/plain")
                .to_string();
            self.cache.register(
                &ex.req.url,
                &etag,
                &ex.res.headers,
                &mimetype,
                chrono::Utc::now().timestamp(),
            );
        }

        if let Some(path) = &ex.req.local_path {
            self.watchers.watch(&ex.req.url, path);
        }
    }

    /// Materialize the response, compressing and persisting as negotiated.
    async fn emit(&self, mut ex: Exchange, encoding: Option<negotiate::Encoding>) -> Response {
        let etag = ex
            .res
            .get_header("etag")
            .map(|t| validator::unquote(t).to_string());

        let body = std::mem::take(&mut ex.res.body);
        let body = match (body, encoding) {
            (Payload::Buffer(buf), Some(enc)) => {
                match negotiate::compress(&buf, enc) {
                    Ok(compressed) => {
                        ex.res.header("content-encoding", enc.token());
                        ex.res
                            .header("content-length", compressed.len().to_string());
                        if let Some(tag) = &etag {
                            let side = self.cache.side_file(tag, enc.ext());
                            if negotiate::side_file_size(&side).await.is_none() {
                                let url = ex.req.url.clone();
                                let cache = Arc::clone(&self.cache);
                                let data = compressed.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = negotiate::persist(data, side).await {
                                        warn!(url = %url, error = %e, "side file write failed");
                                        cache.unregister(&url);
                                    }
                                });
                            }
                        }
                        Body::from(compressed)
                    }
                    Err(e) => {
                        error!(error = %e, "compression failed, sending identity");
                        ex.res
                            .header("content-length", buf.len().to_string());
                        Body::from(buf)
                    }
                }
            }
            (Payload::File { path, size, range: None }, Some(enc)) if etag.is_some() => {
                let tag = etag.as_deref().unwrap_or_default();
                let side = self.cache.side_file(tag, enc.ext());
                let side_size = match negotiate::side_file_size(&side).await {
                    Some(existing) => Some(existing),
                    None => {
                        match negotiate::persist_file(path.clone(), side.clone(), enc).await {
                            Ok(written) => Some(written),
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "side file write failed");
                                self.cache.unregister(&ex.req.url);
                                None
                            }
                        }
                    }
                };
                match side_size {
                    Some(len) => {
                        ex.res.header("content-encoding", enc.token());
                        ex.res.header("content-length", len.to_string());
                        match self.stream_file(&side, None).await {
                            Some(stream) => stream,
                            None => return self.bail(ex).await,
                        }
                    }
                    None => match self.stream_file(&path, None).await {
                        Some(stream) => {
                            ex.res.header("content-length", size.to_string());
                            stream
                        }
                        None => return self.bail(ex).await,
                    },
                }
            }
            (Payload::File { path, size, range }, Some(enc)) => {
                // No validator to name a side file under; compress the whole
                // representation in memory instead.
                match read_slice(&path, range, size).await {
                    Ok(data) => match negotiate::compress(&data, enc) {
                        Ok(compressed) => {
                            ex.res.header("content-encoding", enc.token());
                            ex.res
                                .header("content-length", compressed.len().to_string());
                            Body::from(compressed)
                        }
                        Err(_) => {
                            ex.res.header("content-length", data.len().to_string());
                            Body::from(data)
                        }
                    },
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "file read failed");
                        return self.bail(ex).await;
                    }
                }
            }
            (Payload::File { path, range, .. }, None) => {
                match self.stream_file(&path, range).await {
                    Some(stream) => stream,
                    None => return self.bail(ex).await,
                }
            }
            (Payload::Stream(stream), _) => Body::from_stream(stream),
            (Payload::Buffer(buf), None) => Body::from(buf),
            (Payload::Empty, _) => Body::empty(),
            (Payload::Json(value), _) => {
                // Shaping serializes JSON before emission; tolerate stragglers.
                Body::from(value.to_string())
            }
        };

        ex.res
            .header("x-response-time", format!("{:.2} ms", ex.req.elapsed_ms()));

        materialize(ex.res.status, &ex.res.headers, body)
    }

    /// Open a file for streaming, honoring an inclusive range.
    async fn stream_file(
        &self,
        path: &std::path::Path,
        range: Option<(u64, u64)>,
    ) -> Option<Body> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) => {
                error!(path = %path.display(), error = %e, "file open failed");
                return None;
            }
        };
        match range {
            Some((start, end)) => {
                if let Err(e) = file.seek(SeekFrom::Start(start)).await {
                    error!(path = %path.display(), error = %e, "file seek failed");
                    return None;
                }
                let take = file.take(end - start + 1);
                Some(Body::from_stream(ReaderStream::new(take)))
            }
            None => Some(Body::from_stream(ReaderStream::new(file))),
        }
    }

    /// Terminal fallback when the negotiated body cannot be produced.
    async fn bail(&self, mut ex: Exchange) -> Response {
        ex.res.status = 500;
        ex.res.remove_header("content-encoding");
        ex.res.remove_header("content-length");
        ex.res.header("status", "500 Internal Server Error");
        ex.res
            .header("x-response-time", format!("{:.2} ms", ex.req.elapsed_ms()));
        materialize(500, &ex.res.headers, Body::from("Internal Server Error"))
    }

    fn json_indent(&self, accept: Option<&str>) -> usize {
        accept
            .and_then(|a| {
                a.split(';')
                    .filter_map(|part| part.trim().strip_prefix("indent="))
                    .next()
                    .and_then(|n| n.parse().ok())
            })
            .unwrap_or(self.config.json)
    }
}

/// Serialize a JSON value with an explicit indent width.
fn to_json_string(value: &serde_json::Value, indent: usize) -> String {
    if indent == 0 {
        return value.to_string();
    }
    let pad = vec![b' '; indent];
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(&pad);
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    match serde::Serialize::serialize(value, &mut serializer) {
        Ok(()) => String::from_utf8(out).unwrap_or_else(|_| value.to_string()),
        Err(_) => value.to_string(),
    }
}

/// RFC 7231 date.
pub fn http_date(when: chrono::DateTime<chrono::Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

async fn read_slice(
    path: &std::path::Path,
    range: Option<(u64, u64)>,
    size: u64,
) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    match range {
        Some((start, end)) => {
            file.seek(SeekFrom::Start(start)).await?;
            let mut data = vec![0u8; (end - start + 1) as usize];
            file.read_exact(&mut data).await?;
            Ok(data)
        }
        None => {
            let mut data = Vec::with_capacity(size as usize);
            file.read_to_end(&mut data).await?;
            Ok(data)
        }
    }
}

/// Build the axum response from the finished state.
fn materialize(
    status: u16,
    headers: &std::collections::BTreeMap<String, String>,
    body: Body,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder.body(body).unwrap_or_else(|e| {
        error!(error = %e, "response build failed");
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{RequestContext, ResponseState};
    use axum::http::HeaderMap;
    use std::collections::HashMap;
    use std::time::Instant;

    fn emitter() -> Emitter {
        let mut config = Config {
            default: "all".to_string(),
            ..Config::default()
        };
        config.headers = HashMap::new();
        config.normalize();
        let config = Arc::new(config);
        let cache = Arc::new(EtagCache::new(16, std::env::temp_dir()));
        let watchers = WatchRegistry::new(Arc::clone(&cache), 625).unwrap();
        Emitter::new(config, cache, watchers)
    }

    fn exchange(method: Method, headers: HeaderMap) -> Exchange {
        Exchange {
            req: RequestContext {
                method,
                uri: "/data".to_string(),
                url: "http://localhost/data".to_string(),
                parsed: crate::pipeline::url::canonicalize(
                    false,
                    "localhost",
                    "/data",
                    "",
                    None,
                ),
                vhost: "all".to_string(),
                ip: "127.0.0.1".parse().unwrap(),
                headers,
                body: Bytes::new(),
                allow: "GET, HEAD, OPTIONS".to_string(),
                cors: false,
                start: Instant::now(),
                local_path: None,
            },
            res: ResponseState::new(),
        }
    }

    #[tokio::test]
    async fn status_304_sheds_entity_headers() {
        let emitter = emitter();
        let mut ex = exchange(Method::GET, HeaderMap::new());
        ex.res.status = 304;
        ex.res.header("content-type", "text/html");
        ex.res.header("age", "4");

        let response = emitter.finalize(ex).await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(response.headers().get("content-type").is_none());
        assert!(response.headers().get("content-length").is_none());
        assert!(response.headers().get("date").is_none());
        assert_eq!(response.headers().get("age").unwrap(), "4");
    }

    #[tokio::test]
    async fn ranged_buffer_yields_206() {
        let emitter = emitter();
        let mut headers = HeaderMap::new();
        headers.insert("range", "bytes=0-3".parse().unwrap());
        let mut ex = exchange(Method::GET, headers);
        ex.res.header("content-type", "application/octet-stream");
        ex.res.body = Payload::Buffer(Bytes::from_static(b"0123456789"));

        let response = emitter.finalize(ex).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get("content-range").unwrap(),
            "bytes 0-3/10"
        );
        assert_eq!(response.headers().get("content-length").unwrap(), "4");
    }

    #[tokio::test]
    async fn ranged_responses_are_never_compressed() {
        let emitter = emitter();
        let mut headers = HeaderMap::new();
        headers.insert("range", "bytes=0-3".parse().unwrap());
        headers.insert("accept-encoding", "gzip, deflate".parse().unwrap());
        let mut ex = exchange(Method::GET, headers);
        ex.res.header("content-type", "text/plain");
        ex.res.body = Payload::Buffer(Bytes::from_static(b"0123456789"));

        let response = emitter.finalize(ex).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert!(response.headers().get("content-encoding").is_none());
        assert_eq!(
            response.headers().get("content-range").unwrap(),
            "bytes 0-3/10"
        );
        assert_eq!(response.headers().get("content-length").unwrap(), "4");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"0123");
    }

    #[tokio::test]
    async fn inverted_range_yields_416() {
        let emitter = emitter();
        let mut headers = HeaderMap::new();
        headers.insert("range", "bytes=9-1".parse().unwrap());
        let mut ex = exchange(Method::GET, headers);
        ex.res.body = Payload::Buffer(Bytes::from_static(b"0123456789"));

        let response = emitter.finalize(ex).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn csv_projection_applies_on_accept() {
        let emitter = emitter();
        let mut headers = HeaderMap::new();
        headers.insert("accept", "text/csv".parse().unwrap());
        let mut ex = exchange(Method::GET, headers);
        ex.res.body = Payload::Buffer(Bytes::from_static(b"[{\"a\":1}]"));

        let response = emitter.finalize(ex).await;
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/csv"
        );
        assert_eq!(
            response.headers().get("content-disposition").unwrap(),
            "attachment; filename=\"data_.csv\""
        );
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(body.starts_with(b"a\n1\n"));
    }

    #[tokio::test]
    async fn compression_persists_a_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            default: "all".to_string(),
            ..Config::default()
        };
        config.tmp = Some(dir.path().to_path_buf());
        config.normalize();
        let config = Arc::new(config);
        let cache = Arc::new(EtagCache::new(16, dir.path().to_path_buf()));
        let watchers = WatchRegistry::new(Arc::clone(&cache), 625).unwrap();
        let emitter = Emitter::new(config, Arc::clone(&cache), watchers);

        let mut headers = HeaderMap::new();
        headers.insert("accept-encoding", "gzip".parse().unwrap());
        let mut ex = exchange(Method::GET, headers);
        ex.res.header("content-type", "text/plain");
        ex.res.body = Payload::Buffer(Bytes::from_static(
            b"a body long enough to be worth compressing, repeated words words words",
        ));

        let response = emitter.finalize(ex).await;
        assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");

        let entry = cache.get("http://localhost/data").expect("write-through entry");
        let side = cache.side_file(&entry.etag, "gz");
        for _ in 0..50 {
            if side.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(side.exists());
    }

    #[tokio::test]
    async fn write_through_registers_and_respects_cache_control() {
        let emitter = emitter();
        let mut ex = exchange(Method::GET, HeaderMap::new());
        ex.res.header("content-type", "text/plain");
        ex.res.body = Payload::Buffer(Bytes::from_static(b"hello"));
        let _ = emitter.finalize(ex).await;
        assert!(emitter.cache.get("http://localhost/data").is_some());

        let mut ex = exchange(Method::GET, HeaderMap::new());
        ex.req.url = "http://localhost/private".to_string();
        ex.res.header("cache-control", "private");
        ex.res.body = Payload::Buffer(Bytes::from_static(b"hello"));
        let _ = emitter.finalize(ex).await;
        assert!(emitter.cache.get("http://localhost/private").is_none());
    }

    #[tokio::test]
    async fn options_reports_zero_length_without_type() {
        let emitter = emitter();
        let mut ex = exchange(Method::OPTIONS, HeaderMap::new());
        ex.res.header("content-type", "text/plain");
        ex.res.body = Payload::Buffer(Bytes::from_static(b"ignored"));

        let response = emitter.finalize(ex).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-length").unwrap(), "0");
        assert!(response.headers().get("content-type").is_none());
        assert_eq!(
            response.headers().get("allow").unwrap(),
            "GET, HEAD, OPTIONS"
        );
    }

    #[tokio::test]
    async fn cors_headers_follow_the_origin_flag() {
        let emitter = emitter();
        let mut headers = HeaderMap::new();
        headers.insert("origin", "http://app.example".parse().unwrap());
        let mut ex = exchange(Method::GET, headers);
        ex.req.cors = true;
        ex.res.body = Payload::Buffer(Bytes::from_static(b"x"));

        let response = emitter.finalize(ex).await;
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "http://app.example"
        );
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-credentials")
                .unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn response_time_and_status_headers_are_stamped() {
        let emitter = emitter();
        let mut ex = exchange(Method::GET, HeaderMap::new());
        ex.res.body = Payload::Buffer(Bytes::from_static(b"x"));
        let response = emitter.finalize(ex).await;
        let timing = response
            .headers()
            .get("x-response-time")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(timing.ends_with(" ms"));
        assert_eq!(response.headers().get("status").unwrap(), "200 OK");
    }
}
