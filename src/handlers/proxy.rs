//! Reverse-proxy handler.
//!
//! Mounted under a route prefix for all five verbs. Binary-ish upstream
//! content streams straight through; textual content is buffered, relocated
//! references are rewritten to the mount point, and the response inherits
//! the upstream cache policy before leaving through the emitter.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use axum::http::Method;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use regex::Regex;
use tracing::{debug, warn};

use crate::cache::{validator, EtagCache};
use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::pipeline::{Exchange, Payload};

/// Mime classes that pass through without buffering.
fn streaming_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new("application|audio|chemical|conference|font|image|message|model|xml|video")
            .unwrap()
    })
}

/// Headers that must not be forwarded upstream verbatim.
const HOP_BY_HOP: [&str; 6] = [
    "connection",
    "host",
    "keep-alive",
    "proxy-authorization",
    "te",
    "upgrade",
];

pub struct ProxyHandler {
    config: Arc<Config>,
    cache: Arc<EtagCache>,
    client: reqwest::Client,
    origin: String,
    route: String,
    stream: bool,
    rewrite_re: Regex,
}

impl ProxyHandler {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<EtagCache>,
        client: reqwest::Client,
        route: &str,
        origin: &str,
        stream: bool,
    ) -> anyhow::Result<Arc<Self>> {
        let rewrite_re = Regex::new(&config.proxy.rewrite.join("|"))?;
        Ok(Arc::new(Self {
            config,
            cache,
            client,
            origin: origin.trim_end_matches('/').to_string(),
            route: route.to_string(),
            stream,
            rewrite_re,
        }))
    }

    /// Build the keep-alive upstream client shared by every proxy mount.
    ///
    /// HTTPS upstreams with self-signed chains are accepted; the proxy is
    /// the trust boundary here, not the upstream certificate.
    pub fn client(config: &Config) -> anyhow::Result<reqwest::Client> {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(config.proxy.max_connections)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create upstream client: {}", e))
    }

    pub async fn handle(&self, ex: &mut Exchange) -> Result<()> {
        let tail = if self.route == "/" {
            ex.req.uri.clone()
        } else {
            ex.req
                .uri
                .strip_prefix(&self.route)
                .unwrap_or(&ex.req.uri)
                .to_string()
        };
        let target = format!(
            "{}{}",
            self.origin,
            if tail.is_empty() { "/" } else { tail.as_str() }
        );

        if self.streaming(&target) {
            self.stream_through(ex, &target).await
        } else {
            self.rewrite_through(ex, &target).await
        }
    }

    /// Streaming applies when asked for, or when the upstream path has a
    /// binary-ish extension (never JSON).
    fn streaming(&self, target: &str) -> bool {
        if self.stream {
            return true;
        }
        let path = target.split('?').next().unwrap_or(target);
        let mime = mime_guess::from_path(path).first_raw().unwrap_or("");
        !mime.contains("json") && streaming_re().is_match(mime)
    }

    fn upstream_request(
        &self,
        ex: &Exchange,
        target: &str,
        rewritable: bool,
    ) -> reqwest::RequestBuilder {
        let method = reqwest::Method::from_bytes(ex.req.method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut builder = self.client.request(method, target);

        for (name, value) in ex.req.headers.iter() {
            let name_str = name.as_str();
            if HOP_BY_HOP.contains(&name_str) {
                continue;
            }
            // The body must stay rewritable, so the upstream negotiates
            // identity.
            if rewritable && name_str == "accept-encoding" {
                continue;
            }
            builder = builder.header(name_str, value.as_bytes());
        }

        let forwarded = match ex.req.header("x-forwarded-for") {
            Some(existing) => format!("{}, {}", existing, ex.req.ip),
            None => ex.req.ip.to_string(),
        };
        let server_name = self
            .config
            .id
            .clone()
            .unwrap_or_else(|| self.config.banner());
        builder = builder
            .header("x-host", ex.req.parsed.host.clone())
            .header("x-forwarded-for", forwarded)
            .header("x-forwarded-proto", ex.req.parsed.scheme.clone())
            .header("x-forwarded-server", server_name)
            .header("x-real-ip", ex.req.ip.to_string());

        if !ex.req.body.is_empty() {
            builder = builder.body(ex.req.body.clone());
        }
        builder
    }

    async fn stream_through(&self, ex: &mut Exchange, target: &str) -> Result<()> {
        debug!(target, "proxy streaming");
        let response = self
            .upstream_request(ex, target, false)
            .send()
            .await
            .map_err(map_upstream_error)?;

        ex.res.status = response.status().as_u16();
        for (name, value) in response.headers() {
            if name == "transfer-encoding" || name == "connection" {
                continue;
            }
            if let Ok(value) = value.to_str() {
                ex.res.header(name.as_str(), value);
            }
        }
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        ex.res.body = Payload::Stream(Box::pin(stream));
        ex.res.finished = true;
        Ok(())
    }

    async fn rewrite_through(&self, ex: &mut Exchange, target: &str) -> Result<()> {
        debug!(target, "proxy rewrite");
        let response = self
            .upstream_request(ex, target, true)
            .send()
            .await
            .map_err(map_upstream_error)?;

        let status = response.status().as_u16();
        if status < 100 {
            return Err(ServerError::Upstream(format!(
                "upstream produced status {}",
                status
            )));
        }

        let upstream_server = response
            .headers()
            .get("server")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        for (name, value) in response.headers() {
            if name == "transfer-encoding" || name == "connection" {
                continue;
            }
            if let Ok(value) = value.to_str() {
                ex.res.header(name.as_str(), value);
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ServerError::Upstream(format!("body read failed: {}", e)))?;

        if status >= 500 {
            ex.res.status = status;
            ex.res.body = Payload::Buffer(body);
            ex.res.finished = true;
            return Ok(());
        }

        let via = match ex.res.get_header("via") {
            Some(existing) => format!("{}, {}", existing, upstream_server),
            None => upstream_server,
        };
        ex.res.header("via", via);
        ex.res.header("server", self.config.banner());

        let mut body = body;
        if status != 304 {
            let content_type = ex.res.get_header("content-type").unwrap_or("").to_string();
            if self.rewrite_re.is_match(&content_type) {
                let rewritten = self.rewrite_body(ex, &body, &content_type);
                if let Some(text) = rewritten {
                    body = Bytes::from(text);
                    // The size changed under rewriting.
                    ex.res.remove_header("content-length");
                }
            }
        }

        // Inherit the upstream freshness lifetime.
        let etag = self.stamp_validator(ex, status, &body);
        if ex.req.method == Method::GET && (status == 200 || status == 304) {
            if let Some(ttl) = freshness_lifetime(&ex.res) {
                self.cache.expire_after(&ex.req.url, &etag, ttl);
            }
        }

        if let Some(candidate) = ex.req.header("if-none-match") {
            if status != 304 && validator::unquote(candidate) == etag {
                let age = self
                    .cache
                    .get(&ex.req.url)
                    .map(|e| (Utc::now().timestamp() - e.timestamp).max(0))
                    .unwrap_or(0);
                ex.res.status = 304;
                ex.res.header("age", age.to_string());
                ex.res.body = Payload::Empty;
                ex.res.finished = true;
                return Ok(());
            }
        }

        ex.res.status = status;
        ex.res.body = Payload::Buffer(body);
        ex.res.finished = true;
        Ok(())
    }

    /// Relocate upstream references into our namespace.
    fn rewrite_body(&self, ex: &Exchange, body: &[u8], content_type: &str) -> Option<String> {
        let text = std::str::from_utf8(body).ok()?;
        let local_origin = format!("{}://{}", ex.req.parsed.scheme, ex.req.parsed.host);
        let mount = if self.route == "/" {
            String::new()
        } else {
            self.route.clone()
        };

        let mut out = text.replace(&self.origin, &format!("{}{}", local_origin, mount));

        if !mount.is_empty() {
            if content_type.contains("json") || serde_json::from_str::<serde_json::Value>(&out).is_ok() {
                // Absolute internal references inside JSON strings.
                static JSON_REF: OnceLock<Regex> = OnceLock::new();
                let re = JSON_REF
                    .get_or_init(|| Regex::new(r#""(/[A-Za-z0-9_][^"]*)""#).unwrap());
                out = re
                    .replace_all(&out, format!("\"{}$1\"", mount).as_str())
                    .into_owned();
            } else {
                static ATTR_REF: OnceLock<Regex> = OnceLock::new();
                let re = ATTR_REF
                    .get_or_init(|| Regex::new(r#"(href|src)=(["'])/"#).unwrap());
                out = re
                    .replace_all(&out, format!("$1=$2{}/", mount).as_str())
                    .into_owned();
            }
        }
        Some(out)
    }

    /// Compute (or override) the validator for the relayed representation.
    fn stamp_validator(&self, ex: &mut Exchange, status: u16, body: &[u8]) -> String {
        if status == 304 {
            if let Some(existing) = ex.res.get_header("etag") {
                return validator::unquote(existing).to_string();
            }
        }
        let last_modified = ex.res.get_header("last-modified").unwrap_or("").to_string();
        let tag = validator::body_tag(
            &ex.req.url,
            body.len() as u64,
            &last_modified,
            body,
            self.config.seed,
        );
        ex.res.header("etag", format!("\"{}\"", tag));
        tag
    }
}

/// Upstream freshness from `Cache-Control: max-age` or `Expires`.
fn freshness_lifetime(res: &crate::pipeline::ResponseState) -> Option<Duration> {
    if let Some(cc) = res.get_header("cache-control") {
        if cc.contains("no-cache") || cc.contains("no-store") || cc.contains("private") {
            return None;
        }
        for directive in cc.split(',') {
            if let Some(raw) = directive.trim().strip_prefix("max-age=") {
                if let Ok(secs) = raw.parse::<u64>() {
                    return Some(Duration::from_secs(secs));
                }
            }
        }
    }
    if let Some(expires) = res.get_header("expires") {
        if let Ok(when) = DateTime::parse_from_rfc2822(expires) {
            let delta = when.with_timezone(&Utc).timestamp() - Utc::now().timestamp();
            if delta > 0 {
                return Some(Duration::from_secs(delta as u64));
            }
        }
    }
    None
}

/// Connection refusal reads as the upstream being down; the rest is a
/// relaying fault.
fn map_upstream_error(e: reqwest::Error) -> ServerError {
    if e.is_connect() {
        warn!(error = %e, "upstream connection refused");
        ServerError::ServiceUnavailable(format!("upstream unreachable: {}", e))
    } else {
        warn!(error = %e, "upstream request failed");
        ServerError::Upstream(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{RequestContext, ResponseState};
    use axum::http::HeaderMap;
    use std::collections::HashMap;
    use std::time::Instant;

    fn proxy(route: &str, origin: &str) -> Arc<ProxyHandler> {
        let mut config = Config {
            default: "all".to_string(),
            ..Config::default()
        };
        config.headers = HashMap::new();
        config.normalize();
        let config = Arc::new(config);
        let cache = Arc::new(EtagCache::new(16, std::env::temp_dir()));
        let client = ProxyHandler::client(&config).unwrap();
        ProxyHandler::new(config, cache, client, route, origin, false).unwrap()
    }

    fn exchange(path: &str) -> Exchange {
        Exchange {
            req: RequestContext {
                method: Method::GET,
                uri: path.to_string(),
                url: format!("http://localhost{}", path),
                parsed: crate::pipeline::url::canonicalize(false, "localhost", path, "", None),
                vhost: "all".to_string(),
                ip: "127.0.0.1".parse().unwrap(),
                headers: HeaderMap::new(),
                body: Bytes::new(),
                allow: "GET, HEAD, OPTIONS".to_string(),
                cors: false,
                start: Instant::now(),
                local_path: None,
            },
            res: ResponseState::new(),
        }
    }

    #[test]
    fn streaming_detection_follows_extension() {
        let p = proxy("/", "http://up");
        assert!(p.streaming("http://up/video.mp4"));
        assert!(p.streaming("http://up/font.woff2"));
        assert!(!p.streaming("http://up/data.json"));
        assert!(!p.streaming("http://up/page.html"));
        assert!(!p.streaming("http://up/api/users"));
    }

    #[test]
    fn stream_flag_forces_streaming() {
        let mut config = Config {
            default: "all".to_string(),
            ..Config::default()
        };
        config.normalize();
        let config = Arc::new(config);
        let cache = Arc::new(EtagCache::new(16, std::env::temp_dir()));
        let client = ProxyHandler::client(&config).unwrap();
        let p = ProxyHandler::new(config, cache, client, "/", "http://up", true).unwrap();
        assert!(p.streaming("http://up/page.html"));
    }

    #[test]
    fn textual_rewrite_prefixes_absolute_attributes() {
        let p = proxy("/app", "http://up");
        let ex = exchange("/app/page");
        let body = br#"<a href="/logo.png"><img src="/img/x.png"></a>"#;
        let out = p.rewrite_body(&ex, body, "text/html").unwrap();
        assert!(out.contains("href=\"/app/logo.png\""));
        assert!(out.contains("src=\"/app/img/x.png\""));
    }

    #[test]
    fn origin_references_are_relocated() {
        let p = proxy("/app", "http://up");
        let ex = exchange("/app/page");
        let body = br#"<a href="http://up/about">about</a>"#;
        let out = p.rewrite_body(&ex, body, "text/html").unwrap();
        assert!(out.contains("http://localhost/app/about"));
    }

    #[test]
    fn json_rewrite_prefixes_internal_references() {
        let p = proxy("/app", "http://up");
        let ex = exchange("/app/data");
        let body = br#"{"self":"/users/1","name":"x"}"#;
        let out = p.rewrite_body(&ex, body, "application/json").unwrap();
        assert!(out.contains("\"/app/users/1\""));
        assert!(out.contains("\"name\""));
    }

    #[test]
    fn root_route_leaves_absolute_references_alone() {
        let p = proxy("/", "http://up");
        let ex = exchange("/page");
        let body = br#"<a href="/logo.png">x</a>"#;
        let out = p.rewrite_body(&ex, body, "text/html").unwrap();
        assert!(out.contains("href=\"/logo.png\""));
    }

    #[test]
    fn freshness_prefers_max_age() {
        let mut res = ResponseState::new();
        res.header("cache-control", "public, max-age=60");
        assert_eq!(freshness_lifetime(&res), Some(Duration::from_secs(60)));

        let mut res = ResponseState::new();
        res.header("cache-control", "no-store");
        assert_eq!(freshness_lifetime(&res), None);

        let res = ResponseState::new();
        assert_eq!(freshness_lifetime(&res), None);
    }
}
