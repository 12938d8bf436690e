//! Server assembly and the request pipeline entry point.
//!
//! One [`Server`] per process: it owns the vhost table, the route index,
//! the representation cache, the watcher registry and the emitter. Every
//! request enters through a catch-all Router handler, is decorated into an
//! [`Exchange`], walks the middleware chain, and leaves through the
//! emitter, error paths included.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::cache::{gate, EtagCache};
use crate::cache::watcher::WatchRegistry;
use crate::config::Config;
use crate::emit::Emitter;
use crate::error::ServerError;
use crate::handlers::{FileHandler, ProxyHandler};
use crate::observability::{AccessLogger, AccessRecord};
use crate::pipeline::runner::{self, ChainResult};
use crate::pipeline::vhost::VhostTable;
use crate::pipeline::{
    router::RouteIndex, url, Exchange, Flow, Handler, Payload, RequestContext, ResponseState,
};

/// Capacity shared by the route, permissions and representation LRUs.
const LRU_CAPACITY: usize = 1000;

pub struct Server {
    pub config: Arc<Config>,
    pub vhosts: VhostTable,
    pub routes: RouteIndex,
    pub cache: Arc<EtagCache>,
    pub watchers: Arc<WatchRegistry>,
    emitter: Emitter,
    files: Arc<FileHandler>,
    logger: AccessLogger,
    client: reqwest::Client,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

#[derive(Clone)]
struct AppState {
    server: Arc<Server>,
}

impl Server {
    pub fn new(mut config: Config) -> Result<Arc<Self>> {
        config.normalize();
        config.validate()?;
        let config = Arc::new(config);

        let cache = Arc::new(EtagCache::new(LRU_CAPACITY, config.tmp_dir()));
        let watchers = WatchRegistry::new(Arc::clone(&cache), config.seed)?;

        let labels: Vec<String> = config.vhosts.keys().cloned().collect();
        let vhosts = VhostTable::new(&config.default, &labels)?;

        let routes = RouteIndex::new(LRU_CAPACITY);
        let emitter = Emitter::new(
            Arc::clone(&config),
            Arc::clone(&cache),
            Arc::clone(&watchers),
        );
        let files = Arc::new(FileHandler::new(Arc::clone(&config), Arc::clone(&cache)));
        let logger = AccessLogger::new(&config.logs)?;
        let client = ProxyHandler::client(&config)?;

        let server = Arc::new(Self {
            config,
            vhosts,
            routes,
            cache,
            watchers,
            emitter,
            files,
            logger,
            client,
            shutdown: Mutex::new(None),
        });

        server.install_gate()?;
        Ok(server)
    }

    /// The revalidation gate runs on every GET but must not grant the
    /// method by itself, so its hash goes straight onto the blacklist.
    fn install_gate(&self) -> Result<()> {
        let handler = gate::middleware(Arc::clone(&self.cache), self.config.seed);
        let hash = handler.hash;
        self.routes.register("all", "GET", "/.*", handler)?;
        self.routes.blacklist(hash);
        Ok(())
    }

    /// Register a middleware handler.
    pub fn route<F>(
        &self,
        host: &str,
        method: &str,
        pattern: &str,
        name: &str,
        f: F,
    ) -> Result<()>
    where
        F: for<'a> Fn(&'a mut Exchange) -> BoxFuture<'a, Flow> + Send + Sync + 'static,
    {
        self.routes
            .register(host, method, pattern, Handler::plain(name, self.config.seed, f))
    }

    /// Register an error-accepting (recovery) handler.
    pub fn recover<F>(
        &self,
        host: &str,
        method: &str,
        pattern: &str,
        name: &str,
        f: F,
    ) -> Result<()>
    where
        F: for<'a> Fn(ServerError, &'a mut Exchange) -> BoxFuture<'a, Flow>
            + Send
            + Sync
            + 'static,
    {
        self.routes
            .register(host, method, pattern, Handler::recover(name, self.config.seed, f))
    }

    /// Mount a reverse proxy for all five verbs under `route`.
    pub fn proxy(&self, route: &str, origin: &str, host: &str, stream: bool) -> Result<()> {
        let handler = ProxyHandler::new(
            Arc::clone(&self.config),
            Arc::clone(&self.cache),
            self.client.clone(),
            route,
            origin,
            stream,
        )?;

        let patterns: Vec<String> = if route == "/" {
            vec!["/.*".to_string()]
        } else {
            vec![
                regex::escape(route),
                format!("{}/.*", regex::escape(route)),
            ]
        };

        for verb in ["DELETE", "GET", "PATCH", "POST", "PUT"] {
            for pattern in &patterns {
                let proxied = Arc::clone(&handler);
                let name = format!("proxy:{}:{}:{}", verb, route, origin);
                let wrapped = Handler::plain(&name, self.config.seed, move |ex| {
                    let proxied = Arc::clone(&proxied);
                    Box::pin(async move {
                        match proxied.handle(ex).await {
                            Ok(()) => Flow::Halt,
                            Err(e) => Flow::Fault(e),
                        }
                    })
                });
                self.routes.register(host, verb, pattern, wrapped)?;
            }
        }
        info!(route, origin, host, stream, "proxy mounted");
        Ok(())
    }

    /// Build the catch-all Router.
    pub fn app(self: &Arc<Self>) -> Router {
        let state = AppState {
            server: Arc::clone(self),
        };
        Router::new()
            .route("/", any(handle_request))
            .route("/*path", any(handle_request))
            .fallback(handle_request)
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind and serve until `stop()`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.config.address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        #[cfg(unix)]
        if let Some(uid) = self.config.uid {
            drop_privileges(uid);
        }

        let (tx, rx) = watch::channel(false);
        {
            let mut shutdown = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            *shutdown = Some(tx);
        }

        let app = self.app();
        info!(addr = %addr, tls = self.config.ssl.enabled(), "listening");

        if let (Some(cert), Some(key)) = (&self.config.ssl.cert, &self.config.ssl.key) {
            let acceptor = crate::tls::acceptor(cert, key)?;
            crate::tls::serve(listener, acceptor, app, rx).await?;
        } else {
            let mut rx = rx;
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            })
            .await?;
        }
        Ok(())
    }

    /// Close the listener and reinitialize every cache; `start()` may be
    /// called again afterwards.
    pub fn stop(&self) {
        let sender = {
            let mut shutdown = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            shutdown.take()
        };
        if let Some(tx) = sender {
            let _ = tx.send(true);
        }

        self.watchers.clear();
        self.cache.clear();
        self.routes.clear();
        if let Err(e) = self.install_gate() {
            error!(error = %e, "gate reinstall failed");
        }
        info!("server stopped, caches reinitialized");
    }

    /// The pipeline: decorate, chain, terminal, emit, log.
    pub async fn handle(self: &Arc<Self>, req: Request, peer: SocketAddr) -> Response {
        let start = Instant::now();
        let (parts, body) = req.into_parts();
        let method = parts.method.clone();
        let headers = parts.headers;

        // Any expectation is more than this protocol surface honors.
        if headers.contains_key("expect") {
            return self
                .error_response_bare(&method, &headers, peer, start, 417)
                .await;
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let raw_path = parts.uri.path().to_string();
        let query = parts.uri.query().unwrap_or("").to_string();
        debug!(request_id = %request_id, method = %method, path = %raw_path, "request received");
        let host = headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost")
            .to_string();

        let secure = self.config.ssl.enabled();
        let parsed = url::canonicalize(
            secure,
            &host,
            &raw_path,
            &query,
            headers.get("authorization").and_then(|v| v.to_str().ok()),
        );
        let vhost = self.vhosts.select(parsed.hostname());
        let ip = url::client_ip(&headers, peer);
        let cors = headers.contains_key("origin");

        // Body accumulation, bounded by maxBytes.
        let body_bytes = if matches!(method, Method::PUT | Method::POST | Method::PATCH) {
            let limit = self.config.max_bytes;
            let collected = if limit > 0 {
                http_body_util::Limited::new(body, limit as usize)
                    .collect()
                    .await
                    .map(|c| c.to_bytes())
                    .map_err(|_| ())
            } else {
                body.collect().await.map(|c| c.to_bytes()).map_err(|_| ())
            };
            match collected {
                Ok(bytes) => bytes,
                Err(()) => {
                    debug!(limit, "request body over limit");
                    return self
                        .error_response_bare(&method, &headers, peer, start, 413)
                        .await;
                }
            }
        } else {
            Bytes::new()
        };

        let uri = if query.is_empty() {
            parsed.path.clone()
        } else {
            format!("{}?{}", parsed.path, query)
        };

        // First hit on a filesystem-backed URI: make sure GET appears in
        // the permission set by installing a file-handler route for this
        // exact path.
        if !self.routes.permits(&parsed.path, &vhost, "GET") {
            let files = Arc::clone(&self.files);
            let name = format!("files:{}:{}", vhost, parsed.path);
            let fallback = Handler::plain(&name, self.config.seed, move |ex| {
                let files = Arc::clone(&files);
                Box::pin(async move {
                    match files.handle(ex).await {
                        Ok(()) => Flow::Halt,
                        Err(e) => Flow::Fault(e),
                    }
                })
            });
            if let Err(e) =
                self.routes
                    .register(&vhost, "GET", &regex::escape(&parsed.path), fallback)
            {
                warn!(error = %e, "fallback route registration failed");
            }
        }

        let allow = self.routes.allows(&parsed.path, &vhost);
        let url = parsed.href();

        let mut ex = Exchange {
            req: RequestContext {
                method: method.clone(),
                uri,
                url,
                parsed,
                vhost,
                ip,
                headers,
                body: body_bytes,
                allow,
                cors,
                start,
                local_path: None,
            },
            res: ResponseState::new(),
        };

        let handlers = self
            .routes
            .routes(&ex.req.parsed.path, &ex.req.vhost, method.as_str());

        match runner::run(&handlers, &mut ex).await {
            ChainResult::Responded => self.finish(ex).await,
            ChainResult::Unhandled(err) => self.error_response(ex, err).await,
            ChainResult::Drained => self.terminal(ex).await,
        }
    }

    /// Terminal routing after the chain drains without a response.
    async fn terminal(self: &Arc<Self>, mut ex: Exchange) -> Response {
        match ex.req.method {
            // Reads and RESTful writes against the document root.
            Method::GET
            | Method::HEAD
            | Method::OPTIONS
            | Method::PUT
            | Method::POST
            | Method::DELETE
            | Method::PATCH => match self.files.handle(&mut ex).await {
                Ok(()) => self.finish(ex).await,
                Err(e) => self.error_response(ex, e).await,
            },
            _ => {
                let err = if ex.req.allow.contains("GET") {
                    ServerError::MethodNotAllowed(ex.req.method.to_string())
                } else {
                    ServerError::NotFound(ex.req.parsed.path.clone())
                };
                self.error_response(ex, err).await
            }
        }
    }

    /// Emit and log a finished exchange.
    async fn finish(&self, ex: Exchange) -> Response {
        let record = self.record_for(&ex);
        let response = self.emitter.finalize(ex).await;
        let status = response.status();
        let bytes_sent = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        self.log_access(record, status, bytes_sent).await;
        response
    }

    /// Terminal error path: always a status line and a body.
    async fn error_response(&self, mut ex: Exchange, err: ServerError) -> Response {
        let status = match &err {
            ServerError::Internal(message) => ServerError::status_from_message(message),
            other => other.status_code(),
        };
        debug!(status = status.as_u16(), error = %err, "terminal error");

        ex.res.status = status.as_u16();
        ex.res.headers.clear();
        ex.res.header("content-type", "text/html; charset=utf-8");
        ex.res.body = Payload::Buffer(Bytes::from(error_page(status)));
        ex.res.finished = true;
        self.finish(ex).await
    }

    /// Error response for requests rejected before an Exchange exists.
    async fn error_response_bare(
        self: &Arc<Self>,
        method: &Method,
        headers: &axum::http::HeaderMap,
        peer: SocketAddr,
        start: Instant,
        status: u16,
    ) -> Response {
        let host = headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost")
            .to_string();
        let parsed = url::canonicalize(self.config.ssl.enabled(), &host, "/", "", None);
        let vhost = self.vhosts.select(parsed.hostname());
        let ex = Exchange {
            req: RequestContext {
                method: method.clone(),
                uri: "/".to_string(),
                url: parsed.href(),
                parsed,
                vhost,
                ip: url::client_ip(headers, peer),
                headers: headers.clone(),
                body: Bytes::new(),
                allow: String::new(),
                cors: headers.contains_key("origin"),
                start,
                local_path: None,
            },
            res: ResponseState::new(),
        };
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.error_response(ex, ServerError::from_status(status)).await
    }

    fn record_for(&self, ex: &Exchange) -> AccessRecord {
        AccessRecord {
            vhost: ex.req.vhost.clone(),
            client_ip: ex.req.ip.to_string(),
            user: ex
                .req
                .parsed
                .auth
                .as_ref()
                .and_then(|a| a.split(':').next())
                .map(str::to_string),
            request_line: format!("{} {} HTTP/1.1", ex.req.method, ex.req.uri),
            status: 0,
            bytes_sent: None,
            referer: ex.req.header("referer").map(str::to_string),
            user_agent: ex.req.header("user-agent").map(str::to_string),
            timestamp: chrono::Utc::now(),
        }
    }

    async fn log_access(&self, mut record: AccessRecord, status: StatusCode, bytes_sent: Option<u64>) {
        record.status = status.as_u16();
        record.bytes_sent = bytes_sent;
        self.logger.log(&record).await;
    }
}

async fn handle_request(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> impl IntoResponse {
    let peer = connect_info
        .map(|ci| ci.0)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));
    state.server.handle(req, peer).await
}

/// Built-in status page; terminal errors never close without a body.
fn error_page(status: StatusCode) -> String {
    let reason = status.canonical_reason().unwrap_or("Error");
    format!(
        "<!doctype html>\n<html><head><title>{code} {reason}</title></head>\n\
         <body><h1>{code} {reason}</h1></body></html>\n",
        code = status.as_u16(),
        reason = reason
    )
}

#[cfg(unix)]
fn drop_privileges(uid: u32) {
    // Only meaningful after the privileged bind.
    let outcome = unsafe { libc::setuid(uid) };
    if outcome == 0 {
        info!(uid, "dropped privileges");
    } else {
        error!(uid, "setuid failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config(root: &std::path::Path) -> Config {
        let mut config = Config {
            default: "all".to_string(),
            root: root.to_path_buf(),
            ..Config::default()
        };
        config.vhosts.insert("all".to_string(), String::new());
        config.headers = HashMap::new();
        config.logs.stdout = false;
        config
    }

    #[tokio::test]
    async fn server_installs_blacklisted_gate() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(test_config(dir.path())).unwrap();
        // The gate's catch-all must not grant GET on its own.
        assert_eq!(server.routes.allows("/anything", "all"), "");
    }

    #[tokio::test]
    async fn proxy_mounts_all_five_verbs() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(test_config(dir.path())).unwrap();
        server.proxy("/app", "http://up", "all", false).unwrap();

        for verb in ["DELETE", "GET", "PATCH", "POST", "PUT"] {
            assert!(server.routes.permits("/app", "all", verb), "verb {}", verb);
            assert!(
                server.routes.permits("/app/deep/path", "all", verb),
                "verb {} subtree",
                verb
            );
        }
        assert!(!server.routes.permits("/elsewhere", "all", "PUT"));
    }

    #[tokio::test]
    async fn stop_reinitializes_route_state() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(test_config(dir.path())).unwrap();
        server.proxy("/app", "http://up", "all", false).unwrap();
        assert!(server.routes.permits("/app", "all", "GET"));

        server.stop();
        assert!(!server.routes.permits("/app", "all", "GET"));
        // The gate is reinstalled and still blacklisted.
        assert_eq!(server.routes.allows("/x", "all"), "");
    }
}
