pub mod router;
pub mod runner;
pub mod url;
pub mod vhost;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::Stream;

use crate::cache::validator;
use crate::error::ServerError;
use self::url::CanonicalUrl;

/// Per-request state threaded through the middleware chain.
#[derive(Debug)]
pub struct RequestContext {
    pub method: Method,
    /// Decoded request target (`/path?query`).
    pub uri: String,
    /// Canonical URL: `http[s]://[auth@]host/path?query`.
    pub url: String,
    pub parsed: CanonicalUrl,
    pub vhost: String,
    pub ip: IpAddr,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Effective `Allow` string for the requested URI.
    pub allow: String,
    /// Set iff the request carried an `Origin` header.
    pub cors: bool,
    pub start: Instant,
    /// Local file backing the response, decorated by the file handler so the
    /// emitter can register a watcher on it.
    pub local_path: Option<PathBuf>,
}

impl RequestContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// GET, HEAD and OPTIONS share routing and permission semantics.
    pub fn is_get_like(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// Response under construction.
#[derive(Debug, Default)]
pub struct ResponseState {
    pub status: u16,
    /// Lowercase-keyed header map; ordered for deterministic emission.
    pub headers: BTreeMap<String, String>,
    pub body: Payload,
    /// A handler finalized the response; the chain stops here.
    pub finished: bool,
}

impl ResponseState {
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: Payload::Empty,
            finished: false,
        }
    }

    pub fn header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_lowercase(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(&name.to_lowercase());
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Finalize with a body, status and extra headers.
    pub fn respond(&mut self, body: Payload, status: u16, headers: &[(&str, &str)]) {
        self.status = status;
        self.body = body;
        for (name, value) in headers {
            self.header(name, *value);
        }
        self.finished = true;
    }

    /// Finalize with a temporary redirect.
    pub fn redirect(&mut self, location: &str) {
        self.status = 307;
        self.header("location", location);
        self.body = Payload::Empty;
        self.finished = true;
    }

    /// Finalize with an error status and a plain body.
    pub fn error(&mut self, status: u16, body: impl Into<String>) {
        self.status = status;
        self.body = Payload::Buffer(Bytes::from(body.into()));
        self.finished = true;
    }
}

/// Response payload; decides the emission mode downstream.
#[derive(Default)]
pub enum Payload {
    #[default]
    Empty,
    Buffer(Bytes),
    Json(serde_json::Value),
    File {
        path: PathBuf,
        size: u64,
        /// Inclusive byte range selected by a `Range` request.
        range: Option<(u64, u64)>,
    },
    /// Pass-through stream (proxy streaming mode); bypasses negotiation.
    Stream(Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Empty => write!(f, "Empty"),
            Payload::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
            Payload::Json(_) => write!(f, "Json"),
            Payload::File { path, size, range } => {
                write!(f, "File({:?}, {} bytes, range {:?})", path, size, range)
            }
            Payload::Stream(_) => write!(f, "Stream"),
        }
    }
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Empty => true,
            Payload::Buffer(b) => b.is_empty(),
            _ => false,
        }
    }
}

/// The request/response pair handlers operate on.
#[derive(Debug)]
pub struct Exchange {
    pub req: RequestContext,
    pub res: ResponseState,
}

/// Outcome of one handler invocation.
pub enum Flow {
    /// Hand off to the next handler.
    Continue,
    /// Response finalized; stop the chain.
    Halt,
    /// Forward the fault to the next error-accepting handler.
    Fault(ServerError),
}

pub type PlainFn =
    Arc<dyn for<'a> Fn(&'a mut Exchange) -> BoxFuture<'a, Flow> + Send + Sync>;
pub type RecoverFn =
    Arc<dyn for<'a> Fn(ServerError, &'a mut Exchange) -> BoxFuture<'a, Flow> + Send + Sync>;

/// Handler body plus its declared arity, recorded at registration.
pub enum HandlerFn {
    Plain(PlainFn),
    Recover(RecoverFn),
}

/// A registered middleware handler.
pub struct Handler {
    pub name: String,
    /// Seeded hash of the registration identity; blacklist key.
    pub hash: u32,
    pub func: HandlerFn,
}

impl Handler {
    pub fn plain<F>(name: &str, seed: u32, f: F) -> Arc<Self>
    where
        F: for<'a> Fn(&'a mut Exchange) -> BoxFuture<'a, Flow> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            hash: validator::identity_hash(name, seed),
            func: HandlerFn::Plain(Arc::new(f)),
        })
    }

    pub fn recover<F>(name: &str, seed: u32, f: F) -> Arc<Self>
    where
        F: for<'a> Fn(ServerError, &'a mut Exchange) -> BoxFuture<'a, Flow>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            hash: validator::identity_hash(name, seed),
            func: HandlerFn::Recover(Arc::new(f)),
        })
    }

    pub fn accepts_errors(&self) -> bool {
        matches!(self.func, HandlerFn::Recover(_))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .field("accepts_errors", &self.accepts_errors())
            .finish()
    }
}
