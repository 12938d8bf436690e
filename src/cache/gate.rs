//! Conditional-request gate.
//!
//! A GET carrying `If-None-Match` (and no `Range`) is answered `304`
//! straight from the cache when the validator still matches, skipping the
//! rest of the chain. The gate is blacklisted at install time so its
//! catch-all registration does not grant GET by itself.

use std::sync::Arc;

use axum::http::Method;
use tracing::debug;

use super::{validator, EtagCache};
use crate::pipeline::{Flow, Handler, Payload};

pub const NAME: &str = "revalidation-gate";

pub fn middleware(cache: Arc<EtagCache>, seed: u32) -> Arc<Handler> {
    Handler::plain(NAME, seed, move |ex| {
        let cache = Arc::clone(&cache);
        Box::pin(async move {
            if ex.req.method != Method::GET
                || ex.req.headers.contains_key("range")
            {
                return Flow::Continue;
            }
            let Some(candidate) = ex.req.header("if-none-match") else {
                return Flow::Continue;
            };
            let Some(entry) = cache.get(&ex.req.url) else {
                return Flow::Continue;
            };

            if validator::unquote(candidate) != entry.etag {
                return Flow::Continue;
            }

            debug!(url = %ex.req.url, etag = %entry.etag, "validator match, short-circuit 304");
            let age = (chrono::Utc::now().timestamp() - entry.timestamp).max(0);
            ex.res.headers = entry.headers.clone();
            ex.res.header("age", age.to_string());
            ex.res.header("etag", format!("\"{}\"", entry.etag));
            ex.res.status = 304;
            ex.res.body = Payload::Empty;
            ex.res.finished = true;
            Flow::Halt
        })
    })
}
