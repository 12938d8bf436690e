//! Middleware chain execution.
//!
//! Handlers run strictly in sequence. A `Fault` skips forward to the next
//! handler registered with error arity; recovery handlers are skipped while
//! no fault is pending. A chain that drains with an unconsumed fault hands
//! it to the terminal error emitter.

use std::sync::Arc;

use tracing::debug;

use super::{Exchange, Flow, Handler, HandlerFn};
use crate::error::ServerError;

/// Result of walking a handler chain.
#[derive(Debug)]
pub enum ChainResult {
    /// Every handler ran; nothing finalized the response.
    Drained,
    /// A handler finalized the response.
    Responded,
    /// A fault reached the end of the chain unconsumed.
    Unhandled(ServerError),
}

pub async fn run(handlers: &[Arc<Handler>], ex: &mut Exchange) -> ChainResult {
    let mut pending: Option<ServerError> = None;

    for handler in handlers {
        let flow = match (&handler.func, pending.take()) {
            (HandlerFn::Plain(f), None) => f(ex).await,
            (HandlerFn::Recover(f), Some(err)) => {
                debug!(handler = %handler.name, "forwarding fault to recovery handler");
                f(err, ex).await
            }
            // Plain handlers are skipped while a fault is in flight.
            (HandlerFn::Plain(_), Some(err)) => {
                pending = Some(err);
                continue;
            }
            // Recovery handlers only run when a fault is pending.
            (HandlerFn::Recover(_), None) => continue,
        };

        match flow {
            Flow::Continue => {}
            Flow::Halt => return ChainResult::Responded,
            Flow::Fault(err) => {
                debug!(handler = %handler.name, error = %err, "handler faulted");
                pending = Some(err);
            }
        }

        if ex.res.finished {
            return ChainResult::Responded;
        }
    }

    match pending {
        Some(err) => ChainResult::Unhandled(err),
        None => ChainResult::Drained,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Payload, RequestContext, ResponseState};
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;
    use std::time::Instant;

    fn exchange() -> Exchange {
        Exchange {
            req: RequestContext {
                method: Method::GET,
                uri: "/".to_string(),
                url: "http://localhost/".to_string(),
                parsed: Default::default(),
                vhost: "main".to_string(),
                ip: "127.0.0.1".parse().unwrap(),
                headers: HeaderMap::new(),
                body: Bytes::new(),
                allow: String::new(),
                cors: false,
                start: Instant::now(),
                local_path: None,
            },
            res: ResponseState::new(),
        }
    }

    #[tokio::test]
    async fn drains_when_every_handler_continues() {
        let handlers = vec![
            Handler::plain("a", 1, |_| Box::pin(async { Flow::Continue })),
            Handler::plain("b", 1, |_| Box::pin(async { Flow::Continue })),
        ];
        let mut ex = exchange();
        assert!(matches!(run(&handlers, &mut ex).await, ChainResult::Drained));
    }

    #[tokio::test]
    async fn halt_short_circuits() {
        let handlers = vec![
            Handler::plain("a", 1, |ex| {
                Box::pin(async move {
                    ex.res.respond(Payload::Buffer(Bytes::from_static(b"hi")), 200, &[]);
                    Flow::Halt
                })
            }),
            Handler::plain("unreached", 1, |ex| {
                Box::pin(async move {
                    ex.res.status = 500;
                    Flow::Continue
                })
            }),
        ];
        let mut ex = exchange();
        assert!(matches!(
            run(&handlers, &mut ex).await,
            ChainResult::Responded
        ));
        assert_eq!(ex.res.status, 200);
    }

    #[tokio::test]
    async fn fault_skips_to_recovery_handler() {
        let handlers = vec![
            Handler::plain("boom", 1, |_| {
                Box::pin(async { Flow::Fault(ServerError::NotFound("x".into())) })
            }),
            Handler::plain("skipped", 1, |ex| {
                Box::pin(async move {
                    ex.res.status = 999;
                    Flow::Continue
                })
            }),
            Handler::recover("rescue", 1, |err, ex| {
                Box::pin(async move {
                    ex.res.error(err.status_code().as_u16(), "handled");
                    Flow::Halt
                })
            }),
        ];
        let mut ex = exchange();
        assert!(matches!(
            run(&handlers, &mut ex).await,
            ChainResult::Responded
        ));
        assert_eq!(ex.res.status, 404);
    }

    #[tokio::test]
    async fn recovery_handlers_idle_without_fault() {
        let handlers = vec![
            Handler::recover("rescue", 1, |_, ex| {
                Box::pin(async move {
                    ex.res.status = 500;
                    Flow::Halt
                })
            }),
            Handler::plain("ok", 1, |_| Box::pin(async { Flow::Continue })),
        ];
        let mut ex = exchange();
        assert!(matches!(run(&handlers, &mut ex).await, ChainResult::Drained));
        assert_eq!(ex.res.status, 200);
    }

    #[tokio::test]
    async fn unconsumed_fault_is_returned() {
        let handlers = vec![Handler::plain("boom", 1, |_| {
            Box::pin(async { Flow::Fault(ServerError::Forbidden("nope".into())) })
        })];
        let mut ex = exchange();
        match run(&handlers, &mut ex).await {
            ChainResult::Unhandled(err) => {
                assert_eq!(err.status_code().as_u16(), 403)
            }
            other => panic!("expected unhandled fault, got {:?}", other),
        }
    }
}
