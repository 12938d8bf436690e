//! Multi-tenant HTTP/HTTPS server and reverse proxy.
//!
//! The crate centers on four subsystems: the request pipeline (virtual-host
//! resolution, middleware dispatch with error-arity forwarding, terminal
//! routing), the representation cache (ETag-stamped entries with on-disk
//! compressed side files kept coherent by filesystem watchers), the
//! response emitter (content negotiation, ranged delivery, CSV projection,
//! header discipline), and the reverse-proxy handler (upstream dispatch
//! with body rewriting or streaming pass-through).

pub mod cache;
pub mod config;
pub mod emit;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod pipeline;
pub mod server;
pub mod tls;

pub use config::Config;
pub use error::{Result, ServerError};
pub use server::Server;
