#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(warnings))]

//! # backhaul
//!
//! A multi-tenant HTTP reverse proxy built around persistent backend
//! connections.
//!
//! The proxy terminates client connections on one or more listening
//! ports, selects a backend pool by the request's virtual host, and
//! forwards the request over one of the pool's long-lived HTTP/1.1
//! keep-alive connections. Backends that fail are redialed with
//! exponential backoff while requests fail over to their pool
//! neighbours; request bodies are buffered so a retried request replays
//! the exact same bytes.
//!
//! - Round-robin dispatch that skips busy and unready slots
//! - Per-request failover with a bounded number of pool cycles
//! - Self-healing backend connections with backoff reconnect
//! - Per-target network access control
//! - Common-Log-Format access logging and prometheus counters
//!
//! ## Running the proxy
//!
//! The `backhaul` binary takes a TOML configuration file:
//!
//! ```toml
//! access_log = "/var/log/backhaul/access.log"
//!
//! [[listener]]
//! port = 8080
//!
//! [[target]]
//! hosts = ["www.example.com", "example.com"]
//! backends = ["10.0.0.1:8081", "10.0.0.2:8081"]
//! ```
//!
//! ```text
//! backhaul --config /etc/backhaul/proxy.toml
//! ```
//!
//! ## Embedding
//!
//! The same machinery is available as a library; the binary is a thin
//! wrapper over it:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use backhaul::{AccessLog, Config, Dispatcher, Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> backhaul::Result<()> {
//!     let config = Config::parse(
//!         r#"
//!         [[listener]]
//!         port = 8080
//!
//!         [[target]]
//!         hosts = ["www.example.com"]
//!         backends = ["10.0.0.1:8081"]
//!     "#,
//!     )?;
//!
//!     let router = Arc::new(Router::from_targets(&config.targets)?);
//!     router.connect_all();
//!
//!     let access_log = AccessLog::open(None).await?;
//!     let dispatcher = Dispatcher::new(router, access_log);
//!
//!     let server = Server::bind(&config, dispatcher).await?;
//!     server.serve(std::future::pending()).await
//! }
//! ```
//!
//! ## Dispatch model
//!
//! Each backend endpoint is one [`BackendConnection`]: a slot owning a
//! single keep-alive connection, a busy lock, and a reconnect state
//! machine. A [`Pool`] hands slots out round-robin; the [`Dispatcher`]
//! probes candidates until one accepts the request, scheduling
//! reconnects for the ones that fail. At most one request is in flight
//! per slot; a busy slot is skipped rather than queued on, so slow
//! backends shed load to their pool neighbours instead of hiding behind
//! a queue.

pub mod access;
pub mod accesslog;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod router;
pub mod server;
pub mod sync;

pub use crate::access::{AccessControl, Verdict};
pub use crate::accesslog::{AccessLog, Record};
pub use crate::backend::{BackendConnection, Destination, SendOutcome};
pub use crate::config::Config;
pub use crate::dispatch::{Dispatcher, ProxyBody};
pub use crate::error::{Error, Result};
pub use crate::pool::Pool;
pub use crate::router::{Route, Router};
pub use crate::server::Server;
