//! Switchyard - a hot-reloadable API gateway.
//!
//! Switchyard serves a declarative list of APIs. Each API maps a path pattern
//! (with `{name}` captures and prefix matching) and a set of methods to an
//! upstream URL template, plus an ordered chain of plugins that run before
//! the request is forwarded.
//!
//! # Features
//! - Ordered path matching with captures, first match wins, 404 vs 405
//! - Upstream URL rewriting with captured variables and suffix passthrough
//! - Plugin registry with per-route middleware chains (built-in `rate` plugin)
//! - Immutable, versioned route tables swapped atomically on reload
//! - Definition hot reload from a watched file, with debounce and staleness checks
//! - Client cancellation propagated to the upstream call (499)
//! - Structured logging via `tracing`, metrics via the `metrics` facade
//! - Graceful shutdown with a bounded drain period
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use switchyard::{
//!     Switchyard,
//!     adapters::FileDefinitionSource,
//!     config::GatewayConfig,
//!     core::PluginRegistry,
//!     utils::GracefulShutdown,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = GatewayConfig::default();
//! let source = Arc::new(FileDefinitionSource::watched("apis.yaml")?);
//! let gateway =
//!     Switchyard::build(&config, PluginRegistry::with_builtin_plugins(), source).await?;
//!
//! let shutdown = Arc::new(GracefulShutdown::with_timeout(config.grace_timeout));
//! gateway.spawn_watcher(&shutdown);
//! let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
//! gateway.serve(listener, shutdown).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! routing and dispatch inside `core`. `core` performs no network or file I/O of its own.
//!
//! # Error Handling
//! Startup and I/O paths return `eyre::Result<T>` with context attached via `WrapErr`.
//! Request-path and compile failures use typed `thiserror` enums.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod app;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{FileDefinitionSource, HttpClientAdapter, HttpHandler, MemoryDefinitionSource},
    app::Switchyard,
    core::{GatewayService, PluginRegistry, ReloadCoordinator},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
