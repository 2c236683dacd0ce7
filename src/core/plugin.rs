//! Plugin contract and the registry that resolves plugin references.
//!
//! A plugin is a named, configurable behaviour. At compile time the
//! [`PluginRegistry`] validates each [`PluginRef`] of a route and asks the
//! plugin to build its before-dispatch [`Middleware`]. The registry is a plain
//! value built once at startup and handed to the route compiler; it performs no
//! request dispatch itself.
//!
//! Middlewares compose through [`Next`]: the first plugin of a route wraps all
//! the others, so it sees the request first and the response last. The
//! innermost handler is an [`Endpoint`] (the reverse proxy in production).
use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, Response},
};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    config::definition::{ApiRoute, PluginRef},
    core::rate_limiter::RatePlugin,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin '{0}' is not registered")]
    NotFound(String),

    #[error("plugin '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("invalid config for plugin '{plugin}': {message}")]
    InvalidConfig { plugin: String, message: String },

    #[error("plugin '{plugin}' failed to build middleware: {message}")]
    Build { plugin: String, message: String },
}

/// Request-scoped data bound once a route has matched. Read-only afterwards.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub route: Arc<ApiRoute>,
    /// Captured path variables by name.
    pub vars: HashMap<String, String>,
    /// Part of the request path beyond what the route pattern consumed.
    pub suffix: String,
    /// Version of the route table this request was matched against.
    pub table_version: i64,
    pub client_addr: Option<SocketAddr>,
    /// Cancelled when the downstream client goes away.
    pub cancellation: CancellationToken,
}

impl RequestContext {
    pub fn api_name(&self) -> &str {
        &self.route.name
    }
}

/// Wraps request handling with extra behaviour.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        ctx: &RequestContext,
        req: Request<Body>,
        next: Next<'_>,
    ) -> Response<Body>;
}

/// Innermost handler of a middleware chain.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, ctx: &RequestContext, req: Request<Body>) -> Response<Body>;
}

/// Remainder of a middleware chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Endpoint) -> Self {
        Self { chain, endpoint }
    }

    /// Hand the request to the next middleware, or to the endpoint once the
    /// chain is exhausted.
    pub async fn run(self, ctx: &RequestContext, req: Request<Body>) -> Response<Body> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    endpoint: self.endpoint,
                };
                head.handle(ctx, req, next).await
            }
            None => self.endpoint.call(ctx, req).await,
        }
    }
}

/// A named, configurable request-processing behaviour.
///
/// Both hooks are optional. A plugin that builds no middleware still takes part
/// in config validation.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn validate_config(&self, _config: &Value) -> Result<(), PluginError> {
        Ok(())
    }

    fn build_before_dispatch(
        &self,
        _config: &Value,
    ) -> Result<Option<Arc<dyn Middleware>>, PluginError> {
        Ok(None)
    }
}

/// Name -> plugin mapping, populated at startup.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every plugin shipped in this crate.
    pub fn with_builtin_plugins() -> Self {
        let mut registry = Self::new();
        registry.insert(Arc::new(RatePlugin));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        if self.plugins.contains_key(plugin.name()) {
            return Err(PluginError::AlreadyRegistered(plugin.name().to_string()));
        }
        self.insert(plugin);
        Ok(())
    }

    fn insert(&mut self, plugin: Arc<dyn Plugin>) {
        tracing::debug!(plugin = plugin.name(), "Registered plugin");
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn resolve(&self, name: &str) -> Result<&Arc<dyn Plugin>, PluginError> {
        self.plugins
            .get(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    /// Check that a reference resolves and that its config is acceptable.
    pub fn validate_config(&self, plugin_ref: &PluginRef) -> Result<(), PluginError> {
        self.resolve(&plugin_ref.name)?
            .validate_config(&plugin_ref.config)
    }

    /// Build the ordered middleware chain for a route's plugin list.
    ///
    /// Fails on the first reference that does not resolve, validate or build.
    pub fn build_chain(
        &self,
        plugins: &[PluginRef],
    ) -> Result<Vec<Arc<dyn Middleware>>, PluginError> {
        let mut chain = Vec::with_capacity(plugins.len());
        for plugin_ref in plugins {
            let plugin = self.resolve(&plugin_ref.name)?;
            plugin.validate_config(&plugin_ref.config)?;
            if let Some(middleware) = plugin.build_before_dispatch(&plugin_ref.config)? {
                chain.push(middleware);
            }
        }
        Ok(chain)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
