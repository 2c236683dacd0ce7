//! Assembly of a running gateway from its parts.
use std::sync::Arc;

use axum::Router;
use eyre::{Result, WrapErr};
use tokio::{net::TcpListener, task::JoinHandle};

use crate::{
    adapters::{HttpClientAdapter, HttpHandler, ReverseProxy, http_server},
    config::models::{GatewayConfig, RealIpConfig},
    core::{GatewayService, PluginRegistry, ReloadCoordinator, RouteCompiler},
    ports::{definition_source::DefinitionSource, http_client::HttpClient},
    utils::GracefulShutdown,
};

/// A gateway whose first route table has been compiled and which is ready
/// to accept traffic.
pub struct Switchyard {
    coordinator: Arc<ReloadCoordinator>,
    gateway: Arc<GatewayService>,
    source: Arc<dyn DefinitionSource>,
    real_ip: Arc<RealIpConfig>,
}

impl Switchyard {
    /// Compile the initial table from `source` and wire the request path.
    ///
    /// A definition that does not compile is an error; the gateway never
    /// starts without a valid table.
    pub async fn build(
        config: &GatewayConfig,
        registry: PluginRegistry,
        source: Arc<dyn DefinitionSource>,
    ) -> Result<Self> {
        let client: Arc<dyn HttpClient> = Arc::new(
            HttpClientAdapter::new(&config.transport)
                .context("Failed to create HTTP client adapter")?,
        );
        Self::build_with_client(config, registry, source, client).await
    }

    pub async fn build_with_client(
        config: &GatewayConfig,
        registry: PluginRegistry,
        source: Arc<dyn DefinitionSource>,
        client: Arc<dyn HttpClient>,
    ) -> Result<Self> {
        tracing::info!(
            source = %source.describe(),
            plugins = ?registry.names(),
            "Building gateway"
        );
        let compiler = RouteCompiler::new(Arc::new(registry));
        let coordinator =
            ReloadCoordinator::load_initial(compiler, source.clone(), config.watch_debounce)
                .await
                .with_context(|| format!("Failed to load initial routes from {}", source.describe()))?;
        let coordinator = Arc::new(coordinator);

        let proxy = Arc::new(ReverseProxy::new(client));
        let gateway = Arc::new(GatewayService::new(coordinator.routes(), proxy));

        Ok(Self {
            coordinator,
            gateway,
            source,
            real_ip: Arc::new(config.real_ip.clone()),
        })
    }

    pub fn coordinator(&self) -> Arc<ReloadCoordinator> {
        self.coordinator.clone()
    }

    pub fn gateway(&self) -> Arc<GatewayService> {
        self.gateway.clone()
    }

    pub fn router(&self) -> Router {
        http_server::build_router(
            Arc::new(HttpHandler::new(self.gateway.clone())),
            self.real_ip.clone(),
        )
    }

    /// Start reacting to definition changes, if the source can signal them.
    pub fn spawn_watcher(&self, shutdown: &GracefulShutdown) -> Option<JoinHandle<()>> {
        let Some(events) = self.source.watch() else {
            tracing::info!(
                source = %self.source.describe(),
                "Definition source does not signal changes; hot reload disabled"
            );
            return None;
        };
        Some(tokio::spawn(
            self.coordinator.clone().run(events, shutdown.token()),
        ))
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn serve(&self, listener: TcpListener, shutdown: Arc<GracefulShutdown>) -> Result<()> {
        http_server::serve(listener, self.router(), shutdown).await
    }
}
