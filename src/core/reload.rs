//! Hot reload of the route table.
//!
//! A [`ReloadCoordinator`] owns the swappable table handle. Each reload loads a
//! definition from the configured [`DefinitionSource`], compiles it off the
//! request path and publishes the result with a single atomic store. Reloads
//! are serialized; a definition that fails to compile leaves the previous
//! table serving traffic.
use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    config::definition::Definition,
    core::route_table::{CompileError, RouteCompiler, RouteTable},
    metrics,
    ports::definition_source::DefinitionSource,
};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("Failed to load definition from {source_name}: {message}")]
    Load {
        source_name: String,
        message: String,
    },

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Result of a reload attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// A new table is active.
    Applied { version: i64, routes: usize },
    /// The loaded definition was not newer than the active table.
    Stale { version: i64, active: i64 },
}

pub struct ReloadCoordinator {
    routes: Arc<ArcSwap<RouteTable>>,
    compiler: RouteCompiler,
    source: Arc<dyn DefinitionSource>,
    debounce: Duration,
    reload_lock: Mutex<()>,
}

impl ReloadCoordinator {
    pub fn new(
        routes: Arc<ArcSwap<RouteTable>>,
        compiler: RouteCompiler,
        source: Arc<dyn DefinitionSource>,
        debounce: Duration,
    ) -> Self {
        Self {
            routes,
            compiler,
            source,
            debounce,
            reload_lock: Mutex::new(()),
        }
    }

    /// Load and compile the first table. Any failure here is fatal to startup.
    pub async fn load_initial(
        compiler: RouteCompiler,
        source: Arc<dyn DefinitionSource>,
        debounce: Duration,
    ) -> Result<Self, ReloadError> {
        let definition = Self::load_from(source.as_ref()).await?;
        let table = compiler.compile(&definition)?;
        tracing::info!(
            source = %source.describe(),
            version = table.version(),
            routes = table.len(),
            "Loaded initial route table"
        );
        metrics::set_active_table(table.version(), table.len());

        Ok(Self::new(
            Arc::new(ArcSwap::from_pointee(table)),
            compiler,
            source,
            debounce,
        ))
    }

    /// Handle shared with the dispatcher.
    pub fn routes(&self) -> Arc<ArcSwap<RouteTable>> {
        self.routes.clone()
    }

    pub fn active_version(&self) -> i64 {
        self.routes.load().version()
    }

    async fn load_from(source: &dyn DefinitionSource) -> Result<Definition, ReloadError> {
        source
            .load_definition()
            .await
            .map_err(|e| ReloadError::Load {
                source_name: source.describe(),
                message: format!("{e:#}"),
            })
    }

    /// Compile `definition` and make it active, regardless of its version.
    pub async fn apply(&self, definition: &Definition) -> Result<ReloadOutcome, ReloadError> {
        let _guard = self.reload_lock.lock().await;
        self.apply_locked(definition)
    }

    fn apply_locked(&self, definition: &Definition) -> Result<ReloadOutcome, ReloadError> {
        let table = match self.compiler.compile(definition) {
            Ok(table) => table,
            Err(e) => {
                metrics::increment_reload("failed");
                return Err(e.into());
            }
        };

        let outcome = ReloadOutcome::Applied {
            version: table.version(),
            routes: table.len(),
        };
        metrics::set_active_table(table.version(), table.len());
        metrics::increment_reload("applied");
        self.routes.store(Arc::new(table));
        Ok(outcome)
    }

    /// Pull the current definition from the source and apply it if it is
    /// newer than the active table.
    pub async fn reload(&self) -> Result<ReloadOutcome, ReloadError> {
        let _guard = self.reload_lock.lock().await;

        let definition = match Self::load_from(self.source.as_ref()).await {
            Ok(definition) => definition,
            Err(e) => {
                metrics::increment_reload("failed");
                return Err(e);
            }
        };

        let active = self.active_version();
        if definition.version <= active {
            metrics::increment_reload("stale");
            return Ok(ReloadOutcome::Stale {
                version: definition.version,
                active,
            });
        }

        self.apply_locked(&definition)
    }

    /// React to change signals until the channel closes or `shutdown` fires.
    ///
    /// Bursts of signals within the debounce window collapse into one reload.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<()>, shutdown: CancellationToken) {
        tracing::info!(
            source = %self.source.describe(),
            debounce = ?self.debounce,
            "Definition watcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    if event.is_none() {
                        tracing::warn!("Definition change channel closed");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.debounce) => {}
            }
            while events.try_recv().is_ok() {}

            match self.reload().await {
                Ok(ReloadOutcome::Applied { version, routes }) => {
                    tracing::info!(version, routes, "Route table reloaded");
                }
                Ok(ReloadOutcome::Stale { version, active }) => {
                    tracing::debug!(version, active, "Ignoring stale definition");
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        active_version = self.active_version(),
                        "Reload failed, keeping previous route table"
                    );
                }
            }
        }

        tracing::info!("Definition watcher stopped");
    }
}
