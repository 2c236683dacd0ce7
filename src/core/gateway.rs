//! Core request dispatcher.
//!
//! The `GatewayService` reads the active [`RouteTable`] once per request,
//! matches the request, binds a [`RequestContext`] and runs the route's
//! middleware chain with the upstream [`Endpoint`] innermost. A reload that
//! happens while a request is in flight does not affect it: the request keeps
//! the table snapshot it started with.
//!
//! This layer performs no I/O itself; the endpoint is injected.
use std::{net::SocketAddr, sync::Arc};

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    http::{Request, Response},
};
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        plugin::{Endpoint, Next, RequestContext},
        route_table::RouteTable,
    },
    ports::http_server::GatewayError,
};

/// Response extension naming the API that served a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedApi(pub String);

/// Routes requests against the active route table.
///
/// Construct with [`GatewayService::new`] by passing the swappable table
/// handle shared with the reload coordinator.
pub struct GatewayService {
    routes: Arc<ArcSwap<RouteTable>>,
    endpoint: Arc<dyn Endpoint>,
}

impl GatewayService {
    pub fn new(routes: Arc<ArcSwap<RouteTable>>, endpoint: Arc<dyn Endpoint>) -> Self {
        Self { routes, endpoint }
    }

    /// Snapshot of the table new requests are matched against.
    pub fn active_table(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    /// Run one request through the pipeline.
    ///
    /// Routing failures never reach the endpoint.
    pub async fn dispatch(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
        cancellation: CancellationToken,
    ) -> Result<Response<Body>, GatewayError> {
        let table = self.routes.load_full();
        let matched = table.lookup(req.method(), req.uri().path())?;
        let entry = matched.entry;

        tracing::Span::current().record("api.name", entry.name());
        tracing::debug!(
            api = entry.name(),
            table_version = table.version(),
            vars = ?matched.vars,
            suffix = %matched.suffix,
            "Matched route"
        );

        let ctx = RequestContext {
            route: entry.route.clone(),
            vars: matched.vars,
            suffix: matched.suffix,
            table_version: table.version(),
            client_addr,
            cancellation,
        };

        let mut response = Next::new(&entry.middleware, self.endpoint.as_ref())
            .run(&ctx, req)
            .await;
        response
            .extensions_mut()
            .insert(MatchedApi(entry.name().to_string()));
        Ok(response)
    }
}
