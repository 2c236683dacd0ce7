use std::{any::Any, net::SocketAddr, sync::Arc};

use axum::{
    body::Body as AxumBody,
    extract::ConnectInfo,
    http::{StatusCode, header},
    response::IntoResponse,
};
use eyre::{Result, WrapErr};
use hyper::{Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    adapters::middleware::ClientAddr,
    core::{GatewayService, gateway::MatchedApi},
    metrics::{self, RequestTimer, UNMATCHED_API},
    ports::http_server::GatewayError,
};

/// Reserved path answered by the gateway itself, for any method.
pub const HEALTH_PATH: &str = "/__health__";

/// HTTP handler for the Switchyard gateway
///
/// Every routed request is dispatched on its own task. The handler's future
/// holds a drop guard on the request's cancellation token, so when the server
/// drops the future (the client disconnected) the dispatch sees cancellation.
/// A panic inside the dispatch ends that request with 500 and nothing else.
pub struct HttpHandler {
    gateway_service: Arc<GatewayService>,
}

impl HttpHandler {
    pub fn new(gateway_service: Arc<GatewayService>) -> Self {
        Self { gateway_service }
    }

    /// Main request handler that routes requests appropriately
    pub async fn handle_request(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        if req.uri().path() == HEALTH_PATH {
            return match self.handle_health_check() {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!("Health check failed: {e:#}");
                    GatewayError::InternalError(e.to_string()).into_response()
                }
            };
        }

        let client_addr = req
            .extensions()
            .get::<ClientAddr>()
            .map(|ClientAddr(addr)| *addr)
            .or_else(|| {
                req.extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| *addr)
            });
        let method = req.method().clone();
        let mut timer = RequestTimer::new();

        let response = self.dispatch_isolated(req, client_addr).await;

        let api = response
            .extensions()
            .get::<MatchedApi>()
            .map_or(UNMATCHED_API, |MatchedApi(name)| name.as_str());
        timer.set_api(api);
        metrics::increment_request_total(api, method.as_str(), response.status().as_u16());

        response
    }

    async fn dispatch_isolated(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let cancellation = CancellationToken::new();
        let _guard = cancellation.clone().drop_guard();

        let gateway = self.gateway_service.clone();
        let task = tokio::spawn(
            async move { gateway.dispatch(req, client_addr, cancellation).await }
                .in_current_span(),
        );

        match task.await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                match &e {
                    GatewayError::NotFound | GatewayError::MethodNotAllowed => {
                        tracing::debug!(status = e.status().as_u16(), "No route: {e}");
                    }
                    _ => tracing::warn!(status = e.status().as_u16(), "Request failed: {e}"),
                }
                e.into_response()
            }
            Err(join_error) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                tracing::error!(panic = %message, "Request handler panicked");
                GatewayError::InternalError(message).into_response()
            }
            Err(join_error) => {
                tracing::error!("Request task failed: {join_error}");
                GatewayError::InternalError(join_error.to_string()).into_response()
            }
        }
    }

    /// Handle health check endpoint
    fn handle_health_check(&self) -> Result<Response<AxumBody>> {
        let table = self.gateway_service.active_table();

        let health_data = serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "definition_version": table.version(),
            "routes": table.len(),
            "compiled_at": table.compiled_at().to_rfc3339(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(health_data.to_string()))
            .wrap_err("Failed to build health check response")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}
