use std::{net::SocketAddr, sync::Arc};

use axum::{Router, extract::Request, middleware as axum_middleware};
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::{
    adapters::{
        HttpHandler,
        middleware::{log_response, make_request_span, real_ip_middleware, request_id_middleware},
    },
    config::models::RealIpConfig,
    utils::GracefulShutdown,
};

/// Build the gateway router. Every path, including `/`, reaches the handler.
pub fn build_router(handler: Arc<HttpHandler>, real_ip: Arc<RealIpConfig>) -> Router {
    Router::new()
        .fallback(move |req: Request| {
            let handler = handler.clone();
            async move { handler.handle_request(req).await }
        })
        .layer(axum_middleware::from_fn_with_state(real_ip, real_ip_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(make_request_span)
                .on_response(log_response),
        )
        .layer(axum_middleware::from_fn(request_id_middleware))
}

/// Serve `router` until shutdown is signalled, then drain in-flight requests
/// for at most the configured grace period.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: Arc<GracefulShutdown>,
) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .context("Failed to get local addr")?;
    tracing::info!("Switchyard gateway listening on {}", local_addr);

    let signal = shutdown.signal();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
    });

    tokio::select! {
        joined = &mut server => {
            // The server stopped on its own.
            return joined.context("Server task failed")?.context("Server error");
        }
        _ = shutdown.signal() => {
            tracing::info!("Shutdown signal received, draining in-flight requests");
        }
    }

    match shutdown.drain(server).await {
        Some(result) => {
            result?.context("Server error")?;
            tracing::info!("Graceful shutdown completed");
        }
        None => tracing::warn!("Forced shutdown with requests still in flight"),
    }
    Ok(())
}
