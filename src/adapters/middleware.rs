//! Axum middleware wrapped around every gateway request.
//!
//! `request_id_middleware` runs outermost so the trace layer below it always
//! sees an `X-Request-ID`. The span hooks are meant for
//! `tower_http::trace::TraceLayer`. `real_ip_middleware` runs inside the
//! request span.
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Span;

use crate::{config::models::RealIpConfig, tracing_setup};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const TRUE_CLIENT_IP: HeaderName = HeaderName::from_static("true-client-ip");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Address of the originating client, after proxy headers were considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Reuse the caller's `X-Request-ID` or generate a UUID, forward it upstream
/// and echo it on the response.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let existing = req
        .headers()
        .get(&X_REQUEST_ID)
        .filter(|v| !v.is_empty())
        .cloned();
    let request_id = match existing {
        Some(value) => value,
        None => match HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
            Ok(value) => value,
            Err(_) => return next.run(req).await,
        },
    };

    req.headers_mut().insert(X_REQUEST_ID, request_id.clone());
    let mut response = next.run(req).await;
    response.headers_mut().insert(X_REQUEST_ID, request_id);
    response
}

/// Client IP announced by an upstream proxy, if any header carries one.
pub fn forwarded_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let header_ip = |name: &HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header_ip(&TRUE_CLIENT_IP)
        .or_else(|| header_ip(&X_REAL_IP))
        .or_else(|| {
            headers
                .get(&X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|first| first.trim().parse().ok())
        })
}

/// Resolve the client address and attach it as [`ClientAddr`].
///
/// Proxy headers are honoured only when enabled and the connecting peer is
/// trusted. Without connection info (in-process callers) the peer counts as
/// trusted only if no proxies are configured.
pub async fn real_ip_middleware(
    State(config): State<Arc<RealIpConfig>>,
    mut req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let trusted = match peer {
        Some(addr) => config.trusts(addr.ip()),
        None => config.trusted_proxies.is_empty(),
    };

    let forwarded = if config.enabled && trusted {
        forwarded_client_ip(req.headers())
    } else {
        None
    };
    let client = match forwarded {
        Some(ip) => Some(SocketAddr::new(ip, 0)),
        None => peer,
    };

    if let Some(addr) = client {
        Span::current().record("client.ip", tracing::field::display(addr.ip()));
        req.extensions_mut().insert(ClientAddr(addr));
    }
    next.run(req).await
}

/// Span factory for the trace layer.
pub fn make_request_span(req: &Request<Body>) -> Span {
    let request_id = req
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    tracing_setup::create_request_span(req.method().as_str(), req.uri().path(), request_id)
}

/// Access log line, written once the response head is ready.
pub fn log_response(response: &Response<Body>, latency: Duration, span: &Span) {
    span.record("http.status_code", response.status().as_u16());
    span.record("duration_ms", latency.as_millis() as u64);
    tracing::info!("Completed - {} in {:?}", response.status(), latency);
}

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        http::{HeaderMap, StatusCode},
        middleware,
        routing::get,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt; // for oneshot
    use tower_http::trace::TraceLayer;

    use super::*;

    fn app() -> Router {
        Router::new()
            .route(
                "/",
                get(|headers: HeaderMap| async move {
                    headers
                        .get(&X_REQUEST_ID)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                }),
            )
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(make_request_span)
                    .on_response(log_response),
            )
            .layer(middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn test_request_id_generated() {
        let response = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Verify it's a valid UUID
        let request_id = response.headers()[X_REQUEST_ID].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(request_id).is_ok());
    }

    #[tokio::test]
    async fn test_incoming_request_id_reused_and_forwarded() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(X_REQUEST_ID, "trace-abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[X_REQUEST_ID], "trace-abc");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "trace-abc");
    }

    fn real_ip_app(config: RealIpConfig) -> Router {
        Router::new()
            .route(
                "/",
                get(|req: Request| async move {
                    req.extensions()
                        .get::<ClientAddr>()
                        .map(|ClientAddr(addr)| addr.ip().to_string())
                        .unwrap_or_default()
                }),
            )
            .layer(middleware::from_fn_with_state(
                Arc::new(config),
                real_ip_middleware,
            ))
    }

    async fn resolved_ip(app: Router, req: Request<Body>) -> String {
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn from_peer(peer: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        req
    }

    #[tokio::test]
    async fn test_real_ip_from_first_forwarded_for_entry() {
        let req = from_peer(
            "10.0.0.1:4000",
            &[("x-forwarded-for", "203.0.113.195, 70.41.3.18, 150.172.238.178")],
        );
        assert_eq!(
            resolved_ip(real_ip_app(RealIpConfig::default()), req).await,
            "203.0.113.195"
        );
    }

    #[tokio::test]
    async fn test_real_ip_from_x_real_ip() {
        let req = from_peer("10.0.0.1:4000", &[("x-real-ip", "203.0.113.195")]);
        assert_eq!(
            resolved_ip(real_ip_app(RealIpConfig::default()), req).await,
            "203.0.113.195"
        );
    }

    #[tokio::test]
    async fn test_real_ip_ignores_untrusted_peer_and_bad_values() {
        let config = RealIpConfig {
            enabled: true,
            trusted_proxies: vec!["10.0.0.1".parse().unwrap()],
        };
        let req = from_peer("10.9.9.9:4000", &[("x-real-ip", "203.0.113.195")]);
        assert_eq!(resolved_ip(real_ip_app(config.clone()), req).await, "10.9.9.9");

        let req = from_peer("10.0.0.1:4000", &[("x-forwarded-for", "not-an-ip")]);
        assert_eq!(resolved_ip(real_ip_app(config), req).await, "10.0.0.1");

        let disabled = RealIpConfig {
            enabled: false,
            ..RealIpConfig::default()
        };
        let req = from_peer("10.0.0.1:4000", &[("x-real-ip", "203.0.113.195")]);
        assert_eq!(resolved_ip(real_ip_app(disabled), req).await, "10.0.0.1");
    }

    #[test]
    fn test_make_request_span() {
        let req = Request::builder()
            .uri("/users")
            .header(X_REQUEST_ID, "id-1")
            .body(Body::empty())
            .unwrap();
        let span = make_request_span(&req);
        assert_eq!(span.metadata().map(|m| m.name()), Some("request"));
    }
}
