use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, HeaderName, HeaderValue, Request, Response, header},
    response::IntoResponse,
};

use crate::{
    core::{
        plugin::{Endpoint, RequestContext},
        rewrite::build_upstream_uri,
    },
    metrics,
    ports::{
        http_client::{HttpClient, HttpClientError},
        http_server::GatewayError,
    },
};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Connection-scoped headers that must not be forwarded in either direction.
const HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

/// Terminal endpoint forwarding matched requests to their upstream.
///
/// The upstream call races the request's cancellation token; when the client
/// goes away first the call is dropped and the request ends with 499.
pub struct ReverseProxy {
    client: Arc<dyn HttpClient>,
}

impl ReverseProxy {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }

    pub async fn forward(
        &self,
        ctx: &RequestContext,
        req: Request<Body>,
    ) -> Result<Response<Body>, GatewayError> {
        let api = ctx.api_name();
        let upstream = &ctx.route.proxy.upstream;

        let uri = build_upstream_uri(upstream, &ctx.vars, &ctx.suffix, req.uri().query())
            .map_err(|e| {
                tracing::error!(api, target = %upstream.target, error = %e, "Failed to build upstream URI");
                GatewayError::from(e)
            })?;

        let (mut parts, body) = req.into_parts();
        let original_host = parts
            .headers
            .get(header::HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });
        let inbound_proto = if parts.uri.scheme_str() == Some("https") {
            "https"
        } else {
            "http"
        };

        remove_hop_by_hop_headers(&mut parts.headers);
        // The client derives Host from the upstream URI.
        parts.headers.remove(header::HOST);

        // Append the connecting peer, not the resolved client.
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr)
            .or(ctx.client_addr);
        if let Some(addr) = peer {
            let ip = addr.ip().to_string();
            let forwarded_for = match parts
                .headers
                .get(&X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) => format!("{existing}, {ip}"),
                None => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                parts.headers.insert(X_FORWARDED_FOR, value);
            }
        }
        if let Some(host) = original_host {
            parts.headers.insert(X_FORWARDED_HOST, host);
        }
        parts
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static(inbound_proto));

        parts.uri = uri.clone();
        let method = parts.method.clone();
        let outbound = Request::from_parts(parts, body);

        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => {
                tracing::debug!(api, method = %method, upstream_uri = %uri, "Client closed request before upstream responded");
                metrics::increment_client_closed(api);
                Err(GatewayError::ClientClosedRequest)
            }
            result = self.client.send_request(outbound) => match result {
                Ok(mut response) => {
                    remove_hop_by_hop_headers(response.headers_mut());
                    metrics::increment_upstream_request_total(api, response.status().as_u16());
                    Ok(response)
                }
                Err(e) => {
                    let kind = match e {
                        HttpClientError::Timeout(_) => "timeout",
                        _ => "connect",
                    };
                    tracing::error!(
                        api,
                        method = %method,
                        upstream_host = uri.host().unwrap_or_default(),
                        upstream_uri = %uri,
                        upstream_scheme = uri.scheme_str().unwrap_or_default(),
                        error = %e,
                        "Upstream request failed"
                    );
                    metrics::increment_upstream_error(api, kind);
                    Err(GatewayError::BadGateway(e.to_string()))
                }
            }
        }
    }
}

#[async_trait]
impl Endpoint for ReverseProxy {
    async fn call(&self, ctx: &RequestContext, req: Request<Body>) -> Response<Body> {
        match self.forward(ctx, req).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex, time::Duration};

    use axum::http::{StatusCode, Uri};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        config::definition::{ApiRoute, Proxy, Upstream},
        ports::http_client::HttpClientResult,
    };

    /// Records the outbound request and replies with a fixed result.
    struct MockClient {
        seen: Mutex<Option<(Uri, HeaderMap)>>,
        fail: Option<fn() -> HttpClientError>,
        delay: Duration,
    }

    impl MockClient {
        fn ok() -> Self {
            Self {
                seen: Mutex::new(None),
                fail: None,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockClient {
        async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
            *self.seen.lock().unwrap() = Some((req.uri().clone(), req.headers().clone()));
            tokio::time::sleep(self.delay).await;
            if let Some(fail) = self.fail {
                return Err(fail());
            }
            Ok(Response::builder()
                .status(StatusCode::CREATED)
                .header(header::CONNECTION, "close")
                .header("x-upstream", "yes")
                .body(Body::empty())
                .unwrap())
        }
    }

    fn context(target: &str, vars: &[(&str, &str)], suffix: &str) -> RequestContext {
        RequestContext {
            route: Arc::new(ApiRoute {
                name: "items".to_string(),
                proxy: Proxy {
                    path: "/api/{id}".to_string(),
                    methods: vec![],
                    upstream: Upstream::new(target, false),
                },
                plugins: vec![],
            }),
            vars: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            suffix: suffix.to_string(),
            table_version: 1,
            client_addr: Some("10.0.0.7:50000".parse().unwrap()),
            cancellation: CancellationToken::new(),
        }
    }

    fn inbound(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, "gateway.local")
            .header(header::CONNECTION, "keep-alive, x-secret")
            .header("x-secret", "drop me")
            .header(X_FORWARDED_FOR, "192.168.1.1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_forward_rewrites_uri_and_headers() {
        let client = Arc::new(MockClient::ok());
        let proxy = ReverseProxy::new(client.clone());
        let ctx = context("http://backend:9001/v2/{id}", &[("id", "42")], "/extra");

        let response = proxy
            .forward(&ctx, inbound("/api/42/extra?x=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get(header::CONNECTION).is_none());
        assert_eq!(response.headers()["x-upstream"], "yes");

        let (uri, headers) = client.seen.lock().unwrap().take().unwrap();
        assert_eq!(uri.to_string(), "http://backend:9001/v2/42/extra?x=1");
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-secret").is_none());
        assert_eq!(headers[X_FORWARDED_FOR], "192.168.1.1, 10.0.0.7");
        assert_eq!(headers[X_FORWARDED_HOST], "gateway.local");
        assert_eq!(headers[X_FORWARDED_PROTO], "http");
    }

    #[tokio::test]
    async fn test_transport_failure_is_bad_gateway() {
        let client = Arc::new(MockClient {
            fail: Some(|| HttpClientError::ConnectionError("refused".into())),
            ..MockClient::ok()
        });
        let proxy = ReverseProxy::new(client);
        let ctx = context("http://backend:9001", &[], "");

        let response = proxy.call(&ctx, inbound("/api/1")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_timeout_is_bad_gateway() {
        let client = Arc::new(MockClient {
            fail: Some(|| HttpClientError::Timeout(Duration::from_millis(5))),
            ..MockClient::ok()
        });
        let proxy = ReverseProxy::new(client);
        let ctx = context("http://backend:9001", &[], "");

        let err = proxy.forward(&ctx, inbound("/api/1")).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadGateway(_)));
    }

    #[tokio::test]
    async fn test_cancellation_reports_client_closed() {
        let client = Arc::new(MockClient {
            delay: Duration::from_secs(30),
            ..MockClient::ok()
        });
        let proxy = ReverseProxy::new(client);
        let ctx = context("http://backend:9001", &[], "");

        let token = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(2), proxy.forward(&ctx, inbound("/api/1")))
            .await
            .expect("cancellation ends the request")
            .unwrap_err();
        assert!(matches!(err, GatewayError::ClientClosedRequest));
        assert_eq!(err.status().as_u16(), 499);
    }

    fn counter_value(rendered: &str, name: &str) -> Option<u64> {
        rendered
            .lines()
            .find(|line| line.starts_with(&format!("{name}{{")))
            .and_then(|line| line.rsplit(' ').next())
            .and_then(|value| value.parse().ok())
    }

    #[tokio::test]
    async fn test_cancellation_is_not_an_upstream_error() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let client = Arc::new(MockClient {
            delay: Duration::from_secs(30),
            ..MockClient::ok()
        });
        let proxy = ReverseProxy::new(client);
        let ctx = context("http://backend:9001", &[], "");
        ctx.cancellation.cancel();

        let response = proxy.call(&ctx, inbound("/api/1")).await;
        assert_eq!(response.status().as_u16(), 499);

        let rendered = handle.render();
        assert_eq!(
            counter_value(&rendered, metrics::SWITCHYARD_CLIENT_CLOSED_TOTAL),
            Some(1),
            "{rendered}"
        );
        assert_eq!(
            counter_value(&rendered, metrics::SWITCHYARD_UPSTREAM_ERRORS_TOTAL),
            None,
            "{rendered}"
        );
    }

    #[tokio::test]
    async fn test_transport_failure_counts_upstream_error() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let client = Arc::new(MockClient {
            fail: Some(|| HttpClientError::ConnectionError("refused".into())),
            ..MockClient::ok()
        });
        let proxy = ReverseProxy::new(client);
        let ctx = context("http://backend:9001", &[], "");

        let response = proxy.call(&ctx, inbound("/api/1")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let rendered = handle.render();
        assert_eq!(
            counter_value(&rendered, metrics::SWITCHYARD_UPSTREAM_ERRORS_TOTAL),
            Some(1),
            "{rendered}"
        );
        assert_eq!(
            counter_value(&rendered, metrics::SWITCHYARD_CLIENT_CLOSED_TOTAL),
            None,
            "{rendered}"
        );
    }

    #[tokio::test]
    async fn test_forwarded_for_appends_connecting_peer() {
        let client = Arc::new(MockClient::ok());
        let proxy = ReverseProxy::new(client.clone());
        let mut ctx = context("http://backend:9001", &[], "");
        ctx.client_addr = Some("203.0.113.5:0".parse().unwrap());

        let mut req = Request::builder()
            .uri("/api/1")
            .header(X_FORWARDED_FOR, "203.0.113.5")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("10.0.0.1:4000".parse::<SocketAddr>().unwrap()));
        proxy.forward(&ctx, req).await.unwrap();

        let (_, headers) = client.seen.lock().unwrap().take().unwrap();
        assert_eq!(headers[X_FORWARDED_FOR], "203.0.113.5, 10.0.0.1");
    }

    #[tokio::test]
    async fn test_rewrite_failure_is_internal_error() {
        let proxy = ReverseProxy::new(Arc::new(MockClient::ok()));
        let ctx = context("http://{id}:9001", &[("id", "bad host")], "");

        let response = proxy.call(&ctx, inbound("/api/x")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_remove_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("x-custom"));
        headers.insert("x-custom", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        remove_hop_by_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }
}
