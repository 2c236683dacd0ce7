use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioTimer},
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    config::models::TransportConfig,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    tracing_setup,
};

/// Pooled upstream client using Hyper with Rustls. Upstream connections
/// speak HTTP/1.1 only, over plain TCP or TLS.
///
/// Responsibilities:
/// * Applies the transport timeouts and pool limits from [`TransportConfig`]
/// * Sets the Host header from the outbound URI
/// * Sends every request as HTTP/1.1, whatever version the client used
/// * Converts between Hyper body and Axum body types
///
/// Retries and circuit breaking are deliberately not handled here.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    transport: TransportConfig,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new(transport: &TransportConfig) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_nodelay(true);
        http_connector.set_connect_timeout(Some(transport.connect_timeout));
        http_connector.set_keepalive(Some(transport.keep_alive));

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(transport.idle_timeout)
            .pool_max_idle_per_host(transport.max_idle_per_host)
            .build::<_, AxumBody>(https_connector);

        tracing::info!(
            connect_timeout = ?transport.connect_timeout,
            response_timeout = ?transport.response_timeout,
            max_idle_per_host = transport.max_idle_per_host,
            "Created upstream HTTP client"
        );
        Ok(Self {
            client,
            transport: transport.clone(),
        })
    }

    fn host_header(req: &Request<AxumBody>) -> HttpClientResult<HeaderValue> {
        let host = req.uri().host().ok_or_else(|| {
            HttpClientError::InvalidRequest(format!("Outgoing URI has no host: {}", req.uri()))
        })?;
        let value = match req.uri().port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        HeaderValue::from_str(&value)
            .map_err(|e| HttpClientError::InvalidRequest(format!("Invalid host '{value}': {e}")))
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        let upstream = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );
        let span = tracing_setup::create_backend_span(
            &upstream,
            req.method().as_str(),
            req.uri().path(),
        );

        let host = Self::host_header(&req)?;
        req.headers_mut().insert(header::HOST, host);

        let (mut parts, axum_body) = req.into_parts();
        parts.version = Version::HTTP_11;

        let outgoing_request = Request::from_parts(parts, axum_body);
        let method = outgoing_request.method().clone();
        let uri = outgoing_request.uri().clone();
        let response_timeout = self.transport.response_timeout;
        let client = self.client.clone();

        async move {
            tracing::debug!("Sending request: {} {}", method, uri);
            let started = std::time::Instant::now();

            let result = timeout(response_timeout, client.request(outgoing_request)).await;
            tracing::Span::current().record("duration_ms", started.elapsed().as_millis() as u64);

            match result {
                Ok(Ok(response)) => {
                    tracing::Span::current().record("http.status_code", response.status().as_u16());

                    let (mut parts, hyper_body) = response.into_parts();
                    // The body is re-framed by the downstream server.
                    parts.headers.remove(header::TRANSFER_ENCODING);

                    Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
                }
                Ok(Err(e)) => {
                    tracing::Span::current().record("http.status_code", 599u16);
                    Err(HttpClientError::ConnectionError(format!(
                        "Request to {method} {uri} failed: {e}"
                    )))
                }
                Err(_) => {
                    tracing::Span::current().record("http.status_code", 504u16);
                    Err(HttpClientError::Timeout(response_timeout))
                }
            }
        }
        .instrument(span)
        .await
    }
}
