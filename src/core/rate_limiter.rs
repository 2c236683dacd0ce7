//! The built-in `rate` plugin: request-rate limiting built atop `governor`.
//!
//! Each route that references the plugin gets its own limiter when the route
//! table is compiled, so counters start fresh after every reload. The limiter
//! is keyed by a vary-by attribute (matched route, client IP or a header
//! value). GCRA is used for every mode; `burst` controls how many requests may
//! be admitted back to back.
use std::{
    hash::Hash,
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderName, HeaderValue, Request, Response, StatusCode, header},
    response::IntoResponse,
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed, keyed::DefaultKeyedStateStore},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    core::plugin::{Middleware, Next, Plugin, PluginError, RequestContext},
    metrics,
};

pub const RATE_PLUGIN_NAME: &str = "rate";

fn default_max_store_size() -> usize {
    65_536
}

fn default_status_code() -> u16 {
    429
}

fn default_message() -> String {
    "Too Many Requests".to_string()
}

/// Time unit the `limit` is expressed in.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum RatePeriod {
    #[default]
    #[serde(rename = "s", alias = "second")]
    Second,
    #[serde(rename = "m", alias = "minute")]
    Minute,
    #[serde(rename = "h", alias = "hour")]
    Hour,
    #[serde(rename = "d", alias = "day")]
    Day,
}

impl RatePeriod {
    pub fn as_duration(self) -> Duration {
        match self {
            RatePeriod::Second => Duration::from_secs(1),
            RatePeriod::Minute => Duration::from_secs(60),
            RatePeriod::Hour => Duration::from_secs(60 * 60),
            RatePeriod::Day => Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Rate limiting discriminator for how keys are derived.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBy {
    Ip,
    Header,
    #[default]
    Route,
}

/// Behaviour when the vary-by key cannot be extracted from a request.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    #[default]
    Allow,
    Deny,
}

/// Configuration accepted by the `rate` plugin.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Requests admitted per `per`.
    pub limit: u32,
    #[serde(default)]
    pub per: RatePeriod,
    /// Extra requests admitted back to back. Defaults to `limit - 1`.
    #[serde(default)]
    pub burst: Option<u32>,
    /// Keyed limiters evict stale keys once they track more than this.
    #[serde(default = "default_max_store_size")]
    pub max_store_size: usize,
    #[serde(default)]
    pub vary_by: RateLimitBy,
    #[serde(default)]
    pub header_name: Option<String>, // Should be Some if vary_by == Header
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default)]
    pub on_missing_key: MissingKeyPolicy,
}

impl RateLimitConfig {
    pub fn new(limit: u32, per: RatePeriod) -> Self {
        Self {
            limit,
            per,
            burst: None,
            max_store_size: default_max_store_size(),
            vary_by: RateLimitBy::Route,
            header_name: None,
            status_code: default_status_code(),
            message: default_message(),
            on_missing_key: MissingKeyPolicy::Allow,
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|e| e.to_string())
    }

    fn effective_burst(&self) -> u32 {
        self.burst.unwrap_or(self.limit.saturating_sub(1))
    }

    fn quota(&self) -> Result<Quota, String> {
        if self.limit == 0 {
            return Err("'limit' must be greater than 0".to_string());
        }
        let period = self.per.as_duration() / self.limit;
        let capacity = NonZeroU32::new(self.effective_burst().saturating_add(1))
            .ok_or_else(|| "burst capacity overflowed".to_string())?;
        Quota::with_period(period)
            .map(|quota| quota.allow_burst(capacity))
            .ok_or_else(|| format!("'limit' {} is too large for one {:?}", self.limit, self.per))
    }
}

/// Bundles a concrete governor limiter with response metadata and the
/// behaviour on missing key.
pub struct LimiterWrapper<RL> {
    pub limiter: RL,
    pub status_code: StatusCode,
    pub message: String,
    pub on_missing_key: MissingKeyPolicy,
    pub max_store_size: usize,
}

pub type DirectRateLimiterImpl = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
pub type KeyedRateLimiterImpl<K> = RateLimiter<K, DefaultKeyedStateStore<K>, DefaultClock>;

/// Non-keyed limiter, one bucket for the route.
pub type RouteSpecificLimiter = LimiterWrapper<DirectRateLimiterImpl>;
/// Per-client-IP keyed limiter.
pub type IpLimiter = LimiterWrapper<KeyedRateLimiterImpl<IpAddr>>;
/// Per-header-value keyed limiter.
pub type HeaderLimiter = LimiterWrapper<KeyedRateLimiterImpl<String>>;

impl<RL> LimiterWrapper<RL> {
    fn reject(&self, retry_after: Option<Duration>) -> Response<Body> {
        let mut response = (self.status_code, self.message.clone()).into_response();
        if let Some(wait) = retry_after {
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }

    fn missing_key(&self, reason: String) -> Result<(), Box<Response<Body>>> {
        match self.on_missing_key {
            MissingKeyPolicy::Allow => Ok(()),
            MissingKeyPolicy::Deny => Err(Box::new((self.status_code, reason).into_response())),
        }
    }
}

impl RouteSpecificLimiter {
    pub fn check_route(&self) -> Result<(), Box<Response<Body>>> {
        self.limiter.check().map_err(|not_until| {
            let wait = not_until.wait_time_from(self.limiter.clock().now());
            Box::new(self.reject(Some(wait)))
        })
    }
}

impl<K> LimiterWrapper<KeyedRateLimiterImpl<K>>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
{
    fn check_keyed(&self, key: &K) -> Result<(), Box<Response<Body>>> {
        let result = self.limiter.check_key(key);
        if self.limiter.len() > self.max_store_size {
            self.limiter.retain_recent();
        }
        result.map_err(|not_until| {
            let wait = not_until.wait_time_from(self.limiter.clock().now());
            Box::new(self.reject(Some(wait)))
        })
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }
}

impl IpLimiter {
    pub fn check_ip(&self, ip: IpAddr) -> Result<(), Box<Response<Body>>> {
        self.check_keyed(&ip)
    }
}

impl HeaderLimiter {
    pub fn check_header_value(&self, value: &str) -> Result<(), Box<Response<Body>>> {
        self.check_keyed(&value.to_string())
    }
}

/// Discriminated union over supported limiter types.
#[derive(Clone)]
pub enum RouteRateLimiter {
    Route(Arc<RouteSpecificLimiter>),
    Ip(Arc<IpLimiter>),
    Header {
        limiter: Arc<HeaderLimiter>,
        header_name: HeaderName,
    },
}

impl RouteRateLimiter {
    /// Build a limiter from a `RateLimitConfig` definition.
    pub fn new(config: &RateLimitConfig) -> Result<Self, String> {
        let quota = config.quota()?;

        let status_code = StatusCode::from_u16(config.status_code)
            .map_err(|_| format!("Invalid status code: {}", config.status_code))?;

        if config.max_store_size == 0 {
            return Err("'max_store_size' must be greater than 0".to_string());
        }

        tracing::debug!(
            "Creating rate limiter: vary_by={:?}, limit={}, per={:?}, burst={}, status_code={}, on_missing_key={:?}",
            config.vary_by,
            config.limit,
            config.per,
            config.effective_burst(),
            config.status_code,
            config.on_missing_key
        );

        match config.vary_by {
            RateLimitBy::Route => Ok(RouteRateLimiter::Route(Arc::new(LimiterWrapper {
                limiter: RateLimiter::direct(quota),
                status_code,
                message: config.message.clone(),
                on_missing_key: config.on_missing_key,
                max_store_size: config.max_store_size,
            }))),
            RateLimitBy::Ip => Ok(RouteRateLimiter::Ip(Arc::new(LimiterWrapper {
                limiter: RateLimiter::keyed(quota),
                status_code,
                message: config.message.clone(),
                on_missing_key: config.on_missing_key,
                max_store_size: config.max_store_size,
            }))),
            RateLimitBy::Header => {
                let header_name_str = config
                    .header_name
                    .as_ref()
                    .ok_or_else(|| "header_name is required when vary_by is 'header'".to_string())?;
                let header_name = HeaderName::from_bytes(header_name_str.as_bytes())
                    .map_err(|e| format!("Invalid header_name '{header_name_str}': {e}"))?;
                Ok(RouteRateLimiter::Header {
                    limiter: Arc::new(LimiterWrapper {
                        limiter: RateLimiter::keyed(quota),
                        status_code,
                        message: config.message.clone(),
                        on_missing_key: config.on_missing_key,
                        max_store_size: config.max_store_size,
                    }),
                    header_name,
                })
            }
        }
    }

    /// Enforce this limiter against a request bound to `ctx`.
    pub fn check<T>(
        &self,
        ctx: &RequestContext,
        req: &Request<T>,
    ) -> Result<(), Box<Response<Body>>> {
        match self {
            RouteRateLimiter::Route(limiter) => limiter.check_route(),
            RouteRateLimiter::Ip(limiter) => {
                let client_ip = ctx.client_addr.map(|addr| addr.ip()).or_else(|| {
                    req.extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|connect_info| connect_info.0.ip())
                });

                match client_ip {
                    Some(ip) => limiter.check_ip(ip),
                    None => limiter.missing_key("No client IP available".to_string()),
                }
            }
            RouteRateLimiter::Header {
                limiter,
                header_name,
            } => {
                let header_value = req
                    .headers()
                    .get(header_name)
                    .and_then(|hv| hv.to_str().ok());

                match header_value {
                    Some(value) => limiter.check_header_value(value),
                    None => {
                        limiter.missing_key(format!("Required header '{header_name}' is missing"))
                    }
                }
            }
        }
    }
}

/// Middleware built by the `rate` plugin for one route.
pub struct RateLimitMiddleware {
    limiter: RouteRateLimiter,
}

impl RateLimitMiddleware {
    pub fn new(limiter: RouteRateLimiter) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(
        &self,
        ctx: &RequestContext,
        req: Request<Body>,
        next: Next<'_>,
    ) -> Response<Body> {
        if let Err(response) = self.limiter.check(ctx, &req) {
            tracing::debug!(api = ctx.api_name(), "Request rejected by rate limiter");
            metrics::increment_rate_limited(ctx.api_name());
            return *response;
        }
        next.run(ctx, req).await
    }
}

/// Registry entry for the `rate` plugin.
pub struct RatePlugin;

impl RatePlugin {
    fn parse(config: &Value) -> Result<RateLimitConfig, PluginError> {
        let invalid = |message: String| PluginError::InvalidConfig {
            plugin: RATE_PLUGIN_NAME.to_string(),
            message,
        };
        let parsed = RateLimitConfig::from_value(config).map_err(invalid)?;
        // Building the limiter exercises every semantic check.
        RouteRateLimiter::new(&parsed).map_err(invalid)?;
        Ok(parsed)
    }
}

impl Plugin for RatePlugin {
    fn name(&self) -> &str {
        RATE_PLUGIN_NAME
    }

    fn validate_config(&self, config: &Value) -> Result<(), PluginError> {
        Self::parse(config).map(|_| ())
    }

    fn build_before_dispatch(
        &self,
        config: &Value,
    ) -> Result<Option<Arc<dyn Middleware>>, PluginError> {
        let parsed = Self::parse(config)?;
        let limiter = RouteRateLimiter::new(&parsed).map_err(|message| PluginError::Build {
            plugin: RATE_PLUGIN_NAME.to_string(),
            message,
        })?;
        Ok(Some(Arc::new(RateLimitMiddleware::new(limiter))))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Method;
    use serde_json::json;

    use super::*;
    use crate::core::plugin::tests::{StaticEndpoint, test_context};

    fn request_with_header(name: &str, value: &str) -> Request<()> {
        Request::builder()
            .method(Method::GET)
            .uri("/test")
            .header(name, value)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = RateLimitConfig::from_value(&json!({"limit": 10})).unwrap();
        assert_eq!(config.per, RatePeriod::Second);
        assert_eq!(config.effective_burst(), 9);
        assert_eq!(config.max_store_size, 65_536);
        assert_eq!(config.vary_by, RateLimitBy::Route);
        assert_eq!(config.status_code, 429);
    }

    #[test]
    fn test_config_units() {
        for (unit, expected) in [("s", 1), ("m", 60), ("h", 3600), ("d", 86_400)] {
            let config = RateLimitConfig::from_value(&json!({"limit": 1, "per": unit})).unwrap();
            assert_eq!(config.per.as_duration(), Duration::from_secs(expected));
        }
        assert!(RateLimitConfig::from_value(&json!({"limit": 1, "per": "w"})).is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(RatePlugin.validate_config(&json!({"limit": 1, "burts": 2})).is_err());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let err = RatePlugin.validate_config(&json!({"limit": 0})).unwrap_err();
        assert!(matches!(err, PluginError::InvalidConfig { .. }));
    }

    #[test]
    fn test_missing_limit_rejected() {
        assert!(RatePlugin.validate_config(&json!({"per": "m"})).is_err());
    }

    #[test]
    fn test_header_mode_requires_header_name() {
        let result = RatePlugin.validate_config(&json!({"limit": 5, "vary_by": "header"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_sixth_request_rejected_within_one_second() {
        let limiter = RouteRateLimiter::new(&RateLimitConfig::new(5, RatePeriod::Second)).unwrap();
        let ctx = test_context("limited");
        let req = request_with_header("x-api-key", "a");

        let outcomes: Vec<bool> = (0..6).map(|_| limiter.check(&ctx, &req).is_ok()).collect();
        assert!(outcomes.iter().take(5).all(|ok| *ok));
        assert!(!outcomes[5]);
    }

    #[test]
    fn test_other_vary_by_key_unaffected() {
        let mut config = RateLimitConfig::new(5, RatePeriod::Second);
        config.vary_by = RateLimitBy::Header;
        config.header_name = Some("x-api-key".to_string());
        let limiter = RouteRateLimiter::new(&config).unwrap();
        let ctx = test_context("limited");

        let a = request_with_header("x-api-key", "a");
        let rejected = (0..6).filter(|_| limiter.check(&ctx, &a).is_err()).count();
        assert!(rejected >= 1);

        let b = request_with_header("x-api-key", "b");
        assert!(limiter.check(&ctx, &b).is_ok());
    }

    #[test]
    fn test_rejection_carries_status_and_retry_after() {
        let mut config = RateLimitConfig::new(1, RatePeriod::Minute);
        config.status_code = 503;
        let limiter = RouteRateLimiter::new(&config).unwrap();
        let ctx = test_context("limited");
        let req = request_with_header("x-api-key", "a");

        assert!(limiter.check(&ctx, &req).is_ok());
        let response = limiter.check(&ctx, &req).unwrap_err();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let retry_after: u64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry_after));
    }

    #[test]
    fn test_missing_header_policy() {
        let mut config = RateLimitConfig::new(1, RatePeriod::Second);
        config.vary_by = RateLimitBy::Header;
        config.header_name = Some("x-api-key".to_string());
        let ctx = test_context("limited");
        let req = Request::builder().uri("/").body(()).unwrap();

        let allow = RouteRateLimiter::new(&config).unwrap();
        assert!(allow.check(&ctx, &req).is_ok());

        config.on_missing_key = MissingKeyPolicy::Deny;
        let deny = RouteRateLimiter::new(&config).unwrap();
        assert!(deny.check(&ctx, &req).is_err());
    }

    #[test]
    fn test_keyed_store_evicts_stale_keys() {
        let mut config = RateLimitConfig::new(100, RatePeriod::Second);
        config.vary_by = RateLimitBy::Ip;
        config.max_store_size = 4;
        let limiter = RouteRateLimiter::new(&config).unwrap();
        let RouteRateLimiter::Ip(inner) = &limiter else {
            panic!("expected ip limiter");
        };

        for i in 0..32u8 {
            inner.check_ip(IpAddr::from([10, 0, 0, i])).unwrap();
        }
        std::thread::sleep(Duration::from_millis(50));
        inner.check_ip(IpAddr::from([10, 0, 1, 0])).unwrap();

        assert!(inner.tracked_keys() <= 4);
    }

    #[tokio::test]
    async fn test_middleware_short_circuits_rejected_requests() {
        let middleware = RatePlugin
            .build_before_dispatch(&json!({"limit": 1, "per": "m"}))
            .unwrap()
            .unwrap();
        let chain = vec![middleware];
        let endpoint = StaticEndpoint(StatusCode::OK);
        let ctx = test_context("limited");

        let first = Next::new(&chain, &endpoint)
            .run(&ctx, Request::builder().uri("/").body(Body::empty()).unwrap())
            .await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = Next::new(&chain, &endpoint)
            .run(&ctx, Request::builder().uri("/").body(Body::empty()).unwrap())
            .await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
