#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr};

use axum::http::Method;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    config::{
        definition::{ApiRoute, Definition, extract_placeholders},
        models::GatewayConfig,
    },
    core::plugin::{PluginError, PluginRegistry},
};

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("invalid identifier regex"));

const KNOWN_METHODS: [Method; 9] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::CONNECT,
    Method::OPTIONS,
    Method::TRACE,
];

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Duplicate API name '{name}'")]
    DuplicateName { name: String },

    #[error("API '{api}' references unknown plugin '{plugin}'")]
    UnknownPlugin { api: String, plugin: String },

    #[error("API '{api}': {source}")]
    PluginConfig { api: String, source: PluginError },

    #[error("Validation failed: {message}")]
    ValidationFailed {
        message: String,
        errors: Vec<ValidationError>,
    },
}

impl ValidationError {
    /// Individual violations. A single violation yields itself.
    pub fn violations(&self) -> &[ValidationError] {
        match self {
            ValidationError::ValidationFailed { errors, .. } => errors,
            other => std::slice::from_ref(other),
        }
    }

    fn from_list(errors: Vec<ValidationError>) -> ValidationResult<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: format_multiple_errors(&errors),
                errors,
            })
        }
    }
}

/// Route definition validator.
///
/// Every rule is checked and all violations are reported together; any one of
/// them rejects the whole definition.
pub struct DefinitionValidator;

impl DefinitionValidator {
    pub fn validate(definition: &Definition, registry: &PluginRegistry) -> ValidationResult<()> {
        let mut errors = Vec::new();
        let mut seen_names = HashSet::new();

        for (index, api) in definition.apis.iter().enumerate() {
            if api.name.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("apis[{index}].name"),
                });
            } else if !seen_names.insert(api.name.as_str()) {
                errors.push(ValidationError::DuplicateName {
                    name: api.name.clone(),
                });
            }

            let label = if api.name.is_empty() {
                format!("apis[{index}]")
            } else {
                api.name.clone()
            };
            errors.extend(Self::validate_api(&label, api, registry));
        }

        ValidationError::from_list(errors)
    }

    fn validate_api(label: &str, api: &ApiRoute, registry: &PluginRegistry) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let proxy = &api.proxy;

        let captured = match Self::validate_path(label, &proxy.path) {
            Ok(captured) => Some(captured),
            Err(mut path_errors) => {
                errors.append(&mut path_errors);
                None
            }
        };

        for method in &proxy.methods {
            if let Err(e) = Self::validate_method(label, method) {
                errors.push(e);
            }
        }

        if let Err(e) = Self::validate_url(
            &proxy.upstream.target,
            &format!("API '{label}' upstream.target"),
        ) {
            errors.push(e);
        }

        // Every upstream placeholder must be filled from the route's own path.
        if let Some(captured) = captured {
            for var in &proxy.upstream.vars {
                if !captured.contains(var) {
                    errors.push(ValidationError::InvalidField {
                        field: format!("API '{label}' upstream.target"),
                        message: format!(
                            "placeholder '{{{var}}}' is not captured by path '{}'",
                            proxy.path
                        ),
                    });
                }
            }
        }

        for plugin in &api.plugins {
            match registry.validate_config(plugin) {
                Ok(()) => {}
                Err(PluginError::NotFound(name)) => errors.push(ValidationError::UnknownPlugin {
                    api: label.to_string(),
                    plugin: name,
                }),
                Err(source) => errors.push(ValidationError::PluginConfig {
                    api: label.to_string(),
                    source,
                }),
            }
        }

        errors
    }

    /// Check a route path pattern and return the names it captures.
    fn validate_path(label: &str, path: &str) -> Result<HashSet<String>, Vec<ValidationError>> {
        let field = format!("API '{label}' proxy.path");
        let invalid = |message: String| ValidationError::InvalidField {
            field: field.clone(),
            message,
        };

        if path.is_empty() {
            return Err(vec![ValidationError::MissingField { field }]);
        }
        if !path.starts_with('/') {
            return Err(vec![invalid("path must start with '/'".to_string())]);
        }

        let mut errors = Vec::new();
        let mut depth = 0usize;
        for c in path.chars() {
            match c {
                '{' => depth += 1,
                '}' if depth == 0 => {
                    errors.push(invalid("unbalanced '}'".to_string()));
                    break;
                }
                '}' => depth -= 1,
                _ => {}
            }
            if depth > 1 {
                errors.push(invalid("nested '{' is not allowed".to_string()));
                break;
            }
        }
        if errors.is_empty() && depth != 0 {
            errors.push(invalid("unclosed '{'".to_string()));
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let mut captured = HashSet::new();
        for name in extract_placeholders(path) {
            if !IDENTIFIER_RE.is_match(&name) {
                errors.push(invalid(format!("'{name}' is not a valid variable name")));
            } else if !captured.insert(name.clone()) {
                errors.push(invalid(format!("variable '{name}' is captured twice")));
            }
        }
        if path.contains("{}") {
            errors.push(invalid("empty placeholder '{}'".to_string()));
        }

        if errors.is_empty() {
            Ok(captured)
        } else {
            Err(errors)
        }
    }

    fn validate_method(label: &str, method: &str) -> ValidationResult<()> {
        let upper = method.to_ascii_uppercase();
        if KNOWN_METHODS.iter().any(|m| m.as_str() == upper) {
            Ok(())
        } else {
            Err(ValidationError::InvalidField {
                field: format!("API '{label}' proxy.methods"),
                message: format!("'{method}' is not a recognized HTTP method"),
            })
        }
    }

    /// Validate URL format
    pub(crate) fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }
}

/// Parse an HTTP method as it may appear in a definition.
pub fn parse_method(method: &str) -> Option<Method> {
    let upper = method.to_ascii_uppercase();
    KNOWN_METHODS.iter().find(|m| m.as_str() == upper).cloned()
}

/// Gateway process settings validator.
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.listen_addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidListenAddress {
                address: config.listen_addr.clone(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }

        if config.definition_path.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "definition_path".to_string(),
            });
        }

        if tracing_subscriber::EnvFilter::try_new(&config.log.level).is_err() {
            errors.push(ValidationError::InvalidField {
                field: "log.level".to_string(),
                message: format!("'{}' is not a valid filter directive", config.log.level),
            });
        }

        let transport = &config.transport;
        for (field, value) in [
            ("transport.connect_timeout", transport.connect_timeout),
            ("transport.response_timeout", transport.response_timeout),
        ] {
            if value.is_zero() {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
        }

        ValidationError::from_list(errors)
    }
}

/// Format multiple validation errors into a single message
fn format_multiple_errors(errors: &[ValidationError]) -> String {
    if errors.is_empty() {
        return "No errors".to_string();
    }

    if errors.len() == 1 {
        return errors[0].to_string();
    }

    let mut message = format!("Found {} validation errors:\n", errors.len());
    for (i, error) in errors.iter().enumerate() {
        message.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    message
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::definition::{PluginRef, Proxy, Upstream};

    fn api(name: &str, path: &str, target: &str) -> ApiRoute {
        ApiRoute {
            name: name.to_string(),
            proxy: Proxy {
                path: path.to_string(),
                methods: vec!["GET".to_string()],
                upstream: Upstream::new(target, false),
            },
            plugins: vec![],
        }
    }

    fn validate(apis: Vec<ApiRoute>) -> ValidationResult<()> {
        DefinitionValidator::validate(
            &Definition::new(apis),
            &PluginRegistry::with_builtin_plugins(),
        )
    }

    #[test]
    fn test_valid_definition() {
        let result = validate(vec![
            api("users", "/users/{id}", "http://localhost:9001/v1/users/{id}"),
            api("health", "/status", "https://status.internal"),
        ]);
        assert!(result.is_ok());
    }

    #[test]
    fn test_empty_definition_is_valid() {
        assert!(validate(vec![]).is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = validate(vec![
            api("users", "/a", "http://localhost:9001"),
            api("users", "/b", "http://localhost:9002"),
        ])
        .unwrap_err();
        assert_eq!(
            err.violations(),
            &[ValidationError::DuplicateName {
                name: "users".to_string()
            }]
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = validate(vec![api("", "/a", "http://localhost:9001")]).unwrap_err();
        assert!(matches!(
            err.violations()[0],
            ValidationError::MissingField { .. }
        ));
    }

    #[test]
    fn test_path_must_start_with_slash() {
        let err = validate(vec![api("users", "users", "http://localhost:9001")]).unwrap_err();
        assert_eq!(err.violations().len(), 1);

        let err = validate(vec![api("users", "", "http://localhost:9001")]).unwrap_err();
        assert!(matches!(
            err.violations()[0],
            ValidationError::MissingField { .. }
        ));
    }

    #[test]
    fn test_bad_placeholders_rejected() {
        for path in ["/users/{id", "/users/id}", "/users/{}", "/users/{1d}", "/{a}/{a}"] {
            assert!(
                validate(vec![api("users", path, "http://localhost:9001")]).is_err(),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn test_unknown_method_rejected() {
        let mut route = api("users", "/users", "http://localhost:9001");
        route.proxy.methods = vec!["get".to_string(), "FETCH".to_string()];
        let err = validate(vec![route]).unwrap_err();
        assert_eq!(err.violations().len(), 1);
        assert!(err.to_string().contains("FETCH"));
    }

    #[test]
    fn test_target_must_be_absolute_http_url() {
        for target in ["/relative", "ftp://files.local/x", "not a url"] {
            assert!(validate(vec![api("users", "/users", target)]).is_err());
        }
    }

    #[test]
    fn test_uncaptured_upstream_placeholder_rejected() {
        let err = validate(vec![api(
            "users",
            "/users/{id}",
            "http://localhost:9001/users/{userId}",
        )])
        .unwrap_err();
        assert!(err.to_string().contains("userId"));
    }

    #[test]
    fn test_unknown_plugin_rejected() {
        let mut route = api("users", "/users", "http://localhost:9001");
        route.plugins = vec![PluginRef::new("auth", json!({}))];
        let err = validate(vec![route]).unwrap_err();
        assert_eq!(
            err.violations(),
            &[ValidationError::UnknownPlugin {
                api: "users".to_string(),
                plugin: "auth".to_string()
            }]
        );
    }

    #[test]
    fn test_plugin_config_checked() {
        let mut route = api("users", "/users", "http://localhost:9001");
        route.plugins = vec![PluginRef::new("rate", json!({"limit": 0}))];
        let err = validate(vec![route]).unwrap_err();
        assert!(matches!(
            err.violations()[0],
            ValidationError::PluginConfig { .. }
        ));
    }

    #[test]
    fn test_all_violations_reported() {
        let err = validate(vec![
            api("a", "no-slash", "http://localhost:9001"),
            api("b", "/b", "gopher://x"),
        ])
        .unwrap_err();
        assert_eq!(err.violations().len(), 2);
        assert!(err.to_string().contains("Found 2 validation errors"));
    }

    #[test]
    fn test_parse_method_case_insensitive() {
        assert_eq!(parse_method("patch"), Some(Method::PATCH));
        assert_eq!(parse_method("BREW"), None);
    }

    #[test]
    fn test_gateway_config_validation() {
        assert!(GatewayConfigValidator::validate(&GatewayConfig::default()).is_ok());

        let config = GatewayConfig {
            listen_addr: "localhost".to_string(),
            ..GatewayConfig::default()
        };
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(matches!(
            err.violations()[0],
            ValidationError::InvalidListenAddress { .. }
        ));
    }
}
