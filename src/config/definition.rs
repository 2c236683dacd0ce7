//! Declarative route definition.
//!
//! A [`Definition`] is the ordered list of APIs the gateway serves at one point
//! in time. It is deserialized through the `config` crate (YAML / JSON / TOML)
//! and is never mutated once it has passed validation.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^{}/]+)\}").expect("placeholder pattern is valid"));

/// Full declarative configuration of all gateway routes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    /// Routes in match-priority order.
    #[serde(default)]
    pub apis: Vec<ApiRoute>,
    /// Staleness stamp. Never used for ordering.
    #[serde(default)]
    pub version: i64,
}

impl Definition {
    pub fn new(apis: Vec<ApiRoute>) -> Self {
        Self { apis, version: 0 }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn len(&self) -> usize {
        self.apis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
    }
}

/// One named rule mapping an inbound path + method pattern to an upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRoute {
    pub name: String,
    pub proxy: Proxy,
    /// Ordered plugin chain; the first entry is the outermost middleware.
    #[serde(default)]
    pub plugins: Vec<PluginRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    /// Path pattern, `{var}` captures exactly one path segment.
    pub path: String,
    /// Allowed methods. Empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,
    pub upstream: Upstream,
}

/// Upstream target of a route.
///
/// `vars` is derived from `target` when the value is constructed and is never
/// read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawUpstream")]
pub struct Upstream {
    pub target: String,
    pub fixed_path: bool,
    #[serde(skip_serializing)]
    pub vars: Vec<String>,
}

#[derive(Deserialize)]
struct RawUpstream {
    target: String,
    #[serde(default)]
    fixed_path: bool,
}

impl From<RawUpstream> for Upstream {
    fn from(raw: RawUpstream) -> Self {
        Upstream::new(raw.target, raw.fixed_path)
    }
}

impl Upstream {
    pub fn new(target: impl Into<String>, fixed_path: bool) -> Self {
        let target = target.into();
        let vars = extract_placeholders(&target);
        Self {
            target,
            fixed_path,
            vars,
        }
    }
}

/// Reference to a registered plugin plus its opaque configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRef {
    pub name: String,
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
}

impl PluginRef {
    pub fn new(name: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Scan `s` left to right for `{name}` tokens. Duplicates are kept in order.
pub fn extract_placeholders(s: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(s)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Replace each `{name}` token in `template` in a single left-to-right pass.
///
/// Tokens for which `value_for` returns `None` are kept verbatim. Inserted
/// text is never scanned again.
pub fn substitute_placeholders<F>(template: &str, mut value_for: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            value_for(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
