//! Route compilation and matching.
//!
//! [`RouteCompiler::compile`] turns a validated [`Definition`] into an
//! immutable [`RouteTable`]. Each route path is compiled once into a
//! segment-aware regex; `{var}` captures exactly one non-empty path segment.
//!
//! A pattern matches a request path when it consumes a leading run of whole
//! segments. What is left over is the *suffix* (`/api/{id}` against
//! `/api/42/extra` leaves `/extra`). An empty or `/` suffix is a full match,
//! anything else a prefix match. Lookup returns the earliest route, in
//! definition order, whose pattern matches and whose methods allow the
//! request. A path with a `.` or `..` segment after the literal prefix never
//! matches, whether it falls in a capture or in the suffix.
use std::{collections::HashMap, sync::Arc};

use axum::http::Method;
use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

use crate::{
    config::{
        definition::{ApiRoute, Definition},
        validation::{DefinitionValidator, ValidationError, parse_method},
    },
    core::{
        plugin::{Middleware, PluginError, PluginRegistry},
        rewrite::is_dot_segment,
    },
};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("API '{api}': invalid path pattern '{path}': {message}")]
    Pattern {
        api: String,
        path: String,
        message: String,
    },

    #[error("API '{api}': {source}")]
    Plugin { api: String, source: PluginError },
}

/// Per-request routing failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no route matches the request path")]
    NotFound,
    #[error("route matches the path but not the method")]
    MethodNotAllowed,
}

/// Compiled form of a route path pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
    vars: Vec<String>,
}

/// Outcome of matching a path against a single pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMatch {
    pub vars: HashMap<String, String>,
    pub suffix: String,
}

impl PathMatch {
    pub fn is_full(&self) -> bool {
        self.suffix.is_empty() || self.suffix == "/"
    }
}

impl PathPattern {
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let trimmed = pattern.trim_end_matches('/');
        let mut expr = String::from("^");
        let mut vars = Vec::new();
        let mut rest = trimmed;

        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|i| open + i) else {
                break;
            };
            expr.push_str(&regex::escape(&rest[..open]));
            let name = &rest[open + 1..close];
            expr.push_str(&format!("(?P<{name}>[^/]+)"));
            vars.push(name.to_string());
            rest = &rest[close + 1..];
        }
        expr.push_str(&regex::escape(rest));

        Ok(Self {
            source: pattern.to_string(),
            regex: Regex::new(&expr)?,
            vars,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match `path`, requiring the pattern to end on a segment boundary.
    pub fn matches(&self, path: &str) -> Option<PathMatch> {
        let caps = self.regex.captures(path)?;
        let end = caps.get(0)?.end();
        let suffix = &path[end..];
        if !suffix.is_empty() && !suffix.starts_with('/') {
            return None;
        }
        if suffix.split('/').any(is_dot_segment) {
            return None;
        }

        let mut vars = HashMap::with_capacity(self.vars.len());
        for name in &self.vars {
            if let Some(m) = caps.name(name) {
                // Dot segments would be resolved away upstream.
                if is_dot_segment(m.as_str()) {
                    return None;
                }
                vars.insert(name.clone(), m.as_str().to_string());
            }
        }

        Some(PathMatch {
            vars,
            suffix: suffix.to_string(),
        })
    }
}

/// One compiled route: matcher, route data and its middleware chain.
pub struct RouteEntry {
    pub route: Arc<ApiRoute>,
    pub pattern: PathPattern,
    /// Empty means any method.
    pub methods: Vec<Method>,
    pub middleware: Vec<Arc<dyn Middleware>>,
}

impl RouteEntry {
    pub fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    pub fn name(&self) -> &str {
        &self.route.name
    }
}

impl std::fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteEntry")
            .field("name", &self.route.name)
            .field("pattern", &self.pattern.as_str())
            .field("methods", &self.methods)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

/// A successful lookup.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub entry: &'a RouteEntry,
    pub vars: HashMap<String, String>,
    pub suffix: String,
}

/// Immutable, versioned set of compiled routes.
#[derive(Debug)]
pub struct RouteTable {
    version: i64,
    entries: Vec<RouteEntry>,
    compiled_at: DateTime<Utc>,
}

impl RouteTable {
    /// A table with no routes. Every routed request is answered with 404.
    pub fn empty() -> Self {
        Self {
            version: 0,
            entries: Vec::new(),
            compiled_at: Utc::now(),
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn compiled_at(&self) -> DateTime<Utc> {
        self.compiled_at
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Resolve a request to the first route, in definition order, that
    /// matches the path and allows the method.
    pub fn lookup(&self, method: &Method, path: &str) -> Result<RouteMatch<'_>, RoutingError> {
        let mut path_matched = false;

        for entry in &self.entries {
            let Some(matched) = entry.pattern.matches(path) else {
                continue;
            };
            path_matched = true;
            if !entry.allows(method) {
                continue;
            }
            return Ok(RouteMatch {
                entry,
                vars: matched.vars,
                suffix: matched.suffix,
            });
        }

        if path_matched {
            Err(RoutingError::MethodNotAllowed)
        } else {
            Err(RoutingError::NotFound)
        }
    }
}

/// Builds route tables. Holds the plugin registry used to resolve plugin
/// references.
#[derive(Debug, Clone)]
pub struct RouteCompiler {
    registry: Arc<PluginRegistry>,
}

impl RouteCompiler {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Validate and compile a definition. Nothing is produced unless every
    /// route compiles.
    pub fn compile(&self, definition: &Definition) -> Result<RouteTable, CompileError> {
        DefinitionValidator::validate(definition, &self.registry)?;

        let mut entries = Vec::with_capacity(definition.apis.len());
        for api in &definition.apis {
            let pattern =
                PathPattern::compile(&api.proxy.path).map_err(|e| CompileError::Pattern {
                    api: api.name.clone(),
                    path: api.proxy.path.clone(),
                    message: e.to_string(),
                })?;

            let methods = api
                .proxy
                .methods
                .iter()
                .filter_map(|m| parse_method(m))
                .collect();

            let middleware =
                self.registry
                    .build_chain(&api.plugins)
                    .map_err(|source| CompileError::Plugin {
                        api: api.name.clone(),
                        source,
                    })?;

            entries.push(RouteEntry {
                route: Arc::new(api.clone()),
                pattern,
                methods,
                middleware,
            });
        }

        tracing::debug!(
            version = definition.version,
            routes = entries.len(),
            "Compiled route table"
        );

        Ok(RouteTable {
            version: definition.version,
            entries,
            compiled_at: Utc::now(),
        })
    }
}
