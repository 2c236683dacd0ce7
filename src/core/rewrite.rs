//! Upstream URI construction for matched requests.
use std::collections::HashMap;

use axum::http::Uri;
use thiserror::Error;
use url::Url;

use crate::config::definition::{Upstream, substitute_placeholders};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error("upstream target '{target}' is not a valid absolute URL: {message}")]
    InvalidTarget { target: String, message: String },

    #[error("rewritten upstream URI '{uri}' is invalid: {message}")]
    InvalidUri { uri: String, message: String },

    #[error("captured variable '{name}' is a dot segment")]
    DotSegment { name: String },
}

/// True for `.` and `..`, including their percent-encoded spellings.
pub fn is_dot_segment(segment: &str) -> bool {
    let decoded = urlencoding::decode_binary(segment.as_bytes());
    matches!(&*decoded, b"." | b"..")
}

/// Normalize a captured value into one percent-encoded path segment.
///
/// The value is decoded first so an already-encoded capture is not encoded
/// twice; everything outside the unreserved set is then encoded, `/` included.
fn encode_segment(value: &str) -> String {
    urlencoding::encode_binary(&urlencoding::decode_binary(value.as_bytes())).into_owned()
}

/// Build the outbound URI for a request bound to `upstream`.
///
/// Placeholders are filled in one pass over the target, each value encoded
/// as a single path segment. A placeholder with no captured value stays in
/// the target (and ends up percent-encoded). Unless the upstream has a fixed
/// path, the request suffix is appended to the target path. Runs of `/` are
/// collapsed. The target query string and the request query string are both
/// kept.
pub fn build_upstream_uri(
    upstream: &Upstream,
    vars: &HashMap<String, String>,
    suffix: &str,
    request_query: Option<&str>,
) -> Result<Uri, RewriteError> {
    let mut dot_segment = None;
    let target = substitute_placeholders(&upstream.target, |name| {
        let value = vars.get(name)?;
        if is_dot_segment(value) {
            if dot_segment.is_none() {
                dot_segment = Some(name.to_string());
            }
            return None;
        }
        Some(encode_segment(value))
    });
    if let Some(name) = dot_segment {
        return Err(RewriteError::DotSegment { name });
    }

    let url = Url::parse(&target).map_err(|e| RewriteError::InvalidTarget {
        target: target.clone(),
        message: e.to_string(),
    })?;
    let host = url
        .host_str()
        .filter(|_| matches!(url.scheme(), "http" | "https"))
        .ok_or_else(|| RewriteError::InvalidTarget {
            target: target.clone(),
            message: "expected an http(s) URL with a host".to_string(),
        })?;

    let mut path = url.path().to_string();
    if !upstream.fixed_path {
        path.push_str(suffix);
    }
    let path = collapse_slashes(&path);

    let query = [url.query(), request_query]
        .into_iter()
        .flatten()
        .filter(|q| !q.is_empty())
        .collect::<Vec<_>>()
        .join("&");

    let mut uri = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        uri.push_str(&format!(":{port}"));
    }
    uri.push_str(&path);
    if !query.is_empty() {
        uri.push('?');
        uri.push_str(&query);
    }

    Uri::try_from(uri.as_str()).map_err(|e| RewriteError::InvalidUri {
        uri: uri.clone(),
        message: e.to_string(),
    })
}

/// Replace every run of consecutive `/` with a single one.
pub fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut previous_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !previous_slash {
                out.push(c);
            }
            previous_slash = true;
        } else {
            out.push(c);
            previous_slash = false;
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitutes_path_variables() {
        let upstream = Upstream::new(
            "http://localhost:9002/apis/v1/users/{userId}/tasks/{taskId}",
            true,
        );
        let uri = build_upstream_uri(
            &upstream,
            &vars(&[("userId", "42"), ("taskId", "7")]),
            "",
            None,
        )
        .unwrap();
        assert_eq!(uri.path(), "/apis/v1/users/42/tasks/7");
        assert_eq!(uri.host(), Some("localhost"));
        assert_eq!(uri.port_u16(), Some(9002));
        assert_eq!(uri.scheme_str(), Some("http"));
    }

    #[test]
    fn test_appends_suffix_without_double_slash() {
        for target in ["http://localhost:9001/v2", "http://localhost:9001/v2/"] {
            let upstream = Upstream::new(target, false);
            let uri =
                build_upstream_uri(&upstream, &vars(&[("id", "42")]), "/extra", None).unwrap();
            assert_eq!(uri.path(), "/v2/extra", "target {target}");
        }
    }

    #[test]
    fn test_fixed_path_ignores_suffix() {
        let upstream = Upstream::new("http://localhost:9001/v2", true);
        let uri = build_upstream_uri(&upstream, &HashMap::new(), "/extra", None).unwrap();
        assert_eq!(uri.path(), "/v2");
    }

    #[test]
    fn test_duplicate_placeholders_filled_in_order() {
        let upstream = Upstream::new("http://svc/{id}/mirror/{id}", true);
        let uri = build_upstream_uri(&upstream, &vars(&[("id", "5")]), "", None).unwrap();
        assert_eq!(uri.path(), "/5/mirror/5");
    }

    #[test]
    fn test_uncaptured_placeholder_left_in_place() {
        let upstream = Upstream::new("http://svc/users/{userId}", true);
        let uri = build_upstream_uri(&upstream, &vars(&[("id", "5")]), "", None).unwrap();
        assert_eq!(uri.path(), "/users/%7BuserId%7D");
    }

    #[test]
    fn test_queries_are_merged() {
        let upstream = Upstream::new("https://svc.example.com/search?source=gw", true);
        let uri = build_upstream_uri(&upstream, &HashMap::new(), "", Some("q=rust")).unwrap();
        assert_eq!(uri.query(), Some("source=gw&q=rust"));
        assert_eq!(uri.scheme_str(), Some("https"));

        let bare = Upstream::new("http://svc/search", true);
        let uri = build_upstream_uri(&bare, &HashMap::new(), "", Some("q=rust")).unwrap();
        assert_eq!(uri.to_string(), "http://svc/search?q=rust");
    }

    #[test]
    fn test_malformed_target_is_typed_error() {
        let upstream = Upstream::new("::not-a-url::", true);
        let err = build_upstream_uri(&upstream, &HashMap::new(), "", None).unwrap_err();
        assert!(matches!(err, RewriteError::InvalidTarget { .. }));
    }

    #[test]
    fn test_substituted_values_are_not_rescanned() {
        let upstream = Upstream::new("http://svc/{x}/{y}", true);
        let uri = build_upstream_uri(&upstream, &vars(&[("x", "{y}"), ("y", "z")]), "", None)
            .unwrap();
        assert_eq!(uri.path(), "/%7By%7D/z");
    }

    #[test]
    fn test_values_are_encoded_as_one_segment() {
        let upstream = Upstream::new("http://svc/files/{name}", true);
        let uri = build_upstream_uri(&upstream, &vars(&[("name", "a%2Fb c?")]), "", None)
            .unwrap();
        assert_eq!(uri.path(), "/files/a%2Fb%20c%3F");
        assert_eq!(uri.query(), None);

        let uri = build_upstream_uri(&upstream, &vars(&[("name", "hello%20world")]), "", None)
            .unwrap();
        assert_eq!(uri.path(), "/files/hello%20world");
    }

    #[test]
    fn test_dot_segment_values_cannot_escape_target_path() {
        let upstream = Upstream::new("http://svc/public/{name}", false);
        for value in ["..", ".", "%2e%2E"] {
            let err = build_upstream_uri(&upstream, &vars(&[("name", value)]), "/admin", None)
                .unwrap_err();
            assert_eq!(
                err,
                RewriteError::DotSegment {
                    name: "name".to_string()
                },
                "value {value}"
            );
        }
    }

    #[test]
    fn test_is_dot_segment() {
        assert!(is_dot_segment(".."));
        assert!(is_dot_segment("%2E"));
        assert!(!is_dot_segment("..."));
        assert!(!is_dot_segment("a.b"));
    }

    #[test]
    fn test_collapse_slashes() {
        assert_eq!(collapse_slashes("//a///b/"), "/a/b/");
        assert_eq!(collapse_slashes(""), "/");
    }
}
