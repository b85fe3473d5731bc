//! Paths that skip screening and rate limiting.
//!
//! The list is security-relevant configuration: anything on it reaches the
//! application with no threat score and no quota.

use tracing::debug;

/// `true` when `prefix` covers `path` on a segment boundary.
///
/// A prefix ending in `/` matches anything below it; otherwise the path
/// must equal the prefix or continue with `/`. `/health` covers
/// `/health/live` but not `/healthz`.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    if prefix.ends_with('/') {
        return path.starts_with(prefix);
    }

    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Ordered list of bypass prefixes
#[derive(Debug, Clone, Default)]
pub struct BypassList {
    prefixes: Vec<String>,
}

impl BypassList {
    pub fn new(prefixes: &[String]) -> Self {
        Self {
            prefixes: prefixes
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Matching prefix, if any
    pub fn matching(&self, path: &str) -> Option<&str> {
        let matched = self
            .prefixes
            .iter()
            .find(|prefix| path_has_prefix(path, prefix))
            .map(String::as_str);

        if let Some(prefix) = matched {
            debug!(path, prefix, "Path on bypass list");
        }
        matched
    }

    pub fn is_bypassed(&self, path: &str) -> bool {
        self.matching(path).is_some()
    }
}
