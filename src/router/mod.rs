//! URL rewriting and the internal file route
//!
//! Public file URLs (`/News/File/2024/a.pdf`) are rewritten through an
//! ordered regex table onto the internal route
//! `/internal/files/{category}/{marker}/{*path}`, which is then matched with
//! `matchit` to pull out the category and path segments.

use crate::error::{GatewayError, Result};
use matchit::Router as MatchitRouter;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Prefix reserved for rewritten routes. Never reachable from outside.
pub const INTERNAL_PREFIX: &str = "/internal/";

const INTERNAL_FILE_ROUTE: &str = "/internal/files/{category}/{marker}/{*path}";
const FILE_MARKER: &str = "File";

/// One `(pattern, rewrite)` pair from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    /// Regex matched against the request path
    pub pattern: String,
    /// Replacement, with `$1`-style capture references
    pub rewrite: String,
}

/// Rewrite table used when none is configured
pub fn default_rewrites() -> Vec<RewriteRule> {
    vec![RewriteRule {
        pattern: r"^/([A-Za-z][A-Za-z0-9_-]*)/File/(.+)$".to_string(),
        rewrite: "/internal/files/$1/File/$2".to_string(),
    }]
}

/// Ordered, immutable rewrite table. The first matching rule wins.
#[derive(Debug, Clone)]
pub struct RewriteTable {
    rules: Vec<(Regex, String)>,
}

impl RewriteTable {
    pub fn new(rules: &[RewriteRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let regex = Regex::new(&rule.pattern).map_err(|e| {
                    GatewayError::Config(format!(
                        "Invalid rewrite pattern '{}': {}",
                        rule.pattern, e
                    ))
                })?;
                Ok((regex, rule.rewrite.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    /// Rewritten path, or `None` when no rule matches
    pub fn rewrite(&self, path: &str) -> Option<String> {
        self.rules.iter().find_map(|(regex, template)| {
            regex
                .is_match(path)
                .then(|| regex.replace(path, template.as_str()).into_owned())
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Category and raw segments of an internal file route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRoute {
    pub category: String,
    /// Still percent-encoded; empty segments are preserved so that the
    /// resolver can reject them
    pub segments: Vec<String>,
}

/// Matcher for the internal file route
#[derive(Debug, Clone)]
pub struct FileRouter {
    matcher: MatchitRouter<()>,
}

impl FileRouter {
    pub fn new() -> Result<Self> {
        let mut matcher = MatchitRouter::new();
        matcher
            .insert(INTERNAL_FILE_ROUTE, ())
            .map_err(|e| GatewayError::Config(format!("Failed to insert file route: {}", e)))?;
        Ok(Self { matcher })
    }

    /// Match an internal path.
    ///
    /// Returns `Ok(None)` for paths that are not file routes and a
    /// validation error when the `File` marker segment is wrong.
    pub fn match_file(&self, path: &str) -> Result<Option<FileRoute>> {
        let Ok(matched) = self.matcher.at(path) else {
            return Ok(None);
        };

        let param = |name: &str| matched.params.get(name).unwrap_or_default();

        if param("marker") != FILE_MARKER {
            return Err(GatewayError::Validation(format!(
                "Expected '{}' segment in file path",
                FILE_MARKER
            )));
        }

        Ok(Some(FileRoute {
            category: param("category").to_string(),
            segments: param("path").split('/').map(str::to_string).collect(),
        }))
    }
}

/// `true` for paths under the internal prefix
pub fn is_internal(path: &str) -> bool {
    path.starts_with(INTERNAL_PREFIX) || path == INTERNAL_PREFIX.trim_end_matches('/')
}
