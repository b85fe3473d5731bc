use super::{CategoryRegistry, FileCategory};
use crate::error::GatewayError;
use crate::threat::patterns::{decode_once, has_traversal_token};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Characters that may not appear in a decoded file name segment
const ILLEGAL_CHARS: &[char] = &['/', '\\', '\0', ':', '*', '?', '"', '<', '>', '|'];

/// Why a requested file path was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    EmptyPath,
    UnknownCategory(String),
    Traversal(String),
    IllegalCharacter(String),
    HiddenSegment(String),
    OutsideBase,
    MissingExtension,
    ExtensionNotAllowed(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::EmptyPath => write!(f, "empty file path"),
            RejectReason::UnknownCategory(name) => write!(f, "unknown category '{}'", name),
            RejectReason::Traversal(segment) => write!(f, "traversal token in '{}'", segment),
            RejectReason::IllegalCharacter(segment) => {
                write!(f, "illegal character in '{}'", segment)
            }
            RejectReason::HiddenSegment(segment) => write!(f, "hidden segment '{}'", segment),
            RejectReason::OutsideBase => write!(f, "path leaves the category directory"),
            RejectReason::MissingExtension => write!(f, "file has no extension"),
            RejectReason::ExtensionNotAllowed(ext) => write!(f, "extension '{}' not allowed", ext),
        }
    }
}

impl From<RejectReason> for GatewayError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::UnknownCategory(name) => GatewayError::UnknownCategory(name),
            RejectReason::Traversal(_) | RejectReason::OutsideBase => {
                GatewayError::PathTraversal(reason.to_string())
            }
            RejectReason::MissingExtension => {
                GatewayError::ExtensionNotAllowed("(none)".to_string())
            }
            RejectReason::ExtensionNotAllowed(ext) => GatewayError::ExtensionNotAllowed(ext),
            RejectReason::EmptyPath
            | RejectReason::IllegalCharacter(_)
            | RejectReason::HiddenSegment(_) => GatewayError::Validation(reason.to_string()),
        }
    }
}

/// A file request that passed every static check
#[derive(Debug, Clone)]
pub struct ResolvedFileRequest {
    pub category: Arc<FileCategory>,
    /// Percent-decoded segments below the category
    pub requested_segments: Vec<String>,
    pub physical_path: PathBuf,
    /// Lowercase extension without the dot
    pub extension: String,
}

impl ResolvedFileRequest {
    /// `Category/File/a/b.pdf`, used in logs and cache keys
    pub fn logical_path(&self) -> String {
        format!(
            "{}/File/{}",
            self.category.name,
            self.requested_segments.join("/")
        )
    }

    /// Last segment, the name offered to the client
    pub fn file_name(&self) -> &str {
        self.requested_segments
            .last()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Maps `(category, segments)` to a physical path.
///
/// Resolution never touches the filesystem; existence and size are checked
/// by the file server afterwards.
#[derive(Debug, Clone)]
pub struct PathResolver {
    registry: Arc<CategoryRegistry>,
}

impl PathResolver {
    pub fn new(registry: Arc<CategoryRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CategoryRegistry {
        &self.registry
    }

    pub fn resolve(
        &self,
        category: &str,
        segments: &[String],
    ) -> Result<ResolvedFileRequest, RejectReason> {
        let category = self
            .registry
            .get(category)
            .ok_or_else(|| RejectReason::UnknownCategory(category.to_string()))?;

        resolve_in(category, segments)
    }
}

/// Resolve raw (still percent-encoded) segments under one category
pub fn resolve_in(
    category: &Arc<FileCategory>,
    segments: &[String],
) -> Result<ResolvedFileRequest, RejectReason> {
    if segments.is_empty() || segments.iter().all(|s| s.is_empty()) {
        return Err(RejectReason::EmptyPath);
    }

    let mut decoded = Vec::with_capacity(segments.len());
    for raw in segments {
        decoded.push(check_segment(raw)?);
    }

    let mut physical_path = category.base_dir.clone();
    for segment in &decoded {
        physical_path.push(segment);
    }
    let physical_path = normalize(&physical_path);

    if !is_within_base(&physical_path, &category.base_dir) || physical_path == category.base_dir {
        return Err(RejectReason::OutsideBase);
    }

    let extension = physical_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .ok_or(RejectReason::MissingExtension)?;

    if !category.allows_extension(&extension) {
        return Err(RejectReason::ExtensionNotAllowed(extension));
    }

    Ok(ResolvedFileRequest {
        category: Arc::clone(category),
        requested_segments: decoded,
        physical_path,
        extension,
    })
}

fn check_segment(raw: &str) -> Result<String, RejectReason> {
    if raw.is_empty() || raw == "." {
        return Err(RejectReason::IllegalCharacter(raw.to_string()));
    }
    if raw == ".." || has_traversal_token(raw) {
        return Err(RejectReason::Traversal(raw.to_string()));
    }

    let decoded = decode_once(raw)
        .ok_or_else(|| RejectReason::IllegalCharacter(raw.to_string()))?
        .into_owned();

    if decoded.chars().any(|c| ILLEGAL_CHARS.contains(&c) || c.is_control()) {
        return Err(RejectReason::IllegalCharacter(raw.to_string()));
    }
    if decoded.starts_with('.') {
        return Err(RejectReason::HiddenSegment(raw.to_string()));
    }
    if decoded.trim().is_empty() || decoded.ends_with(' ') || decoded.ends_with('.') {
        return Err(RejectReason::IllegalCharacter(raw.to_string()));
    }

    Ok(decoded)
}

/// Lexically resolve `.` and `..` components
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `true` when `path` equals `base` or lies below it.
///
/// Compares whole components, so `/data/news-evil` is not inside `/data/news`.
pub fn is_within_base(path: &Path, base: &Path) -> bool {
    path.starts_with(base)
}
