//! File categories and secure file delivery
//!
//! A category maps a logical name (`News`, `BusinessReport`, ...) to a base
//! directory, an extension allow-list and a size ceiling. The table is built
//! once at startup and shared read-only by every request.

pub mod resolver;
pub mod server;

pub use self::resolver::{PathResolver, RejectReason, ResolvedFileRequest};
pub use self::server::{FileServeError, FileServer, ServedFile};

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const MB: u64 = 1024 * 1024;

/// One entry of the category table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCategoryConfig {
    /// Category name as it appears in the URL (case-sensitive)
    pub name: String,
    /// Directory relative to `files.base_dir` (or absolute). Defaults to the name.
    #[serde(default)]
    pub directory: Option<String>,
    /// Permitted extensions, without the leading dot
    pub allowed_extensions: Vec<String>,
    /// Largest file that will be served
    pub max_file_size_bytes: u64,
    /// `Cache-Control: max-age` for files of this category
    #[serde(default = "default_cache_max_age")]
    pub cache_max_age_secs: u64,
}

fn default_cache_max_age() -> u64 {
    3600
}

/// Files section of the gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Root directory of uploaded files
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_categories")]
    pub categories: Vec<FileCategoryConfig>,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn category(name: &str, extensions: &[&str], max_mb: u64, max_age: u64) -> FileCategoryConfig {
    FileCategoryConfig {
        name: name.to_string(),
        directory: None,
        allowed_extensions: extensions.iter().map(|e| e.to_string()).collect(),
        max_file_size_bytes: max_mb * MB,
        cache_max_age_secs: max_age,
    }
}

fn default_categories() -> Vec<FileCategoryConfig> {
    vec![
        category("News", &["jpg", "jpeg", "png", "gif", "pdf", "doc", "docx"], 50, 3600),
        category("BusinessReport", &["pdf", "doc", "docx", "xls", "xlsx"], 100, 86_400),
        category("Application", &["apk", "ipa", "exe", "pdf"], 20, 300),
        category("Slide", &["jpg", "jpeg", "png", "webp", "gif"], 10, 604_800),
    ]
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            categories: default_categories(),
        }
    }
}

/// A category ready for use at request time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCategory {
    pub name: String,
    /// Absolute, canonical base directory
    pub base_dir: PathBuf,
    /// Lowercase extensions without the dot
    pub allowed_extensions: BTreeSet<String>,
    pub max_file_size_bytes: u64,
    pub cache_max_age_secs: u64,
}

impl FileCategory {
    pub fn new(
        name: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        allowed_extensions: &[&str],
        max_file_size_bytes: u64,
        cache_max_age_secs: u64,
    ) -> Self {
        Self {
            name: name.into(),
            base_dir: base_dir.into(),
            allowed_extensions: allowed_extensions
                .iter()
                .map(|e| normalize_extension(e))
                .collect(),
            max_file_size_bytes,
            cache_max_age_secs,
        }
    }

    /// Case-insensitive extension check
    pub fn allows_extension(&self, extension: &str) -> bool {
        self.allowed_extensions
            .contains(&normalize_extension(extension))
    }
}

fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Immutable name → category table
#[derive(Debug, Default)]
pub struct CategoryRegistry {
    categories: HashMap<String, Arc<FileCategory>>,
}

impl CategoryRegistry {
    pub fn new(categories: impl IntoIterator<Item = FileCategory>) -> Self {
        Self {
            categories: categories
                .into_iter()
                .map(|c| (c.name.clone(), Arc::new(c)))
                .collect(),
        }
    }

    /// Build the table from configuration, resolving every base directory
    /// to its canonical absolute form
    pub fn from_config(config: &FilesConfig) -> Result<Self> {
        let root = absolute(&config.base_dir)?;
        let mut categories = Vec::with_capacity(config.categories.len());

        for entry in &config.categories {
            let directory = entry.directory.as_deref().unwrap_or(&entry.name);
            let base_dir = canonical_or_absolute(&root.join(directory))?;

            info!(
                category = %entry.name,
                base_dir = %base_dir.display(),
                extensions = ?entry.allowed_extensions,
                max_file_size_bytes = entry.max_file_size_bytes,
                "Registered file category"
            );

            categories.push(FileCategory {
                name: entry.name.clone(),
                base_dir,
                allowed_extensions: entry
                    .allowed_extensions
                    .iter()
                    .map(|e| normalize_extension(e))
                    .collect(),
                max_file_size_bytes: entry.max_file_size_bytes,
                cache_max_age_secs: entry.cache_max_age_secs,
            });
        }

        Ok(Self::new(categories))
    }

    /// Exact-case lookup
    pub fn get(&self, name: &str) -> Option<&Arc<FileCategory>> {
        self.categories.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.categories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn canonical_or_absolute(path: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(canonical) => Ok(canonical),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let normalized = resolver::normalize(path);
            warn!(
                path = %normalized.display(),
                "Category directory does not exist yet, every request will 404"
            );
            Ok(normalized)
        }
        Err(e) => Err(GatewayError::Config(format!(
            "Cannot resolve category directory {}: {}",
            path.display(),
            e
        ))),
    }
}
