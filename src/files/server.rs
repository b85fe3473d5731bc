use super::resolver::{is_within_base, ResolvedFileRequest};
use crate::error::GatewayError;
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use thiserror::Error;
use tracing::{info, warn};

/// Why a resolved file could not be served
#[derive(Debug, Error)]
pub enum FileServeError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("file resolves outside its category: {0}")]
    Denied(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FileServeError> for GatewayError {
    fn from(err: FileServeError) -> Self {
        match err {
            FileServeError::NotFound(path) => GatewayError::FileNotFound(path),
            FileServeError::TooLarge { size, limit } => {
                GatewayError::PayloadTooLarge { size, limit }
            }
            FileServeError::Denied(path) => GatewayError::PathTraversal(path),
            FileServeError::Io(e) => GatewayError::Io(e),
        }
    }
}

/// A file ready to be written to the client
#[derive(Debug, Clone)]
pub struct ServedFile {
    pub body: Bytes,
    pub content_type: String,
    pub headers: HeaderMap,
    /// Client already holds this version (`If-None-Match` matched)
    pub not_modified: bool,
}

impl IntoResponse for ServedFile {
    fn into_response(self) -> Response {
        let status = if self.not_modified {
            StatusCode::NOT_MODIFIED
        } else {
            StatusCode::OK
        };
        let body = if self.not_modified {
            Body::empty()
        } else {
            Body::from(self.body)
        };

        let mut response = (status, body).into_response();
        response.headers_mut().extend(self.headers);
        response
    }
}

/// Terminal handler for resolved file requests
#[derive(Debug, Clone, Default)]
pub struct FileServer;

impl FileServer {
    pub fn new() -> Self {
        Self
    }

    /// Read and package a resolved file.
    ///
    /// `client` is only used for the audit log line.
    pub async fn serve(
        &self,
        request: &ResolvedFileRequest,
        request_headers: &HeaderMap,
        client: &str,
    ) -> Result<ServedFile, FileServeError> {
        let result = self.load(request, request_headers).await;

        let category = request.category.name.as_str();
        let path = request.logical_path();
        match &result {
            Ok(file) => info!(
                category,
                path = %path,
                size = file.body.len(),
                client,
                not_modified = file.not_modified,
                "File served"
            ),
            Err(FileServeError::Denied(_)) => warn!(
                target: "security",
                category,
                path = %path,
                client,
                "File resolves outside its category directory"
            ),
            Err(e) => warn!(category, path = %path, client, error = %e, "File not served"),
        }

        result
    }

    async fn load(
        &self,
        request: &ResolvedFileRequest,
        request_headers: &HeaderMap,
    ) -> Result<ServedFile, FileServeError> {
        let logical = request.logical_path();

        let metadata = match tokio::fs::metadata(&request.physical_path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(FileServeError::NotFound(logical)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FileServeError::NotFound(logical))
            }
            Err(e) => return Err(e.into()),
        };

        // Symlinks may point anywhere; check where the file really lives
        let real_path = tokio::fs::canonicalize(&request.physical_path).await?;
        if !is_within_base(&real_path, &request.category.base_dir) {
            return Err(FileServeError::Denied(logical));
        }

        let limit = request.category.max_file_size_bytes;
        if metadata.len() > limit {
            return Err(FileServeError::TooLarge {
                size: metadata.len(),
                limit,
            });
        }

        let body = Bytes::from(tokio::fs::read(&real_path).await?);
        let etag = entity_tag(&body);
        let content_type = mime_guess::from_ext(&request.extension)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        let mut headers = HeaderMap::new();
        insert(&mut headers, header::CONTENT_TYPE, &content_type);
        insert(
            &mut headers,
            header::CONTENT_DISPOSITION,
            &content_disposition(&content_type, request.file_name()),
        );
        insert(
            &mut headers,
            header::CACHE_CONTROL,
            &format!("public, max-age={}", request.category.cache_max_age_secs),
        );
        insert(&mut headers, header::ETAG, &etag);
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );

        let not_modified = if_none_match(request_headers, &etag);
        if !not_modified {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        }

        Ok(ServedFile {
            body,
            content_type,
            headers,
            not_modified,
        })
    }
}

fn insert(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "Dropping header with invalid value"),
    }
}

/// Strong validator: base64 SHA-256 of the contents, quoted
pub fn entity_tag(contents: &[u8]) -> String {
    format!("\"{}\"", STANDARD.encode(Sha256::digest(contents)))
}

fn if_none_match(request_headers: &HeaderMap, etag: &str) -> bool {
    request_headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|tag| tag.trim().trim_start_matches("W/"))
        .any(|tag| tag == "*" || tag == etag)
}

/// PDFs and raster images open in the browser; everything else downloads
fn is_previewable(content_type: &str) -> bool {
    content_type == "application/pdf"
        || (content_type.starts_with("image/") && content_type != "image/svg+xml")
}

fn content_disposition(content_type: &str, file_name: &str) -> String {
    let disposition = if is_previewable(content_type) {
        "inline"
    } else {
        "attachment"
    };

    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!(
        "{}; filename=\"{}\"; filename*=UTF-8''{}",
        disposition,
        fallback,
        urlencoding::encode(file_name)
    )
}
