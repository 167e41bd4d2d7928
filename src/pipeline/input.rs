//! Input resolution: turn a user-supplied path or URL into a [`SourceDocument`].
//!
//! Documents are read fully into memory. Receipts are small, and pdfium can
//! open a PDF straight from a byte slice, so no temp file is needed even for
//! downloaded inputs. Failures here are per-file: the caller records them as
//! diagnostics and moves on to the next input.

use crate::error::ExtractionError;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Leading bytes of every PDF file.
pub const PDF_MAGIC: &[u8] = b"%PDF";

/// What a document's bytes are declared to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// A single raster image (PNG, JPEG or WEBP).
    Image(ImageFormat),
    /// A PDF, rasterised page by page.
    Pdf,
}

impl MediaKind {
    /// Infer the kind from a filename extension (case-insensitive).
    pub fn from_filename(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(MediaKind::Pdf),
            "png" => Some(MediaKind::Image(ImageFormat::Png)),
            "jpg" | "jpeg" => Some(MediaKind::Image(ImageFormat::Jpeg)),
            "webp" => Some(MediaKind::Image(ImageFormat::WebP)),
            _ => None,
        }
    }

    /// Infer the kind from the leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(PDF_MAGIC) {
            return Some(MediaKind::Pdf);
        }
        match image::guess_format(bytes).ok()? {
            f @ (ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP) => {
                Some(MediaKind::Image(f))
            }
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MediaKind::Pdf => "pdf",
            MediaKind::Image(ImageFormat::Png) => "png",
            MediaKind::Image(ImageFormat::Jpeg) => "jpeg",
            MediaKind::Image(ImageFormat::WebP) => "webp",
            MediaKind::Image(_) => "image",
        }
    }
}

/// A document to process: its name, declared kind and raw bytes.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub filename: String,
    pub kind: MediaKind,
    pub bytes: Vec<u8>,
}

impl SourceDocument {
    /// A document with an explicitly declared kind.
    pub fn new(filename: impl Into<String>, kind: MediaKind, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            kind,
            bytes,
        }
    }

    /// Declare the kind from the filename extension, falling back to the
    /// leading bytes when the extension is missing or unknown.
    pub fn from_bytes(
        filename: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<Self, ExtractionError> {
        let filename = filename.into();
        let kind = MediaKind::from_filename(&filename)
            .or_else(|| MediaKind::sniff(&bytes))
            .ok_or_else(|| ExtractionError::Decode {
                detail: format!(
                    "unsupported document type (expected PDF, PNG, JPEG or WEBP), first bytes: {:?}",
                    &bytes[..bytes.len().min(4)]
                ),
            })?;
        Ok(Self::new(filename, kind, bytes))
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a path or URL into a [`SourceDocument`].
pub async fn resolve_input(
    input: &str,
    timeout_secs: u64,
) -> Result<SourceDocument, ExtractionError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(input).await
    }
}

/// Display name used in diagnostics and the Source column: the file name
/// without its directory, or the last URL segment.
pub fn display_name(input: &str) -> String {
    if is_url(input) {
        return url_filename(input).unwrap_or_else(|| input.to_string());
    }
    Path::new(input)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| input.to_string())
}

async fn read_local(path_str: &str) -> Result<SourceDocument, ExtractionError> {
    let path = PathBuf::from(path_str);

    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        let detail = match e.kind() {
            std::io::ErrorKind::NotFound => format!("file not found: '{}'", path.display()),
            std::io::ErrorKind::PermissionDenied => {
                format!("permission denied reading '{}'", path.display())
            }
            _ => format!("'{}': {}", path.display(), e),
        };
        ExtractionError::Input { detail }
    })?;

    debug!("Read {} bytes from {}", bytes.len(), path.display());
    SourceDocument::from_bytes(display_name(path_str), bytes)
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<SourceDocument, ExtractionError> {
    info!("Downloading document from: {}", url);

    let failed = |reason: String| ExtractionError::Input {
        detail: format!("download of '{url}' failed: {reason}"),
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {timeout_secs}s"))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| failed(e.to_string()))?;

    info!("Downloaded {} bytes", bytes.len());
    SourceDocument::from_bytes(display_name(url), bytes.to_vec())
}

/// Last non-empty path segment of a URL, if it looks like a filename.
fn url_filename(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.rev().find(|s| !s.is_empty())?;
    last.contains('.').then(|| last.to_string())
}
