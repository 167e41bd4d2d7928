//! Rasterisation: turn a [`SourceDocument`] into a lazy stream of page images.
//!
//! Raster images decode to exactly one page. PDFs are rendered by pdfium on a
//! `spawn_blocking` thread (pdfium is not async-safe) that feeds a bounded
//! channel of capacity 1, so each page is rendered only when the consumer is
//! ready for it and a dropped consumer stops rendering early.
//!
//! A PDF that cannot be opened fails the whole file with
//! [`ExtractionError::Decode`]; a page that fails to render yields a
//! [`ExtractionError::Render`] item and the next page is still attempted. If
//! the render task dies mid-document, every page it never delivered still
//! comes out as a [`ExtractionError::Render`] item.

use crate::error::ExtractionError;
use crate::pipeline::input::{MediaKind, SourceDocument, PDF_MAGIC};
use futures::stream::{self, Stream, StreamExt};
use image::{DynamicImage, ImageFormat};
use pdfium_render::prelude::*;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// PDF user-space units per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// One rendered page of a document.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 1-indexed page number within its source document.
    pub page_num: usize,
    pub image: DynamicImage,
}

/// Pages of one document, in natural order. Finite and not restartable.
pub type PageStream = Pin<Box<dyn Stream<Item = Result<PageImage, ExtractionError>> + Send>>;

/// Rendering settings for PDF pages.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub dpi: u32,
    /// Cap on the longest rendered edge, regardless of DPI.
    pub max_rendered_pixels: u32,
    pub password: Option<String>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            dpi: 200,
            max_rendered_pixels: 3000,
            password: None,
        }
    }
}

/// Rasterise a document into a stream of page images.
pub async fn rasterize(
    doc: SourceDocument,
    options: &RenderOptions,
) -> Result<PageStream, ExtractionError> {
    match doc.kind {
        MediaKind::Image(format) => {
            let image = decode_image(&doc.bytes, format)?;
            debug!(
                "Decoded {} → {}x{} px",
                doc.filename,
                image.width(),
                image.height()
            );
            let page = PageImage { page_num: 1, image };
            Ok(Box::pin(stream::iter(vec![Ok(page)])))
        }
        MediaKind::Pdf => rasterize_pdf(doc, options).await,
    }
}

/// Decode raster bytes, insisting on the declared format.
pub fn decode_image(bytes: &[u8], format: ImageFormat) -> Result<DynamicImage, ExtractionError> {
    image::load_from_memory_with_format(bytes, format).map_err(|e| ExtractionError::Decode {
        detail: format!("not a valid {format:?} image: {e}"),
    })
}

async fn rasterize_pdf(
    doc: SourceDocument,
    options: &RenderOptions,
) -> Result<PageStream, ExtractionError> {
    if !doc.bytes.starts_with(PDF_MAGIC) {
        return Err(ExtractionError::Decode {
            detail: format!(
                "not a valid PDF, first bytes: {:?}",
                &doc.bytes[..doc.bytes.len().min(4)]
            ),
        });
    }

    let (page_tx, page_rx) = mpsc::channel(1);
    let (opened_tx, opened_rx) = oneshot::channel();
    let options = options.clone();

    let task = tokio::task::spawn_blocking(move || {
        render_pdf_blocking(&doc, &options, opened_tx, page_tx)
    });

    match opened_rx.await {
        Ok(Ok(total_pages)) => {
            info!("PDF loaded: {} pages", total_pages);
            Ok(expect_pages(
                Box::pin(ReceiverStream::new(page_rx)),
                total_pages,
                task,
            ))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ExtractionError::Decode {
            detail: "render task ended before the document was opened".into(),
        }),
    }
}

struct PageCount {
    inner: PageStream,
    yielded: usize,
    total: usize,
    task: Option<JoinHandle<()>>,
    reason: String,
}

/// Guarantee `total_pages` items: when `inner` ends early, emit one
/// [`ExtractionError::Render`] per page that never arrived, naming why the
/// render task stopped.
fn expect_pages(inner: PageStream, total_pages: usize, task: JoinHandle<()>) -> PageStream {
    let state = PageCount {
        inner,
        yielded: 0,
        total: total_pages,
        task: Some(task),
        reason: String::new(),
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        if let Some(item) = st.inner.next().await {
            st.yielded += 1;
            return Some((item, st));
        }
        if st.yielded >= st.total {
            return None;
        }
        if let Some(task) = st.task.take() {
            st.reason = task_end_reason(task.await);
            warn!(
                "Render task stopped after {}/{} pages: {}",
                st.yielded, st.total, st.reason
            );
        }
        st.yielded += 1;
        let missing = ExtractionError::Render {
            page: st.yielded,
            detail: format!("page never rendered ({})", st.reason),
        };
        Some((Err(missing), st))
    }))
}

fn task_end_reason(joined: Result<(), tokio::task::JoinError>) -> String {
    match joined {
        Ok(()) => "render task stopped early".to_string(),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            format!("render task panicked: {msg}")
        }
        Err(e) => format!("render task failed: {e}"),
    }
}

/// Blocking side of PDF rendering.
///
/// Reports the open result (page count or decode error) through `opened`,
/// then sends one item per page until done or until the receiver is dropped.
fn render_pdf_blocking(
    doc: &SourceDocument,
    options: &RenderOptions,
    opened: oneshot::Sender<Result<usize, ExtractionError>>,
    pages_tx: mpsc::Sender<Result<PageImage, ExtractionError>>,
) {
    let pdfium = match bind_pdfium() {
        Ok(p) => p,
        Err(detail) => {
            let _ = opened.send(Err(ExtractionError::Decode { detail }));
            return;
        }
    };

    let document = match pdfium.load_pdf_from_byte_slice(&doc.bytes, options.password.as_deref())
    {
        Ok(d) => d,
        Err(e) => {
            let err_str = format!("{:?}", e);
            let detail = if err_str.contains("Password") || err_str.contains("password") {
                if options.password.is_some() {
                    "wrong PDF password".to_string()
                } else {
                    "PDF is encrypted and requires a password".to_string()
                }
            } else {
                format!("corrupt PDF: {err_str}")
            };
            let _ = opened.send(Err(ExtractionError::Decode { detail }));
            return;
        }
    };

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    if opened.send(Ok(total_pages)).is_err() {
        return;
    }

    let render_config = render_config(options);

    for idx in 0..total_pages {
        let item = render_page(&pages, idx, &render_config).map(|image| {
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );
            PageImage {
                page_num: idx + 1,
                image,
            }
        });

        if let Err(ref e) = item {
            warn!("{}: {}", doc.filename, e);
        }

        if pages_tx.blocking_send(item).is_err() {
            debug!("Page consumer dropped; stopping render of {}", doc.filename);
            return;
        }
    }
}

fn render_page(
    pages: &PdfPages,
    idx: usize,
    config: &PdfRenderConfig,
) -> Result<DynamicImage, ExtractionError> {
    let page = pages
        .get(idx as u16)
        .map_err(|e| ExtractionError::Render {
            page: idx + 1,
            detail: format!("{:?}", e),
        })?;

    let bitmap = page
        .render_with_config(config)
        .map_err(|e| ExtractionError::Render {
            page: idx + 1,
            detail: format!("{:?}", e),
        })?;

    Ok(bitmap.as_image())
}

/// Scale from 72 pt user space to the target DPI, capped on both edges.
fn render_config(options: &RenderOptions) -> PdfRenderConfig {
    let cap = options.max_rendered_pixels as i32;
    PdfRenderConfig::new()
        .scale_page_by_factor(scale_factor(options.dpi))
        .set_maximum_width(cap)
        .set_maximum_height(cap)
}

fn scale_factor(dpi: u32) -> f32 {
    dpi as f32 / POINTS_PER_INCH
}

/// Bind to a pdfium library.
///
/// Lookup order: `PDFIUM_LIB_PATH`, the working directory, the system
/// library search path.
fn bind_pdfium() -> Result<Pdfium, String> {
    if let Ok(path) = std::env::var("PDFIUM_LIB_PATH") {
        if !path.is_empty() {
            return Pdfium::bind_to_library(&path)
                .map(Pdfium::new)
                .map_err(|e| format!("failed to bind pdfium from '{path}': {e}"));
        }
    }

    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map(Pdfium::new)
        .map_err(|e| {
            format!("pdfium library not found ({e}); set PDFIUM_LIB_PATH to libpdfium")
        })
}
