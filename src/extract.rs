//! Batch extraction entry points.
//!
//! Files are processed strictly one after another, and every page of a file
//! is done before the next file is opened. Nothing here runs concurrently:
//! each page is one blocking round trip through the model chain, and the
//! optional pause between files keeps remote rate limits happy.
//!
//! ```text
//! input ──▶ rasterize ──▶ encode ──▶ model chain ──▶ normalize ──▶ flatten ──▶ table
//! ```
//!
//! Failures stay local. A file that cannot be read or decoded, a page that
//! does not render, a page no model could answer, or a reply that does not
//! parse becomes a [`Diagnostic`] and the batch moves on. Only a missing
//! credential (checked before anything is touched) and a run that produced
//! zero rows are fatal.

use crate::config::{Credential, ExtractionConfig};
use crate::error::{ExtractionError, ReceiptError};
use crate::output::{Diagnostic, ExtractionOutput, ExtractionRecord, ExtractionStats, OutputRow};
use crate::pipeline::encode;
use crate::pipeline::flatten::{flatten_result, FlattenOptions};
use crate::pipeline::input::{self, SourceDocument};
use crate::pipeline::llm::{build_chain, ModelChain};
use crate::pipeline::normalize::parse_record;
use crate::pipeline::render::{self, PageImage, PageStream, RenderOptions};
use crate::progress::{batch_fraction, ProgressCallback};
use futures::StreamExt;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything a run needs, resolved once and threaded through every stage.
///
/// Built only when a credential is present, so holding one proves the run
/// may start.
pub struct ExtractionContext {
    chain: ModelChain,
    prompt: String,
    flatten: FlattenOptions,
    render: RenderOptions,
    max_edge: u32,
    progress: Option<ProgressCallback>,
}

impl ExtractionContext {
    /// Validate the credential and build the model chain.
    pub fn new(
        config: &ExtractionConfig,
        credential: Option<&Credential>,
    ) -> Result<Self, ReceiptError> {
        let credential = match credential {
            Some(c) if !c.is_blank() => c,
            _ => {
                return Err(ReceiptError::MissingCredential {
                    hint: credential_hint(&config.provider_name),
                })
            }
        };

        let chain = build_chain(config, credential)?;
        info!("Model chain: {}", chain.names().join(" → "));

        Ok(Self {
            chain,
            prompt: config.prompt(),
            flatten: config.flatten_options(),
            render: config.render_options(),
            max_edge: config.max_rendered_pixels,
            progress: config.progress_callback.clone(),
        })
    }

    pub fn chain(&self) -> &ModelChain {
        &self.chain
    }

    fn report(&self, diagnostic: &Diagnostic) {
        warn!("{}", diagnostic);
        if let Some(ref cb) = self.progress {
            cb.on_diagnostic(diagnostic);
        }
    }
}

pub(crate) fn credential_hint(provider: &str) -> String {
    let var = match provider.to_ascii_lowercase().as_str() {
        "gemini" | "google" => "GEMINI_API_KEY",
        "openai" => "OPENAI_API_KEY",
        "anthropic" => "ANTHROPIC_API_KEY",
        "mistral" => "MISTRAL_API_KEY",
        "xai" => "XAI_API_KEY",
        "openrouter" => "OPENROUTER_API_KEY",
        _ => return format!("Supply an API key for provider '{provider}' before starting a run."),
    };
    format!("Supply an API key for provider '{provider}', e.g. via {var}.")
}

/// What one file contributed.
#[derive(Debug, Default)]
pub struct FileOutcome {
    pub rows: Vec<OutputRow>,
    pub diagnostics: Vec<Diagnostic>,
    pub pages: usize,
    pub failed_pages: usize,
    pub model_attempts: usize,
}

impl FileOutcome {
    fn failed(diagnostic: Diagnostic) -> Self {
        Self {
            diagnostics: vec![diagnostic],
            ..Default::default()
        }
    }
}

enum Source {
    Location(String),
    Document(SourceDocument),
}

impl Source {
    fn filename(&self) -> String {
        match self {
            Source::Location(s) => input::display_name(s),
            Source::Document(d) => d.filename.clone(),
        }
    }
}

// ── Public entry points ──────────────────────────────────────────────────

/// Extract expense rows from local paths or URLs.
///
/// # Errors
/// - [`ReceiptError::MissingCredential`] when `credential` is absent or blank;
///   no input is read in that case.
/// - [`ReceiptError::NoInputs`] for an empty batch.
/// - [`ReceiptError::NothingExtracted`] when no file yielded a single row.
///
/// Per-file and per-page failures are returned in
/// [`ExtractionOutput::diagnostics`].
pub async fn extract<S: AsRef<str>>(
    inputs: &[S],
    config: &ExtractionConfig,
    credential: Option<&Credential>,
) -> Result<ExtractionOutput, ReceiptError> {
    let ctx = ExtractionContext::new(config, credential)?;
    let sources = inputs
        .iter()
        .map(|s| Source::Location(s.as_ref().to_string()))
        .collect();
    run_batch(&ctx, sources, config).await
}

/// Extract expense rows from documents already held in memory.
pub async fn extract_documents(
    documents: Vec<SourceDocument>,
    config: &ExtractionConfig,
    credential: Option<&Credential>,
) -> Result<ExtractionOutput, ReceiptError> {
    let ctx = ExtractionContext::new(config, credential)?;
    let sources = documents.into_iter().map(Source::Document).collect();
    run_batch(&ctx, sources, config).await
}

/// Extract and write the spreadsheet to `output_path`.
///
/// Nothing is written when the run fails.
pub async fn extract_to_file<S: AsRef<str>>(
    inputs: &[S],
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
    credential: Option<&Credential>,
) -> Result<ExtractionOutput, ReceiptError> {
    let output = extract(inputs, config, credential).await?;
    output
        .table
        .to_xlsx(&config.column_set())?
        .write_to(output_path)?;
    Ok(output)
}

/// Synchronous wrapper around [`extract`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync<S: AsRef<str>>(
    inputs: &[S],
    config: &ExtractionConfig,
    credential: Option<&Credential>,
) -> Result<ExtractionOutput, ReceiptError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ReceiptError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(inputs, config, credential))
}

// ── Batch loop ───────────────────────────────────────────────────────────

async fn run_batch(
    ctx: &ExtractionContext,
    sources: Vec<Source>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ReceiptError> {
    if sources.is_empty() {
        return Err(ReceiptError::NoInputs);
    }

    let start = Instant::now();
    let total = sources.len();
    info!("Extracting from {} file(s)", total);
    if let Some(ref cb) = ctx.progress {
        cb.on_batch_start(total);
    }

    let mut output = ExtractionOutput {
        table: Default::default(),
        diagnostics: Vec::new(),
        stats: ExtractionStats {
            total_files: total,
            ..Default::default()
        },
    };

    for (index, source) in sources.into_iter().enumerate() {
        if index > 0 && !config.inter_file_delay.is_zero() {
            debug!("Pausing {:?} before next file", config.inter_file_delay);
            tokio::time::sleep(config.inter_file_delay).await;
        }

        let filename = source.filename();
        info!("[{}/{}] {}", index + 1, total, filename);
        if let Some(ref cb) = ctx.progress {
            cb.on_file_start(index, total, &filename);
        }

        let outcome = match source {
            Source::Location(location) => {
                match input::resolve_input(&location, config.download_timeout_secs).await {
                    Ok(doc) => process_document(ctx, doc).await,
                    Err(e) => {
                        let diagnostic = Diagnostic::file(&filename, e);
                        ctx.report(&diagnostic);
                        FileOutcome::failed(diagnostic)
                    }
                }
            }
            Source::Document(doc) => process_document(ctx, doc).await,
        };

        let rows = outcome.rows.len();
        if rows == 0 && !outcome.diagnostics.is_empty() {
            output.stats.failed_files += 1;
        }
        output.stats.processed_pages += outcome.pages;
        output.stats.failed_pages += outcome.failed_pages;
        output.stats.model_attempts += outcome.model_attempts;
        output.table.extend(outcome.rows);
        output.diagnostics.extend(outcome.diagnostics);

        info!("{}: {} row(s) from {} page(s)", filename, rows, outcome.pages);
        if let Some(ref cb) = ctx.progress {
            cb.on_file_complete(index, total, &filename, rows, batch_fraction(index, total));
        }
    }

    output.stats.total_rows = output.table.len();
    output.stats.total_duration_ms = start.elapsed().as_millis() as u64;

    if let Some(ref cb) = ctx.progress {
        cb.on_batch_complete(total, output.stats.total_rows);
    }

    if output.table.is_empty() {
        return Err(ReceiptError::NothingExtracted {
            files: total,
            diagnostics: output.diagnostics,
        });
    }

    info!(
        "Extraction complete: {} row(s) from {} file(s), {} diagnostic(s), {}ms",
        output.stats.total_rows,
        total,
        output.diagnostics.len(),
        output.stats.total_duration_ms
    );
    Ok(output)
}

/// Rasterise one document and run all of its pages.
pub async fn process_document(ctx: &ExtractionContext, doc: SourceDocument) -> FileOutcome {
    let filename = doc.filename.clone();
    debug!("{}: {} bytes, {}", filename, doc.bytes.len(), doc.kind.label());

    match render::rasterize(doc, &ctx.render).await {
        Ok(pages) => process_pages(ctx, &filename, pages).await,
        Err(e) => {
            let diagnostic = Diagnostic::file(&filename, e);
            ctx.report(&diagnostic);
            FileOutcome::failed(diagnostic)
        }
    }
}

/// Run every page of `pages` through encode → model chain → normalize →
/// flatten, in page order.
pub async fn process_pages(
    ctx: &ExtractionContext,
    filename: &str,
    mut pages: PageStream,
) -> FileOutcome {
    let mut outcome = FileOutcome::default();

    while let Some(item) = pages.next().await {
        outcome.pages += 1;

        let (page_num, result) = match item {
            Ok(page) => {
                let page_num = page.page_num;
                let (result, attempts) = extract_page(ctx, &page).await;
                outcome.model_attempts += attempts;
                (page_num, result)
            }
            Err(e) => {
                let page_num = match e {
                    ExtractionError::Render { page, .. } => page,
                    _ => outcome.pages,
                };
                (page_num, Err(e))
            }
        };

        let before = outcome.diagnostics.len();
        let rows = flatten_result(
            result,
            filename,
            page_num,
            &ctx.flatten,
            &mut outcome.diagnostics,
        );

        if outcome.diagnostics.len() > before {
            outcome.failed_pages += 1;
            for diagnostic in &outcome.diagnostics[before..] {
                ctx.report(diagnostic);
            }
        } else {
            debug!("{} page {}: {} row(s)", filename, page_num, rows.len());
        }
        outcome.rows.extend(rows);
    }

    outcome
}

/// Encode, invoke and parse one page. Returns the result and the number of
/// model calls made.
async fn extract_page(
    ctx: &ExtractionContext,
    page: &PageImage,
) -> (Result<ExtractionRecord, ExtractionError>, usize) {
    let image = match encode::encode_page(page, ctx.max_edge) {
        Ok(image) => image,
        Err(e) => return (Err(e), 0),
    };

    match ctx.chain.invoke(&ctx.prompt, &image).await {
        Ok(reply) => {
            debug!(
                "Page {} answered by {} in {}ms",
                page.page_num, reply.model, reply.duration_ms
            );
            (parse_record(&reply.text), reply.attempts)
        }
        Err(e) => {
            let attempts = match e {
                ExtractionError::Invocation { attempts, .. } => attempts,
                _ => ctx.chain.len(),
            };
            (Err(e), attempts)
        }
    }
}
