//! # edgequake-receipts
//!
//! Turn photos and PDFs of receipts and invoices into an expense spreadsheet
//! using multimodal LLMs.
//!
//! ## Why this crate?
//!
//! Receipts are printed on thermal paper, photographed at an angle and laid
//! out differently by every shop, so OCR plus hand-written parsing rules do
//! not get far. Instead every page is rasterised and shown to a vision model
//! together with a fixed prompt asking for one JSON record (date, merchant,
//! currency, category, line items). The records are flattened into one row
//! per line item and written to a single `.xlsx` sheet.
//!
//! ## Pipeline Overview
//!
//! ```text
//! receipt.jpg / invoice.pdf
//!  │
//!  ├─ 1. Input      read local file or download from URL
//!  ├─ 2. Render     decode image, or rasterise PDF pages (pdfium, spawn_blocking)
//!  ├─ 3. Encode     PNG → base64 ImageData
//!  ├─ 4. Model      gemini-2.0-flash → gemini-1.5-flash → gemini-1.5-pro
//!  ├─ 5. Normalize  strip ```json fences, parse the record
//!  ├─ 6. Flatten    one row per line item (or one placeholder row)
//!  └─ 7. Export     ExpenseTable → expenses.xlsx
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_receipts::{extract, Credential, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = Credential::from_env("GEMINI_API_KEY");
//!     let config = ExtractionConfig::builder().paid_items_only(true).build()?;
//!
//!     let output = extract(&["lunch.jpg", "hotel.pdf"], &config, key.as_ref()).await?;
//!     for d in &output.diagnostics {
//!         eprintln!("skipped: {d}");
//!     }
//!
//!     let artifact = output.table.to_xlsx(&config.column_set())?;
//!     artifact.write_to("expenses.xlsx")?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `receipts2xlsx` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-receipts = { version = "0.1", default-features = false }
//! ```
//!
//! ## Providers
//!
//! The default provider talks to the Gemini REST API directly with the key
//! you pass in. Any other provider name (`openai`, `anthropic`, `mistral`, …)
//! goes through edgequake-llm, which reads its key from the usual environment
//! variable. Custom backends implement [`VisionModel`] and are added with
//! [`ExtractionConfigBuilder::candidate`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod export;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{Credential, ExtractionConfig, ExtractionConfigBuilder};
pub use error::{ExportError, ExtractionError, ModelError, ReceiptError};
pub use export::{Column, ColumnSet, ExpenseTable, SpreadsheetArtifact};
pub use extract::{
    extract, extract_documents, extract_sync, extract_to_file, process_pages,
    ExtractionContext, FileOutcome,
};
pub use output::{
    Diagnostic, ExtractionOutput, ExtractionRecord, ExtractionStats, LineItem, OutputRow,
};
pub use pipeline::flatten::FlattenOptions;
pub use pipeline::input::{MediaKind, SourceDocument};
pub use pipeline::llm::{
    GeminiModel, ModelChain, ModelInfo, ModelReply, ProviderModel, VisionModel,
};
pub use pipeline::render::{PageImage, PageStream};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};

pub use edgequake_llm::ImageData;
