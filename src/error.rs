//! Error types for the edgequake-receipts library.
//!
//! Three layers of failure, from widest to narrowest:
//!
//! * [`ReceiptError`] — **Fatal**: the run cannot start or produced nothing
//!   (no credential, invalid configuration, zero rows extracted). Returned as
//!   `Err(ReceiptError)` from the top-level `extract*` functions.
//!
//! * [`ExtractionError`] — **Non-fatal**: one file or one page failed
//!   (undecodable bytes, every model candidate failed, unparseable reply).
//!   Wrapped in a [`crate::output::Diagnostic`] naming the file so the batch
//!   keeps going.
//!
//! * [`ModelError`] — a single model candidate failed. The fallback chain
//!   records it and moves on; only the last one survives, inside
//!   [`ExtractionError::Invocation`].

use crate::output::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-receipts library.
#[derive(Debug, Error)]
pub enum ReceiptError {
    /// No API credential was supplied; nothing was processed.
    #[error("No API credential supplied.\n{hint}")]
    MissingCredential { hint: String },

    /// The batch was empty.
    #[error("No input documents were given")]
    NoInputs,

    /// Every file was attempted but no row came out of any of them.
    #[error(
        "Nothing extracted from {files} file(s) ({} failure(s) reported)",
        .diagnostics.len()
    )]
    NothingExtracted {
        files: usize,
        diagnostics: Vec<Diagnostic>,
    },

    /// The key is accepted but the model listing is empty.
    #[error("The model listing is empty: this API key has access to no model")]
    NoModelsAvailable,

    /// A direct model API call (outside the per-page fallback chain) failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The spreadsheet (or JSON) artifact could not be produced or written.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal failure scoped to one file or one page.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionError {
    /// The input could not be located or read.
    #[error("could not read input: {detail}")]
    Input { detail: String },

    /// The bytes do not match the declared media kind, or are corrupt.
    #[error("could not decode document: {detail}")]
    Decode { detail: String },

    /// A single PDF page could not be rasterised or encoded.
    #[error("page {page}: rasterisation failed: {detail}")]
    Render { page: usize, detail: String },

    /// Every model candidate failed for this page.
    #[error("all {attempts} model candidate(s) failed; last error: {detail}")]
    Invocation { attempts: usize, detail: String },

    /// The model replied, but not with a usable extraction record.
    #[error("model reply is not a valid extraction record: {detail}")]
    Parse { detail: String },
}

/// Failure of one model candidate for one page.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// Transport-level failure (DNS, TLS, connection reset, …).
    #[error("{model}: request failed: {detail}")]
    Network { model: String, detail: String },

    /// HTTP 429 — quota exhausted or rate limited.
    #[error("{model}: quota or rate limit exceeded (HTTP 429)")]
    Quota {
        model: String,
        retry_after_secs: Option<u64>,
    },

    /// HTTP 404 — the endpoint does not know this model identifier.
    #[error("{model}: unknown model (HTTP 404)")]
    UnknownModel { model: String },

    /// Any other non-success HTTP status.
    #[error("{model}: HTTP {status}: {body}")]
    Status {
        model: String,
        status: u16,
        body: String,
    },

    /// The API answered with an error payload.
    #[error("{model}: API error: {message}")]
    Api { model: String, message: String },

    /// The API answered, but the response has no usable text.
    #[error("{model}: malformed response: {detail}")]
    MalformedResponse { model: String, detail: String },

    /// Error surfaced by an edgequake-llm provider.
    #[error("{model}: {detail}")]
    Provider { model: String, detail: String },
}

/// Errors while building or writing an export artifact.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Spreadsheet generation failed: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    #[error("Row JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to write output file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
