//! Progress-callback trait for per-file extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the pipeline works through the batch. Events are advisory: they
//! carry no data the final [`crate::output::ExtractionOutput`] does not.
//!
//! # Example
//!
//! ```rust
//! use edgequake_receipts::{ExtractionConfig, ExtractionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct RowCounter {
//!     rows: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for RowCounter {
//!     fn on_file_complete(&self, _index: usize, _total: usize, filename: &str, rows: usize, fraction: f32) {
//!         self.rows.fetch_add(rows, Ordering::SeqCst);
//!         eprintln!("{filename}: {rows} rows ({:.0}%)", fraction * 100.0);
//!     }
//! }
//!
//! let counter = Arc::new(RowCounter { rows: AtomicUsize::new(0) });
//! let config = ExtractionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::output::Diagnostic;
use std::sync::Arc;

/// Called by the extraction pipeline as it processes each file.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Files are processed one at a time, so events arrive
/// in order; implementations must still be `Send + Sync` because the pipeline
/// runs on a multi-threaded runtime.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once before the first file is opened.
    fn on_batch_start(&self, total_files: usize) {
        let _ = total_files;
    }

    /// Called when processing of a file starts.
    ///
    /// * `index` — 0-indexed position of the file in the batch
    fn on_file_start(&self, index: usize, total_files: usize, filename: &str) {
        let _ = (index, total_files, filename);
    }

    /// Called for every page- or file-level failure, as soon as it happens.
    fn on_diagnostic(&self, diagnostic: &Diagnostic) {
        let _ = diagnostic;
    }

    /// Called when a file is done, successfully or not.
    ///
    /// * `rows`     — rows this file contributed
    /// * `fraction` — share of the batch done so far, in `0.0..=1.0`
    fn on_file_complete(
        &self,
        index: usize,
        total_files: usize,
        filename: &str,
        rows: usize,
        fraction: f32,
    ) {
        let _ = (index, total_files, filename, rows, fraction);
    }

    /// Called once after every file has been attempted.
    fn on_batch_complete(&self, total_files: usize, total_rows: usize) {
        let _ = (total_files, total_rows);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

/// Share of the batch completed after file `index` (0-indexed) finished.
pub(crate) fn batch_fraction(index: usize, total_files: usize) -> f32 {
    if total_files == 0 {
        1.0
    } else {
        (index + 1) as f32 / total_files as f32
    }
}
