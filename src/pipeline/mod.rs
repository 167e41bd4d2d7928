//! Pipeline stages for receipt-to-spreadsheet extraction.
//!
//! Each submodule implements exactly one transformation step and is tested
//! on its own.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ llm ──▶ normalize ──▶ flatten
//! (path/URL) (pdfium)  (base64)  (chain)  (JSON)       (rows)
//! ```
//!
//! 1. [`input`]     — read a local file or download a URL; declare its kind
//! 2. [`render`]    — decode an image, or rasterise PDF pages on demand in
//!    `spawn_blocking` because pdfium is not async-safe
//! 3. [`encode`]    — PNG-encode and base64-wrap each page for the request body
//! 4. [`llm`]       — walk the model fallback chain; the only stage with
//!    network I/O
//! 5. [`normalize`] — strip code fences and parse the reply into a record
//! 6. [`flatten`]   — expand a record into table rows

pub mod encode;
pub mod flatten;
pub mod input;
pub mod llm;
pub mod normalize;
pub mod render;
