//! Data model shared by the pipeline stages and the public API.
//!
//! The model reply is untrusted text, so [`ExtractionRecord`] and
//! [`LineItem`] deserialise leniently: unknown fields are ignored, `null` and
//! missing values fall back to documented defaults, and numbers written as
//! strings (`"4,50"`, `"€12.00"`) are accepted on a best-effort basis.

use crate::error::ExtractionError;
use crate::export::ExpenseTable;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

// ── Extraction record (one page) ─────────────────────────────────────────

/// The normalised result of analysing one page image.
///
/// Alternative key spellings (`vendor`, `store`, `line_items`) are read as
/// separate fields and only used when the canonical key is missing, so a
/// reply carrying both never fails with a duplicate field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRecord")]
pub struct ExtractionRecord {
    /// Transaction date, ISO `YYYY-MM-DD` when the model follows the prompt.
    pub date: Option<String>,
    pub merchant: Option<String>,
    /// Currency symbol as printed (`€`, `$`, `£`, …).
    pub currency: Option<String>,
    pub category: Option<String>,
    /// Line items in document order. May be empty.
    pub items: Vec<LineItem>,
}

/// One priced entry of a receipt or invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawLineItem")]
pub struct LineItem {
    pub description: String,
    /// Defaults to 1 when absent or unreadable.
    pub quantity: f64,
    /// Defaults to 0.0 when absent or unreadable.
    pub price: f64,
}

impl LineItem {
    pub fn new(description: impl Into<String>, quantity: f64, price: f64) -> Self {
        Self {
            description: description.into(),
            quantity,
            price,
        }
    }
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(default, deserialize_with = "de_opt_text")]
    date: Option<String>,
    #[serde(default, deserialize_with = "de_opt_text")]
    merchant: Option<String>,
    #[serde(default, deserialize_with = "de_opt_text")]
    vendor: Option<String>,
    #[serde(default, deserialize_with = "de_opt_text")]
    store: Option<String>,
    #[serde(default, deserialize_with = "de_opt_text")]
    currency: Option<String>,
    #[serde(default, deserialize_with = "de_opt_text")]
    category: Option<String>,
    #[serde(default)]
    items: Option<Vec<LineItem>>,
    #[serde(default)]
    line_items: Option<Vec<LineItem>>,
}

impl From<RawRecord> for ExtractionRecord {
    fn from(raw: RawRecord) -> Self {
        Self {
            date: raw.date,
            merchant: raw.merchant.or(raw.vendor).or(raw.store),
            currency: raw.currency,
            category: raw.category,
            items: raw.items.or(raw.line_items).unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct RawLineItem {
    #[serde(default, deserialize_with = "de_opt_text")]
    description: Option<String>,
    #[serde(default, deserialize_with = "de_opt_text")]
    name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_number")]
    quantity: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    qty: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    amount: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    total: Option<f64>,
}

impl From<RawLineItem> for LineItem {
    fn from(raw: RawLineItem) -> Self {
        Self {
            description: raw.description.or(raw.name).unwrap_or_default(),
            quantity: raw.quantity.or(raw.qty).unwrap_or_else(default_quantity),
            price: raw.price.or(raw.amount).or(raw.total).unwrap_or(0.0),
        }
    }
}

fn default_quantity() -> f64 {
    1.0
}

// ── Output rows ──────────────────────────────────────────────────────────

/// One exported table row: shared record metadata × one line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRow {
    pub date: Option<String>,
    pub merchant: Option<String>,
    pub category: Option<String>,
    pub description: String,
    pub quantity: f64,
    pub amount: f64,
    pub currency: Option<String>,
    /// Filename of the document this row came from.
    pub source_file: String,
}

// ── Diagnostics ──────────────────────────────────────────────────────────

/// A per-file or per-page failure, always attributed to its source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub filename: String,
    /// 1-indexed page, or `None` when the whole file failed.
    pub page: Option<usize>,
    pub error: ExtractionError,
}

impl Diagnostic {
    /// A failure that affects the whole file.
    pub fn file(filename: impl Into<String>, error: ExtractionError) -> Self {
        Self {
            filename: filename.into(),
            page: None,
            error,
        }
    }

    /// A failure confined to one page.
    pub fn page(filename: impl Into<String>, page: usize, error: ExtractionError) -> Self {
        Self {
            filename: filename.into(),
            page: Some(page),
            error,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.page {
            Some(page) => write!(f, "{} (page {}): {}", self.filename, page, self.error),
            None => write!(f, "{}: {}", self.filename, self.error),
        }
    }
}

// ── Run output ───────────────────────────────────────────────────────────

/// Aggregate numbers for one extraction run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub total_files: usize,
    /// Files that contributed no row and reported at least one failure.
    pub failed_files: usize,
    pub processed_pages: usize,
    pub failed_pages: usize,
    pub total_rows: usize,
    /// Model calls made, counting every fallback attempt.
    pub model_attempts: usize,
    pub total_duration_ms: u64,
}

/// Everything a successful run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    /// Editable rows in file → page → item order.
    pub table: ExpenseTable,
    pub diagnostics: Vec<Diagnostic>,
    pub stats: ExtractionStats,
}

// ── Lenient deserialisers ────────────────────────────────────────────────

static RE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d+(?:[.,]\d+)?").expect("number regex is valid"));

/// Best-effort numeric reading of a JSON value.
///
/// Accepts JSON numbers and strings such as `"4,50"`, `"12.00 €"` or `"x2"`.
/// Thousands separators are not recognised: `"1,234.50"` reads as `1.234`.
pub(crate) fn lenient_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => RE_NUMBER
            .find(s)
            .and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok()),
        _ => None,
    }
}

fn lenient_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn de_opt_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?.and_then(lenient_text))
}

fn de_opt_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?.as_ref().and_then(lenient_number))
}
