//! Response normalisation: raw model text → [`ExtractionRecord`].
//!
//! Models are told to answer with bare JSON but regularly wrap it in a
//! ` ```json … ``` ` block anyway. The fences and surrounding whitespace are
//! removed, then the rest must parse as a whole record. There is no partial
//! recovery: a reply that is not valid JSON fails the page.

use crate::error::ExtractionError;
use crate::output::ExtractionRecord;
use once_cell::sync::Lazy;
use regex::Regex;

static RE_OPENING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```[A-Za-z0-9_+-]*[ \t]*").expect("opening fence regex"));

static RE_CLOSING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```$").expect("closing fence regex"));

/// Remove an optional leading fence (with language tag), an optional trailing
/// fence, and surrounding whitespace.
///
/// Idempotent: `strip_code_fences(strip_code_fences(s)) == strip_code_fences(s)`.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    loop {
        let before = s.len();
        if let Some(m) = RE_OPENING_FENCE.find(s) {
            s = s[m.end()..].trim();
        }
        if let Some(m) = RE_CLOSING_FENCE.find(s) {
            s = s[..m.start()].trim();
        }
        if s.len() == before {
            return s;
        }
    }
}

/// Parse a model reply into an [`ExtractionRecord`].
pub fn parse_record(raw: &str) -> Result<ExtractionRecord, ExtractionError> {
    let body = strip_code_fences(raw);
    if body.is_empty() {
        return Err(ExtractionError::Parse {
            detail: "empty reply".into(),
        });
    }

    serde_json::from_str(body).map_err(|e| ExtractionError::Parse {
        detail: format!("{e} (reply starts with {:?})", preview(body, 60)),
    })
}

fn preview(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
