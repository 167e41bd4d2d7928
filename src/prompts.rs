//! Extraction prompt sent with every page image.
//!
//! Every prompt rule lives here so prompt regressions can be caught by unit
//! tests without a live model. Callers can override the whole prompt via
//! [`crate::config::ExtractionConfig::system_prompt`]; the template below is
//! used only when no override is provided.

/// Placeholder replaced with the target language.
const LANGUAGE_SLOT: &str = "{language}";

/// Placeholder replaced with the lump-sum description label.
const PLACEHOLDER_SLOT: &str = "{placeholder}";

/// Default extraction prompt template.
///
/// Contains the `{language}` and `{placeholder}` slots; render it with
/// [`render_extraction_prompt`].
pub const EXTRACTION_PROMPT_TEMPLATE: &str = r#"You are an accounting assistant. The image is one page of a receipt or an invoice. Extract the expense it documents.

Reply with ONE JSON object and nothing else, using exactly this shape:

{
  "date": "YYYY-MM-DD",
  "merchant": "name of the shop, restaurant or supplier",
  "currency": "currency symbol as printed, e.g. € or $",
  "category": "one of: Restaurant, Groceries, Transport, Fuel, Lodging, Office supplies, Telecom, Other",
  "items": [
    { "description": "what was bought", "quantity": 1, "price": 0.00 }
  ]
}

Rules:

1. DATE
   - Normalise the transaction date to ISO format YYYY-MM-DD
   - Day-first dates (31/01/2024) are the norm on European receipts
   - Use null when no date is printed

2. LANGUAGE
   - Translate item descriptions and the category into {language}
   - Keep the merchant name exactly as printed

3. LINE ITEMS
   - One entry per purchased line, in the order printed
   - "quantity" is a number; use 1 when not printed
   - "price" is the amount paid for the whole line (quantity included), as a number with a dot as decimal separator
   - Do NOT list subtotals, totals, taxes summaries, change given or payment lines as items

4. LUMP SUM
   - If the page only shows a total without itemised lines, return a single item
     with description "{placeholder}", quantity 1 and the total as price
   - If the page is not a receipt or invoice at all, return an empty "items" list

5. OUTPUT FORMAT
   - Output ONLY the JSON object
   - Do NOT wrap it in ```json fences
   - Do NOT add commentary or explanations"#;

/// Render the default prompt for a target language and placeholder label.
pub fn render_extraction_prompt(language: &str, placeholder: &str) -> String {
    EXTRACTION_PROMPT_TEMPLATE
        .replace(LANGUAGE_SLOT, language)
        .replace(PLACEHOLDER_SLOT, placeholder)
}
