//! Configuration types for receipt extraction.
//!
//! All extraction behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. The options that differ between
//! pipeline flavours (placeholder label, "paid items only" filter, category
//! column, pause between files) are named fields rather than hard-coded
//! choices.
//!
//! The API credential is deliberately *not* part of the config: it is passed
//! separately to [`crate::extract::extract`] as a [`Credential`] so it never
//! ends up in `Debug` output or serialised settings.

use crate::error::ReceiptError;
use crate::export::ColumnSet;
use crate::pipeline::flatten::FlattenOptions;
use crate::pipeline::llm::VisionModel;
use crate::pipeline::render::RenderOptions;
use crate::progress::ProgressCallback;
use crate::prompts::render_extraction_prompt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Model identifiers tried, in order, when none are configured.
pub const DEFAULT_MODELS: &[&str] = &["gemini-2.0-flash", "gemini-1.5-flash", "gemini-1.5-pro"];

/// Provider used when none is configured. Talks to the Gemini REST API directly.
pub const DEFAULT_PROVIDER: &str = "gemini";

/// Base URL of the Google Generative Language API.
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Description used for the synthetic row of a record without line items.
pub const DEFAULT_PLACEHOLDER_LABEL: &str = "Unspecified expense";

/// An opaque API credential.
///
/// `Debug` is redacted; the raw value is only reachable through
/// [`Credential::expose`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw key. Surrounding whitespace is trimmed.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    /// Read a credential from an environment variable, ignoring empty values.
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var)
            .ok()
            .map(Self::new)
            .filter(|c| !c.is_blank())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Configuration for an extraction run.
///
/// # Example
/// ```rust
/// use edgequake_receipts::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .models(["gemini-2.0-flash", "gemini-1.5-pro"])
///     .paid_items_only(true)
///     .target_language("French")
///     .build()
///     .unwrap();
/// assert_eq!(config.models.len(), 2);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Model identifiers in priority order. Default: [`DEFAULT_MODELS`].
    ///
    /// Each page is sent to the first model; on any failure the next one is
    /// tried immediately. There is no backoff and no second pass.
    pub models: Vec<String>,

    /// Provider name: `"gemini"` (direct REST, default) or any provider known
    /// to edgequake-llm (`"openai"`, `"anthropic"`, `"mistral"`, …).
    pub provider_name: String,

    /// Pre-constructed candidates. Take precedence over `models`.
    pub candidates: Vec<Arc<dyn VisionModel>>,

    /// Base URL for the Gemini backend. Default: [`DEFAULT_GEMINI_BASE_URL`].
    pub api_base_url: String,

    /// Rendering DPI for PDF pages. Range: 72–400. Default: 200.
    pub dpi: u32,

    /// Longest rendered edge in pixels, independent of DPI. Default: 3000.
    pub max_rendered_pixels: u32,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 4096.
    pub max_tokens: usize,

    /// Custom extraction prompt. If None, the built-in template is rendered.
    pub system_prompt: Option<String>,

    /// Language descriptions and categories are translated into. Default: English.
    pub target_language: String,

    /// Description of the placeholder row for records without line items.
    pub placeholder_label: String,

    /// Drop rows whose amount is not strictly positive. Default: false.
    pub paid_items_only: bool,

    /// Include the Category column in the spreadsheet. Default: true.
    pub include_category: bool,

    /// Fixed pause between two files, to respect remote rate limits. Default: 0.
    pub inter_file_delay: Duration,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional observer for per-file progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            models: DEFAULT_MODELS.iter().map(|m| m.to_string()).collect(),
            provider_name: DEFAULT_PROVIDER.to_string(),
            candidates: Vec::new(),
            api_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            dpi: 200,
            max_rendered_pixels: 3000,
            temperature: 0.1,
            max_tokens: 4096,
            system_prompt: None,
            target_language: "English".to_string(),
            placeholder_label: DEFAULT_PLACEHOLDER_LABEL.to_string(),
            paid_items_only: false,
            include_category: true,
            inter_file_delay: Duration::ZERO,
            password: None,
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("models", &self.models)
            .field("provider_name", &self.provider_name)
            .field(
                "candidates",
                &self.candidates.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("api_base_url", &self.api_base_url)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("target_language", &self.target_language)
            .field("placeholder_label", &self.placeholder_label)
            .field("paid_items_only", &self.paid_items_only)
            .field("include_category", &self.include_category)
            .field("inter_file_delay", &self.inter_file_delay)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// The prompt sent with every page: the override, or the rendered template.
    pub fn prompt(&self) -> String {
        match self.system_prompt {
            Some(ref custom) => custom.clone(),
            None => render_extraction_prompt(&self.target_language, &self.placeholder_label),
        }
    }

    pub fn flatten_options(&self) -> FlattenOptions {
        FlattenOptions {
            placeholder_label: self.placeholder_label.clone(),
            paid_items_only: self.paid_items_only,
        }
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            dpi: self.dpi,
            max_rendered_pixels: self.max_rendered_pixels,
            password: self.password.clone(),
        }
    }

    pub fn column_set(&self) -> ColumnSet {
        ColumnSet::new(self.include_category)
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    /// Replace the candidate model list (priority order).
    pub fn models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = name.into();
        self
    }

    /// Append a pre-built candidate. Once any is set, `models` is ignored.
    pub fn candidate(mut self, model: Arc<dyn VisionModel>) -> Self {
        self.config.candidates.push(model);
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn target_language(mut self, language: impl Into<String>) -> Self {
        self.config.target_language = language.into();
        self
    }

    pub fn placeholder_label(mut self, label: impl Into<String>) -> Self {
        self.config.placeholder_label = label.into();
        self
    }

    pub fn paid_items_only(mut self, v: bool) -> Self {
        self.config.paid_items_only = v;
        self
    }

    pub fn include_category(mut self, v: bool) -> Self {
        self.config.include_category = v;
        self
    }

    pub fn inter_file_delay(mut self, delay: Duration) -> Self {
        self.config.inter_file_delay = delay;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ReceiptError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(ReceiptError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.candidates.is_empty() && c.models.iter().all(|m| m.trim().is_empty()) {
            return Err(ReceiptError::InvalidConfig(
                "At least one model identifier is required".into(),
            ));
        }
        if c.placeholder_label.trim().is_empty() {
            return Err(ReceiptError::InvalidConfig(
                "Placeholder label must not be empty".into(),
            ));
        }
        if c.provider_name.trim().is_empty() {
            return Err(ReceiptError::InvalidConfig(
                "Provider name must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ExtractionConfig::default();
        assert_eq!(c.dpi, 200);
        assert_eq!(c.provider_name, "gemini");
        assert_eq!(c.models.first().map(String::as_str), Some("gemini-2.0-flash"));
        assert!(!c.paid_items_only);
        assert!(c.include_category);
        assert_eq!(c.inter_file_delay, Duration::ZERO);
    }

    #[test]
    fn builder_clamps_dpi() {
        let c = ExtractionConfig::builder().dpi(1000).build().unwrap();
        assert_eq!(c.dpi, 400);
        let c = ExtractionConfig::builder().dpi(10).build().unwrap();
        assert_eq!(c.dpi, 72);
    }

    #[test]
    fn builder_rejects_empty_model_list() {
        let err = ExtractionConfig::builder()
            .models(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("model"));
    }

    #[test]
    fn builder_rejects_blank_placeholder() {
        assert!(ExtractionConfig::builder()
            .placeholder_label("  ")
            .build()
            .is_err());
    }

    #[test]
    fn custom_prompt_overrides_template() {
        let c = ExtractionConfig::builder()
            .system_prompt("just JSON please")
            .build()
            .unwrap();
        assert_eq!(c.prompt(), "just JSON please");
    }

    #[test]
    fn template_prompt_mentions_language_and_placeholder() {
        let c = ExtractionConfig::builder()
            .target_language("French")
            .placeholder_label("Dépense globale")
            .build()
            .unwrap();
        let p = c.prompt();
        assert!(p.contains("French"));
        assert!(p.contains("Dépense globale"));
    }

    #[test]
    fn credential_debug_is_redacted() {
        let c = Credential::new("  sk-secret  ");
        assert_eq!(c.expose(), "sk-secret");
        assert_eq!(format!("{c:?}"), "Credential(***)");
        assert!(Credential::new("   ").is_blank());
    }
}
