//! Model invocation: send one page image plus the prompt, get raw text back.
//!
//! Every backend implements [`VisionModel`], a single
//! `invoke(prompt, image) → text` capability. [`ModelChain`] holds the
//! candidates in priority order and walks them for each page:
//!
//! ```text
//! page ──▶ gemini-2.0-flash ──✗──▶ gemini-1.5-flash ──✗──▶ gemini-1.5-pro ──✓──▶ text
//! ```
//!
//! Any failure (network, quota, unknown model, malformed response) moves on
//! to the next candidate immediately. This is a fallback chain, not a retry
//! loop: there is no backoff and no candidate is tried twice for a page.

use crate::config::{Credential, ExtractionConfig};
use crate::error::{ExtractionError, ModelError, ReceiptError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A remote model able to read one image under one instruction.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Identifier used in logs and error messages.
    fn name(&self) -> &str;

    /// Send the prompt and image; return the model's raw text reply.
    async fn invoke(&self, prompt: &str, image: &ImageData) -> Result<String, ModelError>;
}

/// Raw text returned by the first candidate that succeeded.
#[derive(Debug, Clone)]
pub struct ModelReply {
    /// Name of the candidate that answered.
    pub model: String,
    pub text: String,
    /// Candidates tried, including the successful one.
    pub attempts: usize,
    pub duration_ms: u64,
}

// ── Fallback chain ───────────────────────────────────────────────────────

/// Ordered list of candidates tried in sequence until one succeeds.
#[derive(Clone)]
pub struct ModelChain {
    candidates: Vec<Arc<dyn VisionModel>>,
}

impl ModelChain {
    pub fn new(candidates: Vec<Arc<dyn VisionModel>>) -> Result<Self, ReceiptError> {
        if candidates.is_empty() {
            return Err(ReceiptError::InvalidConfig(
                "The model fallback chain has no candidates".into(),
            ));
        }
        Ok(Self { candidates })
    }

    /// Candidate names in priority order.
    pub fn names(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Try each candidate in order; stop at the first success.
    ///
    /// When every candidate fails the returned
    /// [`ExtractionError::Invocation`] carries the last failure's message.
    pub async fn invoke(
        &self,
        prompt: &str,
        image: &ImageData,
    ) -> Result<ModelReply, ExtractionError> {
        let start = Instant::now();
        let mut last_err: Option<ModelError> = None;

        for (idx, candidate) in self.candidates.iter().enumerate() {
            match candidate.invoke(prompt, image).await {
                Ok(text) => {
                    debug!(
                        "{} answered ({} chars) after {} attempt(s)",
                        candidate.name(),
                        text.len(),
                        idx + 1
                    );
                    return Ok(ModelReply {
                        model: candidate.name().to_string(),
                        text,
                        attempts: idx + 1,
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => {
                    warn!(
                        "Model candidate {}/{} failed: {}",
                        idx + 1,
                        self.candidates.len(),
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(ExtractionError::Invocation {
            attempts: self.candidates.len(),
            detail: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no model candidates configured".to_string()),
        })
    }
}

/// Build the fallback chain described by `config`.
///
/// Pre-built candidates win. Otherwise one candidate per model identifier is
/// created for the configured provider; identifiers the provider factory
/// rejects are skipped with a warning.
pub fn build_chain(
    config: &ExtractionConfig,
    credential: &Credential,
) -> Result<ModelChain, ReceiptError> {
    if !config.candidates.is_empty() {
        return ModelChain::new(config.candidates.clone());
    }

    let models = config.models.iter().map(|m| m.trim()).filter(|m| !m.is_empty());
    let mut candidates: Vec<Arc<dyn VisionModel>> = Vec::new();

    if config.provider_name.eq_ignore_ascii_case("gemini") {
        let client = reqwest::Client::new();
        for model in models {
            candidates.push(Arc::new(
                GeminiModel::new(client.clone(), model, credential.clone())
                    .with_base_url(&config.api_base_url)
                    .with_generation(config.temperature, config.max_tokens),
            ));
        }
    } else {
        for model in models {
            match ProviderModel::from_factory(&config.provider_name, model) {
                Ok(candidate) => {
                    candidates.push(Arc::new(
                        candidate.with_generation(config.temperature, config.max_tokens),
                    ));
                }
                Err(e) => warn!("Skipping model candidate: {}", e),
            }
        }
    }

    ModelChain::new(candidates)
}

// ── Gemini (direct REST) ─────────────────────────────────────────────────

/// Google Gemini `generateContent` over REST, authenticated with an explicit key.
#[derive(Clone)]
pub struct GeminiModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Credential,
    temperature: f32,
    max_output_tokens: usize,
}

#[derive(Debug, Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart<'a> {
    Text { text: &'a str },
    InlineData { inline_data: GeminiInlineData<'a> },
}

#[derive(Debug, Serialize)]
struct GeminiInlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
    next_page_token: Option<String>,
    error: Option<GeminiError>,
}

/// One entry of the Gemini `models.list` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Resource name, e.g. `models/gemini-2.0-flash`.
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub supported_generation_methods: Vec<String>,
}

impl ModelInfo {
    /// The identifier accepted by `--model` and [`GeminiModel::new`].
    pub fn id(&self) -> &str {
        self.name.strip_prefix("models/").unwrap_or(&self.name)
    }

    /// Whether the model can serve `generateContent`, the call extraction uses.
    pub fn can_generate(&self) -> bool {
        self.supported_generation_methods
            .iter()
            .any(|m| m == "generateContent")
    }
}

const LIST_MODELS_LABEL: &str = "models.list";

impl GeminiModel {
    /// List every model the key can use, following pagination.
    ///
    /// An empty listing is [`ReceiptError::NoModelsAvailable`]: the key is
    /// valid but grants access to nothing.
    pub async fn list_models(
        client: &reqwest::Client,
        base_url: &str,
        api_key: &Credential,
    ) -> Result<Vec<ModelInfo>, ReceiptError> {
        if api_key.is_blank() {
            return Err(ReceiptError::MissingCredential {
                hint: crate::extract::credential_hint("gemini"),
            });
        }

        let url = format!("{}/v1beta/models", base_url.trim_end_matches('/'));
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = client
                .get(&url)
                .header("x-goog-api-key", api_key.expose())
                .query(&[("pageSize", "1000")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().await.map_err(|e| ModelError::Network {
                model: LIST_MODELS_LABEL.to_string(),
                detail: e.without_url().to_string(),
            })?;
            let response = check_status(response, LIST_MODELS_LABEL).await?;
            let body: ListModelsResponse =
                response
                    .json()
                    .await
                    .map_err(|e| ModelError::MalformedResponse {
                        model: LIST_MODELS_LABEL.to_string(),
                        detail: e.without_url().to_string(),
                    })?;

            let (page, next) = model_page(body)?;
            debug!("models.list page: {} model(s)", page.len());
            models.extend(page);
            match next {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        ensure_models(models)
    }

    pub fn new(client: reqwest::Client, model: impl Into<String>, api_key: Credential) -> Self {
        Self {
            client,
            base_url: crate::config::DEFAULT_GEMINI_BASE_URL.to_string(),
            model: model.into(),
            api_key,
            temperature: 0.1,
            max_output_tokens: 4096,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_generation(mut self, temperature: f32, max_output_tokens: usize) -> Self {
        self.temperature = temperature;
        self.max_output_tokens = max_output_tokens;
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }

    fn request<'a>(&self, prompt: &'a str, image: &'a ImageData) -> GeminiRequest<'a> {
        GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![
                    GeminiPart::Text { text: prompt },
                    GeminiPart::InlineData {
                        inline_data: GeminiInlineData {
                            mime_type: &image.mime_type,
                            data: &image.data,
                        },
                    },
                ],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        }
    }
}

#[async_trait]
impl VisionModel for GeminiModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, prompt: &str, image: &ImageData) -> Result<String, ModelError> {
        let model = || self.model.clone();

        // Key goes in a header: reqwest errors echo the URL.
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose())
            .json(&self.request(prompt, image))
            .send()
            .await
            .map_err(|e| ModelError::Network {
                model: model(),
                detail: e.without_url().to_string(),
            })?;

        let response = check_status(response, &self.model).await?;

        let body: GeminiResponse =
            response
                .json()
                .await
                .map_err(|e| ModelError::MalformedResponse {
                    model: model(),
                    detail: e.without_url().to_string(),
                })?;

        response_text(body, &self.model)
    }
}

/// Map quota, unknown-model and other non-success statuses to [`ModelError`].
async fn check_status(
    response: reqwest::Response,
    model: &str,
) -> Result<reqwest::Response, ModelError> {
    let status = response.status();
    match status.as_u16() {
        429 => {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            Err(ModelError::Quota {
                model: model.to_string(),
                retry_after_secs,
            })
        }
        404 => Err(ModelError::UnknownModel {
            model: model.to_string(),
        }),
        _ if !status.is_success() => {
            let body = response.text().await.unwrap_or_default();
            Err(ModelError::Status {
                model: model.to_string(),
                status: status.as_u16(),
                body: truncate(&body, 300),
            })
        }
        _ => Ok(response),
    }
}

/// Pull the reply text out of a `generateContent` response body.
fn response_text(body: GeminiResponse, model: &str) -> Result<String, ModelError> {
    if let Some(error) = body.error {
        return Err(ModelError::Api {
            model: model.to_string(),
            message: error.message,
        });
    }

    let Some(candidate) = body.candidates.and_then(|c| c.into_iter().next()) else {
        let detail = match body.prompt_feedback.and_then(|f| f.block_reason) {
            Some(reason) => format!("prompt blocked ({reason})"),
            None => "no candidates in response".to_string(),
        };
        return Err(ModelError::MalformedResponse {
            model: model.to_string(),
            detail,
        });
    };

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(ModelError::MalformedResponse {
            model: model.to_string(),
            detail: format!(
                "candidate has no text (finish reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            ),
        });
    }

    Ok(text)
}

/// One page of a `models.list` body: the entries and the next page token.
fn model_page(body: ListModelsResponse) -> Result<(Vec<ModelInfo>, Option<String>), ModelError> {
    if let Some(error) = body.error {
        return Err(ModelError::Api {
            model: LIST_MODELS_LABEL.to_string(),
            message: error.message,
        });
    }
    let next = body.next_page_token.filter(|t| !t.is_empty());
    Ok((body.models, next))
}

fn ensure_models(models: Vec<ModelInfo>) -> Result<Vec<ModelInfo>, ReceiptError> {
    if models.is_empty() {
        return Err(ReceiptError::NoModelsAvailable);
    }
    Ok(models)
}

fn truncate(s: &str, max_chars: usize) -> String {
    let s = s.trim();
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}\u{2026}")
    }
}

// ── edgequake-llm providers ──────────────────────────────────────────────

/// Any edgequake-llm provider (OpenAI, Anthropic, Mistral, …) used as a candidate.
///
/// The prompt travels as the system message and the page as a user message
/// with an empty text part: the image carries all the content.
pub struct ProviderModel {
    name: String,
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl ProviderModel {
    pub fn new(name: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            name: name.into(),
            provider,
            options: CompletionOptions {
                temperature: Some(0.1),
                max_tokens: Some(4096),
                ..Default::default()
            },
        }
    }

    /// Create through [`ProviderFactory`]; the provider reads its own API key.
    pub fn from_factory(provider_name: &str, model: &str) -> Result<Self, ModelError> {
        let provider = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
            ModelError::Provider {
                model: format!("{provider_name}/{model}"),
                detail: format!("provider not configured: {e}"),
            }
        })?;
        Ok(Self::new(format!("{provider_name}/{model}"), provider))
    }

    pub fn with_generation(mut self, temperature: f32, max_tokens: usize) -> Self {
        self.options.temperature = Some(temperature);
        self.options.max_tokens = Some(max_tokens);
        self
    }
}

#[async_trait]
impl VisionModel for ProviderModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, prompt: &str, image: &ImageData) -> Result<String, ModelError> {
        let messages = vec![
            ChatMessage::system(prompt),
            ChatMessage::user_with_images("", vec![image.clone()]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| ModelError::Provider {
                model: self.name.clone(),
                detail: format!("{}", e),
            })?;

        debug!(
            "{}: {} input tokens, {} output tokens",
            self.name, response.prompt_tokens, response.completion_tokens
        );

        if response.content.trim().is_empty() {
            return Err(ModelError::MalformedResponse {
                model: self.name.clone(),
                detail: "empty completion".into(),
            });
        }
        Ok(response.content)
    }
}
