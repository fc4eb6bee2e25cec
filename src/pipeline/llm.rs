//! Transcription backends, bound one-to-one to credentials.
//!
//! A worker only ever sees the [`Transcriber`] trait and the classified
//! [`TranscribeError`]. Everything provider-specific, including how a quota
//! signal looks on the wire, stays in the adapter that produced it:
//!
//! * [`GeminiFactory`] — Gemini `generateContent` over REST. The key travels
//!   in the `x-goog-api-key` header, so one HTTP client per credential is all
//!   the binding needed. HTTP 429 and `RESOURCE_EXHAUSTED` payloads map to
//!   [`TranscribeError::QuotaExhausted`].
//! * [`LlmFactory`] — any `edgequake-llm` provider. The provider factory
//!   reads its key from the provider's environment variable, so each
//!   credential's provider is constructed under that key, one after another,
//!   before any worker starts.

use crate::config::{Backend, PipelineConfig};
use crate::credentials::Credential;
use crate::error::{PipelineError, TranscribeError};
use crate::pipeline::encode::PageImage;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Text returned for one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The external transcription capability, already bound to one credential.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one page image following `prompt`.
    async fn transcribe(&self, page: &PageImage, prompt: &str)
        -> Result<Transcript, TranscribeError>;

    /// Text-only request whose reply must be JSON (overlay repair).
    async fn complete_json(&self, prompt: &str) -> Result<Transcript, TranscribeError>;
}

/// Builds a [`Transcriber`] bound to a given credential.
pub trait TranscriberFactory: Send + Sync {
    /// Bind `credential`. An error here retires the worker before its first page.
    fn bind(&self, credential: &Credential) -> Result<Arc<dyn Transcriber>, TranscribeError>;
}

/// Pick the factory for a run, from most-specific to least-specific.
///
/// 1. **Pre-built factory** (`config.factory`) — used as-is (tests, custom middleware).
/// 2. **Backend** (`config.backend`) — Gemini REST or a named `edgequake-llm` provider.
pub fn resolve_factory(config: &PipelineConfig) -> Result<Arc<dyn TranscriberFactory>, PipelineError> {
    if let Some(ref factory) = config.factory {
        return Ok(Arc::clone(factory));
    }
    match &config.backend {
        Backend::Gemini => Ok(Arc::new(GeminiFactory::from_config(config))),
        Backend::Llm(name) => {
            if name.trim().is_empty() {
                return Err(PipelineError::InvalidConfig(
                    "LLM backend needs a provider name".into(),
                ));
            }
            Ok(Arc::new(LlmFactory::from_config(name, config)))
        }
    }
}

// ── Classification ───────────────────────────────────────────────────────

/// Map an HTTP failure into the worker taxonomy.
pub fn classify_http(status: u16, body: &str) -> TranscribeError {
    let detail = format!("HTTP {status}: {}", truncate(body, 300));
    if status == 429 || mentions_quota(body) {
        return TranscribeError::QuotaExhausted(detail);
    }
    match status {
        401 | 403 | 404 => TranscribeError::Fatal(detail),
        400 if body.contains("API_KEY_INVALID") || body.contains("API key not valid") => {
            TranscribeError::Fatal(detail)
        }
        _ => TranscribeError::Transient(detail),
    }
}

/// Map a provider error message into the worker taxonomy.
///
/// `edgequake-llm` surfaces provider failures as display strings; this is the
/// single place that interprets them.
pub fn classify_message(message: &str) -> TranscribeError {
    let lower = message.to_ascii_lowercase();
    let status = status_code(message);
    if status == Some(429) || mentions_quota(message) || lower.contains("rate limit") {
        TranscribeError::QuotaExhausted(message.to_string())
    } else if matches!(status, Some(401 | 403))
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("not configured")
    {
        TranscribeError::Fatal(message.to_string())
    } else {
        TranscribeError::Transient(message.to_string())
    }
}

// A 4xx code standing alone as a word, not a digit run inside an id or size.
static RE_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(4(?:01|03|29))\b").unwrap());

/// First auth or rate-limit status code mentioned in `message`.
fn status_code(message: &str) -> Option<u16> {
    RE_STATUS
        .captures(message)
        .and_then(|c| c[1].parse().ok())
}

fn mentions_quota(text: &str) -> bool {
    text.contains("RESOURCE_EXHAUSTED") || text.to_ascii_lowercase().contains("quota")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ── Gemini REST ──────────────────────────────────────────────────────────

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Binds credentials to Gemini REST clients.
#[derive(Debug, Clone)]
pub struct GeminiFactory {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout: Duration,
}

impl GeminiFactory {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            endpoint: GEMINI_ENDPOINT.to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }
}

impl TranscriberFactory for GeminiFactory {
    fn bind(&self, credential: &Credential) -> Result<Arc<dyn Transcriber>, TranscribeError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| TranscribeError::Fatal(format!("HTTP client: {e}")))?;
        Ok(Arc::new(GeminiTranscriber {
            client,
            url: format!("{}/{}:generateContent", self.endpoint, self.model),
            api_key: credential.secret().to_string(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }))
    }
}

/// One credential's Gemini client.
pub struct GeminiTranscriber {
    client: reqwest::Client,
    url: String,
    api_key: String,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Inline { inline_data: InlineData<'a> },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata", default)]
    usage: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl GenerateResponse {
    fn into_transcript(self) -> Transcript {
        let text = self
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let usage = self.usage.unwrap_or_default();
        Transcript {
            text,
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
        }
    }
}

impl GeminiTranscriber {
    fn request<'a>(
        &self,
        parts: Vec<RequestPart<'a>>,
        response_mime_type: Option<&'static str>,
    ) -> GenerateRequest<'a> {
        GenerateRequest {
            contents: vec![RequestContent { role: "user", parts }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_tokens,
                response_mime_type,
            },
        }
    }

    async fn generate(&self, body: &GenerateRequest<'_>) -> Result<Transcript, TranscribeError> {
        let response = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| TranscribeError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TranscribeError::Transient(format!("reading body: {e}")))?;

        if !status.is_success() {
            return Err(classify_http(status.as_u16(), &text));
        }

        let parsed: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| TranscribeError::Transient(format!("unexpected response: {e}")))?;
        let transcript = parsed.into_transcript();
        debug!(
            "Gemini: {} input tokens, {} output tokens",
            transcript.input_tokens, transcript.output_tokens
        );
        Ok(transcript)
    }
}

#[async_trait]
impl Transcriber for GeminiTranscriber {
    async fn transcribe(
        &self,
        page: &PageImage,
        prompt: &str,
    ) -> Result<Transcript, TranscribeError> {
        let body = self.request(
            vec![
                RequestPart::Inline {
                    inline_data: InlineData {
                        mime_type: page.mime_type,
                        data: page.to_base64(),
                    },
                },
                RequestPart::Text { text: prompt },
            ],
            None,
        );
        self.generate(&body).await
    }

    async fn complete_json(&self, prompt: &str) -> Result<Transcript, TranscribeError> {
        let body = self.request(
            vec![RequestPart::Text { text: prompt }],
            Some("application/json"),
        );
        self.generate(&body).await
    }
}

// ── edgequake-llm providers ──────────────────────────────────────────────

/// Binds credentials to named `edgequake-llm` providers.
#[derive(Debug, Clone)]
pub struct LlmFactory {
    pub provider_name: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl LlmFactory {
    pub fn from_config(provider_name: &str, config: &PipelineConfig) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// Environment variable a provider factory reads its key from.
pub fn api_key_env(provider_name: &str) -> Option<&'static str> {
    match provider_name.to_ascii_lowercase().as_str() {
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "gemini" | "google" => Some("GEMINI_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        _ => None,
    }
}

impl TranscriberFactory for LlmFactory {
    fn bind(&self, credential: &Credential) -> Result<Arc<dyn Transcriber>, TranscribeError> {
        match api_key_env(&self.provider_name) {
            // Bind calls happen sequentially before workers are spawned.
            Some(var) => std::env::set_var(var, credential.secret()),
            None => warn!(
                "Provider '{}' takes no API key; credential {} is only a shard label",
                self.provider_name, credential
            ),
        }
        let provider = ProviderFactory::create_llm_provider(&self.provider_name, &self.model)
            .map_err(|e| TranscribeError::Fatal(format!("{}: {e}", self.provider_name)))?;
        Ok(Arc::new(LlmTranscriber {
            provider,
            options: CompletionOptions {
                temperature: Some(self.temperature),
                max_tokens: Some(self.max_tokens),
                ..Default::default()
            },
        }))
    }
}

/// A pre-built `edgequake-llm` provider used as a transcriber.
pub struct LlmTranscriber {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl LlmTranscriber {
    pub fn new(provider: Arc<dyn LLMProvider>, options: CompletionOptions) -> Self {
        Self { provider, options }
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<Transcript, TranscribeError> {
        match self.provider.chat(messages, Some(&self.options)).await {
            Ok(response) => Ok(Transcript {
                text: response.content,
                input_tokens: response.prompt_tokens as u64,
                output_tokens: response.completion_tokens as u64,
            }),
            Err(e) => Err(classify_message(&e.to_string())),
        }
    }
}

#[async_trait]
impl Transcriber for LlmTranscriber {
    async fn transcribe(
        &self,
        page: &PageImage,
        prompt: &str,
    ) -> Result<Transcript, TranscribeError> {
        // The image carries the content; the prompt rides as the system turn.
        let messages = vec![
            ChatMessage::system(prompt),
            ChatMessage::user_with_images("", vec![page.to_image_data()]),
        ];
        self.chat(&messages).await
    }

    async fn complete_json(&self, prompt: &str) -> Result<Transcript, TranscribeError> {
        self.chat(&[ChatMessage::user(prompt)]).await
    }
}
