//! Configuration types for a scanfolio run.
//!
//! Every pass reads its knobs from one [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`]. Paths, model identifiers and pacing intervals
//! are passed explicitly to each component at construction; nothing is read
//! from process-wide state once the config exists.

use crate::error::PipelineError;
use crate::pipeline::llm::TranscriberFactory;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default Gemini model used by the REST backend.
pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";

/// Configuration for every scanfolio pass.
///
/// # Example
/// ```rust
/// use scanfolio::{OutputFormat, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .data_dir("processed_data")
///     .key_file("keys.txt")
///     .output_format(OutputFormat::Html)
///     .throttle_ms(4000)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root of the produced tree (`<collection>/<book>/images/…`). Default: `processed_data`.
    pub data_dir: PathBuf,

    /// Folder whose sub-directories hold the source PDFs, one per collection. Default: `.`.
    pub source_root: PathBuf,

    /// Credential list, one key per line. Default: `keys.txt`.
    pub key_file: PathBuf,

    /// Transcription backend the credentials are bound to. Default: Gemini REST.
    pub backend: Backend,

    /// Model identifier passed to the backend. Default: [`DEFAULT_MODEL`].
    pub model: String,

    /// Pre-constructed transcriber factory. Takes precedence over `backend`.
    pub factory: Option<Arc<dyn TranscriberFactory>>,

    /// Output written per page. Default: [`OutputFormat::Html`].
    pub output_format: OutputFormat,

    /// Custom transcription prompt. If None, the format's built-in prompt is used.
    pub prompt: Option<String>,

    /// Fixed cool-down after every successful call, per worker. Default: 4000 ms.
    ///
    /// Each worker sleeps the same interval regardless of pool size, so the
    /// per-key call rate stays constant while throughput scales with the
    /// number of keys.
    pub throttle_ms: u64,

    /// Sleep after a transient item failure before the next item. Default: 5000 ms.
    pub error_backoff_ms: u64,

    /// Per-call timeout for the transcription backend. Default: 120 s.
    pub api_timeout_secs: u64,

    /// Sampling temperature for LLM backends. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the backend may generate per page. Default: 8192.
    pub max_tokens: usize,

    /// Rasterisation DPI for ingest. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// JPEG quality for ingested and rotated pages. Range: 1–100. Default: 80.
    pub jpeg_quality: u8,

    /// Collection folder names ignored by ingest. Default: `.git`, `.github`, `scripts`.
    pub exclude: Vec<String>,

    /// Tesseract executable used by the orientation and overlay passes. Default: `tesseract`.
    pub tesseract_cmd: String,

    /// Re-examine ledger entries previously recorded as `skipped_error`. Default: false.
    pub force_recheck: bool,

    /// Directory counted per book by the index builder. Default: `images`.
    pub index_artifact_dir: String,

    /// Progress events for the worker pool.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("processed_data"),
            source_root: PathBuf::from("."),
            key_file: PathBuf::from("keys.txt"),
            backend: Backend::default(),
            model: DEFAULT_MODEL.to_string(),
            factory: None,
            output_format: OutputFormat::default(),
            prompt: None,
            throttle_ms: 4000,
            error_backoff_ms: 5000,
            api_timeout_secs: 120,
            temperature: 0.1,
            max_tokens: 8192,
            dpi: 150,
            jpeg_quality: 80,
            exclude: vec![".git".into(), ".github".into(), "scripts".into()],
            tesseract_cmd: "tesseract".to_string(),
            force_recheck: false,
            index_artifact_dir: "images".to_string(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("data_dir", &self.data_dir)
            .field("source_root", &self.source_root)
            .field("key_file", &self.key_file)
            .field("backend", &self.backend)
            .field("model", &self.model)
            .field("factory", &self.factory.as_ref().map(|_| "<dyn TranscriberFactory>"))
            .field("output_format", &self.output_format)
            .field("throttle_ms", &self.throttle_ms)
            .field("error_backoff_ms", &self.error_backoff_ms)
            .field("dpi", &self.dpi)
            .field("jpeg_quality", &self.jpeg_quality)
            .field("force_recheck", &self.force_recheck)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// The prompt sent with every page: the override, or the format's default.
    pub fn effective_prompt(&self) -> &str {
        self.prompt
            .as_deref()
            .unwrap_or_else(|| self.output_format.default_prompt())
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn source_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.source_root = dir.into();
        self
    }

    pub fn key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.key_file = path.into();
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn factory(mut self, factory: Arc<dyn TranscriberFactory>) -> Self {
        self.config.factory = Some(factory);
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.output_format = format;
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.prompt = Some(prompt.into());
        self
    }

    pub fn throttle_ms(mut self, ms: u64) -> Self {
        self.config.throttle_ms = ms;
        self
    }

    pub fn error_backoff_ms(mut self, ms: u64) -> Self {
        self.config.error_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
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

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q;
        self
    }

    pub fn exclude(mut self, names: Vec<String>) -> Self {
        self.config.exclude = names;
        self
    }

    pub fn tesseract_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.config.tesseract_cmd = cmd.into();
        self
    }

    pub fn force_recheck(mut self, v: bool) -> Self {
        self.config.force_recheck = v;
        self
    }

    pub fn index_artifact_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.index_artifact_dir = dir.into();
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(PipelineError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.jpeg_quality == 0 || c.jpeg_quality > 100 {
            return Err(PipelineError::InvalidConfig(format!(
                "JPEG quality must be 1–100, got {}",
                c.jpeg_quality
            )));
        }
        if c.api_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "API timeout must be at least 1 second".into(),
            ));
        }
        if c.model.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("Model must not be empty".into()));
        }
        if c.index_artifact_dir.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Index artifact directory must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Which external service the credentials are keys for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Backend {
    /// Google Gemini `generateContent` over REST; the key travels per request. (default)
    #[default]
    Gemini,
    /// Any `edgequake-llm` provider by name (`openai`, `anthropic`, `gemini`, …).
    Llm(String),
}

/// What a worker persists for each page.
///
/// | Format | Directory | Extension | Post-processing |
/// |--------|-----------|-----------|-----------------|
/// | Html | `htmls` | `html` | fences stripped, wrapped in the stylesheet page |
/// | Markdown | `texts` | `txt` | Markdown cleanup rules |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Styled standalone HTML page. (default)
    #[default]
    Html,
    /// Plain Markdown transcript.
    Markdown,
}

impl OutputFormat {
    /// Sibling directory of `images/` holding this format's artifacts.
    pub fn dest_dir(self) -> &'static str {
        match self {
            OutputFormat::Html => "htmls",
            OutputFormat::Markdown => "texts",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Html => "html",
            OutputFormat::Markdown => "txt",
        }
    }

    pub fn default_prompt(self) -> &'static str {
        match self {
            OutputFormat::Html => crate::prompts::HTML_PROMPT,
            OutputFormat::Markdown => crate::prompts::MARKDOWN_PROMPT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.throttle_ms, 4000);
        assert_eq!(c.error_backoff_ms, 5000);
        assert_eq!(c.dpi, 150);
        assert_eq!(c.jpeg_quality, 80);
        assert_eq!(c.output_format, OutputFormat::Html);
        assert_eq!(c.backend, Backend::Gemini);
        assert!(!c.force_recheck);
    }

    #[test]
    fn build_rejects_out_of_range_dpi() {
        let err = PipelineConfig::builder().dpi(20).build().unwrap_err();
        assert!(err.to_string().contains("DPI"));
    }

    #[test]
    fn build_rejects_zero_quality() {
        assert!(PipelineConfig::builder().jpeg_quality(0).build().is_err());
    }

    #[test]
    fn build_rejects_zero_api_timeout() {
        let err = PipelineConfig::builder()
            .api_timeout_secs(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
        assert!(PipelineConfig::builder().api_timeout_secs(1).build().is_ok());
    }

    #[test]
    fn prompt_override_wins() {
        let c = PipelineConfig::builder()
            .prompt("just the words")
            .build()
            .unwrap();
        assert_eq!(c.effective_prompt(), "just the words");

        let c = PipelineConfig::builder()
            .output_format(OutputFormat::Markdown)
            .build()
            .unwrap();
        assert_eq!(c.effective_prompt(), crate::prompts::MARKDOWN_PROMPT);
    }

    #[test]
    fn format_layout() {
        assert_eq!(OutputFormat::Html.dest_dir(), "htmls");
        assert_eq!(OutputFormat::Html.extension(), "html");
        assert_eq!(OutputFormat::Markdown.dest_dir(), "texts");
        assert_eq!(OutputFormat::Markdown.extension(), "txt");
    }
}
