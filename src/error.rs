//! Error types for the scanfolio library.
//!
//! Three tiers reflect three distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal**: the run cannot start or a final artifact
//!   cannot be written (no credentials, catalog root missing, bad config).
//!   Returned as `Err(PipelineError)` from the top-level `run*` functions
//!   before any worker has been spawned.
//!
//! * [`TranscribeError`] — **Per item**: the outcome of one call to the
//!   external transcription capability, already classified by the adapter
//!   into the worker's vocabulary (transient, quota, fatal). A worker turns
//!   it into a skip, a backoff, or retirement; it never escapes the pool.
//!
//! * [`LedgerError`] — **Malformed persisted state**: an audit ledger that
//!   cannot be read back. The loader converts it into an empty ledger for that
//!   book only, so it is logged rather than propagated.
//!
//! Adapter-specific failures ([`ProbeError`], [`ExtractError`],
//! [`RasterError`]) are contained per page or per book by their passes.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the scanfolio library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Startup errors ────────────────────────────────────────────────────
    /// The credential list does not exist.
    #[error("Key file not found: '{path}'\nCreate it with one API key per line.")]
    KeyFileMissing { path: PathBuf },

    /// The credential list exists but holds no usable token.
    #[error("No credentials found in '{path}'")]
    NoCredentials { path: PathBuf },

    /// The directory that should hold page images does not exist.
    #[error("Catalog root not found: '{path}'\nRun `scanfolio ingest` first.")]
    CatalogRootMissing { path: PathBuf },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Generic filesystem failure on a path the run cannot do without.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The site index could not be serialised or written.
    #[error("Failed to write index '{path}': {detail}")]
    IndexWriteFailed { path: PathBuf, detail: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Classified outcome of a failed transcription call.
///
/// Adapters map provider-specific failures (HTTP status, error payloads,
/// client errors) into this taxonomy so the worker never inspects error text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranscribeError {
    /// The call failed but a later item may well succeed.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The credential's daily quota is spent. The worker must retire.
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    /// The credential or backend is unusable (rejected key, unknown model).
    #[error("fatal backend error: {0}")]
    Fatal(String),
}

impl TranscribeError {
    /// Whether a worker seeing this error must stop processing its shard.
    pub fn retires_worker(&self) -> bool {
        matches!(self, Self::QuotaExhausted(_) | Self::Fatal(_))
    }
}

/// A persisted audit ledger that could not be read back.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("cannot read ledger '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed ledger '{path}': {detail}")]
    Malformed { path: PathBuf, detail: String },
}

/// Orientation probe failure for one image.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("Orientation detection failed: {0}")]
    DetectionFailed(String),

    #[error("Unsupported rotation angle: {0}")]
    UnsupportedAngle(i32),

    #[error("Image rewrite failed: {0}")]
    RotateFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coordinate extraction failure for one image.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rasterisation failure for one source document.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("PDF '{path}' could not be opened: {detail}")]
    Open { path: PathBuf, detail: String },

    #[error("Rasterisation failed for page {page}: {detail}")]
    Page { page: usize, detail: String },

    #[error("Failed to save page image '{path}': {detail}")]
    Save { path: PathBuf, detail: String },
}
