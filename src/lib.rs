//! # scanfolio
//!
//! Turn shelves of scanned books into a browsable, searchable site, one
//! daily API quota at a time.
//!
//! ## Why this crate?
//!
//! A free-tier vision-model key transcribes a few hundred pages a day; a
//! postal-history archive has tens of thousands. scanfolio spreads the
//! pending pages across every key you have, stops each key cleanly when its
//! quota runs out, and picks up exactly where it left off on the next run.
//! The filesystem is the only state: a page is done when its output file
//! exists.
//!
//! ## Pipeline Overview
//!
//! ```text
//! <collection>/*.pdf
//!  │
//!  ├─ 1. Ingest      rasterise new PDFs to images/page_NNN.jpg (pdfium)
//!  ├─ 2. Scan        list pages whose htmls/ or texts/ artifact is missing
//!  ├─ 3. Partition   one contiguous shard per key, sizes differ by ≤ 1
//!  ├─ 4. Transcribe  one sequential worker per key; retire on quota
//!  ├─ 5. Audit       tesseract OSD, rotate, remember in audit_log.json
//!  ├─ 6. Overlays    word boxes to coords/*.json (optional)
//!  ├─ 7. Repair      correct box text against the transcript, keyed like 4
//!  └─ 8. Index       index.json: collection → book → page count
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scanfolio::{transcribe, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // keys.txt: one API key per line
//!     let config = PipelineConfig::builder()
//!         .data_dir("processed_data")
//!         .key_file("keys.txt")
//!         .build()?;
//!     let summary = transcribe(&config).await?;
//!     eprintln!(
//!         "{} written, {} keys retired, {} pages left for tomorrow",
//!         summary.completed,
//!         summary.retired_workers,
//!         summary.remaining()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `scanfolio` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! scanfolio = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod catalog;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fsio;
pub mod index;
pub mod ledger;
pub mod output;
pub mod partition;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod run;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use catalog::{scan, CatalogLayout, WorkUnit};
pub use config::{Backend, OutputFormat, PipelineConfig, PipelineConfigBuilder};
pub use credentials::{Credential, CredentialPool};
pub use error::{PipelineError, TranscribeError};
pub use index::SiteIndex;
pub use ledger::{AuditLedger, AuditStatus};
pub use output::{
    AuditSummary, IngestSummary, OverlaySummary, PipelineReport, RetireReason, RunSummary,
    WorkerEnd, WorkerReport,
};
pub use partition::{partition, Shard};
pub use pipeline::llm::{Transcriber, TranscriberFactory, Transcript};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use run::{audit, build_index, ingest, overlays, repair_overlays, run_all, transcribe};
