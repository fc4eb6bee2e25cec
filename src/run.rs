//! Top-level passes over the data tree.
//!
//! Each pass is independent and resumable; `run_all` chains them in the
//! order the site needs:
//!
//! ```text
//! ingest ──▶ transcribe ──▶ audit ──▶ index
//! (pdfium)   (N workers)    (OSD)     (counts)
//! ```
//!
//! Coordinate overlays are a separate pass since they only need tesseract.
//! Overlay repair, which sends those boxes and the transcript back through
//! the keyed worker pool, runs after both.
//!
//! Only startup problems are returned as errors; anything that goes wrong
//! with a single page, book or worker is logged and counted in the summary.

use crate::catalog::{scan, CatalogLayout, WorkUnit};
use crate::config::PipelineConfig;
use crate::credentials::CredentialPool;
use crate::error::PipelineError;
use crate::fsio::write_atomic_with;
use crate::index::SiteIndex;
use crate::ledger::{audit_all, AuditOptions};
use crate::output::{AuditSummary, IngestSummary, OverlaySummary, PipelineReport, RunSummary};
use crate::partition::partition;
use crate::pipeline::coords::{CoordinateExtractor, TesseractTsv, Word};
use crate::pipeline::llm::resolve_factory;
use crate::pipeline::orient::{OrientationProbe, TesseractProbe};
use crate::pipeline::render::{self, PdfiumRasterizer, Rasterizer};
use crate::worker::{run_pool, WorkerContext};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Transcribe every pending page with one worker per credential.
///
/// # Errors
/// Returns `Err` only for startup problems: missing or empty key file,
/// missing data directory, or an unusable backend configuration.
/// Quota exhaustion and per-page failures are reported in the summary.
pub async fn transcribe(config: &PipelineConfig) -> Result<RunSummary, PipelineError> {
    let layout = CatalogLayout::for_format(config.output_format);
    run_keyed(
        config,
        "Transcription",
        layout,
        |_| true,
        WorkerContext::from_config(config),
    )
    .await
}

/// Correct the text of tesseract overlays against the pages' transcripts.
///
/// Each `coords/page_NNN.json` whose transcript exists and that has no
/// `coords/page_NNN_clean.json` yet is sent to the backend with that
/// transcript; the corrected boxes land in the `_clean.json` sibling.
/// Pages still waiting for a transcript are left for a later run. Keys are
/// partitioned and retired exactly as in [`transcribe`].
pub async fn repair_overlays(config: &PipelineConfig) -> Result<RunSummary, PipelineError> {
    let format = config.output_format;
    run_keyed(
        config,
        "Overlay repair",
        CatalogLayout::overlay_repair(),
        move |unit| {
            CatalogLayout::transcript_for(&unit.source, format).is_some_and(|p| p.is_file())
        },
        WorkerContext::overlay_repair(config),
    )
    .await
}

/// Scan, partition over the key file, and drain the shards with `ctx`.
///
/// `ready` narrows the pending units to those whose inputs exist.
async fn run_keyed<R>(
    config: &PipelineConfig,
    pass: &'static str,
    layout: CatalogLayout,
    ready: R,
    ctx: WorkerContext,
) -> Result<RunSummary, PipelineError>
where
    R: Fn(&WorkUnit) -> bool + Send + 'static,
{
    let start = Instant::now();
    let credentials = CredentialPool::load(&config.key_file)?;
    let factory = resolve_factory(config)?;

    let data_dir = config.data_dir.clone();
    let (pending, waiting) = tokio::task::spawn_blocking(move || {
        let units = scan(&data_dir, &layout, WorkUnit::is_complete)?;
        let total = units.len();
        let ready: Vec<WorkUnit> = units.into_iter().filter(|u| ready(u)).collect();
        let waiting = total - ready.len();
        Ok::<_, PipelineError>((ready, waiting))
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Scan task panicked: {}", e)))??;

    if waiting > 0 {
        info!("{}: {} pages wait for their inputs", pass, waiting);
    }
    let total = pending.len();
    if total == 0 {
        info!("{}: nothing pending", pass);
        if let Some(ref cb) = config.progress_callback {
            cb.on_run_complete(0, 0);
        }
        return Ok(RunSummary::from_workers(0, Vec::new(), elapsed_ms(start)));
    }

    let shards = partition(pending, credentials.len())?;
    info!(
        "{}: distributing {} pages across {} keys",
        pass,
        total,
        credentials.len()
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_start(total, shards.len());
    }

    let credentials = credentials.into_vec();
    let reports = run_pool(shards, &credentials, factory, ctx).await;

    let summary = RunSummary::from_workers(total, reports, elapsed_ms(start));
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_complete(summary.completed, summary.retired_workers);
    }
    info!(
        "{} done: {} written, {} skipped, {} failed, {} keys retired, {} pages still pending",
        pass,
        summary.completed,
        summary.skipped,
        summary.failed,
        summary.retired_workers,
        summary.remaining()
    );
    Ok(summary)
}

/// Rasterise new PDFs with pdfium.
pub async fn ingest(config: &PipelineConfig) -> Result<IngestSummary, PipelineError> {
    ingest_with(config, Arc::new(PdfiumRasterizer)).await
}

/// Rasterise new PDFs with a caller-supplied rasteriser.
pub async fn ingest_with(
    config: &PipelineConfig,
    rasterizer: Arc<dyn Rasterizer>,
) -> Result<IngestSummary, PipelineError> {
    let summary = render::ingest(config, rasterizer).await?;
    info!(
        "Ingest done: {} PDFs, {} already ingested, {} pages written, {} failed",
        summary.documents,
        summary.already_ingested,
        summary.pages_written,
        summary.failed.len()
    );
    Ok(summary)
}

/// Orientation pass using tesseract.
///
/// Returns `Ok(None)` when the probe cannot run, leaving every ledger as it is.
pub async fn audit(config: &PipelineConfig) -> Result<Option<AuditSummary>, PipelineError> {
    audit_with(config, Arc::new(TesseractProbe::new(&config.tesseract_cmd))).await
}

pub async fn audit_with(
    config: &PipelineConfig,
    probe: Arc<dyn OrientationProbe>,
) -> Result<Option<AuditSummary>, PipelineError> {
    let data_dir = config.data_dir.clone();
    if !data_dir.is_dir() {
        return Err(PipelineError::CatalogRootMissing { path: data_dir });
    }
    let opts = AuditOptions {
        jpeg_quality: config.jpeg_quality,
        force_recheck: config.force_recheck,
    };

    tokio::task::spawn_blocking(move || {
        if !probe.is_available() {
            warn!("Orientation probe unavailable; skipping orientation checks");
            return Ok(None);
        }
        audit_all(&data_dir, probe.as_ref(), opts)
            .map(Some)
            .map_err(|e| PipelineError::io(&data_dir, e))
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Audit task panicked: {}", e)))?
}

/// Coordinate-overlay pass using tesseract.
pub async fn overlays(config: &PipelineConfig) -> Result<OverlaySummary, PipelineError> {
    overlays_with(config, Arc::new(TesseractTsv::new(&config.tesseract_cmd))).await
}

pub async fn overlays_with(
    config: &PipelineConfig,
    extractor: Arc<dyn CoordinateExtractor>,
) -> Result<OverlaySummary, PipelineError> {
    let data_dir = config.data_dir.clone();

    tokio::task::spawn_blocking(move || -> Result<OverlaySummary, PipelineError> {
        let pending = scan(&data_dir, &CatalogLayout::coordinates(), WorkUnit::is_complete)?;
        let mut summary = OverlaySummary {
            pending: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(summary);
        }
        if !extractor.is_available() {
            warn!("Coordinate extractor unavailable; skipping overlays");
            return Ok(summary);
        }

        for unit in &pending {
            match write_overlay(extractor.as_ref(), unit) {
                Ok(words) => {
                    summary.written += 1;
                    info!("Mapped {} ({} words)", unit.label, words);
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!("Overlay failed for {}: {}", unit.label, e);
                }
            }
        }
        info!(
            "Overlays done: {} written, {} failed",
            summary.written, summary.failed
        );
        Ok(summary)
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Overlay task panicked: {}", e)))?
}

fn write_overlay(
    extractor: &dyn CoordinateExtractor,
    unit: &WorkUnit,
) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    let words: Vec<Word> = extractor
        .extract(&unit.source)?
        .into_iter()
        .filter(|w| w.conf > 0.0 && !w.text.trim().is_empty())
        .collect();
    let json = serde_json::to_vec(&words)?;
    write_atomic_with(&unit.destination, |w| w.write_all(&json))?;
    Ok(words.len())
}

/// Rebuild and write `index.json`.
pub async fn build_index(config: &PipelineConfig) -> Result<(SiteIndex, PathBuf), PipelineError> {
    let data_dir = config.data_dir.clone();
    let artifact_dir = config.index_artifact_dir.clone();
    let index = tokio::task::spawn_blocking(move || SiteIndex::build(&data_dir, &artifact_dir))
        .await
        .map_err(|e| PipelineError::Internal(format!("Index task panicked: {}", e)))??;
    let path = index.write(&config.data_dir).await?;
    Ok((index, path))
}

/// Ingest, transcribe, audit and index, in that order.
pub async fn run_all(config: &PipelineConfig) -> Result<PipelineReport, PipelineError> {
    let ingest = ingest(config).await?;
    let transcription = transcribe(config).await?;
    let audit = audit(config).await?;
    let (index, index_path) = build_index(config).await?;
    Ok(PipelineReport {
        ingest,
        transcription,
        audit,
        books: index.total_books(),
        pages: index.total_pages(),
        index_path,
    })
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractError;
    use std::path::Path;

    struct OneWord;

    impl CoordinateExtractor for OneWord {
        fn extract(&self, image: &Path) -> Result<Vec<Word>, ExtractError> {
            if image.ends_with("images/bad.jpg") {
                return Err(ExtractError::ExtractionFailed("unreadable".into()));
            }
            Ok(vec![Word {
                text: "Lahore".into(),
                x: 10,
                y: 20,
                w: 30,
                h: 12,
                conf: 88.0,
            }])
        }
    }

    struct Noisy;

    impl CoordinateExtractor for Noisy {
        fn extract(&self, _image: &Path) -> Result<Vec<Word>, ExtractError> {
            let word = |text: &str, conf: f32| Word {
                text: text.into(),
                x: 1,
                y: 1,
                w: 5,
                h: 5,
                conf,
            };
            Ok(vec![
                word("Lahore", 90.0),
                word("noise", -1.0),
                word("zero", 0.0),
                word("   ", 80.0),
            ])
        }
    }

    fn config(data: &Path) -> PipelineConfig {
        PipelineConfig::builder().data_dir(data).build().unwrap()
    }

    #[tokio::test]
    async fn overlays_written_once_and_failures_stay_pending() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("IPG/1869/images");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("page_001.jpg"), b"x").unwrap();
        std::fs::write(images.join("bad.jpg"), b"x").unwrap();
        let cfg = config(dir.path());

        let first = overlays_with(&cfg, Arc::new(OneWord)).await.unwrap();
        assert_eq!((first.pending, first.written, first.failed), (2, 1, 1));

        let json = std::fs::read_to_string(dir.path().join("IPG/1869/coords/page_001.json")).unwrap();
        let words: Vec<Word> = serde_json::from_str(&json).unwrap();
        assert_eq!(words[0].text, "Lahore");
        assert!(!dir.path().join("IPG/1869/coords/bad.json").exists());

        let second = overlays_with(&cfg, Arc::new(OneWord)).await.unwrap();
        assert_eq!(second.pending, 1);
    }

    #[tokio::test]
    async fn overlays_drop_unconfident_and_blank_words() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("IPG/1869/images");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("page_001.jpg"), b"x").unwrap();

        let summary = overlays_with(&config(dir.path()), Arc::new(Noisy)).await.unwrap();
        assert_eq!(summary.written, 1);

        let json = std::fs::read_to_string(dir.path().join("IPG/1869/coords/page_001.json")).unwrap();
        let words: Vec<Word> = serde_json::from_str(&json).unwrap();
        let kept: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(kept, vec!["Lahore"]);
    }

    #[tokio::test]
    async fn transcribe_without_key_file_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PipelineConfig::builder()
            .data_dir(dir.path())
            .key_file(dir.path().join("keys.txt"))
            .build()
            .unwrap();
        let err = transcribe(&cfg).await.unwrap_err();
        assert!(matches!(err, PipelineError::KeyFileMissing { .. }));
    }

    #[tokio::test]
    async fn audit_missing_data_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir.path().join("missing"));
        let err = audit(&cfg).await.unwrap_err();
        assert!(matches!(err, PipelineError::CatalogRootMissing { .. }));
    }
}
