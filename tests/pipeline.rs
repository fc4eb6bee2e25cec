//! Integration tests for the batch passes, driven through in-memory adapters.
//!
//! Every test builds its own data tree in a temp directory, so nothing here
//! needs network access, pdfium or tesseract.

use async_trait::async_trait;
use scanfolio::error::{ProbeError, RasterError};
use scanfolio::ledger::{AuditLedger, AuditStatus, LEDGER_FILE};
use scanfolio::pipeline::encode::PageImage;
use scanfolio::pipeline::orient::OrientationProbe;
use scanfolio::pipeline::render::Rasterizer;
use scanfolio::pipeline::coords::Word;
use scanfolio::run::{audit_with, build_index, ingest_with, repair_overlays, transcribe};
use scanfolio::{
    Credential, OutputFormat, PipelineConfig, RetireReason, TranscribeError, Transcriber,
    TranscriberFactory, Transcript, WorkerEnd,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Fakes ────────────────────────────────────────────────────────────────────

/// How a fake key behaves.
#[derive(Clone, Copy)]
enum KeyScript {
    Healthy,
    /// Succeeds this many times, then reports quota exhaustion.
    QuotaAfter(usize),
    /// Rejected when bound.
    Revoked,
    /// Panics on its first call.
    Panics,
}

struct FakeTranscriber {
    script: KeyScript,
    calls: AtomicUsize,
    total_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(
        &self,
        page: &PageImage,
        _prompt: &str,
    ) -> Result<Transcript, TranscribeError> {
        self.charge()?;
        Ok(Transcript {
            text: format!(
                "```html\n<p>{}</p>\n```",
                String::from_utf8_lossy(&page.data)
            ),
            input_tokens: 100,
            output_tokens: 20,
        })
    }

    /// Echoes the boxes from the request with their text upper-cased.
    async fn complete_json(&self, prompt: &str) -> Result<Transcript, TranscribeError> {
        self.charge()?;
        let boxes = prompt
            .split_once("geometry) ---\n")
            .and_then(|(_, rest)| rest.split_once("\n\n--- CLEAN TEXT"))
            .map(|(boxes, _)| boxes)
            .expect("request carries the OCR boxes");
        let mut words: Vec<serde_json::Value> = serde_json::from_str(boxes).unwrap();
        for w in &mut words {
            let fixed = w["text"].as_str().unwrap_or_default().to_uppercase();
            w["text"] = fixed.into();
        }
        Ok(Transcript {
            text: serde_json::to_string(&words).unwrap(),
            input_tokens: 50,
            output_tokens: 10,
        })
    }
}

impl FakeTranscriber {
    fn charge(&self) -> Result<(), TranscribeError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            KeyScript::QuotaAfter(k) if n >= k => {
                Err(TranscribeError::QuotaExhausted("HTTP 429 RESOURCE_EXHAUSTED".into()))
            }
            KeyScript::Panics => panic!("transcriber blew up"),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
struct FakeFactory {
    scripts: HashMap<String, KeyScript>,
    total_calls: Arc<AtomicUsize>,
}

impl FakeFactory {
    fn new(scripts: &[(&str, KeyScript)]) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .iter()
                .map(|(k, s)| (k.to_string(), *s))
                .collect(),
            total_calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }
}

impl TranscriberFactory for FakeFactory {
    fn bind(&self, credential: &Credential) -> Result<Arc<dyn Transcriber>, TranscribeError> {
        let script = self
            .scripts
            .get(credential.secret())
            .copied()
            .unwrap_or(KeyScript::Healthy);
        if let KeyScript::Revoked = script {
            return Err(TranscribeError::Fatal("API key not valid".into()));
        }
        Ok(Arc::new(FakeTranscriber {
            script,
            calls: AtomicUsize::new(0),
            total_calls: Arc::clone(&self.total_calls),
        }))
    }
}

/// Probe that answers per file name and records what it was asked.
struct FakeProbe {
    angles: HashMap<String, u16>,
    seen: Mutex<Vec<String>>,
}

impl FakeProbe {
    fn new(angles: &[(&str, u16)]) -> Arc<Self> {
        Arc::new(Self {
            angles: angles.iter().map(|(k, a)| (k.to_string(), *a)).collect(),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl OrientationProbe for FakeProbe {
    fn detect(&self, image: &Path) -> Result<u16, ProbeError> {
        let name = image.file_name().unwrap().to_string_lossy().into_owned();
        self.seen.lock().unwrap().push(name.clone());
        self.angles
            .get(&name)
            .copied()
            .ok_or_else(|| ProbeError::DetectionFailed("Too few characters".into()))
    }
}

struct BlankPages(usize);

impl Rasterizer for BlankPages {
    fn rasterize(
        &self,
        _pdf: &Path,
        _dpi: u32,
        sink: &mut dyn FnMut(usize, image::DynamicImage) -> Result<(), RasterError>,
    ) -> Result<usize, RasterError> {
        for page in 1..=self.0 {
            sink(
                page,
                image::DynamicImage::ImageRgb8(image::RgbImage::new(12, 16)),
            )?;
        }
        Ok(self.0)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn seed_book(data: &Path, collection: &str, book: &str, pages: usize) {
    let images = data.join(collection).join(book).join("images");
    std::fs::create_dir_all(&images).unwrap();
    for i in 1..=pages {
        std::fs::write(
            images.join(format!("page_{i:03}.jpg")),
            format!("{collection}/{book} page {i}"),
        )
        .unwrap();
    }
}

fn write_keys(dir: &Path, keys: &[&str]) -> PathBuf {
    let path = dir.join("keys.txt");
    std::fs::write(&path, keys.join("\n")).unwrap();
    path
}

fn config(root: &Path, keys: &Path, factory: Arc<FakeFactory>) -> PipelineConfig {
    PipelineConfig::builder()
        .data_dir(root.join("processed_data"))
        .source_root(root)
        .key_file(keys)
        .factory(factory)
        .throttle_ms(0)
        .error_backoff_ms(0)
        .build()
        .unwrap()
}

fn html(root: &Path, page: usize) -> PathBuf {
    root.join(format!("processed_data/IPG/1869/htmls/page_{page:03}.html"))
}

// ── Transcription ────────────────────────────────────────────────────────────

#[tokio::test]
async fn quota_on_one_key_leaves_only_its_tail_pending() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed_book(&root.join("processed_data"), "IPG", "1869", 10);
    let keys = write_keys(root, &["key-one", "key-two", "key-three"]);
    let factory = FakeFactory::new(&[("key-two", KeyScript::QuotaAfter(1))]);

    let summary = transcribe(&config(root, &keys, factory.clone()))
        .await
        .unwrap();

    let per_worker: Vec<(usize, usize)> = summary
        .workers
        .iter()
        .map(|w| (w.assigned, w.completed))
        .collect();
    assert_eq!(per_worker, vec![(4, 4), (3, 1), (3, 3)]);
    assert_eq!(summary.completed, 8);
    assert_eq!(summary.retired_workers, 1);
    assert_eq!(summary.remaining(), 2);
    assert!(matches!(
        summary.workers[1].end,
        WorkerEnd::Retired {
            reason: RetireReason::QuotaExhausted(_)
        }
    ));
    // key-two made 2 calls; the others one per page.
    assert_eq!(factory.calls(), 9);

    let missing: Vec<usize> = (1..=10).filter(|&p| !html(root, p).exists()).collect();
    assert_eq!(missing, vec![6, 7]);

    // Swap the exhausted key and run again: only the two gaps are sent.
    let keys = write_keys(root, &["key-one", "key-four", "key-three"]);
    let factory = FakeFactory::new(&[]);
    let summary = transcribe(&config(root, &keys, factory.clone()))
        .await
        .unwrap();

    assert_eq!(summary.pending, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(factory.calls(), 2);
    assert!((1..=10).all(|p| html(root, p).exists()));
}

#[tokio::test]
async fn second_run_with_nothing_new_makes_no_calls() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed_book(&root.join("processed_data"), "IPG", "1869", 5);
    let keys = write_keys(root, &["a-key", "b-key"]);

    let first = FakeFactory::new(&[]);
    transcribe(&config(root, &keys, first.clone())).await.unwrap();
    assert_eq!(first.calls(), 5);
    let before = std::fs::read_to_string(html(root, 3)).unwrap();

    let second = FakeFactory::new(&[]);
    let summary = transcribe(&config(root, &keys, second.clone()))
        .await
        .unwrap();

    assert_eq!(second.calls(), 0);
    assert_eq!(summary.pending, 0);
    assert!(summary.workers.is_empty());
    assert_eq!(std::fs::read_to_string(html(root, 3)).unwrap(), before);
}

#[tokio::test]
async fn written_page_is_a_styled_html_document() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed_book(&root.join("processed_data"), "IPG", "1869", 1);
    let keys = write_keys(root, &["only-key"]);

    transcribe(&config(root, &keys, FakeFactory::new(&[])))
        .await
        .unwrap();

    let page = std::fs::read_to_string(html(root, 1)).unwrap();
    assert!(page.starts_with("<!DOCTYPE html>"));
    assert!(page.contains("<body><p>IPG/1869 page 1</p></body>"));
    assert!(!page.contains("```"));
}

#[tokio::test]
async fn markdown_format_writes_texts() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed_book(&root.join("processed_data"), "IPG", "1869", 2);
    let keys = write_keys(root, &["only-key"]);
    let cfg = PipelineConfig::builder()
        .data_dir(root.join("processed_data"))
        .key_file(&keys)
        .factory(FakeFactory::new(&[]))
        .output_format(OutputFormat::Markdown)
        .throttle_ms(0)
        .build()
        .unwrap();

    let summary = transcribe(&cfg).await.unwrap();

    assert_eq!(summary.completed, 2);
    assert!(root
        .join("processed_data/IPG/1869/texts/page_002.txt")
        .is_file());
    assert!(!root.join("processed_data/IPG/1869/htmls").exists());
}

#[tokio::test]
async fn revoked_and_crashing_keys_do_not_stop_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed_book(&root.join("processed_data"), "IPG", "1869", 9);
    let keys = write_keys(root, &["revoked-key", "healthy-key", "panicky-key"]);
    let factory = FakeFactory::new(&[
        ("revoked-key", KeyScript::Revoked),
        ("panicky-key", KeyScript::Panics),
    ]);

    let summary = transcribe(&config(root, &keys, factory)).await.unwrap();

    assert!(matches!(
        summary.workers[0].end,
        WorkerEnd::Retired {
            reason: RetireReason::Fatal(_)
        }
    ));
    assert_eq!(summary.workers[0].completed, 0);
    assert_eq!(summary.workers[1].end, WorkerEnd::Finished);
    assert_eq!(summary.workers[1].completed, 3);
    assert!(matches!(summary.workers[2].end, WorkerEnd::Crashed { .. }));
    assert_eq!(summary.crashed_workers, 1);
    assert!((4..=6).all(|p| html(root, p).exists()));
    assert!(!html(root, 1).exists());
    assert!(!html(root, 7).exists());
}

#[tokio::test]
async fn empty_key_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    seed_book(&dir.path().join("processed_data"), "IPG", "1869", 1);
    let keys = write_keys(dir.path(), &["# no keys yet", ""]);

    let err = transcribe(&config(dir.path(), &keys, FakeFactory::new(&[])))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        scanfolio::PipelineError::NoCredentials { .. }
    ));
}

// ── Orientation ledger ───────────────────────────────────────────────────────

#[tokio::test]
async fn ledger_entries_survive_between_passes() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let data = root.join("processed_data");
    let images = data.join("IPG/1869/images");
    std::fs::create_dir_all(&images).unwrap();
    for name in ["page_001.jpg", "page_002.jpg", "page_003.jpg"] {
        image::RgbImage::new(10, 6).save(images.join(name)).unwrap();
    }
    let keys = write_keys(root, &["k"]);
    let cfg = config(root, &keys, FakeFactory::new(&[]));

    let probe = FakeProbe::new(&[("page_001.jpg", 0), ("page_002.jpg", 90)]);
    let first = audit_with(&cfg, probe.clone()).await.unwrap().unwrap();
    assert_eq!(probe.seen(), 3);
    assert_eq!(
        (first.checked_ok, first.rotated, first.skipped_error),
        (1, 1, 1)
    );

    let ledger_path = data.join("IPG/1869").join(LEDGER_FILE);
    let ledger = AuditLedger::read(&ledger_path).unwrap();
    assert_eq!(ledger.get("page_002.jpg"), Some(AuditStatus::Rotated(90)));
    assert_eq!(ledger.get("page_003.jpg"), Some(AuditStatus::SkippedError));
    let rotated = image::open(images.join("page_002.jpg")).unwrap();
    assert_eq!((rotated.width(), rotated.height()), (6, 10));

    let again = FakeProbe::new(&[]);
    let second = audit_with(&cfg, again.clone()).await.unwrap().unwrap();
    assert_eq!(again.seen(), 0);
    assert_eq!(second.cached, 3);
    assert_eq!(second.ledgers_written, 0);
    assert_eq!(AuditLedger::read(&ledger_path).unwrap(), ledger);
}

// ── Whole pipeline ───────────────────────────────────────────────────────────

#[tokio::test]
async fn ingest_transcribe_index() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let pdfs = root.join("IPG");
    std::fs::create_dir_all(&pdfs).unwrap();
    std::fs::write(pdfs.join("Indian_Postal_Guide-1869.pdf"), b"%PDF-1.4").unwrap();
    std::fs::write(pdfs.join("Indian_Postal_Guide-1870.pdf"), b"%PDF-1.4").unwrap();
    let keys = write_keys(root, &["k1", "k2"]);
    let cfg = config(root, &keys, FakeFactory::new(&[]));

    let ingested = ingest_with(&cfg, Arc::new(BlankPages(3))).await.unwrap();
    assert_eq!(ingested.pages_written, 6);

    let again = ingest_with(&cfg, Arc::new(BlankPages(3))).await.unwrap();
    assert_eq!(again.already_ingested, 2);
    assert_eq!(again.pages_written, 0);

    let summary = transcribe(&cfg).await.unwrap();
    assert_eq!(summary.completed, 6);
    assert_eq!(
        summary.workers.iter().map(|w| w.assigned).collect::<Vec<_>>(),
        vec![3, 3]
    );

    let (index, path) = build_index(&cfg).await.unwrap();
    assert_eq!(path, root.join("processed_data/index.json"));
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json, serde_json::json!({ "IPG": { "1869": 3, "1870": 3 } }));
    assert_eq!(index.total_pages(), 6);
}

// ── Overlay repair ───────────────────────────────────────────────────────────

fn seed_overlay(book: &Path, page: usize, transcript: Option<&str>) {
    let coords = book.join("coords");
    std::fs::create_dir_all(&coords).unwrap();
    std::fs::write(
        coords.join(format!("page_{page:03}.json")),
        format!(r#"[{{"text":"dehli","x":12,"y":30,"w":48,"h":14,"conf":{page}1.5}}]"#),
    )
    .unwrap();
    if let Some(text) = transcript {
        std::fs::create_dir_all(book.join("texts")).unwrap();
        std::fs::write(book.join(format!("texts/page_{page:03}.txt")), text).unwrap();
    }
}

#[tokio::test]
async fn overlay_repair_resumes_after_quota_and_waits_for_transcripts() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let book = root.join("processed_data/IPG/1869");
    seed_overlay(&book, 1, Some("DEHLI"));
    seed_overlay(&book, 2, Some("DEHLI"));
    seed_overlay(&book, 3, None);
    let clean = |page: usize| book.join(format!("coords/page_{page:03}_clean.json"));

    let keys = write_keys(root, &["key-one", "key-two"]);
    let factory = FakeFactory::new(&[("key-two", KeyScript::QuotaAfter(0))]);
    let cfg = PipelineConfig::builder()
        .data_dir(root.join("processed_data"))
        .key_file(&keys)
        .factory(factory.clone())
        .output_format(OutputFormat::Markdown)
        .throttle_ms(0)
        .error_backoff_ms(0)
        .build()
        .unwrap();

    let first = repair_overlays(&cfg).await.unwrap();

    assert_eq!(first.pending, 2, "page 3 has no transcript yet");
    assert_eq!((first.completed, first.retired_workers), (1, 1));
    let words: Vec<Word> = serde_json::from_str(&std::fs::read_to_string(clean(1)).unwrap()).unwrap();
    assert_eq!(words[0].text, "DEHLI");
    assert_eq!((words[0].x, words[0].w, words[0].conf), (12, 48, 11.5));
    assert!(!clean(2).exists());

    let keys = write_keys(root, &["key-one"]);
    let cfg = PipelineConfig::builder()
        .data_dir(root.join("processed_data"))
        .key_file(&keys)
        .factory(factory.clone())
        .output_format(OutputFormat::Markdown)
        .throttle_ms(0)
        .build()
        .unwrap();
    let second = repair_overlays(&cfg).await.unwrap();
    assert_eq!(second.completed, 1);
    assert!(clean(2).is_file());
    assert!(!clean(3).exists());

    let calls = factory.calls();
    let third = repair_overlays(&cfg).await.unwrap();
    assert_eq!(third.pending, 0);
    assert_eq!(factory.calls(), calls, "no calls once every ready overlay is clean");
}
