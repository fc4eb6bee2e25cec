//! Credential-bound workers and the pool that runs them.
//!
//! ## State machine
//!
//! ```text
//!            ┌──────────── next unit ◀───────────────┐
//!            ▼                                       │
//!        Running ──▶ ItemOk ──▶ throttle sleep ──────┤
//!            │   ──▶ ItemTransientError ──▶ backoff ─┘
//!            │   ──▶ ItemQuotaExhausted ──▶ Retired   (terminal for this run)
//!            └── shard drained ──────────▶ Finished
//! ```
//!
//! The same machine drives both keyed passes: page transcription and overlay
//! repair differ only in the [`Task`] that turns a unit into an artifact.
//!
//! A worker owns one shard and one credential and never touches another
//! worker's units, so retiring affects nobody else. Completion lives on disk,
//! not in memory: whatever a retired worker left behind is simply pending on
//! the next run.

use crate::catalog::{CatalogLayout, WorkUnit};
use crate::config::{OutputFormat, PipelineConfig};
use crate::credentials::Credential;
use crate::error::TranscribeError;
use crate::fsio::write_atomic;
use crate::output::{RetireReason, WorkerEnd, WorkerReport};
use crate::partition::Shard;
use crate::pipeline::coords::{apply_corrections, Word};
use crate::pipeline::encode::load_page;
use crate::pipeline::llm::{Transcriber, TranscriberFactory, Transcript};
use crate::pipeline::postprocess;
use crate::progress::ProgressCallback;
use crate::prompts;
use futures::future::join_all;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// What a worker produces for each unit.
#[derive(Debug, Clone)]
pub enum Task {
    /// Page image in, formatted transcript out.
    Transcribe { format: OutputFormat, prompt: Arc<str> },
    /// Tesseract boxes plus the page's transcript in, corrected boxes out.
    RepairOverlay { transcript_format: OutputFormat },
}

/// Settings shared by every worker of a run.
#[derive(Clone)]
pub struct WorkerContext {
    pub task: Task,
    pub throttle: Duration,
    pub error_backoff: Duration,
    pub api_timeout: Duration,
    pub progress: Option<ProgressCallback>,
}

impl WorkerContext {
    /// Transcription of pending pages in the configured format.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::with_task(
            config,
            Task::Transcribe {
                format: config.output_format,
                prompt: Arc::from(config.effective_prompt()),
            },
        )
    }

    /// Correction of overlay text against the configured format's transcripts.
    pub fn overlay_repair(config: &PipelineConfig) -> Self {
        Self::with_task(
            config,
            Task::RepairOverlay {
                transcript_format: config.output_format,
            },
        )
    }

    fn with_task(config: &PipelineConfig, task: Task) -> Self {
        Self {
            task,
            throttle: config.throttle(),
            error_backoff: config.error_backoff(),
            api_timeout: Duration::from_secs(config.api_timeout_secs),
            progress: config.progress_callback.clone(),
        }
    }
}

/// Where a worker stands between items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Retired(RetireReason),
    Finished,
}

impl WorkerState {
    /// How a report records this state once the loop has stopped.
    fn into_end(self) -> WorkerEnd {
        match self {
            WorkerState::Retired(reason) => WorkerEnd::Retired { reason },
            WorkerState::Running | WorkerState::Finished => WorkerEnd::Finished,
        }
    }
}

/// Result of processing one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Artifact written.
    Written { input_tokens: u64, output_tokens: u64 },
    /// Destination already existed; no call was made.
    AlreadyComplete,
    /// Failed; the unit stays pending and the worker moves on after a backoff.
    Transient(String),
    /// The credential is done for this run.
    Retire(RetireReason),
}

/// One credential's sequential processor.
pub struct Worker {
    id: usize,
    transcriber: Arc<dyn Transcriber>,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(id: usize, transcriber: Arc<dyn Transcriber>, ctx: WorkerContext) -> Self {
        Self {
            id,
            transcriber,
            ctx,
        }
    }

    /// Process a single unit: completion re-check, call, render, atomic write.
    pub async fn process_item(&self, unit: &WorkUnit) -> ItemOutcome {
        // Another actor may have produced this destination since the scan.
        if unit.is_complete() {
            return ItemOutcome::AlreadyComplete;
        }

        let produced = match &self.ctx.task {
            Task::Transcribe { format, prompt } => self.transcribe_page(unit, *format, prompt).await,
            Task::RepairOverlay { transcript_format } => {
                self.repair_overlay(unit, *transcript_format).await
            }
        };
        let (artifact, usage) = match produced {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };

        if let Err(e) = write_atomic(&unit.destination, &artifact).await {
            return ItemOutcome::Transient(format!(
                "writing {}: {e}",
                unit.destination.display()
            ));
        }

        ItemOutcome::Written {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        }
    }

    async fn transcribe_page(
        &self,
        unit: &WorkUnit,
        format: OutputFormat,
        prompt: &str,
    ) -> Result<(Vec<u8>, Transcript), ItemOutcome> {
        let page = load_page(&unit.source).await.map_err(|e| {
            ItemOutcome::Transient(format!("reading {}: {e}", unit.source.display()))
        })?;
        let transcript = self.call(self.transcriber.transcribe(&page, prompt)).await?;
        let Some(artifact) = postprocess::render(format, &transcript.text) else {
            return Err(ItemOutcome::Transient("backend returned no text".to_string()));
        };
        Ok((artifact.into_bytes(), transcript))
    }

    async fn repair_overlay(
        &self,
        unit: &WorkUnit,
        transcript_format: OutputFormat,
    ) -> Result<(Vec<u8>, Transcript), ItemOutcome> {
        let Some(text_path) = CatalogLayout::transcript_for(&unit.source, transcript_format) else {
            return Err(ItemOutcome::Transient("no transcript location".to_string()));
        };
        let boxes_json = read_text(&unit.source).await?;
        let text = read_text(&text_path).await?;
        let boxes: Vec<Word> = serde_json::from_str(&boxes_json)
            .map_err(|e| ItemOutcome::Transient(format!("malformed overlay: {e}")))?;

        let prompt = prompts::overlay_repair_prompt(&boxes_json, &text);
        let reply = self.call(self.transcriber.complete_json(&prompt)).await?;
        let corrected = apply_corrections(&boxes, &postprocess::strip_fences(&reply.text))
            .map_err(ItemOutcome::Transient)?;
        let artifact = serde_json::to_vec(&corrected)
            .map_err(|e| ItemOutcome::Transient(format!("encoding overlay: {e}")))?;
        Ok((artifact, reply))
    }

    /// Await one backend call under the per-call timeout, mapping failures
    /// onto the worker's outcomes.
    async fn call<F>(&self, call: F) -> Result<Transcript, ItemOutcome>
    where
        F: Future<Output = Result<Transcript, TranscribeError>>,
    {
        match tokio::time::timeout(self.ctx.api_timeout, call).await {
            Ok(Ok(t)) => Ok(t),
            Ok(Err(TranscribeError::QuotaExhausted(d))) => {
                Err(ItemOutcome::Retire(RetireReason::QuotaExhausted(d)))
            }
            Ok(Err(TranscribeError::Fatal(d))) => Err(ItemOutcome::Retire(RetireReason::Fatal(d))),
            Ok(Err(TranscribeError::Transient(d))) => Err(ItemOutcome::Transient(d)),
            Err(_) => Err(ItemOutcome::Transient(format!(
                "timed out after {}s",
                self.ctx.api_timeout.as_secs()
            ))),
        }
    }

    /// Drain `shard` in order until it is exhausted or the worker retires.
    pub async fn run(self, shard: Shard) -> WorkerReport {
        let total = shard.len();
        let mut report = WorkerReport::new(self.id, total);
        info!("[Worker {}] Started: {} pages assigned", self.id, total);
        if let Some(ref cb) = self.ctx.progress {
            cb.on_worker_start(self.id, total);
        }

        let state = self.drive(&shard, &mut report).await;
        report.end = state.into_end();
        info!(
            "[Worker {}] Done: {} written, {} skipped, {} failed",
            self.id, report.completed, report.skipped, report.failed
        );
        report
    }

    /// The item loop. Returns the terminal state: `Finished` once every unit
    /// has been visited, `Retired` as soon as the credential gives out.
    pub async fn drive(&self, shard: &Shard, report: &mut WorkerReport) -> WorkerState {
        let total = shard.len();
        let mut state = WorkerState::Running;

        for (i, unit) in shard.units.iter().enumerate() {
            let is_last = i + 1 == total;
            debug!("[Worker {}] Processing {}", self.id, unit.label);

            match self.process_item(unit).await {
                ItemOutcome::Written {
                    input_tokens,
                    output_tokens,
                } => {
                    report.completed += 1;
                    report.input_tokens += input_tokens;
                    report.output_tokens += output_tokens;
                    info!("[Worker {}] Saved {}", self.id, unit.destination.display());
                    if let Some(ref cb) = self.ctx.progress {
                        cb.on_item_complete(self.id, &unit.label);
                    }
                    if !is_last {
                        pause(self.ctx.throttle).await;
                    }
                }
                ItemOutcome::AlreadyComplete => {
                    report.skipped += 1;
                    debug!("[Worker {}] {} already complete", self.id, unit.label);
                    if let Some(ref cb) = self.ctx.progress {
                        cb.on_item_skipped(self.id, &unit.label);
                    }
                }
                ItemOutcome::Transient(detail) => {
                    report.failed += 1;
                    warn!("[Worker {}] Error on {}: {}", self.id, unit.label, detail);
                    if let Some(ref cb) = self.ctx.progress {
                        cb.on_item_error(self.id, &unit.label, &detail);
                    }
                    if !is_last {
                        pause(self.ctx.error_backoff).await;
                    }
                }
                ItemOutcome::Retire(reason) => {
                    warn!(
                        "[Worker {}] Retiring at {} ({}/{} done): {}",
                        self.id, unit.label, i, total, reason
                    );
                    if let Some(ref cb) = self.ctx.progress {
                        cb.on_worker_retired(self.id, &reason.to_string());
                    }
                    state = WorkerState::Retired(reason);
                    break;
                }
            }
        }

        if state == WorkerState::Running {
            state = WorkerState::Finished;
        }
        state
    }
}

async fn read_text(path: &Path) -> Result<String, ItemOutcome> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ItemOutcome::Transient(format!("reading {}: {e}", path.display())))
}

async fn pause(d: Duration) {
    if !d.is_zero() {
        sleep(d).await;
    }
}

/// Run one worker per credential over its shard and wait for all of them.
///
/// Credentials are bound sequentially before anything is spawned. A worker
/// whose credential cannot be bound is reported as retired without touching
/// its shard. A worker task that panics is reported as crashed; the others
/// keep going. Reports come back in worker order.
pub async fn run_pool(
    shards: Vec<Shard>,
    credentials: &[Credential],
    factory: Arc<dyn TranscriberFactory>,
    ctx: WorkerContext,
) -> Vec<WorkerReport> {
    let mut handles = Vec::with_capacity(shards.len());
    let mut reports = Vec::with_capacity(shards.len());

    for (shard, credential) in shards.into_iter().zip(credentials) {
        let worker_id = shard.worker_id;
        let assigned = shard.len();
        if shard.is_empty() {
            debug!("[Worker {}] Nothing assigned", worker_id);
            reports.push(WorkerReport::new(worker_id, 0));
            continue;
        }

        match factory.bind(credential) {
            Ok(transcriber) => {
                let worker = Worker::new(worker_id, transcriber, ctx.clone());
                handles.push((worker_id, assigned, tokio::spawn(worker.run(shard))));
            }
            Err(e) => {
                error!("[Worker {}] Credential {} unusable: {}", worker_id, credential, e);
                let reason = match e {
                    TranscribeError::QuotaExhausted(d) => RetireReason::QuotaExhausted(d),
                    TranscribeError::Fatal(d) | TranscribeError::Transient(d) => {
                        RetireReason::Fatal(d)
                    }
                };
                if let Some(ref cb) = ctx.progress {
                    cb.on_worker_retired(worker_id, &reason.to_string());
                }
                let mut report = WorkerReport::new(worker_id, assigned);
                report.end = WorkerEnd::Retired { reason };
                reports.push(report);
            }
        }
    }

    let (meta, joins): (Vec<_>, Vec<_>) = handles
        .into_iter()
        .map(|(id, assigned, handle)| ((id, assigned), handle))
        .unzip();
    for ((worker_id, assigned), joined) in meta.into_iter().zip(join_all(joins).await) {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!("[Worker {}] Task failed: {}", worker_id, e);
                let mut report = WorkerReport::new(worker_id, assigned);
                report.end = WorkerEnd::Crashed {
                    detail: e.to_string(),
                };
                reports.push(report);
            }
        }
    }

    reports.sort_by_key(|r| r.worker_id);
    reports
}
