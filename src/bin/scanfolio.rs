//! CLI binary for scanfolio.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use scanfolio::{
    audit, build_index, ingest, overlays, repair_overlays, run_all, transcribe, AuditSummary,
    Backend, IngestSummary, OutputFormat, PipelineConfig, PipelineProgressCallback,
    ProgressCallback, RunSummary, WorkerEnd,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress for the worker pool: one bar for all workers plus a log
/// line per page. When a key retires, the pages it will not reach are taken
/// off the bar so the ETA stays honest.
struct CliProgressCallback {
    bar: ProgressBar,
    /// worker id → (assigned, finished)
    workers: Mutex<HashMap<usize, (usize, usize)>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Scanning");
        bar.set_message("Looking for pending pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            workers: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>5}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Transcribing");
        self.bar.reset_eta();
    }

    fn advance(&self, worker_id: usize) {
        if let Ok(mut w) = self.workers.lock() {
            if let Some(entry) = w.get_mut(&worker_id) {
                entry.1 += 1;
            }
        }
        self.bar.inc(1);
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, pending: usize, workers: usize) {
        self.activate_bar(pending);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{pending} pages across {workers} keys…"))
        ));
    }

    fn on_worker_start(&self, worker_id: usize, shard_len: usize) {
        if let Ok(mut w) = self.workers.lock() {
            w.insert(worker_id, (shard_len, 0));
        }
    }

    fn on_item_complete(&self, worker_id: usize, label: &str) {
        self.bar.println(format!(
            "  {} {}  {}",
            green("✓"),
            dim(&format!("[key {worker_id}]")),
            label
        ));
        self.advance(worker_id);
    }

    fn on_item_skipped(&self, worker_id: usize, _label: &str) {
        self.advance(worker_id);
    }

    fn on_item_error(&self, worker_id: usize, label: &str, error: &str) {
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {}  {}  {}",
            red("✗"),
            dim(&format!("[key {worker_id}]")),
            label,
            red(&msg)
        ));
        self.advance(worker_id);
    }

    fn on_worker_retired(&self, worker_id: usize, reason: &str) {
        let unreached = self
            .workers
            .lock()
            .ok()
            .and_then(|w| w.get(&worker_id).map(|(a, d)| a.saturating_sub(*d)))
            .unwrap_or(0);
        if let Some(len) = self.bar.length() {
            self.bar.set_length(len.saturating_sub(unreached as u64));
        }
        self.bar.println(format!(
            "  {} key {} retired: {}  {}",
            cyan("⚠"),
            worker_id,
            reason,
            dim(&format!("({unreached} pages left for the next run)"))
        ));
    }

    fn on_run_complete(&self, _completed: usize, _retired_workers: usize) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Rasterise new PDFs found in collection folders
  scanfolio ingest --source-root .

  # Transcribe pending pages with every key in keys.txt
  scanfolio transcribe -k keys.txt

  # Markdown transcripts via an edgequake-llm provider
  scanfolio transcribe --provider openai --model gpt-4.1-mini --format markdown

  # Orientation check, retrying pages tesseract failed on before
  scanfolio audit --force-recheck

  # Word boxes, then their text corrected against the Markdown transcripts
  scanfolio overlays && scanfolio repair-overlays --format markdown

  # Everything, in order: ingest, transcribe, audit, index
  scanfolio run

LAYOUT:
  processed_data/index.json
  processed_data/<collection>/<book>/images/page_001.jpg
  processed_data/<collection>/<book>/htmls/page_001.html
  processed_data/<collection>/<book>/coords/page_001.json
  processed_data/<collection>/<book>/coords/page_001_clean.json
  processed_data/<collection>/<book>/audit_log.json

  A page is done when its output file exists. Re-running any command only
  processes what is missing.

QUOTAS:
  Each key gets one worker and a contiguous share of the pending pages.
  When a key reports quota exhaustion (HTTP 429 / RESOURCE_EXHAUSTED) its
  worker stops; other keys keep going. Run again tomorrow to continue.

ENVIRONMENT VARIABLES:
  SCANFOLIO_DATA_DIR      Output tree (default: processed_data)
  SCANFOLIO_KEY_FILE      Key file (default: keys.txt)
  SCANFOLIO_MODEL         Model ID
  SCANFOLIO_PROVIDER      edgequake-llm provider instead of Gemini REST
  RUST_LOG                Overrides the log filter
"#;

/// Transcribe scanned book collections with a pool of quota-limited API keys.
#[derive(Parser, Debug)]
#[command(
    name = "scanfolio",
    version,
    about = "Transcribe scanned book collections with a pool of quota-limited API keys",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root of the processed tree.
    #[arg(long, global = true, env = "SCANFOLIO_DATA_DIR", default_value = "processed_data")]
    data_dir: PathBuf,

    /// Directory whose subfolders hold the source PDFs.
    #[arg(long, global = true, env = "SCANFOLIO_SOURCE_ROOT", default_value = ".")]
    source_root: PathBuf,

    /// File with one API key per line.
    #[arg(short, long, global = true, env = "SCANFOLIO_KEY_FILE", default_value = "keys.txt")]
    key_file: PathBuf,

    /// Vision model ID.
    #[arg(long, global = true, env = "SCANFOLIO_MODEL")]
    model: Option<String>,

    /// Use this edgequake-llm provider (openai, anthropic, gemini, …)
    /// instead of the built-in Gemini REST client.
    #[arg(long, global = true, env = "SCANFOLIO_PROVIDER")]
    provider: Option<String>,

    /// What to write per page.
    #[arg(long, global = true, env = "SCANFOLIO_FORMAT", value_enum, default_value = "html")]
    format: FormatArg,

    /// Path to a text file with a custom transcription prompt.
    #[arg(long, global = true, env = "SCANFOLIO_PROMPT")]
    prompt: Option<PathBuf>,

    /// Pause after each page, per key, in milliseconds.
    #[arg(long, global = true, env = "SCANFOLIO_THROTTLE_MS", default_value_t = 4000)]
    throttle_ms: u64,

    /// Pause after a failed page, per key, in milliseconds.
    #[arg(long, global = true, env = "SCANFOLIO_BACKOFF_MS", default_value_t = 5000)]
    backoff_ms: u64,

    /// Per-page API call timeout in seconds.
    #[arg(long, global = true, env = "SCANFOLIO_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Model temperature.
    #[arg(long, global = true, env = "SCANFOLIO_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Max output tokens per page.
    #[arg(long, global = true, env = "SCANFOLIO_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// Rasterisation DPI for ingest (72–400).
    #[arg(long, global = true, env = "SCANFOLIO_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// JPEG quality for ingested and rotated pages (1–100).
    #[arg(long, global = true, env = "SCANFOLIO_JPEG_QUALITY", default_value_t = 80,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: u8,

    /// Folder names under the source root that are not collections.
    #[arg(long, global = true, env = "SCANFOLIO_EXCLUDE", value_delimiter = ',',
          default_value = ".git,.github,scripts")]
    exclude: Vec<String>,

    /// Tesseract executable.
    #[arg(long, global = true, env = "SCANFOLIO_TESSERACT", default_value = "tesseract")]
    tesseract: String,

    /// Re-examine images previously recorded as skipped_error.
    #[arg(long, global = true, env = "SCANFOLIO_FORCE_RECHECK")]
    force_recheck: bool,

    /// Per-book directory whose .jpg files the index counts.
    #[arg(long, global = true, env = "SCANFOLIO_INDEX_DIR", default_value = "images")]
    index_dir: String,

    /// Print the summary as JSON.
    #[arg(long, global = true, env = "SCANFOLIO_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "SCANFOLIO_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "SCANFOLIO_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "SCANFOLIO_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Rasterise new PDFs into page images.
    Ingest,
    /// Transcribe pending pages, one worker per key.
    Transcribe,
    /// Check page orientation and rotate where needed.
    Audit,
    /// Write word bounding boxes for pages that lack them.
    Overlays,
    /// Correct overlay text against transcripts, one worker per key.
    RepairOverlays,
    /// Rebuild index.json.
    Index,
    /// Ingest, transcribe, audit and index.
    Run,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Html,
    Markdown,
}

impl From<FormatArg> for OutputFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Html => OutputFormat::Html,
            FormatArg::Markdown => OutputFormat::Markdown,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let uses_pool = matches!(
        cli.command,
        Command::Transcribe | Command::RepairOverlays | Command::Run
    );
    let show_progress = uses_pool && !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;

    match cli.command {
        Command::Ingest => {
            let s = ingest(&config).await.context("Ingest failed")?;
            report(&cli, &s, || print_ingest(&s))?;
        }
        Command::Transcribe => {
            let s = transcribe(&config).await.context("Transcription failed")?;
            report(&cli, &s, || print_run(&s, "transcribed"))?;
        }
        Command::Audit => {
            let s = audit(&config).await.context("Orientation pass failed")?;
            report(&cli, &s, || match s {
                Some(ref a) => print_audit(a),
                None => eprintln!("{} tesseract not available; orientation pass skipped", cyan("⚠")),
            })?;
        }
        Command::Overlays => {
            let s = overlays(&config).await.context("Overlay pass failed")?;
            report(&cli, &s, || {
                eprintln!(
                    "{} {} overlays written, {} failed",
                    if s.failed == 0 { green("✔") } else { cyan("⚠") },
                    bold(&s.written.to_string()),
                    s.failed
                )
            })?;
        }
        Command::RepairOverlays => {
            let s = repair_overlays(&config).await.context("Overlay repair failed")?;
            report(&cli, &s, || print_run(&s, "repaired"))?;
        }
        Command::Index => {
            let (index, path) = build_index(&config).await.context("Index build failed")?;
            report(&cli, &index, || {
                eprintln!(
                    "{} {} books, {} pages  →  {}",
                    green("✔"),
                    index.total_books(),
                    index.total_pages(),
                    bold(&path.display().to_string())
                )
            })?;
        }
        Command::Run => {
            let r = run_all(&config).await.context("Pipeline failed")?;
            report(&cli, &r, || {
                print_ingest(&r.ingest);
                print_run(&r.transcription, "transcribed");
                if let Some(ref a) = r.audit {
                    print_audit(a);
                }
                eprintln!(
                    "{} index: {} books, {} pages  →  {}",
                    green("✔"),
                    r.books,
                    r.pages,
                    bold(&r.index_path.display().to_string())
                );
            })?;
        }
    }

    Ok(())
}

/// Print `value` as JSON with `--json`, otherwise run `human` unless quiet.
fn report<T: serde::Serialize>(cli: &Cli, value: &T, human: impl FnOnce()) -> Result<()> {
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(value).context("Failed to serialise summary")?
        );
    } else if !cli.quiet {
        human();
    }
    Ok(())
}

fn print_ingest(s: &IngestSummary) {
    eprintln!(
        "{} ingest: {} new pages from {} PDFs  {}",
        if s.failed.is_empty() { green("✔") } else { cyan("⚠") },
        bold(&s.pages_written.to_string()),
        s.documents - s.already_ingested,
        dim(&format!("({} already ingested)", s.already_ingested))
    );
    for f in &s.failed {
        eprintln!("  {} {}", red("✗"), f);
    }
}

fn print_run(s: &RunSummary, done: &str) {
    let mark = if s.failed == 0 && s.retired_workers == 0 {
        green("✔")
    } else {
        cyan("⚠")
    };
    eprintln!(
        "{} {}/{} pages {}  {}ms",
        mark,
        bold(&s.completed.to_string()),
        s.pending,
        done,
        s.duration_ms
    );
    for w in &s.workers {
        let end = match &w.end {
            WorkerEnd::Finished => green("finished"),
            WorkerEnd::Retired { reason } => cyan(&format!("retired: {reason}")),
            WorkerEnd::Crashed { detail } => red(&format!("crashed: {detail}")),
        };
        eprintln!(
            "   key {:>2}  {:>4}/{:<4}  {}  {}",
            w.worker_id,
            w.completed,
            w.assigned,
            end,
            dim(&format!("{} in / {} out tokens", w.input_tokens, w.output_tokens))
        );
    }
    if s.remaining() > 0 {
        eprintln!(
            "   {} pages still pending; run again when quotas reset",
            bold(&s.remaining().to_string())
        );
    }
}

fn print_audit(a: &AuditSummary) {
    eprintln!(
        "{} orientation: {} books, {} checked, {} rotated, {} errors  {}",
        if a.skipped_error == 0 { green("✔") } else { cyan("⚠") },
        a.books,
        a.examined(),
        a.rotated,
        a.skipped_error,
        dim(&format!("({} cached)", a.cached))
    );
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let prompt = if let Some(ref path) = cli.prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let backend = match cli.provider {
        Some(ref name) => Backend::Llm(name.clone()),
        None => Backend::Gemini,
    };

    let mut builder = PipelineConfig::builder()
        .data_dir(&cli.data_dir)
        .source_root(&cli.source_root)
        .key_file(&cli.key_file)
        .backend(backend)
        .output_format(cli.format.into())
        .throttle_ms(cli.throttle_ms)
        .error_backoff_ms(cli.backoff_ms)
        .api_timeout_secs(cli.api_timeout)
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .dpi(cli.dpi)
        .jpeg_quality(cli.jpeg_quality)
        .exclude(cli.exclude.clone())
        .tesseract_cmd(&cli.tesseract)
        .force_recheck(cli.force_recheck)
        .index_artifact_dir(&cli.index_dir);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(p) = prompt {
        builder = builder.prompt(p);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
