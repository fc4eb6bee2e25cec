//! Per-book audit ledger for the orientation pass.
//!
//! Running tesseract OSD over a 600-page book takes minutes, so every image
//! that has been judged once is remembered in `<book>/audit_log.json` and
//! never examined again:
//!
//! ```json
//! {
//!     "page_001.jpg": "checked_ok",
//!     "page_002.jpg": "rotated_90",
//!     "page_003.jpg": "skipped_error"
//! }
//! ```
//!
//! The ledger is rewritten in full, atomically, and only when new entries
//! were added. A ledger that cannot be parsed is treated as empty for that
//! book; the pass re-judges its images and writes a valid one.

use crate::error::LedgerError;
use crate::fsio::{sorted_subdirs, to_json_pretty, write_atomic_with};
use crate::output::AuditSummary;
use crate::pipeline::orient::{rotate_file, OrientationProbe};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const LEDGER_FILE: &str = "audit_log.json";

/// Outcome recorded for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AuditStatus {
    CheckedOk,
    /// Turned clockwise by this many degrees.
    Rotated(u16),
    SkippedError,
}

impl From<AuditStatus> for String {
    fn from(s: AuditStatus) -> Self {
        match s {
            AuditStatus::CheckedOk => "checked_ok".to_string(),
            AuditStatus::Rotated(a) => format!("rotated_{a}"),
            AuditStatus::SkippedError => "skipped_error".to_string(),
        }
    }
}

impl TryFrom<String> for AuditStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "checked_ok" => Ok(Self::CheckedOk),
            "skipped_error" => Ok(Self::SkippedError),
            other => other
                .strip_prefix("rotated_")
                .and_then(|a| a.parse::<u16>().ok())
                .filter(|a| matches!(a, 90 | 180 | 270))
                .map(Self::Rotated)
                .ok_or_else(|| format!("unknown audit status '{other}'")),
        }
    }
}

/// Image file name → status, for one book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditLedger {
    entries: BTreeMap<String, AuditStatus>,
}

impl AuditLedger {
    pub fn path_for(book_dir: &Path) -> PathBuf {
        book_dir.join(LEDGER_FILE)
    }

    /// Read a ledger, distinguishing "absent" (empty) from "unreadable".
    pub fn read(path: &Path) -> Result<Self, LedgerError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(LedgerError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|e| LedgerError::Malformed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Read a ledger, falling back to empty on any problem.
    pub fn load(path: &Path) -> Self {
        Self::read(path).unwrap_or_else(|e| {
            warn!("{}; starting this book's ledger over", e);
            Self::default()
        })
    }

    /// Write the full ledger as pretty JSON with sorted keys.
    pub fn persist(&self, path: &Path) -> std::io::Result<()> {
        let json = to_json_pretty(self).map_err(std::io::Error::other)?;
        write_atomic_with(path, |w| w.write_all(&json))
    }

    pub fn get(&self, key: &str) -> Option<AuditStatus> {
        self.entries.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, status: AuditStatus) {
        self.entries.insert(key.into(), status);
    }

    /// Forget every `skipped_error` entry so those images are probed again.
    /// Returns how many were dropped.
    pub fn forget_errors(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, s| *s != AuditStatus::SkippedError);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, AuditStatus)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Settings for one orientation pass.
#[derive(Debug, Clone, Copy)]
pub struct AuditOptions {
    pub jpeg_quality: u8,
    pub force_recheck: bool,
}

fn is_jpeg(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map(|e| e.eq_ignore_ascii_case("jpg"))
        .unwrap_or(false)
}

/// `images/*.jpg` names in lexicographic order.
fn list_images(images_dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(images_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| is_jpeg(n))
        .collect();
    names.sort();
    Ok(names)
}

fn judge(probe: &dyn OrientationProbe, image: &Path, quality: u8) -> AuditStatus {
    let angle = match probe.detect(image) {
        Ok(a) => a,
        Err(e) => {
            warn!("Orientation check failed for {}: {}", image.display(), e);
            return AuditStatus::SkippedError;
        }
    };
    if angle == 0 {
        return AuditStatus::CheckedOk;
    }
    info!("Rotating {} by {}°", image.display(), angle);
    match rotate_file(image, angle, quality) {
        Ok(()) => AuditStatus::Rotated(angle),
        Err(e) => {
            warn!("{}", e);
            AuditStatus::SkippedError
        }
    }
}

/// Run the orientation pass over one book directory. Blocking.
///
/// Never fails: every per-image problem becomes a `skipped_error` entry and
/// a ledger write failure is logged.
pub fn audit_book(
    book_dir: &Path,
    probe: &dyn OrientationProbe,
    opts: AuditOptions,
    summary: &mut AuditSummary,
) {
    let images_dir = book_dir.join("images");
    let images = match list_images(&images_dir) {
        Ok(v) => v,
        Err(e) => {
            warn!("Cannot list {}: {}", images_dir.display(), e);
            return;
        }
    };

    let ledger_path = AuditLedger::path_for(book_dir);
    let mut ledger = AuditLedger::load(&ledger_path);
    let mut added = 0usize;
    if opts.force_recheck {
        // Dropped entries count as changes even if nothing is re-added.
        added += ledger.forget_errors();
    }
    summary.books += 1;
    debug!(
        "Checking {} ({} pages, {} known)",
        book_dir.display(),
        images.len(),
        ledger.len()
    );

    for name in images {
        if ledger.contains(&name) {
            summary.cached += 1;
            continue;
        }
        let status = judge(probe, &images_dir.join(&name), opts.jpeg_quality);
        match status {
            AuditStatus::CheckedOk => summary.checked_ok += 1,
            AuditStatus::Rotated(_) => summary.rotated += 1,
            AuditStatus::SkippedError => summary.skipped_error += 1,
        }
        ledger.insert(name, status);
        added += 1;
    }

    if added > 0 {
        match ledger.persist(&ledger_path) {
            Ok(()) => summary.ledgers_written += 1,
            Err(e) => warn!("Failed to write {}: {}", ledger_path.display(), e),
        }
    }
}

/// Book directories under `data_dir`: `<collection>/<book>` with an
/// `images/` subdirectory, sorted, hidden entries skipped.
pub fn book_dirs(data_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut books = Vec::new();
    for collection in sorted_subdirs(data_dir)? {
        for book in sorted_subdirs(&collection)? {
            if book.join("images").is_dir() {
                books.push(book);
            }
        }
    }
    Ok(books)
}

/// Run the orientation pass over every book, one at a time. Blocking.
pub fn audit_all(
    data_dir: &Path,
    probe: &dyn OrientationProbe,
    opts: AuditOptions,
) -> std::io::Result<AuditSummary> {
    let mut summary = AuditSummary::default();
    for book in book_dirs(data_dir)? {
        audit_book(&book, probe, opts, &mut summary);
    }
    info!(
        "Orientation pass: {} books, {} examined ({} rotated, {} errors), {} cached",
        summary.books,
        summary.examined(),
        summary.rotated,
        summary.skipped_error,
        summary.cached
    );
    Ok(summary)
}
