//! Work catalog: discover pending pages in the data tree.
//!
//! A page is *pending* when its destination artifact does not exist yet.
//! Nothing else is remembered between runs, so re-running after a crash,
//! a quota reset or a key swap picks up exactly where the previous run
//! stopped.
//!
//! ## Ordering
//!
//! Traversal is lexicographic by file name at every level, so the pending
//! list (and therefore every shard boundary) is identical across runs with
//! the same pending set, and pages of one book stay adjacent.

use crate::config::OutputFormat;
use crate::error::PipelineError;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One page's processing task. Immutable once enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// Page image to read.
    pub source: PathBuf,
    /// Artifact whose existence marks the unit complete.
    pub destination: PathBuf,
    /// `collection/book/file`, for log lines and progress.
    pub label: String,
}

impl WorkUnit {
    /// Completion marker check.
    pub fn is_complete(&self) -> bool {
        self.destination.exists()
    }
}

/// How source pages map to destination artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogLayout {
    /// Directory name holding page images. Default: `images`.
    pub source_dir: String,
    /// Sibling directory name receiving artifacts.
    pub dest_dir: String,
    /// Extension of the artifact, without dot.
    pub dest_extension: String,
    /// Accepted source extensions, lowercase, without dot.
    pub source_extensions: Vec<String>,
    /// Appended to the source stem in the destination name (`_clean`).
    /// Sources already carrying it are not units.
    pub dest_suffix: String,
}

impl CatalogLayout {
    pub fn new(dest_dir: impl Into<String>, dest_extension: impl Into<String>) -> Self {
        Self {
            source_dir: "images".to_string(),
            dest_dir: dest_dir.into(),
            dest_extension: dest_extension.into(),
            source_extensions: vec!["jpg".to_string(), "png".to_string()],
            dest_suffix: String::new(),
        }
    }

    /// Layout for a transcription output format.
    pub fn for_format(format: OutputFormat) -> Self {
        Self::new(format.dest_dir(), format.extension())
    }

    /// Layout for coordinate overlays (`coords/*.json`).
    pub fn coordinates() -> Self {
        Self::new("coords", "json")
    }

    /// Layout for corrected overlays: `coords/page_001.json` becomes
    /// `coords/page_001_clean.json` in the same directory.
    pub fn overlay_repair() -> Self {
        Self {
            source_dir: "coords".to_string(),
            dest_dir: "coords".to_string(),
            dest_extension: "json".to_string(),
            source_extensions: vec!["json".to_string()],
            dest_suffix: "_clean".to_string(),
        }
    }

    /// Transcript of `format` for the page whose overlay is `coords_file`.
    pub fn transcript_for(coords_file: &Path, format: OutputFormat) -> Option<PathBuf> {
        Self {
            source_dir: "coords".to_string(),
            ..Self::for_format(format)
        }
        .destination_for(coords_file)
    }

    fn accepts(&self, path: &Path) -> bool {
        if !self.dest_suffix.is_empty() {
            let derived = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.ends_with(&self.dest_suffix));
            if derived {
                return false;
            }
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_ascii_lowercase();
                self.source_extensions.iter().any(|s| *s == e)
            })
            .unwrap_or(false)
    }

    /// Destination for `source`, or `None` if `source` is not a page image
    /// sitting directly in a source directory.
    pub fn destination_for(&self, source: &Path) -> Option<PathBuf> {
        let parent = source.parent()?;
        if parent.file_name()?.to_str()? != self.source_dir {
            return None;
        }
        let stem = source.file_stem()?;
        let dest_parent = parent.with_file_name(&self.dest_dir);
        let mut name = stem.to_os_string();
        name.push(&self.dest_suffix);
        name.push(".");
        name.push(&self.dest_extension);
        Some(dest_parent.join(name))
    }
}

/// Walk `root` and return pending units in deterministic order.
///
/// `is_complete` decides whether a candidate is already satisfied; pass
/// [`WorkUnit::is_complete`] for the destination-existence rule. Destination
/// parent directories are created eagerly so workers can write without
/// existence checks.
pub fn scan<F>(
    root: &Path,
    layout: &CatalogLayout,
    is_complete: F,
) -> Result<Vec<WorkUnit>, PipelineError>
where
    F: Fn(&WorkUnit) -> bool,
{
    if !root.is_dir() {
        return Err(PipelineError::CatalogRootMissing {
            path: root.to_path_buf(),
        });
    }

    let mut pending = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut candidates = 0usize;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unreadable catalog entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() || !layout.accepts(entry.path()) {
            continue;
        }
        let source = entry.path().to_path_buf();
        let Some(destination) = layout.destination_for(&source) else {
            continue;
        };
        candidates += 1;

        if !seen.insert(destination.clone()) {
            warn!(
                "Skipping {}: destination {} already claimed by another page",
                source.display(),
                destination.display()
            );
            continue;
        }

        let unit = WorkUnit {
            label: label_for(root, &source),
            source,
            destination,
        };
        if is_complete(&unit) {
            continue;
        }

        if let Some(parent) = unit.destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        debug!("Pending: {}", unit.label);
        pending.push(unit);
    }

    info!(
        "Catalog {}: {} pages, {} pending for {}/",
        root.display(),
        candidates,
        pending.len(),
        layout.dest_dir
    );
    Ok(pending)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

/// `collection/book/file` with the source directory component dropped.
fn label_for(root: &Path, source: &Path) -> String {
    let rel = source.strip_prefix(root).unwrap_or(source);
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    match parts.len() {
        0 => source.display().to_string(),
        n if n >= 2 => {
            let mut label: Vec<&str> = parts[..n - 2].iter().map(String::as_str).collect();
            label.push(&parts[n - 1]);
            label.join("/")
        }
        _ => parts.join("/"),
    }
}
