//! Site index: collection → book → page count, rebuilt from disk every run.
//!
//! The static viewer loads `index.json` to draw its library shelf, so this
//! is the last pass and only ever reads the tree.

use crate::error::PipelineError;
use crate::fsio::{sorted_subdirs, to_json_pretty, write_atomic};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteIndex {
    pub collections: BTreeMap<String, BTreeMap<String, usize>>,
}

impl SiteIndex {
    /// Walk `data_dir` and count `.jpg` files in each book's `artifact_dir`.
    ///
    /// A directory counts as a book when it has an `images/` subdirectory;
    /// books with nothing to count are left out, but their collection still
    /// appears (possibly as `{}`).
    pub fn build(data_dir: &Path, artifact_dir: &str) -> Result<Self, PipelineError> {
        if !data_dir.is_dir() {
            return Err(PipelineError::CatalogRootMissing {
                path: data_dir.to_path_buf(),
            });
        }

        let mut collections = BTreeMap::new();
        for collection in sorted_subdirs(data_dir).map_err(|e| PipelineError::io(data_dir, e))? {
            let mut books = BTreeMap::new();
            for book in sorted_subdirs(&collection).map_err(|e| PipelineError::io(&collection, e))?
            {
                if !book.join("images").is_dir() {
                    continue;
                }
                let count = count_jpegs(&book.join(artifact_dir));
                if count > 0 {
                    books.insert(dir_name(&book), count);
                }
            }
            collections.insert(dir_name(&collection), books);
        }
        Ok(Self { collections })
    }

    pub fn total_pages(&self) -> usize {
        self.collections.values().flat_map(|b| b.values()).sum()
    }

    pub fn total_books(&self) -> usize {
        self.collections.values().map(|b| b.len()).sum()
    }

    /// Write `index.json` under `data_dir` and return its path.
    pub async fn write(&self, data_dir: &Path) -> Result<PathBuf, PipelineError> {
        let path = data_dir.join(INDEX_FILE);
        let json = to_json_pretty(self).map_err(|e| PipelineError::IndexWriteFailed {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        write_atomic(&path, &json)
            .await
            .map_err(|e| PipelineError::IndexWriteFailed {
                path: path.clone(),
                detail: e.to_string(),
            })?;
        info!(
            "Index saved to {} ({} books, {} pages)",
            path.display(),
            self.total_books(),
            self.total_pages()
        );
        Ok(path)
    }
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn count_jpegs(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|x| x.eq_ignore_ascii_case("jpg"))
                .unwrap_or(false)
        })
        .count()
}
