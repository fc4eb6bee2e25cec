//! PDF ingest: rasterise newly-added scans into `images/page_NNN.jpg`.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! The whole ingest pass runs on a blocking-pool thread so the Tokio workers
//! never stall on CPU-heavy rendering.
//!
//! ## Layout
//!
//! ```text
//! <source_root>/<collection>/<anything>-<book>.pdf
//!     ──▶ <data_dir>/<collection>/<book>/images/page_001.jpg …
//! ```
//!
//! A book whose `images/` directory already holds files is considered
//! ingested. A failed book is removed entirely so the next run retries it.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, RasterError};
use crate::fsio::write_atomic_with;
use crate::output::IngestSummary;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns a PDF into page images, handing each page to `sink` in order.
///
/// Pages are streamed rather than collected: a 600-page gazetteer at 150 DPI
/// does not fit comfortably in memory. Returns the page count. Blocking.
pub trait Rasterizer: Send + Sync {
    fn rasterize(
        &self,
        pdf: &Path,
        dpi: u32,
        sink: &mut dyn FnMut(usize, DynamicImage) -> Result<(), RasterError>,
    ) -> Result<usize, RasterError>;
}

/// Rasteriser backed by the system pdfium library.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfiumRasterizer;

impl Rasterizer for PdfiumRasterizer {
    fn rasterize(
        &self,
        pdf: &Path,
        dpi: u32,
        sink: &mut dyn FnMut(usize, DynamicImage) -> Result<(), RasterError>,
    ) -> Result<usize, RasterError> {
        let pdfium = Pdfium::default();

        let document = pdfium
            .load_pdf_from_file(pdf, None)
            .map_err(|e| RasterError::Open {
                path: pdf.to_path_buf(),
                detail: format!("{:?}", e),
            })?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        info!("PDF loaded: {} pages", total_pages);

        // PDF user space is 72 units per inch.
        let render_config = PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / 72.0);

        for (idx, page) in pages.iter().enumerate() {
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| RasterError::Page {
                    page: idx + 1,
                    detail: format!("{:?}", e),
                })?;

            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );
            sink(idx + 1, image)?;
        }

        Ok(total_pages)
    }
}

/// One PDF waiting to be ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfSource {
    pub collection: String,
    pub book_id: String,
    pub pdf: PathBuf,
}

impl PdfSource {
    pub fn images_dir(&self, data_dir: &Path) -> PathBuf {
        self.book_dir(data_dir).join("images")
    }

    pub fn book_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.collection).join(&self.book_id)
    }
}

/// Book id from a file stem: the text after the last `-`, else the stem.
///
/// `Indian_Postal_Guide-1869` → `1869`.
pub fn book_id_for(stem: &str) -> String {
    match stem.rsplit_once('-') {
        Some((_, tail)) if !tail.is_empty() => tail.to_string(),
        _ => stem.to_string(),
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<std::fs::DirEntry>, PipelineError> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|e| PipelineError::io(dir, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PipelineError::io(dir, e))?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

/// Find every `*.pdf` directly inside a collection directory of `source_root`.
///
/// Hidden directories, `data_dir` itself and names in `exclude` are not
/// collections.
pub fn discover_pdfs(
    source_root: &Path,
    data_dir: &Path,
    exclude: &[String],
) -> Result<Vec<PdfSource>, PipelineError> {
    if !source_root.is_dir() {
        return Err(PipelineError::CatalogRootMissing {
            path: source_root.to_path_buf(),
        });
    }

    let mut found = Vec::new();
    for entry in sorted_entries(source_root)? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !path.is_dir()
            || is_hidden(&name)
            || exclude.iter().any(|x| x == &name)
            || same_dir(&path, data_dir)
        {
            continue;
        }

        for file in sorted_entries(&path)? {
            let pdf = file.path();
            let is_pdf = pdf
                .extension()
                .map(|e| e.eq_ignore_ascii_case("pdf"))
                .unwrap_or(false);
            if !is_pdf || !pdf.is_file() {
                continue;
            }
            let stem = pdf
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            found.push(PdfSource {
                collection: name.clone(),
                book_id: book_id_for(&stem),
                pdf,
            });
        }
    }
    Ok(found)
}

fn already_ingested(images_dir: &Path) -> bool {
    std::fs::read_dir(images_dir)
        .map(|mut d| d.next().is_some())
        .unwrap_or(false)
}

fn ingest_one(
    rasterizer: &dyn Rasterizer,
    source: &PdfSource,
    images_dir: &Path,
    dpi: u32,
    quality: u8,
) -> Result<usize, RasterError> {
    std::fs::create_dir_all(images_dir).map_err(|e| RasterError::Save {
        path: images_dir.to_path_buf(),
        detail: e.to_string(),
    })?;

    rasterizer.rasterize(&source.pdf, dpi, &mut |page, image| {
        let path = images_dir.join(format!("page_{page:03}.jpg"));
        let rgb = image.to_rgb8();
        write_atomic_with(&path, |w| {
            JpegEncoder::new_with_quality(w, quality)
                .encode_image(&rgb)
                .map_err(std::io::Error::other)
        })
        .map_err(|e| RasterError::Save {
            path: path.clone(),
            detail: e.to_string(),
        })
    })
}

/// Rasterise every not-yet-ingested PDF. Blocking.
///
/// Per-book failures are recorded in the summary, never propagated.
pub fn ingest_blocking(
    rasterizer: &dyn Rasterizer,
    sources: &[PdfSource],
    data_dir: &Path,
    dpi: u32,
    quality: u8,
) -> IngestSummary {
    let mut summary = IngestSummary {
        documents: sources.len(),
        ..Default::default()
    };

    for source in sources {
        let images_dir = source.images_dir(data_dir);
        if already_ingested(&images_dir) {
            debug!("{} already ingested", source.pdf.display());
            summary.already_ingested += 1;
            continue;
        }

        info!(
            "[NEW] {} → {}/{}",
            source.pdf.display(),
            source.collection,
            source.book_id
        );
        match ingest_one(rasterizer, source, &images_dir, dpi, quality) {
            Ok(pages) => {
                info!("Extracted {} pages from {}", pages, source.pdf.display());
                summary.pages_written += pages;
            }
            Err(e) => {
                warn!("Ingest failed for {}: {}", source.pdf.display(), e);
                let book_dir = source.book_dir(data_dir);
                if let Err(rm) = std::fs::remove_dir_all(&book_dir) {
                    warn!("Could not remove {}: {}", book_dir.display(), rm);
                }
                summary.failed.push(source.pdf.display().to_string());
            }
        }
    }
    summary
}

/// Discover and ingest new PDFs under `config.source_root`.
pub async fn ingest(
    config: &PipelineConfig,
    rasterizer: Arc<dyn Rasterizer>,
) -> Result<IngestSummary, PipelineError> {
    let source_root = config.source_root.clone();
    let data_dir = config.data_dir.clone();
    let exclude = config.exclude.clone();
    let dpi = config.dpi;
    let quality = config.jpeg_quality;

    tokio::task::spawn_blocking(move || -> Result<IngestSummary, PipelineError> {
        let sources = discover_pdfs(&source_root, &data_dir, &exclude)?;
        info!("Found {} PDFs under {}", sources.len(), source_root.display());
        Ok(ingest_blocking(
            rasterizer.as_ref(),
            &sources,
            &data_dir,
            dpi,
            quality,
        ))
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Ingest task panicked: {}", e)))?
}
