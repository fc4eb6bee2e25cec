//! Page image loading: file on disk → bytes + MIME, base64 for the wire.
//!
//! Scanned pages are already JPEG/PNG, so they are sent as stored. Re-encoding
//! would only add generation loss to text that is often faint to begin with.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::path::Path;
use tracing::debug;

/// One page image ready to hand to a transcriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub data: Vec<u8>,
    pub mime_type: &'static str,
}

impl PageImage {
    /// Base64 body for JSON request payloads.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }

    /// Wrap for `edgequake-llm` vision messages.
    ///
    /// `detail: "high"` keeps fine print legible for providers that tile images.
    pub fn to_image_data(&self) -> ImageData {
        ImageData::new(self.to_base64(), self.mime_type).with_detail("high")
    }
}

/// MIME type for a page image, from its extension.
pub fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        _ => "image/jpeg",
    }
}

/// Read a page image from disk.
pub async fn load_page(path: &Path) -> std::io::Result<PageImage> {
    let data = tokio::fs::read(path).await?;
    debug!("Loaded {} ({} bytes)", path.display(), data.len());
    Ok(PageImage {
        data,
        mime_type: mime_for(path),
    })
}
