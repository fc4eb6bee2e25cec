//! Adapters to the outside world, one concern per submodule.
//!
//! Each external tool sits behind a small trait so the passes in
//! [`crate::run`] can be exercised with in-memory fakes.
//!
//! ## Data Flow
//!
//! ```text
//! render ──▶ orient ──▶ encode ──▶ llm ──▶ postprocess
//! (pdfium)   (OSD)      (bytes)    (VLM)   (fences, HTML page)
//!               └──▶ coords (tesseract TSV)
//! ```
//!
//! 1. [`render`] — rasterise PDFs to page JPEGs; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 2. [`orient`] — detect and undo sideways or upside-down scans
//! 3. [`encode`] — load a page image and tag its MIME type for the request
//! 4. [`llm`]    — credential-bound transcribers and error classification;
//!    the only stage with network I/O
//! 5. [`postprocess`] — deterministic cleanup of model output
//! 6. [`coords`] — word bounding boxes for the viewer overlay

pub mod coords;
pub mod encode;
pub mod llm;
pub mod orient;
pub mod postprocess;
pub mod render;
