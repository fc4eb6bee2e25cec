//! All-or-nothing file writes.
//!
//! Destination existence is the completion marker for every pass, so a
//! destination path must never hold a half-written file. Both helpers write
//! to a uniquely named `tempfile` in the destination directory and persist
//! it over the destination; a crash leaves at most a stray `.tmp*` file.

use std::io::Write;
use std::path::{Path, PathBuf};

/// Atomically replace `path` with `bytes` (async).
///
/// Runs [`write_atomic_with`] on the blocking pool, so concurrent writers of
/// one destination each get their own temp file and the last rename wins
/// with complete content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || write_atomic_with(&path, |w| w.write_all(&bytes)))
        .await
        .map_err(|e| std::io::Error::other(format!("write task failed: {e}")))?
}

/// Atomically replace `path` with whatever `fill` writes (blocking).
///
/// Used from `spawn_blocking` sections (ingest, rotation) where the encoder
/// wants an `io::Write` rather than a finished buffer.
pub fn write_atomic_with<F>(path: &Path, fill: F) -> std::io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
{
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    {
        let mut writer = std::io::BufWriter::new(tmp.as_file_mut());
        fill(&mut writer)?;
        writer.flush()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Non-hidden subdirectories of `dir`, sorted by path.
pub fn sorted_subdirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Pretty JSON with four-space indentation, the format of every JSON file
/// the site reads (`audit_log.json`, `index.json`).
pub fn to_json_pretty<T: serde::Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    buf.push(b'\n');
    Ok(buf)
}
