//! Orientation check and correction for page images.
//!
//! Scans come off the flatbed sideways or upside-down often enough that the
//! transcription model gets garbage. Tesseract's orientation-and-script
//! detection (`--psm 0`) reports how far the page must be turned clockwise;
//! we turn it and rewrite the JPEG in place.

use crate::error::ProbeError;
use crate::fsio::write_atomic_with;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Reports the clockwise rotation (0, 90, 180 or 270) a page needs.
///
/// Blocking; callers run it from `spawn_blocking`.
pub trait OrientationProbe: Send + Sync {
    fn detect(&self, image: &Path) -> Result<u16, ProbeError>;

    /// Whether the probe can run at all. When it cannot, the pass is skipped
    /// instead of recording every image as `skipped_error`.
    fn is_available(&self) -> bool {
        true
    }
}

/// True when `command --version` runs successfully.
pub(crate) fn tool_available(command: &str) -> bool {
    Command::new(command)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Orientation probe backed by the `tesseract` binary.
#[derive(Debug, Clone)]
pub struct TesseractProbe {
    command: String,
}

impl TesseractProbe {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for TesseractProbe {
    fn default() -> Self {
        Self::new("tesseract")
    }
}

impl OrientationProbe for TesseractProbe {
    fn detect(&self, image: &Path) -> Result<u16, ProbeError> {
        let output = Command::new(&self.command)
            .arg(image)
            .arg("stdout")
            .args(["--psm", "0", "-c", "min_characters_to_try=5"])
            .output();

        let output = match output {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProbeError::ToolNotFound(format!(
                    "{} (install tesseract-ocr)",
                    self.command
                )))
            }
            Err(e) => return Err(ProbeError::Io(e)),
        };

        if !output.status.success() {
            return Err(ProbeError::DetectionFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let angle = parse_osd(&String::from_utf8_lossy(&output.stdout))?;
        debug!("OSD {} → rotate {}", image.display(), angle);
        Ok(angle)
    }

    fn is_available(&self) -> bool {
        tool_available(&self.command)
    }
}

static RE_ROTATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^Rotate:\s*(-?\d+)").unwrap());

/// Pull the `Rotate:` angle out of tesseract's OSD report.
pub fn parse_osd(report: &str) -> Result<u16, ProbeError> {
    let caps = RE_ROTATE
        .captures(report)
        .ok_or_else(|| ProbeError::DetectionFailed("no Rotate line in OSD output".into()))?;
    let angle: i32 = caps[1]
        .parse()
        .map_err(|_| ProbeError::DetectionFailed(format!("bad angle '{}'", &caps[1])))?;
    match angle {
        0 | 90 | 180 | 270 => Ok(angle as u16),
        other => Err(ProbeError::UnsupportedAngle(other)),
    }
}

/// Turn `img` clockwise by a right angle.
pub fn rotate_clockwise(img: &DynamicImage, angle: u16) -> Result<DynamicImage, ProbeError> {
    match angle {
        0 => Ok(img.clone()),
        90 => Ok(img.rotate90()),
        180 => Ok(img.rotate180()),
        270 => Ok(img.rotate270()),
        other => Err(ProbeError::UnsupportedAngle(other as i32)),
    }
}

/// Rotate the JPEG at `path` clockwise in place, re-encoding at `quality`.
pub fn rotate_file(path: &Path, angle: u16, quality: u8) -> Result<(), ProbeError> {
    let img = image::open(path).map_err(|e| ProbeError::RotateFailed(e.to_string()))?;
    let rotated = rotate_clockwise(&img, angle)?.to_rgb8();
    write_atomic_with(path, |w| {
        JpegEncoder::new_with_quality(w, quality)
            .encode_image(&rotated)
            .map_err(std::io::Error::other)
    })
    .map_err(|e| ProbeError::RotateFailed(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn parses_rotate_line() {
        let report = "Page number: 0\nOrientation in degrees: 270\nRotate: 90\nOrientation confidence: 3.12\n";
        assert_eq!(parse_osd(report).unwrap(), 90);
    }

    #[test]
    fn upright_page_is_zero() {
        assert_eq!(parse_osd("Rotate: 0\n").unwrap(), 0);
    }

    #[test]
    fn missing_rotate_line_fails() {
        assert!(matches!(
            parse_osd("Too few characters. Skipping this page\n"),
            Err(ProbeError::DetectionFailed(_))
        ));
    }

    #[test]
    fn odd_angle_rejected() {
        assert!(matches!(
            parse_osd("Rotate: 45\n"),
            Err(ProbeError::UnsupportedAngle(45))
        ));
    }

    #[test]
    fn missing_binary_is_tool_not_found() {
        let probe = TesseractProbe::new("scanfolio-no-such-binary");
        assert!(!probe.is_available());
        let err = probe.detect(Path::new("page.jpg")).unwrap_err();
        assert!(matches!(err, ProbeError::ToolNotFound(_)));
    }

    #[test]
    fn rotate_file_swaps_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page_001.jpg");
        RgbImage::from_pixel(40, 20, Rgb([200, 200, 200]))
            .save(&path)
            .unwrap();

        rotate_file(&path, 90, 80).unwrap();

        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (20, 40));
    }
}
