//! Word-level bounding boxes for the page viewer's text overlay.
//!
//! The viewer lays transparent, selectable words over the scan. It needs
//! pixel boxes, which the transcription model does not give, so a second
//! OCR pass with tesseract's TSV output supplies them.

use super::orient::tool_available;
use crate::error::ExtractError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;

/// One recognised word and its box in image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub conf: f32,
}

/// Extracts word boxes from a page image. Blocking.
pub trait CoordinateExtractor: Send + Sync {
    fn extract(&self, image: &Path) -> Result<Vec<Word>, ExtractError>;

    fn is_available(&self) -> bool {
        true
    }
}

/// `tesseract <image> stdout tsv`.
#[derive(Debug, Clone)]
pub struct TesseractTsv {
    command: String,
}

impl TesseractTsv {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for TesseractTsv {
    fn default() -> Self {
        Self::new("tesseract")
    }
}

impl CoordinateExtractor for TesseractTsv {
    fn extract(&self, image: &Path) -> Result<Vec<Word>, ExtractError> {
        let output = Command::new(&self.command)
            .arg(image)
            .args(["stdout", "tsv"])
            .output();

        match output {
            Ok(o) if o.status.success() => Ok(parse_tsv(&String::from_utf8_lossy(&o.stdout))),
            Ok(o) => Err(ExtractError::ExtractionFailed(format!(
                "tesseract failed: {}",
                String::from_utf8_lossy(&o.stderr).trim()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ExtractError::ToolNotFound(
                format!("{} (install tesseract-ocr)", self.command),
            )),
            Err(e) => Err(ExtractError::Io(e)),
        }
    }

    fn is_available(&self) -> bool {
        tool_available(&self.command)
    }
}

/// Parse tesseract TSV, keeping rows with positive confidence and real text.
///
/// Columns: level page_num block_num par_num line_num word_num left top
/// width height conf text. Malformed rows are dropped.
pub fn parse_tsv(tsv: &str) -> Vec<Word> {
    tsv.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.splitn(12, '\t').collect();
            if cols.len() < 12 {
                return None;
            }
            let text = cols[11].trim();
            let conf: f32 = cols[10].trim().parse().ok()?;
            if conf <= 0.0 || text.is_empty() {
                return None;
            }
            Some(Word {
                text: text.to_string(),
                x: cols[6].parse().ok()?,
                y: cols[7].parse().ok()?,
                w: cols[8].parse().ok()?,
                h: cols[9].parse().ok()?,
                conf,
            })
        })
        .collect()
}

/// A box as the repair model returns it. `conf` is not trusted from the reply.
#[derive(Debug, Deserialize)]
struct CorrectedWord {
    text: String,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
}

/// Apply a model's corrected word list to the original boxes.
///
/// Every returned box must sit exactly on one of `original`'s boxes and
/// takes that box's confidence; blanked entries are dropped. The reply is
/// rejected whole if it is not a JSON word list, moves a box, or leaves
/// no words at all.
pub fn apply_corrections(original: &[Word], reply: &str) -> Result<Vec<Word>, String> {
    let corrected: Vec<CorrectedWord> =
        serde_json::from_str(reply.trim()).map_err(|e| format!("reply is not a word list: {e}"))?;

    let mut words = Vec::with_capacity(corrected.len());
    for c in corrected {
        let Some(source) = original
            .iter()
            .find(|o| (o.x, o.y, o.w, o.h) == (c.x, c.y, c.w, c.h))
        else {
            return Err(format!(
                "reply moved a box to x={} y={} w={} h={}",
                c.x, c.y, c.w, c.h
            ));
        };
        let text = c.text.trim();
        if text.is_empty() {
            continue;
        }
        words.push(Word {
            text: text.to_string(),
            ..source.clone()
        });
    }

    if words.is_empty() && !original.is_empty() {
        return Err("reply kept no words".to_string());
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t1240\t1754\t-1\t
5\t1\t1\t1\t1\t1\t102\t88\t140\t31\t91.5\tGAZETTEER
5\t1\t1\t1\t1\t2\t260\t88\t40\t31\t0\tof
5\t1\t1\t1\t1\t3\t310\t88\t90\t31\t87\t
5\t1\t1\t1\t1\t4\t410\t88\t120\t31\t78.25\tMooltan
";

    #[test]
    fn keeps_confident_words_only() {
        let words = parse_tsv(SAMPLE);
        let texts: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["GAZETTEER", "Mooltan"]);
        assert_eq!(
            words[0],
            Word {
                text: "GAZETTEER".into(),
                x: 102,
                y: 88,
                w: 140,
                h: 31,
                conf: 91.5
            }
        );
    }

    #[test]
    fn empty_output_yields_no_words() {
        assert!(parse_tsv("").is_empty());
    }

    #[test]
    fn serialises_with_overlay_keys() {
        let w = Word {
            text: "Agra".into(),
            x: 1,
            y: 2,
            w: 3,
            h: 4,
            conf: 90.0,
        };
        let v = serde_json::to_value(&w).unwrap();
        for key in ["text", "x", "y", "w", "h", "conf"] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
    }

    fn boxes() -> Vec<Word> {
        vec![
            Word { text: "P0st".into(), x: 10, y: 5, w: 40, h: 12, conf: 61.0 },
            Word { text: "0ff".into(), x: 55, y: 5, w: 20, h: 12, conf: 40.0 },
            Word { text: "ice".into(), x: 76, y: 5, w: 18, h: 12, conf: 35.0 },
        ]
    }

    #[test]
    fn corrections_keep_geometry_and_confidence() {
        let reply = r#"[
            {"text": "POST", "x": 10, "y": 5, "w": 40, "h": 12},
            {"text": "OFFICE", "x": 55, "y": 5, "w": 20, "h": 12, "conf": 99},
            {"text": "", "x": 76, "y": 5, "w": 18, "h": 12}
        ]"#;
        let words = apply_corrections(&boxes(), reply).unwrap();

        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "POST");
        assert_eq!((words[1].x, words[1].w, words[1].conf), (55, 20, 40.0));
    }

    #[test]
    fn moved_box_or_prose_reply_is_rejected() {
        let moved = r#"[{"text": "POST", "x": 11, "y": 5, "w": 40, "h": 12}]"#;
        assert!(apply_corrections(&boxes(), moved).unwrap_err().contains("moved"));
        assert!(apply_corrections(&boxes(), "Here are the fixed words:").is_err());
        assert!(apply_corrections(&boxes(), "[]").is_err());
    }

    #[test]
    fn missing_binary_is_tool_not_found() {
        let err = TesseractTsv::new("scanfolio-no-such-binary")
            .extract(Path::new("x.jpg"))
            .unwrap_err();
        assert!(matches!(err, ExtractError::ToolNotFound(_)));
    }
}
