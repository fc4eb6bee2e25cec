//! Transcription prompts, the overlay-repair prompt, and the stylesheet
//! pages are wrapped in.
//!
//! Every page of a run receives the same fixed prompt; callers can override
//! it via [`crate::config::PipelineConfig::prompt`]. The constants here are
//! used only when no override is provided.

/// Default prompt for [`crate::config::OutputFormat::Html`].
///
/// The model returns only the inner body markup; the page shell and
/// stylesheet are added by [`crate::pipeline::postprocess::wrap_html`], so
/// every page of a collection renders with identical styling.
pub const HTML_PROMPT: &str = r#"Look at this image of a scanned historical document page.
Reproduce it EXACTLY as an HTML web page.

RULES:
1. Do not include <html>, <head>, or <body> tags. Just give the inner content.
2. Use semantic tags: <h1>, <h2>, <table>, <p>, <hr>.
3. Use classes: 'center', 'right', 'bold', 'italic', 'small'.
4. Transcribe spelling EXACTLY. Do not modernise names or places.
5. OUTPUT FORMAT: HTML code only. No commentary."#;

/// Default prompt for [`crate::config::OutputFormat::Markdown`].
pub const MARKDOWN_PROMPT: &str = r#"Transcribe this image into clean Markdown text.

RULES:
1. Preserve original spelling exactly. Do not modernise.
2. If there is a table, format it as a Markdown table.
3. STRICTLY NO LATEX or math formatting (no $ symbols, no \rule).
4. If you see a horizontal divider line, just use "---".
5. Do not describe visual ornaments; just skip them.
6. Do NOT wrap the output in ```markdown fences."#;

/// Instructions for correcting tesseract word boxes against a transcript.
/// [`overlay_repair_prompt`] appends the two inputs.
pub const OVERLAY_REPAIR_PROMPT: &str = r#"I have two inputs:
1. A JSON list of words with pixel boxes from a fast OCR engine. Its text is full of errors.
2. A clean transcript of the same page.

Return the SAME JSON list, replacing the "text" of each object with the correct spelling from the transcript.

RULES:
1. Do NOT change "x", "y", "w" or "h". Keep every box's geometry exact.
2. Align the clean words to the boxes as well as you can.
3. If the OCR split one word over several boxes, put the full word in the first box and drop the others.
4. Output ONLY valid JSON. No Markdown fences, no commentary."#;

/// Full repair request: instructions, the raw boxes, then the transcript.
pub fn overlay_repair_prompt(boxes_json: &str, transcript: &str) -> String {
    format!(
        "{OVERLAY_REPAIR_PROMPT}\n\n--- OCR BOXES (source of truth for geometry) ---\n{boxes_json}\n\n--- CLEAN TEXT (source of truth for spelling) ---\n{transcript}\n"
    )
}

/// Stylesheet embedded in every generated HTML page.
pub const PAGE_STYLESHEET: &str = r#"<style>
    body {
        font-family: 'Georgia', 'Times New Roman', serif;
        background-color: #fdfbf7;
        color: #1a1a1a;
        line-height: 1.4;
        padding: 40px;
        max-width: 800px;
        margin: auto;
        box-shadow: 0 0 20px rgba(0,0,0,0.1);
    }
    h1, h2, h3 { text-align: center; text-transform: uppercase; font-weight: normal; letter-spacing: 2px; margin-bottom: 30px; }
    h1 { font-size: 24px; border-bottom: 2px double black; padding-bottom: 10px; }
    h2 { font-size: 18px; }
    p { margin-bottom: 15px; text-align: justify; }
    table { width: 100%; border-collapse: collapse; margin: 20px 0; font-size: 14px; border: 2px solid black; }
    th { border: 1px solid black; padding: 8px; text-transform: uppercase; font-size: 12px; background: #eee; }
    td { border: 1px solid black; padding: 8px; vertical-align: top; }
    .center { text-align: center; }
    .right { text-align: right; }
    .small { font-size: 12px; }
    .bold { font-weight: bold; }
    .italic { font-style: italic; }
    hr { border: 0; border-top: 1px solid black; margin: 20px 0; }
</style>"#;
