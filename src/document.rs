use crate::error::{RagError, Result};
use log::{debug, info, warn};
use mime_guess::from_path;
use pdf_extract::extract_text as extract_pdf_text;
use std::fs;
use std::path::Path;

/// Extensions whose content is used as-is
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "json", "yaml", "yml", "toml", "go", "py", "java", "js", "ts", "html", "css",
    "xml",
];

/// Bytes kept from files in formats we cannot decode
pub const RAW_PREFIX_LIMIT: usize = 10_000;

/// Text extracted from an uploaded file
#[derive(Debug, Clone)]
pub struct Document {
    /// The extracted text content
    pub content: String,
    /// Base name of the file the text came from
    pub file_name: String,
}

/// Read a file and extract its text.
///
/// Known text formats pass through unchanged, PDFs go through `pdf-extract`,
/// and anything else is reduced to its first `RAW_PREFIX_LIMIT` bytes.
pub fn extract_text<P: AsRef<Path>>(file_path: P) -> Result<Document> {
    let path = file_path.as_ref();
    let display = path.display().to_string();

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RagError::extraction(&display, "invalid file name"))?
        .to_string();

    let data = fs::read(path).map_err(|e| RagError::extraction(&display, e.to_string()))?;

    let mime_type = from_path(path).first_or_octet_stream().to_string();
    debug!("Detected MIME type: {}", mime_type);

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let content = if TEXT_EXTENSIONS.contains(&extension.as_str()) || mime_type.starts_with("text/")
    {
        info!("Processing text document: {}", display);
        String::from_utf8_lossy(&data).into_owned()
    } else if extension == "pdf" {
        info!("Processing PDF document: {}", display);
        match extract_pdf_text(path) {
            Ok(text) => {
                let cleaned = normalize_whitespace(&text);
                if cleaned.is_empty() {
                    warn!("Extracted PDF content is empty or contains only whitespace");
                }
                cleaned
            }
            Err(e) => {
                warn!("PDF extraction failed for {}: {}, using raw prefix", display, e);
                raw_prefix(&data)
            }
        }
    } else {
        info!("Unknown format for {}, using raw prefix", display);
        raw_prefix(&data)
    };

    Ok(Document { content, file_name })
}

/// First `RAW_PREFIX_LIMIT` bytes, decoded lossily
fn raw_prefix(data: &[u8]) -> String {
    let end = data.len().min(RAW_PREFIX_LIMIT);
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Normalize whitespace in text (remove multiple consecutive spaces, newlines, etc.)
fn normalize_whitespace(text: &str) -> String {
    let result = text.replace('\r', "");

    let mut prev_char = ' ';
    let mut newline_count = 0;
    let mut normalized = String::with_capacity(result.len());

    for c in result.chars() {
        if c == '\n' {
            newline_count += 1;
        } else {
            if newline_count > 0 {
                // At most one blank line between paragraphs
                if newline_count >= 2 {
                    normalized.push_str("\n\n");
                } else {
                    normalized.push('\n');
                }
                newline_count = 0;
            }

            if !(c == ' ' && prev_char == ' ') {
                normalized.push(c);
            }

            prev_char = c;
        }
    }

    normalized.trim().to_string()
}
