//! Plain-text extraction for input documents.
//!
//! The format is picked from the file extension: `.pdf` goes through
//! `pdf-extract`, `.docx` through `zip` + `quick-xml`, and everything
//! else is read as UTF-8 text (markdown included). Paragraph breaks are
//! kept so the segmenter can split on them.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Input formats understood by [`load_document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Text,
    Pdf,
    Docx,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("pdf") => DocumentFormat::Pdf,
            Some("docx") => DocumentFormat::Docx,
            _ => DocumentFormat::Text,
        }
    }
}

#[derive(Debug)]
pub enum ExtractError {
    Utf8(String),
    Pdf(String),
    Docx(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Utf8(e) => write!(f, "text is not valid UTF-8: {}", e),
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Docx(e) => write!(f, "DOCX extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Read `path` and return its text.
pub fn load_document(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let format = DocumentFormat::from_path(path);
    tracing::debug!(path = %path.display(), ?format, bytes = bytes.len(), "extracting text");
    extract_text(&bytes, format).with_context(|| format!("Failed to extract {}", path.display()))
}

/// Extract plain text from raw bytes of the given format.
pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> Result<String, ExtractError> {
    match format {
        DocumentFormat::Text => String::from_utf8(bytes.to_vec())
            .map(|s| s.replace("\r\n", "\n"))
            .map_err(|e| ExtractError::Utf8(e.to_string())),
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Docx => extract_docx(bytes),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_paragraphs(&doc_xml)
}

/// Collect `<w:t>` runs, one paragraph per `<w:p>`, separated by blank lines.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let text = current.trim();
                    if !text.is_empty() {
                        paragraphs.push(text.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    let tail = current.trim();
    if !tail.is_empty() {
        paragraphs.push(tail.to_string());
    }
    Ok(paragraphs.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with(document_xml: &str) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("word/document.xml", options).unwrap();
            zip.write_all(document_xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(DocumentFormat::from_path(Path::new("a.PDF")), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::from_path(Path::new("a.docx")), DocumentFormat::Docx);
        assert_eq!(DocumentFormat::from_path(Path::new("notes.md")), DocumentFormat::Text);
        assert_eq!(DocumentFormat::from_path(Path::new("README")), DocumentFormat::Text);
    }

    #[test]
    fn text_normalises_line_endings() {
        let text = extract_text(b"one\r\n\r\ntwo", DocumentFormat::Text).unwrap();
        assert_eq!(text, "one\n\ntwo");
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let err = extract_text(&[0xff, 0xfe], DocumentFormat::Text).unwrap_err();
        assert!(matches!(err, ExtractError::Utf8(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_text(b"not a pdf", DocumentFormat::Pdf).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_text(b"not a zip", DocumentFormat::Docx).unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
    }

    #[test]
    fn docx_paragraphs_become_blank_line_separated() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t xml:space="preserve"> world.</w:t></w:r></w:p>
    <w:p><w:r><w:t>Second &amp; last.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let text = extract_text(&docx_with(xml), DocumentFormat::Docx).unwrap();
        assert_eq!(text, "Hello world.\n\nSecond & last.");
    }
}
