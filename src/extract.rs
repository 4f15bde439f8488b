//! Text extraction for corpus documents.
//!
//! The sync pipeline consumes extraction through the [`Extractor`] trait so
//! tests (and alternative parsers) can stand in for the local one.
//! [`LocalExtractor`] handles every [`DocumentFormat`]:
//!
//! | Format | Method |
//! |--------|--------|
//! | Markdown | UTF-8, YAML front matter split into metadata |
//! | Plain text, CSV | UTF-8 as-is |
//! | PDF | `pdf-extract` |
//! | DOCX | `word/document.xml` `<w:t>` runs |
//! | PPTX | `ppt/slides/slideN.xml` `<a:t>` runs, in slide order |
//!
//! A document that is readable but has nothing to index (for example a
//! `.txt` file holding binary data) yields [`Extraction::Skipped`]. A
//! document that cannot be parsed yields an [`ExtractError`]; the pipeline
//! reports it as failed and moves on.

use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::DocumentFormat;

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    /// Front-matter fields for markdown, empty otherwise.
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Text(ExtractedText),
    Skipped { reason: String },
}

pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path, format: DocumentFormat) -> Result<Extraction, ExtractError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExtractor;

impl Extractor for LocalExtractor {
    fn extract(&self, path: &Path, format: DocumentFormat) -> Result<Extraction, ExtractError> {
        let bytes = std::fs::read(path).map_err(|source| ExtractError::Io {
            path: path.display().to_string(),
            source,
        })?;
        extract_bytes(&bytes, format)
    }
}

/// Extract text from in-memory content of a known format.
pub fn extract_bytes(bytes: &[u8], format: DocumentFormat) -> Result<Extraction, ExtractError> {
    match format {
        DocumentFormat::Markdown => Ok(match std::str::from_utf8(bytes) {
            Ok(s) => {
                let (metadata, body) = split_front_matter(s);
                Extraction::Text(ExtractedText {
                    text: body.to_string(),
                    metadata,
                })
            }
            Err(_) => not_utf8(),
        }),
        DocumentFormat::PlainText | DocumentFormat::Csv => Ok(match std::str::from_utf8(bytes) {
            Ok(s) => plain(s.to_string()),
            Err(_) => not_utf8(),
        }),
        DocumentFormat::Pdf => pdf_extract::extract_text_from_mem(bytes)
            .map(plain)
            .map_err(|e| ExtractError::Pdf(e.to_string())),
        DocumentFormat::Docx => extract_docx(bytes).map(plain),
        DocumentFormat::Pptx => extract_pptx(bytes).map(plain),
    }
}

fn plain(text: String) -> Extraction {
    Extraction::Text(ExtractedText {
        text,
        metadata: Map::new(),
    })
}

fn not_utf8() -> Extraction {
    Extraction::Skipped {
        reason: "content is not valid UTF-8".to_string(),
    }
}

/// Split a leading `---` fenced YAML block off markdown text.
///
/// Returns the parsed mapping and the remaining body. Text whose front
/// matter is missing, unterminated, or not a YAML mapping is returned whole
/// with empty metadata.
pub fn split_front_matter(text: &str) -> (Map<String, Value>, &str) {
    let Some(rest) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return (Map::new(), text);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return match serde_yaml::from_str::<serde_yaml::Value>(yaml)
                .ok()
                .and_then(|v| serde_json::to_value(v).ok())
            {
                Some(Value::Object(map)) => (map, body),
                _ => (Map::new(), text),
            };
        }
        offset += line.len();
    }

    (Map::new(), text)
}

// ============ OOXML ============

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    text_runs(&xml, b"p", "\n")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let n = name
                .strip_prefix("ppt/slides/slide")?
                .strip_suffix(".xml")?
                .parse::<u32>()
                .ok()?;
            Some((n, name.to_string()))
        })
        .collect();
    slides.sort();

    let mut pages = Vec::with_capacity(slides.len());
    for (_, name) in slides {
        let xml = read_entry(&mut archive, &name)?;
        let text = text_runs(&xml, b"p", "\n")?;
        if !text.trim().is_empty() {
            pages.push(text);
        }
    }
    Ok(pages.join("\n\n"))
}

/// Concatenate the contents of every `<*:t>` element, inserting `separator`
/// whenever a `block` element closes.
fn text_runs(xml: &[u8], block: &[u8], separator: &str) -> Result<String, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == block && !out.is_empty() && !out.ends_with(separator) {
                    out.push_str(separator);
                }
            }
            Ok(Event::Text(t)) if in_text => {
                let text = t
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn text_of(extraction: Extraction) -> ExtractedText {
        match extraction {
            Extraction::Text(t) => t,
            Extraction::Skipped { reason } => panic!("unexpected skip: {}", reason),
        }
    }

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_markdown_front_matter_becomes_metadata() {
        let md = "---\ntitle: Weekly review\ntags: [work, planning]\n---\n# Heading\n\nBody.\n";
        let out = text_of(extract_bytes(md.as_bytes(), DocumentFormat::Markdown).unwrap());
        assert_eq!(out.text, "# Heading\n\nBody.\n");
        assert_eq!(out.metadata["title"], Value::String("Weekly review".into()));
        assert_eq!(out.metadata["tags"][1], Value::String("planning".into()));
    }

    #[test]
    fn test_markdown_without_front_matter_is_unchanged() {
        let md = "Just a note.\n---\nwith a rule";
        let (meta, body) = split_front_matter(md);
        assert!(meta.is_empty());
        assert_eq!(body, md);
    }

    #[test]
    fn test_unterminated_front_matter_kept_as_body() {
        let md = "---\ntitle: x\nno closing fence";
        let (meta, body) = split_front_matter(md);
        assert!(meta.is_empty());
        assert_eq!(body, md);
    }

    #[test]
    fn test_binary_text_file_is_skipped() {
        let out = extract_bytes(&[0xff, 0xfe, 0x00, 0x81], DocumentFormat::PlainText).unwrap();
        assert!(matches!(out, Extraction::Skipped { .. }));
    }

    #[test]
    fn test_invalid_pdf_returns_error() {
        let err = extract_bytes(b"not a pdf", DocumentFormat::Pdf).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn test_invalid_zip_returns_error_for_docx() {
        let err = extract_bytes(b"not a zip", DocumentFormat::Docx).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn test_docx_paragraphs() {
        let xml = r#"<w:document xmlns:w="w"><w:body>
            <w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t xml:space="preserve"> world</w:t></w:r></w:p>
            <w:p><w:r><w:t>Second &amp; last</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let bytes = zip_with(&[("word/document.xml", xml)]);
        let out = text_of(extract_bytes(&bytes, DocumentFormat::Docx).unwrap());
        assert_eq!(out.text, "Hello world\nSecond & last");
    }

    #[test]
    fn test_pptx_slides_in_numeric_order() {
        let slide = |t: &str| {
            format!(
                r#"<p:sld xmlns:a="a" xmlns:p="p"><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>"#,
                t
            )
        };
        let s1 = slide("first");
        let s2 = slide("second");
        let s10 = slide("tenth");
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
            ("ppt/slides/slide1.xml", s1.as_str()),
        ]);
        let out = text_of(extract_bytes(&bytes, DocumentFormat::Pptx).unwrap());
        assert_eq!(out.text, "first\n\nsecond\n\ntenth");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = LocalExtractor
            .extract(Path::new("/definitely/not/here.md"), DocumentFormat::Markdown)
            .unwrap_err();
        assert!(matches!(err, ExtractError::Io { .. }));
    }
}
