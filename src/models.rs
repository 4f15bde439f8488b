//! Core data models flowing through the sync and query pipelines.
//!
//! A [`Document`] is a file found by the scanner; its extracted text is cut
//! into [`Chunk`]s, which become [`EmbeddedChunk`]s once the embedding
//! backend has produced a vector for them. Chunks that could not be
//! embedded are reported as [`FailedChunk`]s.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Tagged source format, detected from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Markdown,
    PlainText,
    Csv,
    Pdf,
    Docx,
    Pptx,
}

impl DocumentFormat {
    /// Detect the format from a path's extension. `None` means the file is
    /// not indexed.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "md" | "mdx" | "markdown" => Some(DocumentFormat::Markdown),
            "txt" => Some(DocumentFormat::PlainText),
            "csv" => Some(DocumentFormat::Csv),
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "pptx" => Some(DocumentFormat::Pptx),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::PlainText => "plain_text",
            DocumentFormat::Csv => "csv",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Pptx => "pptx",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "markdown" => Some(DocumentFormat::Markdown),
            "plain_text" => Some(DocumentFormat::PlainText),
            "csv" => Some(DocumentFormat::Csv),
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "pptx" => Some(DocumentFormat::Pptx),
            _ => None,
        }
    }

    /// Formats read as UTF-8 text rather than through a binary parser.
    pub fn is_text(&self) -> bool {
        matches!(
            self,
            DocumentFormat::Markdown | DocumentFormat::PlainText | DocumentFormat::Csv
        )
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A corpus file as seen by one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Corpus-relative, `/`-separated.
    pub path: String,
    pub abs_path: PathBuf,
    /// Lowercase hex SHA-256 of the raw bytes.
    pub fingerprint: String,
    /// Unix seconds.
    pub mtime: i64,
    pub size: u64,
    pub format: DocumentFormat,
}

/// A contiguous span of a document's extracted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub path: String,
    pub fingerprint: String,
    pub ordinal: usize,
    /// Byte offsets into the extracted text.
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// Estimated token count.
    pub tokens: usize,
    pub prev_id: Option<String>,
    pub next_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedChunk {
    pub chunk_id: String,
    pub path: String,
    pub ordinal: usize,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            DocumentFormat::from_path(Path::new("notes/a.MD")),
            Some(DocumentFormat::Markdown)
        );
        assert_eq!(
            DocumentFormat::from_path(Path::new("b.mdx")),
            Some(DocumentFormat::Markdown)
        );
        assert_eq!(
            DocumentFormat::from_path(Path::new("deck.pptx")),
            Some(DocumentFormat::Pptx)
        );
        assert_eq!(DocumentFormat::from_path(Path::new("image.png")), None);
        assert_eq!(DocumentFormat::from_path(Path::new("Makefile")), None);
    }

    #[test]
    fn test_format_string_roundtrip_for_storage() {
        for format in [
            DocumentFormat::Markdown,
            DocumentFormat::PlainText,
            DocumentFormat::Csv,
            DocumentFormat::Pdf,
            DocumentFormat::Docx,
            DocumentFormat::Pptx,
        ] {
            assert_eq!(DocumentFormat::parse(format.as_str()), Some(format));
        }
    }
}
