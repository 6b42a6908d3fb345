//! Text extraction: file path + media type in, plain text + page count out.

mod pdf;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use pdf::PdfExtractor;

/// The only media type the pipeline accepts.
pub const MIME_PDF: &str = "application/pdf";

/// Media types the pipeline will hand to an extractor.
pub const SUPPORTED_MEDIA_TYPES: &[&str] = &[MIME_PDF];

/// Default minimum length (in characters, after trimming) for extracted
/// text to be considered real content.
pub const DEFAULT_MIN_TEXT_LENGTH: usize = 20;

pub fn is_supported_media_type(mime_type: &str) -> bool {
    SUPPORTED_MEDIA_TYPES
        .iter()
        .any(|supported| supported.eq_ignore_ascii_case(mime_type.trim()))
}

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Failed to read '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse PDF: {0}")]
    Pdf(String),

    #[error("No extractor for media type '{0}'")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// Raw extraction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub text: String,
    pub page_count: u32,
}

/// Turns a stored file into text. Implementations may be slow and are
/// called without any lock held.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path, mime_type: &str) -> Result<Extraction, ExtractionError>;
}
