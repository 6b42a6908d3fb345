use std::path::Path;

use super::{is_supported_media_type, Extraction, ExtractionError, Extractor};

/// Extracts embedded text from PDFs with `lopdf`, page by page.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfExtractor;

impl PdfExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Extractor for PdfExtractor {
    fn extract(&self, path: &Path, mime_type: &str) -> Result<Extraction, ExtractionError> {
        let _span = tracing::info_span!("extraction.pdf").entered();

        if !is_supported_media_type(mime_type) {
            return Err(ExtractionError::Unsupported(mime_type.to_string()));
        }

        let bytes = std::fs::read(path).map_err(|e| ExtractionError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let doc = lopdf::Document::load_mem(&bytes)
            .map_err(|e| ExtractionError::Pdf(format!("Failed to load PDF: {}", e)))?;

        let pages = doc.get_pages();
        let mut parts = Vec::with_capacity(pages.len());
        for page_num in pages.keys() {
            match doc.extract_text(&[*page_num]) {
                Ok(page_text) => {
                    let trimmed = page_text.trim();
                    if !trimmed.is_empty() {
                        parts.push(trimmed.to_string());
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Skipping page {} of {}: {}",
                        page_num,
                        path.display(),
                        e
                    );
                }
            }
        }

        let page_count = u32::try_from(pages.len()).unwrap_or(u32::MAX);
        log::debug!(
            "Extracted {} pages ({} with text) from {}",
            page_count,
            parts.len(),
            path.display()
        );

        Ok(Extraction {
            text: parts.join("\n\n"),
            page_count,
        })
    }
}
