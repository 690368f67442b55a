use crate::error::IngestError;
use lopdf::Document;

/// Page-level access to an uploaded PDF. Extraction is per page so that one
/// unreadable page fails only that page, not the document.
pub trait PdfExtractor: Send + Sync {
    fn page_count(&self, bytes: &[u8]) -> Result<u32, IngestError>;

    /// Extract the plain text of a 0-based page. Backends may fail a single
    /// page; a page that merely has no text must return an empty string.
    fn extract_page(&self, bytes: &[u8], page_no: u32) -> Result<String, IngestError>;
}

/// Extractor backed by lopdf. A document that fails to parse at all (corrupt
/// or encrypted bytes) is a whole-document error; a page whose text cannot be
/// decoded is treated as empty.
#[derive(Default)]
pub struct LopdfExtractor;

impl LopdfExtractor {
    fn load(&self, bytes: &[u8]) -> Result<Document, IngestError> {
        Document::load_mem(bytes).map_err(|error| IngestError::PdfParse(error.to_string()))
    }
}

impl PdfExtractor for LopdfExtractor {
    fn page_count(&self, bytes: &[u8]) -> Result<u32, IngestError> {
        let document = self.load(bytes)?;
        Ok(document.get_pages().len() as u32)
    }

    fn extract_page(&self, bytes: &[u8], page_no: u32) -> Result<String, IngestError> {
        let document = self.load(bytes)?;
        let pages = document.get_pages();

        let lopdf_page = pages
            .keys()
            .nth(page_no as usize)
            .copied()
            .ok_or_else(|| IngestError::InvalidArgument(format!("page {page_no} out of range")))?;

        Ok(document.extract_text(&[lopdf_page]).unwrap_or_default())
    }
}

/// Scripted extractor for tests and offline demos: each entry is either a
/// page's text or a page-level extraction failure.
#[derive(Debug, Clone, Default)]
pub struct FixedExtractor {
    pub pages: Vec<Result<String, String>>,
}

impl FixedExtractor {
    pub fn new(pages: Vec<Result<String, String>>) -> Self {
        Self { pages }
    }

    pub fn from_texts(texts: &[&str]) -> Self {
        Self {
            pages: texts.iter().map(|t| Ok((*t).to_string())).collect(),
        }
    }
}

impl PdfExtractor for FixedExtractor {
    fn page_count(&self, _bytes: &[u8]) -> Result<u32, IngestError> {
        if self.pages.is_empty() {
            return Err(IngestError::PdfParse("scripted document has no pages".to_string()));
        }
        Ok(self.pages.len() as u32)
    }

    fn extract_page(&self, _bytes: &[u8], page_no: u32) -> Result<String, IngestError> {
        match self.pages.get(page_no as usize) {
            Some(Ok(text)) => Ok(text.clone()),
            Some(Err(reason)) => Err(IngestError::PdfParse(reason.clone())),
            None => Err(IngestError::InvalidArgument(format!("page {page_no} out of range"))),
        }
    }
}

/// Logical preview image reference for a page; rendering itself is owned by
/// the UI layer.
pub fn preview_image_path(document_id: &str, page_no: u32) -> String {
    format!("previews/{document_id}/page_{page_no}.png")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_extractor_reports_pages_and_failures() {
        let extractor = FixedExtractor::new(vec![
            Ok("first".to_string()),
            Err("broken page".to_string()),
        ]);

        assert_eq!(extractor.page_count(b"ignored").unwrap(), 2);
        assert_eq!(extractor.extract_page(b"ignored", 0).unwrap(), "first");
        assert!(matches!(
            extractor.extract_page(b"ignored", 1),
            Err(IngestError::PdfParse(_))
        ));
    }

    #[test]
    fn lopdf_rejects_garbage_bytes() {
        let extractor = LopdfExtractor;
        assert!(matches!(
            extractor.page_count(b"not a pdf at all"),
            Err(IngestError::PdfParse(_))
        ));
    }

    #[test]
    fn preview_paths_are_per_document_and_page() {
        assert_eq!(preview_image_path("doc-9", 4), "previews/doc-9/page_4.png");
    }
}
