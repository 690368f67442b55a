use crate::error::StoreError;
use crate::models::{Document, Page, QaRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// External document-record storage, specified at the boundary: document and
/// page CRUD, Q&A append/list with pagination, and the raw material for
/// full-text search over page and Q&A text.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(&self, document: Document) -> Result<(), StoreError>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError>;

    async fn set_page_count(&self, id: &str, page_count: u32) -> Result<(), StoreError>;

    async fn mark_ingestion_completed(&self, id: &str) -> Result<(), StoreError>;

    async fn mark_ingestion_failed(&self, id: &str, error: &str) -> Result<(), StoreError>;

    /// Delete a document and cascade its pages and Q&A records. Vector
    /// cleanup is the caller's job (the index is a separate store).
    async fn delete_document(&self, id: &str) -> Result<(), StoreError>;

    /// Insert or replace a page record. A page that already reached
    /// `ready = true` is never downgraded by a later write.
    async fn put_page(&self, page: Page) -> Result<(), StoreError>;

    async fn get_page(&self, document_id: &str, page_no: u32) -> Result<Option<Page>, StoreError>;

    /// Pages of a document ordered by page number, paginated.
    async fn list_pages(
        &self,
        document_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Page>, StoreError>;

    async fn append_qa(&self, record: QaRecord) -> Result<(), StoreError>;

    /// Q&A records of a document in creation order, paginated.
    async fn list_qa(
        &self,
        document_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<QaRecord>, StoreError>;

    async fn list_qa_for_page(
        &self,
        document_id: &str,
        page_no: u32,
    ) -> Result<Vec<QaRecord>, StoreError>;

    /// All pages of an owner's documents, optionally narrowed to one
    /// document. Backing material for global search.
    async fn pages_for_search(
        &self,
        owner_id: &str,
        document_id: Option<&str>,
    ) -> Result<Vec<Page>, StoreError>;

    /// All Q&A of an owner's documents, optionally narrowed to one document.
    async fn qa_for_search(
        &self,
        owner_id: &str,
        document_id: Option<&str>,
    ) -> Result<Vec<QaRecord>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    documents: HashMap<String, Document>,
    pages: BTreeMap<(String, u32), Page>,
    qa: Vec<QaRecord>,
}

/// Reference in-memory implementation used by the pipeline, the CLI, and
/// tests.
#[derive(Default)]
pub struct MemoryDocumentStore {
    state: RwLock<MemoryState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn page_bounds(document_id: &str) -> ((String, u32), (String, u32)) {
    (
        (document_id.to_string(), 0),
        (document_id.to_string(), u32::MAX),
    )
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create_document(&self, document: Document) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.documents.insert(document.id.clone(), document);
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let state = self.state.read().await;
        Ok(state.documents.get(id).cloned())
    }

    async fn set_page_count(&self, id: &str, page_count: u32) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let document = state
            .documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))?;
        document.page_count = Some(page_count);
        Ok(())
    }

    async fn mark_ingestion_completed(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let document = state
            .documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))?;
        document.ingestion_completed = true;
        Ok(())
    }

    async fn mark_ingestion_failed(&self, id: &str, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let document = state
            .documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))?;
        document.ingestion_error = Some(error.to_string());
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.documents.remove(id);
        state.pages.retain(|(document_id, _), _| document_id != id);
        state.qa.retain(|record| record.document_id != id);
        Ok(())
    }

    async fn put_page(&self, page: Page) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let page_key = (page.document_id.clone(), page.page_no);

        if let Some(existing) = state.pages.get(&page_key) {
            if existing.ready && !page.ready {
                // Ready never reverts.
                return Ok(());
            }
        }
        state.pages.insert(page_key, page);
        Ok(())
    }

    async fn get_page(&self, document_id: &str, page_no: u32) -> Result<Option<Page>, StoreError> {
        let state = self.state.read().await;
        Ok(state.pages.get(&(document_id.to_string(), page_no)).cloned())
    }

    async fn list_pages(
        &self,
        document_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Page>, StoreError> {
        let state = self.state.read().await;
        let (low, high) = page_bounds(document_id);
        Ok(state
            .pages
            .range(low..=high)
            .map(|(_, page)| page.clone())
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn append_qa(&self, record: QaRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.qa.push(record);
        Ok(())
    }

    async fn list_qa(
        &self,
        document_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<QaRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .qa
            .iter()
            .filter(|record| record.document_id == document_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_qa_for_page(
        &self,
        document_id: &str,
        page_no: u32,
    ) -> Result<Vec<QaRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .qa
            .iter()
            .filter(|record| record.document_id == document_id && record.page_no == page_no)
            .cloned()
            .collect())
    }

    async fn pages_for_search(
        &self,
        owner_id: &str,
        document_id: Option<&str>,
    ) -> Result<Vec<Page>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .pages
            .values()
            .filter(|page| {
                state
                    .documents
                    .get(&page.document_id)
                    .is_some_and(|document| document.owner_id == owner_id)
            })
            .filter(|page| document_id.map_or(true, |id| page.document_id == id))
            .cloned()
            .collect())
    }

    async fn qa_for_search(
        &self,
        owner_id: &str,
        document_id: Option<&str>,
    ) -> Result<Vec<QaRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .qa
            .iter()
            .filter(|record| {
                state
                    .documents
                    .get(&record.document_id)
                    .is_some_and(|document| document.owner_id == owner_id)
            })
            .filter(|record| document_id.map_or(true, |id| record.document_id == id))
            .cloned()
            .collect())
    }
}
