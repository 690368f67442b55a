use crate::chat::{collect_completion, ChatRegistry, ChatRequest};
use crate::chunking::{chunk_page_text, ChunkerConfig};
use crate::embeddings::EmbeddingRegistry;
use crate::error::{IngestError, ProviderError, QueryError};
use crate::extractor::{preview_image_path, PdfExtractor};
use crate::index::{CollectionKey, VectorIndex, VectorPoint};
use crate::models::{Chunk, Document, Page, PageStatus, PageView};
use crate::store::DocumentStore;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

pub const SUMMARY_START: &str = "===SUMMARY_START===";
pub const SUMMARY_END: &str = "===SUMMARY_END===";
pub const KEY_TERMS_START: &str = "===KEY_TERMS_START===";
pub const KEY_TERMS_END: &str = "===KEY_TERMS_END===";

/// Knobs for the ingestion run. Defaults bound page concurrency at three and
/// retry transient provider failures three times with exponential backoff.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chunker: ChunkerConfig,
    pub page_workers: usize,
    pub embed_batch_size: usize,
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            page_workers: 3,
            embed_batch_size: 16,
            max_retries: 3,
            retry_base: Duration::from_secs(1),
        }
    }
}

/// Upload request: the raw PDF bytes plus the providers the document will be
/// pinned to for its whole lifetime.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub owner_id: String,
    pub title: String,
    pub bytes: Vec<u8>,
    pub embedding_provider: String,
    pub chat_provider: String,
    pub chat_model: Option<String>,
}

/// Drives a document from raw bytes to per-page readiness: extract, chunk,
/// embed, upsert, summarize. Cheap to clone; every collaborator sits behind
/// an `Arc`.
#[derive(Clone)]
pub struct IngestionPipeline {
    store: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    embeddings: Arc<EmbeddingRegistry>,
    chat: Arc<ChatRegistry>,
    extractor: Arc<dyn PdfExtractor>,
    config: PipelineConfig,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        embeddings: Arc<EmbeddingRegistry>,
        chat: Arc<ChatRegistry>,
        extractor: Arc<dyn PdfExtractor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            index,
            embeddings,
            chat,
            extractor,
            config,
        }
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    pub fn index(&self) -> Arc<dyn VectorIndex> {
        self.index.clone()
    }

    /// Register the document and kick off ingestion in the background.
    /// Returns the new document id immediately; progress is observable
    /// through per-page readiness and the document's completion flag.
    pub async fn enqueue(&self, new_document: NewDocument) -> Result<String, IngestError> {
        let embedder = self.embeddings.get(&new_document.embedding_provider)?;
        if !embedder.available() {
            return Err(ProviderError::Unavailable(new_document.embedding_provider).into());
        }
        let chat = self.chat.get(&new_document.chat_provider)?;
        let chat_model = new_document
            .chat_model
            .clone()
            .unwrap_or_else(|| chat.default_model().to_string());

        let document_id = Uuid::new_v4().to_string();
        let checksum = format!("{:x}", Sha256::digest(&new_document.bytes));

        self.store
            .create_document(Document {
                id: document_id.clone(),
                owner_id: new_document.owner_id,
                title: new_document.title,
                checksum,
                page_count: None,
                ingestion_completed: false,
                ingestion_error: None,
                embedding_provider: new_document.embedding_provider,
                chat_provider: new_document.chat_provider,
                chat_model,
                created_at: Utc::now(),
            })
            .await?;

        let pipeline = self.clone();
        let id = document_id.clone();
        let bytes = Arc::new(new_document.bytes);
        tokio::spawn(async move {
            pipeline.run_document(id, bytes).await;
        });

        Ok(document_id)
    }

    /// Re-run ingestion for an existing document. Chunk ids are stable, so
    /// vector points are overwritten rather than duplicated.
    pub async fn reingest(&self, document_id: &str, bytes: Vec<u8>) -> Result<(), IngestError> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| IngestError::DocumentNotFound(document_id.to_string()))?;

        let pipeline = self.clone();
        let id = document_id.to_string();
        let bytes = Arc::new(bytes);
        tokio::spawn(async move {
            pipeline.run_document(id, bytes).await;
        });
        Ok(())
    }

    /// Full ingestion run for one document. Page failures are isolated; the
    /// document-level completion flag is set only when every page is ready.
    async fn run_document(self, document_id: String, bytes: Arc<Vec<u8>>) {
        let page_count = match self.extractor.page_count(&bytes) {
            Ok(count) => count,
            Err(error) => {
                tracing::warn!(%document_id, %error, "document failed before page extraction");
                let _ = self
                    .store
                    .mark_ingestion_failed(&document_id, &error.to_string())
                    .await;
                return;
            }
        };

        if let Err(error) = self.store.set_page_count(&document_id, page_count).await {
            tracing::warn!(%document_id, %error, "failed to record page count");
            return;
        }

        let document = match self.store.get_document(&document_id).await {
            Ok(Some(document)) => document,
            _ => return,
        };
        let Ok(embedder) = self.embeddings.get(&document.embedding_provider) else {
            return;
        };
        let collection = CollectionKey::new(embedder.id(), embedder.dimensions());
        if let Err(error) = self.index.ensure_collection(&collection).await {
            let _ = self
                .store
                .mark_ingestion_failed(&document_id, &error.to_string())
                .await;
            return;
        }

        tracing::info!(%document_id, page_count, "ingestion started");

        let semaphore = Arc::new(Semaphore::new(self.config.page_workers.max(1)));
        let mut workers = JoinSet::new();
        for page_no in 0..page_count {
            let pipeline = self.clone();
            let bytes = bytes.clone();
            let id = document_id.clone();
            let collection = collection.clone();
            let semaphore = semaphore.clone();
            workers.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                pipeline.process_page(&id, &bytes, page_no, &collection).await
            });
        }

        let mut all_ready = true;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(true) => {}
                _ => all_ready = false,
            }
        }

        if all_ready {
            if let Err(error) = self.store.mark_ingestion_completed(&document_id).await {
                tracing::warn!(%document_id, %error, "failed to mark ingestion completed");
            }
            tracing::info!(%document_id, "ingestion completed");
        } else {
            tracing::warn!(%document_id, "ingestion finished with failed pages");
        }
    }

    /// Run one page to a terminal state and record it. Returns whether the
    /// page became ready.
    async fn process_page(
        &self,
        document_id: &str,
        bytes: &[u8],
        page_no: u32,
        collection: &CollectionKey,
    ) -> bool {
        match self.page_stages(document_id, bytes, page_no, collection).await {
            Ok(page) => {
                if let Err(error) = self.store.put_page(page).await {
                    tracing::warn!(%document_id, page_no, %error, "failed to store ready page");
                    return false;
                }
                tracing::info!(%document_id, page_no, "page ready");
                true
            }
            Err(error) => {
                tracing::warn!(%document_id, page_no, %error, "page failed");
                let _ = self
                    .store
                    .put_page(Page {
                        document_id: document_id.to_string(),
                        page_no,
                        text: String::new(),
                        preview_image: preview_image_path(document_id, page_no),
                        summary: None,
                        key_terms: None,
                        ready: false,
                        error: Some(error.to_string()),
                        created_at: Utc::now(),
                    })
                    .await;
                false
            }
        }
    }

    async fn page_stages(
        &self,
        document_id: &str,
        bytes: &[u8],
        page_no: u32,
        collection: &CollectionKey,
    ) -> Result<Page, IngestError> {
        let text = self.extractor.extract_page(bytes, page_no)?;
        let chunks = chunk_page_text(&text, document_id, page_no, self.config.chunker);

        if !chunks.is_empty() {
            self.embed_and_upsert(&chunks, collection).await?;
        }

        let (summary, key_terms) = if text.trim().is_empty() {
            (None, None)
        } else {
            let document = self
                .store
                .get_document(document_id)
                .await?
                .ok_or_else(|| IngestError::DocumentNotFound(document_id.to_string()))?;
            let response = self.summarize(&document, &text).await?;
            let (summary, terms) = parse_summary_response(&response);
            (summary, Some(terms))
        };

        Ok(Page {
            document_id: document_id.to_string(),
            page_no,
            text,
            preview_image: preview_image_path(document_id, page_no),
            summary,
            key_terms,
            ready: true,
            error: None,
            created_at: Utc::now(),
        })
    }

    async fn embed_and_upsert(
        &self,
        chunks: &[Chunk],
        collection: &CollectionKey,
    ) -> Result<(), IngestError> {
        let embedder = self.embeddings.get(&collection.provider_id)?;

        for batch in chunks.chunks(self.config.embed_batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
            let vectors = self
                .with_retry(|| {
                    let embedder = embedder.clone();
                    let texts = texts.clone();
                    async move { embedder.embed(&texts).await }
                })
                .await?;

            let points = batch
                .iter()
                .cloned()
                .zip(vectors)
                .map(|(chunk, vector)| VectorPoint { chunk, vector })
                .collect();
            self.index.upsert(collection, points).await?;
        }
        Ok(())
    }

    async fn summarize(&self, document: &Document, text: &str) -> Result<String, ProviderError> {
        let provider = self.chat.get(&document.chat_provider)?;
        let request = ChatRequest::new(document.chat_model.clone(), summary_user_prompt(text))
            .with_system(SUMMARY_SYSTEM_PROMPT);

        self.with_retry(|| {
            let provider = provider.clone();
            let request = request.clone();
            async move {
                let stream = provider.stream_completion(request).await?;
                collect_completion(stream).await
            }
        })
        .await
    }

    /// Retry transient provider failures with exponential backoff; permanent
    /// failures propagate immediately.
    async fn with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_base * 2u32.saturating_pow(attempt);
                    tracing::debug!(%error, attempt, "transient provider error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Reader-facing page view. Absent or in-flight pages report
    /// `Processing`; a page with a recorded error reports `Failed`.
    pub async fn page_view(
        &self,
        document_id: &str,
        page_no: u32,
    ) -> Result<PageView, QueryError> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| QueryError::DocumentNotFound(document_id.to_string()))?;

        if let Some(count) = document.page_count {
            if page_no >= count {
                return Err(QueryError::Request(format!(
                    "page {page_no} out of range (document has {count} pages)"
                )));
            }
        }

        let page = self.store.get_page(document_id, page_no).await?;
        let qa = self.store.list_qa_for_page(document_id, page_no).await?;

        Ok(match page {
            Some(page) if page.ready => PageView {
                page_no,
                status: PageStatus::Ready,
                summary: page.summary,
                key_terms: page.key_terms.unwrap_or_default(),
                preview_image: Some(page.preview_image),
                error: None,
                qa,
            },
            Some(page) if page.error.is_some() => PageView {
                page_no,
                status: PageStatus::Failed,
                summary: None,
                key_terms: Vec::new(),
                preview_image: None,
                error: page.error,
                qa,
            },
            _ => PageView {
                page_no,
                status: PageStatus::Processing,
                summary: None,
                key_terms: Vec::new(),
                preview_image: None,
                error: None,
                qa,
            },
        })
    }

    /// Delete a document everywhere: records, pages, Q&A, and its vector
    /// points in every collection.
    pub async fn delete_document(&self, document_id: &str) -> Result<(), QueryError> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| QueryError::DocumentNotFound(document_id.to_string()))?;
        self.index.delete_document(document_id).await?;
        self.store.delete_document(document_id).await?;
        Ok(())
    }

    pub async fn document(&self, document_id: &str) -> Result<Document, QueryError> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| QueryError::DocumentNotFound(document_id.to_string()))
    }
}

const SUMMARY_SYSTEM_PROMPT: &str = "You are a study assistant. Summarize one page of a document \
for a student seeing it for the first time. Respond in exactly this format:\n\
===SUMMARY_START===\n<two to four sentences of plain-language summary>\n===SUMMARY_END===\n\
===KEY_TERMS_START===\n<one key term per line, at most six>\n===KEY_TERMS_END===";

fn summary_user_prompt(text: &str) -> String {
    format!("Page text:\n\n{text}")
}

/// Parse a delimited summary response. A response that ignores the delimiter
/// format is kept whole as the summary, with no key terms.
pub fn parse_summary_response(response: &str) -> (Option<String>, Vec<String>) {
    let summary = between(response, SUMMARY_START, SUMMARY_END);
    let terms_block = between(response, KEY_TERMS_START, KEY_TERMS_END);

    match (summary, terms_block) {
        (None, None) => {
            let raw = response.trim();
            let summary = (!raw.is_empty()).then(|| raw.to_string());
            (summary, Vec::new())
        }
        (summary, terms_block) => {
            let terms = terms_block
                .map(|block| {
                    block
                        .lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            (summary, terms)
        }
    }
}

fn between(text: &str, start: &str, end: &str) -> Option<String> {
    let after = &text[text.find(start)? + start.len()..];
    let inner = after[..after.find(end)?].trim();
    (!inner.is_empty()).then(|| inner.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ScriptedChat;
    use crate::embeddings::{EmbeddingRegistry, HashEmbeddings, HASH_ID};
    use crate::extractor::FixedExtractor;
    use crate::index::MemoryVectorIndex;
    use crate::store::MemoryDocumentStore;

    fn pipeline_with(extractor: FixedExtractor) -> IngestionPipeline {
        let mut embeddings = EmbeddingRegistry::new();
        embeddings.register(Arc::new(HashEmbeddings::default()));
        let mut chat = ChatRegistry::new();
        chat.register(Arc::new(ScriptedChat::default()));

        IngestionPipeline::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryVectorIndex::new()),
            Arc::new(embeddings),
            Arc::new(chat),
            Arc::new(extractor),
            PipelineConfig {
                retry_base: Duration::from_millis(1),
                ..PipelineConfig::default()
            },
        )
    }

    fn upload() -> NewDocument {
        NewDocument {
            owner_id: "user".to_string(),
            title: "Intro deck".to_string(),
            bytes: b"%PDF stand-in".to_vec(),
            embedding_provider: HASH_ID.to_string(),
            chat_provider: "scripted".to_string(),
            chat_model: None,
        }
    }

    async fn wait_until_settled(pipeline: &IngestionPipeline, document_id: &str) -> Document {
        for _ in 0..500 {
            let document = pipeline.document(document_id).await.unwrap();
            if document.ingestion_completed || document.ingestion_error.is_some() {
                return document;
            }
            if let Some(count) = document.page_count {
                let pages = pipeline.store().list_pages(document_id, 0, count as usize).await.unwrap();
                let terminal = pages
                    .iter()
                    .filter(|page| page.ready || page.error.is_some())
                    .count();
                if terminal == count as usize && !pages.iter().all(|page| page.ready) {
                    return document;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("ingestion did not settle");
    }

    #[tokio::test]
    async fn full_run_marks_every_page_ready_and_completes() {
        let pipeline = pipeline_with(FixedExtractor::from_texts(&[
            "Photosynthesis converts light into energy. Plants use chlorophyll.",
            "The Calvin cycle fixes carbon dioxide into sugar.",
        ]));

        let document_id = pipeline.enqueue(upload()).await.unwrap();
        let document = wait_until_settled(&pipeline, &document_id).await;

        assert!(document.ingestion_completed);
        assert_eq!(document.page_count, Some(2));
        for page_no in 0..2 {
            let view = pipeline.page_view(&document_id, page_no).await.unwrap();
            assert_eq!(view.status, PageStatus::Ready);
            assert!(view.summary.is_some());
        }
    }

    #[tokio::test]
    async fn one_failing_page_leaves_the_rest_ready_and_completion_unset() {
        let pipeline = pipeline_with(FixedExtractor::new(vec![
            Ok("First page text. It has sentences.".to_string()),
            Err("page stream is corrupt".to_string()),
            Ok("Third page text. Also fine.".to_string()),
        ]));

        let document_id = pipeline.enqueue(upload()).await.unwrap();
        let document = wait_until_settled(&pipeline, &document_id).await;

        assert!(!document.ingestion_completed);
        assert_eq!(
            pipeline.page_view(&document_id, 0).await.unwrap().status,
            PageStatus::Ready
        );
        let failed = pipeline.page_view(&document_id, 1).await.unwrap();
        assert_eq!(failed.status, PageStatus::Failed);
        assert!(failed.error.unwrap().contains("corrupt"));
        assert_eq!(
            pipeline.page_view(&document_id, 2).await.unwrap().status,
            PageStatus::Ready
        );
    }

    #[tokio::test]
    async fn unparseable_document_records_an_ingestion_error() {
        let pipeline = pipeline_with(FixedExtractor::default());

        let document_id = pipeline.enqueue(upload()).await.unwrap();
        let document = wait_until_settled(&pipeline, &document_id).await;

        assert!(!document.ingestion_completed);
        assert!(document.ingestion_error.is_some());
    }

    #[tokio::test]
    async fn blank_page_becomes_ready_without_chunks_or_summary() {
        let pipeline = pipeline_with(FixedExtractor::from_texts(&["   \n  "]));

        let document_id = pipeline.enqueue(upload()).await.unwrap();
        let document = wait_until_settled(&pipeline, &document_id).await;

        assert!(document.ingestion_completed);
        let view = pipeline.page_view(&document_id, 0).await.unwrap();
        assert_eq!(view.status, PageStatus::Ready);
        assert!(view.summary.is_none());
    }

    #[tokio::test]
    async fn unknown_embedding_provider_is_rejected_at_enqueue() {
        let pipeline = pipeline_with(FixedExtractor::from_texts(&["text"]));
        let mut request = upload();
        request.embedding_provider = "nonsense".to_string();

        assert!(matches!(
            pipeline.enqueue(request).await,
            Err(IngestError::Provider(ProviderError::UnknownProvider(_)))
        ));
    }

    #[tokio::test]
    async fn reingesting_the_same_bytes_does_not_duplicate_vectors() {
        let pipeline = pipeline_with(FixedExtractor::from_texts(&[
            "Osmosis moves water across membranes. Concentration gradients drive it.",
        ]));

        let document_id = pipeline.enqueue(upload()).await.unwrap();
        wait_until_settled(&pipeline, &document_id).await;

        let key = CollectionKey::new(HASH_ID, crate::embeddings::HASH_DIMENSIONS);
        let count_before = pipeline.index().count_document(&key, &document_id).await.unwrap();
        assert!(count_before > 0);

        pipeline
            .reingest(&document_id, b"%PDF stand-in".to_vec())
            .await
            .unwrap();
        wait_until_settled(&pipeline, &document_id).await;

        let count_after = pipeline.index().count_document(&key, &document_id).await.unwrap();
        assert_eq!(count_before, count_after);
    }

    #[tokio::test]
    async fn delete_cascades_across_store_and_index() {
        let pipeline = pipeline_with(FixedExtractor::from_texts(&[
            "A page with enough text to chunk. Several sentences here. More text follows.",
        ]));

        let document_id = pipeline.enqueue(upload()).await.unwrap();
        wait_until_settled(&pipeline, &document_id).await;

        let key = CollectionKey::new(HASH_ID, crate::embeddings::HASH_DIMENSIONS);
        assert!(pipeline.index().count_document(&key, &document_id).await.unwrap() > 0);

        pipeline.delete_document(&document_id).await.unwrap();
        assert!(matches!(
            pipeline.document(&document_id).await,
            Err(QueryError::DocumentNotFound(_))
        ));
        assert_eq!(
            pipeline.index().count_document(&key, &document_id).await.unwrap(),
            0
        );
    }

    #[test]
    fn summary_parsing_honors_delimiters_and_falls_back_to_raw_text() {
        let delimited = format!(
            "{SUMMARY_START}\nA short summary.\n{SUMMARY_END}\n{KEY_TERMS_START}\nosmosis\ndiffusion\n{KEY_TERMS_END}"
        );
        let (summary, terms) = parse_summary_response(&delimited);
        assert_eq!(summary.as_deref(), Some("A short summary."));
        assert_eq!(terms, vec!["osmosis", "diffusion"]);

        let (summary, terms) = parse_summary_response("Just prose, no markers.");
        assert_eq!(summary.as_deref(), Some("Just prose, no markers."));
        assert!(terms.is_empty());
    }
}
