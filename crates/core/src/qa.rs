use crate::chat::{ChatRegistry, ChatRequest};
use crate::error::QueryError;
use crate::models::{Citation, Document, QaRecord, ScopeMode};
use crate::retrieval::{
    build_context_prompt, extract_citations, RetrievalEngine, ANSWER_SYSTEM_PROMPT, DEFAULT_TOP_K,
};
use crate::store::DocumentStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Answer shown when retrieval finds nothing to ground the question on.
pub const NO_CONTEXT_ANSWER: &str =
    "No grounding context was found for this question on the selected pages. \
     Try widening the scope or asking about a page that has finished processing.";

/// One event of a streamed answer. A well-formed stream is zero or more
/// `Token`s followed by exactly one `Done` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerEvent {
    Token(String),
    Done {
        qa_id: String,
        citations: Vec<Citation>,
    },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct AskRequest {
    pub document_id: String,
    pub page_no: u32,
    pub question: String,
    pub scope: ScopeMode,
    pub top_k: Option<usize>,
}

/// Streams grounded answers. A question is answered from retrieved chunks
/// only; the finished answer is persisted as an immutable Q&A record unless
/// the caller walked away mid-stream.
#[derive(Clone)]
pub struct QaEngine {
    store: Arc<dyn DocumentStore>,
    retrieval: Arc<RetrievalEngine>,
    chat: Arc<ChatRegistry>,
}

impl QaEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        retrieval: Arc<RetrievalEngine>,
        chat: Arc<ChatRegistry>,
    ) -> Self {
        Self {
            store,
            retrieval,
            chat,
        }
    }

    /// Start answering. Fails fast on an unknown document; everything after
    /// that is reported through the event stream. Dropping the receiver
    /// cancels the answer and nothing is persisted.
    pub async fn ask(
        &self,
        request: AskRequest,
    ) -> Result<mpsc::Receiver<AnswerEvent>, QueryError> {
        let document = self
            .store
            .get_document(&request.document_id)
            .await?
            .ok_or_else(|| QueryError::DocumentNotFound(request.document_id.clone()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.answer(document, request, tx).await;
        });
        Ok(rx)
    }

    async fn answer(
        &self,
        document: Document,
        request: AskRequest,
        tx: mpsc::Sender<AnswerEvent>,
    ) {
        let top_k = request.top_k.unwrap_or(DEFAULT_TOP_K);
        let retrieved = match self
            .retrieval
            .retrieve(&document, request.page_no, &request.question, request.scope, top_k)
            .await
        {
            Ok(retrieved) => retrieved,
            Err(error) => {
                let _ = tx.send(AnswerEvent::Error(error.to_string())).await;
                return;
            }
        };

        if retrieved.is_empty() {
            self.finish_with_canned_answer(&document, &request, tx).await;
            return;
        }

        let provider = match self.chat.get(&document.chat_provider) {
            Ok(provider) => provider,
            Err(error) => {
                let _ = tx.send(AnswerEvent::Error(error.to_string())).await;
                return;
            }
        };
        let chat_request = ChatRequest::new(
            document.chat_model.clone(),
            build_context_prompt(&retrieved, &request.question),
        )
        .with_system(ANSWER_SYSTEM_PROMPT);

        let mut stream = match provider.stream_completion(chat_request).await {
            Ok(stream) => stream,
            Err(error) => {
                let _ = tx.send(AnswerEvent::Error(error.to_string())).await;
                return;
            }
        };

        let mut answer = String::new();
        while let Some(delta) = stream.recv().await {
            match delta {
                Ok(token) => {
                    answer.push_str(&token);
                    if tx.send(AnswerEvent::Token(token)).await.is_err() {
                        // Receiver gone, the answer is abandoned unrecorded.
                        return;
                    }
                }
                Err(error) => {
                    let _ = tx.send(AnswerEvent::Error(error.to_string())).await;
                    return;
                }
            }
        }

        let citations = extract_citations(&answer, &retrieved);
        self.persist_and_finish(&document, &request, answer, citations, tx)
            .await;
    }

    /// Stream the fixed no-context answer and record it with no citations,
    /// so the history shows the question was asked and could not be grounded.
    async fn finish_with_canned_answer(
        &self,
        document: &Document,
        request: &AskRequest,
        tx: mpsc::Sender<AnswerEvent>,
    ) {
        for token in NO_CONTEXT_ANSWER.split_inclusive(' ') {
            if tx.send(AnswerEvent::Token(token.to_string())).await.is_err() {
                return;
            }
        }
        self.persist_and_finish(document, request, NO_CONTEXT_ANSWER.to_string(), Vec::new(), tx)
            .await;
    }

    async fn persist_and_finish(
        &self,
        document: &Document,
        request: &AskRequest,
        answer: String,
        citations: Vec<Citation>,
        tx: mpsc::Sender<AnswerEvent>,
    ) {
        let record = QaRecord {
            id: Uuid::new_v4().to_string(),
            document_id: document.id.clone(),
            page_no: request.page_no,
            question: request.question.clone(),
            answer,
            citations: citations.clone(),
            scope_mode: request.scope,
            chat_provider: document.chat_provider.clone(),
            chat_model: document.chat_model.clone(),
            created_at: Utc::now(),
        };
        let qa_id = record.id.clone();

        if let Err(error) = self.store.append_qa(record).await {
            let _ = tx.send(AnswerEvent::Error(error.to_string())).await;
            return;
        }
        let _ = tx.send(AnswerEvent::Done { qa_id, citations }).await;
    }

    /// Q&A history of a document in creation order.
    pub async fn history(
        &self,
        document_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<QaRecord>, QueryError> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| QueryError::DocumentNotFound(document_id.to_string()))?;
        Ok(self.store.list_qa(document_id, offset, limit).await?)
    }
}

/// Drain an answer stream into (answer text, terminal event).
pub async fn collect_answer(
    mut events: mpsc::Receiver<AnswerEvent>,
) -> (String, Option<AnswerEvent>) {
    let mut answer = String::new();
    while let Some(event) = events.recv().await {
        match event {
            AnswerEvent::Token(token) => answer.push_str(&token),
            terminal => return (answer, Some(terminal)),
        }
    }
    (answer, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatProvider, ScriptedChat, TokenStream};
    use crate::error::ProviderError;
    use async_trait::async_trait;
    use crate::chunking::ChunkerConfig;
    use crate::embeddings::{EmbeddingProvider, EmbeddingRegistry, HashEmbeddings, HASH_ID};
    use crate::index::{CollectionKey, MemoryVectorIndex, VectorIndex, VectorPoint};
    use crate::models::{Chunk, Page};
    use crate::store::MemoryDocumentStore;
    use std::time::Duration;

    struct Fixture {
        engine: QaEngine,
        store: Arc<MemoryDocumentStore>,
    }

    async fn fixture(script: &str, page_texts: &[&str]) -> Fixture {
        fixture_with_chat(Arc::new(ScriptedChat::new(script)), page_texts).await
    }

    async fn fixture_with_chat(provider: Arc<dyn ChatProvider>, page_texts: &[&str]) -> Fixture {
        let store = Arc::new(MemoryDocumentStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        let embedder = HashEmbeddings::default();
        let key = CollectionKey::new(embedder.id(), embedder.dimensions());
        index.ensure_collection(&key).await.unwrap();

        store
            .create_document(Document {
                id: "doc".to_string(),
                owner_id: "user".to_string(),
                title: "Deck".to_string(),
                checksum: "abc".to_string(),
                page_count: Some(page_texts.len() as u32),
                ingestion_completed: true,
                ingestion_error: None,
                embedding_provider: HASH_ID.to_string(),
                chat_provider: "scripted".to_string(),
                chat_model: "scripted-1".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut points = Vec::new();
        for (page_no, text) in page_texts.iter().enumerate() {
            let page_no = page_no as u32;
            store
                .put_page(Page {
                    document_id: "doc".to_string(),
                    page_no,
                    text: (*text).to_string(),
                    preview_image: String::new(),
                    summary: None,
                    key_terms: None,
                    ready: true,
                    error: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();

            if !text.trim().is_empty() {
                let chunk = Chunk {
                    document_id: "doc".to_string(),
                    page_no,
                    chunk_index: 0,
                    text: (*text).to_string(),
                    token_count: text.len() / 4,
                };
                let vector = embedder.embed(&[(*text).to_string()]).await.unwrap().remove(0);
                points.push(VectorPoint { chunk, vector });
            }
        }
        if !points.is_empty() {
            index.upsert(&key, points).await.unwrap();
        }

        let mut embeddings = EmbeddingRegistry::new();
        embeddings.register(Arc::new(HashEmbeddings::default()));
        let retrieval = Arc::new(RetrievalEngine::new(
            store.clone(),
            index,
            Arc::new(embeddings),
            ChunkerConfig::default(),
        ));
        let mut chat = ChatRegistry::new();
        chat.register(provider);

        Fixture {
            engine: QaEngine::new(store.clone(), retrieval, Arc::new(chat)),
            store,
        }
    }

    /// Streams a couple of tokens and then the error a provider emits when
    /// its byte stream ends before the protocol stop marker.
    struct TruncatedChat;

    #[async_trait]
    impl ChatProvider for TruncatedChat {
        fn id(&self) -> &str {
            "scripted"
        }

        fn models(&self) -> Vec<String> {
            vec!["scripted-1".to_string()]
        }

        fn default_model(&self) -> &str {
            "scripted-1"
        }

        fn available(&self) -> bool {
            true
        }

        async fn stream_completion(
            &self,
            _request: ChatRequest,
        ) -> Result<TokenStream, ProviderError> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for token in ["The answer ", "begins but "] {
                    if tx.send(Ok(token.to_string())).await.is_err() {
                        return;
                    }
                }
                let _ = tx
                    .send(Err(ProviderError::Stream(
                        "stream ended before completion marker".to_string(),
                    )))
                    .await;
            });
            Ok(rx)
        }
    }

    fn ask(question: &str) -> AskRequest {
        AskRequest {
            document_id: "doc".to_string(),
            page_no: 0,
            question: question.to_string(),
            scope: ScopeMode::Page,
            top_k: None,
        }
    }

    #[tokio::test]
    async fn grounded_answer_streams_persists_and_cites() {
        let fixture = fixture(
            "Water boils at one hundred degrees [page:0, chunk:0].",
            &["Water boils at one hundred degrees Celsius at sea level."],
        )
        .await;

        let events = fixture.engine.ask(ask("When does water boil?")).await.unwrap();
        let (answer, terminal) = collect_answer(events).await;

        assert!(answer.contains("one hundred degrees"));
        let Some(AnswerEvent::Done { qa_id, citations }) = terminal else {
            panic!("expected a Done event");
        };
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].page_no, 0);

        let history = fixture.engine.history("doc", 0, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, qa_id);
        assert_eq!(history[0].citations, citations);
    }

    #[tokio::test]
    async fn empty_retrieval_streams_the_canned_answer_with_no_citations() {
        let fixture = fixture("irrelevant", &["   "]).await;

        let events = fixture.engine.ask(ask("Anything here?")).await.unwrap();
        let (answer, terminal) = collect_answer(events).await;

        assert!(answer.contains("No grounding context was found"));
        assert!(matches!(
            terminal,
            Some(AnswerEvent::Done { ref citations, .. }) if citations.is_empty()
        ));
        assert_eq!(fixture.engine.history("doc", 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn truncated_provider_stream_errors_and_persists_nothing() {
        let fixture = fixture_with_chat(
            Arc::new(TruncatedChat),
            &["Enzymes lower the activation energy of reactions."],
        )
        .await;

        let events = fixture
            .engine
            .ask(ask("What do enzymes do?"))
            .await
            .unwrap();
        let (answer, terminal) = collect_answer(events).await;

        assert!(answer.starts_with("The answer"));
        assert!(matches!(terminal, Some(AnswerEvent::Error(_))));
        assert!(fixture.store.list_qa("doc", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_receiver_abandons_the_answer_unrecorded() {
        let long_script = "word ".repeat(500);
        let fixture = fixture(&long_script, &["word word word word."]).await;

        let mut events = fixture.engine.ask(ask("word?")).await.unwrap();
        assert!(matches!(events.recv().await, Some(AnswerEvent::Token(_))));
        drop(events);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fixture.store.list_qa("doc", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ingested_document_answers_questions_end_to_end() {
        use crate::extractor::FixedExtractor;
        use crate::pipeline::{IngestionPipeline, NewDocument, PipelineConfig};

        let store = Arc::new(MemoryDocumentStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        let mut embeddings = EmbeddingRegistry::new();
        embeddings.register(Arc::new(HashEmbeddings::default()));
        let embeddings = Arc::new(embeddings);
        let mut chat = ChatRegistry::new();
        chat.register(Arc::new(ScriptedChat::new(
            "Enzymes lower activation energy [page:0, chunk:0].",
        )));
        let chat = Arc::new(chat);

        let pipeline = IngestionPipeline::new(
            store.clone(),
            index.clone(),
            embeddings.clone(),
            chat.clone(),
            Arc::new(FixedExtractor::from_texts(&[
                "Enzymes are catalysts. They lower the activation energy of reactions.",
            ])),
            PipelineConfig::default(),
        );

        let document_id = pipeline
            .enqueue(NewDocument {
                owner_id: "user".to_string(),
                title: "Enzymes".to_string(),
                bytes: b"%PDF stand-in".to_vec(),
                embedding_provider: HASH_ID.to_string(),
                chat_provider: "scripted".to_string(),
                chat_model: None,
            })
            .await
            .unwrap();

        for _ in 0..500 {
            if pipeline.document(&document_id).await.unwrap().ingestion_completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(pipeline.document(&document_id).await.unwrap().ingestion_completed);

        let retrieval = Arc::new(RetrievalEngine::new(
            store.clone(),
            index,
            embeddings,
            ChunkerConfig::default(),
        ));
        let engine = QaEngine::new(store, retrieval, chat);

        let events = engine
            .ask(AskRequest {
                document_id,
                page_no: 0,
                question: "What do enzymes do to activation energy?".to_string(),
                scope: ScopeMode::Page,
                top_k: None,
            })
            .await
            .unwrap();
        let (answer, terminal) = collect_answer(events).await;

        assert!(answer.contains("activation energy"));
        let Some(AnswerEvent::Done { citations, .. }) = terminal else {
            panic!("expected a Done event");
        };
        assert_eq!(citations.len(), 1);
        assert_eq!((citations[0].page_no, citations[0].chunk_index), (0, 0));
    }

    #[tokio::test]
    async fn unknown_document_fails_before_any_stream_exists() {
        let fixture = fixture("irrelevant", &["text"]).await;
        let mut request = ask("hello?");
        request.document_id = "missing".to_string();

        assert!(matches!(
            fixture.engine.ask(request).await,
            Err(QueryError::DocumentNotFound(_))
        ));
    }
}
