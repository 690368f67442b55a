pub mod chat;
pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod index;
pub mod models;
pub mod pipeline;
pub mod qa;
pub mod retrieval;
pub mod search;
pub mod store;

pub use chat::{
    collect_completion, AnthropicChat, ChatProvider, ChatProviderInfo, ChatRegistry, ChatRequest,
    OpenAiChat, ScriptedChat, TokenStream, ANTHROPIC_CHAT_ID, OPENAI_CHAT_ID, SCRIPTED_CHAT_ID,
};
pub use chunking::{chunk_page_text, estimate_tokens, split_sentences, ChunkerConfig};
pub use embeddings::{
    EmbeddingProvider, EmbeddingProviderInfo, EmbeddingRegistry, HashEmbeddings, OpenAiEmbeddings,
    HASH_DIMENSIONS, HASH_ID, OPENAI_SMALL_DIMENSIONS, OPENAI_SMALL_ID,
};
pub use error::{IndexError, IngestError, ProviderError, QueryError, StoreError};
pub use extractor::{preview_image_path, FixedExtractor, LopdfExtractor, PdfExtractor};
pub use index::{
    cosine_similarity, CollectionKey, MemoryVectorIndex, SearchFilter, VectorHit, VectorIndex,
    VectorPoint,
};
pub use models::{
    Chunk, Citation, Document, Page, PageStatus, PageView, QaRecord, RetrievalOrigin,
    RetrievedChunk, ScopeMode, SearchHit, SearchHitKind,
};
pub use pipeline::{
    parse_summary_response, IngestionPipeline, NewDocument, PipelineConfig,
};
pub use qa::{collect_answer, AnswerEvent, AskRequest, QaEngine, NO_CONTEXT_ANSWER};
pub use retrieval::{
    build_context_prompt, extract_citations, RetrievalEngine, DEFAULT_TOP_K,
};
pub use search::{SearchEngine, DEFAULT_SEARCH_LIMIT};
pub use store::{DocumentStore, MemoryDocumentStore};
