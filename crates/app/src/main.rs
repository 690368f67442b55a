use chrono::Utc;
use clap::{Parser, Subcommand};
use deckchat_core::{
    AnswerEvent, AskRequest, ChatRegistry, ChunkerConfig, EmbeddingRegistry,
    IngestionPipeline, LopdfExtractor, MemoryDocumentStore, MemoryVectorIndex, NewDocument,
    PageStatus, PipelineConfig, QaEngine, RetrievalEngine, ScopeMode, SearchEngine,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "deckchat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Embedding backend id (hash runs offline; openai_small needs OPENAI_API_KEY)
    #[arg(long, default_value = "hash")]
    embedding_provider: String,

    /// Chat backend id (scripted runs offline; openai/anthropic need credentials)
    #[arg(long, default_value = "scripted")]
    chat_provider: String,

    /// Chat model; defaults to the backend's default model
    #[arg(long)]
    chat_model: Option<String>,

    /// Owner id attached to ingested documents
    #[arg(long, default_value = "local", env = "DECKCHAT_OWNER")]
    owner: String,
}

/// Provider flags shared by every subcommand, split out of [`Cli`] so the
/// parsed command can be consumed independently of them.
struct ProviderSelection {
    embedding_provider: String,
    chat_provider: String,
    chat_model: Option<String>,
    owner: String,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a PDF and report per-page readiness as it happens.
    Ingest {
        /// Path to the PDF file
        #[arg(long)]
        file: String,
    },
    /// Ingest a PDF, then stream a grounded answer about one of its pages.
    Ask {
        /// Path to the PDF file
        #[arg(long)]
        file: String,
        /// 0-based page the question is about
        #[arg(long, default_value = "0")]
        page: u32,
        /// The question
        #[arg(long)]
        question: String,
        /// Retrieval scope: page, near, or deck
        #[arg(long, default_value = "page")]
        scope: ScopeMode,
        /// Number of grounding chunks to retrieve
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Ingest a PDF, then keyword-search its pages and Q&A history.
    Search {
        /// Path to the PDF file
        #[arg(long)]
        file: String,
        /// Search query
        #[arg(long)]
        query: String,
        /// Maximum hits to print
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List the registered embedding and chat backends and their availability.
    Providers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let Cli {
        command,
        embedding_provider,
        chat_provider,
        chat_model,
        owner,
    } = Cli::parse();
    let providers = ProviderSelection {
        embedding_provider,
        chat_provider,
        chat_model,
        owner,
    };

    let store = Arc::new(MemoryDocumentStore::new());
    let index = Arc::new(MemoryVectorIndex::new());
    let embeddings = Arc::new(EmbeddingRegistry::with_standard_providers());
    let chat = Arc::new(ChatRegistry::with_standard_providers());

    let pipeline = IngestionPipeline::new(
        store.clone(),
        index.clone(),
        embeddings.clone(),
        chat.clone(),
        Arc::new(LopdfExtractor),
        PipelineConfig::default(),
    );

    info!(started_at = %Utc::now().to_rfc3339(), "deckchat boot");

    match command {
        Command::Ingest { file } => {
            ingest_and_wait(&providers, &pipeline, &file).await?;
        }
        Command::Ask {
            file,
            page,
            question,
            scope,
            top_k,
        } => {
            let document_id = ingest_and_wait(&providers, &pipeline, &file).await?;

            let retrieval = Arc::new(RetrievalEngine::new(
                store.clone(),
                index.clone(),
                embeddings.clone(),
                ChunkerConfig::default(),
            ));
            let engine = QaEngine::new(store.clone(), retrieval, chat.clone());

            let mut events = engine
                .ask(AskRequest {
                    document_id,
                    page_no: page,
                    question,
                    scope,
                    top_k,
                })
                .await?;

            let mut stdout = std::io::stdout();
            while let Some(event) = events.recv().await {
                match event {
                    AnswerEvent::Token(token) => {
                        print!("{token}");
                        stdout.flush()?;
                    }
                    AnswerEvent::Done { qa_id, citations } => {
                        println!();
                        println!("qa_id: {qa_id}");
                        for citation in citations {
                            println!(
                                "citation: page={} chunk={} quote={:?}",
                                citation.page_no, citation.chunk_index, citation.quote
                            );
                        }
                    }
                    AnswerEvent::Error(message) => {
                        println!();
                        anyhow::bail!("answer failed: {message}");
                    }
                }
            }
        }
        Command::Search { file, query, limit } => {
            ingest_and_wait(&providers, &pipeline, &file).await?;

            let engine = SearchEngine::new(store.clone());
            let hits = engine.search(&providers.owner, &query, None, limit).await?;

            if hits.is_empty() {
                println!("no hits");
            }
            for hit in hits {
                println!(
                    "[{:?}] score={:.2} page={} snippet={}",
                    hit.kind, hit.score, hit.page_no, hit.snippet
                );
            }
        }
        Command::Providers => {
            for info in embeddings.list() {
                println!(
                    "embedding: id={} dimensions={} available={}",
                    info.id, info.dimensions, info.available
                );
            }
            for info in chat.list() {
                println!(
                    "chat: id={} default_model={} available={} models={}",
                    info.id,
                    info.default_model,
                    info.available,
                    info.models.join(",")
                );
            }
        }
    }

    Ok(())
}

/// Enqueue the file and poll until every page reached a terminal state,
/// printing readiness as pages land. Returns the document id.
async fn ingest_and_wait(
    providers: &ProviderSelection,
    pipeline: &IngestionPipeline,
    file: &str,
) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(file).await?;
    let title = std::path::Path::new(file)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string());

    let document_id = pipeline
        .enqueue(NewDocument {
            owner_id: providers.owner.clone(),
            title,
            bytes,
            embedding_provider: providers.embedding_provider.clone(),
            chat_provider: providers.chat_provider.clone(),
            chat_model: providers.chat_model.clone(),
        })
        .await?;
    println!("document: {document_id}");

    let mut reported = std::collections::HashSet::new();
    loop {
        let document = pipeline.document(&document_id).await?;
        if let Some(error) = &document.ingestion_error {
            anyhow::bail!("ingestion failed: {error}");
        }

        let mut terminal = 0u32;
        if let Some(page_count) = document.page_count {
            for page_no in 0..page_count {
                let view = pipeline.page_view(&document_id, page_no).await?;
                match view.status {
                    PageStatus::Ready => {
                        terminal += 1;
                        if reported.insert(page_no) {
                            println!("page {page_no}: ready");
                            if let Some(summary) = view.summary {
                                println!("  summary: {summary}");
                            }
                            if !view.key_terms.is_empty() {
                                println!("  key terms: {}", view.key_terms.join(", "));
                            }
                        }
                    }
                    PageStatus::Failed => {
                        terminal += 1;
                        if reported.insert(page_no) {
                            println!(
                                "page {page_no}: failed ({})",
                                view.error.unwrap_or_default()
                            );
                        }
                    }
                    PageStatus::Processing => {}
                }
            }

            if terminal == page_count {
                let document = pipeline.document(&document_id).await?;
                println!(
                    "ingestion {} at {}",
                    if document.ingestion_completed {
                        "completed"
                    } else {
                        "finished with failed pages"
                    },
                    Utc::now().to_rfc3339()
                );
                return Ok(document_id);
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
