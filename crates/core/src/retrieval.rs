use crate::chunking::{chunk_page_text, ChunkerConfig};
use crate::embeddings::EmbeddingRegistry;
use crate::error::QueryError;
use crate::index::{CollectionKey, SearchFilter, VectorIndex};
use crate::models::{Citation, Document, RetrievalOrigin, RetrievedChunk, ScopeMode};
use crate::store::DocumentStore;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::OnceLock;

pub const DEFAULT_TOP_K: usize = 6;

/// How much longer than `top_k` the vector candidate list is, so the merge
/// still has material after lexical deduplication.
const OVERFETCH_FACTOR: usize = 2;

const CITATION_QUOTE_CHARS: usize = 200;

/// Finds the grounding chunks for a question: vector search over the scoped
/// page range, a lexical pass over the same pages, then a merge where vector
/// hits take precedence.
pub struct RetrievalEngine {
    store: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    embeddings: Arc<EmbeddingRegistry>,
    chunker: ChunkerConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        embeddings: Arc<EmbeddingRegistry>,
        chunker: ChunkerConfig,
    ) -> Self {
        Self {
            store,
            index,
            embeddings,
            chunker,
        }
    }

    pub async fn retrieve(
        &self,
        document: &Document,
        page_no: u32,
        question: &str,
        scope: ScopeMode,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, QueryError> {
        let page_range = scope.page_range(page_no);

        let vector_hits = self.vector_candidates(document, question, page_range, top_k).await?;
        let lexical_hits = self
            .lexical_candidates(&document.id, question, page_range, top_k)
            .await?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut merged = Vec::new();
        for hit in vector_hits.into_iter().chain(lexical_hits) {
            if seen.insert(hit.chunk.chunk_id()) {
                merged.push(hit);
            }
        }
        merged.truncate(top_k);
        Ok(merged)
    }

    async fn vector_candidates(
        &self,
        document: &Document,
        question: &str,
        page_range: Option<(u32, u32)>,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, QueryError> {
        let embedder = self.embeddings.get(&document.embedding_provider)?;
        let mut vectors = embedder.embed(&[question.to_string()]).await?;
        let query = vectors
            .pop()
            .ok_or_else(|| QueryError::Request("embedding backend returned no vector".into()))?;

        let key = CollectionKey::new(embedder.id(), embedder.dimensions());
        let filter = SearchFilter::document(&document.id).with_page_range(page_range);
        let hits = self
            .index
            .search(&key, &query, top_k * OVERFETCH_FACTOR, &filter)
            .await?;

        Ok(hits
            .into_iter()
            .map(|hit| RetrievedChunk {
                chunk: hit.chunk,
                score: hit.score,
                origin: RetrievalOrigin::Vector,
            })
            .collect())
    }

    /// Keyword pass over the scoped pages. Chunk texts are rebuilt from the
    /// stored page text with the ingestion chunker, so lexical hits carry the
    /// same chunk ids as their vector counterparts.
    async fn lexical_candidates(
        &self,
        document_id: &str,
        question: &str,
        page_range: Option<(u32, u32)>,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, QueryError> {
        let terms = query_terms(question);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let pages = self
            .store
            .list_pages(document_id, 0, usize::MAX)
            .await?;

        let mut scored = Vec::new();
        for page in pages {
            if !page.ready {
                continue;
            }
            if let Some((low, high)) = page_range {
                if page.page_no < low || page.page_no > high {
                    continue;
                }
            }
            for chunk in chunk_page_text(&page.text, document_id, page.page_no, self.chunker) {
                let score = lexical_score(&chunk.text, &terms);
                if score > 0.0 {
                    scored.push(RetrievedChunk {
                        chunk,
                        score,
                        origin: RetrievalOrigin::Lexical,
                    });
                }
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.chunk.page_no.cmp(&b.chunk.page_no))
                .then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

fn query_terms(question: &str) -> Vec<String> {
    let lowered = question.to_lowercase();
    let mut seen = HashSet::new();
    let mut terms = Vec::new();
    for term in lowered.split(|c: char| !c.is_alphanumeric()) {
        if term.len() >= 3 && seen.insert(term) {
            terms.push(term.to_string());
        }
    }
    terms
}

/// Fraction of the query terms present in the chunk text.
fn lexical_score(text: &str, terms: &[String]) -> f64 {
    let haystack = text.to_lowercase();
    let matched = terms.iter().filter(|term| haystack.contains(*term)).count();
    matched as f64 / terms.len() as f64
}

pub const ANSWER_SYSTEM_PROMPT: &str = "You are a teaching assistant answering questions about a \
document. Answer only from the provided context. After each claim, cite its source chunk with a \
marker of the form [page:P, chunk:C] matching a context block header. If the context does not \
contain the answer, say so plainly instead of guessing.";

/// Assemble the user prompt: one tagged context block per retrieved chunk,
/// then the question.
pub fn build_context_prompt(chunks: &[RetrievedChunk], question: &str) -> String {
    let mut prompt = String::from("Context:\n\n");
    for retrieved in chunks {
        let chunk = &retrieved.chunk;
        prompt.push_str(&format!(
            "[page:{}, chunk:{}]\n{}\n\n",
            chunk.page_no, chunk.chunk_index, chunk.text
        ));
    }
    prompt.push_str(&format!("Question: {question}"));
    prompt
}

fn citation_regexes() -> &'static [Regex; 2] {
    static RES: OnceLock<[Regex; 2]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"(?i)\[page:(\d+),\s*chunk:(\d+)\]").expect("citation regex compiles"),
            Regex::new(r"(?i)\[p(\d+):c(\d+)\]").expect("short citation regex compiles"),
        ]
    })
}

/// Pull citation markers out of a finished answer and resolve them against
/// the retrieved chunks. Markers pointing at chunks that were never retrieved
/// are dropped; duplicates collapse to one citation. The quote is the start
/// of the cited chunk's text.
pub fn extract_citations(answer: &str, retrieved: &[RetrievedChunk]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    let mut citations = Vec::new();

    for regex in citation_regexes() {
        for capture in regex.captures_iter(answer) {
            let (Ok(page_no), Ok(chunk_index)) =
                (capture[1].parse::<u32>(), capture[2].parse::<u32>())
            else {
                continue;
            };
            if !seen.insert((page_no, chunk_index)) {
                continue;
            }
            let Some(source) = retrieved
                .iter()
                .find(|r| r.chunk.page_no == page_no && r.chunk.chunk_index == chunk_index)
            else {
                continue;
            };
            citations.push(Citation {
                page_no,
                chunk_index,
                quote: source.chunk.text.chars().take(CITATION_QUOTE_CHARS).collect(),
            });
        }
    }
    citations
}
