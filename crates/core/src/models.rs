use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An uploaded PDF owned by a single user. `page_count` is unknown until
/// extraction finishes; `ingestion_completed` flips to true only once every
/// page became ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub checksum: String,
    pub page_count: Option<u32>,
    pub ingestion_completed: bool,
    pub ingestion_error: Option<String>,
    pub embedding_provider: String,
    pub chat_provider: String,
    pub chat_model: String,
    pub created_at: DateTime<Utc>,
}

/// One PDF page. The `ready` flag transitions false -> true exactly once,
/// after chunking, embedding, and summarization succeeded; it never reverts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub document_id: String,
    pub page_no: u32,
    pub text: String,
    pub preview_image: String,
    pub summary: Option<String>,
    pub key_terms: Option<Vec<String>>,
    pub ready: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A contiguous span of a page's text, the unit of embedding and retrieval.
/// Immutable once created; deterministic from the page text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub document_id: String,
    pub page_no: u32,
    pub chunk_index: u32,
    pub text: String,
    pub token_count: usize,
}

impl Chunk {
    /// Stable point id; re-ingesting the same page overwrites rather than
    /// duplicates.
    pub fn chunk_id(&self) -> String {
        format!("{}_{}_{}", self.document_id, self.page_no, self.chunk_index)
    }
}

/// A (page, chunk) reference embedded in an answer, with a short quote from
/// the chunk it points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub page_no: u32,
    pub chunk_index: u32,
    pub quote: String,
}

/// One answered question. Created only after the streamed answer completed;
/// immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaRecord {
    pub id: String,
    pub document_id: String,
    pub page_no: u32,
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub scope_mode: ScopeMode,
    pub chat_provider: String,
    pub chat_model: String,
    pub created_at: DateTime<Utc>,
}

/// Page-range filter applied to retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeMode {
    /// Current page only.
    Page,
    /// [page - 2, page + 2], saturating at page 0.
    Near,
    /// The whole document.
    Deck,
}

impl ScopeMode {
    /// Inclusive page range for this scope, or `None` for no page filter.
    pub fn page_range(&self, page_no: u32) -> Option<(u32, u32)> {
        match self {
            Self::Page => Some((page_no, page_no)),
            Self::Near => Some((page_no.saturating_sub(2), page_no.saturating_add(2))),
            Self::Deck => None,
        }
    }
}

impl fmt::Display for ScopeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Page => "page",
            Self::Near => "near",
            Self::Deck => "deck",
        };
        f.write_str(name)
    }
}

impl FromStr for ScopeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "page" => Ok(Self::Page),
            "near" => Ok(Self::Near),
            "deck" => Ok(Self::Deck),
            other => Err(format!("unknown scope mode: {other}")),
        }
    }
}

/// Where a retrieved chunk came from in the hybrid merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalOrigin {
    Vector,
    Lexical,
}

/// A chunk selected as grounding context for a question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f64,
    pub origin: RetrievalOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchHitKind {
    Page,
    Qa,
}

/// One row of the global search result list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub kind: SearchHitKind,
    pub document_id: String,
    pub page_no: u32,
    pub snippet: String,
    pub score: f64,
}

/// Reader-facing view of a page: a not-ready page reports `Processing`
/// rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Processing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageView {
    pub page_no: u32,
    pub status: PageStatus,
    pub summary: Option<String>,
    pub key_terms: Vec<String>,
    pub preview_image: Option<String>,
    pub error: Option<String>,
    pub qa: Vec<QaRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_ranges_follow_the_mode() {
        assert_eq!(ScopeMode::Page.page_range(5), Some((5, 5)));
        assert_eq!(ScopeMode::Near.page_range(5), Some((3, 7)));
        assert_eq!(ScopeMode::Deck.page_range(5), None);
    }

    #[test]
    fn near_scope_saturates_at_page_zero() {
        assert_eq!(ScopeMode::Near.page_range(1), Some((0, 3)));
        assert_eq!(ScopeMode::Near.page_range(0), Some((0, 2)));
    }

    #[test]
    fn scope_mode_parses_case_insensitively() {
        assert_eq!("Deck".parse::<ScopeMode>(), Ok(ScopeMode::Deck));
        assert!("slide".parse::<ScopeMode>().is_err());
    }

    #[test]
    fn chunk_id_is_stable() {
        let chunk = Chunk {
            document_id: "doc-1".to_string(),
            page_no: 3,
            chunk_index: 2,
            text: "anything".to_string(),
            token_count: 2,
        };
        assert_eq!(chunk.chunk_id(), "doc-1_3_2");
    }
}
