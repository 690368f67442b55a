use crate::error::QueryError;
use crate::models::{SearchHit, SearchHitKind};
use crate::store::DocumentStore;
use std::sync::Arc;

pub const DEFAULT_SEARCH_LIMIT: usize = 20;

const PHRASE_WEIGHT: f64 = 2.0;
const PAGE_WORD_WEIGHT: f64 = 0.3;
const QUESTION_WORD_WEIGHT: f64 = 0.3;
const ANSWER_WORD_WEIGHT: f64 = 0.1;
const SNIPPET_CHARS: usize = 160;

/// Keyword search across everything a user has: page text and past Q&A.
/// An exact phrase match dominates; individual word matches rank the rest.
pub struct SearchEngine {
    store: Arc<dyn DocumentStore>,
}

impl SearchEngine {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Search the owner's documents, optionally narrowed to one document.
    /// Hits come back best-first, capped at `limit`.
    pub async fn search(
        &self,
        owner_id: &str,
        query: &str,
        document_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, QueryError> {
        let phrase = query.trim().to_lowercase();
        if phrase.is_empty() {
            return Ok(Vec::new());
        }
        let words = split_words(&phrase);

        let mut hits = Vec::new();

        for page in self.store.pages_for_search(owner_id, document_id).await? {
            if !page.ready {
                continue;
            }
            let text = page.text.to_lowercase();
            let mut score = 0.0;
            if text.contains(&phrase) {
                score += PHRASE_WEIGHT;
            }
            score += PAGE_WORD_WEIGHT * count_present(&text, &words) as f64;

            if score > 0.0 {
                hits.push(SearchHit {
                    kind: SearchHitKind::Page,
                    document_id: page.document_id.clone(),
                    page_no: page.page_no,
                    snippet: snippet(&page.text, &phrase),
                    score,
                });
            }
        }

        for record in self.store.qa_for_search(owner_id, document_id).await? {
            let question = record.question.to_lowercase();
            let answer = record.answer.to_lowercase();
            let mut score = 0.0;
            if question.contains(&phrase) || answer.contains(&phrase) {
                score += PHRASE_WEIGHT;
            }
            score += QUESTION_WORD_WEIGHT * count_present(&question, &words) as f64;
            score += ANSWER_WORD_WEIGHT * count_present(&answer, &words) as f64;

            if score > 0.0 {
                let source = if question.contains(&phrase) || count_present(&question, &words) > 0 {
                    &record.question
                } else {
                    &record.answer
                };
                hits.push(SearchHit {
                    kind: SearchHitKind::Qa,
                    document_id: record.document_id.clone(),
                    page_no: record.page_no,
                    snippet: snippet(source, &phrase),
                    score,
                });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.document_id.cmp(&b.document_id))
                .then(a.page_no.cmp(&b.page_no))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

fn split_words(phrase: &str) -> Vec<&str> {
    phrase
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() >= 3)
        .collect()
}

fn count_present(haystack: &str, words: &[&str]) -> usize {
    words.iter().filter(|word| haystack.contains(*word)).count()
}

/// A short window of the source text centered on the first phrase match,
/// or the start of the text when the phrase never occurs verbatim.
fn snippet(text: &str, phrase: &str) -> String {
    let lowered = text.to_lowercase();
    let mut anchor = lowered.find(phrase).unwrap_or(0).min(text.len());
    while anchor > 0 && !text.is_char_boundary(anchor) {
        anchor -= 1;
    }
    let start = text[..anchor]
        .char_indices()
        .rev()
        .take(SNIPPET_CHARS / 4)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);

    let window: String = text[start..].chars().take(SNIPPET_CHARS).collect();
    let mut out = String::new();
    if start > 0 {
        out.push_str("...");
    }
    out.push_str(window.trim());
    if start + window.len() < text.len() {
        out.push_str("...");
    }
    out
}
