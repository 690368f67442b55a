use crate::models::Chunk;
use regex::Regex;
use std::sync::OnceLock;

/// Token budgets for sentence-aware chunking. Token counts are estimated at
/// roughly four characters per token, which is cheap and close enough for
/// budgeting purposes.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    pub target_tokens: usize,
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: 600,
            min_tokens: 400,
            max_tokens: 800,
            overlap_tokens: 75,
        }
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

fn sentence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^.!?]*[.!?]+\s*").expect("sentence regex compiles"))
}

/// Split text into trimmed sentences, keeping terminal punctuation. Text
/// after the last terminator becomes a final sentence of its own.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut consumed = 0;

    for found in sentence_regex().find_iter(text) {
        let sentence = found.as_str().trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        consumed = found.end();
    }

    let tail = text[consumed..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }

    sentences
}

/// Chunk one page's text into overlapping, sentence-aware spans.
///
/// Chunks stay within `max_tokens` unless a single sentence alone exceeds it,
/// in which case that sentence is hard-split. Consecutive chunks share the
/// trailing sentences that fit within `overlap_tokens`. Empty or whitespace
/// text yields no chunks.
pub fn chunk_page_text(
    text: &str,
    document_id: &str,
    page_no: u32,
    config: ChunkerConfig,
) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut sentences = Vec::new();
    for sentence in split_sentences(text) {
        if estimate_tokens(&sentence) > config.max_tokens {
            sentences.extend(hard_split(&sentence, config.max_tokens));
        } else {
            sentences.push(sentence);
        }
    }

    let mut chunks: Vec<(String, usize)> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_size = 0usize;
    let mut fresh_sentences = 0usize;

    for sentence in sentences {
        let sentence_size = estimate_tokens(&sentence);

        if current_size + sentence_size > config.max_tokens && !current.is_empty() {
            // A pure overlap seed repeats text already emitted, so it is
            // dropped rather than flushed as its own chunk.
            if fresh_sentences > 0 {
                chunks.push((current.join(" "), current_size));
                let seed = overlap_sentences(&current, config.overlap_tokens);
                current_size = seed.iter().map(|s| estimate_tokens(s)).sum();
                current = seed;
            } else {
                current.clear();
                current_size = 0;
            }
            fresh_sentences = 0;
            // The seed plus a near-max sentence can still bust the budget.
            if current_size + sentence_size > config.max_tokens {
                current.clear();
                current_size = 0;
            }
        }

        current.push(sentence);
        current_size += sentence_size;
        fresh_sentences += 1;

        if current_size >= config.target_tokens && current_size >= config.min_tokens {
            chunks.push((current.join(" "), current_size));
            let seed = overlap_sentences(&current, config.overlap_tokens);
            current_size = seed.iter().map(|s| estimate_tokens(s)).sum();
            current = seed;
            fresh_sentences = 0;
        }
    }

    // A tail made only of overlap seeds repeats text already emitted.
    if !current.is_empty() && fresh_sentences > 0 {
        let tail = current.join(" ");
        if current_size >= config.min_tokens || chunks.is_empty() {
            chunks.push((tail, current_size));
        } else if let Some(last) = chunks.last_mut() {
            if last.1 + current_size <= config.max_tokens {
                last.0.push(' ');
                last.0.push_str(&tail);
                last.1 += current_size;
            } else {
                chunks.push((tail, current_size));
            }
        }
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(index, (chunk_text, token_count))| Chunk {
            document_id: document_id.to_string(),
            page_no,
            chunk_index: index as u32,
            text: chunk_text,
            token_count,
        })
        .collect()
}

/// Split an oversized sentence into pieces at the max-token boundary.
fn hard_split(sentence: &str, max_tokens: usize) -> Vec<String> {
    let budget_chars = max_tokens.max(1) * 4;
    let chars: Vec<char> = sentence.chars().collect();

    chars
        .chunks(budget_chars)
        .map(|piece| piece.iter().collect::<String>().trim().to_string())
        .filter(|piece| !piece.is_empty())
        .collect()
}

/// Trailing sentences that fit within the overlap token budget, in order.
fn overlap_sentences(sentences: &[String], overlap_tokens: usize) -> Vec<String> {
    let mut seed = Vec::new();
    let mut used = 0usize;

    for sentence in sentences.iter().rev() {
        let size = estimate_tokens(sentence);
        if used + size > overlap_tokens {
            break;
        }
        seed.insert(0, sentence.clone());
        used += size;
    }

    seed
}
