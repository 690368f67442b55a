use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const OPENAI_SMALL_ID: &str = "openai_small";
pub const OPENAI_SMALL_DIMENSIONS: usize = 1536;
pub const HASH_ID: &str = "hash";
pub const HASH_DIMENSIONS: usize = 256;

/// A backend that turns text batches into fixed-dimension vectors. Every
/// backend declares a stable identifier and its dimensionality; vectors from
/// different backends are never comparable.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn id(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Whether the backend can serve requests (e.g. credentials present).
    fn available(&self) -> bool;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// OpenAI `text-embedding-3-small` (1536 dimensions). Unavailable when
/// `OPENAI_API_KEY` is not set; the caller surfaces that instead of crashing.
pub struct OpenAiEmbeddings {
    api_key: Option<String>,
    model: String,
    endpoint: String,
    client: Client,
}

impl OpenAiEmbeddings {
    pub fn from_env() -> Self {
        Self {
            api_key: read_env_key("OPENAI_API_KEY"),
            model: "text-embedding-3-small".to_string(),
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            client: Client::new(),
        }
    }

    /// Point the provider at a different base endpoint (test servers).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn id(&self) -> &str {
        OPENAI_SMALL_ID
    }

    fn dimensions(&self) -> usize {
        OPENAI_SMALL_DIMENSIONS
    }

    fn available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ProviderError::Unavailable("OPENAI_API_KEY not set".to_string()))?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, detail));
        }

        let payload: Value = response.json().await?;
        parse_embedding_response(&payload, texts.len())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

fn parse_embedding_response(payload: &Value, expected: usize) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = payload
        .pointer("/data")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Stream("embedding response missing data array".to_string()))?;

    // Entries are returned with an index field; order by it rather than
    // trusting response order.
    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for item in data {
        let index = item
            .pointer("/index")
            .and_then(Value::as_u64)
            .unwrap_or(indexed.len() as u64) as usize;
        let vector = item
            .pointer("/embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Stream("embedding entry missing vector".to_string()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(index, _)| *index);

    if indexed.len() != expected {
        return Err(ProviderError::Stream(format!(
            "embedding response had {} vectors for {} inputs",
            indexed.len(),
            expected
        )));
    }

    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}

/// Deterministic local embedder: normalized character-trigram FNV hashing.
/// Always available; used for tests and offline runs.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbeddings {
    pub dimensions: usize,
}

impl Default for HashEmbeddings {
    fn default() -> Self {
        Self {
            dimensions: HASH_DIMENSIONS,
        }
    }
}

impl HashEmbeddings {
    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    fn id(&self) -> &str {
        HASH_ID
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn available(&self) -> bool {
        true
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EmbeddingProviderInfo {
    pub id: String,
    pub available: bool,
    pub dimensions: usize,
}

/// Runtime registry of embedding backends keyed by provider id. Selection is
/// explicit per request; there is no global default.
#[derive(Default, Clone)]
pub struct EmbeddingRegistry {
    providers: BTreeMap<String, Arc<dyn EmbeddingProvider>>,
}

impl EmbeddingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard backends: OpenAI (credential-gated) and the
    /// local hash embedder.
    pub fn with_standard_providers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiEmbeddings::from_env()));
        registry.register(Arc::new(HashEmbeddings::default()));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(id.to_string()))
    }

    pub fn list(&self) -> Vec<EmbeddingProviderInfo> {
        self.providers
            .values()
            .map(|provider| EmbeddingProviderInfo {
                id: provider.id().to_string(),
                available: provider.available(),
                dimensions: provider.dimensions(),
            })
            .collect()
    }
}

fn read_env_key(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
