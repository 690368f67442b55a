use crate::error::IndexError;
use crate::models::Chunk;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One collection per (embedding provider, dimensionality) pair. Vectors
/// from different providers live in separate collections and are never
/// compared against each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub provider_id: String,
    pub dimensions: usize,
}

impl CollectionKey {
    pub fn new(provider_id: impl Into<String>, dimensions: usize) -> Self {
        Self {
            provider_id: provider_id.into(),
            dimensions,
        }
    }

    pub fn name(&self) -> String {
        format!("chunks_{}_{}", self.provider_id, self.dimensions)
    }
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk: Chunk,
    pub score: f64,
}

/// Equality filter on document id, with an optional inclusive page range for
/// scoped retrieval.
#[derive(Debug, Clone)]
pub struct SearchFilter {
    pub document_id: String,
    pub page_range: Option<(u32, u32)>,
}

impl SearchFilter {
    pub fn document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            page_range: None,
        }
    }

    pub fn with_page_range(mut self, range: Option<(u32, u32)>) -> Self {
        self.page_range = range;
        self
    }

    fn matches(&self, chunk: &Chunk) -> bool {
        if chunk.document_id != self.document_id {
            return false;
        }
        match self.page_range {
            Some((low, high)) => chunk.page_no >= low && chunk.page_no <= high,
            None => true,
        }
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn ensure_collection(&self, key: &CollectionKey) -> Result<(), IndexError>;

    /// Idempotent on chunk id: re-ingesting a chunk overwrites its point.
    async fn upsert(&self, key: &CollectionKey, points: Vec<VectorPoint>) -> Result<(), IndexError>;

    /// Top-k nearest points by cosine similarity within the filter. Ties are
    /// broken by (page, chunk) order so results are deterministic.
    async fn search(
        &self,
        key: &CollectionKey,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorHit>, IndexError>;

    /// Number of points stored for a document in one collection.
    async fn count_document(&self, key: &CollectionKey, document_id: &str) -> Result<usize, IndexError>;

    /// Remove a document's points from every collection (cascade delete).
    async fn delete_document(&self, document_id: &str) -> Result<(), IndexError>;
}

/// In-process vector index: a cosine-similarity scan per collection. The
/// reference implementation behind the [`VectorIndex`] seam.
#[derive(Default)]
pub struct MemoryVectorIndex {
    collections: RwLock<HashMap<CollectionKey, HashMap<String, VectorPoint>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn ensure_collection(&self, key: &CollectionKey) -> Result<(), IndexError> {
        let mut collections = self.collections.write().await;
        collections.entry(key.clone()).or_default();
        Ok(())
    }

    async fn upsert(&self, key: &CollectionKey, points: Vec<VectorPoint>) -> Result<(), IndexError> {
        for point in &points {
            if point.vector.len() != key.dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: key.dimensions,
                    actual: point.vector.len(),
                });
            }
        }

        let mut collections = self.collections.write().await;
        let collection = collections.entry(key.clone()).or_default();
        for point in points {
            collection.insert(point.chunk.chunk_id(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        key: &CollectionKey,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorHit>, IndexError> {
        if query.len() != key.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: key.dimensions,
                actual: query.len(),
            });
        }

        let collections = self.collections.read().await;
        let collection = match collections.get(key) {
            Some(collection) => collection,
            None => return Ok(Vec::new()),
        };

        let mut hits: Vec<VectorHit> = collection
            .values()
            .filter(|point| filter.matches(&point.chunk))
            .map(|point| VectorHit {
                chunk: point.chunk.clone(),
                score: cosine_similarity(query, &point.vector) as f64,
            })
            .collect();

        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.chunk.page_no.cmp(&right.chunk.page_no))
                .then_with(|| left.chunk.chunk_index.cmp(&right.chunk.chunk_index))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn count_document(&self, key: &CollectionKey, document_id: &str) -> Result<usize, IndexError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(key)
            .map(|collection| {
                collection
                    .values()
                    .filter(|point| point.chunk.document_id == document_id)
                    .count()
            })
            .unwrap_or(0))
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), IndexError> {
        let mut collections = self.collections.write().await;
        for collection in collections.values_mut() {
            collection.retain(|_, point| point.chunk.document_id != document_id);
        }
        Ok(())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator < f32::EPSILON {
        return 0.0;
    }
    dot / denominator
}
