//! Similarity index abstraction.
//!
//! The [`SimilarityIndex`] trait stores `(document_id, vector)` pairs
//! under embedding ids and answers threshold-bounded top-K cosine queries.
//! [`memory::InMemoryIndex`] is the exact, brute-force implementation;
//! the app crate wraps it with SQLite persistence.
//!
//! # Query semantics
//!
//! - Similarity is `1 - cosine_distance`, computed in double precision on
//!   raw (not pre-normalized) vectors.
//! - Each document appears at most once, scored by the best of its
//!   embeddings.
//! - Results satisfy `similarity >= threshold` and are ordered by
//!   similarity (desc), then document id (asc).
//!
//! # Representative vector
//!
//! A document's representative embedding is the one with the lowest
//! `chunk_index`; ties are broken by the lowest embedding id. The choice
//! does not depend on insertion order.

pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::models::Embedding;

/// One query hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub document_id: String,
    pub similarity: f64,
}

/// Abstract vector index.
///
/// Queries take `&self` and must not block each other; writers may hold
/// exclusive access only for the duration of a single insertion.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Fixed vector dimension accepted by this index.
    fn dims(&self) -> usize;

    /// Insert or replace the vector stored under `embedding.id`.
    ///
    /// Fails with [`Error::InvariantViolation`](crate::Error::InvariantViolation)
    /// on a dimension mismatch or non-finite components.
    async fn upsert(&self, embedding: &Embedding) -> Result<()>;

    /// Return up to `k` documents with similarity `>= threshold`.
    async fn query(&self, vector: &[f32], k: usize, threshold: f64) -> Result<Vec<Neighbor>>;

    /// Point lookup of a stored vector.
    async fn get_vector(&self, embedding_id: &str) -> Result<Option<Vec<f32>>>;

    /// Embedding id of the document's representative vector.
    async fn representative(&self, document_id: &str) -> Result<Option<String>>;

    /// Replace every embedding of `document_id` with `embeddings` as one
    /// unit: either the whole new set is stored or nothing changes.
    async fn replace_document(&self, document_id: &str, embeddings: &[Embedding]) -> Result<()>;

    /// Number of embeddings stored for `document_id`.
    async fn chunk_count(&self, document_id: &str) -> Result<usize>;

    /// Number of stored embeddings.
    async fn embedding_count(&self) -> Result<usize>;
}

/// Ordering used for query results: similarity desc, then id asc.
pub fn rank_order(a: &Neighbor, b: &Neighbor) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.document_id.cmp(&b.document_id))
}
