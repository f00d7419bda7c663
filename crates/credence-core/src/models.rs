//! Core data models used throughout Credence.
//!
//! These types represent the feed records, documents, chunks and
//! embeddings that flow through the ingestion, retrieval and trust
//! pipelines.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Publication metadata carried over verbatim from the source feed.
///
/// Every field is nullable; the feed omits whatever it does not know.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicationMetadata {
    pub url: Option<String>,
    /// Article type as reported by the feed (`"type"` on the wire).
    pub kind: Option<String>,
    pub classification: Option<String>,
    pub credibility: Option<String>,
    pub abstract_text: Option<String>,
    pub publisher: Option<String>,
    pub publication_id: Option<i64>,
    pub source_id: Option<i64>,
    pub published_at: Option<String>,
    pub scanned_at: Option<String>,
}

/// Raw record produced by a [`Feed`](crate::feed::Feed) page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedRecord {
    /// Natural key assigned by the feed.
    pub id: String,
    pub title: String,
    pub text: String,
    pub metadata: PublicationMetadata,
}

/// One page of the external feed.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub records: Vec<FeedRecord>,
    /// Cursor of the following page, absent on the last page.
    pub next_cursor: Option<String>,
}

/// A document in the record store.
///
/// `trust_factor` always lies in `[0.0, 1.0]`; only the trust engine
/// mutates it after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub body: String,
    pub metadata: PublicationMetadata,
    pub trust_factor: f64,
}

impl Document {
    /// Build a new document from a feed record with the given initial trust.
    pub fn from_record(record: FeedRecord, trust_factor: f64) -> Self {
        Self {
            id: record.id,
            title: record.title,
            body: record.text,
            metadata: record.metadata,
            trust_factor,
        }
    }
}

/// A versioned trust reading used for optimistic compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrustRecord {
    pub trust_factor: f64,
    pub version: i64,
}

/// A token-bounded slice of a document's body, identified by
/// `(document_id, chunk_index)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub token_count: usize,
}

/// An immutable embedding of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub vector: Vec<f32>,
}

impl Embedding {
    /// Create an embedding with a fresh UUID for the given chunk.
    pub fn for_chunk(chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            document_id: chunk.document_id.clone(),
            chunk_index: chunk.chunk_index,
            vector,
        }
    }
}

/// Direction of a trust adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustDirection {
    Increase,
    Decrease,
}
