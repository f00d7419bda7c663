//! In-memory [`SimilarityIndex`] implementation.
//!
//! `Vec` of entries behind `std::sync::RwLock`, with a position map for
//! replacement, a per-document representative map and per-document chunk
//! counts. Replacing a document's set swap-removes its old entries.
//! Queries are exact brute-force cosine scans under the read lock, so
//! concurrent queries never wait on each other. Norms are computed once
//! at insertion.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::{check_dims, cosine_with_norms, norm};
use crate::error::{Error, Result};
use crate::models::Embedding;

use super::{rank_order, Neighbor, SimilarityIndex};

struct Entry {
    embedding_id: String,
    document_id: String,
    chunk_index: i64,
    vector: Vec<f32>,
    norm: f64,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    positions: HashMap<String, usize>,
    /// document id -> position of its representative entry
    representatives: HashMap<String, usize>,
    chunk_counts: HashMap<String, usize>,
}

impl Inner {
    fn put(&mut self, entry: Entry) -> Result<()> {
        match self.positions.get(&entry.embedding_id).copied() {
            Some(pos) => {
                if self.entries[pos].document_id != entry.document_id {
                    return Err(Error::InvariantViolation(format!(
                        "embedding {} already belongs to document {}",
                        entry.embedding_id, self.entries[pos].document_id
                    )));
                }
                let document_id = entry.document_id.clone();
                self.entries[pos] = entry;
                self.recompute_representative(&document_id);
            }
            None => {
                let pos = self.entries.len();
                let document_id = entry.document_id.clone();
                self.positions.insert(entry.embedding_id.clone(), pos);
                self.entries.push(entry);
                *self.chunk_counts.entry(document_id.clone()).or_default() += 1;
                self.refresh_representative(&document_id, pos);
            }
        }
        Ok(())
    }

    /// Drop every entry of `document_id`.
    fn remove_document(&mut self, document_id: &str) {
        if self.chunk_counts.remove(document_id).is_none() {
            return;
        }
        self.representatives.remove(document_id);
        let doomed: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.document_id == document_id)
            .map(|(pos, _)| pos)
            .rev()
            .collect();
        // descending, so the entry swapped in from the tail never belongs
        // to `document_id`
        for pos in doomed {
            let removed = self.entries.swap_remove(pos);
            self.positions.remove(&removed.embedding_id);
            let old_tail = self.entries.len();
            if pos < old_tail {
                let moved = &self.entries[pos];
                self.positions.insert(moved.embedding_id.clone(), pos);
                if self.representatives.get(&moved.document_id) == Some(&old_tail) {
                    self.representatives.insert(moved.document_id.clone(), pos);
                }
            }
        }
    }

    fn refresh_representative(&mut self, document_id: &str, candidate: usize) {
        let entries = &self.entries;
        let key = |pos: usize| (entries[pos].chunk_index, entries[pos].embedding_id.as_str());
        match self.representatives.get(document_id) {
            Some(&current) if current == candidate || key(current) <= key(candidate) => {}
            _ => {
                self.representatives
                    .insert(document_id.to_string(), candidate);
            }
        }
    }

    /// Full rescan for `document_id`, needed after an entry is replaced.
    fn recompute_representative(&mut self, document_id: &str) {
        let best = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.document_id == document_id)
            .min_by(|(_, a), (_, b)| {
                (a.chunk_index, &a.embedding_id).cmp(&(b.chunk_index, &b.embedding_id))
            })
            .map(|(pos, _)| pos);
        if let Some(pos) = best {
            self.representatives.insert(document_id.to_string(), pos);
        }
    }
}

/// Exact in-memory index for tests, small corpora and as the query layer
/// of persisted indexes.
pub struct InMemoryIndex {
    dims: usize,
    inner: RwLock<Inner>,
}

impl InMemoryIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, embedding: &Embedding) -> Result<Entry> {
        check_dims(&embedding.vector, self.dims)?;
        Ok(Entry {
            embedding_id: embedding.id.clone(),
            document_id: embedding.document_id.clone(),
            chunk_index: embedding.chunk_index,
            norm: norm(&embedding.vector),
            vector: embedding.vector.clone(),
        })
    }

    /// Synchronous insertion used by [`SimilarityIndex::upsert`] and by
    /// backends hydrating from persistent storage.
    pub fn insert(&self, embedding: &Embedding) -> Result<()> {
        let entry = self.entry(embedding)?;
        self.write().put(entry)
    }

    /// Synchronous form of [`SimilarityIndex::replace_document`].
    ///
    /// Every embedding is validated before the index is touched, and the
    /// swap happens under a single write lock.
    pub fn replace(&self, document_id: &str, embeddings: &[Embedding]) -> Result<()> {
        let mut entries = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            if embedding.document_id != document_id {
                return Err(Error::InvalidArgument(format!(
                    "embedding {} belongs to {}, not {}",
                    embedding.id, embedding.document_id, document_id
                )));
            }
            entries.push(self.entry(embedding)?);
        }

        let mut inner = self.write();
        for entry in &entries {
            if let Some(&pos) = inner.positions.get(&entry.embedding_id) {
                if inner.entries[pos].document_id != document_id {
                    return Err(Error::InvariantViolation(format!(
                        "embedding {} already belongs to document {}",
                        entry.embedding_id, inner.entries[pos].document_id
                    )));
                }
            }
        }
        inner.remove_document(document_id);
        for entry in entries {
            inner.put(entry)?;
        }
        Ok(())
    }

    /// Exact top-K scan; see [`SimilarityIndex::query`].
    pub fn search(&self, vector: &[f32], k: usize, threshold: f64) -> Result<Vec<Neighbor>> {
        if vector.len() != self.dims {
            return Err(Error::InvariantViolation(format!(
                "query dimension {} does not match index dimension {}",
                vector.len(),
                self.dims
            )));
        }
        if threshold.is_nan() {
            return Err(Error::InvalidArgument("threshold must be a number".into()));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_norm = norm(vector);
        let inner = self.read();
        let mut best: HashMap<&str, f64> = HashMap::new();
        for entry in &inner.entries {
            let sim = cosine_with_norms(vector, query_norm, &entry.vector, entry.norm);
            if sim < threshold {
                continue;
            }
            best.entry(entry.document_id.as_str())
                .and_modify(|s| {
                    if sim > *s {
                        *s = sim;
                    }
                })
                .or_insert(sim);
        }

        let mut hits: Vec<Neighbor> = best
            .into_iter()
            .map(|(document_id, similarity)| Neighbor {
                document_id: document_id.to_string(),
                similarity,
            })
            .collect();
        hits.sort_by(rank_order);
        hits.truncate(k);
        Ok(hits)
    }
}

#[async_trait]
impl SimilarityIndex for InMemoryIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn upsert(&self, embedding: &Embedding) -> Result<()> {
        self.insert(embedding)
    }

    async fn query(&self, vector: &[f32], k: usize, threshold: f64) -> Result<Vec<Neighbor>> {
        self.search(vector, k, threshold)
    }

    async fn get_vector(&self, embedding_id: &str) -> Result<Option<Vec<f32>>> {
        let inner = self.read();
        Ok(inner
            .positions
            .get(embedding_id)
            .map(|&pos| inner.entries[pos].vector.clone()))
    }

    async fn representative(&self, document_id: &str) -> Result<Option<String>> {
        let inner = self.read();
        Ok(inner
            .representatives
            .get(document_id)
            .map(|&pos| inner.entries[pos].embedding_id.clone()))
    }

    async fn replace_document(&self, document_id: &str, embeddings: &[Embedding]) -> Result<()> {
        self.replace(document_id, embeddings)
    }

    async fn chunk_count(&self, document_id: &str) -> Result<usize> {
        Ok(self.read().chunk_counts.get(document_id).copied().unwrap_or(0))
    }

    async fn embedding_count(&self) -> Result<usize> {
        Ok(self.read().entries.len())
    }
}
