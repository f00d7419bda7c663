//! Record store abstraction for Credence.
//!
//! The [`RecordStore`] trait defines the storage operations needed by the
//! ingestion, search and trust pipelines, enabling pluggable backends
//! (SQLite, in-memory).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::{Document, TrustRecord};

/// Abstract storage backend for documents.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_if_absent`](RecordStore::insert_if_absent) | Conflict-free batch insert keyed by natural id |
/// | [`get`](RecordStore::get) | Point lookup |
/// | [`get_many`](RecordStore::get_many) | Batch lookup for result hydration |
/// | [`existing_ids`](RecordStore::existing_ids) | Which of the given ids are already stored |
/// | [`count`](RecordStore::count) | Number of stored documents |
/// | [`load_trust`](RecordStore::load_trust) | Versioned trust reading |
/// | [`compare_and_swap_trust`](RecordStore::compare_and_swap_trust) | Atomic trust update |
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert every document whose id is not yet stored; never overwrite.
    ///
    /// Returns the ids that were actually inserted, in input order.
    /// Concurrent callers inserting the same id produce exactly one row.
    async fn insert_if_absent(&self, docs: &[Document]) -> Result<Vec<String>>;

    async fn get(&self, id: &str) -> Result<Option<Document>>;

    /// Fetch the stored subset of `ids`, in the order given.
    async fn get_many(&self, ids: &[String]) -> Result<Vec<Document>>;

    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>>;

    async fn count(&self) -> Result<u64>;

    async fn load_trust(&self, id: &str) -> Result<Option<TrustRecord>>;

    /// Set `trust_factor` to `new_trust` only if the stored version still
    /// equals `expected_version`, bumping the version.
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_swap_trust(
        &self,
        id: &str,
        expected_version: i64,
        new_trust: f64,
    ) -> Result<bool>;
}

/// Reject trust values outside `[0.0, 1.0]` (including `NaN`).
pub fn check_trust(id: &str, trust: f64) -> Result<()> {
    if (0.0..=1.0).contains(&trust) {
        Ok(())
    } else {
        Err(Error::InvariantViolation(format!(
            "trust_factor {} of document {} is outside [0, 1]",
            trust, id
        )))
    }
}
