//! In-memory [`RecordStore`] implementation for testing.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Each trust
//! compare-and-swap runs under the write lock, so it is atomic per
//! document.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Document, TrustRecord};

use super::{check_trust, RecordStore};

struct StoredDoc {
    doc: Document,
    version: i64,
}

/// In-memory document store.
pub struct InMemoryStore {
    docs: RwLock<HashMap<String, StoredDoc>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, StoredDoc>> {
        self.docs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, StoredDoc>> {
        self.docs.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite a stored trust value without validation.
    ///
    /// Only for simulating corrupted rows in tests.
    pub fn force_trust(&self, id: &str, trust: f64) {
        if let Some(stored) = self.write().get_mut(id) {
            stored.doc.trust_factor = trust;
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn insert_if_absent(&self, docs: &[Document]) -> Result<Vec<String>> {
        for doc in docs {
            check_trust(&doc.id, doc.trust_factor)?;
        }
        let mut stored = self.write();
        let mut inserted = Vec::new();
        for doc in docs {
            if stored.contains_key(&doc.id) {
                continue;
            }
            stored.insert(
                doc.id.clone(),
                StoredDoc {
                    doc: doc.clone(),
                    version: 0,
                },
            );
            inserted.push(doc.id.clone());
        }
        Ok(inserted)
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read().get(id).map(|s| s.doc.clone()))
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<Document>> {
        let docs = self.read();
        Ok(ids
            .iter()
            .filter_map(|id| docs.get(id).map(|s| s.doc.clone()))
            .collect())
    }

    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let docs = self.read();
        Ok(ids
            .iter()
            .filter(|id| docs.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.read().len() as u64)
    }

    async fn load_trust(&self, id: &str) -> Result<Option<TrustRecord>> {
        Ok(self.read().get(id).map(|s| TrustRecord {
            trust_factor: s.doc.trust_factor,
            version: s.version,
        }))
    }

    async fn compare_and_swap_trust(
        &self,
        id: &str,
        expected_version: i64,
        new_trust: f64,
    ) -> Result<bool> {
        check_trust(id, new_trust)?;
        let mut docs = self.write();
        match docs.get_mut(id) {
            Some(stored) if stored.version == expected_version => {
                stored.doc.trust_factor = new_trust;
                stored.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::PublicationMetadata;

    fn doc(id: &str, trust: f64) -> Document {
        Document {
            id: id.to_string(),
            title: format!("title {}", id),
            body: String::new(),
            metadata: PublicationMetadata::default(),
            trust_factor: trust,
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_never_overwrites() {
        let store = InMemoryStore::new();
        let first = store.insert_if_absent(&[doc("1", 0.5), doc("2", 0.5)]).await.unwrap();
        assert_eq!(first, vec!["1", "2"]);

        let mut changed = doc("1", 0.9);
        changed.title = "changed".into();
        let second = store
            .insert_if_absent(&[changed, doc("3", 0.5)])
            .await
            .unwrap();
        assert_eq!(second, vec!["3"]);

        let kept = store.get("1").await.unwrap().unwrap();
        assert_eq!(kept.title, "title 1");
        assert_eq!(kept.trust_factor, 0.5);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_insert_rejects_out_of_range_trust() {
        let store = InMemoryStore::new();
        let err = store.insert_if_absent(&[doc("1", 1.5)]).await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cas_detects_stale_version() {
        let store = InMemoryStore::new();
        store.insert_if_absent(&[doc("1", 0.5)]).await.unwrap();

        let rec = store.load_trust("1").await.unwrap().unwrap();
        assert!(store.compare_and_swap_trust("1", rec.version, 0.6).await.unwrap());
        assert!(!store.compare_and_swap_trust("1", rec.version, 0.7).await.unwrap());

        let rec = store.load_trust("1").await.unwrap().unwrap();
        assert_eq!(rec.trust_factor, 0.6);
        assert_eq!(rec.version, 1);
        assert!(!store.compare_and_swap_trust("missing", 0, 0.1).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_many_preserves_order_and_skips_missing() {
        let store = InMemoryStore::new();
        store.insert_if_absent(&[doc("a", 0.1), doc("b", 0.2)]).await.unwrap();
        let ids = vec!["b".to_string(), "zz".to_string(), "a".to_string()];
        let got: Vec<String> = store
            .get_many(&ids)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(got, vec!["b", "a"]);

        let existing = store.existing_ids(&ids).await.unwrap();
        assert_eq!(existing.len(), 2);
        assert!(!existing.contains("zz"));
    }
}
