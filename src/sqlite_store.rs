//! SQLite persistence for the record store and the similarity index.
//!
//! [`SqliteRecordStore`] implements [`RecordStore`] over the `documents`
//! table: conflict-free inserts keyed by the natural id and a versioned
//! compare-and-swap for trust updates.
//!
//! [`SqliteIndex`] implements [`SimilarityIndex`] by writing each
//! embedding to the `embeddings` table and mirroring it into an
//! [`InMemoryIndex`], which answers queries. The mirror is hydrated from
//! the table when the index is opened. Writes are serialized so that the
//! table and the mirror apply them in the same order.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool, Transaction};
use tracing::{debug, info};

use credence_core::embedding::{blob_to_vec, check_dims, vec_to_blob};
use credence_core::index::memory::InMemoryIndex;
use credence_core::index::{Neighbor, SimilarityIndex};
use credence_core::models::{Document, Embedding, PublicationMetadata, TrustRecord};
use credence_core::store::{check_trust, RecordStore};
use credence_core::{Error, Result};

/// Rows per `IN (...)` lookup, below SQLite's bound-parameter limit.
const LOOKUP_BATCH: usize = 500;

const DOCUMENT_COLUMNS: &str = "id, title, body, url, kind, classification, credibility, \
    abstract, publisher, publication_id, source_id, published_at, scanned_at, trust_factor";

fn storage(err: sqlx::Error) -> Error {
    Error::Storage(err.to_string())
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    Ok(Document {
        id: row.try_get("id").map_err(storage)?,
        title: row.try_get("title").map_err(storage)?,
        body: row.try_get("body").map_err(storage)?,
        metadata: PublicationMetadata {
            url: row.try_get("url").map_err(storage)?,
            kind: row.try_get("kind").map_err(storage)?,
            classification: row.try_get("classification").map_err(storage)?,
            credibility: row.try_get("credibility").map_err(storage)?,
            abstract_text: row.try_get("abstract").map_err(storage)?,
            publisher: row.try_get("publisher").map_err(storage)?,
            publication_id: row.try_get("publication_id").map_err(storage)?,
            source_id: row.try_get("source_id").map_err(storage)?,
            published_at: row.try_get("published_at").map_err(storage)?,
            scanned_at: row.try_get("scanned_at").map_err(storage)?,
        },
        trust_factor: row.try_get("trust_factor").map_err(storage)?,
    })
}

/// Document store backed by the `documents` table.
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Up to `limit` documents with ids greater than `after`, by id.
    pub async fn documents_after(&self, after: Option<&str>, limit: usize) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id > ? ORDER BY id LIMIT ?",
            DOCUMENT_COLUMNS
        ))
        .bind(after.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_document).collect()
    }

    pub async fn count_without_embeddings(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents d \
             WHERE NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.document_id = d.id)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(n as u64)
    }

    async fn fetch_by_ids(&self, ids: &[String]) -> Result<HashMap<String, Document>> {
        let mut found = HashMap::new();
        for batch in ids.chunks(LOOKUP_BATCH) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {} FROM documents WHERE id IN (", DOCUMENT_COLUMNS));
            let mut separated = qb.separated(", ");
            for id in batch {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
            let rows = qb.build().fetch_all(&self.pool).await.map_err(storage)?;
            for row in &rows {
                let doc = row_to_document(row)?;
                found.insert(doc.id.clone(), doc);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert_if_absent(&self, docs: &[Document]) -> Result<Vec<String>> {
        for doc in docs {
            check_trust(&doc.id, doc.trust_factor)?;
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut inserted = Vec::new();
        for doc in docs {
            let meta = &doc.metadata;
            let result = sqlx::query(
                r#"
                INSERT INTO documents (id, title, body, url, kind, classification, credibility,
                    abstract, publisher, publication_id, source_id, published_at, scanned_at,
                    trust_factor, version, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&doc.id)
            .bind(&doc.title)
            .bind(&doc.body)
            .bind(&meta.url)
            .bind(&meta.kind)
            .bind(&meta.classification)
            .bind(&meta.credibility)
            .bind(&meta.abstract_text)
            .bind(&meta.publisher)
            .bind(meta.publication_id)
            .bind(meta.source_id)
            .bind(&meta.published_at)
            .bind(&meta.scanned_at)
            .bind(doc.trust_factor)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
            if result.rows_affected() == 1 {
                inserted.push(doc.id.clone());
            }
        }
        tx.commit().await.map_err(storage)?;
        Ok(inserted)
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<Document>> {
        let mut found = self.fetch_by_ids(ids).await?;
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let mut existing = HashSet::new();
        for batch in ids.chunks(LOOKUP_BATCH) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT id FROM documents WHERE id IN (");
            let mut separated = qb.separated(", ");
            for id in batch {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
            let rows = qb.build().fetch_all(&self.pool).await.map_err(storage)?;
            for row in &rows {
                existing.insert(row.try_get::<String, _>("id").map_err(storage)?);
            }
        }
        Ok(existing)
    }

    async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(n as u64)
    }

    async fn load_trust(&self, id: &str) -> Result<Option<TrustRecord>> {
        let row = sqlx::query("SELECT trust_factor, version FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.map(|r| {
            Ok(TrustRecord {
                trust_factor: r.try_get("trust_factor").map_err(storage)?,
                version: r.try_get("version").map_err(storage)?,
            })
        })
        .transpose()
    }

    async fn compare_and_swap_trust(
        &self,
        id: &str,
        expected_version: i64,
        new_trust: f64,
    ) -> Result<bool> {
        check_trust(id, new_trust)?;
        let result = sqlx::query(
            "UPDATE documents SET trust_factor = ?, version = version + 1 WHERE id = ? AND version = ?",
        )
        .bind(new_trust)
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() == 1)
    }
}

/// Persisted similarity index: `embeddings` table plus an in-memory mirror.
pub struct SqliteIndex {
    pool: SqlitePool,
    model: String,
    mirror: InMemoryIndex,
    writes: Mutex<()>,
}

impl SqliteIndex {
    /// Open the index, loading every persisted embedding into memory.
    ///
    /// Fails with [`Error::Configuration`] if any stored vector's dimension
    /// differs from `dims`.
    pub async fn open(pool: SqlitePool, dims: usize, model: impl Into<String>) -> Result<Self> {
        let mirror = InMemoryIndex::new(dims);
        let rows = sqlx::query("SELECT id, document_id, chunk_index, dims, vector FROM embeddings")
            .fetch_all(&pool)
            .await
            .map_err(storage)?;

        for row in &rows {
            let id: String = row.try_get("id").map_err(storage)?;
            let stored_dims: i64 = row.try_get("dims").map_err(storage)?;
            let blob: Vec<u8> = row.try_get("vector").map_err(storage)?;
            let vector = blob_to_vec(&blob);
            if stored_dims as usize != dims || vector.len() != dims {
                return Err(Error::Configuration(format!(
                    "persisted embedding {} has dimension {}, configured dimension is {}",
                    id,
                    vector.len(),
                    dims
                )));
            }
            mirror.insert(&Embedding {
                id,
                document_id: row.try_get("document_id").map_err(storage)?,
                chunk_index: row.try_get("chunk_index").map_err(storage)?,
                vector,
            })?;
        }
        if !rows.is_empty() {
            info!(embeddings = rows.len(), dims, "hydrated similarity index");
        }

        Ok(Self {
            pool,
            model: model.into(),
            mirror,
            writes: Mutex::new(()),
        })
    }
}

impl SqliteIndex {
    async fn write_row(&self, tx: &mut Transaction<'_, Sqlite>, embedding: &Embedding) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO embeddings (id, document_id, chunk_index, model, dims, vector, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                chunk_index = excluded.chunk_index,
                model = excluded.model,
                dims = excluded.dims,
                vector = excluded.vector
            WHERE embeddings.document_id = excluded.document_id
            "#,
        )
        .bind(&embedding.id)
        .bind(&embedding.document_id)
        .bind(embedding.chunk_index)
        .bind(&self.model)
        .bind(embedding.vector.len() as i64)
        .bind(vec_to_blob(&embedding.vector))
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut **tx)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(Error::InvariantViolation(format!(
                "embedding {} already belongs to another document",
                embedding.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SimilarityIndex for SqliteIndex {
    fn dims(&self) -> usize {
        self.mirror.dims()
    }

    async fn upsert(&self, embedding: &Embedding) -> Result<()> {
        check_dims(&embedding.vector, self.mirror.dims())?;
        let _guard = self.writes.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage)?;
        self.write_row(&mut tx, embedding).await?;
        tx.commit().await.map_err(storage)?;
        self.mirror.insert(embedding)?;
        debug!(embedding_id = %embedding.id, document_id = %embedding.document_id, "stored embedding");
        Ok(())
    }

    async fn replace_document(&self, document_id: &str, embeddings: &[Embedding]) -> Result<()> {
        for embedding in embeddings {
            check_dims(&embedding.vector, self.mirror.dims())?;
            if embedding.document_id != document_id {
                return Err(Error::InvalidArgument(format!(
                    "embedding {} belongs to {}, not {}",
                    embedding.id, embedding.document_id, document_id
                )));
            }
        }

        let _guard = self.writes.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        for embedding in embeddings {
            self.write_row(&mut tx, embedding).await?;
        }
        tx.commit().await.map_err(storage)?;
        self.mirror.replace(document_id, embeddings)?;
        debug!(document_id, embeddings = embeddings.len(), "stored document embeddings");
        Ok(())
    }

    async fn chunk_count(&self, document_id: &str) -> Result<usize> {
        self.mirror.chunk_count(document_id).await
    }

    async fn query(&self, vector: &[f32], k: usize, threshold: f64) -> Result<Vec<Neighbor>> {
        self.mirror.search(vector, k, threshold)
    }

    async fn get_vector(&self, embedding_id: &str) -> Result<Option<Vec<f32>>> {
        self.mirror.get_vector(embedding_id).await
    }

    async fn representative(&self, document_id: &str) -> Result<Option<String>> {
        self.mirror.representative(document_id).await
    }

    async fn embedding_count(&self) -> Result<usize> {
        self.mirror.embedding_count().await
    }
}
