//! Wiring of the persistent components shared by every command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use credence_core::embedding::EmbeddingGateway;
use credence_core::Error;

use crate::config::Config;
use crate::db;
use crate::embedding::create_gateway;
use crate::migrate::migrate_pool;
use crate::sqlite_store::{SqliteIndex, SqliteRecordStore};

/// Open database, record store and hydrated similarity index.
pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub store: Arc<SqliteRecordStore>,
    pub index: Arc<SqliteIndex>,
}

impl App {
    /// Connect, migrate and hydrate the index.
    ///
    /// Fails if a persisted vector's dimension differs from `embedding.dims`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate_pool(&pool).await?;

        let model = config
            .embedding
            .model
            .clone()
            .unwrap_or_else(|| config.embedding.provider.clone());
        let index = SqliteIndex::open(pool.clone(), config.embedding.dims, model)
            .await
            .context("Failed to load similarity index")?;

        Ok(Self {
            config: config.clone(),
            store: Arc::new(SqliteRecordStore::new(pool.clone())),
            index: Arc::new(index),
            pool,
        })
    }

    /// Build the configured gateway and check the dimension it actually
    /// produces against the index.
    pub async fn gateway(&self) -> Result<Arc<dyn EmbeddingGateway>> {
        let gateway = create_gateway(&self.config.embedding)?;
        if self.config.embedding.is_enabled() {
            let timeout = Duration::from_secs(self.config.embedding.timeout_secs);
            check_gateway_dims(gateway.as_ref(), self.config.embedding.dims, timeout).await?;
        }
        Ok(gateway)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Text embedded once at startup to learn the model's output dimension.
pub const DIMENSION_CHECK_TEXT: &str = "dimension check";

/// Embed [`DIMENSION_CHECK_TEXT`] and compare the vector length with `dims`.
///
/// A mismatch is a fatal [`Error::Configuration`]; gateway failures pass
/// through unchanged.
pub async fn check_gateway_dims(
    gateway: &dyn EmbeddingGateway,
    dims: usize,
    timeout: Duration,
) -> credence_core::Result<()> {
    let vector = tokio::time::timeout(timeout, gateway.embed_one(DIMENSION_CHECK_TEXT))
        .await
        .map_err(|_| {
            Error::Transient(format!(
                "dimension check against {} timed out after {:?}",
                gateway.model_name(),
                timeout
            ))
        })??;
    if vector.len() != dims {
        return Err(Error::Configuration(format!(
            "embedding model {} produces {} dimensions, index is configured for {}",
            gateway.model_name(),
            vector.len(),
            dims
        )));
    }
    Ok(())
}
