//! Ingestion pipeline orchestration.
//!
//! The [`Coordinator`] walks the paginated feed one page at a time:
//!
//! ```text
//! FETCH_PAGE -> FILTER_NEW -> PERSIST -> CHUNK_AND_EMBED -> ADVANCE_CURSOR
//!      ^                                                        |
//!      +--------------------------------------------------------+
//! ```
//!
//! - Records already stored (by natural id) are skipped. Stored records
//!   without a complete set of chunk embeddings are re-embedded, so a page
//!   that failed mid-way repairs itself when fetched again.
//! - New documents are chunked and embedded concurrently, bounded by
//!   `embedding.concurrency`. A page is complete only when every one of
//!   its documents is embedded; only then is the cursor checkpointed.
//! - The run stops when the feed has no next cursor, when a page yields
//!   neither a new nor a repaired document, or when `limit` new documents
//!   have been added.
//!
//! The coordinator itself never retries. [`run_ingest`] retries failed
//! runs whose error is retryable, with exponential backoff, resuming
//! from the checkpoint.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use credence_core::chunk::{chunk_text, TokenCodec};
use credence_core::embedding::{check_dims, EmbeddingGateway};
use credence_core::feed::Feed;
use credence_core::index::SimilarityIndex;
use credence_core::models::{Document, Embedding, FeedRecord};
use credence_core::store::RecordStore;
use credence_core::trust::InitialTrust;
use credence_core::Error;

use crate::app::App;
use crate::config::Config;
use crate::feed::HttpFeed;
use crate::tokenizer::load_codec;

/// Checkpoint key of the article feed.
pub const FEED_SOURCE: &str = "feed";

// ============ Checkpoints ============

/// Last fully processed cursor per source, in the `checkpoints` table.
#[derive(Clone)]
pub struct Checkpoints {
    pool: SqlitePool,
    source: String,
}

impl Checkpoints {
    pub fn new(pool: SqlitePool, source: impl Into<String>) -> Self {
        Self {
            pool,
            source: source.into(),
        }
    }

    pub async fn load(&self) -> credence_core::Result<Option<String>> {
        sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE source = ?")
            .bind(&self.source)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))
    }

    pub async fn save(&self, cursor: &str) -> credence_core::Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, cursor, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.source)
        .bind(cursor)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
}

// ============ Embedding stage ============

/// Everything needed to chunk and embed a document.
#[derive(Clone)]
pub struct EmbedContext {
    pub gateway: Arc<dyn EmbeddingGateway>,
    pub index: Arc<dyn SimilarityIndex>,
    pub codec: Arc<dyn TokenCodec>,
    pub max_tokens: usize,
    pub timeout: Duration,
}

/// Totals of one [`embed_documents`] call.
#[derive(Debug, Default)]
pub struct EmbedOutcome {
    pub documents: usize,
    pub chunks: usize,
    pub embeddings: usize,
    pub failures: Vec<(String, Error)>,
}

/// Chunk and embed `docs` with at most `concurrency` documents in flight.
///
/// Per-document failures are collected, never propagated; the caller
/// decides whether a failure aborts its unit of work.
pub async fn embed_documents(ctx: &EmbedContext, docs: Vec<Document>, concurrency: usize) -> EmbedOutcome {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for doc in docs {
        let ctx = ctx.clone();
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let id = doc.id.clone();
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => embed_document(&ctx, &doc).await,
                Err(_) => Err(Error::Storage("embedding worker pool closed".into())),
            };
            (id, result)
        });
    }

    let mut outcome = EmbedOutcome::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok((chunks, embeddings)))) => {
                outcome.documents += 1;
                outcome.chunks += chunks;
                outcome.embeddings += embeddings;
            }
            Ok((id, Err(err))) => {
                warn!(document_id = %id, error = %err, "embedding failed");
                outcome.failures.push((id, err));
            }
            Err(join_err) => {
                outcome
                    .failures
                    .push(("<task>".to_string(), Error::Storage(join_err.to_string())));
            }
        }
    }
    outcome
}

/// Returns `(chunks, embeddings)` written for one document.
///
/// Every chunk is embedded before anything is written; the document's
/// vectors then replace its previous set in one step, so a failure
/// leaves either the old set or none.
async fn embed_document(ctx: &EmbedContext, doc: &Document) -> credence_core::Result<(usize, usize)> {
    let chunks = chunk_text(&doc.id, &doc.title, &doc.body, ctx.max_tokens, ctx.codec.as_ref())?;
    let batch_size = ctx.gateway.max_batch().max(1);
    let mut embeddings = Vec::with_capacity(chunks.len());

    for batch in chunks.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = tokio::time::timeout(ctx.timeout, ctx.gateway.embed_batch(&texts))
            .await
            .map_err(|_| {
                Error::Transient(format!(
                    "embedding request for {} timed out after {:?}",
                    doc.id, ctx.timeout
                ))
            })??;
        if vectors.len() != batch.len() {
            return Err(Error::Collaborator(format!(
                "gateway returned {} vectors for {} chunks",
                vectors.len(),
                batch.len()
            )));
        }
        for (chunk, vector) in batch.iter().zip(vectors) {
            check_dims(&vector, ctx.index.dims())?;
            embeddings.push(Embedding::for_chunk(chunk, vector));
        }
    }

    ctx.index.replace_document(&doc.id, &embeddings).await?;
    debug!(document_id = %doc.id, chunks = chunks.len(), "embedded document");
    Ok((chunks.len(), embeddings.len()))
}

/// Whether the index lacks a full set of chunk embeddings for `doc`.
///
/// Compares the stored count with the chunking of the current settings,
/// so documents left with a partial set are picked up as well.
pub async fn needs_embedding(ctx: &EmbedContext, doc: &Document) -> credence_core::Result<bool> {
    let expected = chunk_text(&doc.id, &doc.title, &doc.body, ctx.max_tokens, ctx.codec.as_ref())?.len();
    Ok(ctx.index.chunk_count(&doc.id).await? != expected)
}

// ============ Coordinator ============

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The feed reported no further cursor.
    Exhausted,
    /// A page contained no document that was not already stored.
    NoNewRecords,
    /// The caller-supplied limit of new documents was reached.
    LimitReached,
}

/// Counters of one ingestion run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub pages: usize,
    pub fetched: usize,
    pub new_documents: usize,
    pub skipped_existing: usize,
    pub repaired: usize,
    pub chunks: usize,
    pub embeddings: usize,
    pub stop: Option<StopReason>,
    /// Cursor the next run will resume from.
    pub checkpoint: Option<String>,
}

impl IngestReport {
    fn absorb(&mut self, other: &IngestReport) {
        self.pages += other.pages;
        self.fetched += other.fetched;
        self.new_documents += other.new_documents;
        self.skipped_existing += other.skipped_existing;
        self.repaired += other.repaired;
        self.chunks += other.chunks;
        self.embeddings += other.embeddings;
        self.stop = other.stop;
        self.checkpoint = other.checkpoint.clone();
    }
}

/// A run that stopped on an error, with the progress made before it.
#[derive(Debug, thiserror::Error)]
#[error("ingestion stopped after {} new documents: {source}", .partial.new_documents)]
pub struct IngestFailure {
    #[source]
    pub source: Error,
    pub partial: IngestReport,
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub page_size: usize,
    /// Stop after this many new documents.
    pub limit: Option<usize>,
    /// Start from the first page instead of the checkpoint.
    pub full: bool,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
}

/// Drives feed → record store → chunker → gateway → index.
pub struct Coordinator {
    pub feed: Arc<dyn Feed>,
    pub store: Arc<dyn RecordStore>,
    pub embed: EmbedContext,
    pub initial_trust: InitialTrust,
    pub checkpoints: Option<Checkpoints>,
    pub options: IngestOptions,
}

impl Coordinator {
    pub async fn run(&self) -> std::result::Result<IngestReport, IngestFailure> {
        let mut report = IngestReport::default();
        match self.run_pages(&mut report).await {
            Ok(()) => Ok(report),
            Err(source) => Err(IngestFailure {
                source,
                partial: report,
            }),
        }
    }

    async fn run_pages(&self, report: &mut IngestReport) -> credence_core::Result<()> {
        let mut cursor = match (&self.checkpoints, self.options.full) {
            (Some(checkpoints), false) => checkpoints.load().await?,
            _ => None,
        };
        if let Some(c) = &cursor {
            info!(cursor = %c, "resuming from checkpoint");
        }
        report.checkpoint = cursor.clone();

        loop {
            let page = tokio::time::timeout(
                self.options.fetch_timeout,
                self.feed.fetch(cursor.as_deref(), self.options.page_size),
            )
            .await
            .map_err(|_| {
                Error::Transient(format!(
                    "feed fetch timed out after {:?}",
                    self.options.fetch_timeout
                ))
            })??;
            report.pages += 1;
            report.fetched += page.records.len();

            // FILTER_NEW
            let records = dedup_by_id(page.records);
            let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            let existing = self.store.existing_ids(&ids).await?;
            let (known, mut fresh): (Vec<FeedRecord>, Vec<FeedRecord>) =
                records.into_iter().partition(|r| existing.contains(&r.id));
            report.skipped_existing += known.len();

            let mut truncated = false;
            if let Some(limit) = self.options.limit {
                let remaining = limit.saturating_sub(report.new_documents);
                if fresh.len() > remaining {
                    fresh.truncate(remaining);
                    truncated = true;
                }
            }

            // PERSIST
            let docs: Vec<Document> = fresh
                .into_iter()
                .map(|r| {
                    let trust = self.initial_trust.seed(&r.id);
                    Document::from_record(r, trust)
                })
                .collect();
            let inserted: HashSet<String> =
                self.store.insert_if_absent(&docs).await?.into_iter().collect();
            let mut to_embed: Vec<Document> =
                docs.into_iter().filter(|d| inserted.contains(&d.id)).collect();
            let new_count = to_embed.len();

            let repairs = self.incomplete(&known).await?;
            let repaired = repairs.len();
            report.repaired += repaired;
            to_embed.extend(repairs);

            // CHUNK_AND_EMBED
            let outcome = embed_documents(&self.embed, to_embed, self.options.concurrency).await;
            report.chunks += outcome.chunks;
            report.embeddings += outcome.embeddings;
            report.new_documents += new_count;
            if let Some((id, err)) = outcome.failures.into_iter().next() {
                warn!(document_id = %id, "page incomplete; checkpoint not advanced");
                return Err(err);
            }
            debug!(
                page = report.pages,
                new = new_count,
                repaired,
                skipped = known.len(),
                "page complete"
            );

            // ADVANCE_CURSOR
            if truncated {
                // remainder of this page is picked up by the next run
                report.stop = Some(StopReason::LimitReached);
                return Ok(());
            }
            if let (Some(next), Some(checkpoints)) = (&page.next_cursor, &self.checkpoints) {
                checkpoints.save(next).await?;
                report.checkpoint = Some(next.clone());
            }

            // a repaired page is progress: a retry after an embedding
            // failure re-reads that page and must carry on past it
            report.stop = if new_count + repaired == 0 {
                Some(StopReason::NoNewRecords)
            } else if self.options.limit.is_some_and(|l| report.new_documents >= l) {
                Some(StopReason::LimitReached)
            } else if page.next_cursor.is_none() {
                Some(StopReason::Exhausted)
            } else {
                None
            };
            if report.stop.is_some() {
                return Ok(());
            }
            cursor = page.next_cursor;
        }
    }

    /// Stored documents among `known` without a complete embedding set.
    async fn incomplete(&self, known: &[FeedRecord]) -> credence_core::Result<Vec<Document>> {
        if known.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = known.iter().map(|r| r.id.clone()).collect();
        let mut missing = Vec::new();
        for doc in self.store.get_many(&ids).await? {
            if needs_embedding(&self.embed, &doc).await? {
                missing.push(doc);
            }
        }
        if !missing.is_empty() {
            debug!(count = missing.len(), "re-embedding stored documents with incomplete embeddings");
        }
        Ok(missing)
    }
}

/// Keep the first occurrence of each id.
fn dedup_by_id(records: Vec<FeedRecord>) -> Vec<FeedRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.id.clone()))
        .collect()
}

/// Exponential backoff before retry `attempt` (1-based): 1s, 2s, 4s, ... capped at 32s.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.saturating_sub(1).min(5))
}

/// Run coordinators until one finishes, retrying retryable failures.
///
/// `build` creates the coordinator for an attempt from its options; later
/// attempts resume from the checkpoint and only ask for the documents the
/// limit still allows.
pub async fn run_with_retry<F>(
    mut options: IngestOptions,
    max_retries: u32,
    base_delay: Duration,
    build: F,
) -> std::result::Result<IngestReport, IngestFailure>
where
    F: Fn(IngestOptions) -> Coordinator,
{
    let mut total = IngestReport::default();
    let mut attempt = 0;
    loop {
        match build(options.clone()).run().await {
            Ok(report) => {
                total.absorb(&report);
                return Ok(total);
            }
            Err(failure) => {
                total.absorb(&failure.partial);
                if !failure.source.is_retryable() || attempt >= max_retries {
                    return Err(IngestFailure {
                        source: failure.source,
                        partial: total,
                    });
                }
                attempt += 1;
                let delay = base_delay * backoff_delay(attempt).as_secs() as u32;
                warn!(attempt, ?delay, error = %failure.source, "retrying ingestion");
                tokio::time::sleep(delay).await;

                options.full = false;
                if let Some(limit) = options.limit.as_mut() {
                    *limit = limit.saturating_sub(failure.partial.new_documents);
                }
            }
        }
    }
}

/// `cred ingest`: pull the feed into the store and index.
pub async fn run_ingest(config: &Config, full: bool, limit: Option<usize>, json: bool) -> Result<()> {
    let app = App::open(config).await?;
    let gateway = app.gateway().await?;
    let feed: Arc<dyn Feed> = Arc::new(HttpFeed::new(&config.feed)?);
    let codec = load_codec(&config.chunking)?;
    let initial_trust = config.trust.initial_policy()?;

    let embed = EmbedContext {
        gateway,
        index: app.index.clone(),
        codec,
        max_tokens: config.chunking.max_tokens,
        timeout: Duration::from_secs(config.embedding.timeout_secs),
    };
    let options = IngestOptions {
        page_size: config.feed.page_size,
        limit,
        full,
        concurrency: config.embedding.concurrency,
        fetch_timeout: Duration::from_secs(config.feed.timeout_secs),
    };
    let checkpoints = Checkpoints::new(app.pool.clone(), FEED_SOURCE);
    let store: Arc<dyn RecordStore> = app.store.clone();

    let result = run_with_retry(options, config.ingest.max_retries, Duration::from_secs(1), |options| {
        Coordinator {
            feed: Arc::clone(&feed),
            store: Arc::clone(&store),
            embed: embed.clone(),
            initial_trust,
            checkpoints: Some(checkpoints.clone()),
            options,
        }
    })
    .await;

    let report = match result {
        Ok(report) => report,
        Err(failure) => {
            print_report(&failure.partial, json)?;
            app.close().await;
            return Err(failure.into());
        }
    };

    info!(
        new = report.new_documents,
        embeddings = report.embeddings,
        "ingestion complete"
    );
    print_report(&report, json)?;
    app.close().await;
    Ok(())
}

fn print_report(report: &IngestReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("ingest");
    println!("  pages fetched: {}", report.pages);
    println!("  records fetched: {}", report.fetched);
    println!("  new documents: {}", report.new_documents);
    println!("  already stored: {}", report.skipped_existing);
    if report.repaired > 0 {
        println!("  re-embedded: {}", report.repaired);
    }
    println!("  chunks: {}", report.chunks);
    println!("  embeddings written: {}", report.embeddings);
    if let Some(stop) = report.stop {
        println!("  stopped: {:?}", stop);
    }
    println!(
        "  checkpoint: {}",
        report.checkpoint.as_deref().unwrap_or("(start)")
    );
    Ok(())
}
