use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::app::App;
use crate::config::Config;
use crate::embedding::create_gateway;
use crate::ingest::{embed_documents, needs_embedding, EmbedContext};
use crate::tokenizer::load_codec;

/// Documents read from the store per round.
const PENDING_PAGE: usize = 256;

/// `cred embed pending`: embed stored documents whose chunks are not all
/// embedded, including documents with no embedding at all.
///
/// Failed documents are reported and left pending for the next run.
pub async fn run_embed_pending(config: &Config, limit: Option<usize>, dry_run: bool) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let app = App::open(config).await?;
    let codec = load_codec(&config.chunking)?;
    let gateway = if dry_run {
        create_gateway(&config.embedding)?
    } else {
        app.gateway().await?
    };
    let ctx = EmbedContext {
        gateway,
        index: app.index.clone(),
        codec,
        max_tokens: config.chunking.max_tokens,
        timeout: Duration::from_secs(config.embedding.timeout_secs),
    };

    let mut after: Option<String> = None;
    let mut pending = 0usize;
    let mut embedded = 0usize;
    let mut embeddings = 0usize;
    let mut failed = 0usize;
    loop {
        if limit.is_some_and(|l| pending >= l) {
            break;
        }
        let page = app.store.documents_after(after.as_deref(), PENDING_PAGE).await?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id.clone());

        let mut batch = Vec::new();
        for doc in page {
            if limit.is_some_and(|l| pending + batch.len() >= l) {
                break;
            }
            if needs_embedding(&ctx, &doc).await? {
                batch.push(doc);
            }
        }
        pending += batch.len();
        if dry_run || batch.is_empty() {
            continue;
        }

        let outcome = embed_documents(&ctx, batch, config.embedding.concurrency).await;
        embedded += outcome.documents;
        embeddings += outcome.embeddings;
        for (id, err) in outcome.failures {
            warn!(document_id = %id, error = %err, "embedding failed; document left pending");
            failed += 1;
        }
    }
    app.close().await;

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  documents needing embeddings: {}", pending);
        return Ok(());
    }

    info!(embedded, failed, "embed pending complete");
    println!("embed pending");
    println!("  documents embedded: {}", embedded);
    println!("  embeddings written: {}", embeddings);
    println!("  failed: {}", failed);
    Ok(())
}
