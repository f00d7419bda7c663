use anyhow::{bail, Result};

use credence_core::search::{parse_date_bound, search, SearchFilter, SearchHit, SearchRequest};

use crate::app::App;
use crate::config::Config;

/// Command-line search options.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub threshold: Option<f64>,
    pub kind: Option<String>,
    pub classifications: Vec<String>,
    pub publication_ids: Vec<i64>,
    /// `YYYY-MM-DD` or a timestamp.
    pub start: Option<String>,
    /// `YYYY-MM-DD` (whole day) or a timestamp.
    pub end: Option<String>,
}

impl SearchOptions {
    pub fn filter(&self) -> Result<SearchFilter> {
        Ok(SearchFilter {
            kind: self.kind.clone(),
            classifications: self.classifications.clone(),
            publication_ids: self.publication_ids.clone(),
            start: self
                .start
                .as_deref()
                .map(|s| parse_date_bound(s, false))
                .transpose()?,
            end: self
                .end
                .as_deref()
                .map(|s| parse_date_bound(s, true))
                .transpose()?,
        })
    }
}

/// `cred search`: semantic search with metadata filters.
pub async fn run_search(config: &Config, query: &str, opts: &SearchOptions, json: bool) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let app = App::open(config).await?;
    let gateway = app.gateway().await?;
    let request = SearchRequest {
        query,
        limit: opts.limit.unwrap_or(config.retrieval.limit),
        threshold: opts.threshold.unwrap_or(config.retrieval.threshold),
        filter: opts.filter()?,
    };

    let hits = search(gateway.as_ref(), app.index.as_ref(), app.store.as_ref(), &request).await?;
    app.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    print_hits(&hits);
    Ok(())
}

fn print_hits(hits: &[SearchHit]) {
    for (i, hit) in hits.iter().enumerate() {
        let doc = &hit.document;
        let meta = &doc.metadata;
        let title = if doc.title.is_empty() {
            "(untitled)"
        } else {
            doc.title.as_str()
        };

        println!(
            "{}. [{:.3}] {} (trust {:.3})",
            i + 1,
            hit.similarity,
            title,
            doc.trust_factor
        );
        if let Some(publisher) = &meta.publisher {
            println!("    publisher: {}", publisher);
        }
        if let Some(date) = meta.published_at.as_ref().or(meta.scanned_at.as_ref()) {
            println!("    published: {}", date);
        }
        if let Some(class) = &meta.classification {
            println!("    classification: {}", class);
        }
        if let Some(url) = &meta.url {
            println!("    url: {}", url);
        }
        println!("    id: {}", doc.id);
        println!();
    }
}
