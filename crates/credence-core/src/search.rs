//! Semantic search with metadata filters.
//!
//! The query path operates entirely through the [`EmbeddingGateway`],
//! [`SimilarityIndex`] and [`RecordStore`] traits:
//!
//! 1. Embed the query text with `embed_one` and L2-normalize it.
//! 2. Ask the index for documents with similarity `>= threshold`.
//! 3. Hydrate them from the record store, keeping similarity order.
//! 4. Apply the [`SearchFilter`] and truncate to `limit`.
//!
//! With an empty filter only `limit` documents are requested from the
//! index. With any filter set, every document above the threshold is
//! requested so that filtering happens before truncation.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use tracing::debug;

use crate::embedding::{embed_query, EmbeddingGateway};
use crate::error::{Error, Result};
use crate::index::SimilarityIndex;
use crate::models::Document;
use crate::store::RecordStore;

/// Inputs for one [`search`] call.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    /// Maximum number of results.
    pub limit: usize,
    /// Minimum cosine similarity.
    pub threshold: f64,
    pub filter: SearchFilter,
}

/// Metadata constraints applied to hydrated documents.
///
/// `classifications` and `publication_ids` combine with OR: a document
/// passes if it matches any listed classification or any listed
/// publication. Every other field combines with AND.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Exact match on the feed's article type.
    pub kind: Option<String>,
    pub classifications: Vec<String>,
    pub publication_ids: Vec<i64>,
    /// Inclusive lower bound on `published_at`, falling back to `scanned_at`.
    pub start: Option<NaiveDateTime>,
    /// Inclusive upper bound on `published_at`, falling back to `scanned_at`.
    pub end: Option<NaiveDateTime>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.classifications.is_empty()
            && self.publication_ids.is_empty()
            && self.start.is_none()
            && self.end.is_none()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        let meta = &doc.metadata;

        if let Some(kind) = &self.kind {
            if meta.kind.as_deref() != Some(kind.as_str()) {
                return false;
            }
        }

        if !self.classifications.is_empty() || !self.publication_ids.is_empty() {
            let by_class = meta.classification.as_deref().is_some_and(|c| {
                let c = normalize_classification(c);
                self.classifications
                    .iter()
                    .any(|wanted| normalize_classification(wanted) == c)
            });
            let by_publication = meta
                .publication_id
                .is_some_and(|id| self.publication_ids.contains(&id));
            if !by_class && !by_publication {
                return false;
            }
        }

        if self.start.is_some() || self.end.is_some() {
            let Some(at) = document_date(doc) else {
                return false;
            };
            if self.start.is_some_and(|start| at < start) {
                return false;
            }
            if self.end.is_some_and(|end| at > end) {
                return false;
            }
        }

        true
    }
}

/// Canonical form used to compare classifications: lowercase, with
/// `"'t "` mapped to `"-"` (so `"Don't Trust"` matches `"don-trust"`).
pub fn normalize_classification(value: &str) -> String {
    value.replace("'t ", "-").to_lowercase()
}

/// Parse a date-range bound given by a user.
///
/// Accepts `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` and RFC 3339. A plain day
/// used as an upper bound (`end_of_day`) covers the whole day, up to
/// `23:59:59`.
pub fn parse_date_bound(value: &str, end_of_day: bool) -> Result<NaiveDateTime> {
    if let Ok(day) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let time = if end_of_day {
            NaiveTime::from_hms_opt(23, 59, 59)
        } else {
            NaiveTime::from_hms_opt(0, 0, 0)
        };
        return time
            .map(|t| day.and_time(t))
            .ok_or_else(|| Error::InvalidArgument(format!("invalid date: {}", value)));
    }
    parse_timestamp(value)
        .ok_or_else(|| Error::InvalidArgument(format!("unrecognised date: {}", value)))
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// `published_at`, or `scanned_at` when the publication date is missing.
fn document_date(doc: &Document) -> Option<NaiveDateTime> {
    doc.metadata
        .published_at
        .as_deref()
        .or(doc.metadata.scanned_at.as_deref())
        .and_then(parse_timestamp)
}

/// A hydrated search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub similarity: f64,
    #[serde(flatten)]
    pub document: Document,
}

/// Run a semantic search.
///
/// Results are ordered by similarity (desc), then document id (asc).
/// Blank queries return no results without calling the gateway.
pub async fn search<G, I, S>(
    gateway: &G,
    index: &I,
    store: &S,
    req: &SearchRequest<'_>,
) -> Result<Vec<SearchHit>>
where
    G: EmbeddingGateway + ?Sized,
    I: SimilarityIndex + ?Sized,
    S: RecordStore + ?Sized,
{
    if req.query.trim().is_empty() || req.limit == 0 {
        return Ok(Vec::new());
    }
    if let (Some(start), Some(end)) = (req.filter.start, req.filter.end) {
        if start > end {
            return Err(Error::InvalidArgument(format!(
                "start date {} is after end date {}",
                start, end
            )));
        }
    }

    let vector = embed_query(gateway, req.query).await?;
    let fetch_k = if req.filter.is_empty() {
        req.limit
    } else {
        index.embedding_count().await?.max(req.limit)
    };
    let neighbors = index.query(&vector, fetch_k, req.threshold).await?;
    debug!(candidates = neighbors.len(), "similarity query complete");

    let ids: Vec<String> = neighbors.iter().map(|n| n.document_id.clone()).collect();
    let mut docs = store.get_many(&ids).await?.into_iter().peekable();

    // get_many preserves order and skips missing ids, so walk both in step
    let mut hits = Vec::new();
    for neighbor in neighbors {
        let Some(doc) = docs.next_if(|d| d.id == neighbor.document_id) else {
            continue;
        };
        if !req.filter.matches(&doc) {
            continue;
        }
        hits.push(SearchHit {
            similarity: neighbor.similarity,
            document: doc,
        });
        if hits.len() == req.limit {
            break;
        }
    }
    Ok(hits)
}
