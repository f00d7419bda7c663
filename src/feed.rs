//! HTTP client for the article feed.
//!
//! Requests `GET {base_url}?include-text=1&page[size]=N&page[after]=CURSOR`
//! with a bearer token and parses bodies of the form
//!
//! ```json
//! {"articles": [{"id": 1, "title": "...", "text": "...", ...}],
//!  "pagination": {"next": "https://feed/articles?page[after]=abc"}}
//! ```
//!
//! The next cursor is the `page[after]` parameter of `pagination.next`;
//! a literal `pagination.next_cursor` is accepted as well.

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, warn};

use credence_core::feed::Feed;
use credence_core::models::{FeedPage, FeedRecord, PublicationMetadata};
use credence_core::{Error, Result};

use crate::config::FeedConfig;
use crate::http::{classify_send_error, classify_status, http_client};

const CURSOR_PARAM: &str = "page[after]";

/// Bearer-authenticated, cursor-paginated feed client.
pub struct HttpFeed {
    client: reqwest::Client,
    base_url: Url,
    token: String,
    include_text: bool,
}

impl HttpFeed {
    pub fn new(config: &FeedConfig) -> anyhow::Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("feed.base_url must be set to ingest"))?;
        let base_url = Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("feed.base_url is not a valid URL: {}", e))?;
        let token = std::env::var(&config.token_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.token_env))?;

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url,
            token,
            include_text: config.include_text,
        })
    }
}

#[async_trait]
impl Feed for HttpFeed {
    async fn fetch(&self, cursor: Option<&str>, page_size: usize) -> Result<FeedPage> {
        let mut query: Vec<(&str, String)> = vec![("page[size]", page_size.to_string())];
        if self.include_text {
            query.push(("include-text", "1".to_string()));
        }
        if let Some(cursor) = cursor {
            query.push((CURSOR_PARAM, cursor.to_string()));
        }

        let response = self
            .client
            .get(self.base_url.clone())
            .query(&query)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| classify_send_error("Feed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("Feed", status, &body));
        }
        let json: Value = response.json().await.map_err(|e| {
            if e.is_decode() {
                Error::Collaborator(format!("Invalid feed response: {}", e))
            } else {
                classify_send_error("Feed", e)
            }
        })?;

        let page = parse_page(&json)?;
        debug!(
            records = page.records.len(),
            next = page.next_cursor.as_deref().unwrap_or("-"),
            "fetched feed page"
        );
        Ok(page)
    }
}

/// Parse one feed response body.
///
/// Records without an `id` are skipped with a warning; a body without an
/// `articles` array is a [`Error::Collaborator`] failure.
pub fn parse_page(json: &Value) -> Result<FeedPage> {
    let articles = json
        .get("articles")
        .and_then(|a| a.as_array())
        .ok_or_else(|| Error::Collaborator("Invalid feed response: missing articles array".into()))?;

    let mut records = Vec::with_capacity(articles.len());
    for article in articles {
        match parse_record(article) {
            Some(record) => records.push(record),
            None => warn!("skipping feed record without an id"),
        }
    }

    let pagination = json.get("pagination");
    let next_cursor = pagination
        .and_then(|p| p.get("next"))
        .and_then(|n| n.as_str())
        .and_then(cursor_from_next)
        .or_else(|| {
            pagination
                .and_then(|p| p.get("next_cursor"))
                .and_then(as_text)
        })
        .filter(|c| !c.is_empty());

    Ok(FeedPage {
        records,
        next_cursor,
    })
}

/// Extract `page[after]` from a `next` link (absolute or relative).
pub fn cursor_from_next(next: &str) -> Option<String> {
    let url = Url::parse(next)
        .or_else(|_| Url::parse("http://feed.invalid/").and_then(|base| base.join(next)))
        .ok()?;
    url.query_pairs()
        .find(|(key, _)| key == CURSOR_PARAM)
        .map(|(_, value)| value.into_owned())
}

fn parse_record(article: &Value) -> Option<FeedRecord> {
    let id = article.get("id").and_then(as_text)?;
    let text_field = |name: &str| article.get(name).and_then(as_text);
    let int_field = |name: &str| {
        article.get(name).and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    };

    Some(FeedRecord {
        id,
        title: text_field("title").unwrap_or_default(),
        text: text_field("text").unwrap_or_default(),
        metadata: PublicationMetadata {
            url: text_field("url"),
            kind: text_field("type"),
            classification: text_field("classification"),
            credibility: text_field("credibility"),
            abstract_text: text_field("abstract"),
            publisher: text_field("publisher"),
            publication_id: int_field("publication_id"),
            source_id: int_field("source_id"),
            published_at: text_field("published_at"),
            scanned_at: text_field("scanned_at"),
        },
    })
}

/// Strings as-is, numbers rendered; anything else (including null) is absent.
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
