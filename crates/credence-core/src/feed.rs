//! External feed contract.
//!
//! The ingestion coordinator only needs `fetch(cursor?) -> page`; the
//! HTTP client with bearer authentication lives in the app crate.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::FeedPage;

/// A cursor-paginated source of records.
#[async_trait]
pub trait Feed: Send + Sync {
    /// Fetch up to `page_size` records starting at `cursor`
    /// (`None` requests the first page).
    async fn fetch(&self, cursor: Option<&str>, page_size: usize) -> Result<FeedPage>;
}

/// A feed that replays a fixed list of pages.
///
/// Page `i` is addressed by cursor `None` for `i == 0` and by the string
/// `"{i}"` otherwise; each page's `next_cursor` is rewritten accordingly.
/// Failures can be injected at chosen cursors for retry tests.
pub struct ScriptedFeed {
    pages: Vec<FeedPage>,
    failures: Mutex<VecDeque<(usize, Error)>>,
    fetches: Mutex<Vec<Option<String>>>,
}

impl ScriptedFeed {
    pub fn new(pages: Vec<FeedPage>) -> Self {
        let last = pages.len().saturating_sub(1);
        let pages = pages
            .into_iter()
            .enumerate()
            .map(|(i, mut page)| {
                page.next_cursor = (i < last).then(|| (i + 1).to_string());
                page
            })
            .collect();
        Self {
            pages,
            failures: Mutex::new(VecDeque::new()),
            fetches: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next fetch of page `page` with `error`.
    pub fn fail_once(self, page: usize, error: Error) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((page, error));
        self
    }

    /// Cursors requested so far, in order.
    pub fn fetched_cursors(&self) -> Vec<Option<String>> {
        self.fetches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Feed for ScriptedFeed {
    async fn fetch(&self, cursor: Option<&str>, page_size: usize) -> Result<FeedPage> {
        self.fetches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cursor.map(str::to_string));

        let index = match cursor {
            None => 0,
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| Error::Collaborator(format!("unknown cursor: {}", c)))?,
        };

        {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(pos) = failures.iter().position(|(p, _)| *p == index) {
                if let Some((_, err)) = failures.remove(pos) {
                    return Err(err);
                }
            }
        }

        let mut page = self.pages.get(index).cloned().unwrap_or_default();
        page.records.truncate(page_size);
        Ok(page)
    }
}
