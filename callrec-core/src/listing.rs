use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::storage::{ObjectStore, ObjectSummary, StorageResult};

/// Position of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "token", rename_all = "snake_case")]
pub enum PageCursor {
    /// No page fetched yet.
    Start,
    /// More pages remain behind this continuation token.
    Continue(String),
    /// The last page has been fetched.
    Exhausted,
}

impl PageCursor {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PageCursor::Exhausted)
    }

    fn token(&self) -> Option<&str> {
        match self {
            PageCursor::Continue(token) => Some(token),
            PageCursor::Start | PageCursor::Exhausted => None,
        }
    }
}

/// One page of a listing plus the cursor for the following page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub objects: Vec<ObjectSummary>,
    pub next: PageCursor,
}

impl ListingPage {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn has_more(&self) -> bool {
        matches!(self.next, PageCursor::Continue(_))
    }
}

/// Walks the keys under one prefix, one bounded page per call.
///
/// Pages are not a snapshot: objects written between calls may or may not
/// show up. Store errors are returned untouched; retrying is the caller's job.
#[derive(Clone)]
pub struct PaginatedLister {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    max_keys: i32,
}

impl PaginatedLister {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, max_keys: i32) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            max_keys,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn list_page(&self, cursor: &PageCursor) -> StorageResult<ListingPage> {
        if cursor.is_exhausted() {
            return Ok(ListingPage {
                objects: Vec::new(),
                next: PageCursor::Exhausted,
            });
        }
        let page = self
            .store
            .list_objects(&self.prefix, self.max_keys, cursor.token())
            .await?;
        let next = match page.next_token {
            Some(token) => PageCursor::Continue(token),
            None => PageCursor::Exhausted,
        };
        debug!(
            bucket = self.store.bucket(),
            prefix = %self.prefix,
            count = page.objects.len(),
            more = matches!(next, PageCursor::Continue(_)),
            "listed page"
        );
        Ok(ListingPage {
            objects: page.objects,
            next,
        })
    }
}
