//! Paged cursor over a query result set.
//!
//! The cursor walks the result window `[offset, offset + limit)` one page at
//! a time, fetching a page only when the position passes the cached one. A
//! fetched page shorter than the page size marks the logical end of the
//! result set; the cursor stops without issuing another fetch.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use tidelog_common::{Result, Row};

/// One fetched result page.
#[derive(Debug, Clone, Default)]
pub struct ResultPage {
    pub rows: Vec<Row>,
    /// Total rows loaded by the query at fetch time
    pub total: u64,
    /// Output field ordering, when the query declares one
    pub fields: Option<Vec<String>>,
}

/// Source of result pages; implemented by the client facade.
#[async_trait]
pub(crate) trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, id: i64, offset: u64, limit: usize) -> Result<ResultPage>;
    async fn remove_query(&self, id: i64) -> Result<()>;
}

/// Cursor over the rows of one query.
pub struct Cursor {
    fetcher: Arc<dyn PageFetcher>,
    id: i64,
    pos: u64,
    end: u64,
    fetch_size: u64,
    next_offset: u64,
    page: VecDeque<Row>,
    last_page_len: usize,
    fetched_any: bool,
    remove_on_close: bool,
    closed: bool,
}

impl Cursor {
    pub(crate) fn new(
        fetcher: Arc<dyn PageFetcher>,
        id: i64,
        offset: u64,
        limit: u64,
        remove_on_close: bool,
        fetch_size: usize,
    ) -> Cursor {
        Cursor {
            fetcher,
            id,
            pos: offset,
            end: offset.saturating_add(limit),
            fetch_size: fetch_size as u64,
            next_offset: offset,
            page: VecDeque::new(),
            last_page_len: 0,
            fetched_any: false,
            remove_on_close,
            closed: false,
        }
    }

    /// Query id this cursor reads from.
    pub fn query_id(&self) -> i64 {
        self.id
    }

    /// Next row, or `None` once the window or the result set is exhausted.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        if self.closed || self.pos >= self.end {
            return Ok(None);
        }

        if self.page.is_empty() {
            if self.fetched_any && self.last_page_len < self.fetch_size as usize {
                // previous page came up short: logical end of results
                return Ok(None);
            }
            let page = self
                .fetcher
                .fetch_page(self.id, self.next_offset, self.fetch_size as usize)
                .await?;
            self.last_page_len = page.rows.len();
            self.next_offset += self.fetch_size;
            self.fetched_any = true;
            self.page = page.rows.into();
            if self.page.is_empty() {
                return Ok(None);
            }
        }

        self.pos += 1;
        Ok(self.page.pop_front())
    }

    /// Collect every remaining row.
    pub async fn collect_rows(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Release the cursor; removes the query when the cursor owns it.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.remove_on_close {
            self.fetcher.remove_query(self.id).await?;
        }
        Ok(())
    }
}
