//! Pages, cursors, and the injected page-fetch interface.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::fetch::error::FetchError;

/// Continuation token: index of the page a fetch should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor(pub u32);

impl Cursor {
    /// The cursor `n` pages further on.
    pub fn advance(self, n: u32) -> Cursor {
        Cursor(self.0.saturating_add(n))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One page of a feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Where the following page starts; `None` means the feed is exhausted.
    pub cursor: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, cursor: Option<Cursor>) -> Self {
        Self { items, cursor }
    }

    /// Cursor to continue from after this page.
    ///
    /// A page shorter than `page_size` ends the feed even if the backend
    /// still returned a continuation token.
    pub fn continuation(&self, page_size: u32) -> Option<Cursor> {
        if self.items.len() < page_size as usize {
            return None;
        }
        self.cursor
    }
}

/// Fetches one page of a feed. Implemented by the caller around whatever
/// transport it uses; `cursor` is `None` for the first page.
#[async_trait]
pub trait PageFetcher<T>: Send + Sync {
    async fn fetch_page(
        &self,
        cursor: Option<Cursor>,
        page_size: u32,
    ) -> Result<Page<T>, FetchError>;
}

#[async_trait]
impl<T, F, Fut> PageFetcher<T> for F
where
    T: Send + 'static,
    F: Fn(Option<Cursor>, u32) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Page<T>, FetchError>> + Send + 'static,
{
    async fn fetch_page(
        &self,
        cursor: Option<Cursor>,
        page_size: u32,
    ) -> Result<Page<T>, FetchError> {
        (self)(cursor, page_size).await
    }
}
