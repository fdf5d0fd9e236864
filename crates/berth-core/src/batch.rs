//! Batching and pagination helpers for remote cluster APIs.
//!
//! Describe-style calls accept a bounded number of identifiers per request,
//! and list-style calls return results one page at a time. [`chunked`] splits
//! identifier lists to the per-call limit; [`pages`] turns a page fetcher into
//! a lazy stream that yields each page as it arrives.

use std::future::Future;

use futures_util::stream::{self, Stream, TryStreamExt};
use serde::{Deserialize, Serialize};

/// Maximum task identifiers per describe-tasks request.
pub const MAX_DESCRIBE_TASKS: usize = 100;
/// Maximum container instance identifiers per describe request.
pub const MAX_DESCRIBE_CONTAINER_INSTANCES: usize = 100;
/// Maximum service identifiers per describe-services request.
pub const MAX_DESCRIBE_SERVICES: usize = 10;

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Continuation token. `None` on the last page.
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// Split `items` into consecutive chunks of at most `limit` elements.
///
/// Chunks preserve input order and only the final chunk may be short.
pub fn chunked<T>(items: &[T], limit: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(limit.max(1))
}

/// Lazily walk a paginated listing.
///
/// `fetch` receives the continuation token (`None` for the first page) and
/// is called again only when the consumer polls past the current page. The
/// stream ends after the page with no continuation token, or on the first
/// error.
pub fn pages<T, E, F, Fut>(fetch: F) -> impl Stream<Item = Result<Vec<T>, E>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    // `None` once exhausted, `Some(token)` while another page is due.
    let start: Option<Option<String>> = Some(None);
    stream::try_unfold((fetch, start), |(mut fetch, cursor)| async move {
        let Some(token) = cursor else {
            return Ok(None);
        };
        let page = fetch(token).await?;
        let next = page.next_token.map(Some);
        Ok(Some((page.items, (fetch, next))))
    })
}

/// Drain a page stream into a single vector, in page order.
pub async fn drain<T, E, S>(pages: S) -> Result<Vec<T>, E>
where
    S: Stream<Item = Result<Vec<T>, E>>,
{
    pages.try_concat().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::cell::Cell;

    #[test]
    fn chunks_respect_limit() {
        let ids: Vec<u32> = (0..250).collect();
        let sizes: Vec<usize> = chunked(&ids, MAX_DESCRIBE_TASKS).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);

        let flattened: Vec<u32> = chunked(&ids, 100).flatten().copied().collect();
        assert_eq!(flattened, ids);
    }

    #[test]
    fn empty_input_has_no_chunks() {
        let ids: Vec<u32> = Vec::new();
        assert_eq!(chunked(&ids, 10).count(), 0);
    }

    fn paged(data: &[u32], size: usize, token: Option<String>) -> Result<Page<u32>, String> {
        let start: usize = match token {
            None => 0,
            Some(t) => t.parse().map_err(|_| format!("bad token {t}"))?,
        };
        let end = (start + size).min(data.len());
        let next_token = (end < data.len()).then(|| end.to_string());
        Ok(Page {
            items: data[start..end].to_vec(),
            next_token,
        })
    }

    #[tokio::test]
    async fn drain_collects_every_page() {
        let data: Vec<u32> = (0..7).collect();
        let calls = Cell::new(0);
        let all = drain(pages(|token| {
            calls.set(calls.get() + 1);
            let page = paged(&data, 3, token);
            async move { page }
        }))
        .await
        .unwrap();
        assert_eq!(all, data);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn pages_are_fetched_lazily() {
        let data: Vec<u32> = (0..10).collect();
        let calls = Cell::new(0);
        let stream = pages(|token| {
            calls.set(calls.get() + 1);
            let page = paged(&data, 2, token);
            async move { page }
        });
        let first: Vec<Result<Vec<u32>, String>> = stream.take(1).collect().await;
        assert_eq!(first, vec![Ok(vec![0, 1])]);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn errors_stop_the_stream() {
        let calls = Cell::new(0);
        let result: Result<Vec<u32>, String> = drain(pages(|_token| {
            calls.set(calls.get() + 1);
            async move { Err::<Page<u32>, _>("throttled".to_string()) }
        }))
        .await;
        assert_eq!(result, Err("throttled".to_string()));
        assert_eq!(calls.get(), 1);
    }
}
