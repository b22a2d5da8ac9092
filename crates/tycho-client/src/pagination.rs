//! Continuation-token pagination over the bulk REST endpoints.

use std::collections::HashMap;

use anyhow::Result;
use futures_util::future::BoxFuture;

/// Fetches one page for the merged query, returning the page and the
/// continuation token ("" when the listing is exhausted).
pub type FetchFn<T> =
    Box<dyn FnMut(HashMap<String, String>) -> BoxFuture<'static, Result<(T, String)>> + Send>;

/// Pull-based iterator over a paginated listing.
///
/// `has_next` is true before the first fetch, so `while iter.has_next()`
/// always performs at least one request. A fetch error clears the token,
/// terminating the loop instead of retrying the same page forever.
pub struct PageIterator<T> {
    query: HashMap<String, String>,
    initialized: bool,
    continuation: String,
    fetch: FetchFn<T>,
}

impl<T> PageIterator<T> {
    pub fn new(fetch: FetchFn<T>) -> Self {
        Self {
            query: HashMap::new(),
            initialized: false,
            continuation: String::new(),
            fetch,
        }
    }

    /// Merge fixed query parameters applied to every page request.
    pub fn set_query(&mut self, query: HashMap<String, String>) {
        self.query.extend(query);
    }

    pub fn has_next(&self) -> bool {
        !self.initialized || !self.continuation.is_empty()
    }

    pub async fn next(&mut self) -> Result<T> {
        let mut query = self.query.clone();
        if !self.continuation.is_empty() {
            query.insert("next".to_string(), self.continuation.clone());
        }
        self.initialized = true;
        match (self.fetch)(query).await {
            Ok((page, token)) => {
                self.continuation = token;
                Ok(page)
            }
            Err(err) => {
                self.continuation.clear();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn paged_fetch(pages: Vec<(Vec<u32>, &'static str)>) -> FetchFn<Vec<u32>> {
        let calls = Arc::new(AtomicUsize::new(0));
        Box::new(move |_query| {
            let index = calls.fetch_add(1, Ordering::SeqCst);
            let (page, token) = pages[index].clone();
            Box::pin(async move { Ok((page, token.to_string())) })
        })
    }

    #[tokio::test]
    async fn iterates_until_token_runs_out() {
        let mut iterator = PageIterator::new(paged_fetch(vec![
            (vec![1, 2], "tok-1"),
            (vec![3], "tok-2"),
            (vec![4], ""),
        ]));

        let mut all = Vec::new();
        while iterator.has_next() {
            all.extend(iterator.next().await.expect("page"));
        }
        assert_eq!(all, vec![1, 2, 3, 4]);
        assert!(!iterator.has_next());
    }

    #[tokio::test]
    async fn empty_listing_fetches_exactly_once() {
        let mut iterator = PageIterator::new(paged_fetch(vec![(vec![], "")]));
        assert!(iterator.has_next());
        let page = iterator.next().await.expect("page");
        assert!(page.is_empty());
        assert!(!iterator.has_next());
    }

    #[tokio::test]
    async fn continuation_token_is_merged_into_the_query() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_by_fetch = Arc::clone(&seen);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut iterator = PageIterator::new(Box::new(move |query: HashMap<String, String>| {
            seen_by_fetch.lock().push(query.get("next").cloned());
            let index = calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let token = if index == 0 { "abc" } else { "" };
                Ok((vec![index], token.to_string()))
            })
        }));
        iterator.set_query(HashMap::from([("limit".to_string(), "10".to_string())]));

        while iterator.has_next() {
            iterator.next().await.expect("page");
        }
        let seen = seen.lock();
        assert_eq!(*seen, vec![None, Some("abc".to_string())]);
    }

    #[tokio::test]
    async fn error_clears_continuation_and_terminates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut iterator: PageIterator<Vec<u32>> =
            PageIterator::new(Box::new(move |_query| {
                let index = calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    match index {
                        0 => Ok((vec![1], "more".to_string())),
                        _ => Err(anyhow!("backend unavailable")),
                    }
                })
            }));

        iterator.next().await.expect("first page");
        assert!(iterator.has_next());
        iterator.next().await.expect_err("second page fails");
        assert!(!iterator.has_next());
    }
}
