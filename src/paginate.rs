//! Lazy walk over a cursor-based listing with a stall guard.
//!
//! Pages are fetched strictly one after another. When the provider hands back
//! the cursor it was just given, the page is not yielded and the repeat
//! counter grows; once it reaches the configured threshold the enumeration
//! ends (or fails, depending on [`StallPolicy`]). The same position is fetched
//! again and only the fetch that finally advances the cursor is yielded, so
//! nothing from a repeated position comes out twice.

use futures::stream::{self, Stream, TryStreamExt};
use std::future::Future;
use tracing::{debug, warn};

use crate::config::{PaginationConfig, StallPolicy};
use crate::error::{ProviderError, Result, RetireError};
use crate::provider::Page;

pub struct Paginator<T, F> {
    listing: String,
    fetch: F,
    config: PaginationConfig,
    cursor: Option<String>,
    repeats: u32,
    pages: u64,
    done: bool,
    stalled: bool,
    _item: std::marker::PhantomData<fn() -> T>,
}

impl<T, F, Fut> Paginator<T, F>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = std::result::Result<Page<T>, ProviderError>>,
{
    /// `listing` names the enumeration in log lines and errors.
    pub fn new(listing: impl Into<String>, config: PaginationConfig, fetch: F) -> Self {
        Self {
            listing: listing.into(),
            fetch,
            config,
            cursor: None,
            repeats: 0,
            pages: 0,
            done: false,
            stalled: false,
            _item: std::marker::PhantomData,
        }
    }

    /// Next batch of items, or `None` once the listing is exhausted or stalled.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>> {
        let threshold = self.config.stall_threshold.max(1);

        while !self.done {
            let request = self.cursor.clone();
            let page = match (self.fetch)(request.clone()).await {
                Ok(page) => page,
                Err(err) => {
                    self.done = true;
                    return Err(err.into());
                }
            };
            self.pages += 1;
            debug!(listing = %self.listing, page = self.pages, items = page.items.len(), "Fetched page");

            match page.next_cursor {
                None => {
                    self.done = true;
                    return Ok(Some(page.items));
                }
                Some(next) if request.as_deref() == Some(next.as_str()) => {
                    self.repeats += 1;
                    debug!(
                        listing = %self.listing,
                        repeats = self.repeats,
                        "Cursor unchanged"
                    );
                    if self.repeats >= threshold {
                        self.done = true;
                        self.stalled = true;
                        warn!(
                            listing = %self.listing,
                            repeats = self.repeats,
                            "Cursor has not advanced, ending pagination"
                        );
                        if self.config.on_stall == StallPolicy::Fail {
                            return Err(RetireError::PaginationStall {
                                listing: self.listing.clone(),
                                repeats: self.repeats,
                            });
                        }
                    }
                }
                Some(next) => {
                    self.repeats = 0;
                    self.cursor = Some(next);
                    return Ok(Some(page.items));
                }
            }
        }

        Ok(None)
    }

    /// Drain the whole listing into memory.
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut all = Vec::new();
        while let Some(items) = self.next_page().await? {
            all.extend(items);
        }
        Ok(all)
    }

    /// Item-level lazy stream over the listing.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        stream::try_unfold(self, |mut paginator| async move {
            Ok::<_, RetireError>(paginator.next_page().await?.map(|items| (items, paginator)))
        })
        .map_ok(|items| stream::iter(items.into_iter().map(Ok::<T, RetireError>)))
        .try_flatten()
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages
    }

    pub fn stalled(&self) -> bool {
        self.stalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Serves scripted pages in order and records the cursors it was asked for.
    fn scripted(
        pages: Vec<Page<u32>>,
    ) -> (
        impl FnMut(Option<String>) -> futures::future::Ready<std::result::Result<Page<u32>, ProviderError>>,
        Arc<Mutex<Vec<Option<String>>>>,
    ) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        let mut pages = pages.into_iter();
        let fetch = move |cursor: Option<String>| {
            seen.lock().unwrap().push(cursor);
            futures::future::ready(Ok(pages.next().expect("fetched past the script")))
        };
        (fetch, requests)
    }

    fn page(items: &[u32], cursor: Option<&str>) -> Page<u32> {
        Page::new(items.to_vec(), cursor.map(str::to_string))
    }

    #[tokio::test]
    async fn concatenates_pages_until_exhausted() {
        let (fetch, requests) = scripted(vec![
            page(&[1, 2], Some("a")),
            page(&[3], Some("b")),
            page(&[4, 5], None),
        ]);
        let items = Paginator::new("numbers", PaginationConfig::default(), fetch)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(items, vec![1, 2, 3, 4, 5]);
        assert_eq!(
            *requests.lock().unwrap(),
            vec![None, Some("a".to_string()), Some("b".to_string())]
        );
    }

    #[tokio::test]
    async fn stalled_cursor_ends_after_pages_before_the_stall() {
        let (fetch, requests) = scripted(vec![
            page(&[1, 2], Some("c1")),
            page(&[3, 4], Some("c2")),
            page(&[5], Some("c2")),
            page(&[5], Some("c2")),
            page(&[5], Some("c2")),
        ]);
        let mut paginator = Paginator::new("stuck", PaginationConfig::default(), fetch);
        let mut items = Vec::new();
        while let Some(batch) = paginator.next_page().await.unwrap() {
            items.extend(batch);
        }
        assert_eq!(items, vec![1, 2, 3, 4]);
        assert!(paginator.stalled());
        assert_eq!(paginator.pages_fetched(), 5);
        assert_eq!(requests.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn single_repeat_then_advance_yields_page_once() {
        let (fetch, _) = scripted(vec![
            page(&[1], Some("a")),
            page(&[2], Some("a")),
            page(&[2], Some("b")),
            page(&[3], None),
        ]);
        let items = Paginator::new("flaky", PaginationConfig::default(), fetch)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fail_policy_raises_stall_error() {
        let (fetch, _) = scripted(vec![
            page(&[1], Some("a")),
            page(&[], Some("a")),
            page(&[], Some("a")),
        ]);
        let config = PaginationConfig {
            stall_threshold: 2,
            on_stall: StallPolicy::Fail,
        };
        let err = Paginator::new("strict", config, fetch)
            .collect_all()
            .await
            .unwrap_err();
        assert!(matches!(err, RetireError::PaginationStall { repeats: 2, .. }));
    }

    #[tokio::test]
    async fn provider_error_ends_only_this_enumeration() {
        let mut calls = 0;
        let fetch = move |_cursor: Option<String>| {
            calls += 1;
            futures::future::ready(if calls == 1 {
                Ok(page(&[1], Some("a")))
            } else {
                Err(ProviderError::permanent("list", "AccessDenied", "denied"))
            })
        };
        let mut paginator = Paginator::new("denied", PaginationConfig::default(), fetch);
        assert_eq!(paginator.next_page().await.unwrap(), Some(vec![1]));
        assert!(matches!(
            paginator.next_page().await,
            Err(RetireError::Provider(ProviderError::Permanent { .. }))
        ));
        assert_eq!(paginator.next_page().await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_is_lazy_and_flattened() {
        let (fetch, requests) = scripted(vec![page(&[1, 2], Some("a")), page(&[3], None)]);
        let stream = Paginator::new("lazy", PaginationConfig::default(), fetch).into_stream();
        assert!(requests.lock().unwrap().is_empty());
        let items: Vec<u32> = stream.try_collect().await.unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }
}
