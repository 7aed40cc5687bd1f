//! Data source contract for caches fetched one page at a time.

use std::fmt;

use chrono::Duration;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::task::JoinError;

use crate::repository::Requirements;

/// One fetched page and what the remote said about the next one.
#[derive(Debug, Clone)]
pub struct PagedFetchResponse<F, N> {
  pub data: F,
  /// Hint used to build the next page's paging requirements, like a cursor
  /// returned by the remote.
  pub next_page_requirements: Option<N>,
  pub are_more_pages_available: bool,
}

impl<F, N> PagedFetchResponse<F, N> {
  pub fn new(data: F, next_page_requirements: Option<N>, are_more_pages_available: bool) -> Self {
    Self {
      data,
      next_page_requirements,
      are_more_pages_available,
    }
  }

  /// The last page: no hint, no more pages.
  pub fn last_page(data: F) -> Self {
    Self::new(data, None, false)
  }
}

/// Like [`DataSource`](crate::repository::DataSource), with a page cursor
/// next to the requirements.
///
/// The persisted cache holds every page fetched so far; observing it yields
/// all of them together. Pages beyond the first are dropped again with
/// [`persist_only_first_page`](Self::persist_only_first_page) whenever the
/// cursor goes back to the first page.
pub trait PagingDataSource: Send + Sync + 'static {
  type Requirements: Requirements;
  /// Identifies one page, e.g. a page number or a cursor.
  type PagingRequirements: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;
  /// Hint a fetch returns to locate the page after it.
  type NextPageRequirements: Clone + Send + Sync + 'static;
  type FetchResult: Send + Sync + 'static;
  type Cache: Clone + Send + Sync + 'static;
  type Error: std::error::Error + From<JoinError> + Send + Sync + 'static;

  fn max_age_of_cache(&self) -> Duration;

  fn automatically_refresh(&self) -> bool {
    true
  }

  fn first_page_paging_requirements(&self) -> Self::PagingRequirements;

  fn next_page_paging_requirements(
    &self,
    current: &Self::PagingRequirements,
    next_page: Option<&Self::NextPageRequirements>,
  ) -> Self::PagingRequirements;

  /// Fetch one page. Must not start work before it is polled.
  fn fetch_fresh_cache(
    &self,
    requirements: &Self::Requirements,
    paging: &Self::PagingRequirements,
  ) -> BoxFuture<
    'static,
    Result<PagedFetchResponse<Self::FetchResult, Self::NextPageRequirements>, Self::Error>,
  >;

  /// Persist one fetched page next to the pages already saved.
  fn save_cache(
    &self,
    fetched: &Self::FetchResult,
    requirements: &Self::Requirements,
    paging: &Self::PagingRequirements,
  ) -> Result<(), Self::Error>;

  /// Stream of every saved page for `requirements`.
  fn observe_cache(&self, requirements: &Self::Requirements) -> BoxStream<'static, Self::Cache>;

  fn is_cache_empty(&self, cache: &Self::Cache, requirements: &Self::Requirements) -> bool;

  /// Delete every saved page except the first.
  fn persist_only_first_page(&self, requirements: &Self::Requirements) -> Result<(), Self::Error>;
}
