//! Runs a [`PagingDataSource`] through the plain repository machinery.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Duration;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::BoxStream;
use tracing::{debug, warn};

use super::data_source::{PagedFetchResponse, PagingDataSource};
use crate::repository::{DataSource, Requirements, RepositoryHooks};

/// Requirements plus the page currently wanted. The tag is the one of the
/// wrapped requirements, so every page shares one sync state entry and one
/// refresh manager.
#[derive(Debug, Clone, PartialEq)]
pub struct PagedRequirements<R, P> {
  pub requirements: R,
  pub paging: P,
}

impl<R, P> Requirements for PagedRequirements<R, P>
where
  R: Requirements,
  P: Clone + Send + Sync + 'static,
{
  fn tag(&self) -> String {
    self.requirements.tag()
  }
}

/// A fetched page along with the paging requirements it was fetched for.
pub struct PageFetch<D: PagingDataSource> {
  paging: D::PagingRequirements,
  response: PagedFetchResponse<D::FetchResult, D::NextPageRequirements>,
}

impl<D: PagingDataSource> fmt::Debug for PageFetch<D> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PageFetch")
      .field("paging", &self.paging)
      .field("are_more_pages_available", &self.response.are_more_pages_available)
      .finish_non_exhaustive()
  }
}

/// What the last saved page said about the pages after it.
#[derive(Debug, Clone)]
pub(crate) struct PageCursor<N> {
  pub(crate) next_page: Option<N>,
  pub(crate) more_pages: bool,
}

impl<N> Default for PageCursor<N> {
  fn default() -> Self {
    // Unknown until a page has been fetched
    Self {
      next_page: None,
      more_pages: true,
    }
  }
}

pub struct PagingAdapter<D: PagingDataSource> {
  pub(crate) inner: D,
  cursor: Mutex<PageCursor<D::NextPageRequirements>>,
}

impl<D: PagingDataSource> PagingAdapter<D> {
  pub(crate) fn new(inner: D) -> Self {
    Self {
      inner,
      cursor: Mutex::new(PageCursor::default()),
    }
  }

  pub(crate) fn cursor(&self) -> MutexGuard<'_, PageCursor<D::NextPageRequirements>> {
    self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn reset_cursor(&self) {
    *self.cursor() = PageCursor::default();
  }

  pub(crate) fn is_first_page(&self, paging: &D::PagingRequirements) -> bool {
    *paging == self.inner.first_page_paging_requirements()
  }

  fn trim_to_first_page(&self, requirements: &D::Requirements) {
    match self.inner.persist_only_first_page(requirements) {
      Ok(()) => debug!(tag = %requirements.tag(), "trimmed cache to first page"),
      Err(err) => warn!(tag = %requirements.tag(), error = %err, "trimming cache to first page failed"),
    }
  }
}

impl<D: PagingDataSource> DataSource for PagingAdapter<D> {
  type Requirements = PagedRequirements<D::Requirements, D::PagingRequirements>;
  type FetchResult = PageFetch<D>;
  type Cache = D::Cache;
  type Error = D::Error;

  fn max_age_of_cache(&self) -> Duration {
    self.inner.max_age_of_cache()
  }

  fn automatically_refresh(&self) -> bool {
    self.inner.automatically_refresh()
  }

  fn fetch_fresh_cache(
    &self,
    requirements: &Self::Requirements,
  ) -> BoxFuture<'static, Result<PageFetch<D>, D::Error>> {
    let paging = requirements.paging.clone();
    self
      .inner
      .fetch_fresh_cache(&requirements.requirements, &requirements.paging)
      .map(move |response| response.map(|response| PageFetch { paging, response }))
      .boxed()
  }

  fn save_cache(&self, fetched: &PageFetch<D>, requirements: &Self::Requirements) -> Result<(), D::Error> {
    self
      .inner
      .save_cache(&fetched.response.data, &requirements.requirements, &fetched.paging)?;

    let mut cursor = self.cursor();
    cursor.next_page = fetched.response.next_page_requirements.clone();
    cursor.more_pages = fetched.response.are_more_pages_available;
    Ok(())
  }

  fn observe_cache(&self, requirements: &Self::Requirements) -> BoxStream<'static, D::Cache> {
    self.inner.observe_cache(&requirements.requirements)
  }

  fn is_cache_empty(&self, cache: &D::Cache, requirements: &Self::Requirements) -> bool {
    self.inner.is_cache_empty(cache, &requirements.requirements)
  }
}

/// Page-aware refresh policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct PagingHooks;

impl<D: PagingDataSource> RepositoryHooks<PagingAdapter<D>> for PagingHooks {
  /// Pages past the first are always fetched.
  fn needs_a_refresh(
    &self,
    data_source: &PagingAdapter<D>,
    requirements: &PagedRequirements<D::Requirements, D::PagingRequirements>,
    too_old: bool,
  ) -> bool {
    too_old || !data_source.is_first_page(&requirements.paging)
  }

  fn before_refresh(
    &self,
    data_source: &PagingAdapter<D>,
    requirements: &PagedRequirements<D::Requirements, D::PagingRequirements>,
    force: bool,
  ) {
    if force || data_source.is_first_page(&requirements.paging) {
      data_source.trim_to_first_page(&requirements.requirements);
    }
  }

  fn before_observe(
    &self,
    data_source: &PagingAdapter<D>,
    requirements: &PagedRequirements<D::Requirements, D::PagingRequirements>,
  ) {
    if data_source.is_first_page(&requirements.paging) {
      data_source.trim_to_first_page(&requirements.requirements);
    }
  }
}
