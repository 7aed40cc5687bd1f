//! Repository over a paged cache.

use std::sync::Arc;

use futures::stream::BoxStream;
use tracing::{debug, info};

use super::adapter::{PageFetch, PagedRequirements, PagingAdapter, PagingHooks};
use super::data_source::PagingDataSource;
use crate::error::{Result, TellerError};
use crate::refresh::{RefreshManagers, RefreshResult};
use crate::repository::{Executors, Repository, Requirements};
use crate::state::CacheState;
use crate::sync_state::SyncStateManager;

/// Refresh managers usable by paging repositories over `D`.
pub type PagingRefreshManagers<D> =
  RefreshManagers<PageFetch<D>, <D as PagingDataSource>::Error>;

/// Snapshot type published by a paging repository over `D`.
pub type PagingRepositoryState<D> =
  CacheState<<D as PagingDataSource>::Cache, <D as PagingDataSource>::Error>;

/// A [`Repository`] that fetches its cache one page at a time.
///
/// Setting requirements starts at the first page. Every move of the page
/// cursor goes through the same path as setting requirements, and any page
/// past the first is fetched regardless of the cache's age. Going back to
/// the first page, or forcing a refresh, trims the saved cache down to the
/// first page.
pub struct PagingRepository<D: PagingDataSource> {
  repository: Repository<PagingAdapter<D>, PagingHooks>,
}

impl<D: PagingDataSource> PagingRepository<D> {
  pub fn new(data_source: D, sync_state: Arc<dyn SyncStateManager>, executors: Executors) -> Self {
    let refresh_managers = Arc::new(RefreshManagers::new(executors.background().clone()));
    Self::with_refresh_managers(data_source, sync_state, refresh_managers, executors)
  }

  pub fn with_refresh_managers(
    data_source: D,
    sync_state: Arc<dyn SyncStateManager>,
    refresh_managers: Arc<PagingRefreshManagers<D>>,
    executors: Executors,
  ) -> Self {
    let repository = Repository::with_hooks(
      Arc::new(PagingAdapter::new(data_source)),
      PagingHooks,
      sync_state,
      refresh_managers,
      executors,
    );
    Self { repository }
  }

  fn adapter(&self) -> &PagingAdapter<D> {
    self.repository.data_source()
  }

  pub fn data_source(&self) -> &D {
    &self.adapter().inner
  }

  pub fn requirements(&self) -> Option<D::Requirements> {
    self.repository.requirements().map(|paged| paged.requirements)
  }

  /// Switch to new requirements, starting over at the first page.
  pub fn set_requirements(&self, requirements: Option<D::Requirements>) -> Result<()> {
    self.adapter().reset_cursor();
    let paged = requirements.map(|requirements| PagedRequirements {
      requirements,
      paging: self.data_source().first_page_paging_requirements(),
    });
    self.repository.set_requirements(paged)
  }

  /// The page the repository is on. The first page while no requirements
  /// are set.
  pub fn paging_requirements(&self) -> D::PagingRequirements {
    self
      .repository
      .requirements()
      .map(|paged| paged.paging)
      .unwrap_or_else(|| self.data_source().first_page_paging_requirements())
  }

  /// Move the page cursor, keeping the current requirements.
  pub fn set_paging_requirements(&self, paging: D::PagingRequirements) -> Result<()> {
    let requirements = self.requirements().ok_or(TellerError::RequirementsNotSet)?;
    if self.adapter().is_first_page(&paging) {
      self.adapter().reset_cursor();
    }
    debug!(tag = %requirements.tag(), paging = ?paging, "paging requirements set");
    self
      .repository
      .set_requirements(Some(PagedRequirements { requirements, paging }))
  }

  /// Whether the last fetched page said more pages follow. Assumed until a
  /// page has been fetched.
  pub fn are_more_pages_available(&self) -> bool {
    self.adapter().cursor().more_pages
  }

  /// Advance to the next page.
  ///
  /// Returns `Ok(false)` without doing anything when the last fetched page
  /// was the final one.
  pub fn go_to_next_page(&self) -> Result<bool> {
    if self.requirements().is_none() {
      return Err(TellerError::RequirementsNotSet);
    }
    let next_page = {
      let cursor = self.adapter().cursor();
      if !cursor.more_pages {
        debug!("no more pages available");
        return Ok(false);
      }
      cursor.next_page.clone()
    };

    let paging = self
      .data_source()
      .next_page_paging_requirements(&self.paging_requirements(), next_page.as_ref());
    info!(paging = ?paging, "going to next page");
    self.set_paging_requirements(paging)?;
    Ok(true)
  }

  pub fn current_state(&self) -> PagingRepositoryState<D> {
    self.repository.current_state()
  }

  pub fn observe(&self) -> BoxStream<'static, PagingRepositoryState<D>> {
    self.repository.observe()
  }

  /// Refresh the cache. A forced refresh goes back to the first page first.
  pub async fn refresh(&self, force: bool) -> Result<RefreshResult<D::Error>> {
    if force && !self.adapter().is_first_page(&self.paging_requirements()) {
      let first = self.data_source().first_page_paging_requirements();
      self.set_paging_requirements(first)?;
    }
    self.repository.refresh(force).await
  }

  pub async fn refresh_if_no_cache(&self) -> Result<RefreshResult<D::Error>> {
    self.repository.refresh_if_no_cache().await
  }
}
