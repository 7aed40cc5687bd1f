//! Repository that binds requirements to a cache lifecycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use futures::channel::mpsc;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::data_source::{DataSource, Requirements};
use super::executors::Executors;
use super::hooks::{DefaultHooks, RepositoryHooks};
use crate::error::{Result, TellerError};
use crate::refresh::{
  FetchOutcome, RefreshManager, RefreshManagerDelegate, RefreshManagers, RefreshResult,
  SkippedReason,
};
use crate::state::{CacheState, IllegalTransition};
use crate::sync_state::SyncStateManager;

/// Snapshot type published by a repository over `D`.
pub type RepositoryState<D> = CacheState<<D as DataSource>::Cache, <D as DataSource>::Error>;

type Manager<D> = RefreshManager<<D as DataSource>::FetchResult, <D as DataSource>::Error>;
type Delegate<D> =
  dyn RefreshManagerDelegate<<D as DataSource>::FetchResult, <D as DataSource>::Error>;

/// Keeps one cache in sync with its data source and publishes its lifecycle.
///
/// Set requirements with [`set_requirements`](Self::set_requirements), then
/// [`observe`](Self::observe) to receive [`CacheState`] snapshots. Fetches
/// happen automatically when the cache is missing or too old, or explicitly
/// through [`refresh`](Self::refresh). Dropping the repository cancels its
/// refresh and ends every observer stream.
pub struct Repository<D: DataSource, H: RepositoryHooks<D> = DefaultHooks> {
  inner: Arc<Inner<D, H>>,
}

struct Inner<D: DataSource, H> {
  data_source: Arc<D>,
  hooks: H,
  sync_state: Arc<dyn SyncStateManager>,
  refresh_managers: Arc<RefreshManagers<D::FetchResult, D::Error>>,
  executors: Executors,
  state: Mutex<Published<D>>,
  self_ref: Weak<Self>,
}

/// Everything guarded by the repository lock. Snapshots are queued to
/// observers while the lock is held, so they go out in transition order.
struct Published<D: DataSource> {
  requirements: Option<D::Requirements>,
  current: RepositoryState<D>,
  refresh_manager: Option<Arc<Manager<D>>>,
  observe_task: Option<JoinHandle<()>>,
  /// Unbounded so a slow observer never misses a snapshot. `None` once the
  /// repository is disposed.
  observers: Option<Vec<mpsc::UnboundedSender<RepositoryState<D>>>>,
}

impl<D: DataSource> Repository<D, DefaultHooks> {
  /// Create a repository with its own, isolated refresh managers.
  pub fn new(data_source: D, sync_state: Arc<dyn SyncStateManager>, executors: Executors) -> Self {
    let refresh_managers = Arc::new(RefreshManagers::new(executors.background().clone()));
    Self::with_refresh_managers(data_source, sync_state, refresh_managers, executors)
  }

  /// Create a repository sharing `refresh_managers` with other repositories,
  /// so equal tags share one in-flight fetch.
  pub fn with_refresh_managers(
    data_source: D,
    sync_state: Arc<dyn SyncStateManager>,
    refresh_managers: Arc<RefreshManagers<D::FetchResult, D::Error>>,
    executors: Executors,
  ) -> Self {
    Self::with_hooks(
      Arc::new(data_source),
      DefaultHooks,
      sync_state,
      refresh_managers,
      executors,
    )
  }
}

impl<D: DataSource, H: RepositoryHooks<D>> Repository<D, H> {
  pub(crate) fn with_hooks(
    data_source: Arc<D>,
    hooks: H,
    sync_state: Arc<dyn SyncStateManager>,
    refresh_managers: Arc<RefreshManagers<D::FetchResult, D::Error>>,
    executors: Executors,
  ) -> Self {
    let inner = Arc::new_cyclic(|self_ref| Inner {
      data_source,
      hooks,
      sync_state,
      refresh_managers,
      executors,
      state: Mutex::new(Published {
        requirements: None,
        current: CacheState::none(),
        refresh_manager: None,
        observe_task: None,
        observers: Some(Vec::new()),
      }),
      self_ref: self_ref.clone(),
    });
    Self { inner }
  }

  pub fn data_source(&self) -> &Arc<D> {
    &self.inner.data_source
  }

  /// The requirements currently observed, if any.
  pub fn requirements(&self) -> Option<D::Requirements> {
    self.inner.lock().requirements.clone()
  }

  /// Switch to new requirements, or stop observing with `None`.
  ///
  /// Any refresh of the previous requirements is cancelled. Setting
  /// requirements equal to the current ones starts over: state is re-read
  /// from the sync state and a refresh may be triggered again.
  pub fn set_requirements(&self, requirements: Option<D::Requirements>) -> Result<()> {
    self.inner.set_requirements(requirements)
  }

  /// The snapshot most recently published. May be the sentinel.
  pub fn current_state(&self) -> RepositoryState<D> {
    self.inner.lock().current.clone()
  }

  /// Stream of snapshots, starting with the current one.
  ///
  /// The sentinel snapshot is never delivered. All observers receive the
  /// same snapshots in the same order. The stream ends when the repository
  /// is dropped. Subscribing triggers an automatic refresh when one is due.
  pub fn observe(&self) -> BoxStream<'static, RepositoryState<D>> {
    self.inner.observe()
  }

  /// Fetch fresh data if `force` is set or the cache needs a refresh.
  ///
  /// Returns [`TellerError::RequirementsNotSet`] before doing anything when
  /// no requirements are set. Fetch failures are not errors here: they are
  /// returned as [`RefreshResult::FailedError`] and published on the next
  /// snapshot.
  pub async fn refresh(&self, force: bool) -> Result<RefreshResult<D::Error>> {
    self.inner.refresh(force).await
  }

  /// Succeed right away if a cache was ever saved for the current
  /// requirements, otherwise behave like `refresh(false)`.
  pub async fn refresh_if_no_cache(&self) -> Result<RefreshResult<D::Error>> {
    let requirements = self.inner.requirements()?;
    if self.inner.sync_state.has_ever_fetched_data(&requirements.tag())? {
      return Ok(RefreshResult::Successful);
    }
    self.inner.refresh(false).await
  }
}

impl<D: DataSource, H> Drop for Repository<D, H>
where
  H: RepositoryHooks<D>,
{
  fn drop(&mut self) {
    self.inner.dispose();
  }
}

impl<D: DataSource, H: RepositoryHooks<D>> Inner<D, H> {
  fn lock(&self) -> MutexGuard<'_, Published<D>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn delegate(&self) -> Weak<Delegate<D>> {
    let delegate: Weak<Delegate<D>> = self.self_ref.clone();
    delegate
  }

  fn strong(&self) -> Option<Arc<Self>> {
    self.self_ref.upgrade()
  }

  fn requirements(&self) -> Result<D::Requirements> {
    self
      .lock()
      .requirements
      .clone()
      .ok_or(TellerError::RequirementsNotSet)
  }

  /// Requirements, if they still carry `tag`.
  fn requirements_for(&self, tag: &str) -> Option<D::Requirements> {
    self
      .lock()
      .requirements
      .as_ref()
      .filter(|requirements| requirements.tag() == tag)
      .cloned()
  }

  fn set_requirements(&self, requirements: Option<D::Requirements>) -> Result<()> {
    let last_fetched = match &requirements {
      Some(requirements) => self.sync_state.last_time_fetched_data(&requirements.tag())?,
      None => None,
    };

    let mut state = self.lock();
    if state.observers.is_none() {
      debug!("repository disposed, requirements ignored");
      return Ok(());
    }

    if let Some(manager) = state.refresh_manager.take() {
      manager.remove_delegate(&self.delegate());
      manager.cancel_refresh();
    }
    Self::stop_observing_locked(&mut state);
    state.requirements = requirements.clone();

    let Some(requirements) = requirements else {
      info!("requirements cleared");
      self.publish(&mut state, CacheState::none());
      return Ok(());
    };

    let tag = requirements.tag();
    let manager = self.refresh_managers.manager(&tag);
    manager.add_delegate(self.delegate());
    state.refresh_manager = Some(manager);

    match last_fetched {
      Some(last_fetched) => {
        info!(tag = %tag, last_fetched = %last_fetched, "requirements set, cache exists");
        self.publish(&mut state, CacheState::cache_exists_since(last_fetched));
        self.start_observing_locked(&mut state, requirements)?;
        drop(state);
        // Hooks may ask for a fetch even when the cache is fresh
        self.perform_automatic_refresh();
      }
      None => {
        info!(tag = %tag, "requirements set, no cache exists");
        self.publish(&mut state, CacheState::no_cache_exists());
        drop(state);
        self.perform_automatic_refresh();
      }
    }
    Ok(())
  }

  fn observe(&self) -> BoxStream<'static, RepositoryState<D>> {
    let (sender, receiver) = mpsc::unbounded();
    {
      let mut state = self.lock();
      let current = state.current.clone();
      let Some(observers) = state.observers.as_mut() else {
        return stream::empty().boxed();
      };
      // Cannot fail, the receiver is still here
      let _ = sender.unbounded_send(current);
      observers.push(sender);
    }
    self.perform_automatic_refresh();

    receiver
      .filter(|snapshot| future::ready(!snapshot.is_none()))
      .boxed()
  }

  /// Spawn `refresh(false)` if the data source allows automatic refreshes.
  fn perform_automatic_refresh(&self) {
    if !self.data_source.automatically_refresh() {
      return;
    }
    let Some(inner) = self.strong() else {
      return;
    };
    if inner.lock().requirements.is_none() {
      return;
    }

    self.executors.background().spawn(async move {
      match inner.refresh(false).await {
        Ok(result) => trace!(?result, "automatic refresh finished"),
        Err(TellerError::RequirementsNotSet) => trace!("automatic refresh skipped, no requirements"),
        Err(err) => warn!(error = %err, "automatic refresh failed"),
      }
    });
  }

  async fn refresh(&self, force: bool) -> Result<RefreshResult<D::Error>> {
    let requirements = self.requirements()?;
    let tag = requirements.tag();
    let Some(inner) = self.strong() else {
      return Ok(RefreshResult::Skipped(SkippedReason::Cancelled));
    };

    {
      let inner = Arc::clone(&inner);
      let requirements = requirements.clone();
      self
        .executors
        .run_background(move || {
          inner
            .hooks
            .before_refresh(&inner.data_source, &requirements, force)
        })
        .await?;
    }

    if !force && !self.needs_a_refresh(&requirements)? {
      debug!(tag = %tag, "cache not too old, refresh skipped");
      return Ok(RefreshResult::Skipped(SkippedReason::DataNotTooOld));
    }

    // Dropped unpolled unless it starts a new fetch
    let task = self.data_source.fetch_fresh_cache(&requirements);
    // Checked and started under one lock so a concurrent requirements change
    // either sees this fetch and cancels it or makes it skip
    let pending = {
      let state = self.lock();
      match (&state.requirements, &state.refresh_manager) {
        (Some(current), Some(manager)) if current.tag() == tag => manager.refresh(task),
        _ => {
          debug!(tag = %tag, "requirements changed before refresh started");
          return Ok(RefreshResult::Skipped(SkippedReason::Cancelled));
        }
      }
    };
    Ok(pending.await)
  }

  fn needs_a_refresh(&self, requirements: &D::Requirements) -> Result<bool> {
    let too_old = self
      .sync_state
      .is_data_too_old(&requirements.tag(), self.data_source.max_age_of_cache())?;
    Ok(
      self
        .hooks
        .needs_a_refresh(&self.data_source, requirements, too_old),
    )
  }

  fn publish(&self, state: &mut Published<D>, next: RepositoryState<D>) {
    trace!(status = ?next.status(), refreshing = next.is_refreshing(), "publishing state");
    state.current = next.clone();
    if let Some(observers) = state.observers.as_mut() {
      // A failed send means that observer's stream was dropped
      observers.retain(|observer| observer.unbounded_send(next.clone()).is_ok());
    }
  }

  /// Apply a transition if the repository is still on `tag`.
  ///
  /// Returns `Ok(false)` when the transition was discarded as stale.
  fn transition_locked<F>(
    &self,
    state: &mut Published<D>,
    tag: &str,
    transition: F,
  ) -> std::result::Result<bool, IllegalTransition>
  where
    F: FnOnce(&RepositoryState<D>) -> std::result::Result<RepositoryState<D>, IllegalTransition>,
  {
    let current_tag = state.requirements.as_ref().map(Requirements::tag);
    if state.observers.is_none() || current_tag.as_deref() != Some(tag) {
      debug!(tag = %tag, "discarding transition for stale requirements");
      return Ok(false);
    }

    let next = transition(&state.current)?;
    self.publish(state, next);
    Ok(true)
  }

  fn transition<F>(&self, tag: &str, transition: F) -> std::result::Result<bool, IllegalTransition>
  where
    F: FnOnce(&RepositoryState<D>) -> std::result::Result<RepositoryState<D>, IllegalTransition>,
  {
    let mut state = self.lock();
    self.transition_locked(&mut state, tag, transition)
  }

  fn stop_observing_locked(state: &mut Published<D>) {
    if let Some(task) = state.observe_task.take() {
      task.abort();
    }
  }

  fn stop_observing(&self) {
    Self::stop_observing_locked(&mut self.lock());
  }

  /// Start observing the saved cache. Only legal once a cache exists.
  fn start_observing_locked(
    &self,
    state: &mut Published<D>,
    requirements: D::Requirements,
  ) -> std::result::Result<(), IllegalTransition> {
    if !state.current.cache_exists() || state.current.is_none() {
      let description = state
        .current
        .change()
        .map(ToString::to_string)
        .unwrap_or_else(|err| err.state);
      return Err(IllegalTransition {
        transition: "observe_cache",
        state: description,
      });
    }

    Self::stop_observing_locked(state);
    let self_ref = self.self_ref.clone();
    let executors = self.executors.clone();
    let task = self.executors.read().spawn(async move {
      let Some(inner) = self_ref.upgrade() else {
        return;
      };
      let hook_inner = Arc::clone(&inner);
      let hook_requirements = requirements.clone();
      let hooked = executors
        .run_background(move || {
          hook_inner
            .hooks
            .before_observe(&hook_inner.data_source, &hook_requirements)
        })
        .await;
      if let Err(err) = hooked {
        error!(error = %err, "before-observe hook failed");
      }

      let mut caches = inner.data_source.observe_cache(&requirements);
      drop(inner);
      trace!(tag = %requirements.tag(), "observing cache");

      while let Some(cache) = caches.next().await {
        let Some(inner) = self_ref.upgrade() else {
          break;
        };
        inner.handle_observed_cache(&requirements, cache);
      }
    });
    state.observe_task = Some(task);
    Ok(())
  }

  fn handle_observed_cache(&self, requirements: &D::Requirements, cache: D::Cache) {
    let tag = requirements.tag();
    let is_empty = self.data_source.is_cache_empty(&cache, requirements);
    let applied = self.transition(&tag, |current| {
      if is_empty {
        current.change()?.cache_is_empty()
      } else {
        current.change()?.cached_data(cache)
      }
    });

    match applied {
      Ok(true) => {}
      Ok(false) => return,
      Err(err) => {
        error!(tag = %tag, error = %err, "observed cache could not be applied");
        return;
      }
    }

    if !self.data_source.automatically_refresh() {
      return;
    }
    match self
      .sync_state
      .is_data_too_old(&tag, self.data_source.max_age_of_cache())
    {
      Ok(true) => {
        debug!(tag = %tag, "observed cache is too old, refreshing");
        self.perform_automatic_refresh();
      }
      Ok(false) => {}
      Err(err) => warn!(tag = %tag, error = %err, "could not read age of cache"),
    }
  }

  /// `current` moved into its fetching state. A repository that joined a
  /// shared fetch after it began never saw `refresh_begin`.
  fn fetching(
    current: &RepositoryState<D>,
  ) -> std::result::Result<RepositoryState<D>, IllegalTransition> {
    if current.is_refreshing() {
      Ok(current.clone())
    } else if current.cache_exists() {
      current.change()?.fetching_fresh_cache()
    } else {
      current.change()?.first_fetch()
    }
  }

  fn begin_fetch(&self, tag: &str) {
    let applied = self.transition(tag, Self::fetching);
    if let Err(err) = applied {
      error!(tag = %tag, error = %err, "could not mark refresh as started");
    }
  }

  /// Back out of the fetching state after someone else cancelled the
  /// shared fetch.
  fn cancel_fetch(&self, tag: &str) {
    let mut state = self.lock();
    if !state.current.is_refreshing() {
      return;
    }
    let applied = self.transition_locked(&mut state, tag, |current| current.change()?.cancelled_fetch());
    if let Err(err) = applied {
      error!(tag = %tag, error = %err, "could not record cancelled refresh");
    }
  }

  fn fail_fetch(&self, tag: &str, error: Arc<D::Error>) {
    let applied = self.transition(tag, |current| {
      let fetching = Self::fetching(current)?;
      if fetching.cache_exists() {
        fetching.change()?.fail_fetching_fresh_cache(error)
      } else {
        fetching.change()?.failed_first_fetch(error)
      }
    });
    if let Err(err) = applied {
      error!(tag = %tag, error = %err, "could not record failed refresh");
    }
  }

  /// Save a finished fetch and publish the outcome. A failed save is
  /// returned so the refresh reports it.
  async fn complete_fetch(
    &self,
    tag: &str,
    outcome: FetchOutcome<D::FetchResult, D::Error>,
  ) -> std::result::Result<(), Arc<D::Error>> {
    let Some(requirements) = self.requirements_for(tag) else {
      debug!(tag = %tag, "discarding refresh result for stale requirements");
      return Ok(());
    };

    let fetched = match outcome {
      Ok(fetched) => fetched,
      Err(error) => {
        warn!(tag = %tag, error = %error, "fetch failed");
        self.fail_fetch(tag, error);
        return Ok(());
      }
    };
    let Some(inner) = self.strong() else {
      return Ok(());
    };

    // The data source would otherwise report the save while it is happening
    self.stop_observing();

    let saved = {
      let requirements = requirements.clone();
      self
        .executors
        .run_background(move || inner.data_source.save_cache(&fetched, &requirements))
        .await
    };

    // A panicking save fails the refresh like a save error
    if let Err(error) = saved.unwrap_or_else(|join| Err(D::Error::from(join))) {
      warn!(tag = %tag, error = %error, "saving fetched cache failed");
      let error = Arc::new(error);
      self.fail_fetch(tag, Arc::clone(&error));
      return Err(error);
    }

    // The saved data is on disk whether or not anyone still looks at it
    let fetched_at = Utc::now();
    if let Err(err) = self.sync_state.update_age_of_data(tag, fetched_at) {
      error!(tag = %tag, error = %err, "could not record age of fetched cache");
    }

    let mut state = self.lock();
    let current_tag = state.requirements.as_ref().map(Requirements::tag);
    if current_tag.as_deref() != Some(tag) {
      debug!(tag = %tag, "requirements changed while saving, state left alone");
      return Ok(());
    }

    let applied = self.transition_locked(&mut state, tag, |current| {
      let fetching = Self::fetching(current)?;
      if fetching.cache_exists() {
        fetching.change()?.successful_fetching_fresh_cache(fetched_at)
      } else {
        fetching.change()?.successful_first_fetch(fetched_at)
      }
    });
    match applied {
      Ok(true) => {
        info!(tag = %tag, "refresh saved");
        if let Err(err) = self.start_observing_locked(&mut state, requirements) {
          error!(tag = %tag, error = %err, "could not resume observing cache");
        }
      }
      Ok(false) => {}
      Err(err) => error!(tag = %tag, error = %err, "could not record successful refresh"),
    }
    Ok(())
  }

  fn dispose(&self) {
    let mut state = self.lock();
    if let Some(manager) = state.refresh_manager.take() {
      manager.remove_delegate(&self.delegate());
      manager.cancel_refresh();
    }
    Self::stop_observing_locked(&mut state);
    state.requirements = None;
    state.current = CacheState::none();
    // Dropping the senders ends every observer stream
    state.observers = None;
    debug!("repository disposed");
  }
}

impl<D: DataSource, H: RepositoryHooks<D>> RefreshManagerDelegate<D::FetchResult, D::Error>
  for Inner<D, H>
{
  fn refresh_begin(&self, tag: &str) {
    debug!(tag = %tag, "refresh started");
    self.begin_fetch(tag);
  }

  fn refresh_cancelled(&self, tag: &str) {
    debug!(tag = %tag, "refresh cancelled elsewhere");
    self.cancel_fetch(tag);
  }

  fn refresh_complete<'a>(
    &'a self,
    tag: &'a str,
    outcome: FetchOutcome<D::FetchResult, D::Error>,
  ) -> BoxFuture<'a, std::result::Result<(), Arc<D::Error>>> {
    self.complete_fetch(tag, outcome).boxed()
  }
}
