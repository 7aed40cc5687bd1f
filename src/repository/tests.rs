use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinError;

use super::*;
use crate::error::TellerError;
use crate::refresh::{RefreshManagers, SkippedReason};
use crate::state::CacheStatus;
use crate::sync_state::{InMemorySyncStateManager, SyncStateManager};
use crate::testing;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
struct FakeError(&'static str);

impl From<JoinError> for FakeError {
  fn from(_: JoinError) -> Self {
    FakeError("save task failed")
  }
}

#[derive(Debug, Clone)]
struct User(&'static str);

impl Requirements for User {
  fn tag(&self) -> String {
    format!("repos for {}", self.0)
  }
}

type Repos = Vec<String>;
type State = RepositoryState<FakeSource>;

/// Remote and local storage shared by every fake data source of a test.
struct Backend {
  store: Mutex<HashMap<String, Repos>>,
  changes: watch::Sender<()>,
  gate: Semaphore,
  fetches: AtomicUsize,
  responses: Mutex<VecDeque<Result<Repos, FakeError>>>,
  fail_save: AtomicBool,
  panic_save: AtomicBool,
  /// Set once a save has started.
  saving: AtomicBool,
  /// A save blocks until this receives.
  save_hold: Mutex<Option<mpsc::Receiver<()>>>,
  /// Set once a fetch future was asked for.
  fetch_requested: AtomicBool,
  /// Creating a fetch future blocks the caller until this receives.
  fetch_hold: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Backend {
  fn new(permits: usize) -> Arc<Self> {
    Arc::new(Self {
      store: Mutex::new(HashMap::new()),
      changes: watch::channel(()).0,
      gate: Semaphore::new(permits),
      fetches: AtomicUsize::new(0),
      responses: Mutex::new(VecDeque::new()),
      fail_save: AtomicBool::new(false),
      panic_save: AtomicBool::new(false),
      saving: AtomicBool::new(false),
      save_hold: Mutex::new(None),
      fetch_requested: AtomicBool::new(false),
      fetch_hold: Mutex::new(None),
    })
  }

  fn hold_saves(&self) -> mpsc::Sender<()> {
    let (release, hold) = mpsc::channel();
    *self.save_hold.lock().unwrap() = Some(hold);
    release
  }

  fn hold_fetch_requests(&self) -> mpsc::Sender<()> {
    let (release, hold) = mpsc::channel();
    *self.fetch_hold.lock().unwrap() = Some(hold);
    release
  }

  fn fetches(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }

  fn respond(&self, response: Result<Repos, FakeError>) {
    self.responses.lock().unwrap().push_back(response);
  }

  fn release(&self) {
    self.gate.add_permits(1);
  }
}

#[derive(Clone)]
struct FakeSource {
  backend: Arc<Backend>,
  automatic: bool,
}

impl FakeSource {
  fn new() -> (Self, Arc<Backend>) {
    Self::with_backend(Backend::new(Semaphore::MAX_PERMITS))
  }

  /// Fetches wait for [`Backend::release`].
  fn gated() -> (Self, Arc<Backend>) {
    Self::with_backend(Backend::new(0))
  }

  fn with_backend(backend: Arc<Backend>) -> (Self, Arc<Backend>) {
    let source = Self {
      backend: Arc::clone(&backend),
      automatic: true,
    };
    (source, backend)
  }

  fn manual(mut self) -> Self {
    self.automatic = false;
    self
  }
}

impl DataSource for FakeSource {
  type Requirements = User;
  type FetchResult = Repos;
  type Cache = Repos;
  type Error = FakeError;

  fn max_age_of_cache(&self) -> Duration {
    Duration::hours(1)
  }

  fn automatically_refresh(&self) -> bool {
    self.automatic
  }

  fn fetch_fresh_cache(&self, requirements: &User) -> BoxFuture<'static, Result<Repos, FakeError>> {
    self.backend.fetch_requested.store(true, Ordering::SeqCst);
    let hold = self.backend.fetch_hold.lock().unwrap().take();
    if let Some(hold) = hold {
      let _ = hold.recv();
    }

    let backend = Arc::clone(&self.backend);
    let user = requirements.0;
    async move {
      backend.fetches.fetch_add(1, Ordering::SeqCst);
      let _permit = backend.gate.acquire().await.map_err(|_| FakeError("closed"))?;
      let response = backend.responses.lock().unwrap().pop_front();
      response.unwrap_or_else(|| Ok(vec![format!("{}/dotfiles", user)]))
    }
    .boxed()
  }

  fn save_cache(&self, fetched: &Repos, requirements: &User) -> Result<(), FakeError> {
    self.backend.saving.store(true, Ordering::SeqCst);
    let hold = self.backend.save_hold.lock().unwrap().take();
    if let Some(hold) = hold {
      let _ = hold.recv();
    }
    if self.backend.panic_save.load(Ordering::SeqCst) {
      panic!("save crashed");
    }
    if self.backend.fail_save.load(Ordering::SeqCst) {
      return Err(FakeError("disk full"));
    }
    self
      .backend
      .store
      .lock()
      .unwrap()
      .insert(requirements.tag(), fetched.clone());
    self.backend.changes.send_replace(());
    Ok(())
  }

  fn observe_cache(&self, requirements: &User) -> BoxStream<'static, Repos> {
    let mut changes = self.backend.changes.subscribe();
    changes.mark_changed();
    let backend = Arc::clone(&self.backend);
    let tag = requirements.tag();
    stream::unfold((changes, backend, tag), |(mut changes, backend, tag)| async move {
      changes.changed().await.ok()?;
      let repos = backend.store.lock().unwrap().get(&tag).cloned().unwrap_or_default();
      Some((repos, (changes, backend, tag)))
    })
    .boxed()
  }

  fn is_cache_empty(&self, cache: &Repos, _requirements: &User) -> bool {
    cache.is_empty()
  }
}

fn repository(source: FakeSource) -> (Repository<FakeSource>, Arc<InMemorySyncStateManager>) {
  let sync_state = Arc::new(InMemorySyncStateManager::new());
  let repository = Repository::new(source, sync_state.clone(), Executors::current());
  (repository, sync_state)
}

fn seeded(source: FakeSource, age: Duration) -> (Repository<FakeSource>, Arc<InMemorySyncStateManager>) {
  let sync_state = Arc::new(InMemorySyncStateManager::new());
  testing::seed_cache(
    &source,
    sync_state.as_ref(),
    &User("alice"),
    &vec!["alice/old".to_string()],
    Utc::now() - age,
  )
  .unwrap();
  let repository = Repository::new(source, sync_state.clone(), Executors::current());
  (repository, sync_state)
}

async fn next(states: &mut BoxStream<'static, State>) -> State {
  tokio::time::timeout(StdDuration::from_secs(2), states.next())
    .await
    .expect("timed out waiting for a snapshot")
    .expect("stream ended")
}

async fn wait_for(states: &mut BoxStream<'static, State>, predicate: impl Fn(&State) -> bool) -> State {
  loop {
    let state = next(states).await;
    if predicate(&state) {
      return state;
    }
  }
}

async fn until(flag: &AtomicBool) {
  tokio::time::timeout(StdDuration::from_secs(2), async {
    while !flag.load(Ordering::SeqCst) {
      tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
  })
  .await
  .expect("timed out waiting for the flag");
}

fn shared(
  source: FakeSource,
  sync_state: &Arc<InMemorySyncStateManager>,
  managers: &Arc<RefreshManagers<Repos, FakeError>>,
) -> Repository<FakeSource> {
  Repository::with_refresh_managers(
    source,
    sync_state.clone(),
    Arc::clone(managers),
    Executors::current(),
  )
}

fn repos(names: &[&str]) -> Repos {
  names.iter().map(|name| name.to_string()).collect()
}

#[tokio::test]
async fn test_first_fetch_for_new_requirements() {
  let (source, backend) = FakeSource::gated();
  let (repository, sync_state) = repository(source);
  let mut states = repository.observe();

  repository.set_requirements(Some(User("alice"))).unwrap();

  let state = next(&mut states).await;
  assert_eq!(state.status(), CacheStatus::NoCache);
  assert!(!state.is_refreshing());

  let state = next(&mut states).await;
  assert!(state.is_fetching_first_cache());

  backend.release();
  let state = next(&mut states).await;
  assert_eq!(state.status(), CacheStatus::CacheExists);
  assert!(state.just_finished_first_fetch());
  assert!(state.cache_age().is_some());
  assert!(state.cache().is_none());

  let state = next(&mut states).await;
  assert_eq!(state.cache(), Some(&repos(&["alice/dotfiles"])));
  assert!(!state.just_finished_first_fetch());
  assert!(!state.is_refreshing());

  assert_eq!(backend.fetches(), 1);
  assert!(sync_state.has_ever_fetched_data("repos for alice").unwrap());
}

#[tokio::test]
async fn test_fresh_cache_is_not_refetched() {
  let (source, backend) = FakeSource::new();
  let (repository, sync_state) = seeded(source, Duration::minutes(5));
  let seeded_at = sync_state.last_time_fetched_data("repos for alice").unwrap();

  repository.set_requirements(Some(User("alice"))).unwrap();
  let result = repository.refresh(false).await.unwrap();
  assert!(result.is_skipped(SkippedReason::DataNotTooOld));

  let mut states = repository.observe();
  let state = wait_for(&mut states, |s| s.cache().is_some()).await;
  assert_eq!(state.cache(), Some(&repos(&["alice/old"])));
  assert_eq!(state.cache_age(), seeded_at);
  assert_eq!(backend.fetches(), 0);
}

#[tokio::test]
async fn test_stale_cache_is_refreshed_automatically() {
  let (source, backend) = FakeSource::gated();
  let (repository, sync_state) = seeded(source, Duration::days(2));
  let mut states = repository.observe();

  repository.set_requirements(Some(User("alice"))).unwrap();
  let state = wait_for(&mut states, |s| s.is_fetching_fresh_cache()).await;
  assert!(state.cache_exists());

  // Observation also sees the stale cache and asks for a refresh
  tokio::time::sleep(StdDuration::from_millis(50)).await;
  backend.release();

  let state = wait_for(&mut states, |s| s.just_finished_successful_refresh()).await;
  assert!(state.cache_age() > Some(Utc::now() - Duration::minutes(1)));
  let state = wait_for(&mut states, |s| s.cache() == Some(&repos(&["alice/dotfiles"]))).await;
  assert!(!state.is_refreshing());

  assert_eq!(backend.fetches(), 1);
  assert!(!sync_state
    .is_data_too_old("repos for alice", Duration::hours(1))
    .unwrap());
}

#[tokio::test]
async fn test_failed_refresh_keeps_cache() {
  let (source, backend) = FakeSource::new();
  let (repository, sync_state) = seeded(source.manual(), Duration::days(2));
  let seeded_at = sync_state.last_time_fetched_data("repos for alice").unwrap();
  let mut states = repository.observe();

  repository.set_requirements(Some(User("alice"))).unwrap();
  wait_for(&mut states, |s| s.cache().is_some()).await;

  backend.respond(Err(FakeError("offline")));
  let result = repository.refresh(true).await.unwrap();
  assert_eq!(result.error().map(|e| e.0), Some("offline"));

  let state = next(&mut states).await;
  assert!(state.is_fetching_fresh_cache());
  let state = next(&mut states).await;
  assert_eq!(state.refresh_error().map(|e| e.0), Some("offline"));
  assert_eq!(state.cache(), Some(&repos(&["alice/old"])));
  assert_eq!(state.cache_age(), seeded_at);
  assert!(!state.is_refreshing());
  assert_eq!(
    sync_state.last_time_fetched_data("repos for alice").unwrap(),
    seeded_at
  );

  // The next successful refresh clears the error
  let result = repository.refresh(true).await.unwrap();
  assert!(result.is_successful());
  let state = next(&mut states).await;
  assert!(state.is_fetching_fresh_cache());
  assert!(state.refresh_error().is_none());
  let state = next(&mut states).await;
  assert!(state.just_finished_successful_refresh());
  assert!(state.refresh_error().is_none());
  let state = next(&mut states).await;
  assert_eq!(state.cache(), Some(&repos(&["alice/dotfiles"])));
  assert!(!state.just_finished_successful_refresh());
}

#[tokio::test]
async fn test_save_failure_is_reported_like_a_fetch_failure() {
  let (source, backend) = FakeSource::new();
  backend.fail_save.store(true, Ordering::SeqCst);
  let (repository, sync_state) = repository(source.manual());
  let mut states = repository.observe();

  repository.set_requirements(Some(User("alice"))).unwrap();
  let result = repository.refresh(false).await.unwrap();
  assert_eq!(result.error().map(|e| e.0), Some("disk full"));

  assert_eq!(next(&mut states).await.status(), CacheStatus::NoCache);
  assert!(next(&mut states).await.is_fetching_first_cache());
  let state = next(&mut states).await;
  assert_eq!(state.status(), CacheStatus::NoCache);
  assert_eq!(state.refresh_error().map(|e| e.0), Some("disk full"));
  assert!(!state.is_refreshing());

  assert!(!sync_state.has_ever_fetched_data("repos for alice").unwrap());
}

#[tokio::test]
async fn test_refresh_without_requirements_fails() {
  let (source, backend) = FakeSource::new();
  let (repository, _sync_state) = repository(source);

  let err = repository.refresh(false).await.unwrap_err();
  assert!(matches!(err, TellerError::RequirementsNotSet));
  let err = repository.refresh_if_no_cache().await.unwrap_err();
  assert!(matches!(err, TellerError::RequirementsNotSet));

  assert!(repository.current_state().is_none());
  assert_eq!(backend.fetches(), 0);
}

#[tokio::test]
async fn test_concurrent_refreshes_fetch_once() {
  let (source, backend) = FakeSource::gated();
  let (repository, _sync_state) = repository(source.manual());
  repository.set_requirements(Some(User("alice"))).unwrap();

  let release = async {
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    backend.release();
  };
  let (first, second, ()) = tokio::join!(repository.refresh(true), repository.refresh(true), release);

  assert!(first.unwrap().is_successful());
  assert!(second.unwrap().is_successful());
  assert_eq!(backend.fetches(), 1);
}

#[tokio::test]
async fn test_changing_requirements_cancels_refresh() {
  let (source, backend) = FakeSource::gated();
  let (repository, sync_state) = repository(source.manual());
  let repository = Arc::new(repository);
  let mut states = repository.observe();

  repository.set_requirements(Some(User("alice"))).unwrap();
  let pending = tokio::spawn({
    let repository = Arc::clone(&repository);
    async move { repository.refresh(false).await }
  });
  wait_for(&mut states, |s| s.is_fetching_first_cache()).await;

  repository.set_requirements(Some(User("bob"))).unwrap();
  let result = pending.await.unwrap().unwrap();
  assert!(result.is_skipped(SkippedReason::Cancelled));

  let state = next(&mut states).await;
  assert_eq!(state.status(), CacheStatus::NoCache);
  assert!(!state.is_refreshing());

  backend.release();
  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert!(!sync_state.has_ever_fetched_data("repos for alice").unwrap());
  assert_eq!(repository.requirements().map(|r| r.0), Some("bob"));
}

#[tokio::test]
async fn test_clearing_requirements_is_not_observed() {
  let (source, _backend) = FakeSource::new();
  let (repository, _sync_state) = seeded(source, Duration::minutes(5));
  let mut states = repository.observe();

  repository.set_requirements(Some(User("alice"))).unwrap();
  wait_for(&mut states, |s| s.cache().is_some()).await;

  repository.set_requirements(None).unwrap();
  assert!(repository.current_state().is_none());
  assert!(repository.requirements().is_none());

  repository.set_requirements(Some(User("alice"))).unwrap();
  let state = next(&mut states).await;
  assert!(!state.is_none());
  assert_eq!(state.status(), CacheStatus::CacheExists);
  assert!(state.cache().is_none());
}

#[tokio::test]
async fn test_dropping_repository_ends_streams() {
  let (source, _backend) = FakeSource::new();
  let (repository, _sync_state) = seeded(source, Duration::minutes(5));
  let mut first = repository.observe();
  let mut second = repository.observe();

  repository.set_requirements(Some(User("alice"))).unwrap();
  wait_for(&mut first, |s| s.cache().is_some()).await;
  drop(repository);

  for states in [&mut first, &mut second] {
    let drained = tokio::time::timeout(StdDuration::from_secs(2), async {
      while states.next().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok());
  }
}

#[tokio::test]
async fn test_observers_see_the_same_snapshots() {
  let (source, _backend) = FakeSource::new();
  let (repository, _sync_state) = repository(source);
  let mut first = repository.observe();
  let mut second = repository.observe();

  repository.set_requirements(Some(User("alice"))).unwrap();

  for _ in 0..4 {
    let (a, b) = (next(&mut first).await, next(&mut second).await);
    assert_eq!(a.status(), b.status());
    assert_eq!(a.is_refreshing(), b.is_refreshing());
    assert_eq!(a.cache(), b.cache());
  }
}

#[tokio::test]
async fn test_refresh_if_no_cache() {
  let (source, backend) = FakeSource::new();
  let (repository, _sync_state) = seeded(source.clone().manual(), Duration::days(2));
  repository.set_requirements(Some(User("alice"))).unwrap();
  assert!(repository.refresh_if_no_cache().await.unwrap().is_successful());
  assert_eq!(backend.fetches(), 0);

  let (repository, _sync_state) = self::repository(source.manual());
  repository.set_requirements(Some(User("bob"))).unwrap();
  assert!(repository.refresh_if_no_cache().await.unwrap().is_successful());
  assert_eq!(backend.fetches(), 1);
}

#[tokio::test]
async fn test_repositories_share_a_refresh() {
  let (source, backend) = FakeSource::gated();
  let sync_state = Arc::new(InMemorySyncStateManager::new());
  let managers = Arc::new(RefreshManagers::new(tokio::runtime::Handle::current()));
  let first = Repository::with_refresh_managers(
    source.clone().manual(),
    sync_state.clone(),
    Arc::clone(&managers),
    Executors::current(),
  );
  let second = Repository::with_refresh_managers(
    source.manual(),
    sync_state.clone(),
    Arc::clone(&managers),
    Executors::current(),
  );
  let mut second_states = second.observe();

  first.set_requirements(Some(User("alice"))).unwrap();
  second.set_requirements(Some(User("alice"))).unwrap();

  let release = async {
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    backend.release();
  };
  let (a, b, ()) = tokio::join!(first.refresh(false), second.refresh(false), release);

  assert!(a.unwrap().is_successful());
  assert!(b.unwrap().is_successful());
  assert_eq!(backend.fetches(), 1);

  let state = wait_for(&mut second_states, |s| s.cache().is_some()).await;
  assert_eq!(state.cache(), Some(&repos(&["alice/dotfiles"])));
  assert!(first.current_state().cache_exists());
}

#[tokio::test]
async fn test_panicking_save_fails_the_refresh() {
  let (source, backend) = FakeSource::new();
  backend.panic_save.store(true, Ordering::SeqCst);
  let (repository, sync_state) = repository(source.manual());
  let mut states = repository.observe();

  repository.set_requirements(Some(User("alice"))).unwrap();
  let result = repository.refresh(false).await.unwrap();
  assert_eq!(result.error().map(|e| e.0), Some("save task failed"));

  let state = wait_for(&mut states, |s| s.refresh_error().is_some()).await;
  assert_eq!(state.status(), CacheStatus::NoCache);
  assert!(!state.is_refreshing());
  assert!(!sync_state.has_ever_fetched_data("repos for alice").unwrap());

  // Nothing is left stuck in flight
  backend.panic_save.store(false, Ordering::SeqCst);
  assert!(repository.refresh(false).await.unwrap().is_successful());
  assert_eq!(backend.fetches(), 2);
}

#[tokio::test]
async fn test_save_finishing_after_requirements_change_records_age() {
  let (source, backend) = FakeSource::new();
  let release = backend.hold_saves();
  let (repository, sync_state) = repository(source.manual());
  let repository = Arc::new(repository);

  repository.set_requirements(Some(User("alice"))).unwrap();
  let pending = tokio::spawn({
    let repository = Arc::clone(&repository);
    async move { repository.refresh(false).await }
  });
  until(&backend.saving).await;

  // Too late to cancel, the fetch is already being saved
  repository.set_requirements(Some(User("bob"))).unwrap();
  release.send(()).unwrap();
  assert!(pending.await.unwrap().unwrap().is_successful());

  assert!(sync_state.has_ever_fetched_data("repos for alice").unwrap());
  let state = repository.current_state();
  assert_eq!(state.status(), CacheStatus::NoCache);
  assert!(!state.is_refreshing());

  repository.set_requirements(Some(User("alice"))).unwrap();
  assert_eq!(repository.current_state().status(), CacheStatus::CacheExists);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requirements_changing_as_refresh_starts_skips_it() {
  let (source, backend) = FakeSource::new();
  let release = backend.hold_fetch_requests();
  let (repository, sync_state) = repository(source.manual());
  let repository = Arc::new(repository);

  repository.set_requirements(Some(User("alice"))).unwrap();
  let pending = tokio::spawn({
    let repository = Arc::clone(&repository);
    async move { repository.refresh(false).await }
  });
  until(&backend.fetch_requested).await;

  repository.set_requirements(Some(User("bob"))).unwrap();
  release.send(()).unwrap();
  let result = pending.await.unwrap().unwrap();
  assert!(result.is_skipped(SkippedReason::Cancelled));

  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert_eq!(backend.fetches(), 0);
  assert!(!sync_state.has_ever_fetched_data("repos for alice").unwrap());
  assert!(!repository.current_state().is_refreshing());
}

#[tokio::test]
async fn test_cancel_from_one_repository_releases_the_others() {
  let (source, backend) = FakeSource::gated();
  let sync_state = Arc::new(InMemorySyncStateManager::new());
  testing::seed_cache(
    &source,
    sync_state.as_ref(),
    &User("alice"),
    &repos(&["alice/old"]),
    Utc::now() - Duration::days(2),
  )
  .unwrap();
  let managers = Arc::new(RefreshManagers::new(Handle::current()));
  let first = shared(source.clone().manual(), &sync_state, &managers);
  let second = Arc::new(shared(source.manual(), &sync_state, &managers));

  first.set_requirements(Some(User("alice"))).unwrap();
  second.set_requirements(Some(User("alice"))).unwrap();
  let mut second_states = second.observe();

  let pending = tokio::spawn({
    let second = Arc::clone(&second);
    async move { second.refresh(true).await }
  });
  wait_for(&mut second_states, |s| s.is_fetching_fresh_cache()).await;
  assert!(first.current_state().is_refreshing());

  // Leaving the tag cancels the fetch both repositories were waiting on
  first.set_requirements(Some(User("bob"))).unwrap();
  let result = pending.await.unwrap().unwrap();
  assert!(result.is_skipped(SkippedReason::Cancelled));

  let state = wait_for(&mut second_states, |s| !s.is_refreshing()).await;
  assert_eq!(state.status(), CacheStatus::CacheExists);
  assert!(!second.current_state().is_refreshing());

  backend.release();
  assert!(second.refresh(true).await.unwrap().is_successful());
  let state = wait_for(&mut second_states, |s| s.cache() == Some(&repos(&["alice/dotfiles"]))).await;
  assert!(!state.is_refreshing());
}

#[tokio::test]
async fn test_slow_observer_sees_every_snapshot() {
  let (source, backend) = FakeSource::new();
  backend.respond(Err(FakeError("offline")));
  let (repository, _sync_state) = repository(source.manual());
  let states = repository.observe();

  // No cache, fetching, failed
  repository.set_requirements(Some(User("alice"))).unwrap();
  assert!(repository.refresh(false).await.unwrap().error().is_some());
  // Starting over publishes a fresh no-cache snapshot each time
  for _ in 0..70 {
    repository.set_requirements(Some(User("alice"))).unwrap();
  }
  drop(repository);

  let snapshots: Vec<State> = tokio::time::timeout(StdDuration::from_secs(2), states.collect::<Vec<_>>())
    .await
    .unwrap();
  assert_eq!(snapshots.len(), 73);
  assert_eq!(snapshots.iter().filter(|s| s.refresh_error().is_some()).count(), 1);
  assert!(snapshots[1].is_fetching_first_cache());
}

#[tokio::test]
async fn test_dropping_repository_cancels_its_refresh() {
  let (source, backend) = FakeSource::gated();
  let sync_state = Arc::new(InMemorySyncStateManager::new());
  let managers = Arc::new(RefreshManagers::new(Handle::current()));
  let repository = shared(source, &sync_state, &managers);
  let mut states = repository.observe();

  repository.set_requirements(Some(User("alice"))).unwrap();
  wait_for(&mut states, |s| s.is_fetching_first_cache()).await;
  // Join the running fetch to see how it ends
  let pending = managers
    .manager("repos for alice")
    .refresh(async { Ok::<Repos, FakeError>(Vec::new()) });

  drop(repository);
  assert!(pending.await.is_skipped(SkippedReason::Cancelled));

  backend.release();
  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert!(!sync_state.has_ever_fetched_data("repos for alice").unwrap());
  assert!(backend.store.lock().unwrap().is_empty());

  let rest: Vec<State> = tokio::time::timeout(StdDuration::from_secs(2), states.collect::<Vec<_>>())
    .await
    .unwrap();
  assert!(rest.is_empty());
}

#[tokio::test]
async fn test_observing_a_cache_that_became_too_old_refreshes() {
  let (source, backend) = FakeSource::new();
  let (repository, sync_state) = seeded(source, Duration::minutes(5));
  repository.set_requirements(Some(User("alice"))).unwrap();
  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert_eq!(backend.fetches(), 0);

  // An hour and more passes
  sync_state
    .update_age_of_data("repos for alice", Utc::now() - Duration::hours(2))
    .unwrap();
  let mut states = repository.observe();

  let state = wait_for(&mut states, |s| s.just_finished_successful_refresh()).await;
  assert!(state.cache_age() > Some(Utc::now() - Duration::minutes(1)));
  assert_eq!(backend.fetches(), 1);
}
