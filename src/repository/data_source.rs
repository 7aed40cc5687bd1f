//! Collaborator traits an application implements to plug into a repository.

use chrono::Duration;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::task::JoinError;

/// Identifies one cache instance, e.g. "repos for user alice".
///
/// Two requirements with the same tag are the same cache for staleness and
/// single-flight purposes. Nothing else about the value is compared.
pub trait Requirements: Clone + Send + Sync + 'static {
  fn tag(&self) -> String;
}

/// Where a repository fetches, saves and observes its cache.
///
/// The repository never touches the network or the disk itself: it decides
/// when to call these methods and reports what happened as
/// [`CacheState`](crate::state::CacheState) snapshots.
pub trait DataSource: Send + Sync + 'static {
  type Requirements: Requirements;
  /// What a fetch returns, before it is saved.
  type FetchResult: Send + Sync + 'static;
  /// What observing the saved cache yields.
  type Cache: Clone + Send + Sync + 'static;
  /// Failure of a fetch or of a save. A save that panics is reported
  /// through the `JoinError` conversion.
  type Error: std::error::Error + From<JoinError> + Send + Sync + 'static;

  /// Cache older than this is refreshed automatically.
  fn max_age_of_cache(&self) -> Duration;

  /// Whether the repository may fetch on its own when requirements are set,
  /// when observed, or when the cache becomes too old.
  fn automatically_refresh(&self) -> bool {
    true
  }

  /// Fetch fresh data.
  ///
  /// The returned future must not start any work before it is first polled:
  /// when a fetch for the same tag is already running, the future is dropped
  /// without being polled.
  fn fetch_fresh_cache(
    &self,
    requirements: &Self::Requirements,
  ) -> BoxFuture<'static, Result<Self::FetchResult, Self::Error>>;

  /// Persist a successful fetch. Runs on the background executor.
  fn save_cache(
    &self,
    fetched: &Self::FetchResult,
    requirements: &Self::Requirements,
  ) -> Result<(), Self::Error>;

  /// Stream of the saved cache, emitting the current value and then every
  /// change. Polled on the read executor.
  fn observe_cache(&self, requirements: &Self::Requirements) -> BoxStream<'static, Self::Cache>;

  fn is_cache_empty(&self, cache: &Self::Cache, requirements: &Self::Requirements) -> bool;
}
