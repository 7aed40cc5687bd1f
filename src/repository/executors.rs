//! Execution contexts a repository runs its work on.

use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::JoinError;

/// Where a repository runs its asynchronous work.
///
/// `background` runs fetches, saves and hooks; `read` runs cache
/// observation, for stores that require reads on a particular runtime.
/// Work on the background side finishes before its result is handed to the
/// read side.
#[derive(Debug, Clone)]
pub struct Executors {
  background: Handle,
  read: Handle,
}

impl Executors {
  pub fn new(background: Handle, read: Handle) -> Self {
    Self { background, read }
  }

  /// Use the current runtime for both contexts.
  ///
  /// # Panics
  /// Panics when called outside a tokio runtime, like [`Handle::current`].
  pub fn current() -> Self {
    let handle = Handle::current();
    Self::new(handle.clone(), handle)
  }

  pub fn try_current() -> Result<Self, TryCurrentError> {
    let handle = Handle::try_current()?;
    Ok(Self::new(handle.clone(), handle))
  }

  pub fn background(&self) -> &Handle {
    &self.background
  }

  pub fn read(&self) -> &Handle {
    &self.read
  }

  /// Run blocking work (saving, trimming) on the background context.
  pub(crate) async fn run_background<F, R>(&self, work: F) -> Result<R, JoinError>
  where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
  {
    self.background.spawn_blocking(work).await
  }
}
