//! Single-flight refresh coordination for one tag.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Outcome of a fetch as handed to delegates. Both sides are shared so every
/// delegate receives the same value.
pub type FetchOutcome<T, E> = Result<Arc<T>, Arc<E>>;

/// Why a refresh did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkippedReason {
  /// The cache is younger than the data source's max age.
  DataNotTooOld,
  /// The refresh was cancelled before it completed.
  Cancelled,
}

/// Result of asking for a refresh.
#[derive(Debug)]
pub enum RefreshResult<E> {
  Successful,
  FailedError(Arc<E>),
  Skipped(SkippedReason),
}

impl<E> RefreshResult<E> {
  pub fn is_successful(&self) -> bool {
    matches!(self, RefreshResult::Successful)
  }

  pub fn is_skipped(&self, reason: SkippedReason) -> bool {
    matches!(self, RefreshResult::Skipped(r) if *r == reason)
  }

  pub fn error(&self) -> Option<&Arc<E>> {
    match self {
      RefreshResult::FailedError(e) => Some(e),
      _ => None,
    }
  }
}

impl<E> Clone for RefreshResult<E> {
  fn clone(&self) -> Self {
    match self {
      RefreshResult::Successful => RefreshResult::Successful,
      RefreshResult::FailedError(e) => RefreshResult::FailedError(Arc::clone(e)),
      RefreshResult::Skipped(reason) => RefreshResult::Skipped(*reason),
    }
  }
}

/// Replayable handle to the result of the in-flight refresh.
pub type SharedRefresh<E> = Shared<BoxFuture<'static, RefreshResult<E>>>;

/// Receives the lifecycle of every fetch a [`RefreshManager`] runs.
///
/// Every delegate that receives `refresh_begin` for a fetch later receives
/// exactly one of `refresh_complete` or `refresh_cancelled` for it. Begin and
/// complete come from the manager's driver task; cancellation comes from
/// whoever cancelled. A delegate removed before the cancel is not told.
pub trait RefreshManagerDelegate<T, E>: Send + Sync {
  fn refresh_begin(&self, tag: &str);

  /// The fetch announced by `refresh_begin` was cancelled and will never
  /// complete.
  fn refresh_cancelled(&self, tag: &str);

  /// The returned future is awaited before waiters see the result, so work
  /// done here (saving the fetched data) is finished when `refresh` resolves.
  /// An error returned here turns a successful fetch into a failed refresh
  /// for every waiter.
  fn refresh_complete<'a>(
    &'a self,
    tag: &'a str,
    outcome: FetchOutcome<T, E>,
  ) -> BoxFuture<'a, Result<(), Arc<E>>>;
}

type Delegates<T, E> = Vec<Weak<dyn RefreshManagerDelegate<T, E>>>;

struct InFlight<T, E> {
  id: u64,
  result: SharedRefresh<E>,
  driver: JoinHandle<()>,
  /// Delegates that were told `refresh_begin` for this fetch
  begun: Delegates<T, E>,
  /// Set once the fetch finished and delegates are being told. From then on
  /// the real result wins over any cancel.
  completing: bool,
}

/// Runs at most one fetch at a time and shares its result with every caller.
pub struct RefreshManager<T, E> {
  tag: String,
  handle: Handle,
  in_flight: Mutex<Option<InFlight<T, E>>>,
  delegates: Mutex<Delegates<T, E>>,
  next_id: AtomicU64,
}

impl<T, E> RefreshManager<T, E>
where
  T: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  /// Create a manager for `tag` whose driver tasks run on `handle`.
  pub fn new(tag: impl Into<String>, handle: Handle) -> Self {
    Self {
      tag: tag.into(),
      handle,
      in_flight: Mutex::new(None),
      delegates: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(0),
    }
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn is_refreshing(&self) -> bool {
    self.lock_in_flight().is_some()
  }

  pub fn add_delegate(&self, delegate: Weak<dyn RefreshManagerDelegate<T, E>>) {
    let mut delegates = self.lock_delegates();
    delegates.retain(|d| d.strong_count() > 0 && !d.ptr_eq(&delegate));
    delegates.push(delegate);
  }

  /// Stop calling `delegate`, including for the fetch in flight.
  pub fn remove_delegate(&self, delegate: &Weak<dyn RefreshManagerDelegate<T, E>>) {
    self
      .lock_delegates()
      .retain(|d| d.strong_count() > 0 && !d.ptr_eq(delegate));
    if let Some(current) = self.lock_in_flight().as_mut() {
      current.begun.retain(|d| !d.ptr_eq(delegate));
    }
  }

  pub fn delegate_count(&self) -> usize {
    self
      .lock_delegates()
      .iter()
      .filter(|d| d.strong_count() > 0)
      .count()
  }

  /// Join the in-flight fetch, or start `task` if nothing is running.
  ///
  /// When a fetch is already running, `task` is dropped without ever being
  /// polled and the caller shares the running fetch's result.
  pub fn refresh<F>(self: &Arc<Self>, task: F) -> SharedRefresh<E>
  where
    F: Future<Output = Result<T, E>> + Send + 'static,
  {
    let mut in_flight = self.lock_in_flight();
    if let Some(current) = in_flight.as_ref() {
      trace!(tag = %self.tag, id = current.id, "joining in-flight refresh");
      return current.result.clone();
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();
    // A dropped sender means the driver was cancelled
    let result = rx
      .map(|received| received.unwrap_or(RefreshResult::Skipped(SkippedReason::Cancelled)))
      .boxed()
      .shared();
    let driver = self
      .handle
      .spawn(Self::drive(Arc::downgrade(self), id, task, tx));

    debug!(tag = %self.tag, id, "starting refresh");
    *in_flight = Some(InFlight {
      id,
      result: result.clone(),
      driver,
      begun: Vec::new(),
      completing: false,
    });

    result
  }

  /// Cancel the in-flight fetch, if any.
  ///
  /// Waiters resolve with `Skipped(Cancelled)` and every delegate that was
  /// told the fetch began gets `refresh_cancelled`. Has no effect once the
  /// fetch has completed and its result is being delivered.
  ///
  /// Must not be called while holding a lock that `refresh_cancelled` takes.
  pub fn cancel_refresh(&self) {
    let cancelled = {
      let mut in_flight = self.lock_in_flight();
      let completing = match in_flight.as_ref() {
        Some(current) => current.completing,
        None => return,
      };
      if completing {
        trace!(tag = %self.tag, "refresh already completing, not cancelled");
        return;
      }
      in_flight.take()
    };
    let Some(current) = cancelled else {
      return;
    };
    current.driver.abort();
    debug!(tag = %self.tag, id = current.id, "cancelled refresh");
    for delegate in current.begun.iter().filter_map(Weak::upgrade) {
      delegate.refresh_cancelled(&self.tag);
    }
  }

  async fn drive<F>(
    manager: Weak<Self>,
    id: u64,
    task: F,
    tx: oneshot::Sender<RefreshResult<E>>,
  ) where
    F: Future<Output = Result<T, E>> + Send + 'static,
  {
    let Some(this) = manager.upgrade() else {
      return;
    };
    for delegate in this.live_delegates() {
      if !this.is_current(id) {
        break;
      }
      delegate.refresh_begin(&this.tag);
      if !this.record_begun(id, &delegate) {
        // Cancelled between the check and the callback
        delegate.refresh_cancelled(&this.tag);
        break;
      }
    }
    // Only a weak reference is held while fetching, so dropping the manager
    // cancels the fetch.
    drop(this);

    let outcome: FetchOutcome<T, E> = task.await.map(Arc::new).map_err(Arc::new);

    let Some(this) = manager.upgrade() else {
      return;
    };
    if !this.begin_completion(id) {
      trace!(tag = %this.tag, id, "refresh result discarded after cancel");
      return;
    }

    let mut result = match &outcome {
      Ok(_) => RefreshResult::Successful,
      Err(e) => RefreshResult::FailedError(Arc::clone(e)),
    };
    for delegate in this.live_delegates() {
      if let Err(e) = delegate.refresh_complete(&this.tag, outcome.clone()).await {
        result = RefreshResult::FailedError(e);
      }
    }
    this.finish(id);
    debug!(tag = %this.tag, id, successful = result.is_successful(), "refresh finished");
    // Waiters may all be gone
    let _ = tx.send(result);
  }

  fn is_current(&self, id: u64) -> bool {
    self
      .lock_in_flight()
      .as_ref()
      .is_some_and(|current| current.id == id && !current.completing)
  }

  fn record_begun(&self, id: u64, delegate: &Arc<dyn RefreshManagerDelegate<T, E>>) -> bool {
    match self.lock_in_flight().as_mut() {
      Some(current) if current.id == id && !current.completing => {
        current.begun.push(Arc::downgrade(delegate));
        true
      }
      _ => false,
    }
  }

  fn begin_completion(&self, id: u64) -> bool {
    match self.lock_in_flight().as_mut() {
      Some(current) if current.id == id => {
        current.completing = true;
        true
      }
      _ => false,
    }
  }

  fn finish(&self, id: u64) {
    let mut in_flight = self.lock_in_flight();
    if in_flight.as_ref().is_some_and(|current| current.id == id) {
      *in_flight = None;
    }
  }

  fn live_delegates(&self) -> Vec<Arc<dyn RefreshManagerDelegate<T, E>>> {
    let mut delegates = self.lock_delegates();
    delegates.retain(|d| d.strong_count() > 0);
    delegates.iter().filter_map(Weak::upgrade).collect()
  }
}

impl<T, E> RefreshManager<T, E> {
  fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight<T, E>>> {
    self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_delegates(&self) -> MutexGuard<'_, Vec<Weak<dyn RefreshManagerDelegate<T, E>>>> {
    self.delegates.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl<T, E> Drop for RefreshManager<T, E> {
  fn drop(&mut self) {
    if let Some(current) = self.lock_in_flight().take() {
      current.driver.abort();
      debug!(tag = %self.tag, id = current.id, "refresh manager dropped, refresh cancelled");
    }
  }
}
