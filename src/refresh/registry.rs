//! Process-wide lookup of refresh managers by tag.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tracing::trace;

use super::manager::RefreshManager;

/// Hands out one [`RefreshManager`] per tag.
///
/// Repositories that share a `RefreshManagers` share single-flight for equal
/// tags: whichever repository starts a fetch, all of them see the same
/// begin/complete callbacks. Inject a fresh instance per test to keep tests
/// isolated.
pub struct RefreshManagers<T, E> {
  handle: Handle,
  managers: Mutex<HashMap<String, Arc<RefreshManager<T, E>>>>,
}

impl<T, E> RefreshManagers<T, E>
where
  T: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  /// Create an empty registry. Fetch driver tasks run on `handle`.
  pub fn new(handle: Handle) -> Self {
    Self {
      handle,
      managers: Mutex::new(HashMap::new()),
    }
  }

  /// Get the manager for `tag`, creating it if needed.
  pub fn manager(&self, tag: &str) -> Arc<RefreshManager<T, E>> {
    let mut managers = self.managers.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(manager) = managers.get(tag) {
      return Arc::clone(manager);
    }

    // Drop managers nobody holds anymore and that have nothing in flight
    managers.retain(|tag, manager| {
      let keep = Arc::strong_count(manager) > 1 || manager.is_refreshing();
      if !keep {
        trace!(tag = %tag, "dropping idle refresh manager");
      }
      keep
    });

    let manager = Arc::new(RefreshManager::new(tag, self.handle.clone()));
    managers.insert(tag.to_string(), Arc::clone(&manager));
    manager
  }

  /// Number of managers currently registered.
  pub fn len(&self) -> usize {
    self.managers.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
