//! Extension points used to specialize a repository.

use super::data_source::DataSource;

/// Decisions and side effects a specialized repository can override.
///
/// Hooks that touch storage run on the background executor.
pub trait RepositoryHooks<D: DataSource>: Send + Sync + 'static {
  /// Whether a non-forced refresh should fetch. `too_old` is the sync state's
  /// verdict for the current tag.
  fn needs_a_refresh(&self, _data_source: &D, _requirements: &D::Requirements, too_old: bool) -> bool {
    too_old
  }

  /// Runs before every refresh request, before staleness is checked.
  fn before_refresh(&self, _data_source: &D, _requirements: &D::Requirements, _force: bool) {}

  /// Runs every time observation of the cache (re)starts.
  fn before_observe(&self, _data_source: &D, _requirements: &D::Requirements) {}
}

/// Plain staleness policy with no side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl<D: DataSource> RepositoryHooks<D> for DefaultHooks {}
