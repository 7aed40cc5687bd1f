//! Single-flight refresh coordination with cancellation.

mod manager;
mod registry;

pub use manager::{
  FetchOutcome, RefreshManager, RefreshManagerDelegate, RefreshResult, SharedRefresh, SkippedReason,
};
pub use registry::RefreshManagers;
