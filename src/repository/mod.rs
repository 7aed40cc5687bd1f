//! Repository orchestration: requirements in, cache lifecycle snapshots out.

mod data_source;
mod executors;
mod hooks;
#[allow(clippy::module_inception)]
mod repository;

pub use data_source::{DataSource, Requirements};
pub use executors::Executors;
pub use hooks::{DefaultHooks, RepositoryHooks};
pub use repository::{Repository, RepositoryState};

#[cfg(test)]
mod tests;
