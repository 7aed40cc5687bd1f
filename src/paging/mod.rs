//! Paged caches: a repository whose cache grows one page at a time.

mod adapter;
mod data_source;
mod repository;

pub use adapter::{PageFetch, PagedRequirements, PagingAdapter, PagingHooks};
pub use data_source::{PagedFetchResponse, PagingDataSource};
pub use repository::{PagingRefreshManagers, PagingRepository, PagingRepositoryState};
