//! Git repository fetching.

mod fetcher;

pub use fetcher::GitFetcher;
