pub mod api;
pub mod client;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod params;
pub mod rate_limit;

pub use crate::fetcher::{Enrichment, GitFetcher};
pub use crate::params::FetcherConfig;
