//! Concurrent RSS fetcher that merges many feeds into one JSON document.

pub mod config;
pub mod feed;
pub mod storage;
