//! Feed pipeline: fetching, decoding and aggregating RSS feeds.
//!
//! - [`fetcher`] - size-capped HTTP retrieval bounded by a deadline
//! - [`charset`] - Latin-1 to UTF-8 normalization ahead of parsing
//! - [`parser`] - `rss > channel > item` decoding with `quick-xml`
//! - [`collection`] - single-writer merge of decoded feeds
//! - [`batch`] - concurrent fan-out/fan-in over all configured sources
//!
//! # Example
//!
//! ```ignore
//! use news_catcher::feed::{run_batch, BatchOptions, FeedFetcher, FetcherConfig};
//!
//! let fetcher = FeedFetcher::new(FetcherConfig::default())?;
//! let outcome = run_batch(&fetcher, &config.sources, &BatchOptions::default()).await;
//! let json = outcome.collection.to_json()?;
//! ```

pub mod batch;
pub mod charset;
pub mod collection;
pub mod fetcher;
pub mod parser;
pub mod types;

pub use batch::{run_batch, BatchOptions, BatchOutcome, FailureCause, FetchFailure, Stage};
pub use collection::{FeedCollection, FeedEntry};
pub use fetcher::{FeedFetcher, FetchError, FetcherConfig};
pub use parser::{parse_feed, DecodeError};
pub use types::{Channel, ChannelImage, FeedDocument, FeedItem, Source, SourceType};
