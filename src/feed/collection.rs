//! Merges parsed feeds into one ordered item list.
//!
//! Items of every feed live in a single `Vec`; a side index records which
//! contiguous range belongs to which feed. Appends never touch existing
//! entries, so ranges handed out earlier stay valid.
use serde::Serialize;
use std::collections::BTreeMap;

use super::types::{FeedDocument, FeedItem, Source};

/// Range of [`FeedCollection::items`] contributed by one feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedEntry {
    pub name: String,
    pub start: usize,
    pub count: usize,
}

impl FeedEntry {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.count
    }
}

/// All items of a batch, grouped by feed.
///
/// Mutation goes through `&mut self`, so a collection has one writer at a
/// time by construction. The batch runner owns it inside its single
/// consumer loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedCollection {
    items: Vec<FeedItem>,
    feeds: Vec<FeedEntry>,
}

impl FeedCollection {
    pub fn new() -> Self {
        Self {
            items: Vec::with_capacity(100),
            feeds: Vec::with_capacity(10),
        }
    }

    /// Appends a document's items under its channel title.
    pub fn collect(&mut self, document: FeedDocument) {
        let name = document.title().to_string();
        self.append(name, document.into_items());
    }

    /// Like [`collect`](Self::collect), but falls back to the configured
    /// source name when the channel has no title.
    pub fn collect_from(&mut self, source: &Source, document: FeedDocument) {
        let title = document.title().trim();
        let name = if title.is_empty() {
            source.name.clone()
        } else {
            title.to_string()
        };
        self.append(name, document.into_items());
    }

    fn append(&mut self, name: String, items: Vec<FeedItem>) {
        let start = self.items.len();
        let count = items.len();
        self.items.extend(items);
        self.feeds.push(FeedEntry { name, start, count });
    }

    pub fn items(&self) -> &[FeedItem] {
        &self.items
    }

    /// Index entries in merge order.
    pub fn feeds(&self) -> &[FeedEntry] {
        &self.feeds
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    /// Items of one index entry.
    pub fn feed_items(&self, entry: &FeedEntry) -> &[FeedItem] {
        &self.items[entry.range()]
    }

    /// Maps each feed name to its slice of items.
    ///
    /// When two feeds share a name the one merged last wins; both remain in
    /// [`feeds`](Self::feeds).
    pub fn by_feed(&self) -> BTreeMap<&str, &[FeedItem]> {
        self.feeds
            .iter()
            .map(|entry| (entry.name.as_str(), self.feed_items(entry)))
            .collect()
    }

    /// Pretty-printed JSON of [`by_feed`](Self::by_feed), the persisted shape.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(&self.by_feed())
    }
}
