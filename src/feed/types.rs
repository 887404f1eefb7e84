use serde::{Deserialize, Serialize};

/// Format advertised by a configured source.
///
/// Only [`SourceType::Rss`] is fetched; the other variants are accepted in
/// configuration so existing files keep loading, and are skipped at batch
/// start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Rss,
    Atom,
    Json,
    Html,
}

/// A feed subscription as read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Source {
    /// Label used for logging and as the collection key fallback.
    pub name: String,
    /// URL of the feed document.
    pub url: String,
    #[serde(rename = "type", default)]
    pub kind: SourceType,
}

impl Source {
    pub fn rss(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            kind: SourceType::Rss,
        }
    }
}

/// A parsed `<rss>` document.
///
/// Every text field defaults to empty so sparse feeds still map. Only the
/// `<channel>` element itself is mandatory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedDocument {
    /// The `version` attribute of the root element (`2.0`, `0.91`, ...).
    pub version: String,
    pub channel: Channel,
}

impl FeedDocument {
    pub fn title(&self) -> &str {
        &self.channel.title
    }

    pub fn items(&self) -> &[FeedItem] {
        &self.channel.items
    }

    /// Consumes the document, yielding its items in document order.
    pub fn into_items(self) -> Vec<FeedItem> {
        self.channel.items
    }
}

/// `<channel>` metadata plus the ordered `<item>` list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Channel {
    pub title: String,
    pub link: String,
    pub description: String,
    pub language: String,
    pub copyright: String,
    pub image: Option<ChannelImage>,
    pub items: Vec<FeedItem>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelImage {
    pub title: String,
    pub url: String,
    pub link: String,
}

/// One `<item>` of a feed.
///
/// `published_at` keeps the raw `<pubDate>` text; feeds disagree on date
/// formats and consumers of the JSON output parse it themselves. The serde
/// shape is the persisted JSON one, not the XML one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FeedItem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "publishedAt", default)]
    pub published_at: String,
}
