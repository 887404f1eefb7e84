use std::io::{BufRead, BufReader};

use anyhow::Result;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use thiserror::Error;

use super::charset::{strip_bom, Charset, Latin1Reader};
use super::types::{Channel, ChannelImage, FeedDocument, FeedItem};

/// Errors produced while turning a payload into a [`FeedDocument`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not well-formed XML.
    #[error("Malformed XML: {0}")]
    MalformedXml(String),
    /// Well-formed XML that is not an `rss > channel` document.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
}

/// Decodes a raw feed payload.
///
/// The declared encoding is sniffed first; Latin-1 payloads are streamed
/// through [`Latin1Reader`] so the XML reader only ever sees UTF-8. Pure:
/// no I/O beyond the in-memory slice and no shared state.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedDocument, DecodeError> {
    let bytes = strip_bom(bytes);
    match Charset::sniff(bytes) {
        Charset::Latin1 => parse_document(BufReader::new(Latin1Reader::new(bytes))),
        Charset::PassThrough => parse_document(bytes),
    }
}

/// Which text field, if any, character data is currently flowing into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    ChannelTitle,
    ChannelLink,
    ChannelDescription,
    ChannelLanguage,
    ChannelCopyright,
    ImageTitle,
    ImageUrl,
    ImageLink,
    ItemTitle,
    ItemLink,
    ItemDescription,
    ItemPubDate,
}

/// Element context derived from the open-element stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Root,
    Channel,
    Item,
    Image,
    /// Inside a captured field or an element we do not map.
    Other,
}

#[derive(Default)]
struct DocumentBuilder {
    version: String,
    channel: Option<Channel>,
    item: Option<FeedItem>,
    image: Option<ChannelImage>,
    capture: Option<(Field, usize)>,
    text: String,
    scopes: Vec<Scope>,
    root_seen: bool,
    schema_error: Option<String>,
}

impl DocumentBuilder {
    fn scope(&self) -> Option<Scope> {
        self.scopes.last().copied()
    }

    fn open(&mut self, e: &BytesStart<'_>, decoder: quick_xml::Decoder) -> Result<(), DecodeError> {
        let name = e.name();
        let name = name.as_ref();
        let depth = self.scopes.len();

        let next = match self.scope() {
            None => {
                if self.root_seen {
                    return Err(DecodeError::MalformedXml(
                        "multiple root elements".to_string(),
                    ));
                }
                self.root_seen = true;
                if name == b"rss" {
                    self.version = root_version(e, decoder)?;
                } else {
                    self.schema_error.get_or_insert_with(|| {
                        format!(
                            "root element is <{}>, expected <rss>",
                            String::from_utf8_lossy(name)
                        )
                    });
                }
                Scope::Root
            }
            Some(Scope::Root) if name == b"channel" && self.channel.is_none() => {
                self.channel = Some(Channel::default());
                Scope::Channel
            }
            Some(Scope::Channel) => match name {
                b"item" => {
                    self.item = Some(FeedItem::default());
                    Scope::Item
                }
                b"image" if self.channel.as_ref().is_some_and(|c| c.image.is_none()) => {
                    self.image = Some(ChannelImage::default());
                    Scope::Image
                }
                b"title" => self.begin(Field::ChannelTitle, depth),
                b"link" => self.begin(Field::ChannelLink, depth),
                b"description" => self.begin(Field::ChannelDescription, depth),
                b"language" => self.begin(Field::ChannelLanguage, depth),
                b"copyright" => self.begin(Field::ChannelCopyright, depth),
                _ => Scope::Other,
            },
            Some(Scope::Item) => match name {
                b"title" => self.begin(Field::ItemTitle, depth),
                b"link" => self.begin(Field::ItemLink, depth),
                b"description" => self.begin(Field::ItemDescription, depth),
                b"pubDate" => self.begin(Field::ItemPubDate, depth),
                _ => Scope::Other,
            },
            Some(Scope::Image) => match name {
                b"title" => self.begin(Field::ImageTitle, depth),
                b"url" => self.begin(Field::ImageUrl, depth),
                b"link" => self.begin(Field::ImageLink, depth),
                _ => Scope::Other,
            },
            Some(Scope::Root) | Some(Scope::Other) => Scope::Other,
        };
        self.scopes.push(next);
        Ok(())
    }

    fn begin(&mut self, field: Field, depth: usize) -> Scope {
        self.capture = Some((field, depth));
        self.text.clear();
        Scope::Other
    }

    fn close(&mut self) -> Result<(), DecodeError> {
        let scope = self
            .scopes
            .pop()
            .ok_or_else(|| DecodeError::MalformedXml("unexpected end tag".to_string()))?;
        let depth = self.scopes.len();

        if let Some((field, at)) = self.capture {
            if at == depth {
                self.capture = None;
                let value = self.text.trim().to_string();
                self.store(field, value);
            }
            return Ok(());
        }

        match scope {
            Scope::Item => {
                if let (Some(item), Some(channel)) = (self.item.take(), self.channel.as_mut()) {
                    channel.items.push(item);
                }
            }
            Scope::Image => {
                if let (Some(image), Some(channel)) = (self.image.take(), self.channel.as_mut()) {
                    channel.image = Some(image);
                }
            }
            Scope::Root | Scope::Channel | Scope::Other => {}
        }
        Ok(())
    }

    fn store(&mut self, field: Field, value: String) {
        let slot = match field {
            Field::ItemTitle | Field::ItemLink | Field::ItemDescription | Field::ItemPubDate => {
                let Some(item) = self.item.as_mut() else {
                    return;
                };
                match field {
                    Field::ItemTitle => &mut item.title,
                    Field::ItemLink => &mut item.link,
                    Field::ItemDescription => &mut item.description,
                    _ => &mut item.published_at,
                }
            }
            Field::ImageTitle | Field::ImageUrl | Field::ImageLink => {
                let Some(image) = self.image.as_mut() else {
                    return;
                };
                match field {
                    Field::ImageTitle => &mut image.title,
                    Field::ImageUrl => &mut image.url,
                    _ => &mut image.link,
                }
            }
            _ => {
                let Some(channel) = self.channel.as_mut() else {
                    return;
                };
                match field {
                    Field::ChannelTitle => &mut channel.title,
                    Field::ChannelLink => &mut channel.link,
                    Field::ChannelDescription => &mut channel.description,
                    Field::ChannelLanguage => &mut channel.language,
                    _ => &mut channel.copyright,
                }
            }
        };
        *slot = value;
    }

    fn push_text(&mut self, text: &str) {
        if self.capture.is_some() {
            self.text.push_str(text);
        }
    }

    fn finish(self) -> Result<FeedDocument, DecodeError> {
        if !self.root_seen {
            return Err(DecodeError::MalformedXml("no root element".to_string()));
        }
        if !self.scopes.is_empty() {
            return Err(DecodeError::MalformedXml(format!(
                "unexpected end of document with {} unclosed element(s)",
                self.scopes.len()
            )));
        }
        if let Some(reason) = self.schema_error {
            return Err(DecodeError::SchemaMismatch(reason));
        }
        let channel = self.channel.ok_or_else(|| {
            DecodeError::SchemaMismatch("missing <channel> element".to_string())
        })?;
        Ok(FeedDocument {
            version: self.version,
            channel,
        })
    }
}

fn root_version(e: &BytesStart<'_>, decoder: quick_xml::Decoder) -> Result<String, DecodeError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| DecodeError::MalformedXml(e.to_string()))?;
        if attr.key.as_ref() == b"version" {
            let value = attr
                .decode_and_unescape_value(decoder)
                .map_err(|e| DecodeError::MalformedXml(e.to_string()))?;
            return Ok(value.into_owned());
        }
    }
    Ok(String::new())
}

/// Reads the whole document, keeping well-formedness errors separate from
/// structural ones: a schema problem is only reported once the document has
/// been read to the end without a syntax error.
fn parse_document<R: BufRead>(source: R) -> Result<FeedDocument, DecodeError> {
    // Entity declarations are never expanded by this quick-xml version; only
    // the five predefined entities and character references resolve.
    let mut reader = Reader::from_reader(source);
    let mut builder = DocumentBuilder::default();
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| DecodeError::MalformedXml(e.to_string()))?;
        match event {
            Event::Start(e) => builder.open(&e, reader.decoder())?,
            Event::Empty(e) => {
                builder.open(&e, reader.decoder())?;
                builder.close()?;
            }
            Event::End(_) => builder.close()?,
            Event::Text(t) => {
                if builder.capture.is_some() {
                    let text = t
                        .unescape()
                        .map_err(|e| DecodeError::MalformedXml(e.to_string()))?;
                    builder.push_text(&text);
                }
            }
            Event::CData(c) => {
                if builder.capture.is_some() {
                    let text = std::str::from_utf8(&c)
                        .map_err(|e| DecodeError::MalformedXml(e.to_string()))?;
                    builder.push_text(text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    builder.finish()
}

fn is_blank(value: &&str) -> bool {
    value.is_empty()
}

#[derive(Serialize)]
#[serde(rename = "rss")]
struct RssXml<'a> {
    #[serde(rename = "@version")]
    version: &'a str,
    channel: ChannelXml<'a>,
}

#[derive(Serialize)]
struct ChannelXml<'a> {
    title: &'a str,
    link: &'a str,
    description: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    language: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    copyright: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<ImageXml<'a>>,
    #[serde(rename = "item")]
    items: Vec<ItemXml<'a>>,
}

#[derive(Serialize)]
struct ImageXml<'a> {
    title: &'a str,
    url: &'a str,
    link: &'a str,
}

#[derive(Serialize)]
struct ItemXml<'a> {
    title: &'a str,
    link: &'a str,
    description: &'a str,
    #[serde(rename = "pubDate")]
    published_at: &'a str,
}

impl FeedDocument {
    /// Renders the document back to RSS 2.0 XML (UTF-8, no declaration).
    ///
    /// Structure round-trips through [`parse_feed`]; formatting and any
    /// elements this model does not keep are lost.
    pub fn to_xml(&self) -> Result<String> {
        let channel = &self.channel;
        let doc = RssXml {
            version: if self.version.is_empty() {
                "2.0"
            } else {
                &self.version
            },
            channel: ChannelXml {
                title: &channel.title,
                link: &channel.link,
                description: &channel.description,
                language: &channel.language,
                copyright: &channel.copyright,
                image: channel.image.as_ref().map(|image| ImageXml {
                    title: &image.title,
                    url: &image.url,
                    link: &image.link,
                }),
                items: channel
                    .items
                    .iter()
                    .map(|item| ItemXml {
                        title: &item.title,
                        link: &item.link,
                        description: &item.description,
                        published_at: &item.published_at,
                    })
                    .collect(),
            },
        };
        Ok(quick_xml::se::to_string(&doc)?)
    }
}
