//! Legacy charset normalization for feed payloads.
//!
//! The XML parser only understands UTF-8. Feeds that declare a single-byte
//! Latin-1 encoding are rewritten on the fly by [`Latin1Reader`], which maps
//! every byte to the code point of the same value. Anything else is handed
//! to the parser untouched.
use std::io::{self, Read};

/// Chunk size used when pulling bytes from the underlying reader.
const CHUNK_SIZE: usize = 4096;

/// How far into the payload the XML declaration is searched for.
const DECLARATION_SCAN_LIMIT: usize = 512;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Character encoding declared by a document, as far as decoding cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    /// UTF-8, ASCII, an unknown label, or no declaration at all.
    PassThrough,
    /// ISO-8859-1 under any of its common labels.
    Latin1,
}

impl Charset {
    /// Maps an `encoding="..."` label to a [`Charset`].
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "iso-8859-1" | "iso8859-1" | "iso_8859-1" | "latin1" | "latin-1" => Self::Latin1,
            _ => Self::PassThrough,
        }
    }

    /// Inspects the XML declaration at the start of `bytes`.
    pub fn sniff(bytes: &[u8]) -> Self {
        declared_encoding(bytes)
            .map(Self::from_label)
            .unwrap_or(Self::PassThrough)
    }
}

/// Removes a leading UTF-8 byte order mark, if any.
pub fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
}

/// Returns the `encoding` pseudo-attribute of the leading `<?xml ... ?>`
/// declaration.
///
/// The declaration is ASCII by definition, so this works on raw bytes
/// regardless of the encoding it announces.
fn declared_encoding(bytes: &[u8]) -> Option<&str> {
    let bytes = strip_bom(bytes);
    let head = &bytes[..bytes.len().min(DECLARATION_SCAN_LIMIT)];
    let head = trim_ascii_start(head);
    if !head.starts_with(b"<?xml") {
        return None;
    }
    let end = find(head, b"?>")?;
    let decl = std::str::from_utf8(&head[..end]).ok()?;

    let after_key = &decl[decl.find("encoding")? + "encoding".len()..];
    let after_eq = after_key.trim_start().strip_prefix('=')?.trim_start();
    let quote = after_eq.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &after_eq[1..];
    let close = value.find(quote)?;
    Some(&value[..close])
}

fn trim_ascii_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Streams ISO-8859-1 bytes out as UTF-8.
///
/// Input is pulled in [`CHUNK_SIZE`] blocks. Converted output that does not
/// fit the caller's buffer is carried over to the next `read`, so a two-byte
/// sequence is never split across a boundary the caller can observe as
/// invalid.
pub struct Latin1Reader<R> {
    inner: R,
    chunk: Box<[u8; CHUNK_SIZE]>,
    pending: Vec<u8>,
    pos: usize,
}

impl<R: Read> Latin1Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            chunk: Box::new([0; CHUNK_SIZE]),
            pending: Vec::with_capacity(CHUNK_SIZE * 2),
            pos: 0,
        }
    }

    /// Refills `pending` from the next input chunk. Returns `false` at EOF.
    fn refill(&mut self) -> io::Result<bool> {
        let n = loop {
            match self.inner.read(&mut self.chunk[..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.pending.clear();
        self.pos = 0;
        for &byte in &self.chunk[..n] {
            push_latin1(&mut self.pending, byte);
        }
        Ok(n > 0)
    }
}

impl<R: Read> Read for Latin1Reader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos == self.pending.len() && !self.refill()? {
            return Ok(0);
        }
        let available = &self.pending[self.pos..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// Appends the UTF-8 encoding of the code point equal to `byte`.
#[inline]
fn push_latin1(out: &mut Vec<u8>, byte: u8) {
    if byte < 0x80 {
        out.push(byte);
    } else {
        out.push(0xC0 | (byte >> 6));
        out.push(0x80 | (byte & 0x3F));
    }
}
