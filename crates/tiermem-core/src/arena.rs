//! Marker-delimited byte arenas, one per layer.
//!
//! Each entry is laid out as `\n<key:NAME>\n{data}\n</key>\n`. Lookups scan
//! forward for the first marker, so if a name ever appears twice the
//! earliest entry wins.

use std::ops::Range;

use crate::buffer::{find_bytes, Buffer};
use crate::error::{MemoryError, MemoryResult};

const MARKER_OPEN: &[u8] = b"<key:";
const TERMINATOR: &[u8] = b"</key>";

/// Byte offsets of one entry inside an arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySpan {
    /// Whole entry including surrounding newlines.
    pub entry: Range<usize>,
    /// Payload only.
    pub data: Range<usize>,
}

fn marker(name: &str) -> Vec<u8> {
    let mut m = Vec::with_capacity(name.len() + 6);
    m.extend_from_slice(MARKER_OPEN);
    m.extend_from_slice(name.as_bytes());
    m.push(b'>');
    m
}

/// Reject payloads that would be mistaken for entry framing.
pub(crate) fn check_payload(data: &[u8]) -> MemoryResult<()> {
    if find_bytes(data, TERMINATOR, 0).is_some() || find_bytes(data, MARKER_OPEN, 0).is_some() {
        return Err(MemoryError::invalid(
            "data may not contain `<key:` or `</key>` framing",
        ));
    }
    Ok(())
}

/// A growable arena of serialized entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arena {
    buf: Buffer,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> MemoryResult<Self> {
        Ok(Self {
            buf: Buffer::from_bytes(bytes)?,
        })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        self.buf.as_str()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Append a framed entry. Returns the number of bytes added.
    pub fn append_entry(&mut self, name: &str, data: &[u8]) -> MemoryResult<usize> {
        let before = self.buf.len();
        let mut framed = Vec::with_capacity(data.len() + name.len() + 16);
        framed.push(b'\n');
        framed.extend_from_slice(&marker(name));
        framed.push(b'\n');
        framed.extend_from_slice(data);
        framed.extend_from_slice(b"\n");
        framed.extend_from_slice(TERMINATOR);
        framed.push(b'\n');
        self.buf.append(&framed)?;
        Ok(self.buf.len() - before)
    }

    /// Locate the first entry for `name`.
    ///
    /// `Ok(None)` when there is no marker; `CorruptEntry` when a marker has
    /// no terminator after it.
    pub fn find_entry(&self, name: &str) -> MemoryResult<Option<EntrySpan>> {
        let bytes = self.buf.as_bytes();
        let marker = marker(name);
        let Some(marker_at) = find_bytes(bytes, &marker, 0) else {
            return Ok(None);
        };
        let mut data_start = marker_at + marker.len();
        if bytes.get(data_start) == Some(&b'\n') {
            data_start += 1;
        }
        let term_at = find_bytes(bytes, TERMINATOR, data_start)
            .ok_or_else(|| MemoryError::corrupt(name, "entry marker without terminator"))?;
        let mut data_end = term_at;
        if data_end > data_start && bytes[data_end - 1] == b'\n' {
            data_end -= 1;
        }

        let entry_start = if marker_at > 0 && bytes[marker_at - 1] == b'\n' {
            marker_at - 1
        } else {
            marker_at
        };
        let mut entry_end = term_at + TERMINATOR.len();
        if bytes.get(entry_end) == Some(&b'\n') {
            entry_end += 1;
        }
        Ok(Some(EntrySpan {
            entry: entry_start..entry_end,
            data: data_start..data_end,
        }))
    }

    /// Payload of the first entry for `name`.
    pub fn read_entry(&self, name: &str) -> MemoryResult<Option<Vec<u8>>> {
        Ok(self
            .find_entry(name)?
            .map(|span| self.buf.as_bytes()[span.data].to_vec()))
    }

    /// Excise the first entry for `name` in place. Returns bytes removed.
    pub fn remove_entry(&mut self, name: &str) -> MemoryResult<Option<usize>> {
        let Some(span) = self.find_entry(name)? else {
            return Ok(None);
        };
        let removed = span.entry.len();
        self.buf.remove_range(span.entry.start, span.entry.end);
        Ok(Some(removed))
    }

    /// Remove every entry for `name`. Returns total bytes removed.
    pub fn remove_all(&mut self, name: &str) -> MemoryResult<usize> {
        let mut total = 0;
        while let Some(removed) = self.remove_entry(name)? {
            total += removed;
        }
        Ok(total)
    }

    /// Names of all well-formed entries, in arena order.
    pub fn entry_names(&self) -> Vec<String> {
        let bytes = self.buf.as_bytes();
        let mut names = Vec::new();
        let mut at = 0;
        while let Some(open) = find_bytes(bytes, MARKER_OPEN, at) {
            let name_start = open + MARKER_OPEN.len();
            let Some(close) = bytes[name_start..].iter().position(|b| *b == b'>') else {
                break;
            };
            let name = String::from_utf8_lossy(&bytes[name_start..name_start + close]);
            names.push(name.into_owned());
            at = name_start + close + 1;
            match find_bytes(bytes, TERMINATOR, at) {
                Some(term) => at = term + TERMINATOR.len(),
                None => break,
            }
        }
        names
    }
}
