//! Growable byte buffer that every arena allocates through.
//!
//! The backing vector always carries one trailing NUL byte after the
//! content, so `len() < capacity()` holds at all times and the raw bytes
//! can be handed to string-scanning consumers unchanged.

use std::borrow::Cow;

use crate::error::{MemoryError, MemoryResult};

/// Hard ceiling for a single buffer allocation.
pub const MAX_BUFFER_CAPACITY: usize = 64 * 1024 * 1024;

const MIN_GROWTH: usize = 64;

/// An exclusively owned, NUL-terminated byte buffer.
///
/// Cloning produces an independent copy; equality compares content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Default for Buffer {
    fn default() -> Self {
        Self { data: vec![0] }
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate room for at least `capacity` content bytes.
    pub fn with_capacity(capacity: usize) -> MemoryResult<Self> {
        let mut buf = Self::default();
        buf.reserve(capacity)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> MemoryResult<Self> {
        let mut buf = Self::with_capacity(bytes.len())?;
        buf.append(bytes)?;
        Ok(buf)
    }

    /// Content length, excluding the terminator.
    pub fn len(&self) -> usize {
        self.data.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    /// Content plus the trailing NUL.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.data
    }

    /// Lossy UTF-8 view of the content.
    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.pop();
        self.data
    }

    /// Make sure `additional` more content bytes fit without reallocating.
    ///
    /// Grows to at least double the current capacity so repeated appends
    /// stay amortised O(1).
    fn reserve(&mut self, additional: usize) -> MemoryResult<()> {
        let needed = self
            .data
            .len()
            .checked_add(additional)
            .filter(|n| *n <= MAX_BUFFER_CAPACITY)
            .ok_or_else(|| {
                MemoryError::CapacityExceeded(format!(
                    "buffer of {} bytes cannot grow by {additional}",
                    self.len()
                ))
            })?;
        if needed <= self.data.capacity() {
            return Ok(());
        }
        let target = needed
            .max(self.data.capacity().saturating_mul(2))
            .max(MIN_GROWTH)
            .min(MAX_BUFFER_CAPACITY);
        self.data
            .try_reserve_exact(target - self.data.len())
            .map_err(|e| MemoryError::CapacityExceeded(e.to_string()))
    }

    /// Replace the content with `src`, truncated to `max_len` bytes when
    /// `max_len > 0`.
    pub fn set(&mut self, src: &[u8], max_len: usize) -> MemoryResult<()> {
        let take = if max_len > 0 {
            src.len().min(max_len)
        } else {
            src.len()
        };
        let extra = take.saturating_sub(self.len());
        self.reserve(extra)?;
        self.data.clear();
        self.data.extend_from_slice(&src[..take]);
        self.data.push(0);
        Ok(())
    }

    pub fn append(&mut self, src: &[u8]) -> MemoryResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        self.reserve(src.len())?;
        self.data.pop();
        self.data.extend_from_slice(src);
        self.data.push(0);
        Ok(())
    }

    pub fn append_byte(&mut self, byte: u8) -> MemoryResult<()> {
        self.reserve(1)?;
        let end = self.len();
        self.data[end] = byte;
        self.data.push(0);
        Ok(())
    }

    /// Drop the first `n` bytes (clamped to the length). Never reallocates.
    pub fn trim_front(&mut self, n: usize) {
        let n = n.min(self.len());
        self.data.drain(..n);
    }

    /// Cut out `start..end` (clamped) and shift the tail left in place.
    pub fn remove_range(&mut self, start: usize, end: usize) {
        let end = end.min(self.len());
        let start = start.min(end);
        self.data.drain(start..end);
    }

    /// Shrink the content to at most `max_size` bytes.
    ///
    /// With `preserve_suffix > 0` the first `max_size - preserve_suffix`
    /// bytes and the last `preserve_suffix` bytes are kept.
    ///
    /// With `preserve_suffix == 0` the middle is dropped: the head keeps up
    /// to `max_size / 2` bytes, ending just after its last ASCII whitespace,
    /// and the tail keeps up to `max_size - max_size / 2` bytes, starting
    /// just after its first ASCII whitespace. A side with no whitespace is
    /// cut at the exact byte count.
    pub fn trim_context(&mut self, max_size: usize, preserve_suffix: usize) -> MemoryResult<()> {
        if max_size == 0 {
            return Err(MemoryError::invalid("trim_context max_size must be positive"));
        }
        if preserve_suffix >= max_size {
            return Err(MemoryError::invalid(format!(
                "preserve_suffix {preserve_suffix} must be smaller than max_size {max_size}"
            )));
        }
        let len = self.len();
        if len <= max_size {
            return Ok(());
        }

        let (head_end, tail_start) = if preserve_suffix > 0 {
            (max_size - preserve_suffix, len - preserve_suffix)
        } else {
            let bytes = self.as_bytes();
            let head = max_size / 2;
            let head_end = match bytes[..head].iter().rposition(u8::is_ascii_whitespace) {
                Some(pos) if pos > 0 => pos + 1,
                _ => head,
            };
            let tail = len - (max_size - head);
            let tail_start = match bytes[tail..].iter().position(u8::is_ascii_whitespace) {
                Some(pos) if tail + pos + 1 < len => tail + pos + 1,
                _ => tail,
            };
            (head_end, tail_start)
        };

        self.data.drain(head_end..tail_start);
        Ok(())
    }

    /// Index of the first occurrence of `needle` at or after `start`.
    pub fn find(&self, needle: &[u8], start: usize) -> Option<usize> {
        find_bytes(self.as_bytes(), needle, start)
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.data.push(0);
    }

    /// Structural self-check: terminator present and size below capacity.
    pub fn validate(&self) -> bool {
        self.data.last() == Some(&0) && self.len() < self.capacity()
    }
}

/// Plain substring search over bytes.
pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if start > haystack.len() {
        return None;
    }
    if needle.is_empty() {
        return Some(start);
    }
    haystack[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + start)
}
