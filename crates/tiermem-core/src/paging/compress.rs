//! Pluggable payload compression for disk and archived entries.

use std::fmt::Debug;

/// Transforms payloads on their way into cold storage.
///
/// Implementations must never produce `<key:` or `</key>` from input that
/// does not already contain them.
pub trait Compressor: Debug + Send + Sync {
    fn compress(&self, data: &str) -> String;
    fn decompress(&self, data: &str) -> String;
}

/// Collapses every run of ASCII whitespace into one space.
///
/// Lossy and not real compression; decompression returns the input.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceCollapse;

impl Compressor for WhitespaceCollapse {
    fn compress(&self, data: &str) -> String {
        let mut out = String::with_capacity(data.len());
        let mut in_run = false;
        for c in data.chars() {
            if c.is_ascii_whitespace() {
                if !in_run {
                    out.push(' ');
                }
                in_run = true;
            } else {
                out.push(c);
                in_run = false;
            }
        }
        out
    }

    fn decompress(&self, data: &str) -> String {
        data.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_runs() {
        let c = WhitespaceCollapse;
        assert_eq!(c.compress("a  b\n\n\tc "), "a b c ");
        assert_eq!(c.compress(""), "");
        assert_eq!(c.decompress("a b"), "a b");
    }
}
