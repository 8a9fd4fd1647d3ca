//! Splitting of array-indexed names into lookup segments.
//!
//! A name like `s.arr[2].m[1][3].x` is broken into the text preceding each
//! bracket span together with the index inside it, plus whatever follows
//! the last span:
//!
//! ```text
//! ("s.arr", 2), (".m", 1), ("", 3), suffix ".x"
//! ```
//!
//! Each `[` is paired with the nearest following `]`. A `[` without a
//! closing bracket is kept as literal text.

/// Name broken into `(segment, index)` pairs and a trailing suffix.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPath<'a> {
    pub segments: Vec<(&'a str, usize)>,
    pub suffix: &'a str,
}

impl<'a> IndexPath<'a> {
    /// Splits `key`. Returns `None` if the key contains no bracket span or
    /// if any span doesn't hold a non-negative integer.
    pub fn parse(key: &'a str) -> Option<IndexPath<'a>> {
        let spans = bracket_spans(key);
        if spans.is_empty() {
            return None;
        }

        let mut segments = Vec::with_capacity(spans.len());
        let mut cursor = 0;
        for (open, close) in spans {
            let index = key[open + 1..close].trim().parse::<usize>().ok()?;
            segments.push((&key[cursor..open], index));
            cursor = close + 1;
        }
        Some(IndexPath {
            segments,
            suffix: &key[cursor..],
        })
    }
}

/// Byte positions of every matched `[`...`]` pair, in order.
fn bracket_spans(key: &str) -> Vec<(usize, usize)> {
    let bytes = key.as_bytes();
    let mut spans = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == b'[' {
            if let Some(rel) = bytes[pos + 1..].iter().position(|b| *b == b']') {
                let close = pos + 1 + rel;
                spans.push((pos, close));
                pos = close;
            }
        }
        pos += 1;
    }
    spans
}
