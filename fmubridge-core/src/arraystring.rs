//! Fixed-capacity string storage used by string variables.
//!
//! Worker-side string buffers are 256 bytes long including the terminating
//! NUL, so at most [`STRING_CAPACITY`] bytes of text can be exchanged.

use crate::error::{Error, Result};

/// Maximum number of text bytes a string variable can hold.
pub const STRING_CAPACITY: usize = 255;

/// Inline string buffer backing string variables.
pub type FixedString = arrayvec::ArrayString<[u8; 256]>;

/// Creates a new fixed string, failing if `s` doesn't fit.
pub fn new(s: &str) -> Result<FixedString> {
    if s.len() > STRING_CAPACITY {
        return Err(Error::StringTooLong {
            len: s.len(),
            capacity: STRING_CAPACITY,
        });
    }
    FixedString::from(s).map_err(|e| Error::Other(format!("{}", e)))
}

/// Creates a new fixed string, cutting `s` at the last char boundary that
/// fits.
pub fn new_truncate(s: &str) -> FixedString {
    let mut out = FixedString::new();
    out.push_str(truncate_str(s, STRING_CAPACITY));
    out
}

/// Decodes a NUL-terminated byte buffer received from the worker.
pub fn from_wire(bytes: &[u8]) -> Result<FixedString> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    new(&String::from_utf8_lossy(&bytes[..end]))
}

pub(crate) fn truncate_str(slice: &str, size: usize) -> &str {
    if size >= slice.len() {
        return slice;
    }
    let mut index = size;
    while !slice.is_char_boundary(index) {
        index -= 1;
    }
    &slice[..index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_string_is_rejected() {
        let long = "x".repeat(STRING_CAPACITY + 1);
        assert!(matches!(new(&long), Err(Error::StringTooLong { .. })));
        assert_eq!(new(&long[1..]).unwrap().len(), STRING_CAPACITY);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = format!("{}ł", "a".repeat(STRING_CAPACITY - 1));
        let t = new_truncate(&s);
        assert_eq!(t.len(), STRING_CAPACITY - 1);
    }

    #[test]
    fn wire_buffer_stops_at_nul() {
        let s = from_wire(b"hello\0garbage").unwrap();
        assert_eq!(s.as_str(), "hello");
    }
}
