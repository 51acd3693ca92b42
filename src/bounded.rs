//! Capacity-bounded text reads.
//!
//! Native info queries copy into a caller-sized buffer and leave room for a
//! terminating NUL. Anything that does not fit is dropped. [`BoundedText`]
//! keeps the copied bytes together with the length the platform actually had
//! available, so a caller can tell a truncated read from a complete one
//! without treating truncation as an error.

use std::borrow::Cow;

/// Text copied through a fixed-capacity buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedText {
    bytes: Vec<u8>,
    available: usize,
}

impl BoundedText {
    /// Copy `source` through a buffer of `capacity` bytes.
    ///
    /// The source is read up to its first NUL. At most `capacity - 1` bytes
    /// are kept, the last slot being reserved for the terminator. A capacity
    /// of zero keeps nothing.
    pub fn copy_from(source: &[u8], capacity: usize) -> Self {
        let source = match source.iter().position(|&b| b == 0) {
            Some(nul) => &source[..nul],
            None => source,
        };
        let kept = source.len().min(capacity.saturating_sub(1));

        Self {
            bytes: source[..kept].to_vec(),
            available: source.len(),
        }
    }

    /// Bytes that fit into the buffer, terminator excluded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Copied text, with any split multi-byte sequence replaced.
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn into_string(self) -> String {
        match String::from_utf8(self.bytes) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }

    /// Number of bytes kept.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Length of the full text on the platform side.
    pub fn available(&self) -> usize {
        self.available
    }

    /// Whether part of the text was dropped.
    pub fn is_truncated(&self) -> bool {
        self.available > self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_exact() {
        let text = BoundedText::copy_from(b"Iris Xe", 100);
        assert_eq!(text.as_bytes(), b"Iris Xe");
        assert_eq!(text.available(), 7);
        assert!(!text.is_truncated());
    }

    #[test]
    fn test_long_text_keeps_capacity_minus_one() {
        let name = "x".repeat(150);
        let text = BoundedText::copy_from(name.as_bytes(), 100);
        assert_eq!(text.len(), 99);
        assert_eq!(text.as_bytes(), &name.as_bytes()[..99]);
        assert_eq!(text.available(), 150);
        assert!(text.is_truncated());
    }

    #[test]
    fn test_boundary_lengths() {
        // 99 bytes plus terminator fill a 100 byte buffer exactly.
        let fits = "a".repeat(99);
        assert!(!BoundedText::copy_from(fits.as_bytes(), 100).is_truncated());

        let overflows = "a".repeat(100);
        let text = BoundedText::copy_from(overflows.as_bytes(), 100);
        assert!(text.is_truncated());
        assert_eq!(text.len(), 99);
    }

    #[test]
    fn test_stops_at_nul() {
        let text = BoundedText::copy_from(b"gpu\0garbage", 100);
        assert_eq!(text.into_string(), "gpu");
    }

    #[test]
    fn test_zero_capacity() {
        let text = BoundedText::copy_from(b"abc", 0);
        assert!(text.is_empty());
        assert!(text.is_truncated());
    }

    #[test]
    fn test_split_utf8_is_lossy_not_fatal() {
        // 'é' is two bytes; a capacity of 3 keeps "a" plus half of it.
        let text = BoundedText::copy_from("aé".as_bytes(), 3);
        assert_eq!(text.len(), 2);
        assert!(text.to_string_lossy().starts_with('a'));
    }
}
