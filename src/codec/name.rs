//! DNS names
//!
//! A [`DnsName`] is an ordered sequence of labels. It round-trips through the
//! wire codec; the dotted-string form exists for comparison and display only.

use std::fmt;

use bytes::{BufMut, BytesMut};

/// An ordered sequence of DNS labels (each 1-63 bytes on the wire)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DnsName {
    labels: Vec<String>,
}

impl DnsName {
    /// Create a name from pre-split labels
    #[must_use]
    pub fn from_labels(labels: Vec<String>) -> Self {
        Self { labels }
    }

    /// Create a name from its dotted form ("www.example.com")
    ///
    /// A trailing dot is ignored; an empty string yields the root name.
    #[must_use]
    pub fn from_dotted(name: &str) -> Self {
        let trimmed = name.trim_end_matches('.');
        if trimmed.is_empty() {
            return Self::default();
        }
        Self {
            labels: trimmed.split('.').map(str::to_string).collect(),
        }
    }

    /// The labels of this name, in order
    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// True for the root name (zero labels)
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Normalized dotted form: ASCII-lowercased, no trailing dot
    ///
    /// This is the key used for cache lookups and rule matching; the wire
    /// form keeps its original case.
    #[must_use]
    pub fn normalized(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }

    /// Append the uncompressed wire form: length-prefixed labels plus the
    /// zero terminator. Labels longer than 63 bytes are clamped to the wire
    /// maximum.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        for label in &self.labels {
            let len = label.len().min(0x3F);
            buf.put_u8(len as u8);
            buf.put_slice(&label.as_bytes()[..len]);
        }
        buf.put_u8(0);
    }

    /// The uncompressed wire form as a fresh buffer
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.to_vec()
    }
}

impl fmt::Display for DnsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.labels.join("."))
    }
}

impl From<&str> for DnsName {
    fn from(value: &str) -> Self {
        Self::from_dotted(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotted_string_roundtrip() {
        let name = DnsName::from_dotted("example.com");
        assert_eq!(name.to_string(), "example.com");
        assert_eq!(name.labels().len(), 2);

        let name = DnsName::from_dotted("example.com.");
        assert_eq!(name.to_string(), "example.com");
    }

    #[test]
    fn test_encode_golden() {
        let name = DnsName::from_dotted("example.com");
        let good = [
            0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00,
        ];
        assert_eq!(name.encode(), good);
    }

    #[test]
    fn test_root_name() {
        let root = DnsName::from_dotted("");
        assert!(root.is_root());
        assert_eq!(root.encode(), [0x00]);
    }

    #[test]
    fn test_normalized_folds_case() {
        let name = DnsName::from_dotted("ExAmPlE.COM");
        assert_eq!(name.normalized(), "example.com");
        assert_eq!(name.to_string(), "ExAmPlE.COM");
    }
}
