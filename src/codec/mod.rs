//! DNS wire codec
//!
//! Decoding and encoding of DNS messages as they appear on the wire,
//! including name-compression-safe parsing of responses. The codec is
//! deliberately small: it understands exactly what the routing pipeline
//! needs (A, CNAME, NS, SOA) and carries everything else verbatim.
//!
//! The decoder never trusts the input: every read is bounds-checked and
//! compression-pointer chains are hop-limited, so malformed or hostile
//! payloads produce a [`DecodeError`] instead of a panic or a spin.

pub mod decoder;
pub mod message;
pub mod name;

use thiserror::Error;

pub use decoder::decode;
pub use message::{
    DnsMessage, Flags, Question, RecordData, RecordHeader, ResourceRecord, SoaData, TYPE_A,
    TYPE_CNAME, TYPE_NS, TYPE_SOA,
};
pub use name::DnsName;

/// Maximum number of compression-pointer jumps followed while decoding a
/// single name. Real messages use a handful; anything deeper is a loop.
pub const MAX_POINTER_HOPS: usize = 128;

/// Errors produced while decoding a DNS wire message
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer than the 12 fixed header bytes
    #[error("message shorter than the 12-byte header")]
    ShortHeader,

    /// A length or offset points past the end of the buffer
    #[error("message truncated at offset {0}")]
    Truncated(usize),

    /// A label length byte has reserved high bits set, or a pointer chain
    /// exceeded the hop limit
    #[error("malformed label at offset {0}")]
    BadLabel(usize),

    /// An A record whose RDLENGTH is not exactly 4
    #[error("A record with rdlength {0}, expected 4")]
    BadAResource(u16),
}
