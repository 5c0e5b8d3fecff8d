//! DNS message structure and encoding
//!
//! [`DnsMessage`] mirrors the wire layout: a 12-byte header followed by the
//! QD, AN, NS and AR sections. Encoding writes uncompressed names; the proxy
//! never re-encodes upstream replies (they are forwarded verbatim), so
//! outbound encoding only has to be correct, not compact.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::name::DnsName;

/// Record type: IPv4 address
pub const TYPE_A: u16 = 1;
/// Record type: authoritative name server
pub const TYPE_NS: u16 = 2;
/// Record type: canonical name (alias)
pub const TYPE_CNAME: u16 = 5;
/// Record type: start of authority
pub const TYPE_SOA: u16 = 6;

/// The header flags bitfield, split into its RFC 1035 §4.1.1 components
///
/// `encode` reproduces the exact two bytes `decode` observed for the same
/// logical values, including the reserved Z bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Query (false) or response (true)
    pub qr: bool,
    /// Operation code (4 bits)
    pub opcode: u8,
    /// Authoritative answer
    pub aa: bool,
    /// Truncated
    pub tc: bool,
    /// Recursion desired
    pub rd: bool,
    /// Recursion available
    pub ra: bool,
    /// Reserved bit 1
    pub z1: bool,
    /// Reserved bit 2
    pub z2: bool,
    /// Reserved bit 3
    pub z3: bool,
    /// Response code (4 bits)
    pub rcode: u8,
}

impl Flags {
    /// Split a wire bitfield into its components
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self {
            qr: bits >> 15 & 0x1 != 0,
            opcode: (bits >> 11 & 0xF) as u8,
            aa: bits >> 10 & 0x1 != 0,
            tc: bits >> 9 & 0x1 != 0,
            rd: bits >> 8 & 0x1 != 0,
            ra: bits >> 7 & 0x1 != 0,
            z1: bits >> 6 & 0x1 != 0,
            z2: bits >> 5 & 0x1 != 0,
            z3: bits >> 4 & 0x1 != 0,
            rcode: (bits & 0xF) as u8,
        }
    }

    /// Reassemble the wire bitfield
    #[must_use]
    pub fn to_bits(self) -> u16 {
        u16::from(self.qr) << 15
            | u16::from(self.opcode & 0xF) << 11
            | u16::from(self.aa) << 10
            | u16::from(self.tc) << 9
            | u16::from(self.rd) << 8
            | u16::from(self.ra) << 7
            | u16::from(self.z1) << 6
            | u16::from(self.z2) << 5
            | u16::from(self.z3) << 4
            | u16::from(self.rcode & 0xF)
    }
}

/// An entry of the question section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub qname: DnsName,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    fn encode_into(&self, buf: &mut BytesMut) {
        self.qname.encode_into(buf);
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
    }
}

/// The common leading fields of every resource record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Owner name
    pub name: DnsName,
    /// Record type as observed on the wire
    pub rtype: u16,
    /// Record class (IN in practice)
    pub class: u16,
    /// Time to live in seconds
    pub ttl: u32,
}

impl RecordHeader {
    fn encode_into(&self, buf: &mut BytesMut) {
        self.name.encode_into(buf);
        buf.put_u16(self.rtype);
        buf.put_u16(self.class);
        buf.put_u32(self.ttl);
    }
}

/// SOA record data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoaData {
    pub mname: DnsName,
    pub rname: DnsName,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// Typed record data; only A and CNAME are semantically acted upon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// IPv4 address (type 1)
    A(Ipv4Addr),
    /// Alias target (type 5)
    Cname(DnsName),
    /// Name server (type 2)
    Ns(DnsName),
    /// Start of authority (type 6)
    Soa(SoaData),
    /// Anything else, rdata carried verbatim
    Unknown(Vec<u8>),
}

/// A resource record: common header plus typed rdata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub header: RecordHeader,
    pub data: RecordData,
}

impl ResourceRecord {
    /// Append the wire form of this record: header, RDLENGTH, rdata
    pub fn encode_into(&self, buf: &mut BytesMut) {
        self.header.encode_into(buf);
        match &self.data {
            RecordData::A(addr) => {
                buf.put_u16(4);
                buf.put_slice(&addr.octets());
            }
            RecordData::Cname(name) | RecordData::Ns(name) => {
                let rdata = name.encode();
                buf.put_u16(rdata.len() as u16);
                buf.put_slice(&rdata);
            }
            RecordData::Soa(soa) => {
                let mut rdata = BytesMut::new();
                soa.mname.encode_into(&mut rdata);
                soa.rname.encode_into(&mut rdata);
                rdata.put_u32(soa.serial);
                rdata.put_u32(soa.refresh);
                rdata.put_u32(soa.retry);
                rdata.put_u32(soa.expire);
                rdata.put_u32(soa.minimum);
                buf.put_u16(rdata.len() as u16);
                buf.put_slice(&rdata);
            }
            RecordData::Unknown(data) => {
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
            }
        }
    }
}

/// A complete DNS message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsMessage {
    /// Transaction id
    pub id: u16,
    /// Header flags
    pub flags: Flags,
    /// Question section (QD)
    pub questions: Vec<Question>,
    /// Answer section (AN)
    pub answers: Vec<ResourceRecord>,
    /// Authority section (NS)
    pub authorities: Vec<ResourceRecord>,
    /// Additional section (AR)
    pub additionals: Vec<ResourceRecord>,
}

impl DnsMessage {
    /// Iterate over every resource record of the three record sections
    pub fn records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
    }

    /// Encode the full message with uncompressed names
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(self.id);
        buf.put_u16(self.flags.to_bits());
        buf.put_u16(self.questions.len() as u16);
        buf.put_u16(self.answers.len() as u16);
        buf.put_u16(self.authorities.len() as u16);
        buf.put_u16(self.additionals.len() as u16);
        for q in &self.questions {
            q.encode_into(&mut buf);
        }
        for rr in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
        {
            rr.encode_into(&mut buf);
        }
        buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn golden_header() -> RecordHeader {
        RecordHeader {
            name: DnsName::from_dotted("example.com"),
            rtype: 0xF0,
            class: 0xF0,
            ttl: 0x7777_0FF0,
        }
    }

    const GOLDEN_HEADER_BYTES: [u8; 21] = [
        0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0xF0,
        0x00, 0xF0, 0x77, 0x77, 0x0F, 0xF0,
    ];

    #[test]
    fn test_flags_encode_golden() {
        let flags = Flags {
            qr: true,
            opcode: 0xF,
            aa: false,
            tc: false,
            rd: true,
            ra: true,
            z1: false,
            z2: false,
            z3: false,
            rcode: 0xF,
        };
        assert_eq!(flags.to_bits().to_be_bytes(), [0xF9, 0x8F]);
    }

    #[test]
    fn test_flags_roundtrip_all_bits() {
        for bits in [0x0000u16, 0xFFFF, 0x8180, 0x0100, 0xF98F, 0x0070] {
            assert_eq!(Flags::from_bits(bits).to_bits(), bits);
        }
    }

    #[test]
    fn test_question_encode_golden() {
        let q = Question {
            qname: DnsName::from_dotted("example.com"),
            qtype: 0x001C,
            qclass: 0x0001,
        };
        let mut buf = BytesMut::new();
        q.encode_into(&mut buf);
        let good = [
            0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00,
            0x1C, 0x00, 0x01,
        ];
        assert_eq!(buf.to_vec(), good);
    }

    #[test]
    fn test_a_record_encode_golden() {
        let rr = ResourceRecord {
            header: golden_header(),
            data: RecordData::A(Ipv4Addr::new(192, 168, 1, 1)),
        };
        let mut buf = BytesMut::new();
        rr.encode_into(&mut buf);

        let mut good = GOLDEN_HEADER_BYTES.to_vec();
        good.extend_from_slice(&[0x00, 0x04, 192, 168, 1, 1]);
        assert_eq!(buf.to_vec(), good);
    }

    #[test]
    fn test_cname_record_encode_golden() {
        let rr = ResourceRecord {
            header: golden_header(),
            data: RecordData::Cname(DnsName::from_dotted("example.com")),
        };
        let mut buf = BytesMut::new();
        rr.encode_into(&mut buf);

        let mut good = GOLDEN_HEADER_BYTES.to_vec();
        good.extend_from_slice(&[0x00, 0x0D]);
        good.extend_from_slice(&DnsName::from_dotted("example.com").encode());
        assert_eq!(buf.to_vec(), good);
    }

    #[test]
    fn test_soa_record_encode_golden() {
        let rr = ResourceRecord {
            header: golden_header(),
            data: RecordData::Soa(SoaData {
                mname: DnsName::from_dotted("example.com"),
                rname: DnsName::from_dotted("example.com"),
                serial: 0x1234_5678,
                refresh: 0x1234_5678,
                retry: 0x1234_5678,
                expire: 0x1234_5678,
                minimum: 0x1234_5678,
            }),
        };
        let mut buf = BytesMut::new();
        rr.encode_into(&mut buf);

        let mut good = GOLDEN_HEADER_BYTES.to_vec();
        good.extend_from_slice(&[0x00, 0x2E]);
        good.extend_from_slice(&DnsName::from_dotted("example.com").encode());
        good.extend_from_slice(&DnsName::from_dotted("example.com").encode());
        for _ in 0..5 {
            good.extend_from_slice(&[0x12, 0x34, 0x56, 0x78]);
        }
        assert_eq!(buf.to_vec(), good);
    }

    #[test]
    fn test_unknown_record_encode_golden() {
        let rr = ResourceRecord {
            header: golden_header(),
            data: RecordData::Unknown(vec![0x01, 0x02, 0x03]),
        };
        let mut buf = BytesMut::new();
        rr.encode_into(&mut buf);

        let mut good = GOLDEN_HEADER_BYTES.to_vec();
        good.extend_from_slice(&[0x00, 0x03, 0x01, 0x02, 0x03]);
        assert_eq!(buf.to_vec(), good);
    }
}
