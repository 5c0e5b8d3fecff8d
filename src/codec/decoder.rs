//! Bounds-checked DNS message decoder
//!
//! The input is a single untrusted UDP payload. Name decoding follows
//! compression pointers with a hop limit; after the first jump the resume
//! position is pinned to the byte after the two-byte pointer, so further
//! jumps never move the section cursor.

use std::net::Ipv4Addr;

use super::message::{
    DnsMessage, Flags, Question, RecordData, RecordHeader, ResourceRecord, SoaData, TYPE_A,
    TYPE_CNAME, TYPE_NS, TYPE_SOA,
};
use super::name::DnsName;
use super::{DecodeError, MAX_POINTER_HOPS};

/// Decode a full DNS message from a wire buffer
pub fn decode(buf: &[u8]) -> Result<DnsMessage, DecodeError> {
    if buf.len() < 12 {
        return Err(DecodeError::ShortHeader);
    }

    let mut msg = DnsMessage {
        id: read_u16(buf, 0)?,
        flags: Flags::from_bits(read_u16(buf, 2)?),
        ..DnsMessage::default()
    };

    let qd_count = read_u16(buf, 4)? as usize;
    let an_count = read_u16(buf, 6)? as usize;
    let ns_count = read_u16(buf, 8)? as usize;
    let ar_count = read_u16(buf, 10)? as usize;

    let mut pos = 12;

    for _ in 0..qd_count {
        let (qname, next) = read_name(buf, pos)?;
        let qtype = read_u16(buf, next)?;
        let qclass = read_u16(buf, next + 2)?;
        msg.questions.push(Question {
            qname,
            qtype,
            qclass,
        });
        pos = next + 4;
    }

    for _ in 0..an_count {
        let (rr, next) = read_record(buf, pos)?;
        msg.answers.push(rr);
        pos = next;
    }
    for _ in 0..ns_count {
        let (rr, next) = read_record(buf, pos)?;
        msg.authorities.push(rr);
        pos = next;
    }
    for _ in 0..ar_count {
        let (rr, next) = read_record(buf, pos)?;
        msg.additionals.push(rr);
        pos = next;
    }

    Ok(msg)
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, DecodeError> {
    let bytes = buf
        .get(pos..pos + 2)
        .ok_or(DecodeError::Truncated(pos))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, DecodeError> {
    let bytes = buf
        .get(pos..pos + 4)
        .ok_or(DecodeError::Truncated(pos))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a possibly-compressed name starting at `start`.
///
/// Returns the name and the position of the byte after it in the original
/// stream (after the pointer if one was taken).
fn read_name(buf: &[u8], start: usize) -> Result<(DnsName, usize), DecodeError> {
    let mut labels = Vec::new();
    let mut pos = start;
    let mut resume = None;
    let mut hops = 0usize;

    loop {
        let len = *buf.get(pos).ok_or(DecodeError::Truncated(pos))? as usize;

        if len == 0 {
            pos += 1;
            break;
        }

        if len & 0xC0 == 0xC0 {
            let low = *buf.get(pos + 1).ok_or(DecodeError::Truncated(pos + 1))? as usize;
            // The resume position is fixed by the first jump only.
            if resume.is_none() {
                resume = Some(pos + 2);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(DecodeError::BadLabel(pos));
            }
            pos = (len & 0x3F) << 8 | low;
            continue;
        }

        if len & 0xC0 != 0 {
            return Err(DecodeError::BadLabel(pos));
        }

        let end = pos + 1 + len;
        let bytes = buf.get(pos + 1..end).ok_or(DecodeError::Truncated(pos))?;
        labels.push(String::from_utf8_lossy(bytes).into_owned());
        pos = end;
    }

    Ok((DnsName::from_labels(labels), resume.unwrap_or(pos)))
}

/// Read one resource record starting at `start`
fn read_record(buf: &[u8], start: usize) -> Result<(ResourceRecord, usize), DecodeError> {
    let (name, pos) = read_name(buf, start)?;

    let rtype = read_u16(buf, pos)?;
    let class = read_u16(buf, pos + 2)?;
    let ttl = read_u32(buf, pos + 4)?;
    let rdlen = read_u16(buf, pos + 8)? as usize;
    let rdata_start = pos + 10;

    if buf.len() < rdata_start + rdlen {
        return Err(DecodeError::Truncated(rdata_start));
    }

    let header = RecordHeader {
        name,
        rtype,
        class,
        ttl,
    };

    let (data, next) = match rtype {
        TYPE_A => {
            if rdlen != 4 {
                return Err(DecodeError::BadAResource(rdlen as u16));
            }
            let octets = &buf[rdata_start..rdata_start + 4];
            (
                RecordData::A(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])),
                rdata_start + 4,
            )
        }
        TYPE_CNAME => {
            let (target, next) = read_name(buf, rdata_start)?;
            (RecordData::Cname(target), next)
        }
        TYPE_NS => {
            let (target, next) = read_name(buf, rdata_start)?;
            (RecordData::Ns(target), next)
        }
        TYPE_SOA => {
            let (mname, p) = read_name(buf, rdata_start)?;
            let (rname, p) = read_name(buf, p)?;
            let soa = SoaData {
                mname,
                rname,
                serial: read_u32(buf, p)?,
                refresh: read_u32(buf, p + 4)?,
                retry: read_u32(buf, p + 8)?,
                expire: read_u32(buf, p + 12)?,
                minimum: read_u32(buf, p + 16)?,
            };
            (RecordData::Soa(soa), p + 20)
        }
        _ => (
            RecordData::Unknown(buf[rdata_start..rdata_start + rdlen].to_vec()),
            rdata_start + rdlen,
        ),
    };

    Ok((ResourceRecord { header, data }, next))
}
