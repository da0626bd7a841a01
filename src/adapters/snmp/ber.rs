//! Basic Encoding Rules subset used by SNMPv1/v2c messages.

use crate::domain::model::{Oid, Value};
use crate::utils::error::CodecError;

pub mod tag {
    pub const INTEGER: u8 = 0x02;
    pub const OCTET_STRING: u8 = 0x04;
    pub const NULL: u8 = 0x05;
    pub const OBJECT_IDENTIFIER: u8 = 0x06;
    pub const SEQUENCE: u8 = 0x30;
    pub const IP_ADDRESS: u8 = 0x40;
    pub const COUNTER32: u8 = 0x41;
    pub const GAUGE32: u8 = 0x42;
    pub const TIME_TICKS: u8 = 0x43;
    pub const OPAQUE: u8 = 0x44;
    pub const COUNTER64: u8 = 0x46;
    pub const NO_SUCH_OBJECT: u8 = 0x80;
    pub const NO_SUCH_INSTANCE: u8 = 0x81;
    pub const END_OF_MIB_VIEW: u8 = 0x82;
}

pub fn put_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = (len as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

pub fn put_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    put_length(out, content.len());
    out.extend_from_slice(content);
}

/// Wraps whatever `build` writes in a constructed TLV.
pub fn put_constructed(out: &mut Vec<u8>, tag: u8, build: impl FnOnce(&mut Vec<u8>)) {
    let mut content = Vec::new();
    build(&mut content);
    put_tlv(out, tag, &content);
}

pub fn put_integer(out: &mut Vec<u8>, tag: u8, value: i64) {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    put_tlv(out, tag, &bytes[start..]);
}

pub fn put_unsigned(out: &mut Vec<u8>, tag: u8, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes
        .iter()
        .take_while(|b| **b == 0)
        .count()
        .min(bytes.len() - 1);
    let mut content = Vec::with_capacity(9);
    if bytes[skip] & 0x80 != 0 {
        content.push(0);
    }
    content.extend_from_slice(&bytes[skip..]);
    put_tlv(out, tag, &content);
}

pub fn put_oid(out: &mut Vec<u8>, oid: &Oid) {
    let subids = oid.as_slice();
    let mut content = Vec::with_capacity(subids.len() + 4);
    let (first, rest) = match subids {
        [] => (0u64, &[][..]),
        [a] => (u64::from(*a) * 40, &[][..]),
        [a, b, rest @ ..] => (u64::from(*a) * 40 + u64::from(*b), rest),
    };
    put_base128(&mut content, first);
    for subid in rest {
        put_base128(&mut content, u64::from(*subid));
    }
    put_tlv(out, tag::OBJECT_IDENTIFIER, &content);
}

fn put_base128(out: &mut Vec<u8>, mut value: u64) {
    let mut groups = [0u8; 10];
    let mut n = 0;
    loop {
        groups[n] = (value & 0x7f) as u8;
        n += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let more = if i > 0 { 0x80 } else { 0 };
        out.push(groups[i] | more);
    }
}

pub fn put_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(v) => put_integer(out, tag::INTEGER, i64::from(*v)),
        Value::OctetString(data) => put_tlv(out, tag::OCTET_STRING, data),
        Value::Null => put_tlv(out, tag::NULL, &[]),
        Value::ObjectIdentifier(oid) => put_oid(out, oid),
        Value::IpAddress(addr) => put_tlv(out, tag::IP_ADDRESS, addr),
        Value::Counter32(v) => put_unsigned(out, tag::COUNTER32, u64::from(*v)),
        Value::Gauge32(v) => put_unsigned(out, tag::GAUGE32, u64::from(*v)),
        Value::TimeTicks(v) => put_unsigned(out, tag::TIME_TICKS, u64::from(*v)),
        Value::Opaque(data) => put_tlv(out, tag::OPAQUE, data),
        Value::Counter64(v) => put_unsigned(out, tag::COUNTER64, *v),
        Value::NoSuchObject => put_tlv(out, tag::NO_SUCH_OBJECT, &[]),
        Value::NoSuchInstance => put_tlv(out, tag::NO_SUCH_INSTANCE, &[]),
        Value::EndOfMibView => put_tlv(out, tag::END_OF_MIB_VIEW, &[]),
    }
}

/// Sequential TLV reader over a byte slice.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.data.len() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.data.len(),
            });
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn length(&mut self) -> Result<usize, CodecError> {
        let first = self.take(1)?[0];
        if first & 0x80 == 0 {
            return Ok(usize::from(first));
        }
        let count = usize::from(first & 0x7f);
        if count == 0 || count > 4 {
            return Err(CodecError::Malformed { what: "length" });
        }
        Ok(self
            .take(count)?
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b)))
    }

    /// Reads any TLV, returning its tag and content.
    pub fn any(&mut self) -> Result<(u8, &'a [u8]), CodecError> {
        let tag = self.take(1)?[0];
        let len = self.length()?;
        Ok((tag, self.take(len)?))
    }

    pub fn expect(&mut self, expected: u8) -> Result<&'a [u8], CodecError> {
        let (actual, content) = self.any()?;
        if actual != expected {
            return Err(CodecError::UnexpectedTag { expected, actual });
        }
        Ok(content)
    }

    pub fn sequence(&mut self) -> Result<Decoder<'a>, CodecError> {
        self.expect(tag::SEQUENCE).map(Decoder::new)
    }

    pub fn integer(&mut self) -> Result<i64, CodecError> {
        decode_integer(self.expect(tag::INTEGER)?)
    }

    pub fn octet_string(&mut self) -> Result<Vec<u8>, CodecError> {
        self.expect(tag::OCTET_STRING).map(<[u8]>::to_vec)
    }

    pub fn oid(&mut self) -> Result<Oid, CodecError> {
        decode_oid(self.expect(tag::OBJECT_IDENTIFIER)?)
    }

    pub fn value(&mut self) -> Result<Value, CodecError> {
        let (t, content) = self.any()?;
        let narrow = |v: u64| {
            u32::try_from(v).map_err(|_| CodecError::Malformed {
                what: "32-bit unsigned value",
            })
        };
        Ok(match t {
            tag::INTEGER => {
                let v = decode_integer(content)?;
                Value::Integer(i32::try_from(v).map_err(|_| CodecError::Malformed {
                    what: "Integer32 value",
                })?)
            }
            tag::OCTET_STRING => Value::OctetString(content.to_vec()),
            tag::NULL => Value::Null,
            tag::OBJECT_IDENTIFIER => Value::ObjectIdentifier(decode_oid(content)?),
            tag::IP_ADDRESS => Value::IpAddress(content.try_into().map_err(|_| {
                CodecError::Malformed {
                    what: "IpAddress value",
                }
            })?),
            tag::COUNTER32 => Value::Counter32(narrow(decode_unsigned(content)?)?),
            tag::GAUGE32 => Value::Gauge32(narrow(decode_unsigned(content)?)?),
            tag::TIME_TICKS => Value::TimeTicks(narrow(decode_unsigned(content)?)?),
            tag::OPAQUE => Value::Opaque(content.to_vec()),
            tag::COUNTER64 => Value::Counter64(decode_unsigned(content)?),
            tag::NO_SUCH_OBJECT => Value::NoSuchObject,
            tag::NO_SUCH_INSTANCE => Value::NoSuchInstance,
            tag::END_OF_MIB_VIEW => Value::EndOfMibView,
            other => return Err(CodecError::UnknownValueType(u16::from(other))),
        })
    }
}

fn decode_integer(content: &[u8]) -> Result<i64, CodecError> {
    if content.is_empty() || content.len() > 8 {
        return Err(CodecError::Malformed { what: "integer" });
    }
    let negative = content[0] & 0x80 != 0;
    let init: i64 = if negative { -1 } else { 0 };
    Ok(content
        .iter()
        .fold(init, |acc, b| (acc << 8) | i64::from(*b)))
}

fn decode_unsigned(content: &[u8]) -> Result<u64, CodecError> {
    let content = match content {
        [0, rest @ ..] if !rest.is_empty() => rest,
        _ => content,
    };
    if content.is_empty() || content.len() > 8 {
        return Err(CodecError::Malformed {
            what: "unsigned integer",
        });
    }
    Ok(content.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn decode_oid(content: &[u8]) -> Result<Oid, CodecError> {
    let mut values = Vec::with_capacity(content.len() + 1);
    let mut acc: u64 = 0;
    let mut pending = false;
    for b in content {
        acc = (acc << 7) | u64::from(b & 0x7f);
        pending = true;
        if acc > u64::from(u32::MAX) * 40 + 39 {
            return Err(CodecError::Malformed {
                what: "object identifier",
            });
        }
        if b & 0x80 == 0 {
            values.push(acc);
            acc = 0;
            pending = false;
        }
    }
    if pending {
        return Err(CodecError::Malformed {
            what: "object identifier",
        });
    }

    let mut subids = Vec::with_capacity(values.len() + 1);
    if let Some((&first, rest)) = values.split_first() {
        let (a, b) = match first {
            0..=39 => (0, first),
            40..=79 => (1, first - 40),
            _ => (2, first - 80),
        };
        subids.push(a as u32);
        subids.push(u32::try_from(b).map_err(|_| CodecError::Malformed {
            what: "object identifier",
        })?);
        for v in rest {
            subids.push(u32::try_from(*v).map_err(|_| CodecError::Malformed {
                what: "object identifier",
            })?);
        }
    }
    Ok(Oid::new(subids))
}
