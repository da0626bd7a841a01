//! AgentX (RFC 2741) PDU encoding and decoding.
//!
//! Every PDU starts with a 20-byte header:
//! ```text
//! +---------+---------+---------+----------+
//! | version | type    | flags   | reserved |
//! +---------+---------+---------+----------+
//! | sessionID                              |
//! | transactionID                          |
//! | packetID                               |
//! | payload_length                         |
//! +----------------------------------------+
//! ```
//! Multi-byte fields follow the NETWORK_BYTE_ORDER flag of the PDU they
//! belong to. We always encode in network byte order.

use crate::domain::model::{Oid, SearchRange, Value, VarBind};
use crate::utils::error::CodecError;
use bytes::{Buf, BufMut, BytesMut};

pub const AGENTX_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 20;

pub const FLAG_INSTANCE_REGISTRATION: u8 = 0x01;
pub const FLAG_NEW_INDEX: u8 = 0x02;
pub const FLAG_ANY_INDEX: u8 = 0x04;
pub const FLAG_NON_DEFAULT_CONTEXT: u8 = 0x08;
pub const FLAG_NETWORK_BYTE_ORDER: u8 = 0x10;

/// Upper bound on a payload we are willing to buffer.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

const INTERNET_PREFIX: [u32; 4] = [1, 3, 6, 1];

/// Error codes carried in Response PDUs.
pub mod error_code {
    pub const NO_ERROR: u16 = 0;
    pub const GEN_ERR: u16 = 5;
    pub const NOT_WRITABLE: u16 = 17;
    pub const OPEN_FAILED: u16 = 256;
    pub const NOT_OPEN: u16 = 257;
    pub const UNSUPPORTED_CONTEXT: u16 = 262;
    pub const DUPLICATE_REGISTRATION: u16 = 263;
    pub const UNKNOWN_REGISTRATION: u16 = 264;
    pub const PARSE_ERROR: u16 = 266;
    pub const REQUEST_DENIED: u16 = 267;
    pub const PROCESSING_ERROR: u16 = 268;
}

/// Reasons carried in Close PDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Other = 1,
    ParseError = 2,
    ProtocolError = 3,
    Timeouts = 4,
    Shutdown = 5,
    ByManager = 6,
}

impl CloseReason {
    fn from_u8(value: u8) -> Self {
        match value {
            2 => Self::ParseError,
            3 => Self::ProtocolError,
            4 => Self::Timeouts,
            5 => Self::Shutdown,
            6 => Self::ByManager,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    Open = 1,
    Close = 2,
    Register = 3,
    Unregister = 4,
    Get = 5,
    GetNext = 6,
    GetBulk = 7,
    TestSet = 8,
    CommitSet = 9,
    UndoSet = 10,
    CleanupSet = 11,
    Notify = 12,
    Ping = 13,
    IndexAllocate = 14,
    IndexDeallocate = 15,
    AddAgentCaps = 16,
    RemoveAgentCaps = 17,
    Response = 18,
}

impl TryFrom<u8> for PduType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Open,
            2 => Self::Close,
            3 => Self::Register,
            4 => Self::Unregister,
            5 => Self::Get,
            6 => Self::GetNext,
            7 => Self::GetBulk,
            8 => Self::TestSet,
            9 => Self::CommitSet,
            10 => Self::UndoSet,
            11 => Self::CleanupSet,
            12 => Self::Notify,
            13 => Self::Ping,
            14 => Self::IndexAllocate,
            15 => Self::IndexDeallocate,
            16 => Self::AddAgentCaps,
            17 => Self::RemoveAgentCaps,
            18 => Self::Response,
            other => return Err(CodecError::UnknownPduType(other)),
        })
    }
}

mod value_type {
    pub const INTEGER: u16 = 2;
    pub const OCTET_STRING: u16 = 4;
    pub const NULL: u16 = 5;
    pub const OBJECT_IDENTIFIER: u16 = 6;
    pub const IP_ADDRESS: u16 = 64;
    pub const COUNTER32: u16 = 65;
    pub const GAUGE32: u16 = 66;
    pub const TIME_TICKS: u16 = 67;
    pub const OPAQUE: u16 = 68;
    pub const COUNTER64: u16 = 70;
    pub const NO_SUCH_OBJECT: u16 = 128;
    pub const NO_SUCH_INSTANCE: u16 = 129;
    pub const END_OF_MIB_VIEW: u16 = 130;
}

/// Header fields other than version and payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub pdu_type: PduType,
    pub flags: u8,
    pub session_id: u32,
    pub transaction_id: u32,
    pub packet_id: u32,
}

impl Header {
    pub fn new(pdu_type: PduType, session_id: u32, transaction_id: u32, packet_id: u32) -> Self {
        Self {
            pdu_type,
            flags: FLAG_NETWORK_BYTE_ORDER,
            session_id,
            transaction_id,
            packet_id,
        }
    }

    /// Decodes a raw header and returns it with the payload length.
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<(Header, usize), CodecError> {
        if raw[0] != AGENTX_VERSION {
            return Err(CodecError::UnsupportedVersion(i64::from(raw[0])));
        }
        let pdu_type = PduType::try_from(raw[1])?;
        let flags = raw[2];
        let mut rest = &raw[4..];
        let big_endian = flags & FLAG_NETWORK_BYTE_ORDER != 0;
        let mut next = || {
            if big_endian {
                rest.get_u32()
            } else {
                rest.get_u32_le()
            }
        };
        let session_id = next();
        let transaction_id = next();
        let packet_id = next();
        let payload_len = next() as usize;

        if payload_len % 4 != 0 || payload_len > MAX_PAYLOAD_LEN {
            return Err(CodecError::Malformed {
                what: "payload length",
            });
        }

        Ok((
            Header {
                pdu_type,
                flags,
                session_id,
                transaction_id,
                packet_id,
            },
            payload_len,
        ))
    }

    pub fn network_byte_order(&self) -> bool {
        self.flags & FLAG_NETWORK_BYTE_ORDER != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Open {
        timeout: u8,
        id: Oid,
        description: String,
    },
    Close {
        reason: CloseReason,
    },
    Register {
        timeout: u8,
        priority: u8,
        range_subid: u8,
        subtree: Oid,
        upper_bound: Option<u32>,
    },
    Unregister {
        priority: u8,
        range_subid: u8,
        subtree: Oid,
        upper_bound: Option<u32>,
    },
    Get {
        ranges: Vec<SearchRange>,
    },
    GetNext {
        ranges: Vec<SearchRange>,
    },
    GetBulk {
        non_repeaters: u16,
        max_repetitions: u16,
        ranges: Vec<SearchRange>,
    },
    TestSet {
        varbinds: Vec<VarBind>,
    },
    CommitSet,
    UndoSet,
    CleanupSet,
    Notify {
        varbinds: Vec<VarBind>,
    },
    Ping,
    Response {
        sys_uptime: u32,
        error: u16,
        index: u16,
        varbinds: Vec<VarBind>,
    },
    /// Index allocation and agent capabilities PDUs; only the type is kept.
    Unsupported(PduType),
}

impl Pdu {
    pub fn pdu_type(&self) -> PduType {
        match self {
            Pdu::Open { .. } => PduType::Open,
            Pdu::Close { .. } => PduType::Close,
            Pdu::Register { .. } => PduType::Register,
            Pdu::Unregister { .. } => PduType::Unregister,
            Pdu::Get { .. } => PduType::Get,
            Pdu::GetNext { .. } => PduType::GetNext,
            Pdu::GetBulk { .. } => PduType::GetBulk,
            Pdu::TestSet { .. } => PduType::TestSet,
            Pdu::CommitSet => PduType::CommitSet,
            Pdu::UndoSet => PduType::UndoSet,
            Pdu::CleanupSet => PduType::CleanupSet,
            Pdu::Notify { .. } => PduType::Notify,
            Pdu::Ping => PduType::Ping,
            Pdu::Response { .. } => PduType::Response,
            Pdu::Unsupported(t) => *t,
        }
    }

    fn carries_context(pdu_type: PduType) -> bool {
        !matches!(
            pdu_type,
            PduType::Open
                | PduType::Close
                | PduType::Response
                | PduType::CommitSet
                | PduType::UndoSet
                | PduType::CleanupSet
        )
    }
}

/// A complete AgentX message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub context: Option<Vec<u8>>,
    pub pdu: Pdu,
}

impl Packet {
    pub fn new(header: Header, pdu: Pdu) -> Self {
        Self {
            header,
            context: None,
            pdu,
        }
    }

    /// Encodes header and payload in network byte order.
    pub fn encode(&self) -> BytesMut {
        let mut payload = BytesMut::new();
        let context = self
            .context
            .as_ref()
            .filter(|_| Pdu::carries_context(self.pdu.pdu_type()));
        if let Some(context) = context {
            put_octets(&mut payload, context);
        }
        encode_payload(&mut payload, &self.pdu);

        let mut flags = (self.header.flags | FLAG_NETWORK_BYTE_ORDER) & !FLAG_NON_DEFAULT_CONTEXT;
        if context.is_some() {
            flags |= FLAG_NON_DEFAULT_CONTEXT;
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(AGENTX_VERSION);
        buf.put_u8(self.pdu.pdu_type() as u8);
        buf.put_u8(flags);
        buf.put_u8(0);
        buf.put_u32(self.header.session_id);
        buf.put_u32(self.header.transaction_id);
        buf.put_u32(self.header.packet_id);
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        buf
    }

    /// Decodes the payload that followed `header`.
    pub fn decode(header: Header, payload: &[u8]) -> Result<Packet, CodecError> {
        let mut reader = Reader::new(payload, header.network_byte_order());

        let context = if header.flags & FLAG_NON_DEFAULT_CONTEXT != 0
            && Pdu::carries_context(header.pdu_type)
        {
            Some(reader.octets()?)
        } else {
            None
        };

        let pdu = match header.pdu_type {
            PduType::Open => {
                let timeout = reader.u8()?;
                reader.skip(3)?;
                let (id, _) = reader.oid()?;
                let description = String::from_utf8_lossy(&reader.octets()?).into_owned();
                Pdu::Open {
                    timeout,
                    id,
                    description,
                }
            }
            PduType::Close => {
                let reason = CloseReason::from_u8(reader.u8()?);
                reader.skip(3)?;
                Pdu::Close { reason }
            }
            PduType::Register => {
                let timeout = reader.u8()?;
                let priority = reader.u8()?;
                let range_subid = reader.u8()?;
                reader.skip(1)?;
                let (subtree, _) = reader.oid()?;
                let upper_bound = if range_subid != 0 {
                    Some(reader.u32()?)
                } else {
                    None
                };
                Pdu::Register {
                    timeout,
                    priority,
                    range_subid,
                    subtree,
                    upper_bound,
                }
            }
            PduType::Unregister => {
                reader.skip(1)?;
                let priority = reader.u8()?;
                let range_subid = reader.u8()?;
                reader.skip(1)?;
                let (subtree, _) = reader.oid()?;
                let upper_bound = if range_subid != 0 {
                    Some(reader.u32()?)
                } else {
                    None
                };
                Pdu::Unregister {
                    priority,
                    range_subid,
                    subtree,
                    upper_bound,
                }
            }
            PduType::Get => Pdu::Get {
                ranges: reader.search_ranges()?,
            },
            PduType::GetNext => Pdu::GetNext {
                ranges: reader.search_ranges()?,
            },
            PduType::GetBulk => {
                let non_repeaters = reader.u16()?;
                let max_repetitions = reader.u16()?;
                Pdu::GetBulk {
                    non_repeaters,
                    max_repetitions,
                    ranges: reader.search_ranges()?,
                }
            }
            PduType::TestSet => Pdu::TestSet {
                varbinds: reader.varbinds()?,
            },
            PduType::CommitSet => Pdu::CommitSet,
            PduType::UndoSet => Pdu::UndoSet,
            PduType::CleanupSet => Pdu::CleanupSet,
            PduType::Notify => Pdu::Notify {
                varbinds: reader.varbinds()?,
            },
            PduType::Ping => Pdu::Ping,
            PduType::Response => {
                let sys_uptime = reader.u32()?;
                let error = reader.u16()?;
                let index = reader.u16()?;
                Pdu::Response {
                    sys_uptime,
                    error,
                    index,
                    varbinds: reader.varbinds()?,
                }
            }
            other @ (PduType::IndexAllocate
            | PduType::IndexDeallocate
            | PduType::AddAgentCaps
            | PduType::RemoveAgentCaps) => Pdu::Unsupported(other),
        };

        Ok(Packet {
            header,
            context,
            pdu,
        })
    }
}

fn encode_payload(buf: &mut BytesMut, pdu: &Pdu) {
    match pdu {
        Pdu::Open {
            timeout,
            id,
            description,
        } => {
            buf.put_u8(*timeout);
            buf.put_bytes(0, 3);
            put_oid(buf, id, false);
            put_octets(buf, description.as_bytes());
        }
        Pdu::Close { reason } => {
            buf.put_u8(*reason as u8);
            buf.put_bytes(0, 3);
        }
        Pdu::Register {
            timeout,
            priority,
            range_subid,
            subtree,
            upper_bound,
        } => {
            buf.put_u8(*timeout);
            buf.put_u8(*priority);
            buf.put_u8(*range_subid);
            buf.put_u8(0);
            put_oid(buf, subtree, false);
            if let (true, Some(bound)) = (*range_subid != 0, upper_bound) {
                buf.put_u32(*bound);
            }
        }
        Pdu::Unregister {
            priority,
            range_subid,
            subtree,
            upper_bound,
        } => {
            buf.put_u8(0);
            buf.put_u8(*priority);
            buf.put_u8(*range_subid);
            buf.put_u8(0);
            put_oid(buf, subtree, false);
            if let (true, Some(bound)) = (*range_subid != 0, upper_bound) {
                buf.put_u32(*bound);
            }
        }
        Pdu::Get { ranges } | Pdu::GetNext { ranges } => put_search_ranges(buf, ranges),
        Pdu::GetBulk {
            non_repeaters,
            max_repetitions,
            ranges,
        } => {
            buf.put_u16(*non_repeaters);
            buf.put_u16(*max_repetitions);
            put_search_ranges(buf, ranges);
        }
        Pdu::TestSet { varbinds } | Pdu::Notify { varbinds } => {
            for varbind in varbinds {
                put_varbind(buf, varbind);
            }
        }
        Pdu::Response {
            sys_uptime,
            error,
            index,
            varbinds,
        } => {
            buf.put_u32(*sys_uptime);
            buf.put_u16(*error);
            buf.put_u16(*index);
            for varbind in varbinds {
                put_varbind(buf, varbind);
            }
        }
        Pdu::CommitSet | Pdu::UndoSet | Pdu::CleanupSet | Pdu::Ping | Pdu::Unsupported(_) => {}
    }
}

fn put_oid(buf: &mut BytesMut, oid: &Oid, include: bool) {
    let subids = oid.as_slice();
    let (prefix, rest) = match subids {
        [1, 3, 6, 1, p, rest @ ..] if (1..=255).contains(p) => (*p as u8, rest),
        _ => (0u8, subids),
    };
    debug_assert!(rest.len() <= 128, "AgentX OIDs hold at most 128 sub-identifiers");
    buf.put_u8(rest.len().min(u8::MAX as usize) as u8);
    buf.put_u8(prefix);
    buf.put_u8(u8::from(include));
    buf.put_u8(0);
    for subid in rest {
        buf.put_u32(*subid);
    }
}

fn put_octets(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(data);
    let padding = (4 - data.len() % 4) % 4;
    buf.put_bytes(0, padding);
}

fn put_search_ranges(buf: &mut BytesMut, ranges: &[SearchRange]) {
    for range in ranges {
        put_oid(buf, &range.start, range.include);
        put_oid(buf, range.end.as_ref().unwrap_or(&Oid::default()), false);
    }
}

fn put_varbind(buf: &mut BytesMut, varbind: &VarBind) {
    use value_type::*;

    let kind = match &varbind.value {
        Value::Integer(_) => INTEGER,
        Value::OctetString(_) => OCTET_STRING,
        Value::Null => NULL,
        Value::ObjectIdentifier(_) => OBJECT_IDENTIFIER,
        Value::IpAddress(_) => IP_ADDRESS,
        Value::Counter32(_) => COUNTER32,
        Value::Gauge32(_) => GAUGE32,
        Value::TimeTicks(_) => TIME_TICKS,
        Value::Opaque(_) => OPAQUE,
        Value::Counter64(_) => COUNTER64,
        Value::NoSuchObject => NO_SUCH_OBJECT,
        Value::NoSuchInstance => NO_SUCH_INSTANCE,
        Value::EndOfMibView => END_OF_MIB_VIEW,
    };
    buf.put_u16(kind);
    buf.put_u16(0);
    put_oid(buf, &varbind.oid, false);

    match &varbind.value {
        Value::Integer(v) => buf.put_i32(*v),
        Value::OctetString(data) | Value::Opaque(data) => put_octets(buf, data),
        Value::ObjectIdentifier(oid) => put_oid(buf, oid, false),
        Value::IpAddress(addr) => put_octets(buf, addr),
        Value::Counter32(v) | Value::Gauge32(v) | Value::TimeTicks(v) => buf.put_u32(*v),
        Value::Counter64(v) => buf.put_u64(*v),
        Value::Null | Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView => {}
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    big_endian: bool,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], big_endian: bool) -> Self {
        Self { buf, big_endian }
    }

    fn need(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(if self.big_endian {
            self.buf.get_u16()
        } else {
            self.buf.get_u16_le()
        })
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(if self.big_endian {
            self.buf.get_u32()
        } else {
            self.buf.get_u32_le()
        })
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(if self.big_endian {
            self.buf.get_u64()
        } else {
            self.buf.get_u64_le()
        })
    }

    /// Returns the OID and its include flag.
    fn oid(&mut self) -> Result<(Oid, bool), CodecError> {
        let n_subid = self.u8()? as usize;
        let prefix = self.u8()?;
        let include = self.u8()? != 0;
        self.skip(1)?;

        let mut subids = Vec::with_capacity(n_subid + 5);
        if prefix != 0 {
            subids.extend_from_slice(&INTERNET_PREFIX);
            subids.push(u32::from(prefix));
        }
        for _ in 0..n_subid {
            subids.push(self.u32()?);
        }
        Ok((Oid::new(subids), include))
    }

    fn octets(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()? as usize;
        let padded = len
            .checked_add((4 - len % 4) % 4)
            .ok_or(CodecError::Malformed {
                what: "octet string length",
            })?;
        self.need(padded)?;
        let data = self.buf[..len].to_vec();
        self.buf.advance(padded);
        Ok(data)
    }

    fn search_ranges(&mut self) -> Result<Vec<SearchRange>, CodecError> {
        let mut ranges = Vec::new();
        while !self.is_empty() {
            let (start, include) = self.oid()?;
            let (end, _) = self.oid()?;
            ranges.push(SearchRange {
                start,
                include,
                end: if end.is_empty() { None } else { Some(end) },
            });
        }
        Ok(ranges)
    }

    fn varbinds(&mut self) -> Result<Vec<VarBind>, CodecError> {
        use value_type::*;

        let mut varbinds = Vec::new();
        while !self.is_empty() {
            let kind = self.u16()?;
            self.skip(2)?;
            let (oid, _) = self.oid()?;
            let value = match kind {
                INTEGER => Value::Integer(self.u32()? as i32),
                OCTET_STRING => Value::OctetString(self.octets()?),
                NULL => Value::Null,
                OBJECT_IDENTIFIER => Value::ObjectIdentifier(self.oid()?.0),
                IP_ADDRESS => {
                    let raw = self.octets()?;
                    let addr: [u8; 4] = raw.as_slice().try_into().map_err(|_| {
                        CodecError::Malformed {
                            what: "IpAddress value",
                        }
                    })?;
                    Value::IpAddress(addr)
                }
                COUNTER32 => Value::Counter32(self.u32()?),
                GAUGE32 => Value::Gauge32(self.u32()?),
                TIME_TICKS => Value::TimeTicks(self.u32()?),
                OPAQUE => Value::Opaque(self.octets()?),
                COUNTER64 => Value::Counter64(self.u64()?),
                NO_SUCH_OBJECT => Value::NoSuchObject,
                NO_SUCH_INSTANCE => Value::NoSuchInstance,
                END_OF_MIB_VIEW => Value::EndOfMibView,
                other => return Err(CodecError::UnknownValueType(other)),
            };
            varbinds.push(VarBind::new(oid, value));
        }
        Ok(varbinds)
    }
}
