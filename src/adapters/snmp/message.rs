use crate::adapters::snmp::ber::{self, tag, Decoder};
use crate::domain::model::{Oid, Value, VarBind};
use crate::utils::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1 = 0,
    V2c = 1,
}

pub mod pdu_tag {
    pub const GET_REQUEST: u8 = 0xa0;
    pub const GET_NEXT_REQUEST: u8 = 0xa1;
    pub const RESPONSE: u8 = 0xa2;
    pub const SET_REQUEST: u8 = 0xa3;
    pub const GET_BULK_REQUEST: u8 = 0xa5;
}

pub mod error_status {
    pub const NO_ERROR: i32 = 0;
    pub const TOO_BIG: i32 = 1;
    pub const NO_SUCH_NAME: i32 = 2;
    pub const GEN_ERR: i32 = 5;
    pub const NOT_WRITABLE: i32 = 17;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduKind {
    Get,
    GetNext,
    GetBulk,
    Set,
    Response,
    /// Traps, informs and reports; the agent ignores them.
    Other(u8),
}

impl PduKind {
    fn from_tag(t: u8) -> Self {
        match t {
            pdu_tag::GET_REQUEST => Self::Get,
            pdu_tag::GET_NEXT_REQUEST => Self::GetNext,
            pdu_tag::GET_BULK_REQUEST => Self::GetBulk,
            pdu_tag::SET_REQUEST => Self::Set,
            pdu_tag::RESPONSE => Self::Response,
            other => Self::Other(other),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Get => pdu_tag::GET_REQUEST,
            Self::GetNext => pdu_tag::GET_NEXT_REQUEST,
            Self::GetBulk => pdu_tag::GET_BULK_REQUEST,
            Self::Set => pdu_tag::SET_REQUEST,
            Self::Response => pdu_tag::RESPONSE,
            Self::Other(t) => t,
        }
    }
}

/// A request/response PDU. For GetBulk, `error_status` and `error_index`
/// carry non-repeaters and max-repetitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpPdu {
    pub kind: PduKind,
    pub request_id: i32,
    pub error_status: i32,
    pub error_index: i32,
    pub varbinds: Vec<VarBind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: Version,
    pub community: Vec<u8>,
    pub pdu: SnmpPdu,
}

impl Message {
    pub fn decode(data: &[u8]) -> Result<Message, CodecError> {
        let mut outer = Decoder::new(data).sequence()?;
        let version = match outer.integer()? {
            0 => Version::V1,
            1 => Version::V2c,
            other => return Err(CodecError::UnsupportedVersion(other)),
        };
        let community = outer.octet_string()?;

        let (t, content) = outer.any()?;
        let mut pdu = Decoder::new(content);
        let as_i32 = |v: i64| {
            i32::try_from(v).map_err(|_| CodecError::Malformed {
                what: "PDU header field",
            })
        };
        let request_id = as_i32(pdu.integer()?)?;
        let error_status = as_i32(pdu.integer()?)?;
        let error_index = as_i32(pdu.integer()?)?;

        let mut list = pdu.sequence()?;
        let mut varbinds = Vec::new();
        while !list.is_empty() {
            let mut vb = list.sequence()?;
            let oid = vb.oid()?;
            let value = vb.value()?;
            varbinds.push(VarBind::new(oid, value));
        }

        Ok(Message {
            version,
            community,
            pdu: SnmpPdu {
                kind: PduKind::from_tag(t),
                request_id,
                error_status,
                error_index,
                varbinds,
            },
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        ber::put_constructed(&mut out, tag::SEQUENCE, |msg| {
            ber::put_integer(msg, tag::INTEGER, self.version as i64);
            ber::put_tlv(msg, tag::OCTET_STRING, &self.community);
            ber::put_constructed(msg, self.pdu.kind.tag(), |pdu| {
                ber::put_integer(pdu, tag::INTEGER, i64::from(self.pdu.request_id));
                ber::put_integer(pdu, tag::INTEGER, i64::from(self.pdu.error_status));
                ber::put_integer(pdu, tag::INTEGER, i64::from(self.pdu.error_index));
                ber::put_constructed(pdu, tag::SEQUENCE, |list| {
                    for varbind in &self.pdu.varbinds {
                        ber::put_constructed(list, tag::SEQUENCE, |vb| {
                            ber::put_oid(vb, &varbind.oid);
                            ber::put_value(vb, &varbind.value);
                        });
                    }
                });
            });
        });
        out
    }

    /// Bytes `varbind` adds to the varbind list of an encoded message.
    pub fn varbind_len(varbind: &VarBind) -> usize {
        let mut out = Vec::new();
        ber::put_constructed(&mut out, tag::SEQUENCE, |vb| {
            ber::put_oid(vb, &varbind.oid);
            ber::put_value(vb, &varbind.value);
        });
        out.len()
    }

    /// A request carrying `oids` with Null values.
    pub fn request(
        version: Version,
        community: &str,
        kind: PduKind,
        request_id: i32,
        oids: &[Oid],
    ) -> Message {
        Message {
            version,
            community: community.as_bytes().to_vec(),
            pdu: SnmpPdu {
                kind,
                request_id,
                error_status: 0,
                error_index: 0,
                varbinds: oids
                    .iter()
                    .map(|oid| VarBind::new(oid.clone(), Value::Null))
                    .collect(),
            },
        }
    }

    /// A Response to `self` with the given error and varbinds.
    pub fn reply(&self, error_status: i32, error_index: i32, varbinds: Vec<VarBind>) -> Message {
        Message {
            version: self.version,
            community: self.community.clone(),
            pdu: SnmpPdu {
                kind: PduKind::Response,
                request_id: self.pdu.request_id,
                error_status,
                error_index,
                varbinds,
            },
        }
    }
}
