//! The request/response wire envelope (spec §6): a length-delimited record
//! of tagged fields carried inside a 4-byte big-endian length frame.
//!
//! Field layout:
//!
//! | tag | field | wire type |
//! |---|---|---|
//! | 1 | requestIdHigh | fixed u64 |
//! | 2 | requestIdLow | fixed u64 |
//! | 3 | messageName | length-prefixed string |
//! | 4 | status | u8 enum |
//! | 5 | payload | length-prefixed bytes |
//! | 6 | errorMessage | length-prefixed string, present iff status=ERROR |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

const TAG_REQUEST_ID_HIGH: u8 = 1;
const TAG_REQUEST_ID_LOW: u8 = 2;
const TAG_MESSAGE_NAME: u8 = 3;
const TAG_STATUS: u8 = 4;
const TAG_PAYLOAD: u8 = 5;
const TAG_ERROR_MESSAGE: u8 = 6;

/// Outcome status carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Error = 1,
    Heartbeat = 2,
}

impl Status {
    fn from_u8(v: u8) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Error),
            2 => Ok(Status::Heartbeat),
            other => Err(DecodeError::InvalidStatus(other)),
        }
    }
}

/// A 128-bit request id, carried on the wire as two u64 halves and echoed
/// unchanged from request to response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    pub high: u64,
    pub low: u64,
}

impl RequestId {
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    pub fn as_u128(self) -> u128 {
        ((self.high as u128) << 64) | self.low as u128
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

/// Decoded request/response envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub request_id: RequestId,
    pub message_name: String,
    pub status: Status,
    pub payload: Bytes,
    pub error_message: Option<String>,
}

impl Envelope {
    pub fn request(request_id: RequestId, message_name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            request_id,
            message_name: message_name.into(),
            status: Status::Ok,
            payload,
            error_message: None,
        }
    }

    pub fn ok_response(request_id: RequestId, message_name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            request_id,
            message_name: message_name.into(),
            status: Status::Ok,
            payload,
            error_message: None,
        }
    }

    pub fn error_response(
        request_id: RequestId,
        message_name: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            message_name: message_name.into(),
            status: Status::Error,
            payload: Bytes::new(),
            error_message: Some(error_message.into()),
        }
    }

    /// Encode the envelope's tagged-field body (without the 4-byte length
    /// prefix — that is the job of `codec::FrameCodec`).
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(TAG_REQUEST_ID_HIGH);
        out.put_u64(self.request_id.high);

        out.put_u8(TAG_REQUEST_ID_LOW);
        out.put_u64(self.request_id.low);

        out.put_u8(TAG_MESSAGE_NAME);
        put_len_prefixed_str(out, &self.message_name);

        out.put_u8(TAG_STATUS);
        out.put_u8(self.status as u8);

        out.put_u8(TAG_PAYLOAD);
        put_len_prefixed_bytes(out, &self.payload);

        if let Some(msg) = &self.error_message {
            out.put_u8(TAG_ERROR_MESSAGE);
            put_len_prefixed_str(out, msg);
        }
    }

    /// Decode a complete envelope body (the bytes inside one length frame).
    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        let mut request_id_high = None;
        let mut request_id_low = None;
        let mut message_name = None;
        let mut status = None;
        let mut payload = None;
        let mut error_message = None;

        while buf.has_remaining() {
            if buf.remaining() < 1 {
                return Err(DecodeError::Truncated);
            }
            let tag = buf.get_u8();
            match tag {
                TAG_REQUEST_ID_HIGH => {
                    require(&buf, 8)?;
                    request_id_high = Some(buf.get_u64());
                }
                TAG_REQUEST_ID_LOW => {
                    require(&buf, 8)?;
                    request_id_low = Some(buf.get_u64());
                }
                TAG_MESSAGE_NAME => {
                    message_name = Some(get_len_prefixed_str(&mut buf)?);
                }
                TAG_STATUS => {
                    require(&buf, 1)?;
                    status = Some(Status::from_u8(buf.get_u8())?);
                }
                TAG_PAYLOAD => {
                    payload = Some(get_len_prefixed_bytes(&mut buf)?);
                }
                TAG_ERROR_MESSAGE => {
                    error_message = Some(get_len_prefixed_str(&mut buf)?);
                }
                other => return Err(DecodeError::UnknownTag(other)),
            }
        }

        let status = status.ok_or(DecodeError::MissingField("status"))?;
        if status == Status::Error && error_message.is_none() {
            return Err(DecodeError::MissingField("errorMessage"));
        }

        Ok(Envelope {
            request_id: RequestId::new(
                request_id_high.ok_or(DecodeError::MissingField("requestIdHigh"))?,
                request_id_low.ok_or(DecodeError::MissingField("requestIdLow"))?,
            ),
            message_name: message_name.ok_or(DecodeError::MissingField("messageName"))?,
            status,
            payload: payload.unwrap_or_default(),
            error_message,
        })
    }
}

fn require(buf: &Bytes, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        Err(DecodeError::Truncated)
    } else {
        Ok(())
    }
}

fn put_len_prefixed_str(out: &mut BytesMut, s: &str) {
    out.put_u32(s.len() as u32);
    out.put_slice(s.as_bytes());
}

fn put_len_prefixed_bytes(out: &mut BytesMut, b: &[u8]) {
    out.put_u32(b.len() as u32);
    out.put_slice(b);
}

fn get_len_prefixed_str(buf: &mut Bytes) -> Result<String, DecodeError> {
    let bytes = get_len_prefixed_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

fn get_len_prefixed_bytes(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    require(buf, 4)?;
    let len = buf.get_u32() as usize;
    require(buf, len)?;
    Ok(buf.split_to(len))
}

/// Errors decoding an envelope body. Distinct from `crate::error::Error`
/// because decode failures are a wire-protocol concern, not an RPC-level
/// outcome — a pipeline stage converts these into a connection close.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("envelope body truncated")]
    Truncated,
    #[error("unknown field tag {0}")]
    UnknownTag(u8),
    #[error("invalid status byte {0}")]
    InvalidStatus(u8),
    #[error("field is not valid UTF-8")]
    InvalidUtf8,
    #[error("missing required field {0}")]
    MissingField(&'static str),
}
