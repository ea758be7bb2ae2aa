use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod call;
pub mod chat;

pub const PROTOCOL_VERSION: u16 = 1;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
pub const MAX_CONTROL_JSON_LEN: usize = 256 * 1024;
pub const MAX_SEQUENCE: u64 = u32::MAX as u64;

/// Discriminates every frame exchanged over a hub connection.
///
/// The first inbound frame on a fresh connection must be `Hello`;
/// `Status`, `Receipt` and `Error` only ever travel hub to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Text = 0x02,
    Media = 0x03,
    Typing = 0x04,
    Read = 0x05,
    Status = 0x06,
    Receipt = 0x07,
    CallOffer = 0x08,
    CallAnswer = 0x09,
    IceCandidate = 0x0a,
    CallEnd = 0x0b,
    Error = 0x0c,
}

impl FrameType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Text),
            0x03 => Some(Self::Media),
            0x04 => Some(Self::Typing),
            0x05 => Some(Self::Read),
            0x06 => Some(Self::Status),
            0x07 => Some(Self::Receipt),
            0x08 => Some(Self::CallOffer),
            0x09 => Some(Self::CallAnswer),
            0x0a => Some(Self::IceCandidate),
            0x0b => Some(Self::CallEnd),
            0x0c => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    InvalidFrameType,
    InvalidControlJson,
    UnexpectedEof,
    VarintOverflow,
    FrameTooLarge,
    ControlTooLarge,
    SequenceTooLarge,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFrameType => write!(f, "unknown frame type"),
            Self::InvalidControlJson => write!(f, "control payload is not valid json"),
            Self::UnexpectedEof => write!(f, "frame truncated"),
            Self::VarintOverflow => write!(f, "varint too long"),
            Self::FrameTooLarge => write!(f, "frame length exceeds limit"),
            Self::ControlTooLarge => write!(f, "control payload exceeds limit"),
            Self::SequenceTooLarge => write!(f, "sequence exceeds limit"),
        }
    }
}

impl Error for CodecError {}

/// JSON control payload carried by every frame. Typed views live in
/// [`chat`] and [`call`] and convert through `TryFrom`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlEnvelope {
    pub properties: serde_json::Value,
}

/// One wire frame: outer varint length, then a body of type byte,
/// varint sequence, varint payload length and the JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u64,
    pub frame_type: FrameType,
    pub payload: ControlEnvelope,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.sequence > MAX_SEQUENCE {
            return Err(CodecError::SequenceTooLarge);
        }
        let control =
            serde_json::to_vec(&self.payload).map_err(|_| CodecError::InvalidControlJson)?;
        if control.len() > MAX_CONTROL_JSON_LEN {
            return Err(CodecError::ControlTooLarge);
        }
        let mut body = Vec::with_capacity(control.len() + 12);
        body.push(self.frame_type as u8);
        put_varint(&mut body, self.sequence);
        put_varint(&mut body, control.len() as u64);
        body.extend_from_slice(&control);
        if body.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        let mut out = Vec::with_capacity(body.len() + 5);
        put_varint(&mut out, body.len() as u64);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes one frame from the front of `buffer`, returning it and
    /// the number of bytes consumed.
    pub fn decode(buffer: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut outer = Reader::new(buffer);
        let body_len =
            usize::try_from(outer.varint()?).map_err(|_| CodecError::FrameTooLarge)?;
        if body_len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        let body = outer.take(body_len)?;
        if body.is_empty() {
            return Err(CodecError::UnexpectedEof);
        }
        let mut reader = Reader::new(body);
        let frame_type =
            FrameType::from_u8(reader.byte()?).ok_or(CodecError::InvalidFrameType)?;
        let sequence = reader.varint()?;
        if sequence > MAX_SEQUENCE {
            return Err(CodecError::SequenceTooLarge);
        }
        let control_len =
            usize::try_from(reader.varint()?).map_err(|_| CodecError::ControlTooLarge)?;
        if control_len > MAX_CONTROL_JSON_LEN {
            return Err(CodecError::ControlTooLarge);
        }
        let control = reader.take(control_len)?;
        let payload = serde_json::from_slice::<ControlEnvelope>(control)
            .map_err(|_| CodecError::InvalidControlJson)?;
        Ok((
            Frame {
                sequence,
                frame_type,
                payload,
            },
            outer.consumed(),
        ))
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, CodecError> {
        let value = *self.buf.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(value)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64, CodecError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.byte()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(CodecError::VarintOverflow);
            }
        }
    }

    fn consumed(&self) -> usize {
        self.pos
    }
}

fn put_varint(buffer: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buffer.push(byte);
            return;
        }
        buffer.push(byte | 0x80);
    }
}

pub(crate) fn encode_control<T: Serialize>(value: T) -> Result<ControlEnvelope, CodecError> {
    serde_json::to_value(value)
        .map(|properties| ControlEnvelope { properties })
        .map_err(|_| CodecError::InvalidControlJson)
}

pub(crate) fn decode_control<T: serde::de::DeserializeOwned>(
    envelope: &ControlEnvelope,
) -> Result<T, CodecError> {
    serde_json::from_value(envelope.properties.clone()).map_err(|_| CodecError::InvalidControlJson)
}

macro_rules! impl_control_codec {
    ($ty:ty) => {
        impl TryFrom<$ty> for $crate::ControlEnvelope {
            type Error = $crate::CodecError;

            fn try_from(value: $ty) -> Result<Self, Self::Error> {
                $crate::encode_control(value)
            }
        }

        impl TryFrom<&$ty> for $crate::ControlEnvelope {
            type Error = $crate::CodecError;

            fn try_from(value: &$ty) -> Result<Self, Self::Error> {
                $crate::encode_control(value)
            }
        }

        impl TryFrom<&$crate::ControlEnvelope> for $ty {
            type Error = $crate::CodecError;

            fn try_from(envelope: &$crate::ControlEnvelope) -> Result<Self, Self::Error> {
                $crate::decode_control::<$ty>(envelope)
            }
        }
    };
}

pub(crate) use impl_control_codec;
