//! RFC 6455 frame codec.
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use monoio_codec::{Decoded, Decoder, Encoder};

pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Whether a peer may put `code` on the wire.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WebSocketError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("client frame is not masked")]
    UnmaskedFrame,
    #[error("control frame is fragmented")]
    FragmentedControl,
    #[error("control frame payload of {0} bytes")]
    ControlTooLong(usize),
    #[error("message exceeds {0} bytes")]
    MessageTooBig(usize),
    #[error("text payload is not utf-8")]
    InvalidUtf8,
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new data frame while a fragmented message is in progress")]
    ExpectedContinuation,
    #[error("invalid close frame payload")]
    InvalidClosePayload,
    #[error("io error: {0:?}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for WebSocketError {
    fn from(e: io::Error) -> Self {
        WebSocketError::Io(e.kind())
    }
}

impl WebSocketError {
    /// Close code sent to the peer before the connection is dropped.
    pub fn close_code(&self) -> u16 {
        match self {
            WebSocketError::InvalidUtf8 => close_code::INVALID_PAYLOAD,
            WebSocketError::MessageTooBig(_) => close_code::MESSAGE_TOO_BIG,
            WebSocketError::Io(_) => close_code::INTERNAL_ERROR,
            _ => close_code::PROTOCOL_ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    #[inline]
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(true, OpCode::Text, text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, data)
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, data)
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, data)
    }

    /// Close frame. A `None` code sends an empty payload. The reason is
    /// truncated on a char boundary to fit a control frame.
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let Some(code) = code else {
            return Self::new(true, OpCode::Close, Bytes::new());
        };
        let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        let mut payload = BytesMut::with_capacity(2 + end);
        payload.put_u16(code);
        payload.put_slice(&reason.as_bytes()[..end]);
        Self::new(true, OpCode::Close, payload.freeze())
    }

    /// Server-to-client encoding, never masked.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 10);
        self.write_to(&mut buf, None);
        buf.freeze()
    }

    /// Client-to-server encoding with the given masking key.
    pub fn encode_masked(&self, key: [u8; 4]) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 14);
        self.write_to(&mut buf, Some(key));
        buf.freeze()
    }

    fn write_to(&self, buf: &mut BytesMut, mask: Option<[u8; 4]>) {
        let fin = if self.fin { 0x80 } else { 0 };
        buf.put_u8(fin | self.opcode.as_u8());
        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();
        if len < 126 {
            buf.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(len as u64);
        }
        match mask {
            Some(key) => {
                buf.put_slice(&key);
                let start = buf.len();
                buf.put_slice(&self.payload);
                apply_mask(&mut buf[start..], key);
            }
            None => buf.put_slice(&self.payload),
        }
    }
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= key[i & 3];
    }
}

/// Frame decoder. Server side rejects unmasked frames, client side accepts
/// them.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_payload: usize,
    require_mask: bool,
}

impl FrameDecoder {
    /// Decodes frames sent by a client.
    pub fn server(max_payload: usize) -> Self {
        Self {
            max_payload,
            require_mask: true,
        }
    }

    /// Decodes frames sent by a server.
    pub fn client(max_payload: usize) -> Self {
        Self {
            max_payload,
            require_mask: false,
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Takes one complete frame off the front of `buf`, leaving `buf`
    /// untouched while the frame is incomplete.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded<Frame>, WebSocketError> {
        if buf.len() < 2 {
            return Ok(Decoded::Insufficient);
        }
        let (b0, b1) = (buf[0], buf[1]);
        if b0 & 0x70 != 0 {
            return Err(WebSocketError::ReservedBits);
        }
        let fin = b0 & 0x80 != 0;
        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(WebSocketError::UnknownOpcode(b0 & 0x0F))?;
        let masked = b1 & 0x80 != 0;
        if self.require_mask && !masked {
            return Err(WebSocketError::UnmaskedFrame);
        }

        let (len, mut header) = match b1 & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(Decoded::Insufficient);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(Decoded::Insufficient);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (n as u64, 2),
        };
        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::FragmentedControl);
            }
            if len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(WebSocketError::ControlTooLong(len as usize));
            }
        }
        if len > self.max_payload as u64 {
            return Err(WebSocketError::MessageTooBig(self.max_payload));
        }
        let len = len as usize;

        let key = if masked {
            if buf.len() < header + 4 {
                return Ok(Decoded::Insufficient);
            }
            let key = [buf[header], buf[header + 1], buf[header + 2], buf[header + 3]];
            header += 4;
            Some(key)
        } else {
            None
        };
        if buf.len() < header + len {
            return Ok(Decoded::Insufficient);
        }

        buf.advance(header);
        let mut payload = buf.split_to(len);
        if let Some(key) = key {
            apply_mask(&mut payload, key);
        }
        Ok(Decoded::Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

/// Frame encoder; server frames go out unmasked.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder {
    mask: Option<[u8; 4]>,
}

impl FrameEncoder {
    pub fn masked(key: [u8; 4]) -> Self {
        Self { mask: Some(key) }
    }
}

impl Encoder<Frame> for FrameEncoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WebSocketError> {
        dst.reserve(frame.payload.len() + 14);
        frame.write_to(dst, self.mask);
        Ok(())
    }
}
