use bytes::{Buf, Bytes, BytesMut};

use super::frame::{close_code, Frame, OpCode, WebSocketError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// What a single inbound frame amounts to once fragments are accounted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A fragment was buffered.
    Pending,
    Message(Message),
    Ping(Bytes),
    Pong(Bytes),
    /// Peer close with its code (`None` when the payload was empty).
    Close(Option<u16>, String),
}

/// Reassembles fragmented data messages and validates their payloads.
#[derive(Debug)]
pub struct MessageAssembler {
    max_message: usize,
    partial: Option<(OpCode, BytesMut)>,
}

impl MessageAssembler {
    pub fn new(max_message: usize) -> Self {
        Self {
            max_message,
            partial: None,
        }
    }

    pub fn push(&mut self, frame: Frame) -> Result<Inbound, WebSocketError> {
        match frame.opcode {
            OpCode::Ping => Ok(Inbound::Ping(frame.payload)),
            OpCode::Pong => Ok(Inbound::Pong(frame.payload)),
            OpCode::Close => parse_close(frame.payload),
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Err(WebSocketError::ExpectedContinuation);
                }
                if frame.fin {
                    return finish(frame.opcode, frame.payload);
                }
                self.partial = Some((frame.opcode, BytesMut::from(frame.payload.as_ref())));
                Ok(Inbound::Pending)
            }
            OpCode::Continuation => {
                let Some((_, buffered)) = self.partial.as_mut() else {
                    return Err(WebSocketError::UnexpectedContinuation);
                };
                if buffered.len() + frame.payload.len() > self.max_message {
                    return Err(WebSocketError::MessageTooBig(self.max_message));
                }
                buffered.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(Inbound::Pending);
                }
                match self.partial.take() {
                    Some((opcode, buffered)) => finish(opcode, buffered.freeze()),
                    None => Err(WebSocketError::UnexpectedContinuation),
                }
            }
        }
    }
}

fn finish(opcode: OpCode, payload: Bytes) -> Result<Inbound, WebSocketError> {
    let message = if opcode == OpCode::Text {
        let text = String::from_utf8(payload.to_vec()).map_err(|_| WebSocketError::InvalidUtf8)?;
        Message::Text(text)
    } else {
        Message::Binary(payload)
    };
    Ok(Inbound::Message(message))
}

fn parse_close(mut payload: Bytes) -> Result<Inbound, WebSocketError> {
    match payload.len() {
        0 => Ok(Inbound::Close(None, String::new())),
        1 => Err(WebSocketError::InvalidClosePayload),
        _ => {
            let code = payload.get_u16();
            if !close_code::is_sendable(code) {
                return Err(WebSocketError::InvalidClosePayload);
            }
            let reason =
                String::from_utf8(payload.to_vec()).map_err(|_| WebSocketError::InvalidUtf8)?;
            Ok(Inbound::Close(Some(code), reason))
        }
    }
}
