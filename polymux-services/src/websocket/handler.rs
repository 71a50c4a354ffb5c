use std::{collections::VecDeque, fmt, sync::Arc};

use async_channel::{Receiver, Sender};
use bytes::{Buf, Bytes, BytesMut};
use http::StatusCode;
use monoio_codec::{Decoded, Decoder, Encoder};
use polymux_core::{
    config::{HttpConfig, WebSocketConfig, PROTOCOL_WEBSOCKET},
    mapping::{PathMapping, PathParams},
    AnyError, AnyResult, ChannelAction, IoHandler, Notifier, SessionContext, SessionId,
};
use tracing::{debug, warn};

use super::{
    frame::{close_code, Frame, FrameDecoder, FrameEncoder, OpCode, WebSocketError},
    handshake,
    message::{Inbound, Message, MessageAssembler},
};
use crate::http::{peek_request_head, HttpError, HttpResponse};

/// Application side of a WebSocket route. One instance serves every
/// connection on its path; per-connection state hangs off the
/// [`WebSocketSession`] handed to `on_open`.
pub trait WebSocketEndpoint: Send + Sync + 'static {
    fn on_open(&self, _session: &WebSocketSession, _params: &PathParams) {}

    fn on_message(&self, session: &WebSocketSession, message: Message);

    /// Called once per connection. `1006` means the peer vanished without a
    /// close frame.
    fn on_close(&self, _session: &WebSocketSession, _code: u16, _reason: &str) {}
}

/// Sending half of a WebSocket connection. Cheap to clone and usable from
/// any thread; sends after the connection ended return `false`.
#[derive(Clone)]
pub struct WebSocketSession {
    id: SessionId,
    frames: Sender<Frame>,
    notifier: Notifier,
}

impl WebSocketSession {
    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::text(text))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.send(Frame::binary(data))
    }

    /// Starts the closing handshake. Later sends are discarded.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.send(Frame::close(Some(code), reason))
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }

    fn send(&self, frame: Frame) -> bool {
        self.frames.try_send(frame).is_ok() && self.notifier.notify()
    }
}

impl fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshake,
    Open,
    /// Our close frame is out; waiting for the peer's.
    Closing,
    /// Terminal frame or response queued; close once it is flushed.
    Finishing,
    Done,
}

struct Connection {
    endpoint: Arc<dyn WebSocketEndpoint>,
    session: WebSocketSession,
    outbound: Receiver<Frame>,
    close_reported: bool,
}

impl Connection {
    fn report_close(&mut self, code: u16, reason: &str) {
        if !self.close_reported {
            self.close_reported = true;
            self.endpoint.on_close(&self.session, code, reason);
        }
        self.outbound.close();
    }
}

pub struct WebSocketHandler {
    endpoints: Arc<PathMapping<Arc<dyn WebSocketEndpoint>>>,
    max_header_bytes: usize,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    assembler: MessageAssembler,
    phase: Phase,
    pending: VecDeque<Bytes>,
    connection: Option<Connection>,
    notifier: Option<Notifier>,
    session_id: SessionId,
}

impl WebSocketHandler {
    pub fn new(
        endpoints: Arc<PathMapping<Arc<dyn WebSocketEndpoint>>>,
        http: &HttpConfig,
        config: &WebSocketConfig,
    ) -> Self {
        Self {
            endpoints,
            max_header_bytes: http.max_header_bytes,
            decoder: FrameDecoder::server(config.max_message_bytes),
            encoder: FrameEncoder::default(),
            assembler: MessageAssembler::new(config.max_message_bytes),
            phase: Phase::Handshake,
            pending: VecDeque::new(),
            connection: None,
            notifier: None,
            session_id: 0,
        }
    }

    fn queue(&mut self, frame: Frame) {
        let mut buf = BytesMut::new();
        match self.encoder.encode(frame, &mut buf) {
            Ok(()) => self.pending.push_back(buf.freeze()),
            Err(e) => warn!("session {} frame encoding failed: {e}", self.session_id),
        }
    }

    fn reject(&mut self, response: HttpResponse) -> ChannelAction {
        debug!(
            "session {} upgrade rejected with {}",
            self.session_id,
            response.status()
        );
        self.pending.push_back(response.encode(false));
        self.phase = Phase::Finishing;
        ChannelAction::CloseInput
    }

    fn handshake(&mut self, input: &mut BytesMut) -> AnyResult<ChannelAction> {
        let Some((head, len)) = peek_request_head(input, self.max_header_bytes)? else {
            return Ok(ChannelAction::KeepOpen);
        };
        input.advance(len);

        let endpoints = self.endpoints.clone();
        let Some(mapping) = endpoints.find_mapping(&head.path) else {
            return Ok(self.reject(HttpResponse::error(StatusCode::NOT_FOUND)));
        };
        let accept = match handshake::validate(&head) {
            Ok(accept) => accept,
            Err(e) => {
                warn!("session {} bad websocket handshake: {e}", self.session_id);
                return Ok(self.reject(e.response()));
            }
        };
        let Some(notifier) = self.notifier.clone() else {
            return Ok(self.reject(HttpResponse::error(
                StatusCode::INTERNAL_SERVER_ERROR,
            )));
        };

        self.pending
            .push_back(handshake::switching_protocols(&accept).encode_upgrade());
        self.phase = Phase::Open;
        let (frames, outbound) = async_channel::unbounded();
        let connection = Connection {
            endpoint: mapping.target.clone(),
            session: WebSocketSession {
                id: self.session_id,
                frames,
                notifier,
            },
            outbound,
            close_reported: false,
        };
        debug!("session {} upgraded on {}", self.session_id, head.path);
        connection.endpoint.on_open(&connection.session, &mapping.params);
        self.connection = Some(connection);

        // frames may already follow the handshake
        self.read_frames(input)
    }

    fn read_frames(&mut self, input: &mut BytesMut) -> AnyResult<ChannelAction> {
        while let Decoded::Some(frame) = self.decoder.decode(input)? {
            match self.assembler.push(frame)? {
                Inbound::Pending | Inbound::Pong(_) => {}
                Inbound::Ping(payload) => {
                    if self.phase == Phase::Open {
                        self.queue(Frame::pong(payload));
                    }
                }
                Inbound::Message(message) => {
                    if let (Phase::Open, Some(conn)) = (self.phase, self.connection.as_ref()) {
                        conn.endpoint.on_message(&conn.session, message);
                    }
                }
                Inbound::Close(code, reason) => return Ok(self.peer_closed(code, &reason)),
            }
        }
        Ok(ChannelAction::KeepOpen)
    }

    fn peer_closed(&mut self, code: Option<u16>, reason: &str) -> ChannelAction {
        debug!("session {} peer close {code:?}", self.session_id);
        if let Some(conn) = self.connection.as_mut() {
            conn.report_close(code.unwrap_or(close_code::NO_STATUS), reason);
        }
        if self.phase == Phase::Closing {
            self.phase = Phase::Done;
            return ChannelAction::CloseAll;
        }
        self.queue(Frame::close(code, ""));
        self.phase = Phase::Finishing;
        ChannelAction::CloseInput
    }

    /// Moves frames queued by the application onto the wire queue.
    fn drain_outbound(&mut self) {
        if self.phase != Phase::Open {
            return;
        }
        while let Some(frame) = self
            .connection
            .as_ref()
            .and_then(|conn| conn.outbound.try_recv().ok())
        {
            let closing = frame.opcode == OpCode::Close;
            self.queue(frame);
            if closing {
                debug!("session {} closing", self.session_id);
                self.phase = Phase::Closing;
                if let Some(conn) = self.connection.as_ref() {
                    conn.outbound.close();
                }
                break;
            }
        }
    }
}

impl IoHandler for WebSocketHandler {
    fn protocol(&self) -> &'static str {
        PROTOCOL_WEBSOCKET
    }

    fn deploy(&mut self, session: &SessionContext) {
        self.session_id = session.id();
        self.notifier = Some(session.notifier().clone());
    }

    fn consume(&mut self, input: &mut BytesMut) -> AnyResult<ChannelAction> {
        match self.phase {
            Phase::Handshake => self.handshake(input),
            Phase::Open | Phase::Closing => self.read_frames(input),
            Phase::Finishing | Phase::Done => {
                input.clear();
                Ok(ChannelAction::CloseInput)
            }
        }
    }

    fn produce(&mut self, output: &mut VecDeque<Bytes>) -> AnyResult<ChannelAction> {
        self.drain_outbound();
        if self.pending.is_empty() {
            return Ok(match self.phase {
                Phase::Finishing | Phase::Done => ChannelAction::CloseAll,
                _ => ChannelAction::KeepOpen,
            });
        }
        output.extend(self.pending.drain(..));
        Ok(ChannelAction::KeepOpen)
    }

    fn write_successful(&mut self, _bytes_written: usize) -> ChannelAction {
        match self.phase {
            Phase::Finishing | Phase::Done if self.pending.is_empty() => ChannelAction::CloseAll,
            _ => ChannelAction::KeepOpen,
        }
    }

    fn write_failed(&mut self, _error: &AnyError) -> ChannelAction {
        if let Some(conn) = self.connection.as_mut() {
            conn.report_close(close_code::ABNORMAL, "");
        }
        self.phase = Phase::Done;
        ChannelAction::CloseAll
    }

    fn on_read_error(&mut self, error: &AnyError) -> ChannelAction {
        if let Some(e) = error.downcast_ref::<WebSocketError>() {
            warn!("session {} websocket protocol error: {e}", self.session_id);
            let code = e.close_code();
            if let Some(conn) = self.connection.as_mut() {
                conn.report_close(code, "");
            }
            self.queue(Frame::close(Some(code), ""));
            self.phase = Phase::Finishing;
            return ChannelAction::CloseInput;
        }
        if let (Phase::Handshake, Some(e)) = (self.phase, error.downcast_ref::<HttpError>()) {
            return self.reject(HttpResponse::error(e.status()));
        }
        if let Some(conn) = self.connection.as_mut() {
            conn.report_close(close_code::ABNORMAL, "");
        }
        self.phase = Phase::Done;
        ChannelAction::CloseAll
    }

    fn handle_closed_input(&mut self) {
        if matches!(self.phase, Phase::Finishing | Phase::Done) {
            return;
        }
        if let Some(conn) = self.connection.as_mut() {
            conn.report_close(close_code::ABNORMAL, "");
        }
        self.pending.clear();
        self.phase = Phase::Done;
    }
}

impl Drop for WebSocketHandler {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.as_mut() {
            conn.report_close(close_code::ABNORMAL, "");
        }
    }
}
