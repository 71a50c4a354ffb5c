use std::{collections::VecDeque, fmt, sync::Arc};

use async_channel::{Receiver, Sender, TryRecvError};
use bytes::{Bytes, BytesMut};
use http::{header, HeaderValue, StatusCode};
use monoio_codec::Encoder;
use polymux_core::{
    config::{HttpConfig, SseConfig, PROTOCOL_SSE},
    mapping::{PathMapping, PathParams},
    AnyError, AnyResult, ChannelAction, IoHandler, Notifier, SessionContext, SessionId,
};
use tracing::{debug, warn};

use super::{SseEncoder, SseEvent};
use crate::http::{HttpError, HttpRequest, HttpResponse, RequestReader};

/// Application side of an event-stream route.
///
/// `open` runs on the loop thread and must return quickly; long-lived
/// producers keep the emitter and push from elsewhere. The stream ends once
/// every clone of the emitter is dropped.
pub trait EventSource: Send + Sync + 'static {
    fn open(&self, request: &HttpRequest, params: &PathParams, emitter: SseEmitter)
        -> AnyResult<()>;
}

impl<F> EventSource for F
where
    F: Fn(&HttpRequest, &PathParams, SseEmitter) -> AnyResult<()> + Send + Sync + 'static,
{
    fn open(
        &self,
        request: &HttpRequest,
        params: &PathParams,
        emitter: SseEmitter,
    ) -> AnyResult<()> {
        self(request, params, emitter)
    }
}

#[derive(Clone)]
pub struct SseEmitter {
    id: SessionId,
    events: Sender<SseEvent>,
    notifier: Notifier,
}

impl SseEmitter {
    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queues an event. Returns false once the client is gone.
    pub fn send(&self, event: SseEvent) -> bool {
        self.events.try_send(event).is_ok() && self.notifier.notify()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

impl Drop for SseEmitter {
    fn drop(&mut self) {
        // the last emitter going away ends the stream
        self.notifier.notify();
    }
}

impl fmt::Debug for SseEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseEmitter")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum Phase {
    Request,
    Streaming(Receiver<SseEvent>),
    /// Final bytes queued; close once they are flushed.
    Finishing,
    Done,
}

pub struct SseHandler {
    sources: Arc<PathMapping<Arc<dyn EventSource>>>,
    reader: RequestReader,
    retry_ms: Option<u64>,
    encoder: SseEncoder,
    phase: Phase,
    pending: VecDeque<Bytes>,
    notifier: Option<Notifier>,
    session_id: SessionId,
}

impl SseHandler {
    pub fn new(
        sources: Arc<PathMapping<Arc<dyn EventSource>>>,
        http: &HttpConfig,
        config: &SseConfig,
    ) -> Self {
        Self {
            sources,
            reader: RequestReader::new(http),
            retry_ms: config.retry_ms,
            encoder: SseEncoder,
            phase: Phase::Request,
            pending: VecDeque::new(),
            notifier: None,
            session_id: 0,
        }
    }

    fn queue(&mut self, event: SseEvent) {
        let mut buf = BytesMut::new();
        match self.encoder.encode(event, &mut buf) {
            Ok(()) => self.pending.push_back(buf.freeze()),
            Err(e) => warn!("session {} event encoding failed: {e}", self.session_id),
        }
    }

    fn respond(&mut self, response: HttpResponse) {
        self.pending.push_back(response.encode(false));
        self.phase = Phase::Finishing;
    }

    fn open(&mut self, request: HttpRequest) {
        let sources = self.sources.clone();
        let Some(mapping) = sources.find_mapping(request.path()) else {
            self.respond(HttpResponse::error(StatusCode::NOT_FOUND));
            return;
        };
        let Some(notifier) = self.notifier.clone() else {
            self.respond(HttpResponse::error(StatusCode::INTERNAL_SERVER_ERROR));
            return;
        };
        let (events, rx) = async_channel::unbounded();
        let emitter = SseEmitter {
            id: self.session_id,
            events,
            notifier,
        };
        if let Err(e) = mapping.target.open(&request, &mapping.params, emitter) {
            warn!("session {} event source failed: {e:#}", self.session_id);
            self.respond(HttpResponse::error(StatusCode::INTERNAL_SERVER_ERROR));
            return;
        }

        debug!("session {} streams {}", self.session_id, request.path());
        let head = HttpResponse::new(StatusCode::OK)
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            )
            .with_header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        self.pending.push_back(head.encode_stream_head());
        if let Some(retry) = self.retry_ms {
            self.queue(SseEvent::new().with_retry(retry));
        }
        self.phase = Phase::Streaming(rx);
    }
}

impl IoHandler for SseHandler {
    fn protocol(&self) -> &'static str {
        PROTOCOL_SSE
    }

    fn deploy(&mut self, session: &SessionContext) {
        self.session_id = session.id();
        self.notifier = Some(session.notifier().clone());
    }

    fn consume(&mut self, input: &mut BytesMut) -> AnyResult<ChannelAction> {
        match self.phase {
            Phase::Request => match self.reader.feed(input)? {
                Some(request) => {
                    self.open(request);
                    // keep reading while streaming so a hang-up is noticed
                    Ok(match self.phase {
                        Phase::Streaming(_) => ChannelAction::KeepOpen,
                        _ => ChannelAction::CloseInput,
                    })
                }
                None => Ok(ChannelAction::KeepOpen),
            },
            Phase::Streaming(_) => {
                input.clear();
                Ok(ChannelAction::KeepOpen)
            }
            Phase::Finishing | Phase::Done => {
                input.clear();
                Ok(ChannelAction::CloseInput)
            }
        }
    }

    fn produce(&mut self, output: &mut VecDeque<Bytes>) -> AnyResult<ChannelAction> {
        let mut ended = false;
        while let Phase::Streaming(rx) = &self.phase {
            match rx.try_recv() {
                Ok(event) => self.queue(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    ended = true;
                    break;
                }
            }
        }
        if ended {
            debug!("session {} stream ended", self.session_id);
            self.phase = Phase::Finishing;
        }
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

    fn on_read_error(&mut self, error: &AnyError) -> ChannelAction {
        if let Phase::Request = self.phase {
            if let Some(e) = error.downcast_ref::<HttpError>() {
                self.respond(HttpResponse::error(e.status()));
                return ChannelAction::CloseInput;
            }
        }
        ChannelAction::CloseAll
    }

    fn handle_closed_input(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Streaming(rx) => {
                debug!("session {} client left the stream", self.session_id);
                rx.close();
                self.pending.clear();
            }
            Phase::Request | Phase::Done => {}
            Phase::Finishing => self.phase = Phase::Finishing,
        }
    }
}

impl Drop for SseHandler {
    fn drop(&mut self) {
        if let Phase::Streaming(rx) = &self.phase {
            rx.close();
        }
    }
}
