//! Channel processor: accept, read and write multiplexing for one event loop.
//!
//! Every accepted connection becomes a [`Session`] driven by its own task on
//! the loop thread. The task waits on three sources at once: chunks from the
//! Session's read pump (only while read-interested), notifier wake-ups, and
//! the shutdown signal. Handler callbacks run synchronously between those
//! waits, so one Session's buffers are only ever touched by one task.
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    net::SocketAddr,
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
    sync::Arc,
};

use async_channel::{Receiver, Sender};
use futures_channel::oneshot::{self, Cancellation, Receiver as OReceiver, Sender as OSender};
use monoio::{
    io::{AsyncReadRent, AsyncWriteRent, OwnedReadHalf, OwnedWriteHalf, Splitable},
    net::{ListenerOpts, TcpListener, TcpStream},
};
use service_async::Param;
use tracing::{debug, error, info, warn};

use crate::{
    action::ChannelAction,
    config::SessionConfig,
    context::ServerContext,
    handler::Detection,
    session::{Notifier, Session, SessionContext, SessionId, Wakeups},
    worker::panic_message,
    AnyError,
};

type Registry = Rc<RefCell<HashMap<SessionId, OReceiver<()>>>>;

// low bits of a session id count accepts, high bits carry the loop id
const LOOP_ID_SHIFT: u32 = 48;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("no protocol detector accepted the connection")]
    Unrecognized,
    #[error("buffered input exceeds {0} bytes")]
    InputOverflow(usize),
    #[error("handler panicked in {stage}: {message}")]
    HandlerPanic {
        stage: &'static str,
        message: String,
    },
}

enum ReadEvent {
    Data(Vec<u8>),
    Eof,
    Error(io::Error),
}

enum Wake {
    Shutdown,
    Read(Option<ReadEvent>),
    Notified,
}

enum Flush {
    Done,
    Failed(AnyError),
    Stopped,
}

pub struct ChannelProcessor {
    loop_id: usize,
    context: Arc<ServerContext>,
    sessions: Registry,
    accepted: Cell<u64>,
}

impl ChannelProcessor {
    pub fn new(loop_id: usize, context: Arc<ServerContext>) -> Self {
        Self {
            loop_id,
            context,
            sessions: Rc::new(RefCell::new(HashMap::new())),
            accepted: Cell::new(0),
        }
    }

    /// Binds a listener that shares its port with the other loops.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let opts = ListenerOpts::new().reuse_port(true).reuse_addr(true);
        TcpListener::bind_with_config(addr, &opts)
    }

    /// Accepts until `stop` is cancelled, then closes every Session and waits
    /// for them to finish, at most `shutdown_grace_ms`.
    pub async fn serve(&self, listener: TcpListener, mut stop: OSender<()>) {
        let (tracker, drained) = async_channel::bounded::<()>(1);
        let mut cancellation = stop.cancellation();
        loop {
            monoio::select! {
                _ = &mut cancellation => {
                    info!("loop {} is notified to stop", self.loop_id);
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_session(stream, peer, tracker.clone()),
                        Err(e) => warn!("accept connection failed: {e:?}"),
                    }
                }
            }
        }
        drop(listener);
        self.drain(tracker, drained).await;
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr, tracker: Sender<()>) {
        let seq = self.accepted.get() + 1;
        self.accepted.set(seq);
        let id = ((self.loop_id as u64) << LOOP_ID_SHIFT) | seq;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("session {id} set_nodelay failed: {e}");
        }
        let (stop, registered) = oneshot::channel::<()>();
        self.sessions.borrow_mut().insert(id, registered);
        debug!("session {id} accepted from {peer}");

        let sessions = self.sessions.clone();
        let context = self.context.clone();
        monoio::spawn(async move {
            let _tracker = tracker;
            SessionDriver::new(id, peer, stream, context).run(stop).await;
            sessions.borrow_mut().remove(&id);
            debug!("session {id} released");
        });
    }

    async fn drain(&self, tracker: Sender<()>, drained: Receiver<()>) {
        // dropping a registered receiver cancels that Session
        let open: Vec<_> = self.sessions.borrow_mut().drain().collect();
        let count = open.len();
        drop(open);
        drop(tracker);
        if count > 0 {
            info!("loop {} closing {count} sessions", self.loop_id);
        }

        let grace = self.context.config().shutdown_grace();
        // recv only returns once every session task dropped its tracker
        match monoio::time::timeout(grace, drained.recv()).await {
            Ok(_) => info!("loop {} drained", self.loop_id),
            Err(_) => warn!(
                "loop {}: sessions still open after {grace:?}, abandoning them",
                self.loop_id
            ),
        }
    }
}

struct SessionDriver {
    session: Session,
    context: Arc<ServerContext>,
    limits: SessionConfig,
    writer: OwnedWriteHalf<TcpStream>,
    chunks: Receiver<ReadEvent>,
    wakeups: Wakeups,
    // dropping this halts the read pump
    pump: Option<OReceiver<()>>,
    output_shut: bool,
}

impl SessionDriver {
    fn new(id: SessionId, peer: SocketAddr, stream: TcpStream, context: Arc<ServerContext>) -> Self {
        let (notifier, wakeups) = Notifier::channel();
        let session = Session::new(SessionContext::new(id, peer, notifier));

        let (reader, writer) = stream.into_split();
        let (chunk_tx, chunks) = async_channel::bounded(1);
        let (halt, pump) = oneshot::channel();
        let limits: SessionConfig = context.config().param();
        monoio::spawn(read_pump(
            reader,
            limits.read_buffer_size.max(1),
            chunk_tx,
            halt,
        ));

        Self {
            session,
            context,
            limits,
            writer,
            chunks,
            wakeups,
            pump: Some(pump),
            output_shut: false,
        }
    }

    async fn run(mut self, mut stop: OSender<()>) {
        let mut cancellation = stop.cancellation();
        self.session.begin_detection();

        while !self.session.is_closed() {
            if !self.session.input_open() {
                self.halt_pump();
            }
            if !self.session.output_open() && !self.output_shut {
                self.shutdown_output().await;
            }

            if self.session.interest().writable {
                if let Flush::Stopped = self.write_turn(&mut cancellation).await {
                    self.session.close();
                }
                continue;
            }

            let readable = self.session.interest().readable;
            let wake = monoio::select! {
                _ = &mut cancellation => Wake::Shutdown,
                event = self.chunks.recv(), if readable => Wake::Read(event.ok()),
                _ = self.wakeups.recv() => Wake::Notified,
            };
            match wake {
                Wake::Shutdown => {
                    debug!("session {} closed by shutdown", self.session.id());
                    self.session.close();
                }
                Wake::Read(Some(event)) => self.on_read(event),
                // the pump is gone without reporting eof
                Wake::Read(None) => self.on_read(ReadEvent::Eof),
                Wake::Notified => self.session.offer_write(),
            }
        }

        self.halt_pump();
        if !self.output_shut {
            self.shutdown_output().await;
        }
    }

    fn on_read(&mut self, event: ReadEvent) {
        match event {
            ReadEvent::Data(data) => {
                let limit = self.limits.max_input_bytes;
                if self.session.input().len() + data.len() > limit {
                    warn!(
                        "session {} closed: {}",
                        self.session.id(),
                        SessionError::InputOverflow(limit)
                    );
                    self.session.close();
                    return;
                }
                self.session.push_input(&data);
                if self.session.has_handler() {
                    self.consume_turn();
                } else {
                    self.detect();
                }
            }
            ReadEvent::Eof => {
                debug!("session {} input reached eof", self.session.id());
                if !self.session.has_handler() {
                    self.session.close();
                    return;
                }
                if self.guarded("handle_closed_input", |s| s.closed_input()).is_some() {
                    self.session.apply(ChannelAction::CloseInput);
                }
            }
            ReadEvent::Error(e) => {
                let error = AnyError::from(e);
                warn!("session {} read failed: {error}", self.session.id());
                self.guarded("on_read_error", |s| s.read_failed(&error));
                // transport failures are always fatal
                self.session.close();
            }
        }
    }

    fn detect(&mut self) {
        let context = self.context.clone();
        for detector in context.detectors() {
            let verdict = self.guarded("determine_handler", |s| {
                detector.determine_handler(s.input(), s.context())
            });
            match verdict {
                Some(Detection::Matched(handler)) => {
                    debug!(
                        "session {} detected as {} by {}",
                        self.session.id(),
                        handler.protocol(),
                        detector.name()
                    );
                    if self.guarded("deploy", |s| s.bind(handler)).is_some() {
                        self.consume_turn();
                    }
                    return;
                }
                Some(Detection::NeedMoreData) => return,
                Some(Detection::NoMatch) => continue,
                None => return,
            }
        }
        warn!(
            "session {} from {} closed: {}",
            self.session.id(),
            self.session.context().peer_addr(),
            SessionError::Unrecognized
        );
        self.session.close();
    }

    fn consume_turn(&mut self) {
        match self.guarded("consume", |s| s.consume()) {
            Some(Ok(action)) => {
                self.session.apply(action);
            }
            Some(Err(e)) => {
                warn!("session {} protocol error: {e:#}", self.session.id());
                if let Some(action) = self.guarded("on_read_error", |s| s.read_failed(&e)) {
                    self.session.apply(action);
                }
            }
            None => return,
        }
        self.session.offer_write();
    }

    /// One produce/flush cycle. The directive returned by `produce` is applied
    /// once the buffers it queued are written.
    async fn write_turn(&mut self, cancellation: &mut Cancellation<'_, ()>) -> Flush {
        let mut action = ChannelAction::KeepOpen;
        if !self.session.has_output() {
            match self.guarded("produce", |s| s.produce()) {
                Some(Ok(next)) => action = next,
                Some(Err(e)) => {
                    warn!("session {} produce failed: {e:#}", self.session.id());
                    self.guarded("write_failed", |s| s.write_failed(&e));
                    self.session.close();
                    return Flush::Failed(e);
                }
                None => return Flush::Done,
            }
        }

        if !self.session.has_output() {
            self.session.apply(action);
            // nothing to write whatever the directive: wait for input or a notify
            self.session.idle_output();
            return Flush::Done;
        }

        match self.flush(cancellation).await {
            Flush::Done => {
                self.session.apply(action);
                if !self.session.is_closed() {
                    if let Some(next) = self.guarded("write_successful", |s| s.write_successful()) {
                        self.session.apply(next);
                    }
                }
                Flush::Done
            }
            Flush::Failed(e) => {
                warn!("session {} write failed: {e}", self.session.id());
                self.guarded("write_failed", |s| s.write_failed(&e));
                // no retry: a failed write always closes the Session
                self.session.close();
                Flush::Failed(e)
            }
            Flush::Stopped => Flush::Stopped,
        }
    }

    async fn flush(&mut self, cancellation: &mut Cancellation<'_, ()>) -> Flush {
        while let Some(buf) = self.session.pop_output() {
            let len = buf.len();
            let (res, buf) = monoio::select! {
                _ = &mut *cancellation => return Flush::Stopped,
                written = self.writer.write(buf) => written,
            };
            match res {
                Ok(0) => return Flush::Failed(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.session.record_written(n);
                    if n < len {
                        self.session.requeue_front(buf.slice(n..));
                    }
                }
                Err(e) => return Flush::Failed(e.into()),
            }
        }
        Flush::Done
    }

    fn halt_pump(&mut self) {
        if self.pump.take().is_some() {
            debug!("session {} stopped reading", self.session.id());
        }
    }

    async fn shutdown_output(&mut self) {
        self.output_shut = true;
        if let Err(e) = self.writer.shutdown().await {
            debug!("session {} shutdown output: {e}", self.session.id());
        }
    }

    /// Runs handler code, turning a panic into a forced close.
    fn guarded<R>(
        &mut self,
        stage: &'static str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        match catch_unwind(AssertUnwindSafe(|| f(&mut self.session))) {
            Ok(r) => Some(r),
            Err(panic) => {
                let error = SessionError::HandlerPanic {
                    stage,
                    message: panic_message(panic),
                };
                error!("session {} closed: {error}", self.session.id());
                self.session.close();
                None
            }
        }
    }
}

async fn read_pump(
    mut reader: OwnedReadHalf<TcpStream>,
    buffer_size: usize,
    chunks: Sender<ReadEvent>,
    mut halt: OSender<()>,
) {
    let mut cancellation = halt.cancellation();
    loop {
        let buf = Vec::with_capacity(buffer_size);
        let (res, buf) = monoio::select! {
            _ = &mut cancellation => return,
            read = reader.read(buf) => read,
        };
        let event = match res {
            Ok(0) => ReadEvent::Eof,
            Ok(_) => ReadEvent::Data(buf),
            Err(e) => ReadEvent::Error(e),
        };
        let last = !matches!(event, ReadEvent::Data(_));
        let sent = monoio::select! {
            _ = &mut cancellation => return,
            sent = chunks.send(event) => sent,
        };
        if sent.is_err() || last {
            return;
        }
    }
}
