//! Per-connection state.
//!
//! A [`Session`] is created for every accepted connection and owned by the
//! channel processor task that drives it. All mutation happens on the loop
//! thread; the only handle that may leave the thread is the [`Notifier`].
//!
//! Lifecycle:
//!
//! ```text
//! Accepted -> DetectingProtocol -> Active -> HalfClosedInput  -> Closed
//!                                        \-> HalfClosedOutput -> Closed
//! (any state) ---------------- CloseAll / io error / shutdown -> Closed
//! ```
use std::{collections::VecDeque, fmt, net::SocketAddr};

use async_channel::{Receiver, Sender, TrySendError};
use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::{action::ChannelAction, handler::IoHandler, AnyError, AnyResult};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    DetectingProtocol,
    Active,
    HalfClosedInput,
    HalfClosedOutput,
    Closed,
}

/// Readiness the Session currently waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
}

/// Cross-thread wake-up handle of a Session.
///
/// Calling [`Notifier::notify`] re-arms write interest so the handler's
/// `produce` runs again on the loop thread. Notifications coalesce: any
/// number of calls before the loop reacts count as one.
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<()>,
}

/// Receiving side of a [`Notifier`], awaited by the Session's driver.
pub type Wakeups = Receiver<()>;

impl Notifier {
    pub fn channel() -> (Notifier, Wakeups) {
        let (tx, rx) = async_channel::bounded(1);
        (Notifier { tx }, rx)
    }

    /// Returns false once the Session is gone.
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Read-only view of a Session handed to detectors and handlers.
#[derive(Debug, Clone)]
pub struct SessionContext {
    id: SessionId,
    peer_addr: SocketAddr,
    notifier: Notifier,
}

impl SessionContext {
    pub fn new(id: SessionId, peer_addr: SocketAddr, notifier: Notifier) -> Self {
        Self {
            id,
            peer_addr,
            notifier,
        }
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

pub struct Session {
    context: SessionContext,
    state: SessionState,
    interest: Interest,
    input_open: bool,
    output_open: bool,
    input: BytesMut,
    output: VecDeque<Bytes>,
    handler: Option<Box<dyn IoHandler>>,
    // bytes flushed since the last write_successful callback
    written: usize,
}

impl Session {
    pub fn new(context: SessionContext) -> Self {
        Self {
            context,
            state: SessionState::Accepted,
            interest: Interest::NONE,
            input_open: true,
            output_open: true,
            input: BytesMut::new(),
            output: VecDeque::new(),
            handler: None,
            written: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.context.id
    }

    #[inline]
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        self.interest
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    #[inline]
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn protocol(&self) -> Option<&'static str> {
        self.handler.as_ref().map(|h| h.protocol())
    }

    #[inline]
    pub fn input(&self) -> &BytesMut {
        &self.input
    }

    #[inline]
    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    pub fn begin_detection(&mut self) {
        if self.state == SessionState::Accepted {
            self.transition(SessionState::DetectingProtocol);
            self.interest = Interest::READABLE;
        }
    }

    /// Binds the handler for the rest of the Session's life and deploys it.
    pub fn bind(&mut self, mut handler: Box<dyn IoHandler>) {
        debug_assert!(self.handler.is_none(), "handler bound twice");
        handler.deploy(&self.context);
        self.handler = Some(handler);
        if self.state == SessionState::DetectingProtocol {
            self.transition(SessionState::Active);
        }
    }

    pub fn push_input(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
    }

    /// Applies a handler directive. This is the only place lifecycle state changes
    /// besides detection, binding and forced closure.
    pub fn apply(&mut self, action: ChannelAction) -> SessionState {
        if self.is_closed() {
            return self.state;
        }
        if action.closes_input() && self.input_open {
            self.input_open = false;
            self.interest.readable = false;
            // flip to write interest so pending output gets produced
            self.interest.writable = self.output_open;
        }
        if action.closes_output() && self.output_open {
            self.output_open = false;
            self.interest.writable = false;
            self.output.clear();
        }
        self.refresh_state();
        self.state
    }

    /// Forced closure: io errors, protocol errors and shutdown.
    pub fn close(&mut self) {
        self.apply(ChannelAction::CloseAll);
    }

    /// Gives the handler a `produce` turn on the next loop iteration.
    pub fn offer_write(&mut self) {
        if self.output_open && !self.is_closed() {
            self.interest.writable = true;
        }
    }

    /// Nothing left to produce until the next consume or notification.
    pub fn idle_output(&mut self) {
        self.interest.writable = false;
    }

    #[inline]
    pub fn input_open(&self) -> bool {
        self.input_open
    }

    #[inline]
    pub fn output_open(&self) -> bool {
        self.output_open
    }

    pub(crate) fn pop_output(&mut self) -> Option<Bytes> {
        self.output.pop_front()
    }

    /// Keeps the unwritten remainder of a partial write at the head of the queue.
    pub(crate) fn requeue_front(&mut self, rest: Bytes) {
        if !rest.is_empty() {
            self.output.push_front(rest);
        }
    }

    pub(crate) fn record_written(&mut self, n: usize) {
        self.written += n;
    }

    pub(crate) fn consume(&mut self) -> AnyResult<ChannelAction> {
        match self.handler.as_mut() {
            Some(handler) => handler.consume(&mut self.input),
            None => Ok(ChannelAction::KeepOpen),
        }
    }

    pub(crate) fn produce(&mut self) -> AnyResult<ChannelAction> {
        match self.handler.as_mut() {
            Some(handler) => {
                let action = handler.produce(&mut self.output)?;
                // drop empty buffers so they never reach the socket
                self.output.retain(|b| !b.is_empty());
                Ok(action)
            }
            None => Ok(ChannelAction::KeepOpen),
        }
    }

    pub(crate) fn write_successful(&mut self) -> ChannelAction {
        let written = std::mem::take(&mut self.written);
        match self.handler.as_mut() {
            Some(handler) => handler.write_successful(written),
            None => ChannelAction::KeepOpen,
        }
    }

    pub(crate) fn write_failed(&mut self, error: &AnyError) -> ChannelAction {
        match self.handler.as_mut() {
            Some(handler) => handler.write_failed(error),
            None => ChannelAction::CloseAll,
        }
    }

    pub(crate) fn read_failed(&mut self, error: &AnyError) -> ChannelAction {
        match self.handler.as_mut() {
            Some(handler) => handler.on_read_error(error),
            None => ChannelAction::CloseAll,
        }
    }

    pub(crate) fn closed_input(&mut self) {
        if let Some(handler) = self.handler.as_mut() {
            handler.handle_closed_input();
        }
    }

    fn refresh_state(&mut self) {
        let next = match (self.input_open, self.output_open) {
            (false, false) => SessionState::Closed,
            (false, true) => SessionState::HalfClosedInput,
            (true, false) => SessionState::HalfClosedOutput,
            (true, true) => self.state,
        };
        if next == SessionState::Closed {
            self.interest = Interest::NONE;
            self.output.clear();
        }
        self.transition(next);
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(
                "session {} {:?} -> {:?}",
                self.context.id, self.state, next
            );
            self.state = next;
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.context.id)
            .field("peer_addr", &self.context.peer_addr)
            .field("state", &self.state)
            .field("interest", &self.interest)
            .field("protocol", &self.protocol())
            .field("buffered_input", &self.input.len())
            .field("queued_output", &self.output.len())
            .finish()
    }
}
