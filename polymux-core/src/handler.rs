//! Handler and protocol detection contracts.
//!
//! The engine knows nothing about protocols. Bytes arriving on a fresh
//! Session are offered to every registered [`ProtocolDetector`] in
//! registration order until one of them supplies an [`IoHandler`]; from then
//! on that handler alone interprets the connection.
use std::{collections::VecDeque, fmt};

use bytes::{Bytes, BytesMut};

use crate::{action::ChannelAction, session::SessionContext, AnyError, AnyResult};

/// Protocol logic bound to a single Session.
///
/// All callbacks run on the Session's loop thread and must not block. Work
/// that may block belongs on the [`WorkerPool`](crate::worker::WorkerPool);
/// its result is handed back through the Session's
/// [`Notifier`](crate::session::Notifier).
pub trait IoHandler {
    /// Short protocol name used in logs.
    fn protocol(&self) -> &'static str;

    /// Called once, right after the handler is bound to its Session.
    fn deploy(&mut self, _session: &SessionContext) {}

    /// Interprets buffered input. The handler removes what it used from
    /// `input`; the remainder is presented again on the next call.
    fn consume(&mut self, input: &mut BytesMut) -> AnyResult<ChannelAction>;

    /// Appends output buffers. Producing nothing with
    /// [`ChannelAction::KeepOpen`] means "nothing to write right now".
    fn produce(&mut self, output: &mut VecDeque<Bytes>) -> AnyResult<ChannelAction>;

    /// Every queued buffer has been flushed.
    fn write_successful(&mut self, _bytes_written: usize) -> ChannelAction {
        ChannelAction::KeepOpen
    }

    /// A write or `produce` failed. Transport failures close the Session
    /// whatever is returned here.
    fn write_failed(&mut self, _error: &AnyError) -> ChannelAction {
        ChannelAction::CloseAll
    }

    /// A read or `consume` failed. Transport failures close the Session
    /// whatever is returned here.
    fn on_read_error(&mut self, _error: &AnyError) -> ChannelAction {
        ChannelAction::CloseAll
    }

    /// The peer closed its sending side.
    fn handle_closed_input(&mut self) {}
}

/// Result of sniffing a connection's first bytes.
pub enum Detection {
    /// The prefix is too short to decide.
    NeedMoreData,
    /// Not this protocol.
    NoMatch,
    /// This protocol; the handler is bound to the Session.
    Matched(Box<dyn IoHandler>),
}

impl fmt::Debug for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detection::NeedMoreData => f.write_str("NeedMoreData"),
            Detection::NoMatch => f.write_str("NoMatch"),
            Detection::Matched(h) => write!(f, "Matched({})", h.protocol()),
        }
    }
}

impl Detection {
    #[inline]
    pub fn is_matched(&self) -> bool {
        matches!(self, Detection::Matched(_))
    }
}

/// Protocol-detection plugin.
///
/// Detectors are shared by every loop thread, so they must be `Send + Sync`;
/// the handlers they create stay on the thread of their Session.
pub trait ProtocolDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this detector serves one of the enabled protocol names.
    fn supports(&self, protocols: &[String]) -> bool;

    /// Inspects the buffered prefix. The prefix is not consumed: the bound
    /// handler sees the same bytes in its first `consume`.
    fn determine_handler(&self, prefix: &[u8], session: &SessionContext) -> Detection;
}
