/// Directive returned by every handler callback.
///
/// These four values are the only way a handler tells the engine what to do
/// with its Session; they drive every legal state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelAction {
    /// Keep both directions as they are.
    KeepOpen,
    /// Stop reading; the Session may still write.
    CloseInput,
    /// Stop writing; the Session may still read.
    CloseOutput,
    /// Terminate the Session.
    CloseAll,
}

impl ChannelAction {
    #[inline]
    pub fn closes_input(self) -> bool {
        matches!(self, ChannelAction::CloseInput | ChannelAction::CloseAll)
    }

    #[inline]
    pub fn closes_output(self) -> bool {
        matches!(self, ChannelAction::CloseOutput | ChannelAction::CloseAll)
    }
}
