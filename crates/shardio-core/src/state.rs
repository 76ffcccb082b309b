//! Connection and engine lifecycle states

/// State of a connection
///
/// ```text
///  Open ──close()/error/drain──▶ Closing ──flushed or forced──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Registered; reads dispatched, writes accepted
    Open = 0,

    /// Close requested or error observed; queued writes may still drain
    Closing = 1,

    /// Terminal; socket released, close hook fired or about to fire
    Closed = 2,
}

impl ConnState {
    /// Whether `write()` is accepted in this state
    #[inline]
    pub const fn is_writable(&self) -> bool {
        matches!(self, ConnState::Open)
    }

    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, ConnState::Closed)
    }
}

impl From<u8> for ConnState {
    fn from(v: u8) -> Self {
        match v {
            0 => ConnState::Open,
            1 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// State of an engine
///
/// `Stopped` is terminal; an engine cannot be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Built, hooks frozen, nothing bound
    Created = 0,

    /// Listeners bound, workers running
    Running = 1,

    /// Not accepting; workers closing connections
    Draining = 2,

    /// All workers joined
    Stopped = 3,
}

impl From<u8> for EngineState {
    fn from(v: u8) -> Self {
        match v {
            0 => EngineState::Created,
            1 => EngineState::Running,
            2 => EngineState::Draining,
            _ => EngineState::Stopped,
        }
    }
}
