//! Connection lifecycle states and events.

/// Session state.
///
/// State transitions:
/// - Disconnected -> Connecting (Connect)
/// - Connecting -> Connected (connect callback succeeded)
/// - Connecting | Connected | Disconnecting -> Disconnecting (Disconnect)
/// - Connecting | Connected | Disconnecting -> Disconnected (disconnect / connect-failure callback)
///
/// A native handle exists iff the state is not `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl SessionState {
    pub fn has_handle(self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Owner (or the reconnect policy) asks for a connection.
    Connect,

    /// Native connect callback reported success.
    Connected,

    /// Owner asks to close the connection.
    Disconnect,

    /// Native disconnect or connect-failure callback.
    Disconnected { reason: Option<String> },
}
