//! Session records kept by a service for each transport connection.

use crate::packet::SessionId;

/// Lifecycle of a transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Bookkeeping for one transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub local_addr: String,
    pub peer_addr: String,
    pub state: SessionState,
    /// Set for sessions accepted by a listener, clear for outgoing ones.
    pub accepted: bool,
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId, local_addr: impl Into<String>, peer_addr: impl Into<String>) -> Self {
        Self {
            id,
            local_addr: local_addr.into(),
            peer_addr: peer_addr.into(),
            state: SessionState::Connecting,
            accepted: false,
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: SessionState) -> Self {
        self.state = state;
        self
    }

    #[must_use]
    pub fn with_accepted(mut self, accepted: bool) -> Self {
        self.accepted = accepted;
        self
    }

    /// Returns `true` if packets may be sent on this session.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}
