//! The transport contract a service drives once per frame.

use framekit_core::{Error, Result};

use crate::packet::{Packet, SessionId};
use crate::session::Session;

/// Something that happened on the transport since the last pump.
#[derive(Debug)]
pub enum TransportEvent {
    SessionCreated(Session),
    SessionDestroyed { id: SessionId, reason: String },
    Packet(Box<Packet>),
}

/// A packet the transport refused, handed back so its caller can recycle it.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct SendError {
    pub error: Error,
    pub packet: Box<Packet>,
}

impl SendError {
    #[must_use]
    pub fn new(error: Error, packet: Box<Packet>) -> Self {
        Self { error, packet }
    }
}

impl From<SendError> for Error {
    fn from(err: SendError) -> Self {
        err.error
    }
}

/// Socket-level collaborator of a service.
///
/// The service calls [`Transport::pump_once`] exactly once per frame; every
/// other method is called from the same thread.
pub trait Transport: Send {
    /// Prepare for I/O with `pollers` poller threads.
    fn start(&mut self, pollers: usize) -> Result<()>;

    /// Listen on `addr`, returning the listener session id.
    fn listen(&mut self, addr: &str) -> Result<SessionId>;

    /// Connect to `addr`, returning the session id once connected.
    fn connect(&mut self, addr: &str) -> Result<SessionId>;

    /// Start connecting to `addr`; completion is reported by a later pump.
    fn async_connect(&mut self, addr: &str) -> Result<SessionId> {
        Err(Error::NotImplemented(format!("async connect to {addr}")))
    }

    /// Close a session.
    fn remove_session(&mut self, id: SessionId, reason: &str) -> Result<()>;

    /// Hand a packet to the session named by `packet.session_id`.
    ///
    /// A refused packet comes back inside the [`SendError`].
    fn send(&mut self, packet: Box<Packet>) -> std::result::Result<(), SendError>;

    /// Collect everything that happened since the previous call.
    fn pump_once(&mut self) -> Vec<TransportEvent>;

    /// Close every session and release resources.
    fn shutdown(&mut self);
}

/// Builds a fresh transport each time a service (re)creates its backend.
pub type TransportFactory = Box<dyn Fn() -> Box<dyn Transport> + Send>;

/// A transport with no network: every network call fails.
#[derive(Debug, Default)]
pub struct NullTransport {
    started: bool,
}

impl NullTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// A factory producing [`NullTransport`]s.
    #[must_use]
    pub fn factory() -> TransportFactory {
        Box::new(|| Box::new(NullTransport::new()))
    }
}

impl Transport for NullTransport {
    fn start(&mut self, _pollers: usize) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn listen(&mut self, addr: &str) -> Result<SessionId> {
        Err(Error::NotImplemented(format!("listen on {addr}")))
    }

    fn connect(&mut self, addr: &str) -> Result<SessionId> {
        Err(Error::NotImplemented(format!("connect to {addr}")))
    }

    fn remove_session(&mut self, id: SessionId, _reason: &str) -> Result<()> {
        Err(Error::NotFound(format!("session {id}")))
    }

    fn send(&mut self, packet: Box<Packet>) -> std::result::Result<(), SendError> {
        let error = Error::NotImplemented(format!("send to session {}", packet.session_id));
        Err(SendError::new(error, packet))
    }

    fn pump_once(&mut self) -> Vec<TransportEvent> {
        Vec::new()
    }

    fn shutdown(&mut self) {
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_transport_is_inert() {
        let mut transport = NullTransport::factory()();
        transport.start(1).unwrap();
        assert!(matches!(transport.listen("a"), Err(Error::NotImplemented(_))));
        assert!(matches!(transport.connect("a"), Err(Error::NotImplemented(_))));
        assert!(matches!(
            transport.async_connect("a"),
            Err(Error::NotImplemented(_))
        ));
        let refused = transport.send(Box::new(Packet::new(1, 0, vec![4]))).unwrap_err();
        assert!(matches!(refused.error, Error::NotImplemented(_)));
        assert_eq!(refused.packet.payload, vec![4]);
        assert!(transport.pump_once().is_empty());
        transport.shutdown();
    }
}
