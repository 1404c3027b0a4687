//! In-memory transport.
//!
//! A [`LoopbackHub`] connects any number of [`LoopbackTransport`]s through
//! string addresses. Connecting creates a pair of sessions, one on each side;
//! packets sent on one appear, with the peer's session id, on the other side's
//! next [`Transport::pump_once`].

use std::collections::HashMap;
use std::sync::Arc;

use framekit_core::{Error, Result};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::packet::{Packet, SessionId};
use crate::session::{Session, SessionState};
use crate::transport::{SendError, Transport, TransportEvent, TransportFactory};

type EndpointId = u64;

#[derive(Debug, Clone, Copy)]
struct Route {
    peer_endpoint: EndpointId,
    peer_session: SessionId,
}

#[derive(Default)]
struct Endpoint {
    inbox: Vec<TransportEvent>,
    routes: HashMap<SessionId, Route>,
    listeners: HashMap<SessionId, String>,
    pending: Vec<(SessionId, String)>,
}

#[derive(Default)]
struct HubInner {
    next_session: SessionId,
    next_endpoint: EndpointId,
    listeners: HashMap<String, EndpointId>,
    endpoints: HashMap<EndpointId, Endpoint>,
}

impl HubInner {
    fn alloc_session(&mut self) -> SessionId {
        self.next_session += 1;
        self.next_session
    }

    fn push(&mut self, endpoint: EndpointId, event: TransportEvent) {
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.inbox.push(event);
        }
    }

    /// Wire `local` on `from` to a fresh accepted session on the listener of
    /// `addr`.
    fn establish(&mut self, from: EndpointId, local: SessionId, addr: &str) -> Result<()> {
        let Some(&remote_endpoint) = self.listeners.get(addr) else {
            return Err(Error::NotFound(format!("no listener on {addr}")));
        };
        let remote = self.alloc_session();
        let local_name = format!("loopback:{local}");

        if let Some(ep) = self.endpoints.get_mut(&remote_endpoint) {
            ep.routes.insert(
                remote,
                Route {
                    peer_endpoint: from,
                    peer_session: local,
                },
            );
        }
        if let Some(ep) = self.endpoints.get_mut(&from) {
            ep.routes.insert(
                local,
                Route {
                    peer_endpoint: remote_endpoint,
                    peer_session: remote,
                },
            );
        }

        self.push(
            remote_endpoint,
            TransportEvent::SessionCreated(
                Session::new(remote, addr, local_name.clone())
                    .with_state(SessionState::Connected)
                    .with_accepted(true),
            ),
        );
        self.push(
            from,
            TransportEvent::SessionCreated(
                Session::new(local, local_name, addr).with_state(SessionState::Connected),
            ),
        );
        debug!(local, remote, addr, "loopback sessions connected");
        Ok(())
    }

    fn close(&mut self, endpoint: EndpointId, id: SessionId, reason: &str) -> Result<()> {
        let Some(ep) = self.endpoints.get_mut(&endpoint) else {
            return Err(Error::NotFound(format!("session {id}")));
        };
        if let Some(addr) = ep.listeners.remove(&id) {
            self.listeners.remove(&addr);
            return Ok(());
        }
        let Some(route) = ep.routes.remove(&id) else {
            return Err(Error::NotFound(format!("session {id}")));
        };
        self.push(
            endpoint,
            TransportEvent::SessionDestroyed {
                id,
                reason: reason.to_string(),
            },
        );
        if let Some(peer) = self.endpoints.get_mut(&route.peer_endpoint)
            && peer.routes.remove(&route.peer_session).is_some()
        {
            peer.inbox.push(TransportEvent::SessionDestroyed {
                id: route.peer_session,
                reason: format!("peer closed: {reason}"),
            });
        }
        Ok(())
    }
}

/// Shared switchboard for loopback transports.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this hub.
    #[must_use]
    pub fn transport(&self) -> LoopbackTransport {
        let mut inner = self.inner.lock();
        inner.next_endpoint += 1;
        let endpoint = inner.next_endpoint;
        inner.endpoints.insert(endpoint, Endpoint::default());
        LoopbackTransport {
            hub: self.clone(),
            endpoint,
            started: false,
            closed: false,
        }
    }

    /// A factory producing transports attached to this hub.
    #[must_use]
    pub fn transport_factory(&self) -> TransportFactory {
        let hub = self.clone();
        Box::new(move || Box::new(hub.transport()))
    }

    /// Returns `true` if something listens on `addr`.
    #[must_use]
    pub fn is_listening(&self, addr: &str) -> bool {
        self.inner.lock().listeners.contains_key(addr)
    }
}

impl std::fmt::Debug for LoopbackHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LoopbackHub")
            .field("endpoints", &inner.endpoints.len())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

/// One service's view of a [`LoopbackHub`].
#[derive(Debug)]
pub struct LoopbackTransport {
    hub: LoopbackHub,
    endpoint: EndpointId,
    started: bool,
    closed: bool,
}

impl LoopbackTransport {
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::NotStarted("loopback transport is shut down".into()));
        }
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn start(&mut self, pollers: usize) -> Result<()> {
        self.ensure_open()?;
        self.started = true;
        trace!(endpoint = self.endpoint, pollers, "loopback transport started");
        Ok(())
    }

    fn listen(&mut self, addr: &str) -> Result<SessionId> {
        self.ensure_open()?;
        let mut hub = self.hub.inner.lock();
        if hub.listeners.contains_key(addr) {
            return Err(Error::InvalidArgument(format!("address {addr} already in use")));
        }
        let id = hub.alloc_session();
        hub.listeners.insert(addr.to_string(), self.endpoint);
        if let Some(ep) = hub.endpoints.get_mut(&self.endpoint) {
            ep.listeners.insert(id, addr.to_string());
        }
        debug!(session = id, addr, "loopback listening");
        Ok(id)
    }

    fn connect(&mut self, addr: &str) -> Result<SessionId> {
        self.ensure_open()?;
        let mut hub = self.hub.inner.lock();
        if !hub.listeners.contains_key(addr) {
            return Err(Error::NotFound(format!("no listener on {addr}")));
        }
        let id = hub.alloc_session();
        hub.establish(self.endpoint, id, addr)?;
        Ok(id)
    }

    fn async_connect(&mut self, addr: &str) -> Result<SessionId> {
        self.ensure_open()?;
        let mut hub = self.hub.inner.lock();
        let id = hub.alloc_session();
        if let Some(ep) = hub.endpoints.get_mut(&self.endpoint) {
            ep.pending.push((id, addr.to_string()));
        }
        Ok(id)
    }

    fn remove_session(&mut self, id: SessionId, reason: &str) -> Result<()> {
        self.ensure_open()?;
        self.hub.inner.lock().close(self.endpoint, id, reason)
    }

    fn send(&mut self, mut packet: Box<Packet>) -> std::result::Result<(), SendError> {
        if let Err(err) = self.ensure_open() {
            return Err(SendError::new(err, packet));
        }
        let mut hub = self.hub.inner.lock();
        let Some(route) = hub
            .endpoints
            .get(&self.endpoint)
            .and_then(|ep| ep.routes.get(&packet.session_id).copied())
        else {
            let err = Error::NotFound(format!("session {}", packet.session_id));
            return Err(SendError::new(err, packet));
        };
        packet.session_id = route.peer_session;
        hub.push(route.peer_endpoint, TransportEvent::Packet(packet));
        Ok(())
    }

    fn pump_once(&mut self) -> Vec<TransportEvent> {
        if self.closed {
            return Vec::new();
        }
        let mut hub = self.hub.inner.lock();
        let pending = hub
            .endpoints
            .get_mut(&self.endpoint)
            .map(|ep| std::mem::take(&mut ep.pending))
            .unwrap_or_default();
        for (id, addr) in pending {
            if let Err(err) = hub.establish(self.endpoint, id, &addr) {
                hub.push(
                    self.endpoint,
                    TransportEvent::SessionDestroyed {
                        id,
                        reason: err.to_string(),
                    },
                );
            }
        }
        hub.endpoints
            .get_mut(&self.endpoint)
            .map(|ep| std::mem::take(&mut ep.inbox))
            .unwrap_or_default()
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.started = false;
        let mut hub = self.hub.inner.lock();
        let (sessions, listeners): (Vec<SessionId>, Vec<SessionId>) = match hub.endpoints.get(&self.endpoint) {
            Some(ep) => (ep.routes.keys().copied().collect(), ep.listeners.keys().copied().collect()),
            None => return,
        };
        for id in sessions.into_iter().chain(listeners) {
            if let Err(err) = hub.close(self.endpoint, id, "transport shut down") {
                warn!(
                    endpoint = self.endpoint,
                    session = id,
                    error = %err,
                    "failed to close session during shutdown"
                );
            }
        }
        hub.endpoints.remove(&self.endpoint);
        debug!(endpoint = self.endpoint, "loopback transport shut down");
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(events: &[TransportEvent]) -> Vec<&Session> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::SessionCreated(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_creates_session_pair_and_routes_packets() {
        let hub = LoopbackHub::new();
        let mut server = hub.transport();
        let mut client = hub.transport();
        server.listen("svc").unwrap();
        assert!(hub.is_listening("svc"));

        let client_session = client.connect("svc").unwrap();
        let client_events = client.pump_once();
        assert_eq!(created(&client_events)[0].id, client_session);

        let server_events = server.pump_once();
        let accepted = created(&server_events)[0].clone();
        assert!(accepted.accepted);
        assert!(accepted.is_connected());

        client
            .send(Box::new(Packet::new(client_session, 7, vec![9])))
            .unwrap();
        let mut arrived = server.pump_once();
        let Some(TransportEvent::Packet(packet)) = arrived.pop() else {
            panic!("expected a packet");
        };
        assert_eq!(packet.session_id, accepted.id);
        assert_eq!(packet.payload, vec![9]);
    }

    #[test]
    fn test_listen_twice_and_connect_nowhere() {
        let hub = LoopbackHub::new();
        let mut a = hub.transport();
        let mut b = hub.transport();
        a.listen("x").unwrap();
        assert!(matches!(b.listen("x"), Err(Error::InvalidArgument(_))));
        assert!(matches!(b.connect("y"), Err(Error::NotFound(_))));
        let refused = b.send(Box::new(Packet::new(99, 0, vec![1, 2]))).unwrap_err();
        assert!(matches!(refused.error, Error::NotFound(_)));
        assert_eq!(refused.packet.session_id, 99);
        assert_eq!(refused.packet.payload, vec![1, 2]);

        b.shutdown();
        let refused = b.send(Box::new(Packet::new(99, 0, Vec::new()))).unwrap_err();
        assert!(matches!(refused.error, Error::NotStarted(_)));
    }

    #[test]
    fn test_remove_session_notifies_both_sides() {
        let hub = LoopbackHub::new();
        let mut server = hub.transport();
        let mut client = hub.transport();
        server.listen("svc").unwrap();
        let id = client.connect("svc").unwrap();
        client.pump_once();
        server.pump_once();

        client.remove_session(id, "bye").unwrap();
        assert!(matches!(
            client.pump_once().as_slice(),
            [TransportEvent::SessionDestroyed { .. }]
        ));
        assert!(matches!(
            server.pump_once().as_slice(),
            [TransportEvent::SessionDestroyed { .. }]
        ));
        assert!(matches!(client.remove_session(id, "again"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_async_connect_completes_on_pump() {
        let hub = LoopbackHub::new();
        let mut server = hub.transport();
        let mut client = hub.transport();
        let refused = client.async_connect("svc").unwrap();
        assert!(matches!(
            client.pump_once().as_slice(),
            [TransportEvent::SessionDestroyed { id, .. }] if *id == refused
        ));

        server.listen("svc").unwrap();
        let id = client.async_connect("svc").unwrap();
        assert_eq!(created(&client.pump_once())[0].id, id);
    }

    #[test]
    fn test_dropping_transport_frees_address() {
        let hub = LoopbackHub::new();
        let mut server = hub.transport();
        let mut client = hub.transport();
        server.listen("svc").unwrap();
        client.connect("svc").unwrap();
        client.pump_once();
        drop(server);
        assert!(!hub.is_listening("svc"));
        assert!(matches!(
            client.pump_once().as_slice(),
            [TransportEvent::SessionDestroyed { .. }]
        ));
    }
}
