//! The view of a service handed to component hooks and frame callables.

use std::ops::{Deref, DerefMut};

use framekit_core::{Event, EventBus, EventFirer, EventId, ListenerStub, ListenerTarget};
use framekit_net::DispatchContext;

use crate::service::{FrameCallable, ServiceCore};

/// Access to the owning service from a hook or posted callable.
///
/// Dereferences to [`ServiceCore`] for sending, subscribing, posting and
/// session management. Listeners added through the context are tagged with
/// the calling component so the service can remove them on stop.
pub struct ServiceContext<'a> {
    core: &'a mut ServiceCore,
    target: ListenerTarget,
}

impl<'a> ServiceContext<'a> {
    pub(crate) fn new(core: &'a mut ServiceCore, target: ListenerTarget) -> Self {
        Self { core, target }
    }

    /// Returns the listener owner used for registrations made through this
    /// context. [`ListenerTarget::NONE`] outside component hooks.
    #[must_use]
    pub fn target(&self) -> ListenerTarget {
        self.target
    }

    /// Listen for `event_id` on the service bus.
    pub fn add_listener<F>(&mut self, event_id: EventId, handler: F) -> ListenerStub
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.core.event_bus().add_listener(event_id, self.target, handler)
    }

    /// Listen for `event_id` on another bus. The bus is attached to the
    /// service as a collaborative bus so the listener is removed on stop.
    pub fn add_listener_on<F>(&mut self, bus: &EventBus, event_id: EventId, handler: F) -> ListenerStub
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.core.add_collaborative_event_bus(bus.clone());
        bus.add_listener(event_id, self.target, handler)
    }

    /// Fire `event` once the current frame has finished.
    pub fn fire_later(&mut self, event: Box<Event>) {
        let bus = self.core.event_bus().clone();
        let mut firer = self.core.pool_mut().acquire::<EventFirer>();
        firer.set_event(event, bus);
        self.core.defer_fire(firer);
    }
}

impl Deref for ServiceContext<'_> {
    type Target = ServiceCore;

    fn deref(&self) -> &ServiceCore {
        &*self.core
    }
}

impl DerefMut for ServiceContext<'_> {
    fn deref_mut(&mut self) -> &mut ServiceCore {
        &mut *self.core
    }
}

/// Frame posting for packet handlers.
pub trait DispatchContextExt {
    /// Run `callable` in the after-frame stage of the frame that dispatched
    /// the packet.
    fn post<F>(&mut self, callable: F)
    where
        F: FnOnce(&mut ServiceContext<'_>) + Send + 'static;
}

impl DispatchContextExt for DispatchContext<'_> {
    fn post<F>(&mut self, callable: F)
    where
        F: FnOnce(&mut ServiceContext<'_>) + Send + 'static,
    {
        let callable: FrameCallable = Box::new(callable);
        self.post_boxed(Box::new(callable));
    }
}
