//! Service lifecycle and the per-frame loop.
//!
//! A [`Service`] moves through `Created → Started → Running → Stopping →
//! Stopped`, and back to `Created` when it is started again. Each call to
//! [`Service::main_loop`] runs one frame:
//!
//! 1. before-frame callables;
//! 2. transport I/O, packet dispatch and timers;
//! 3. after-frame callables;
//! 4. deferred event fires.
//!
//! A stop requested during a frame skips the remaining stages and is carried
//! out once the frame ends.

use std::any::Any;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::thread;
use std::time::{Duration, Instant};

use framekit_core::{
    Error, Event, EventBus, EventFirer, EventId, ListenerStub, ListenerTarget, PoolInstance, Result,
    TimerId, TimerScheduler,
};
use framekit_net::pipeline::check_opcode;
use framekit_net::{
    CodecStrategy, DispatchCommand, DispatchContext, DispatchQueue, NullTransport, Opcode, Packet,
    PacketCoder, PacketMeta, PacketPipeline, Session, SessionId, SessionState, Transport,
    TransportEvent, TransportFactory,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, trace, warn};

use crate::component::{Component, ComponentSlot, HookStatus, Phase};
use crate::config::{ServiceConfig, validate_fps};
use crate::context::ServiceContext;

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Created,
    Started,
    Running,
    Stopping,
    Stopped,
}

/// A callable posted to run inside a frame.
pub type FrameCallable = Box<dyn FnOnce(&mut ServiceContext<'_>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramePhase {
    Idle,
    BeforeFrame,
    Dispatch,
    AfterFrame,
}

/// Everything a service owns except its components.
///
/// Component hooks and frame callables reach it through [`ServiceContext`];
/// owners reach it through [`Service`].
pub struct ServiceCore {
    config: ServiceConfig,
    state: ServiceState,
    pipeline: PacketPipeline,
    event_bus: EventBus,
    collaborative_buses: Vec<EventBus>,
    transport: Box<dyn Transport>,
    transport_factory: TransportFactory,
    sessions: BTreeMap<SessionId, Session>,
    before_frame: Vec<FrameCallable>,
    after_frame: Vec<FrameCallable>,
    phase: FramePhase,
    pool: PoolInstance,
    timers: TimerScheduler,
    deferred_fires: Vec<Box<EventFirer>>,
    outbox: DispatchQueue,
    stop_requested: bool,
    last_error: Option<Error>,
    frame_count: u64,
}

impl ServiceCore {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Returns `true` between a successful start and the beginning of stop.
    #[must_use]
    pub fn is_started(&self) -> bool {
        matches!(self.state, ServiceState::Started | ServiceState::Running)
    }

    /// Returns the number of frames run since the service was created.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Returns the most recent failure, for diagnostics.
    #[must_use]
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    // Frame rate.

    #[must_use]
    pub fn fps(&self) -> u32 {
        self.config.fps
    }

    /// Change the frame rate.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] unless `fps` is within 1..=1000.
    pub fn set_fps(&mut self, fps: u32) -> Result<()> {
        let result = validate_fps(fps);
        if result.is_ok() {
            self.config.fps = fps;
        }
        self.record(result)
    }

    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        self.config.frame_interval()
    }

    // Events.

    /// Returns the service's own event bus.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Attach another bus. Component listeners on attached buses are removed
    /// when the service stops. Returns `false` if it was already attached.
    pub fn add_collaborative_event_bus(&mut self, bus: EventBus) -> bool {
        if bus.same_bus(&self.event_bus) || self.collaborative_buses.iter().any(|b| b.same_bus(&bus)) {
            return false;
        }
        self.collaborative_buses.push(bus);
        true
    }

    #[must_use]
    pub fn collaborative_event_buses(&self) -> &[EventBus] {
        &self.collaborative_buses
    }

    /// Remove a listener from the service bus or any attached bus.
    pub fn remove_listener(&mut self, stub: &ListenerStub) -> bool {
        self.event_bus.remove_listener(stub)
            || self.collaborative_buses.iter().any(|b| b.remove_listener(stub))
    }

    /// Take a pooled event and set its id.
    pub fn acquire_event(&mut self, id: EventId) -> Box<Event> {
        let mut event = self.pool.acquire::<Event>();
        event.set_id(id);
        event
    }

    /// Fire `event` on the service bus now, recycling it afterwards.
    pub fn fire_event(&mut self, event: Box<Event>) -> Option<Box<Event>> {
        self.event_bus.fire_into(event, &mut self.pool)
    }

    pub(crate) fn defer_fire(&mut self, firer: Box<EventFirer>) {
        self.deferred_fires.push(firer);
    }

    fn flush_deferred_fires(&mut self) {
        let mut fires = std::mem::take(&mut self.deferred_fires);
        for mut firer in fires.drain(..) {
            firer.fire(&mut self.pool);
            self.pool.recycle(firer);
        }
        self.deferred_fires = fires;
    }

    pub fn pool_mut(&mut self) -> &mut PoolInstance {
        &mut self.pool
    }

    /// Exchange the frame loop's pool and timer scheduler with a worker's.
    ///
    /// Called when a worker thread takes over the frame loop and again when
    /// it hands it back. Pending timers stay with the frame loop.
    pub(crate) fn swap_worker_resources(&mut self, pool: &mut PoolInstance, timers: &mut TimerScheduler) {
        std::mem::swap(&mut self.pool, pool);
        std::mem::swap(&mut self.timers, timers);
        self.timers.append(timers);
    }

    // Packet pipeline and codec.

    pub fn subscribe<F>(&mut self, opcode: Opcode, handler: F) -> Result<()>
    where
        F: FnMut(&Packet, &mut DispatchContext<'_>) + Send + 'static,
    {
        let result = self.pipeline.subscribe(opcode, handler);
        self.record(result)
    }

    pub fn pre_subscribe<F>(&mut self, opcode: Opcode, handler: F) -> Result<()>
    where
        F: FnMut(&Packet, &mut DispatchContext<'_>) -> bool + Send + 'static,
    {
        let result = self.pipeline.pre_subscribe(opcode, handler);
        self.record(result)
    }

    pub fn unify_pre_subscribe<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(&Packet, &mut DispatchContext<'_>) -> bool + Send + 'static,
    {
        let result = self.pipeline.unify_pre_subscribe(handler);
        self.record(result)
    }

    #[must_use]
    pub fn pipeline(&self) -> &PacketPipeline {
        &self.pipeline
    }

    /// Choose the codec strategy. Only legal before start.
    pub fn set_codec(&mut self, strategy: CodecStrategy) -> Result<()> {
        let result = self.pipeline.codec_mut().set_strategy(strategy);
        if result.is_ok() {
            self.config.codec = strategy;
        }
        self.record(result)
    }

    #[must_use]
    pub fn codec_strategy(&self) -> CodecStrategy {
        self.pipeline.codec().strategy()
    }

    pub fn register_coder(&mut self, opcode: Opcode, coder: Box<dyn PacketCoder>) -> Result<()> {
        let result = self.pipeline.codec_mut().register_coder(opcode, coder);
        self.record(result)
    }

    /// Register a MessagePack coder for `T` under `opcode`.
    pub fn register_coder_for<T>(&mut self, opcode: Opcode) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let result = self.pipeline.codec_mut().register::<T>(opcode);
        self.record(result)
    }

    pub fn suppress_coder_not_found_warning(&mut self) {
        self.config.suppress_coder_not_found_warning = true;
        self.pipeline.codec_mut().suppress_coder_not_found_warning();
    }

    // Frame callables and timers.

    /// Run `callable` once inside a frame.
    ///
    /// Posted before the before-frame stage, it runs in that stage. Posted
    /// while before-frame callables or packet handlers run, it runs in the
    /// after-frame stage of the same frame. Posted from an after-frame
    /// callable, it runs in the next frame's before-frame stage.
    pub fn post<F>(&mut self, callable: F)
    where
        F: FnOnce(&mut ServiceContext<'_>) + Send + 'static,
    {
        self.post_callable(Box::new(callable));
    }

    pub fn post_callable(&mut self, callable: FrameCallable) {
        match self.phase {
            FramePhase::BeforeFrame | FramePhase::Dispatch => self.after_frame.push(callable),
            FramePhase::Idle | FramePhase::AfterFrame => self.before_frame.push(callable),
        }
    }

    fn run_callables(&mut self, phase: FramePhase) {
        self.phase = phase;
        let bucket = match phase {
            FramePhase::BeforeFrame => std::mem::take(&mut self.before_frame),
            FramePhase::AfterFrame => std::mem::take(&mut self.after_frame),
            FramePhase::Idle | FramePhase::Dispatch => return,
        };
        for callable in bucket {
            let mut ctx = ServiceContext::new(self, ListenerTarget::NONE);
            callable(&mut ctx);
        }
    }

    /// Schedule `callback` on the service timer scheduler.
    pub fn schedule_timer<F>(&mut self, delay: Duration, period: Option<Duration>, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timers.schedule(delay, period, Box::new(callback))
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Ask the service to stop at the end of the current frame.
    pub fn request_stop(&mut self) {
        if !self.stop_requested {
            debug!(service = %self.config.name, "stop requested");
        }
        self.stop_requested = true;
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested
    }

    // Sessions.

    fn require_started(&self, what: &str) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(Error::NotStarted(format!(
                "{what}: service {} is {:?}",
                self.config.name, self.state
            )))
        }
    }

    /// Listen on `addr`, returning the listener session id.
    pub fn listen(&mut self, addr: &str) -> Result<SessionId> {
        let result = self
            .require_started("listen")
            .and_then(|()| self.transport.listen(addr));
        if let Ok(id) = &result {
            info!(service = %self.config.name, session = id, addr, "listening");
        }
        self.record(result)
    }

    /// Connect to `addr`. The session becomes connected on a later frame.
    pub fn connect(&mut self, addr: &str) -> Result<SessionId> {
        let result = self
            .require_started("connect")
            .and_then(|()| self.transport.connect(addr));
        self.track_connecting(&result, addr);
        self.record(result)
    }

    /// Start connecting to `addr` without waiting for the transport.
    pub fn async_connect(&mut self, addr: &str) -> Result<SessionId> {
        let result = self
            .require_started("async connect")
            .and_then(|()| self.transport.async_connect(addr));
        self.track_connecting(&result, addr);
        self.record(result)
    }

    fn track_connecting(&mut self, result: &Result<SessionId>, addr: &str) {
        if let Ok(id) = result {
            self.sessions
                .entry(*id)
                .or_insert_with(|| Session::new(*id, "", addr));
        }
    }

    /// Close a session. Its record goes away when the transport confirms.
    pub fn remove_session(&mut self, id: SessionId, reason: &str) -> Result<()> {
        let result = self
            .require_started("remove session")
            .and_then(|()| self.transport.remove_session(id, reason));
        if result.is_ok()
            && let Some(session) = self.sessions.get_mut(&id)
        {
            session.state = SessionState::Closing;
        }
        self.record(result)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // Sending.

    fn ensure_sendable(&self, opcode: Opcode) -> Result<()> {
        if !matches!(
            self.state,
            ServiceState::Started | ServiceState::Running | ServiceState::Stopping
        ) {
            return Err(Error::NotStarted(format!(
                "send: service {} is {:?}",
                self.config.name, self.state
            )));
        }
        check_opcode(self.pipeline.service_type(), opcode)
    }

    fn transmit(&mut self, session_id: SessionId, opcode: Opcode, payload: &[u8], meta: PacketMeta) -> Result<()> {
        let mut packet = self.pool.acquire::<Packet>();
        packet.session_id = session_id;
        packet.opcode = opcode;
        packet.set_meta(meta);
        packet.payload.extend_from_slice(payload);
        trace!(service = %self.config.name, session = session_id, opcode, len = payload.len(), "sending packet");
        self.transport.send(packet).map_err(|refused| {
            self.pool.recycle(refused.packet);
            refused.error
        })
    }

    /// Encode `value` and send it to one session.
    pub fn send<T: Serialize + Any>(&mut self, session_id: SessionId, opcode: Opcode, value: &T) -> Result<()> {
        self.send_ext(session_id, opcode, value, PacketMeta::default())
    }

    /// Like [`ServiceCore::send`], with status and extension fields.
    pub fn send_ext<T: Serialize + Any>(
        &mut self,
        session_id: SessionId,
        opcode: Opcode,
        value: &T,
        meta: PacketMeta,
    ) -> Result<()> {
        let result = self.encode_for_send(opcode, value).and_then(|payload| {
            self.transmit(session_id, opcode, &payload, meta)
        });
        self.record(result)
    }

    /// Send an already-encoded payload.
    pub fn send_bytes(
        &mut self,
        session_id: SessionId,
        opcode: Opcode,
        payload: &[u8],
        meta: PacketMeta,
    ) -> Result<()> {
        let result = self
            .ensure_sendable(opcode)
            .and_then(|()| self.transmit(session_id, opcode, payload, meta));
        self.record(result)
    }

    /// Encode `value` once and send it to every session in `session_ids`.
    ///
    /// Every session is attempted; the first failure is returned.
    pub fn multicast<T: Serialize + Any>(
        &mut self,
        session_ids: &[SessionId],
        opcode: Opcode,
        value: &T,
        meta: PacketMeta,
    ) -> Result<()> {
        let payload = match self.encode_for_send(opcode, value) {
            Ok(payload) => payload,
            Err(err) => return self.record(Err(err)),
        };
        let mut first_err = None;
        for &session_id in session_ids {
            if let Err(err) = self.transmit(session_id, opcode, &payload, meta) {
                warn!(service = %self.config.name, session = session_id, error = %err, "multicast send failed");
                first_err.get_or_insert(err);
            }
        }
        self.record(first_err.map_or(Ok(()), Err))
    }

    /// Send `value` to every connected session.
    pub fn broadcast<T: Serialize + Any>(&mut self, opcode: Opcode, value: &T, meta: PacketMeta) -> Result<()> {
        let targets: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_connected())
            .map(|s| s.id)
            .collect();
        self.multicast(&targets, opcode, value, meta)
    }

    fn encode_for_send<T: Serialize + Any>(&self, opcode: Opcode, value: &T) -> Result<Vec<u8>> {
        self.ensure_sendable(opcode)?;
        self.pipeline.codec().encode(opcode, value)
    }

    // Frame stages.

    fn pump_io(&mut self) {
        self.phase = FramePhase::Dispatch;
        for event in self.transport.pump_once() {
            match event {
                TransportEvent::SessionCreated(session) => {
                    debug!(
                        service = %self.config.name,
                        session = session.id,
                        peer = %session.peer_addr,
                        "session created"
                    );
                    self.sessions.insert(session.id, session);
                }
                TransportEvent::SessionDestroyed { id, reason } => {
                    debug!(service = %self.config.name, session = id, reason, "session destroyed");
                    self.sessions.remove(&id);
                }
                TransportEvent::Packet(packet) => {
                    let packet = self.pipeline.dispatch(
                        packet,
                        &self.event_bus,
                        &mut self.pool,
                        &mut self.outbox,
                    );
                    self.pool.recycle(packet);
                }
            }
        }

        if self.config.timers_enabled {
            self.timers.update(Instant::now());
        }
        self.flush_outbox();
    }

    /// Send what packet handlers queued, then apply their commands in order.
    /// Runs in the dispatch phase, so posted callables land in the
    /// after-frame stage.
    fn flush_outbox(&mut self) {
        let mut outbox = std::mem::take(&mut self.outbox);
        for packet in outbox.packets.drain(..) {
            let session = packet.session_id;
            if let Err(refused) = self.transport.send(packet) {
                warn!(service = %self.config.name, session, error = %refused.error, "failed to send queued packet");
                self.pool.recycle(refused.packet);
                self.last_error = Some(refused.error);
            }
        }
        for command in outbox.commands.drain(..) {
            match command {
                DispatchCommand::Post(work) => match work.downcast::<FrameCallable>() {
                    Ok(callable) => self.post_callable(*callable),
                    Err(_) => warn!(service = %self.config.name, "dropping posted work of unknown type"),
                },
                DispatchCommand::Stop => self.request_stop(),
                DispatchCommand::RemoveSession { id, reason } => {
                    if let Err(err) = self.remove_session(id, &reason) {
                        warn!(service = %self.config.name, session = id, error = %err, "failed to remove session");
                    }
                }
            }
        }
        self.outbox = outbox;
    }
}

impl std::fmt::Debug for ServiceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCore")
            .field("name", &self.config.name)
            .field("state", &self.state)
            .field("pipeline", &self.pipeline)
            .field("sessions", &self.sessions.len())
            .field("frame_count", &self.frame_count)
            .finish_non_exhaustive()
    }
}

/// A frame-driven network service hosting application components.
pub struct Service {
    core: ServiceCore,
    components: Vec<ComponentSlot>,
}

impl Service {
    /// Create a service without network access.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the configured codec does not fit the
    /// service type.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        Self::with_transport(config, NullTransport::factory())
    }

    /// Create a service whose transport is built by `factory`. The factory
    /// is called again each time the service stops.
    pub fn with_transport(config: ServiceConfig, factory: TransportFactory) -> Result<Self> {
        let mut pipeline = PacketPipeline::new(config.service_type);
        pipeline.codec_mut().set_strategy(config.codec)?;
        if config.suppress_coder_not_found_warning {
            pipeline.codec_mut().suppress_coder_not_found_warning();
        }
        let transport = factory();
        debug!(service = %config.name, service_type = ?config.service_type, codec = ?config.codec, "service created");

        Ok(Self {
            core: ServiceCore {
                config,
                state: ServiceState::Created,
                pipeline,
                event_bus: EventBus::new(),
                collaborative_buses: Vec::new(),
                transport,
                transport_factory: factory,
                sessions: BTreeMap::new(),
                before_frame: Vec::new(),
                after_frame: Vec::new(),
                phase: FramePhase::Idle,
                pool: PoolInstance::new(),
                timers: TimerScheduler::new(),
                deferred_fires: Vec::new(),
                outbox: DispatchQueue::new(),
                stop_requested: false,
                last_error: None,
                frame_count: 0,
            },
            components: Vec::new(),
        })
    }

    #[must_use]
    pub fn core(&self) -> &ServiceCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ServiceCore {
        &mut self.core
    }

    /// Register a component. Only legal while the service is `Created`.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyInitialized`] once the service has started.
    /// - [`Error::DuplicateRegistration`] if a component with the same name
    ///   is already registered.
    pub fn add_component<C: Component>(&mut self, component: C) -> Result<()> {
        self.add_boxed_component(Box::new(component))
    }

    pub fn add_boxed_component(&mut self, component: Box<dyn Component>) -> Result<()> {
        let result = if self.core.state != ServiceState::Created {
            Err(Error::AlreadyInitialized(format!(
                "cannot add component {} to service {} in state {:?}",
                component.name(),
                self.core.config.name,
                self.core.state
            )))
        } else if self
            .components
            .iter()
            .any(|slot| slot.component.name() == component.name())
        {
            Err(Error::DuplicateRegistration(format!(
                "component {}",
                component.name()
            )))
        } else {
            debug!(service = %self.core.config.name, component = component.name(), "component added");
            self.components.push(ComponentSlot::new(component));
            Ok(())
        };
        self.core.record(result)
    }

    #[must_use]
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Start the service: start the transport, then run the startup hooks.
    ///
    /// A stopped service is recreated first. If any hook fails, components
    /// already brought up are torn down in reverse order and the service is
    /// back in `Created`.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] if the service is running.
    /// - [`Error::HookFailed`] if a component hook failed.
    /// - Any transport start error.
    pub fn start(&mut self) -> Result<()> {
        if let Err(err) = self.recreate() {
            return self.core.record(Err(err));
        }

        let name = self.core.config.name.clone();
        info!(service = %name, components = self.components.len(), "service starting");

        let pollers = self.core.config.pollers;
        if let Err(err) = self.core.transport.start(pollers) {
            error!(service = %name, error = %err, "transport failed to start");
            return self.core.record(Err(err));
        }

        if let Err(err) = self.bring_up() {
            warn!(service = %name, error = %err, "startup failed, rolling back");
            self.tear_down();
            self.core.state = ServiceState::Created;
            return self.core.record(Err(err));
        }

        info!(service = %name, fps = self.core.config.fps, "service started");
        Ok(())
    }

    fn bring_up(&mut self) -> Result<()> {
        self.run_phase(Phase::Init)?;
        self.run_phase(Phase::LateInit)?;
        self.core.pipeline.freeze();
        self.core.state = ServiceState::Started;
        self.run_phase(Phase::Start)?;
        self.run_phase(Phase::LateStart)
    }

    /// Run one lifecycle phase across the components it applies to.
    ///
    /// Hooks returning [`HookStatus::Pending`] are called again, after the
    /// others, until they finish.
    fn run_phase(&mut self, phase: Phase) -> Result<()> {
        let n = self.components.len();
        let mut pending: Vec<usize> = match phase {
            Phase::Init | Phase::LateInit | Phase::Start | Phase::LateStart => (0..n).collect(),
            Phase::EarlyStop | Phase::Stop => (0..n)
                .rev()
                .filter(|&i| self.components[i].started)
                .collect(),
            Phase::EarlyDestroy | Phase::Destroy => (0..n)
                .rev()
                .filter(|&i| self.components[i].initialized)
                .collect(),
        };

        loop {
            let mut waiting = Vec::new();
            for idx in pending {
                let slot = &mut self.components[idx];
                let mut ctx = ServiceContext::new(&mut self.core, slot.target);
                match phase.invoke(slot.component.as_mut(), &mut ctx) {
                    Ok(HookStatus::Done) => match phase {
                        Phase::Init => slot.initialized = true,
                        Phase::Start => slot.started = true,
                        _ => {}
                    },
                    Ok(HookStatus::Pending) => waiting.push(idx),
                    Err(err) => {
                        let component = slot.component.name().to_string();
                        error!(
                            service = %self.core.config.name,
                            component = %component,
                            ?phase,
                            error = %err,
                            "component hook failed"
                        );
                        return Err(Error::HookFailed(format!("{component} {phase:?}: {err}")));
                    }
                }
            }
            if waiting.is_empty() {
                return Ok(());
            }
            trace!(service = %self.core.config.name, ?phase, pending = waiting.len(), "waiting for hooks");
            thread::sleep(self.core.config.hook_poll_interval);
            pending = waiting;
        }
    }

    /// Run one frame. Returns `false` once the service is no longer running.
    pub fn main_loop(&mut self) -> bool {
        match self.core.state {
            ServiceState::Started => {
                self.core.state = ServiceState::Running;
                debug!(service = %self.core.config.name, "first frame");
            }
            ServiceState::Running => {}
            _ => return false,
        }
        self.core.frame_count += 1;

        if !self.core.stop_requested {
            self.core.run_callables(FramePhase::BeforeFrame);
        }
        if !self.core.stop_requested {
            self.core.pump_io();
        }
        if !self.core.stop_requested {
            self.core.run_callables(FramePhase::AfterFrame);
        }
        self.core.phase = FramePhase::Idle;
        self.core.flush_deferred_fires();

        if self.core.stop_requested {
            self.finalize();
            return false;
        }
        true
    }

    /// Stop the service now. Does nothing unless it is started.
    ///
    /// Hooks and frame callables should call
    /// [`ServiceCore::request_stop`] instead.
    pub fn stop(&mut self) {
        if self.core.is_started() {
            self.finalize();
        }
    }

    /// Return a stopped service to `Created`. A created service is left as is.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyStarted`] while the service is started or stopping.
    pub fn recreate(&mut self) -> Result<()> {
        match self.core.state {
            ServiceState::Created => Ok(()),
            ServiceState::Stopped => {
                self.core.state = ServiceState::Created;
                self.core.frame_count = 0;
                debug!(service = %self.core.config.name, "service recreated");
                Ok(())
            }
            ServiceState::Started | ServiceState::Running | ServiceState::Stopping => {
                Err(Error::AlreadyStarted)
            }
        }
    }

    fn finalize(&mut self) {
        info!(service = %self.core.config.name, frames = self.core.frame_count, "service stopping");
        self.core.state = ServiceState::Stopping;
        self.tear_down();
        self.core.state = ServiceState::Stopped;
        info!(service = %self.core.config.name, "service stopped");
    }

    /// Run the shutdown hooks for whatever was brought up, then release
    /// handlers, callables, listeners and the transport.
    fn tear_down(&mut self) {
        for phase in [Phase::EarlyStop, Phase::Stop, Phase::EarlyDestroy, Phase::Destroy] {
            if let Err(err) = self.run_phase(phase) {
                warn!(service = %self.core.config.name, ?phase, error = %err, "shutdown hook failed");
            }
        }

        let core = &mut self.core;
        for slot in &mut self.components {
            let mut removed = core.event_bus.remove_listeners_of(slot.target);
            for bus in &core.collaborative_buses {
                removed += bus.remove_listeners_of(slot.target);
            }
            if removed > 0 {
                debug!(service = %core.config.name, component = slot.component.name(), removed, "listeners removed");
            }
            slot.initialized = false;
            slot.started = false;
        }

        core.pipeline.clear();
        core.before_frame.clear();
        core.after_frame.clear();
        core.timers.clear();
        for mut firer in core.deferred_fires.drain(..) {
            firer.clear(&mut core.pool);
            core.pool.recycle(firer);
        }
        for packet in core.outbox.packets.drain(..) {
            core.pool.recycle(packet);
        }
        core.outbox.commands.clear();

        core.transport.shutdown();
        core.transport = (core.transport_factory)();
        core.sessions.clear();
        core.stop_requested = false;
        core.phase = FramePhase::Idle;
    }
}

impl Deref for Service {
    type Target = ServiceCore;

    fn deref(&self) -> &ServiceCore {
        &self.core
    }
}

impl DerefMut for Service {
    fn deref_mut(&mut self) -> &mut ServiceCore {
        &mut self.core
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if self.core.is_started() {
            self.finalize();
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("core", &self.core)
            .field("components", &self.components.len())
            .finish()
    }
}
