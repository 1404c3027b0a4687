//! Opcode-indexed packet dispatch.
//!
//! Every received packet goes through, in order:
//!
//! 1. payload decoding by the service [`Codec`];
//! 2. the unify pre-subscriber (one for all opcodes), if any;
//! 3. the opcode's pre-subscriber, if any;
//! 4. the opcode's subscriber.
//!
//! A pre-subscriber returning `false` drops the packet. Handlers can only be
//! registered while the pipeline is not frozen; the service freezes it on
//! start and clears it on stop.
//!
//! Handlers do not own the service. Whatever they send or ask of it is
//! collected in a [`DispatchQueue`] that the service applies once dispatch
//! of the frame's packets is over.

use std::any::Any;
use std::collections::HashMap;

use framekit_core::{Error, Event, EventBus, EventId, PoolInstance, Result};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::codec::{Codec, ServiceType};
use crate::packet::{Opcode, Packet, PacketMeta, SessionId};

/// Main handler for one opcode.
pub type PacketHandler = Box<dyn FnMut(&Packet, &mut DispatchContext<'_>) + Send>;

/// Filter run before the main handler; returning `false` drops the packet.
pub type PreHandler = Box<dyn FnMut(&Packet, &mut DispatchContext<'_>) -> bool + Send>;

/// A request a packet handler makes of its service.
pub enum DispatchCommand {
    /// Work for the service frame. The service decides the concrete type and
    /// drops anything it does not recognize.
    Post(Box<dyn Any + Send>),
    /// Stop the service at the end of the frame.
    Stop,
    /// Close a session.
    RemoveSession { id: SessionId, reason: String },
}

impl std::fmt::Debug for DispatchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchCommand::Post(_) => f.write_str("Post(..)"),
            DispatchCommand::Stop => f.write_str("Stop"),
            DispatchCommand::RemoveSession { id, reason } => f
                .debug_struct("RemoveSession")
                .field("id", id)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Packets and commands queued by handlers, in the order they were made.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    pub packets: Vec<Box<Packet>>,
    pub commands: Vec<DispatchCommand>,
}

impl DispatchQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty() && self.commands.is_empty()
    }
}

/// What packet handlers can reach while a packet is dispatched.
pub struct DispatchContext<'a> {
    events: &'a EventBus,
    pool: &'a mut PoolInstance,
    codec: &'a Codec,
    queue: &'a mut DispatchQueue,
}

impl<'a> DispatchContext<'a> {
    pub fn new(
        events: &'a EventBus,
        pool: &'a mut PoolInstance,
        codec: &'a Codec,
        queue: &'a mut DispatchQueue,
    ) -> Self {
        Self {
            events,
            pool,
            codec,
            queue,
        }
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        self.events
    }

    pub fn pool(&mut self) -> &mut PoolInstance {
        &mut *self.pool
    }

    #[must_use]
    pub fn codec(&self) -> &Codec {
        self.codec
    }

    /// Take a pooled event and set its id.
    pub fn acquire_event(&mut self, id: EventId) -> Box<Event> {
        let mut event = self.pool.acquire::<Event>();
        event.set_id(id);
        event
    }

    /// Fire `event` on the service bus, recycling it afterwards.
    pub fn fire(&mut self, event: Box<Event>) -> Option<Box<Event>> {
        self.events.fire_into(event, &mut *self.pool)
    }

    /// Queue an encoded packet for the transport.
    pub fn send<T: Serialize + Any>(&mut self, session_id: SessionId, opcode: Opcode, value: &T) -> Result<()> {
        self.send_ext(session_id, opcode, value, PacketMeta::default())
    }

    /// Like [`DispatchContext::send`], with status and extension fields.
    pub fn send_ext<T: Serialize + Any>(
        &mut self,
        session_id: SessionId,
        opcode: Opcode,
        value: &T,
        meta: PacketMeta,
    ) -> Result<()> {
        let payload = self.codec.encode(opcode, value)?;
        self.enqueue(session_id, opcode, &payload, meta);
        Ok(())
    }

    /// Queue an already-encoded payload.
    pub fn send_bytes(
        &mut self,
        session_id: SessionId,
        opcode: Opcode,
        payload: &[u8],
        meta: PacketMeta,
    ) -> Result<()> {
        check_opcode(self.codec.service_type(), opcode)?;
        self.enqueue(session_id, opcode, payload, meta);
        Ok(())
    }

    /// Send `value` back on the session `to` arrived on, with the same opcode.
    pub fn reply<T: Serialize + Any>(&mut self, to: &Packet, value: &T) -> Result<()> {
        self.send(to.session_id, to.opcode, value)
    }

    /// Hand `work` to the service once dispatch is over.
    pub fn post_boxed(&mut self, work: Box<dyn Any + Send>) {
        self.queue.commands.push(DispatchCommand::Post(work));
    }

    /// Ask the service to stop at the end of the current frame.
    pub fn request_stop(&mut self) {
        self.queue.commands.push(DispatchCommand::Stop);
    }

    /// Close `id` once dispatch is over, after queued packets are sent.
    pub fn remove_session(&mut self, id: SessionId, reason: &str) {
        self.queue.commands.push(DispatchCommand::RemoveSession {
            id,
            reason: reason.to_string(),
        });
    }

    fn enqueue(&mut self, session_id: SessionId, opcode: Opcode, payload: &[u8], meta: PacketMeta) {
        let mut packet = self.pool.acquire::<Packet>();
        packet.session_id = session_id;
        packet.opcode = opcode;
        packet.set_meta(meta);
        packet.payload.extend_from_slice(payload);
        self.queue.packets.push(packet);
    }
}

/// Reject nonzero opcodes on raw services.
pub fn check_opcode(service_type: ServiceType, opcode: Opcode) -> Result<()> {
    if service_type == ServiceType::Raw && opcode != 0 {
        return Err(Error::InvalidArgument(format!(
            "raw services only accept opcode 0, got {opcode}"
        )));
    }
    Ok(())
}

/// The dispatch table of one service.
pub struct PacketPipeline {
    codec: Codec,
    frozen: bool,
    unify_pre: Option<PreHandler>,
    pre: HashMap<Opcode, PreHandler>,
    subscribers: HashMap<Opcode, PacketHandler>,
}

impl PacketPipeline {
    #[must_use]
    pub fn new(service_type: ServiceType) -> Self {
        Self::with_codec(Codec::new(service_type))
    }

    #[must_use]
    pub fn with_codec(codec: Codec) -> Self {
        Self {
            codec,
            frozen: false,
            unify_pre: None,
            pre: HashMap::new(),
            subscribers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn service_type(&self) -> ServiceType {
        self.codec.service_type()
    }

    #[must_use]
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn codec_mut(&mut self) -> &mut Codec {
        &mut self.codec
    }

    /// Register the main handler for `opcode`.
    pub fn subscribe<F>(&mut self, opcode: Opcode, handler: F) -> Result<()>
    where
        F: FnMut(&Packet, &mut DispatchContext<'_>) + Send + 'static,
    {
        self.check_registration(opcode)?;
        if self.subscribers.contains_key(&opcode) {
            return Err(Error::DuplicateRegistration(format!(
                "subscriber for opcode {opcode}"
            )));
        }
        self.subscribers.insert(opcode, Box::new(handler));
        debug!(opcode, "subscribed");
        Ok(())
    }

    /// Register the pre-subscriber for `opcode`.
    pub fn pre_subscribe<F>(&mut self, opcode: Opcode, handler: F) -> Result<()>
    where
        F: FnMut(&Packet, &mut DispatchContext<'_>) -> bool + Send + 'static,
    {
        self.check_registration(opcode)?;
        if self.pre.contains_key(&opcode) {
            return Err(Error::DuplicateRegistration(format!(
                "pre-subscriber for opcode {opcode}"
            )));
        }
        self.pre.insert(opcode, Box::new(handler));
        debug!(opcode, "pre-subscribed");
        Ok(())
    }

    /// Register the pre-subscriber shared by every opcode.
    pub fn unify_pre_subscribe<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(&Packet, &mut DispatchContext<'_>) -> bool + Send + 'static,
    {
        self.check_registration(0)?;
        if self.unify_pre.is_some() {
            return Err(Error::DuplicateRegistration("unify pre-subscriber".into()));
        }
        self.unify_pre = Some(Box::new(handler));
        debug!("unify pre-subscribed");
        Ok(())
    }

    fn check_registration(&self, opcode: Opcode) -> Result<()> {
        if self.frozen {
            return Err(Error::AlreadyInitialized(format!(
                "cannot register handler for opcode {opcode} while running"
            )));
        }
        check_opcode(self.service_type(), opcode)
    }

    #[must_use]
    pub fn is_subscribed(&self, opcode: Opcode) -> bool {
        self.subscribers.contains_key(&opcode)
    }

    #[must_use]
    pub fn is_pre_subscribed(&self, opcode: Opcode) -> bool {
        self.pre.contains_key(&opcode)
    }

    #[must_use]
    pub fn has_unify_pre_subscriber(&self) -> bool {
        self.unify_pre.is_some()
    }

    /// Lock the handler table and codec.
    pub fn freeze(&mut self) {
        self.frozen = true;
        self.codec.freeze();
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Drop every handler and coder and unlock the table. The codec
    /// strategy is kept.
    pub fn clear(&mut self) {
        self.unify_pre = None;
        self.pre.clear();
        self.subscribers.clear();
        self.frozen = false;
        self.codec.clear_coders();
        self.codec.unfreeze();
    }

    /// Run `packet` through the pipeline and hand it back for recycling.
    pub fn dispatch(
        &mut self,
        mut packet: Box<Packet>,
        events: &EventBus,
        pool: &mut PoolInstance,
        queue: &mut DispatchQueue,
    ) -> Box<Packet> {
        let Self {
            codec,
            unify_pre,
            pre,
            subscribers,
            ..
        } = self;

        if let Err(err) = codec.decode_into(&mut packet) {
            warn!(
                session = packet.session_id,
                opcode = packet.opcode,
                error = %err,
                "failed to decode packet, dropping"
            );
            return packet;
        }

        let mut ctx = DispatchContext::new(events, pool, codec, queue);

        if let Some(hook) = unify_pre.as_mut()
            && !hook(&packet, &mut ctx)
        {
            trace!(opcode = packet.opcode, "packet dropped by unify pre-subscriber");
            return packet;
        }

        if let Some(hook) = pre.get_mut(&packet.opcode)
            && !hook(&packet, &mut ctx)
        {
            trace!(opcode = packet.opcode, "packet dropped by pre-subscriber");
            return packet;
        }

        match subscribers.get_mut(&packet.opcode) {
            Some(handler) => handler(&packet, &mut ctx),
            None => debug!(
                session = packet.session_id,
                opcode = packet.opcode,
                "no subscriber for opcode"
            ),
        }
        packet
    }
}

impl std::fmt::Debug for PacketPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketPipeline")
            .field("codec", &self.codec)
            .field("frozen", &self.frozen)
            .field("unify_pre", &self.unify_pre.is_some())
            .field("pre", &self.pre.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use framekit_core::ListenerTarget;
    use parking_lot::Mutex;

    use super::*;

    struct Harness {
        bus: EventBus,
        pool: PoolInstance,
        queue: DispatchQueue,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                bus: EventBus::new(),
                pool: PoolInstance::new(),
                queue: DispatchQueue::new(),
            }
        }

        fn run(&mut self, pipeline: &mut PacketPipeline, packet: Packet) -> Box<Packet> {
            pipeline.dispatch(Box::new(packet), &self.bus, &mut self.pool, &mut self.queue)
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        (log, move |s| l.lock().push(s))
    }

    #[test]
    fn test_duplicate_subscribe_fails_and_tables_are_independent() {
        let mut pipeline = PacketPipeline::new(ServiceType::Normal);
        pipeline.subscribe(1, |_, _| {}).unwrap();
        assert!(matches!(
            pipeline.subscribe(1, |_, _| {}),
            Err(Error::DuplicateRegistration(_))
        ));
        pipeline.pre_subscribe(1, |_, _| true).unwrap();
        assert!(matches!(
            pipeline.pre_subscribe(1, |_, _| true),
            Err(Error::DuplicateRegistration(_))
        ));
        pipeline.pre_subscribe(2, |_, _| true).unwrap();
        assert!(!pipeline.is_subscribed(2));
        pipeline.unify_pre_subscribe(|_, _| true).unwrap();
        assert!(matches!(
            pipeline.unify_pre_subscribe(|_, _| true),
            Err(Error::DuplicateRegistration(_))
        ));
    }

    #[test]
    fn test_dispatch_order_and_drop() {
        let (log, rec) = recorder();
        let mut pipeline = PacketPipeline::new(ServiceType::Normal);
        let r = rec.clone();
        pipeline
            .unify_pre_subscribe(move |_, _| {
                r("unify");
                true
            })
            .unwrap();
        let r = rec.clone();
        pipeline
            .pre_subscribe(3, move |p, _| {
                r("pre");
                p.status == 0
            })
            .unwrap();
        let r = rec.clone();
        pipeline.subscribe(3, move |_, _| r("main")).unwrap();

        let mut harness = Harness::new();
        harness.run(&mut pipeline, Packet::new(1, 3, Vec::new()));
        assert_eq!(*log.lock(), vec!["unify", "pre", "main"]);

        log.lock().clear();
        let mut rejected = Packet::new(1, 3, Vec::new());
        rejected.status = 1;
        harness.run(&mut pipeline, rejected);
        assert_eq!(*log.lock(), vec!["unify", "pre"]);

        log.lock().clear();
        let returned = harness.run(&mut pipeline, Packet::new(1, 99, vec![1, 2]));
        assert_eq!(*log.lock(), vec!["unify"]);
        assert_eq!(returned.payload, vec![1, 2]);
    }

    #[test]
    fn test_frozen_pipeline_rejects_registration() {
        let mut pipeline = PacketPipeline::new(ServiceType::Normal);
        pipeline.freeze();
        assert!(matches!(
            pipeline.subscribe(1, |_, _| {}),
            Err(Error::AlreadyInitialized(_))
        ));
        pipeline.clear();
        pipeline.subscribe(1, |_, _| {}).unwrap();
    }

    #[test]
    fn test_clear_drops_coders_but_keeps_strategy() {
        let mut pipeline = PacketPipeline::new(ServiceType::Normal);
        pipeline
            .codec_mut()
            .set_strategy(crate::codec::CodecStrategy::Json)
            .unwrap();
        pipeline.clear();
        assert_eq!(
            pipeline.codec().strategy(),
            crate::codec::CodecStrategy::Json
        );

        let mut binary = PacketPipeline::new(ServiceType::Normal);
        binary.codec_mut().register::<u32>(1).unwrap();
        binary.freeze();
        binary.clear();
        assert!(!binary.codec().has_coder(1));
        binary.codec_mut().register::<u32>(1).unwrap();
    }

    #[test]
    fn test_raw_pipeline_only_accepts_opcode_zero() {
        let mut pipeline = PacketPipeline::new(ServiceType::Raw);
        assert!(matches!(
            pipeline.subscribe(5, |_, _| {}),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            pipeline.pre_subscribe(5, |_, _| true),
            Err(Error::InvalidArgument(_))
        ));
        pipeline.subscribe(0, |_, _| {}).unwrap();
        pipeline.unify_pre_subscribe(|_, _| true).unwrap();
    }

    #[test]
    fn test_handler_replies_and_fires_events() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Ping(u32);

        let mut pipeline = PacketPipeline::new(ServiceType::Normal);
        pipeline.codec_mut().register::<Ping>(10).unwrap();
        pipeline
            .subscribe(10, |packet, ctx| {
                let Some(Ping(n)) = packet.decoded::<Ping>() else {
                    return;
                };
                let mut event = ctx.acquire_event(100);
                event.add_param(*n);
                ctx.fire(event);
                ctx.reply(packet, &Ping(n + 1)).unwrap();
            })
            .unwrap();

        let mut harness = Harness::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        harness.bus.add_listener(100, ListenerTarget::NONE, move |e| {
            *s.lock() = e.param(0).cloned();
        });

        let payload = pipeline.codec().encode(10, &Ping(1)).unwrap();
        harness.run(&mut pipeline, Packet::new(4, 10, payload));

        assert_eq!(*seen.lock(), Some(serde_json::Value::from(1)));
        assert_eq!(harness.queue.packets.len(), 1);
        assert!(harness.queue.commands.is_empty());
        let out = &harness.queue.packets[0];
        assert_eq!((out.session_id, out.opcode), (4, 10));
        assert_eq!(out.decode_msgpack::<Ping>().unwrap(), Ping(2));
    }

    #[test]
    fn test_handler_commands_are_queued_in_order() {
        let mut pipeline = PacketPipeline::new(ServiceType::Normal);
        pipeline
            .subscribe(2, |packet, ctx| {
                ctx.post_boxed(Box::new(17_u32));
                ctx.remove_session(packet.session_id, "kicked");
                ctx.request_stop();
            })
            .unwrap();

        let mut harness = Harness::new();
        harness.run(&mut pipeline, Packet::new(6, 2, Vec::new()));
        assert!(harness.queue.packets.is_empty());

        let mut commands = harness.queue.commands.drain(..);
        let Some(DispatchCommand::Post(work)) = commands.next() else {
            panic!("expected a post first");
        };
        assert_eq!(work.downcast::<u32>().ok().map(|n| *n), Some(17));
        assert!(matches!(
            commands.next(),
            Some(DispatchCommand::RemoveSession { id: 6, ref reason }) if reason == "kicked"
        ));
        assert!(matches!(commands.next(), Some(DispatchCommand::Stop)));
        assert!(commands.next().is_none());
    }

    #[test]
    fn test_undecodable_packet_is_dropped() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Strict {
            value: u64,
        }

        let (log, rec) = recorder();
        let mut pipeline = PacketPipeline::new(ServiceType::Normal);
        pipeline.codec_mut().register::<Strict>(1).unwrap();
        pipeline.subscribe(1, move |_, _| rec("main")).unwrap();
        let mut harness = Harness::new();
        harness.run(&mut pipeline, Packet::new(1, 1, vec![0xC1]));
        assert!(log.lock().is_empty());
    }
}
