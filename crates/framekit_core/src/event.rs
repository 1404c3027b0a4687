//! Id-keyed multicast event bus.
//!
//! Listeners are registered per event id and identified by a
//! [`ListenerStub`]. [`EventBus::fire`] takes a snapshot of the listener set
//! for the event id, releases the bus lock, and then calls every listener in
//! registration order on the calling thread. Listeners may therefore add or
//! remove listeners (including themselves) while a fire is in progress:
//!
//! - a listener added during a fire is not called by that fire;
//! - a listener removed during a fire is still called by that fire if it was
//!   part of the snapshot, and never by a later one.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{trace, warn};

use crate::error::Result;
use crate::pool::{OrderTable, PoolInstance, Poolable};

/// Integer identifier of an event kind.
pub type EventId = i32;

/// Maximum nesting of [`EventBus::fire`] calls on one thread.
pub const MAX_FIRE_DEPTH: usize = 64;

/// Listener sequence numbers are unique across every bus in the process, so
/// a stub never matches a registration on a bus other than its own.
static NEXT_LISTENER_SEQ: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static FIRE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Identifies the owner of a listener, used for bulk removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ListenerTarget(pub u64);

impl ListenerTarget {
    /// Listeners that belong to nobody in particular.
    pub const NONE: ListenerTarget = ListenerTarget(0);
}

/// Opaque handle for one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerStub {
    event_id: EventId,
    seq: u64,
}

impl ListenerStub {
    /// A stub that never refers to a registration.
    pub const INVALID: ListenerStub = ListenerStub { event_id: 0, seq: 0 };

    /// Returns the event id the listener was registered for.
    #[must_use]
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Returns `false` for [`ListenerStub::INVALID`].
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.seq != 0
    }
}

impl Default for ListenerStub {
    fn default() -> Self {
        Self::INVALID
    }
}

/// An event: an id plus positional and named parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    id: EventId,
    params: Vec<Value>,
    named: HashMap<String, Value>,
    retain_after_fire: bool,
}

impl Event {
    /// Create an event with the given id and no parameters.
    #[must_use]
    pub fn new(id: EventId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Returns the event id.
    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Change the event id (used when reusing a pooled event).
    pub fn set_id(&mut self, id: EventId) {
        self.id = id;
    }

    /// Append a positional parameter.
    pub fn add_param(&mut self, value: impl Into<Value>) -> &mut Self {
        self.params.push(value.into());
        self
    }

    /// Set a named parameter, replacing any previous value under `key`.
    pub fn add_named_param(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.named.insert(key.into(), value.into());
        self
    }

    /// Builder form of [`Event::add_param`].
    #[must_use]
    pub fn with_param(mut self, value: impl Into<Value>) -> Self {
        self.add_param(value);
        self
    }

    /// Builder form of [`Event::add_named_param`].
    #[must_use]
    pub fn with_named_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add_named_param(key, value);
        self
    }

    /// Returns the positional parameter at `index`.
    #[must_use]
    pub fn param(&self, index: usize) -> Option<&Value> {
        self.params.get(index)
    }

    /// Returns the named parameter under `key`.
    #[must_use]
    pub fn named_param(&self, key: &str) -> Option<&Value> {
        self.named.get(key)
    }

    /// Returns all positional parameters in insertion order.
    #[must_use]
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Returns the number of positional parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Returns the number of named parameters.
    #[must_use]
    pub fn named_param_count(&self) -> usize {
        self.named.len()
    }

    /// Keep the event alive after [`EventBus::fire`] instead of disposing it.
    pub fn set_retain_after_fire(&mut self, retain: bool) {
        self.retain_after_fire = retain;
    }

    /// Returns `true` if the event survives a fire.
    #[must_use]
    pub fn is_retain_after_fire(&self) -> bool {
        self.retain_after_fire
    }
}

impl Poolable for Event {
    fn reset(&mut self) {
        self.id = 0;
        self.params.clear();
        self.named.clear();
        self.retain_after_fire = false;
    }
}

type ListenerFn = dyn Fn(&Event) + Send + Sync;

struct Listener {
    target: ListenerTarget,
    handler: Arc<ListenerFn>,
}

#[derive(Default)]
struct BusInner {
    listeners: HashMap<EventId, BTreeMap<u64, Listener>>,
}

/// A multicast publish/subscribe bus keyed by [`EventId`].
///
/// Cloning an `EventBus` yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_id` on behalf of `target`.
    pub fn add_listener<F>(&self, event_id: EventId, target: ListenerTarget, handler: F) -> ListenerStub
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let seq = NEXT_LISTENER_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.listeners.entry(event_id).or_default().insert(
            seq,
            Listener {
                target,
                handler: Arc::new(handler),
            },
        );
        trace!(event_id, seq, target = target.0, "listener added");
        ListenerStub { event_id, seq }
    }

    /// Remove the listener identified by `stub`.
    ///
    /// Returns `false` if the stub was already removed or never valid; that is
    /// not an error.
    pub fn remove_listener(&self, stub: &ListenerStub) -> bool {
        if !stub.is_valid() {
            return false;
        }
        let mut inner = self.inner.lock();
        let Some(bucket) = inner.listeners.get_mut(&stub.event_id) else {
            return false;
        };
        let removed = bucket.remove(&stub.seq).is_some();
        if bucket.is_empty() {
            inner.listeners.remove(&stub.event_id);
        }
        removed
    }

    /// Remove every listener registered on behalf of `target`.
    ///
    /// Returns the number of listeners removed.
    pub fn remove_listeners_of(&self, target: ListenerTarget) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        inner.listeners.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|_, l| l.target != target);
            removed += before - bucket.len();
            !bucket.is_empty()
        });
        removed
    }

    /// Returns `true` if `stub` still refers to a registered listener.
    #[must_use]
    pub fn has_listener(&self, stub: &ListenerStub) -> bool {
        self.inner
            .lock()
            .listeners
            .get(&stub.event_id)
            .is_some_and(|b| b.contains_key(&stub.seq))
    }

    /// Returns the number of listeners registered for `event_id`.
    #[must_use]
    pub fn listener_count(&self, event_id: EventId) -> usize {
        self.inner.lock().listeners.get(&event_id).map_or(0, BTreeMap::len)
    }

    /// Returns `true` if `other` is a handle to the same bus.
    #[must_use]
    pub fn same_bus(&self, other: &EventBus) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Deliver `event` to every listener registered for its id when the call
    /// began, then dispose of it.
    ///
    /// Returns the event back only if it is marked
    /// [`retain_after_fire`](Event::set_retain_after_fire). Fires nested deeper
    /// than [`MAX_FIRE_DEPTH`] are dropped with a warning.
    pub fn fire(&self, event: Box<Event>) -> Option<Box<Event>> {
        self.deliver(&event);
        event.is_retain_after_fire().then_some(event)
    }

    /// Like [`EventBus::fire`], but a disposed event is recycled into `pool`.
    pub fn fire_into(&self, event: Box<Event>, pool: &mut PoolInstance) -> Option<Box<Event>> {
        self.deliver(&event);
        if event.is_retain_after_fire() {
            Some(event)
        } else {
            pool.recycle(event);
            None
        }
    }

    fn deliver(&self, event: &Event) {
        let snapshot: Vec<Arc<ListenerFn>> = {
            let inner = self.inner.lock();
            match inner.listeners.get(&event.id) {
                Some(bucket) => bucket.values().map(|l| Arc::clone(&l.handler)).collect(),
                None => return,
            }
        };

        let depth = FIRE_DEPTH.with(|d| {
            d.set(d.get() + 1);
            d.get()
        });
        if depth > MAX_FIRE_DEPTH {
            warn!(event_id = event.id, depth, "event fire recursion limit reached, dropping");
        } else {
            trace!(event_id = event.id, listeners = snapshot.len(), "firing event");
            for handler in &snapshot {
                handler(event);
            }
        }
        FIRE_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EventBus")
            .field("event_ids", &inner.listeners.len())
            .field("listeners", &inner.listeners.values().map(BTreeMap::len).sum::<usize>())
            .finish()
    }
}

/// A pooled record that fires an event later.
///
/// The firer holds a pooled [`Event`], so its pool storage must be torn down
/// before event storage; it declares that edge on first use.
#[derive(Debug, Default)]
pub struct EventFirer {
    event: Option<Box<Event>>,
    bus: Option<EventBus>,
}

impl EventFirer {
    /// Attach the event to fire and the bus to fire it on.
    pub fn set_event(&mut self, event: Box<Event>, bus: EventBus) {
        self.event = Some(event);
        self.bus = Some(bus);
    }

    /// Returns `true` if an event is attached.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.event.is_some()
    }

    /// Fire the attached event, recycling it into `pool` afterwards.
    ///
    /// Returns `false` if nothing was attached.
    pub fn fire(&mut self, pool: &mut PoolInstance) -> bool {
        match (self.event.take(), self.bus.take()) {
            (Some(event), Some(bus)) => {
                if let Some(retained) = bus.fire_into(event, pool) {
                    // The firer owned the event; nobody else can observe it now.
                    pool.recycle(retained);
                }
                true
            }
            (Some(event), None) => {
                pool.recycle(event);
                false
            }
            _ => false,
        }
    }

    /// Drop the attached event without firing it.
    pub fn clear(&mut self, pool: &mut PoolInstance) {
        if let Some(event) = self.event.take() {
            pool.recycle(event);
        }
        self.bus = None;
    }
}

impl Poolable for EventFirer {
    fn reset(&mut self) {
        self.event = None;
        self.bus = None;
    }

    fn declare_order(table: &mut OrderTable) -> Result<()> {
        table.declare::<EventFirer, Event>()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use proptest::prelude::*;

    use super::*;
    use crate::pool::PoolTypeId;

    fn counter() -> (Arc<AtomicU32>, impl Fn(&Event) + Send + Sync + 'static) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        (count, move |_: &Event| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_fire_invokes_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let log = Arc::clone(&log);
            bus.add_listener(7, ListenerTarget::NONE, move |_| log.lock().push(n));
        }
        bus.fire(Box::new(Event::new(7)));
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_fire_only_reaches_matching_id() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        bus.add_listener(1, ListenerTarget::NONE, handler);
        bus.fire(Box::new(Event::new(2)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_listener_twice_is_noop() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        let stub = bus.add_listener(7, ListenerTarget::NONE, handler);
        assert!(bus.remove_listener(&stub));
        assert!(!bus.remove_listener(&stub));
        assert!(!bus.remove_listener(&ListenerStub::INVALID));
        bus.fire(Box::new(Event::new(7)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(7), 0);
    }

    #[test]
    fn test_stub_only_removes_on_its_own_bus() {
        let own = EventBus::new();
        let shared = EventBus::new();
        let (own_hits, own_handler) = counter();
        let own_stub = own.add_listener(5, ListenerTarget::NONE, own_handler);
        let shared_stub = shared.add_listener(5, ListenerTarget::NONE, |_| {});
        assert_ne!(own_stub, shared_stub);

        assert!(!own.remove_listener(&shared_stub));
        assert!(!shared.has_listener(&own_stub));
        assert_eq!(own.listener_count(5), 1);
        assert!(shared.remove_listener(&shared_stub));
        assert_eq!(shared.listener_count(5), 0);

        own.fire(Box::new(Event::new(5)));
        assert_eq!(own_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_listeners_of_target() {
        let bus = EventBus::new();
        let owner = ListenerTarget(9);
        let (count, handler) = counter();
        bus.add_listener(1, owner, |_| {});
        bus.add_listener(2, owner, |_| {});
        let keep = bus.add_listener(1, ListenerTarget(10), handler);
        assert_eq!(bus.remove_listeners_of(owner), 2);
        assert!(bus.has_listener(&keep));
        bus.fire(Box::new(Event::new(1)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retained_event_is_returned() {
        let bus = EventBus::new();
        let mut event = Box::new(Event::new(3).with_param(1).with_named_param("who", "a"));
        assert!(bus.fire(event.clone()).is_none());
        event.set_retain_after_fire(true);
        let back = bus.fire(event).unwrap();
        assert_eq!(back.param(0), Some(&Value::from(1)));
        assert_eq!(back.named_param("who"), Some(&Value::from("a")));
    }

    #[test]
    fn test_fire_into_recycles_event() {
        let bus = EventBus::new();
        let mut pool = PoolInstance::new();
        let mut event = pool.acquire::<Event>();
        event.set_id(5);
        event.add_param("x");
        assert!(bus.fire_into(event, &mut pool).is_none());
        let reused = pool.acquire::<Event>();
        assert_eq!(reused.id(), 0);
        assert_eq!(reused.param_count(), 0);
    }

    #[test]
    fn test_recursion_is_bounded() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU32::new(0));
        let inner_bus = bus.clone();
        let c = Arc::clone(&calls);
        bus.add_listener(1, ListenerTarget::NONE, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            inner_bus.fire(Box::new(Event::new(1)));
        });
        bus.fire(Box::new(Event::new(1)));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_FIRE_DEPTH as u32);
    }

    #[test]
    fn test_event_firer_declares_order_and_fires() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        bus.add_listener(4, ListenerTarget::NONE, handler);

        let mut pool = PoolInstance::new();
        let mut firer = pool.acquire::<EventFirer>();
        assert!(pool.order().must_destroy_before(
            PoolTypeId::of::<EventFirer>(),
            PoolTypeId::of::<Event>()
        ));

        let mut event = pool.acquire::<Event>();
        event.set_id(4);
        firer.set_event(event, bus.clone());
        assert!(firer.is_armed());
        assert!(firer.fire(&mut pool));
        assert!(!firer.fire(&mut pool));
        pool.recycle(firer);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add,
        RemoveOther(usize),
        RemoveSelf,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Add),
            (0usize..8).prop_map(Op::RemoveOther),
            Just(Op::RemoveSelf),
        ]
    }

    proptest! {
        /// Whatever listeners do to the bus during a fire, that fire reaches
        /// exactly the snapshot taken at entry, and the next fire reaches
        /// exactly the listeners that remain.
        #[test]
        fn prop_fire_uses_entry_snapshot(ops in proptest::collection::vec(op_strategy(), 1..8)) {
            let bus = EventBus::new();
            let hits: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
            let stubs: Arc<Mutex<Vec<ListenerStub>>> = Arc::new(Mutex::new(Vec::new()));

            for (idx, op) in ops.iter().cloned().enumerate() {
                let hits = Arc::clone(&hits);
                let stubs_ref = Arc::clone(&stubs);
                let bus_ref = bus.clone();
                let stub = bus.add_listener(1, ListenerTarget::NONE, move |_| {
                    hits.lock().push(idx);
                    match op {
                        Op::Add => {
                            let hits = Arc::clone(&hits);
                            let late = bus_ref.add_listener(1, ListenerTarget::NONE, move |_| {
                                hits.lock().push(usize::MAX);
                            });
                            stubs_ref.lock().push(late);
                        }
                        Op::RemoveOther(n) => {
                            let target = stubs_ref.lock().get(n).copied();
                            if let Some(target) = target {
                                bus_ref.remove_listener(&target);
                            }
                        }
                        Op::RemoveSelf => {
                            let me = stubs_ref.lock()[idx];
                            bus_ref.remove_listener(&me);
                        }
                    }
                });
                stubs.lock().push(stub);
            }

            bus.fire(Box::new(Event::new(1)));
            let first: Vec<usize> = std::mem::take(&mut *hits.lock());
            let expected: Vec<usize> = (0..ops.len()).collect();
            prop_assert_eq!(first, expected);

            let survivors: Vec<ListenerStub> = stubs
                .lock()
                .iter()
                .copied()
                .filter(|s| bus.has_listener(s))
                .collect();
            // Listeners added during the second fire are not counted in it.
            let before = survivors.len();
            bus.fire(Box::new(Event::new(1)));
            prop_assert_eq!(hits.lock().len(), before);
        }
    }
}
