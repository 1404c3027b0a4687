//! Thread-affine object pooling.
//!
//! A [`PoolInstance`] keeps one free list per pooled type. It is owned by
//! exactly one driver (a worker thread or an externally driven service) and is
//! `Send` but not `Sync`, so the acquire/recycle path never takes a lock.
//!
//! ## Destruction order
//!
//! Some pooled types transiently hold instances of another pooled type (an
//! [`EventFirer`](crate::event::EventFirer) holds an
//! [`Event`](crate::event::Event)). Such pairs are declared in an
//! [`OrderTable`] as "dependent must be destroyed before dependency". When a
//! pool instance is dropped its free lists are torn down in a topological order
//! of those edges. Cycles are rejected when the edge is declared, never at
//! teardown.

use std::any::{Any, TypeId};
use std::cell::Cell;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;

use tracing::{error, trace};

use crate::error::{Error, Result};

/// Maximum number of idle objects kept per type before recycled objects are
/// simply dropped.
pub const DEFAULT_MAX_FREE_PER_TYPE: usize = 4096;

/// A type that can live in a [`PoolInstance`].
pub trait Poolable: Default + Send + 'static {
    /// Clear the object before it goes back to the free list.
    fn reset(&mut self) {}

    /// Declare destruction-order edges for this type.
    ///
    /// Called once per pool instance, the first time the type is acquired or
    /// recycled there.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CyclicOrder`] if a declared edge closes a cycle.
    fn declare_order(_table: &mut OrderTable) -> Result<()> {
        Ok(())
    }
}

/// Identity of a pooled type: its [`TypeId`] plus a name for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolTypeId {
    id: TypeId,
    name: &'static str,
}

impl PoolTypeId {
    /// Returns the pool identity of `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Returns the type name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Directed "must destroy before" edges between pooled types.
#[derive(Debug, Clone, Default)]
pub struct OrderTable {
    /// `dependent -> dependencies` adjacency.
    edges: HashMap<TypeId, Vec<TypeId>>,
    names: HashMap<TypeId, &'static str>,
}

impl OrderTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`OrderTable::declare`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::CyclicOrder`] if the edge closes a cycle.
    pub fn before<Dependent: 'static, Dependency: 'static>(mut self) -> Result<Self> {
        self.declare::<Dependent, Dependency>()?;
        Ok(self)
    }

    /// Declare that pooled storage for `Dependent` is destroyed before storage
    /// for `Dependency`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CyclicOrder`] if the edge closes a cycle.
    pub fn declare<Dependent: 'static, Dependency: 'static>(&mut self) -> Result<()> {
        self.declare_ids(PoolTypeId::of::<Dependent>(), PoolTypeId::of::<Dependency>())
    }

    /// Untyped form of [`OrderTable::declare`].
    ///
    /// Declaring an existing edge again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CyclicOrder`] if `dependent == dependency` or if
    /// `dependency` already (transitively) must be destroyed before
    /// `dependent`.
    pub fn declare_ids(&mut self, dependent: PoolTypeId, dependency: PoolTypeId) -> Result<()> {
        if dependent.id == dependency.id || self.reaches(dependency.id, dependent.id) {
            return Err(Error::CyclicOrder(format!(
                "{} before {} contradicts an existing declaration",
                dependent.name, dependency.name
            )));
        }

        self.names.insert(dependent.id, dependent.name);
        self.names.insert(dependency.id, dependency.name);
        let deps = self.edges.entry(dependent.id).or_default();
        if !deps.contains(&dependency.id) {
            deps.push(dependency.id);
        }
        Ok(())
    }

    /// Returns `true` if `a` must be destroyed before `b`, directly or
    /// transitively.
    #[must_use]
    pub fn must_destroy_before(&self, a: PoolTypeId, b: PoolTypeId) -> bool {
        a.id != b.id && self.reaches(a.id, b.id)
    }

    /// Returns the number of declared edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    fn reaches(&self, from: TypeId, to: TypeId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(next) = self.edges.get(&node) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    /// Order `present` so that every type comes before the types it must be
    /// destroyed before. Ties keep the order of `present`.
    fn teardown_order(&self, present: &[TypeId]) -> Vec<TypeId> {
        let mut indegree: HashMap<TypeId, usize> = present.iter().map(|id| (*id, 0)).collect();
        for &a in present {
            for &b in present {
                if a != b && self.reaches(a, b) {
                    *indegree.entry(b).or_default() += 1;
                }
            }
        }

        let mut order = Vec::with_capacity(present.len());
        let mut done: HashSet<TypeId> = HashSet::new();
        while order.len() < present.len() {
            let Some(&next) = present
                .iter()
                .find(|id| !done.contains(*id) && indegree.get(*id).copied() == Some(0))
            else {
                // Unreachable while declarations are cycle-checked; fall back
                // to first-use order for whatever is left.
                order.extend(present.iter().filter(|id| !done.contains(*id)).copied());
                break;
            };
            done.insert(next);
            order.push(next);
            for &b in present {
                if b != next && !done.contains(&b) && self.reaches(next, b) {
                    if let Some(d) = indegree.get_mut(&b) {
                        *d = d.saturating_sub(1);
                    }
                }
            }
        }
        order
    }
}

/// Allocation counters for one pooled type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects currently idle on the free list.
    pub free: usize,
    /// Objects constructed by this pool instance so far.
    pub created: usize,
    /// Objects handed back through [`PoolInstance::recycle`].
    pub recycled: usize,
}

trait ErasedStore: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn stats(&self) -> PoolStats;
}

struct Store<T: Poolable> {
    free: Vec<Box<T>>,
    stats: PoolStats,
}

impl<T: Poolable> Store<T> {
    fn new() -> Self {
        Self {
            free: Vec::new(),
            stats: PoolStats::default(),
        }
    }
}

impl<T: Poolable> ErasedStore for Store<T> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            free: self.free.len(),
            ..self.stats
        }
    }
}

/// The free lists backing pooled allocation for one driver thread.
pub struct PoolInstance {
    order: OrderTable,
    stores: HashMap<TypeId, Box<dyn ErasedStore>>,
    /// Type ids in first-use order, with names for teardown logging.
    first_use: Vec<(TypeId, &'static str)>,
    max_free_per_type: usize,
    _not_sync: PhantomData<Cell<()>>,
}

impl PoolInstance {
    /// Create an empty pool instance with no declared ordering.
    #[must_use]
    pub fn new() -> Self {
        Self::with_order(OrderTable::new())
    }

    /// Create a pool instance from a pre-built destruction-order table.
    #[must_use]
    pub fn with_order(order: OrderTable) -> Self {
        Self {
            order,
            stores: HashMap::new(),
            first_use: Vec::new(),
            max_free_per_type: DEFAULT_MAX_FREE_PER_TYPE,
            _not_sync: PhantomData,
        }
    }

    /// Cap the number of idle objects kept per type.
    #[must_use]
    pub fn with_max_free_per_type(mut self, max: usize) -> Self {
        self.max_free_per_type = max;
        self
    }

    /// Take an object from the free list, or construct a new one.
    ///
    /// # Panics
    ///
    /// Panics if this is the first use of `T` in this instance and
    /// [`Poolable::declare_order`] reports a cyclic declaration. That is a
    /// configuration error, not a runtime condition.
    pub fn acquire<T: Poolable>(&mut self) -> Box<T> {
        let store = self.store_mut::<T>();
        match store.free.pop() {
            Some(obj) => obj,
            None => {
                store.stats.created += 1;
                Box::default()
            }
        }
    }

    /// Reset an object and return it to the free list.
    ///
    /// # Panics
    ///
    /// See [`PoolInstance::acquire`].
    pub fn recycle<T: Poolable>(&mut self, mut obj: Box<T>) {
        obj.reset();
        let max = self.max_free_per_type;
        let store = self.store_mut::<T>();
        store.stats.recycled += 1;
        if store.free.len() < max {
            store.free.push(obj);
        }
    }

    /// Declare that storage for `dependent` is torn down before storage for
    /// `dependency` when this instance is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CyclicOrder`] if the edge closes a cycle.
    pub fn declare_order_before(
        &mut self,
        dependent: PoolTypeId,
        dependency: PoolTypeId,
    ) -> Result<()> {
        self.order.declare_ids(dependent, dependency)
    }

    /// Returns the destruction-order table.
    #[must_use]
    pub fn order(&self) -> &OrderTable {
        &self.order
    }

    /// Returns counters for `T`, or `None` if `T` was never used here.
    #[must_use]
    pub fn stats<T: Poolable>(&self) -> Option<PoolStats> {
        self.stores.get(&TypeId::of::<T>()).map(|s| s.stats())
    }

    /// Returns the number of distinct types this instance has stored.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.stores.len()
    }

    fn store_mut<T: Poolable>(&mut self) -> &mut Store<T> {
        let id = TypeId::of::<T>();
        let store = match self.stores.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if let Err(err) = T::declare_order(&mut self.order) {
                    error!(
                        pooled_type = std::any::type_name::<T>(),
                        %err,
                        "invalid pool destruction order"
                    );
                    panic!(
                        "invalid pool destruction order for {}: {err}",
                        std::any::type_name::<T>()
                    );
                }
                self.first_use.push((id, std::any::type_name::<T>()));
                entry.insert(Box::new(Store::<T>::new()))
            }
        };
        match store.as_any_mut().downcast_mut::<Store<T>>() {
            Some(store) => store,
            None => unreachable!("pool store keyed by a foreign TypeId"),
        }
    }
}

impl Default for PoolInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PoolInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInstance")
            .field("types", &self.first_use.iter().map(|(_, n)| *n).collect::<Vec<_>>())
            .field("order_edges", &self.order.edge_count())
            .finish()
    }
}

impl Drop for PoolInstance {
    fn drop(&mut self) {
        let present: Vec<TypeId> = self.first_use.iter().map(|(id, _)| *id).collect();
        for id in self.order.teardown_order(&present) {
            if let Some(store) = self.stores.remove(&id) {
                let name = self
                    .first_use
                    .iter()
                    .find(|(t, _)| *t == id)
                    .map_or("?", |(_, n)| *n);
                trace!(pooled_type = name, free = store.stats().free, "tearing down pool store");
                drop(store);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    thread_local! {
        static DROPS: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
    }

    fn take_drops() -> Vec<&'static str> {
        DROPS.with(|d| std::mem::take(&mut *d.borrow_mut()))
    }

    #[derive(Default)]
    struct Holder {
        value: u32,
    }

    impl Drop for Holder {
        fn drop(&mut self) {
            DROPS.with(|d| d.borrow_mut().push("holder"));
        }
    }

    impl Poolable for Holder {
        fn reset(&mut self) {
            self.value = 0;
        }
    }

    #[derive(Default)]
    struct Payload;

    impl Drop for Payload {
        fn drop(&mut self) {
            DROPS.with(|d| d.borrow_mut().push("payload"));
        }
    }

    impl Poolable for Payload {}

    #[derive(Default)]
    struct SelfOrdered;

    impl Poolable for SelfOrdered {
        fn declare_order(table: &mut OrderTable) -> Result<()> {
            table.declare::<SelfOrdered, Payload>()
        }
    }

    #[derive(Default)]
    struct Cyclic;

    impl Poolable for Cyclic {
        fn declare_order(table: &mut OrderTable) -> Result<()> {
            table.declare::<Cyclic, Cyclic>()
        }
    }

    #[test]
    fn test_acquire_reuses_recycled_object() {
        let mut pool = PoolInstance::new();
        let mut obj = pool.acquire::<Holder>();
        obj.value = 7;
        let addr = &*obj as *const Holder;
        pool.recycle(obj);

        let again = pool.acquire::<Holder>();
        assert_eq!(&*again as *const Holder, addr);
        assert_eq!(again.value, 0, "reset must run on recycle");

        let stats = pool.stats::<Holder>().unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.recycled, 1);
        pool.recycle(again);
        drop(pool);
        take_drops();
    }

    #[test]
    fn test_declared_order_drives_teardown() {
        take_drops();
        // Payload is used first, so without the edge it would be torn down first.
        let mut pool = PoolInstance::new();
        let payloads: Vec<_> = (0..3).map(|_| pool.acquire::<Payload>()).collect();
        let holders: Vec<_> = (0..3).map(|_| pool.acquire::<Holder>()).collect();
        pool.declare_order_before(PoolTypeId::of::<Holder>(), PoolTypeId::of::<Payload>())
            .unwrap();
        for p in payloads {
            pool.recycle(p);
        }
        for h in holders {
            pool.recycle(h);
        }

        drop(pool);
        let drops = take_drops();
        assert_eq!(drops.len(), 6);
        let last_holder = drops.iter().rposition(|d| *d == "holder").unwrap();
        let first_payload = drops.iter().position(|d| *d == "payload").unwrap();
        assert!(last_holder < first_payload, "order was {drops:?}");
    }

    #[test]
    fn test_transitive_order_without_middle_type() {
        let table = OrderTable::new()
            .before::<Holder, SelfOrdered>()
            .unwrap()
            .before::<SelfOrdered, Payload>()
            .unwrap();
        assert!(table.must_destroy_before(PoolTypeId::of::<Holder>(), PoolTypeId::of::<Payload>()));

        take_drops();
        let mut pool = PoolInstance::with_order(table);
        let p = pool.acquire::<Payload>();
        let h = pool.acquire::<Holder>();
        pool.recycle(p);
        pool.recycle(h);
        drop(pool);
        assert_eq!(take_drops(), vec!["holder", "payload"]);
    }

    #[test]
    fn test_cycle_rejected_at_declaration() {
        let mut table = OrderTable::new();
        table.declare::<Holder, Payload>().unwrap();
        let err = table.declare::<Payload, Holder>().unwrap_err();
        assert!(matches!(err, Error::CyclicOrder(_)));
        assert_eq!(table.edge_count(), 1);
    }

    #[test]
    fn test_self_edge_rejected() {
        let mut pool = PoolInstance::new();
        let err = pool
            .declare_order_before(PoolTypeId::of::<Holder>(), PoolTypeId::of::<Holder>())
            .unwrap_err();
        assert!(matches!(err, Error::CyclicOrder(_)));
    }

    #[test]
    fn test_first_use_declares_type_order() {
        let mut pool = PoolInstance::new();
        let obj = pool.acquire::<SelfOrdered>();
        pool.recycle(obj);
        assert!(pool.order().must_destroy_before(
            PoolTypeId::of::<SelfOrdered>(),
            PoolTypeId::of::<Payload>()
        ));
    }

    #[test]
    #[should_panic(expected = "invalid pool destruction order")]
    fn test_cyclic_first_use_is_fatal() {
        let mut pool = PoolInstance::new();
        let _ = pool.acquire::<Cyclic>();
    }

    #[test]
    fn test_free_list_is_capped() {
        let mut pool = PoolInstance::new().with_max_free_per_type(1);
        let a = pool.acquire::<Holder>();
        let b = pool.acquire::<Holder>();
        pool.recycle(a);
        pool.recycle(b);
        assert_eq!(pool.stats::<Holder>().unwrap().free, 1);
        drop(pool);
        take_drops();
    }
}
