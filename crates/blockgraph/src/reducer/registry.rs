//! Reducer and broadcast registries

use std::any::Any;
use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::{BroadcastHandle, BroadcastId, ReduceOp, ReducerHandle, ReducerId};
use crate::block::PieceId;
use crate::codec;
use crate::error::{BspError, Result};

/// Lifetime of a reducer's global value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducerKind {
    /// Starts over from the identity every superstep
    Local,
    /// Accumulates across supersteps while its piece stays reachable
    Persistent,
}

/// Collects the reducers and broadcasts a piece needs
///
/// Passed to [`Piece::register_reducers`](crate::block::Piece::register_reducers).
/// Handles are numbered in registration order, so registering the same way
/// on master and workers yields the same handles.
pub struct CreateReducersApi {
    piece: PieceId,
    next_reducer: u32,
    next_broadcast: u32,
    registrations: Vec<Registration>,
}

pub(crate) struct Registration {
    pub(crate) id: ReducerId,
    pub(crate) reducer: Box<dyn ErasedReducer>,
}

impl CreateReducersApi {
    pub(crate) fn new(piece: PieceId) -> Self {
        Self {
            piece,
            next_reducer: 0,
            next_broadcast: 0,
            registrations: Vec::new(),
        }
    }

    /// Reducer whose value starts over every superstep
    pub fn create_local_reducer<Op: ReduceOp>(&mut self, op: Op) -> ReducerHandle<Op> {
        let initial = op.initial();
        self.create(op, ReducerKind::Local, initial)
    }

    /// Local reducer starting every superstep from `initial` instead of the
    /// identity
    pub fn create_local_reducer_with<Op: ReduceOp>(
        &mut self,
        op: Op,
        initial: Op::Value,
    ) -> ReducerHandle<Op> {
        self.create(op, ReducerKind::Local, initial)
    }

    /// Reducer whose value accumulates across supersteps
    pub fn create_persistent_reducer<Op: ReduceOp>(&mut self, op: Op) -> ReducerHandle<Op> {
        let initial = op.initial();
        self.create(op, ReducerKind::Persistent, initial)
    }

    /// Persistent reducer starting from `initial` instead of the identity
    pub fn create_persistent_reducer_with<Op: ReduceOp>(
        &mut self,
        op: Op,
        initial: Op::Value,
    ) -> ReducerHandle<Op> {
        self.create(op, ReducerKind::Persistent, initial)
    }

    /// Slot for a value the master broadcasts to every worker
    pub fn create_broadcast<T>(&mut self) -> BroadcastHandle<T> {
        let id = BroadcastId {
            piece: self.piece,
            index: self.next_broadcast,
        };
        self.next_broadcast += 1;
        BroadcastHandle::new(id)
    }

    fn create<Op: ReduceOp>(
        &mut self,
        op: Op,
        kind: ReducerKind,
        initial: Op::Value,
    ) -> ReducerHandle<Op> {
        let id = ReducerId {
            piece: self.piece,
            index: self.next_reducer,
        };
        self.next_reducer += 1;
        self.registrations.push(Registration {
            id,
            reducer: Box::new(Accumulator::new(op, kind, initial)),
        });
        ReducerHandle::new(id)
    }

    pub(crate) fn into_registrations(self) -> Vec<Registration> {
        self.registrations
    }
}

/// Type-erased reducer state
pub(crate) trait ErasedReducer: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn kind(&self) -> ReducerKind;
    fn op_name(&self) -> &'static str;
    /// Encode the partial and reset it to the identity
    fn take_partial(&self) -> Result<Bytes>;
    fn merge_partial(&self, partial: &[u8]) -> Result<()>;
    /// Fold the merged partials into the global value
    fn resolve(&self);
    fn export_global(&self) -> Result<Option<Bytes>>;
    fn import_global(&self, global: &[u8]) -> Result<()>;
}

struct Accumulator<Op: ReduceOp> {
    op: Op,
    kind: ReducerKind,
    initial: Op::Value,
    partial: Mutex<Op::Value>,
    global: Mutex<Option<Op::Value>>,
}

impl<Op: ReduceOp> Accumulator<Op> {
    fn new(op: Op, kind: ReducerKind, initial: Op::Value) -> Self {
        let identity = op.initial();
        Self {
            op,
            kind,
            initial,
            partial: Mutex::new(identity),
            global: Mutex::new(None),
        }
    }

    fn reduce(&self, input: Op::Input) {
        let mut partial = self.partial.lock();
        self.op.reduce_single(&mut partial, input);
    }

    fn global(&self) -> Option<Op::Value> {
        self.global.lock().clone()
    }
}

impl<Op: ReduceOp> ErasedReducer for Accumulator<Op> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn kind(&self) -> ReducerKind {
        self.kind
    }

    fn op_name(&self) -> &'static str {
        self.op.name()
    }

    fn take_partial(&self) -> Result<Bytes> {
        let partial = std::mem::replace(&mut *self.partial.lock(), self.op.initial());
        codec::encode(&partial)
    }

    fn merge_partial(&self, partial: &[u8]) -> Result<()> {
        let partial: Op::Value = codec::decode(partial)?;
        let mut merged = self.partial.lock();
        self.op.reduce_partial(&mut merged, partial);
        Ok(())
    }

    fn resolve(&self) {
        let merged = std::mem::replace(&mut *self.partial.lock(), self.op.initial());
        let mut global = self.global.lock();
        let value = match (self.kind, global.take()) {
            (ReducerKind::Local, _) => {
                let mut value = self.initial.clone();
                self.op.reduce_partial(&mut value, merged);
                value
            }
            (ReducerKind::Persistent, previous) => {
                let mut value = previous.unwrap_or_else(|| self.initial.clone());
                self.op.reduce_partial(&mut value, merged);
                value
            }
        };
        *global = Some(value);
    }

    fn export_global(&self) -> Result<Option<Bytes>> {
        self.global
            .lock()
            .as_ref()
            .map(|value| codec::encode(value))
            .transpose()
    }

    fn import_global(&self, global: &[u8]) -> Result<()> {
        let value: Op::Value = codec::decode(global)?;
        *self.global.lock() = Some(value);
        Ok(())
    }
}

/// Owns every live reducer of one process
///
/// Workers only `reduce` and `take_partials`; the master merges partials and
/// resolves. A reducer lives from its piece's registration until the piece
/// is no longer reachable from the execution cursor.
#[derive(Default)]
pub struct ReducerRegistry {
    reducers: BTreeMap<ReducerId, Box<dyn ErasedReducer>>,
    resolved: HashMap<ReducerId, u64>,
    restored: HashMap<ReducerId, Bytes>,
}

impl ReducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }

    pub fn is_registered(&self, id: ReducerId) -> bool {
        self.reducers.contains_key(&id)
    }

    /// Register a piece's reducers; already registered ids keep their state
    pub(crate) fn register(&mut self, registrations: Vec<Registration>) -> Result<()> {
        for Registration { id, reducer } in registrations {
            if self.reducers.contains_key(&id) {
                continue;
            }
            if let Some(global) = self.restored.remove(&id) {
                reducer.import_global(&global)?;
            }
            debug!(reducer = %id, op = reducer.op_name(), "Registered reducer");
            self.reducers.insert(id, reducer);
        }
        Ok(())
    }

    fn accumulator<Op: ReduceOp>(&self, id: ReducerId) -> Result<&Accumulator<Op>> {
        let reducer = self
            .reducers
            .get(&id)
            .ok_or_else(|| BspError::invalid_handle(id, "not registered"))?;
        reducer
            .as_any()
            .downcast_ref::<Accumulator<Op>>()
            .ok_or_else(|| BspError::invalid_handle(id, "reduce operation does not match"))
    }

    /// Fold one input into the local partial
    pub fn reduce<Op: ReduceOp>(&self, handle: ReducerHandle<Op>, input: Op::Input) -> Result<()> {
        self.accumulator::<Op>(handle.id())?.reduce(input);
        Ok(())
    }

    /// Encode every partial and reset it
    pub fn take_partials(&self) -> Result<Vec<(ReducerId, Bytes)>> {
        self.reducers
            .iter()
            .map(|(id, reducer)| Ok((*id, reducer.take_partial()?)))
            .collect()
    }

    /// Merge a worker's partial into the pending master value
    pub fn merge_partial(&self, id: ReducerId, partial: &[u8]) -> Result<()> {
        self.reducers
            .get(&id)
            .ok_or_else(|| BspError::invalid_handle(id, "not registered"))?
            .merge_partial(partial)
    }

    /// Resolve one reducer for `superstep`; at most once per superstep
    pub fn resolve(&mut self, id: ReducerId, superstep: u64) -> Result<()> {
        let reducer = self
            .reducers
            .get(&id)
            .ok_or_else(|| BspError::invalid_handle(id, "not registered"))?;
        if self.resolved.get(&id) == Some(&superstep) {
            return Err(BspError::invalid_handle(
                id,
                format!("already resolved in superstep {superstep}"),
            ));
        }
        reducer.resolve();
        self.resolved.insert(id, superstep);
        Ok(())
    }

    /// Resolve every live reducer for `superstep`
    pub fn resolve_all(&mut self, superstep: u64) -> Result<()> {
        let ids: Vec<ReducerId> = self.reducers.keys().copied().collect();
        for id in ids {
            self.resolve(id, superstep)?;
        }
        Ok(())
    }

    /// Global value resolved in `superstep`
    pub fn reduced_value<Op: ReduceOp>(
        &self,
        handle: ReducerHandle<Op>,
        superstep: u64,
    ) -> Result<Op::Value> {
        let accumulator = self.accumulator::<Op>(handle.id())?;
        if self.resolved.get(&handle.id()) != Some(&superstep) {
            return Err(BspError::invalid_handle(
                handle.id(),
                format!("not resolved in superstep {superstep}"),
            ));
        }
        accumulator
            .global()
            .ok_or_else(|| BspError::invalid_handle(handle.id(), "no resolved value"))
    }

    /// Drop reducers of pieces that are no longer reachable
    pub fn retain(&mut self, live: impl Fn(PieceId) -> bool) {
        let before = self.reducers.len();
        self.reducers.retain(|id, _| live(id.piece));
        self.resolved.retain(|id, _| live(id.piece));
        self.restored.retain(|id, _| live(id.piece));
        if self.reducers.len() != before {
            debug!(
                retired = before - self.reducers.len(),
                live = self.reducers.len(),
                "Retired reducers"
            );
        }
    }

    /// Global values of persistent reducers, for checkpoints
    pub fn export_globals(&self) -> Result<Vec<(ReducerId, Bytes)>> {
        let mut globals = Vec::new();
        for (id, reducer) in &self.reducers {
            if reducer.kind() != ReducerKind::Persistent {
                continue;
            }
            if let Some(global) = reducer.export_global()? {
                globals.push((*id, global));
            }
        }
        Ok(globals)
    }

    /// Restore global values; unregistered ids are applied on registration
    pub fn import_globals(&mut self, globals: Vec<(ReducerId, Bytes)>) -> Result<()> {
        for (id, global) in globals {
            match self.reducers.get(&id) {
                Some(reducer) => reducer.import_global(&global)?,
                None => {
                    self.restored.insert(id, global);
                }
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.reducers.clear();
        self.resolved.clear();
        self.restored.clear();
    }
}

/// Broadcast values currently published by the master
#[derive(Debug, Clone, Default)]
pub struct BroadcastStore {
    values: BTreeMap<BroadcastId, Bytes>,
}

impl BroadcastStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize>(&mut self, handle: BroadcastHandle<T>, value: &T) -> Result<()> {
        self.values.insert(handle.id(), codec::encode(value)?);
        Ok(())
    }

    /// Decoded value; `InvalidHandle` until the master broadcast one
    pub fn get<T: DeserializeOwned>(&self, handle: BroadcastHandle<T>) -> Result<T> {
        let bytes = self
            .values
            .get(&handle.id())
            .ok_or_else(|| BspError::invalid_handle(handle.id(), "nothing broadcast yet"))?;
        codec::decode(bytes)
    }

    pub fn retain(&mut self, live: impl Fn(PieceId) -> bool) {
        self.values.retain(|id, _| live(id.piece));
    }

    pub fn entries(&self) -> Vec<(BroadcastId, Bytes)> {
        self.values
            .iter()
            .map(|(id, bytes)| (*id, bytes.clone()))
            .collect()
    }

    pub fn replace(&mut self, entries: impl IntoIterator<Item = (BroadcastId, Bytes)>) {
        self.values = entries.into_iter().collect();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::{CountReduce, MaxReduce, SumReduce};

    fn registry_with<Op: ReduceOp>(
        piece: u32,
        op: Op,
        kind: ReducerKind,
    ) -> (ReducerRegistry, ReducerHandle<Op>) {
        let mut api = CreateReducersApi::new(PieceId(piece));
        let handle = match kind {
            ReducerKind::Local => api.create_local_reducer(op),
            ReducerKind::Persistent => api.create_persistent_reducer(op),
        };
        let mut registry = ReducerRegistry::new();
        registry.register(api.into_registrations()).unwrap();
        (registry, handle)
    }

    #[test]
    fn test_handles_are_deterministic() {
        let mut master = CreateReducersApi::new(PieceId(2));
        let mut worker = CreateReducersApi::new(PieceId(2));
        let a = master.create_local_reducer(CountReduce);
        let b = master.create_local_reducer(SumReduce::<i64>::new());
        let a2 = worker.create_local_reducer(CountReduce);
        let b2 = worker.create_local_reducer(SumReduce::<i64>::new());
        assert_eq!(a.id(), a2.id());
        assert_eq!(b.id(), b2.id());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_partials_merge_on_master() {
        let (mut master, handle) = registry_with(0, SumReduce::<i64>::new(), ReducerKind::Local);
        let (w0, _) = registry_with(0, SumReduce::<i64>::new(), ReducerKind::Local);
        let (w1, _) = registry_with(0, SumReduce::<i64>::new(), ReducerKind::Local);

        w0.reduce(handle, 3).unwrap();
        w1.reduce(handle, 4).unwrap();
        w1.reduce(handle, 5).unwrap();

        for worker in [&w0, &w1] {
            for (id, partial) in worker.take_partials().unwrap() {
                master.merge_partial(id, &partial).unwrap();
            }
        }
        master.resolve_all(0).unwrap();
        assert_eq!(master.reduced_value(handle, 0).unwrap(), 12);

        // Partials were reset by take_partials
        assert_eq!(
            codec::decode::<i64>(&w1.take_partials().unwrap()[0].1).unwrap(),
            0
        );
    }

    #[test]
    fn test_local_resets_persistent_accumulates() {
        let (mut local, lh) = registry_with(0, CountReduce, ReducerKind::Local);
        let (mut persistent, ph) = registry_with(0, CountReduce, ReducerKind::Persistent);

        for superstep in 0..3 {
            local.reduce(lh, ()).unwrap();
            persistent.reduce(ph, ()).unwrap();
            for (id, partial) in local.take_partials().unwrap() {
                local.merge_partial(id, &partial).unwrap();
            }
            for (id, partial) in persistent.take_partials().unwrap() {
                persistent.merge_partial(id, &partial).unwrap();
            }
            local.resolve_all(superstep).unwrap();
            persistent.resolve_all(superstep).unwrap();
        }

        assert_eq!(local.reduced_value(lh, 2).unwrap(), 1);
        assert_eq!(persistent.reduced_value(ph, 2).unwrap(), 3);
    }

    #[test]
    fn test_local_reducer_restarts_from_its_initial_value() {
        let mut api = CreateReducersApi::new(PieceId(0));
        let handle = api.create_local_reducer_with(MaxReduce::<i64>::new(), 100);
        let mut registry = ReducerRegistry::new();
        registry.register(api.into_registrations()).unwrap();

        let mut seen = Vec::new();
        for (superstep, input) in [Some(3), Some(250), None].into_iter().enumerate() {
            if let Some(input) = input {
                registry.reduce(handle, input).unwrap();
            }
            for (id, partial) in registry.take_partials().unwrap() {
                registry.merge_partial(id, &partial).unwrap();
            }
            registry.resolve_all(superstep as u64).unwrap();
            seen.push(registry.reduced_value(handle, superstep as u64).unwrap());
        }
        assert_eq!(seen, vec![100, 250, 100]);
    }

    #[test]
    fn test_second_resolve_in_superstep_fails() {
        let (mut registry, handle) = registry_with(1, CountReduce, ReducerKind::Local);
        registry.resolve(handle.id(), 4).unwrap();
        let err = registry.resolve(handle.id(), 4).unwrap_err();
        assert!(matches!(err, BspError::InvalidHandle { .. }));
        registry.resolve(handle.id(), 5).unwrap();
    }

    #[test]
    fn test_unregistered_and_mistyped_handles() {
        let (mut registry, handle) = registry_with(1, CountReduce, ReducerKind::Local);
        let stranger = ReducerHandle::<CountReduce>::new(ReducerId {
            piece: PieceId(9),
            index: 0,
        });
        assert!(matches!(
            registry.reduce(stranger, ()),
            Err(BspError::InvalidHandle { .. })
        ));

        let mistyped = ReducerHandle::<MaxReduce<i32>>::new(handle.id());
        assert!(matches!(
            registry.reduce(mistyped, 3),
            Err(BspError::InvalidHandle { .. })
        ));

        // Reading before resolution is also rejected
        assert!(registry.reduced_value(handle, 0).is_err());

        registry.retain(|piece| piece != PieceId(1));
        assert!(registry.reduce(handle, ()).is_err());
    }

    #[test]
    fn test_persistent_globals_survive_restore() {
        let (mut registry, handle) = registry_with(0, CountReduce, ReducerKind::Persistent);
        registry.reduce(handle, ()).unwrap();
        registry.reduce(handle, ()).unwrap();
        for (id, partial) in registry.take_partials().unwrap() {
            registry.merge_partial(id, &partial).unwrap();
        }
        registry.resolve_all(0).unwrap();
        let globals = registry.export_globals().unwrap();

        let mut restored = ReducerRegistry::new();
        restored.import_globals(globals).unwrap();
        let mut api = CreateReducersApi::new(PieceId(0));
        let handle = api.create_persistent_reducer(CountReduce);
        restored.register(api.into_registrations()).unwrap();

        restored.reduce(handle, ()).unwrap();
        for (id, partial) in restored.take_partials().unwrap() {
            restored.merge_partial(id, &partial).unwrap();
        }
        restored.resolve_all(1).unwrap();
        assert_eq!(restored.reduced_value(handle, 1).unwrap(), 3);
    }

    #[test]
    fn test_broadcast_store() {
        let mut api = CreateReducersApi::new(PieceId(0));
        let handle = api.create_broadcast::<String>();
        let mut store = BroadcastStore::new();
        assert!(store.get(handle).is_err());

        store.set(handle, &"hello".to_string()).unwrap();
        assert_eq!(store.get(handle).unwrap(), "hello");

        store.retain(|piece| piece != PieceId(0));
        assert!(store.is_empty());
    }
}
