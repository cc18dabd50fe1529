//! What master compute functions can do

use serde::Serialize;

use crate::error::Result;
use crate::graph::GraphTotals;
use crate::reducer::{BroadcastHandle, BroadcastStore, ReduceOp, ReducerHandle, ReducerRegistry};

/// Api handed to [`Piece::master_compute`](crate::block::Piece::master_compute)
pub struct MasterApi<'a> {
    superstep: u64,
    totals: GraphTotals,
    reducers: &'a ReducerRegistry,
    broadcasts: &'a mut BroadcastStore,
}

impl<'a> MasterApi<'a> {
    pub(crate) fn new(
        superstep: u64,
        totals: GraphTotals,
        reducers: &'a ReducerRegistry,
        broadcasts: &'a mut BroadcastStore,
    ) -> Self {
        Self {
            superstep,
            totals,
            reducers,
            broadcasts,
        }
    }

    /// The superstep that just finished
    pub fn superstep(&self) -> u64 {
        self.superstep
    }

    pub fn total_num_vertices(&self) -> u64 {
        self.totals.vertices
    }

    pub fn total_num_edges(&self) -> u64 {
        self.totals.edges
    }

    /// Global value of a reducer, as resolved at the end of this superstep
    pub fn reduced_value<Op: ReduceOp>(&self, handle: ReducerHandle<Op>) -> Result<Op::Value> {
        self.reducers.reduced_value(handle, self.superstep)
    }

    /// Publish a value every worker can read from the next superstep on
    pub fn broadcast<T: Serialize>(&mut self, handle: BroadcastHandle<T>, value: &T) -> Result<()> {
        self.broadcasts.set(handle, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::PieceId;
    use crate::reducer::{CreateReducersApi, SumReduce};
    use crate::codec;

    #[test]
    fn test_reduced_value_requires_resolution() {
        let mut registry = ReducerRegistry::new();
        let mut create = CreateReducersApi::new(PieceId(2));
        let sum = create.create_local_reducer(SumReduce::<u64>::new());
        let flag = create.create_broadcast::<bool>();
        registry.register(create.into_registrations()).unwrap();

        registry.merge_partial(sum.id(), &codec::encode(&5u64).unwrap()).unwrap();
        let mut broadcasts = BroadcastStore::new();

        {
            let api = MasterApi::new(7, GraphTotals::default(), &registry, &mut broadcasts);
            assert!(api.reduced_value(sum).is_err());
        }

        registry.resolve_all(7).unwrap();
        let mut api = MasterApi::new(7, GraphTotals::default(), &registry, &mut broadcasts);
        assert_eq!(api.reduced_value(sum).unwrap(), 5);
        api.broadcast(flag, &true).unwrap();
        assert!(broadcasts.get(flag).unwrap());
    }
}
