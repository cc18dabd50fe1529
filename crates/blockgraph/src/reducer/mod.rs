//! Global aggregation
//!
//! Reducers fold values produced by vertices on every worker into one value
//! the master sees after the barrier. Each worker keeps a partial per
//! reducer; partials travel to the master as encoded bytes, are merged there
//! and resolved once per superstep.
//!
//! ```text
//!   worker 0: reduce(h, x) ─► partial ─┐
//!   worker 1: reduce(h, y) ─► partial ─┼─► master: merge ─► resolve ─► master_compute
//!   worker 2: reduce(h, z) ─► partial ─┘
//! ```
//!
//! Handles are assigned deterministically from the registering piece and the
//! registration index, so master and workers agree on them without
//! exchanging anything. Broadcasts work the other way round: the master
//! publishes a value and every worker reads it in the following supersteps.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Add;

use num_traits::{Bounded, Zero};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::block::PieceId;

pub mod registry;

pub use registry::{BroadcastStore, CreateReducersApi, ReducerKind, ReducerRegistry};

/// An associative and commutative reduction with an identity element
///
/// `reduce_single` folds one vertex-provided input, `reduce_partial` merges
/// two partially reduced values. Both must give the same result regardless of
/// grouping and order.
pub trait ReduceOp: Send + Sync + 'static {
    /// What vertices hand to [`reduce`](crate::worker::WorkerApi::reduce)
    type Input;

    /// Partial and global value
    type Value: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Identity element
    fn initial(&self) -> Self::Value;

    fn reduce_single(&self, current: &mut Self::Value, input: Self::Input);

    fn reduce_partial(&self, current: &mut Self::Value, partial: Self::Value);

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

macro_rules! marker_op {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name<T>(PhantomData<fn() -> T>);

        impl<T> $name<T> {
            pub fn new() -> Self {
                Self(PhantomData)
            }
        }

        impl<T> Default for $name<T> {
            fn default() -> Self {
                Self::new()
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                Self::new()
            }
        }

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(stringify!($name))
            }
        }
    };
}

marker_op!(
    /// Sum of all inputs
    SumReduce
);
marker_op!(
    /// Largest input
    MaxReduce
);
marker_op!(
    /// Smallest input
    MinReduce
);

impl<T> ReduceOp for SumReduce<T>
where
    T: Zero + Add<Output = T> + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Input = T;
    type Value = T;

    fn initial(&self) -> T {
        T::zero()
    }

    fn reduce_single(&self, current: &mut T, input: T) {
        *current = current.clone() + input;
    }

    fn reduce_partial(&self, current: &mut T, partial: T) {
        self.reduce_single(current, partial);
    }

    fn name(&self) -> &'static str {
        "sum"
    }
}

impl<T> ReduceOp for MaxReduce<T>
where
    T: Bounded + PartialOrd + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Input = T;
    type Value = T;

    fn initial(&self) -> T {
        T::min_value()
    }

    fn reduce_single(&self, current: &mut T, input: T) {
        if input > *current {
            *current = input;
        }
    }

    fn reduce_partial(&self, current: &mut T, partial: T) {
        self.reduce_single(current, partial);
    }

    fn name(&self) -> &'static str {
        "max"
    }
}

impl<T> ReduceOp for MinReduce<T>
where
    T: Bounded + PartialOrd + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Input = T;
    type Value = T;

    fn initial(&self) -> T {
        T::max_value()
    }

    fn reduce_single(&self, current: &mut T, input: T) {
        if input < *current {
            *current = input;
        }
    }

    fn reduce_partial(&self, current: &mut T, partial: T) {
        self.reduce_single(current, partial);
    }

    fn name(&self) -> &'static str {
        "min"
    }
}

/// Logical and; `true` when nothing was reduced
#[derive(Debug, Clone, Copy, Default)]
pub struct AndReduce;

impl ReduceOp for AndReduce {
    type Input = bool;
    type Value = bool;

    fn initial(&self) -> bool {
        true
    }

    fn reduce_single(&self, current: &mut bool, input: bool) {
        *current &= input;
    }

    fn reduce_partial(&self, current: &mut bool, partial: bool) {
        *current &= partial;
    }

    fn name(&self) -> &'static str {
        "and"
    }
}

/// Logical or; `false` when nothing was reduced
#[derive(Debug, Clone, Copy, Default)]
pub struct OrReduce;

impl ReduceOp for OrReduce {
    type Input = bool;
    type Value = bool;

    fn initial(&self) -> bool {
        false
    }

    fn reduce_single(&self, current: &mut bool, input: bool) {
        *current |= input;
    }

    fn reduce_partial(&self, current: &mut bool, partial: bool) {
        *current |= partial;
    }

    fn name(&self) -> &'static str {
        "or"
    }
}

/// Number of `reduce` calls
#[derive(Debug, Clone, Copy, Default)]
pub struct CountReduce;

impl ReduceOp for CountReduce {
    type Input = ();
    type Value = u64;

    fn initial(&self) -> u64 {
        0
    }

    fn reduce_single(&self, current: &mut u64, _input: ()) {
        *current += 1;
    }

    fn reduce_partial(&self, current: &mut u64, partial: u64) {
        *current += partial;
    }

    fn name(&self) -> &'static str {
        "count"
    }
}

/// Identifier of a reducer: registering piece plus registration index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReducerId {
    pub piece: PieceId,
    pub index: u32,
}

impl fmt::Display for ReducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reducer {}/{}", self.piece.0, self.index)
    }
}

/// Identifier of a broadcast value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BroadcastId {
    pub piece: PieceId,
    pub index: u32,
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broadcast {}/{}", self.piece.0, self.index)
    }
}

/// Typed handle to a registered reducer
pub struct ReducerHandle<Op> {
    id: ReducerId,
    _op: PhantomData<fn() -> Op>,
}

impl<Op> ReducerHandle<Op> {
    pub(crate) fn new(id: ReducerId) -> Self {
        Self {
            id,
            _op: PhantomData,
        }
    }

    pub fn id(&self) -> ReducerId {
        self.id
    }
}

impl<Op> Clone for ReducerHandle<Op> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Op> Copy for ReducerHandle<Op> {}

impl<Op> fmt::Debug for ReducerHandle<Op> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReducerHandle({})", self.id)
    }
}

/// Typed handle to a value the master broadcasts to every worker
pub struct BroadcastHandle<T> {
    id: BroadcastId,
    _value: PhantomData<fn() -> T>,
}

impl<T> BroadcastHandle<T> {
    pub(crate) fn new(id: BroadcastId) -> Self {
        Self {
            id,
            _value: PhantomData,
        }
    }

    pub fn id(&self) -> BroadcastId {
        self.id
    }
}

impl<T> Clone for BroadcastHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BroadcastHandle<T> {}

impl<T> fmt::Debug for BroadcastHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BroadcastHandle({})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold<Op: ReduceOp>(op: &Op, inputs: Vec<Op::Input>) -> Op::Value {
        let mut value = op.initial();
        for input in inputs {
            op.reduce_single(&mut value, input);
        }
        value
    }

    #[test]
    fn test_builtin_ops() {
        assert_eq!(fold(&SumReduce::<i64>::new(), vec![1, 2, 3]), 6);
        assert_eq!(fold(&MaxReduce::<i32>::new(), vec![-4, 9, 2]), 9);
        assert_eq!(fold(&MinReduce::<f64>::new(), vec![2.5, -1.0]), -1.0);
        assert!(fold(&AndReduce, vec![]));
        assert!(!fold(&AndReduce, vec![true, false]));
        assert!(fold(&OrReduce, vec![false, true]));
        assert_eq!(fold(&CountReduce, vec![(), (), ()]), 3);
    }

    #[test]
    fn test_partials_merge_like_single_reduce() {
        let op = SumReduce::<u64>::new();
        let mut left = fold(&op, vec![1, 2]);
        let right = fold(&op, vec![3, 4]);
        op.reduce_partial(&mut left, right);
        assert_eq!(left, fold(&op, vec![4, 3, 2, 1]));
    }

    #[test]
    fn test_handle_display() {
        let handle = ReducerHandle::<CountReduce>::new(ReducerId {
            piece: PieceId(3),
            index: 1,
        });
        assert_eq!(handle.id().to_string(), "reducer 3/1");
    }
}
