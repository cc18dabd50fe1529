//! Message combiners
//!
//! A combiner folds payloads bound for the same destination while they are
//! buffered, so at most one payload per destination is held. It must be
//! commutative and associative; receive logic sees the folded value only.

use std::ops::AddAssign;
use std::sync::Arc;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::codec;
use crate::error::Result;

/// Folds one message into an accumulated one
pub trait MessageCombiner<M>: Send + Sync {
    fn combine(&self, accumulated: &mut M, message: M);
}

/// Sum of all messages
#[derive(Debug, Clone, Copy, Default)]
pub struct SumCombiner;

impl<M: AddAssign + Send + Sync> MessageCombiner<M> for SumCombiner {
    fn combine(&self, accumulated: &mut M, message: M) {
        *accumulated += message;
    }
}

/// Smallest message
#[derive(Debug, Clone, Copy, Default)]
pub struct MinCombiner;

impl<M: PartialOrd + Send + Sync> MessageCombiner<M> for MinCombiner {
    fn combine(&self, accumulated: &mut M, message: M) {
        if message < *accumulated {
            *accumulated = message;
        }
    }
}

/// Largest message
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxCombiner;

impl<M: PartialOrd + Send + Sync> MessageCombiner<M> for MaxCombiner {
    fn combine(&self, accumulated: &mut M, message: M) {
        if message > *accumulated {
            *accumulated = message;
        }
    }
}

/// Combiner over encoded payloads, as held by the message store
pub(crate) trait PayloadCombiner: Send + Sync {
    fn combine(&self, accumulated: &mut Bytes, payload: Bytes) -> Result<()>;
}

/// Decodes both payloads, folds them with a typed combiner and re-encodes
pub(crate) struct TypedCombiner<M> {
    inner: Arc<dyn MessageCombiner<M>>,
}

impl<M> TypedCombiner<M> {
    pub(crate) fn new(inner: Arc<dyn MessageCombiner<M>>) -> Self {
        Self { inner }
    }
}

impl<M> PayloadCombiner for TypedCombiner<M>
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn combine(&self, accumulated: &mut Bytes, payload: Bytes) -> Result<()> {
        let mut value: M = codec::decode(accumulated.as_ref())?;
        let message: M = codec::decode(&payload)?;
        self.inner.combine(&mut value, message);
        *accumulated = codec::encode(&value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_combiners() {
        let mut sum = 3i64;
        SumCombiner.combine(&mut sum, 4);
        assert_eq!(sum, 7);

        let mut min = 3.5f64;
        MinCombiner.combine(&mut min, 1.5);
        MinCombiner.combine(&mut min, 2.0);
        assert_eq!(min, 1.5);

        let mut max = 3u32;
        MaxCombiner.combine(&mut max, 1);
        assert_eq!(max, 3);
    }

    #[test]
    fn test_typed_combiner_over_bytes() {
        let combiner = TypedCombiner::<u64>::new(Arc::new(SumCombiner));
        let mut accumulated = codec::encode(&10u64).unwrap();
        combiner
            .combine(&mut accumulated, codec::encode(&5u64).unwrap())
            .unwrap();
        assert_eq!(codec::decode::<u64>(&accumulated).unwrap(), 15);
    }
}
