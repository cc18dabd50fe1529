//! Per-superstep barrier on the master

use std::collections::BTreeMap;

use crate::graph::WorkerId;

/// Collects one response per worker
///
/// Duplicates from the same worker are ignored, so a transport that
/// redelivers a report cannot complete a barrier early.
#[derive(Debug)]
pub struct Barrier<T> {
    num_workers: usize,
    responses: BTreeMap<WorkerId, T>,
}

impl<T> Barrier<T> {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            responses: BTreeMap::new(),
        }
    }

    /// Record a response; returns false for a duplicate or unknown worker
    pub fn arrive(&mut self, worker: WorkerId, response: T) -> bool {
        if worker.index() >= self.num_workers || self.responses.contains_key(&worker) {
            return false;
        }
        self.responses.insert(worker, response);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.responses.len() == self.num_workers
    }

    /// Workers that have not arrived yet
    pub fn missing(&self) -> Vec<WorkerId> {
        (0..self.num_workers)
            .map(WorkerId)
            .filter(|worker| !self.responses.contains_key(worker))
            .collect()
    }

    /// Responses in worker order
    pub fn into_responses(self) -> Vec<T> {
        self.responses.into_values().collect()
    }
}
