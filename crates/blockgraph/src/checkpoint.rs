//! Checkpoint layout and persistence
//!
//! A checkpoint taken after superstep `s` lives under one directory:
//!
//! ```text
//! {prefix}/{s:010}/worker-0       bincode + zstd WorkerSnapshot
//! {prefix}/{s:010}/worker-1
//! {prefix}/{s:010}/master         bincode + zstd MasterSnapshot
//! {prefix}/{s:010}/manifest.json  written last
//! ```
//!
//! Only directories with a manifest count. A crash halfway through a
//! checkpoint leaves a directory without one, which recovery ignores and the
//! next prune removes.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{CursorSnapshot, PieceId};
use crate::codec;
use crate::config::CheckpointConfig;
use crate::error::{BspError, Result};
use crate::graph::{GraphTotals, GraphTypes, PartitionId, PartitionMap, Vertex, WorkerId};
use crate::reducer::{BroadcastId, ReducerId};
use crate::storage::DurableStorage;

const MANIFEST: &str = "manifest.json";
const MASTER: &str = "master";

/// Everything a worker holds at a superstep boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct WorkerSnapshot<G: GraphTypes> {
    pub superstep: u64,
    pub worker: WorkerId,
    pub partitions: Vec<(PartitionId, Vec<Vertex<G>>)>,
    pub pending: Vec<(G::Id, Vec<Bytes>)>,
}

/// Master state needed to resume after superstep `superstep`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterSnapshot {
    pub superstep: u64,
    pub cursor: CursorSnapshot,
    /// Pieces of the superstep that follows the checkpoint
    pub send: Option<PieceId>,
    pub receive: Option<PieceId>,
    pub halting: bool,
    pub reducers: Vec<(ReducerId, Bytes)>,
    pub broadcasts: Vec<(BroadcastId, Bytes)>,
    pub map: PartitionMap,
    pub totals: GraphTotals,
    pub active_vertices: u64,
    pub pending_messages: u64,
    pub messages_sent: u64,
}

/// Index of a complete checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub superstep: u64,
    pub created_at: DateTime<Utc>,
    pub num_workers: usize,
    pub files: Vec<String>,
}

/// Reads and writes checkpoints through a [`DurableStorage`]
#[derive(Clone)]
pub struct CheckpointStore {
    storage: Arc<dyn DurableStorage>,
    config: CheckpointConfig,
}

impl CheckpointStore {
    pub fn new(storage: Arc<dyn DurableStorage>, config: CheckpointConfig) -> Self {
        Self { storage, config }
    }

    fn dir(&self, superstep: u64) -> String {
        format!("{}/{superstep:010}", self.config.prefix)
    }

    pub fn worker_key(&self, superstep: u64, worker: WorkerId) -> String {
        format!("{}/{worker}", self.dir(superstep))
    }

    pub fn master_key(&self, superstep: u64) -> String {
        format!("{}/{MASTER}", self.dir(superstep))
    }

    pub fn manifest_key(&self, superstep: u64) -> String {
        format!("{}/{MANIFEST}", self.dir(superstep))
    }

    async fn write_body<T: Serialize>(&self, key: String, value: &T) -> Result<String> {
        let body = codec::encode_compressed(value, self.config.compression_level)?;
        self.storage.write(&key, Bytes::from(body)).await?;
        debug!(key = %key, "Wrote checkpoint file");
        Ok(key)
    }

    async fn read_body<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        let body = self
            .storage
            .read(key)
            .await?
            .ok_or_else(|| BspError::Storage(format!("checkpoint file {key} is missing")))?;
        codec::decode_compressed(&body)
    }

    /// Persist a worker snapshot, returning its key
    pub async fn write_worker<G: GraphTypes>(&self, snapshot: &WorkerSnapshot<G>) -> Result<String> {
        self.write_body(self.worker_key(snapshot.superstep, snapshot.worker), snapshot)
            .await
    }

    pub async fn read_worker<G: GraphTypes>(
        &self,
        superstep: u64,
        worker: WorkerId,
    ) -> Result<WorkerSnapshot<G>> {
        self.read_body(&self.worker_key(superstep, worker)).await
    }

    pub async fn write_master(&self, snapshot: &MasterSnapshot) -> Result<String> {
        self.write_body(self.master_key(snapshot.superstep), snapshot)
            .await
    }

    pub async fn read_master(&self, superstep: u64) -> Result<MasterSnapshot> {
        self.read_body(&self.master_key(superstep)).await
    }

    /// Make a checkpoint valid by writing its manifest
    pub async fn commit(&self, superstep: u64, num_workers: usize, files: Vec<String>) -> Result<CheckpointManifest> {
        let manifest = CheckpointManifest {
            superstep,
            created_at: Utc::now(),
            num_workers,
            files,
        };
        let body = serde_json::to_vec_pretty(&manifest)?;
        self.storage
            .write(&self.manifest_key(superstep), Bytes::from(body))
            .await?;
        info!(superstep, files = manifest.files.len(), "Checkpoint committed");
        Ok(manifest)
    }

    /// Supersteps that have a directory, complete or not
    async fn supersteps(&self) -> Result<(BTreeSet<u64>, BTreeSet<u64>)> {
        let prefix = format!("{}/", self.config.prefix);
        let mut all = BTreeSet::new();
        let mut complete = BTreeSet::new();
        for key in self.storage.list(&prefix).await? {
            let mut parts = key[prefix.len()..].splitn(2, '/');
            let Some(Ok(superstep)) = parts.next().map(str::parse::<u64>) else {
                continue;
            };
            all.insert(superstep);
            if parts.next() == Some(MANIFEST) {
                complete.insert(superstep);
            }
        }
        Ok((all, complete))
    }

    /// Newest checkpoint whose manifest is readable and lists every file
    pub async fn latest_complete(&self) -> Result<Option<CheckpointManifest>> {
        let (_, complete) = self.supersteps().await?;
        for superstep in complete.into_iter().rev() {
            let Some(body) = self.storage.read(&self.manifest_key(superstep)).await? else {
                continue;
            };
            match serde_json::from_slice::<CheckpointManifest>(&body) {
                Ok(manifest) if manifest.files.len() == manifest.num_workers + 1 => {
                    return Ok(Some(manifest))
                }
                Ok(_) | Err(_) => {
                    warn!(superstep, "Ignoring unreadable checkpoint manifest");
                }
            }
        }
        Ok(None)
    }

    /// Delete all but the newest `keep` complete checkpoints, and every
    /// incomplete one older than the newest complete checkpoint
    pub async fn prune(&self) -> Result<usize> {
        let (all, complete) = self.supersteps().await?;
        let kept: BTreeSet<u64> = complete.iter().rev().take(self.config.keep).copied().collect();
        let newest = complete.iter().next_back().copied();

        let mut removed = 0;
        for superstep in all {
            let stale = match newest {
                Some(newest) => superstep < newest && !kept.contains(&superstep),
                None => false,
            };
            if !stale {
                continue;
            }
            // Manifest first, so a half-deleted checkpoint is never trusted
            let dir = format!("{}/", self.dir(superstep));
            let mut keys = self.storage.list(&dir).await?;
            keys.sort_by_key(|key| !key.ends_with(MANIFEST));
            for key in keys {
                self.storage.delete(&key).await?;
            }
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "Pruned checkpoints");
        }
        Ok(removed)
    }
}
