//! In-process transport over tokio channels

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{MasterMessage, Transport, WorkerLauncher, WorkerMessage};
use crate::error::{BspError, Result};
use crate::graph::{GraphTypes, WorkerId};

/// One unbounded channel per worker plus one for the master
pub struct LocalTransport<G: GraphTypes> {
    workers: RwLock<Vec<UnboundedSender<WorkerMessage<G>>>>,
    master: UnboundedSender<MasterMessage>,
}

/// Receiving ends handed out by [`LocalTransport::new`]
pub struct LocalEndpoints<G: GraphTypes> {
    pub workers: Vec<UnboundedReceiver<WorkerMessage<G>>>,
    pub master: UnboundedReceiver<MasterMessage>,
}

impl<G: GraphTypes> LocalTransport<G> {
    pub fn new(num_workers: usize) -> (Arc<Self>, LocalEndpoints<G>) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..num_workers).map(|_| mpsc::unbounded_channel()).unzip();
        let (master, master_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            workers: RwLock::new(senders),
            master,
        });
        (
            transport,
            LocalEndpoints {
                workers: receivers,
                master: master_rx,
            },
        )
    }

    /// Replace a worker's channel, e.g. after its task died
    ///
    /// Messages queued for the old endpoint are lost.
    pub fn reconnect(&self, worker: WorkerId) -> Result<UnboundedReceiver<WorkerMessage<G>>> {
        let mut workers = self.workers.write();
        let slot = workers
            .get_mut(worker.index())
            .ok_or_else(|| BspError::Transport(format!("no such worker {worker}")))?;
        let (sender, receiver) = mpsc::unbounded_channel();
        *slot = sender;
        debug!(%worker, "Reconnected worker endpoint");
        Ok(receiver)
    }
}

#[async_trait]
impl<G: GraphTypes> Transport<G> for LocalTransport<G> {
    fn num_workers(&self) -> usize {
        self.workers.read().len()
    }

    async fn send_to_worker(&self, worker: WorkerId, message: WorkerMessage<G>) -> Result<()> {
        let sender = self
            .workers
            .read()
            .get(worker.index())
            .cloned()
            .ok_or_else(|| BspError::Transport(format!("no such worker {worker}")))?;
        sender
            .send(message)
            .map_err(|_| BspError::worker_failed(worker, "endpoint closed"))
    }

    async fn send_to_master(&self, message: MasterMessage) -> Result<()> {
        self.master
            .send(message)
            .map_err(|_| BspError::Transport("master endpoint closed".into()))
    }
}

type SpawnWorker<G> =
    dyn Fn(WorkerId, UnboundedReceiver<WorkerMessage<G>>) -> JoinHandle<()> + Send + Sync;

/// Runs each worker as a tokio task and respawns it on demand
pub struct TaskLauncher<G: GraphTypes> {
    transport: Arc<LocalTransport<G>>,
    spawn: Box<SpawnWorker<G>>,
    tasks: Mutex<HashMap<WorkerId, JoinHandle<()>>>,
}

impl<G: GraphTypes> TaskLauncher<G> {
    pub fn new(
        transport: Arc<LocalTransport<G>>,
        spawn: impl Fn(WorkerId, UnboundedReceiver<WorkerMessage<G>>) -> JoinHandle<()>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            transport,
            spawn: Box::new(spawn),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start a worker on an endpoint handed out by [`LocalTransport::new`]
    pub fn launch(&self, worker: WorkerId, inbox: UnboundedReceiver<WorkerMessage<G>>) {
        let handle = (self.spawn)(worker, inbox);
        if let Some(previous) = self.tasks.lock().insert(worker, handle) {
            previous.abort();
        }
    }

    /// Wait for every worker task to finish
    pub async fn join_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain().collect();
        for (worker, handle) in tasks {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(%worker, error = %err, "Worker task ended abnormally");
                }
            }
        }
    }
}

#[async_trait]
impl<G: GraphTypes> WorkerLauncher for TaskLauncher<G> {
    async fn restart(&self, worker: WorkerId) -> Result<()> {
        let inbox = self.transport.reconnect(worker)?;
        warn!(%worker, "Restarting worker");
        self.launch(worker, inbox);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type G = crate::graph::Types<u64, u64, ()>;

    #[tokio::test]
    async fn test_point_to_point_delivery() {
        let (transport, mut endpoints) = LocalTransport::<G>::new(2);
        transport
            .send_to_worker(WorkerId(1), WorkerMessage::Shutdown)
            .await
            .unwrap();
        assert!(matches!(
            endpoints.workers[1].recv().await,
            Some(WorkerMessage::Shutdown)
        ));
        assert!(endpoints.workers[0].try_recv().is_err());

        transport.broadcast(WorkerMessage::WriteOutput { epoch: 0 }).await.unwrap();
        for inbox in &mut endpoints.workers {
            assert!(matches!(inbox.recv().await, Some(WorkerMessage::WriteOutput { .. })));
        }
    }

    #[tokio::test]
    async fn test_closed_endpoint_is_worker_failure() {
        let (transport, mut endpoints) = LocalTransport::<G>::new(1);
        drop(endpoints.workers.remove(0));

        let err = transport
            .send_to_worker(WorkerId(0), WorkerMessage::Shutdown)
            .await
            .unwrap_err();
        assert_eq!(err.failed_workers(), vec![WorkerId(0)]);

        let mut inbox = transport.reconnect(WorkerId(0)).unwrap();
        transport
            .send_to_worker(WorkerId(0), WorkerMessage::Shutdown)
            .await
            .unwrap();
        assert!(inbox.recv().await.is_some());
    }

    #[test]
    fn test_broadcast_skips_past_closed_endpoint() {
        let (transport, mut endpoints) = LocalTransport::<G>::new(3);
        drop(endpoints.workers.remove(0));

        let err = tokio_test::block_on(transport.broadcast(WorkerMessage::Shutdown)).unwrap_err();
        assert_eq!(err.failed_workers(), vec![WorkerId(0)]);
        for inbox in &mut endpoints.workers {
            assert!(matches!(inbox.try_recv(), Ok(WorkerMessage::Shutdown)));
        }
    }
}
