//! Fixed pool of media workers with round-robin router placement.
//!
//! The pool is sized once at startup (one worker per CPU core by default)
//! and never resized. The round-robin cursor is the only state shared by
//! every room-creation call; it is a single atomic, so concurrent callers
//! never observe a torn update and placement stays deterministic: the i-th
//! router created lands on worker `i mod K`.
//!
//! Failure policy: a worker that dies is NOT restarted in place. The first
//! death is reported through [`WorkerPool::failed`] and the service is
//! expected to exit so an external supervisor restarts it whole; all rooms
//! and connections are rebuilt by reconnecting clients. This trades
//! resilience for simplicity and is deliberate.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use shopstream_core::config::MediaConfig;
use shopstream_core::{Error, Result};

use crate::rtp::RouterCapabilities;
use crate::worker::{self, Worker, WorkerCommand};
use crate::types::{RoomId, RouterId, WorkerId};

/// Handle to a router living on one worker.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    pub id: RouterId,
    pub worker: Worker,
    pub capabilities: RouterCapabilities,
}

pub struct WorkerPool {
    workers: Vec<Worker>,
    cursor: AtomicUsize,
    death_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkerId>>,
    join_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `count` workers (callers resolve 0/auto beforehand via
    /// `Config::worker_count`).
    pub fn new(count: usize, media: MediaConfig) -> std::io::Result<Self> {
        let count = count.max(1);
        let (death_tx, death_rx) = mpsc::unbounded_channel();

        let mut workers = Vec::with_capacity(count);
        let mut join_handles = Vec::with_capacity(count);
        for id in 0..count {
            let (worker, handle) = worker::spawn(id, media.clone(), death_tx.clone())?;
            workers.push(worker);
            join_handles.push(handle);
        }

        info!(workers = count, "Worker pool started");

        Ok(Self {
            workers,
            cursor: AtomicUsize::new(0),
            death_rx: tokio::sync::Mutex::new(death_rx),
            join_handles: Mutex::new(join_handles),
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Next worker in round-robin order, wrapping at the pool size.
    #[must_use]
    pub fn next_worker(&self) -> &Worker {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index]
    }

    /// Create a router for `room_id` on the next worker.
    pub async fn create_router(&self, room_id: RoomId) -> Result<RouterHandle> {
        let worker = self.next_worker().clone();
        let router_id = RouterId::generate();
        let capabilities = RouterCapabilities::broadcast_default();

        worker
            .request(|reply| WorkerCommand::CreateRouter {
                router_id: router_id.clone(),
                room_id: room_id.clone(),
                capabilities: capabilities.clone(),
                reply,
            })
            .await?;

        info!(
            room_id = %room_id,
            router_id = %router_id,
            worker_id = worker.id(),
            "Router created"
        );

        Ok(RouterHandle {
            id: router_id,
            worker,
            capabilities,
        })
    }

    /// Resolves when any worker dies. Fatal by design: callers should stop
    /// the service rather than attempt in-place recovery.
    pub async fn failed(&self) -> Error {
        let mut rx = self.death_rx.lock().await;
        match rx.recv().await {
            Some(worker_id) => Error::WorkerFailure(format!(
                "media worker {worker_id} died; restarting the service"
            )),
            None => Error::WorkerFailure("worker pool torn down".to_string()),
        }
    }

    /// Orderly shutdown: ask every worker to stop and join its thread.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
        let handles = std::mem::take(&mut *self.join_handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        info!("Worker pool stopped");
    }
}
