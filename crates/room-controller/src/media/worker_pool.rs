//! Shared pool of media engine workers.
//!
//! Workers are created once at startup and handed out round-robin to new
//! rooms. When a worker dies it is removed and a replacement is started so
//! the pool keeps its size; rooms on the dead worker are failed by the
//! registry, not here.

use super::{EngineHandle, MediaEngine, WorkerHandle};
use crate::errors::EngineError;
use crate::media::types::WorkerId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    workers: RwLock<Vec<WorkerHandle>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Start `count` workers.
    ///
    /// # Errors
    ///
    /// Returns the first worker creation failure. Workers already started
    /// are closed again.
    pub async fn start(engine: Arc<dyn MediaEngine>, count: usize) -> Result<Self, EngineError> {
        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            match engine.create_worker().await {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    for worker in workers {
                        engine.close(EngineHandle::Worker(worker.id)).await;
                    }
                    return Err(e);
                }
            }
        }

        info!(target: "rc.media", workers = count, "Worker pool started");

        Ok(Self {
            engine,
            workers: RwLock::new(workers),
            next: AtomicUsize::new(0),
        })
    }

    /// Pick the worker for a new room.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` if no live worker is available.
    pub async fn next_worker(&self) -> Result<WorkerId, EngineError> {
        let workers = self.workers.read().await;
        if workers.is_empty() {
            return Err(EngineError::ResourceExhausted(
                "no live media workers".to_string(),
            ));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
        workers
            .get(index)
            .map(|w| w.id.clone())
            .ok_or_else(|| EngineError::ResourceExhausted("no live media workers".to_string()))
    }

    /// Drop a dead worker and start a replacement.
    ///
    /// Idempotent: a worker that is no longer in the pool is ignored, so a
    /// duplicated death event does not start a second replacement.
    pub async fn handle_worker_death(&self, worker_id: &WorkerId) {
        {
            let mut workers = self.workers.write().await;
            let before = workers.len();
            workers.retain(|w| &w.id != worker_id);
            if workers.len() == before {
                return;
            }
        }

        warn!(target: "rc.media", worker_id = %worker_id, "Replacing dead media worker");

        match self.engine.create_worker().await {
            Ok(worker) => {
                info!(target: "rc.media", worker_id = %worker.id, "Replacement media worker started");
                self.workers.write().await.push(worker);
            }
            Err(e) => {
                error!(target: "rc.media", error = %e, "Failed to start replacement media worker");
            }
        }
    }

    pub async fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers
            .read()
            .await
            .iter()
            .map(|w| w.id.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    /// Close every worker (shutdown).
    pub async fn close_all(&self) {
        let workers: Vec<WorkerHandle> = self.workers.write().await.drain(..).collect();
        for worker in workers {
            self.engine.close(EngineHandle::Worker(worker.id)).await;
        }
        info!(target: "rc.media", "Worker pool closed");
    }
}
