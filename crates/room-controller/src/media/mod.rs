//! Media engine facade.
//!
//! The engine that forwards packets and runs ICE/DTLS is an external
//! collaborator. Everything above this module talks to it through the
//! [`MediaEngine`] trait, and every call the actors make goes through
//! [`EngineCall`], which bounds it with a timeout and makes sure a handle
//! created after the caller gave up is closed instead of leaked.

pub mod memory;
pub mod types;
pub mod worker_pool;

use crate::errors::{EngineError, RoomError};
use crate::observability::metrics::record_engine_call;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use types::{
    ConsumerId, DtlsParameters, DtlsState, MediaKind, ProducerId, RouterId, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportId, TransportOptions, TransportParams, WorkerId,
};

pub use memory::{EngineCounts, EngineOperation, Fault, InMemoryEngine};
pub use worker_pool::WorkerPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: WorkerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterHandle {
    pub id: RouterId,
    pub worker_id: WorkerId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    pub id: TransportId,
    pub router_id: RouterId,
    pub params: TransportParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerHandle {
    pub id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Reference to any closable engine object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EngineHandle {
    Worker(WorkerId),
    Router(RouterId),
    Transport(TransportId),
    Producer(ProducerId),
    Consumer(ConsumerId),
}

impl std::fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineHandle::Worker(id) => write!(f, "worker {id}"),
            EngineHandle::Router(id) => write!(f, "router {id}"),
            EngineHandle::Transport(id) => write!(f, "transport {id}"),
            EngineHandle::Producer(id) => write!(f, "producer {id}"),
            EngineHandle::Consumer(id) => write!(f, "consumer {id}"),
        }
    }
}

/// Asynchronous lifecycle events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TransportStateChanged {
        transport_id: TransportId,
        state: DtlsState,
    },
    WorkerDied {
        worker_id: WorkerId,
    },
}

/// Capability interface over an external media engine.
///
/// Every create-style call may fail; failures are typed `EngineError`s.
/// `close` is idempotent and closing a parent closes its children.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self) -> Result<WorkerHandle, EngineError>;

    async fn create_router(
        &self,
        worker_id: &WorkerId,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterHandle, EngineError>;

    async fn create_transport(
        &self,
        router_id: &RouterId,
        options: &TransportOptions,
    ) -> Result<TransportHandle, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerHandle, EngineError>;

    async fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerHandle, EngineError>;

    async fn close(&self, handle: EngineHandle);

    /// Subscribe to lifecycle events. Delivery is at-least-once per
    /// subscriber; handlers must be idempotent.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Result of an engine call that may own an engine object.
pub trait EngineResource {
    /// Handle to close if the caller abandons the result.
    fn engine_handle(&self) -> Option<EngineHandle>;
}

impl EngineResource for WorkerHandle {
    fn engine_handle(&self) -> Option<EngineHandle> {
        Some(EngineHandle::Worker(self.id.clone()))
    }
}

impl EngineResource for RouterHandle {
    fn engine_handle(&self) -> Option<EngineHandle> {
        Some(EngineHandle::Router(self.id.clone()))
    }
}

impl EngineResource for TransportHandle {
    fn engine_handle(&self) -> Option<EngineHandle> {
        Some(EngineHandle::Transport(self.id.clone()))
    }
}

impl EngineResource for ProducerHandle {
    fn engine_handle(&self) -> Option<EngineHandle> {
        Some(EngineHandle::Producer(self.id.clone()))
    }
}

impl EngineResource for ConsumerHandle {
    fn engine_handle(&self) -> Option<EngineHandle> {
        Some(EngineHandle::Consumer(self.id.clone()))
    }
}

impl EngineResource for () {
    fn engine_handle(&self) -> Option<EngineHandle> {
        None
    }
}

impl EngineResource for bool {
    fn engine_handle(&self) -> Option<EngineHandle> {
        None
    }
}

/// Engine access bounded by a timeout and a cancellation token.
#[derive(Clone)]
pub struct EngineCall {
    engine: Arc<dyn MediaEngine>,
    timeout: Duration,
}

enum CallOutcome<T> {
    Finished(Result<Result<T, EngineError>, tokio::task::JoinError>),
    Cancelled,
    TimedOut,
}

impl EngineCall {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Close a handle, ignoring whether it still existed.
    ///
    /// Bounded by the call timeout so teardown never hangs on the engine.
    pub async fn close(&self, handle: EngineHandle) {
        let label = handle.to_string();
        if tokio::time::timeout(self.timeout, self.engine.close(handle))
            .await
            .is_err()
        {
            warn!(target: "rc.media", handle = %label, "Engine close timed out");
        }
    }

    /// Run one engine operation.
    ///
    /// The operation runs on its own task so a cancelled or timed-out
    /// caller never orphans the result: a reaper awaits the task and
    /// closes whatever it produced.
    ///
    /// # Errors
    ///
    /// - `RoomError::Timeout` if the engine did not answer in time
    /// - `RoomError::SessionClosed` if `cancel` fired first
    /// - the engine's own error otherwise
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T, RoomError>
    where
        T: EngineResource + Send + 'static,
        F: FnOnce(Arc<dyn MediaEngine>) -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(RoomError::SessionClosed);
        }

        let start = Instant::now();
        let mut task = tokio::spawn(call(Arc::clone(&self.engine)));

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => CallOutcome::Cancelled,
            joined = tokio::time::timeout(self.timeout, &mut task) => match joined {
                Ok(result) => CallOutcome::Finished(result),
                Err(_) => CallOutcome::TimedOut,
            },
        };

        match outcome {
            CallOutcome::Finished(Ok(Ok(value))) => {
                record_engine_call(operation, "ok", start.elapsed());
                if cancel.is_cancelled() {
                    // Caller is gone; the result would never be tracked.
                    if let Some(handle) = value.engine_handle() {
                        debug!(target: "rc.media", operation, %handle, "Closing handle created after cancellation");
                        self.engine.close(handle).await;
                    }
                    return Err(RoomError::SessionClosed);
                }
                Ok(value)
            }
            CallOutcome::Finished(Ok(Err(e))) => {
                record_engine_call(operation, "error", start.elapsed());
                Err(e.into())
            }
            CallOutcome::Finished(Err(join_err)) => {
                record_engine_call(operation, "error", start.elapsed());
                Err(RoomError::Internal(format!(
                    "engine call {operation} failed: {join_err}"
                )))
            }
            CallOutcome::Cancelled => {
                record_engine_call(operation, "cancelled", start.elapsed());
                self.reap(operation, task);
                Err(RoomError::SessionClosed)
            }
            CallOutcome::TimedOut => {
                record_engine_call(operation, "timeout", start.elapsed());
                warn!(
                    target: "rc.media",
                    operation,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "Engine call timed out"
                );
                self.reap(operation, task);
                Err(RoomError::Timeout(operation))
            }
        }
    }

    /// Await an abandoned call in the background and close its result.
    fn reap<T>(&self, operation: &'static str, task: tokio::task::JoinHandle<Result<T, EngineError>>)
    where
        T: EngineResource + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Ok(Ok(value)) = task.await {
                if let Some(handle) = value.engine_handle() {
                    debug!(target: "rc.media", operation, %handle, "Closing late engine handle");
                    engine.close(handle).await;
                }
            }
        });
    }
}
