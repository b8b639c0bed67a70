//! `RoomRegistryActor` - singleton owner of the room table.
//!
//! The registry is the single authority for creating, finding and removing
//! rooms:
//!
//! - Singleton per process, passed around by `RoomRegistryHandle`
//! - Supervises N `RoomActor` instances (panic detection via `JoinHandle`)
//! - Owns the root `CancellationToken` for rooms
//! - Fails every room hosted by a dead worker
//!
//! # Room creation
//!
//! `create_room` reserves the id immediately and creates the router on a
//! separate task, so the mailbox keeps serving other rooms while the engine
//! works. While reserved:
//! - a second `create_room` for the id returns `RoomAlreadyExists`
//! - `find` returns `RoomNotFound`
//! - `remove_if_empty` is a no-op
//!
//! When router creation fails or times out the reservation is released. A
//! router that arrives after the requester is gone is closed immediately.

use crate::errors::{EngineError, RoomError};
use crate::media::types::{RouterId, RtpCodecCapability, WorkerId};
use crate::media::{EngineCall, EngineHandle, RouterHandle, WorkerPool};

use super::messages::{RegistryMessage, RegistryStatus, RoomCloseReason};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomHandle};

use common::RoomId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long to wait for a room actor to finish after it was told to stop.
const ROOM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `RoomRegistryActor`.
///
/// This is the public interface for interacting with the registry.
/// All methods are async and return results via oneshot channels.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Create a new `RoomRegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    ///
    /// # Arguments
    ///
    /// * `rc_id` - Room controller instance ID (for logs)
    /// * `pool` - Shared worker pool rooms are assigned to
    /// * `engine` - Engine access used for router creation
    /// * `max_peers_per_room` - Capacity bound per room, 0 = unbounded
    /// * `metrics` - Shared actor metrics
    #[must_use]
    pub fn new(
        rc_id: String,
        pool: Arc<WorkerPool>,
        engine: EngineCall,
        max_peers_per_room: usize,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor {
            rc_id: rc_id.clone(),
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            dead_workers: HashSet::new(),
            accepting_new: true,
            pool,
            engine,
            max_peers_per_room,
            mailbox: MailboxMonitor::new(ActorType::Registry, rc_id),
            metrics,
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Create a room with its own router.
    ///
    /// # Errors
    ///
    /// - `RoomAlreadyExists` if the id is registered or being created
    /// - `Draining` during shutdown
    /// - `Engine` / `Timeout` if router creation fails
    pub async fn create_room(
        &self,
        room_id: RoomId,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<RoomHandle, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::CreateRoom {
                room_id,
                media_codecs,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))?
    }

    /// Find a room.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` if the id is unknown or still being created.
    pub async fn find(&self, room_id: RoomId) -> Result<RoomHandle, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::FindRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove and close a room iff it has no peers. Returns whether it was removed.
    ///
    /// `router_id` names the room instance the caller saw; a room re-created
    /// under the same id since then is left alone.
    ///
    /// # Errors
    ///
    /// `Internal` if the registry is unreachable.
    pub async fn remove_if_empty(
        &self,
        room_id: RoomId,
        router_id: RouterId,
    ) -> Result<bool, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::RemoveIfEmpty {
                room_id,
                router_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Fail every room hosted by `worker_id`. Returns the removed room ids.
    ///
    /// # Errors
    ///
    /// `Internal` if the registry is unreachable.
    pub async fn worker_died(&self, worker_id: WorkerId) -> Result<Vec<RoomId>, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::WorkerDied {
                worker_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Get the current registry status.
    ///
    /// # Errors
    ///
    /// `Internal` if the registry is unreachable.
    pub async fn get_status(&self) -> Result<RegistryStatus, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting rooms and close every room.
    ///
    /// # Errors
    ///
    /// `Internal` if the registry is unreachable.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Internal state for a registered room.
struct ManagedRoom {
    handle: RoomHandle,
    task_handle: JoinHandle<()>,
    worker_id: WorkerId,
}

enum RoomEntry {
    /// Router creation in flight.
    Pending { worker_id: WorkerId },
    Active(ManagedRoom),
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    rc_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Used by router creation tasks to report back; weak so the mailbox
    /// closes once every handle is dropped.
    self_sender: mpsc::WeakSender<RegistryMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<RoomId, RoomEntry>,
    /// Workers reported dead; routers arriving from them are rejected.
    dead_workers: HashSet<WorkerId>,
    accepting_new: bool,
    pool: Arc<WorkerPool>,
    engine: EngineCall,
    max_peers_per_room: usize,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "rc.actor.registry", fields(rc_id = %self.rc_id))]
    async fn run(mut self) {
        info!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            "RoomRegistryActor started"
        );

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rc.actor.registry",
                        rc_id = %self.rc_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.close_all_rooms().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "rc.actor.registry",
                                rc_id = %self.rc_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.close_all_rooms().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::CreateRoom {
                room_id,
                media_codecs,
                respond_to,
            } => {
                self.create_room(room_id, media_codecs, respond_to).await;
            }

            RegistryMessage::RouterReady {
                room_id,
                worker_id,
                result,
                respond_to,
            } => {
                self.router_ready(room_id, worker_id, result, respond_to)
                    .await;
            }

            RegistryMessage::FindRoom {
                room_id,
                respond_to,
            } => {
                let result = match self.rooms.get(&room_id) {
                    Some(RoomEntry::Active(managed)) => Ok(managed.handle.clone()),
                    Some(RoomEntry::Pending { .. }) | None => {
                        Err(RoomError::RoomNotFound(room_id.to_string()))
                    }
                };
                let _ = respond_to.send(result);
            }

            RegistryMessage::RemoveIfEmpty {
                room_id,
                router_id,
                respond_to,
            } => {
                let removed = self.remove_if_empty(&room_id, &router_id).await;
                let _ = respond_to.send(removed);
            }

            RegistryMessage::WorkerDied {
                worker_id,
                respond_to,
            } => {
                let removed = self.worker_died(worker_id).await;
                let _ = respond_to.send(removed);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }

            RegistryMessage::Shutdown { respond_to } => {
                info!(
                    target: "rc.actor.registry",
                    rc_id = %self.rc_id,
                    room_count = self.rooms.len(),
                    "Initiating graceful shutdown"
                );
                self.accepting_new = false;
                self.close_all_rooms().await;
                let _ = respond_to.send(());
            }
        }
    }

    /// Reserve the id and start router creation off the mailbox.
    async fn create_room(
        &mut self,
        room_id: RoomId,
        media_codecs: Vec<RtpCodecCapability>,
        respond_to: oneshot::Sender<Result<RoomHandle, RoomError>>,
    ) {
        if !self.accepting_new {
            let _ = respond_to.send(Err(RoomError::Draining));
            return;
        }

        if self.rooms.contains_key(&room_id) {
            let _ = respond_to.send(Err(RoomError::RoomAlreadyExists(room_id.to_string())));
            return;
        }

        let worker_id = match self.pool.next_worker().await {
            Ok(worker_id) => worker_id,
            Err(e) => {
                warn!(
                    target: "rc.actor.registry",
                    rc_id = %self.rc_id,
                    room_id = %room_id,
                    error = %e,
                    "No worker available for new room"
                );
                let _ = respond_to.send(Err(e.into()));
                return;
            }
        };

        self.rooms.insert(
            room_id.clone(),
            RoomEntry::Pending {
                worker_id: worker_id.clone(),
            },
        );

        debug!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            room_id = %room_id,
            worker_id = %worker_id,
            "Room reserved, creating router"
        );

        let engine = self.engine.clone();
        let token = self.cancel_token.child_token();
        let self_sender = self.self_sender.clone();
        tokio::spawn(async move {
            let router_worker = worker_id.clone();
            let result = engine
                .run("create_router", &token, move |e| async move {
                    e.create_router(&router_worker, &media_codecs).await
                })
                .await;

            let message = RegistryMessage::RouterReady {
                room_id,
                worker_id,
                result,
                respond_to,
            };
            let undelivered = match self_sender.upgrade() {
                Some(sender) => sender.send(message).await.err().map(|e| e.0),
                None => Some(message),
            };
            // Registry is gone; nobody will ever own this router.
            if let Some(RegistryMessage::RouterReady {
                result: Ok(router),
                ..
            }) = undelivered
            {
                engine.close(EngineHandle::Router(router.id)).await;
            }
        });
    }

    /// Finish a reservation: spawn the room or release the id.
    async fn router_ready(
        &mut self,
        room_id: RoomId,
        worker_id: WorkerId,
        result: Result<RouterHandle, RoomError>,
        respond_to: oneshot::Sender<Result<RoomHandle, RoomError>>,
    ) {
        if matches!(self.rooms.get(&room_id), Some(RoomEntry::Pending { .. })) {
            self.rooms.remove(&room_id);
        }

        let router = match result {
            Ok(router) => router,
            Err(e) => {
                warn!(
                    target: "rc.actor.registry",
                    rc_id = %self.rc_id,
                    room_id = %room_id,
                    error = %e,
                    "Router creation failed, releasing room id"
                );
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        let rejection = if self.dead_workers.contains(&worker_id) {
            Some(RoomError::Engine(EngineError::WorkerDied(worker_id.clone())))
        } else if !self.accepting_new {
            Some(RoomError::Draining)
        } else if respond_to.is_closed() {
            Some(RoomError::SessionClosed)
        } else {
            None
        };
        if let Some(e) = rejection {
            debug!(
                target: "rc.actor.registry",
                rc_id = %self.rc_id,
                room_id = %room_id,
                reason = %e,
                "Discarding router for abandoned room"
            );
            self.engine.close(EngineHandle::Router(router.id)).await;
            let _ = respond_to.send(Err(e));
            return;
        }

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            router,
            self.engine.clone(),
            self.max_peers_per_room,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room_id.clone(),
            RoomEntry::Active(ManagedRoom {
                handle: handle.clone(),
                task_handle,
                worker_id,
            }),
        );
        self.metrics.room_created();

        info!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            room_id = %room_id,
            total_rooms = self.active_count(),
            "Room created"
        );

        if let Err(Ok(handle)) = respond_to.send(Ok(handle)) {
            // Requester vanished between the check above and now.
            self.remove_if_empty(handle.room_id(), &handle.router().id)
                .await;
        }
    }

    async fn remove_if_empty(&mut self, room_id: &RoomId, router_id: &RouterId) -> bool {
        let closed = match self.rooms.get(room_id) {
            Some(RoomEntry::Active(managed)) if &managed.handle.router().id == router_id => {
                managed.handle.close_if_empty().await
            }
            Some(RoomEntry::Active(_)) => {
                debug!(
                    target: "rc.actor.registry",
                    rc_id = %self.rc_id,
                    room_id = %room_id,
                    router_id = %router_id,
                    "Ignoring removal for a previous instance of the room"
                );
                return false;
            }
            Some(RoomEntry::Pending { .. }) | None => return false,
        };
        if !closed {
            return false;
        }

        if let Some(RoomEntry::Active(managed)) = self.rooms.remove(room_id) {
            self.metrics.room_removed();
            self.reap_room(room_id.clone(), managed.task_handle);

            info!(
                target: "rc.actor.registry",
                rc_id = %self.rc_id,
                room_id = %room_id,
                total_rooms = self.active_count(),
                "Room removed"
            );
        }
        true
    }

    async fn worker_died(&mut self, worker_id: WorkerId) -> Vec<RoomId> {
        error!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            worker_id = %worker_id,
            "Media worker died, failing hosted rooms"
        );
        self.dead_workers.insert(worker_id.clone());

        let affected: Vec<RoomId> = self
            .rooms
            .iter()
            .filter_map(|(id, entry)| match entry {
                RoomEntry::Active(managed) if managed.worker_id == worker_id => Some(id.clone()),
                _ => None,
            })
            .collect();

        for room_id in &affected {
            if let Some(RoomEntry::Active(managed)) = self.rooms.remove(room_id) {
                managed
                    .handle
                    .force_close(RoomCloseReason::WorkerDied)
                    .await;
                self.metrics.room_removed();
                self.reap_room(room_id.clone(), managed.task_handle);
            }
        }

        warn!(
            target: "rc.actor.registry",
            rc_id = %self.rc_id,
            worker_id = %worker_id,
            rooms_failed = affected.len(),
            "Rooms on dead worker removed"
        );

        affected
    }

    /// Force-close every room and wait for the room actors.
    async fn close_all_rooms(&mut self) {
        self.accepting_new = false;

        let rooms: Vec<(RoomId, RoomEntry)> = self.rooms.drain().collect();
        for (room_id, entry) in rooms {
            let RoomEntry::Active(managed) = entry else {
                continue;
            };
            managed.handle.force_close(RoomCloseReason::Shutdown).await;
            self.metrics.room_removed();

            match tokio::time::timeout(ROOM_STOP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rc.actor.registry",
                        rc_id = %self.rc_id,
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "rc.actor.registry",
                        rc_id = %self.rc_id,
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rc.actor.registry",
                        rc_id = %self.rc_id,
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
        }
    }

    /// Wait for a stopped room actor in the background.
    fn reap_room(&self, room_id: RoomId, task_handle: JoinHandle<()>) {
        let rc_id = self.rc_id.clone();
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_STOP_TIMEOUT, task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    if join_error.is_panic() {
                        metrics.record_panic(ActorType::Room);
                    }
                    warn!(
                        target: "rc.actor.registry",
                        rc_id = %rc_id,
                        room_id = %room_id,
                        error = ?join_error,
                        "Room actor task failed during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rc.actor.registry",
                        rc_id = %rc_id,
                        room_id = %room_id,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });
    }

    /// Drop rooms whose actor stopped on its own (panic or cancellation).
    async fn check_room_health(&mut self) {
        let finished: Vec<RoomId> = self
            .rooms
            .iter()
            .filter_map(|(id, entry)| match entry {
                RoomEntry::Active(managed) if managed.task_handle.is_finished() => {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect();

        for room_id in finished {
            let Some(RoomEntry::Active(managed)) = self.rooms.remove(&room_id) else {
                continue;
            };
            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "rc.actor.registry",
                        rc_id = %self.rc_id,
                        room_id = %room_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "rc.actor.registry",
                            rc_id = %self.rc_id,
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked - triggering investigation"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }
            self.metrics.room_removed();
        }
    }

    fn active_count(&self) -> usize {
        self.rooms
            .values()
            .filter(|e| matches!(e, RoomEntry::Active(_)))
            .count()
    }

    fn status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.active_count(),
            pending_count: self.rooms.len() - self.active_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::types::default_media_codecs;
    use crate::media::{EngineOperation, Fault, InMemoryEngine};

    async fn registry(
        engine: &Arc<InMemoryEngine>,
        workers: usize,
        timeout: Duration,
    ) -> (RoomRegistryHandle, Arc<WorkerPool>) {
        let pool = Arc::new(WorkerPool::start(engine.clone(), workers).await.unwrap());
        let handle = RoomRegistryHandle::new(
            "rc-test".to_string(),
            Arc::clone(&pool),
            EngineCall::new(engine.clone(), timeout),
            0,
            ActorMetrics::new(),
        );
        (handle, pool)
    }

    fn room(id: &str) -> RoomId {
        RoomId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_find_room() {
        let engine = Arc::new(InMemoryEngine::new());
        let (registry, _pool) = registry(&engine, 1, Duration::from_secs(5)).await;

        let created = registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let found = registry.find(room("r1")).await.unwrap();
        assert_eq!(found.router().id, created.router().id);
        assert_eq!(engine.counts().await.routers, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_room_rejected() {
        let engine = Arc::new(InMemoryEngine::new());
        let (registry, _pool) = registry(&engine, 1, Duration::from_secs(5)).await;

        registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let err = registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::RoomAlreadyExists(_)));
        assert_eq!(engine.counts().await.routers, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_find_missing_room() {
        let engine = Arc::new(InMemoryEngine::new());
        let (registry, _pool) = registry(&engine, 1, Duration::from_secs(5)).await;

        let err = registry.find(room("nonexistent")).await.unwrap_err();
        assert!(matches!(err, RoomError::RoomNotFound(_)));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_remove_if_empty_removes_empty_room_once() {
        let engine = Arc::new(InMemoryEngine::new());
        let (registry, _pool) = registry(&engine, 1, Duration::from_secs(5)).await;

        let created = registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();

        let router_id = created.router().id.clone();
        assert!(registry
            .remove_if_empty(room("r1"), router_id.clone())
            .await
            .unwrap());
        assert!(!registry.remove_if_empty(room("r1"), router_id).await.unwrap());
        assert!(registry.find(room("r1")).await.is_err());

        let router = EngineHandle::Router(created.router().id.clone());
        assert_eq!(engine.close_calls(&router).await, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_failed_router_releases_reservation() {
        let engine = Arc::new(InMemoryEngine::new());
        let (registry, _pool) = registry(&engine, 1, Duration::from_secs(5)).await;
        engine
            .inject(
                EngineOperation::CreateRouter,
                Fault::Fail(EngineError::ResourceExhausted("no ports".to_string())),
            )
            .await;

        let err = registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Engine(EngineError::ResourceExhausted(_))));

        // The id is free again.
        registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();

        registry.cancel();
    }

    #[tokio::test]
    async fn test_pending_room_is_reserved_but_not_found() {
        let engine = Arc::new(InMemoryEngine::new());
        let (registry, _pool) = registry(&engine, 1, Duration::from_secs(5)).await;
        engine
            .inject(
                EngineOperation::CreateRouter,
                Fault::Delay(Duration::from_millis(200)),
            )
            .await;

        let creator = registry.clone();
        let pending = tokio::spawn(async move {
            creator
                .create_room(room("r1"), default_media_codecs())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = registry.get_status().await.unwrap();
        assert_eq!(status.pending_count, 1);
        assert!(matches!(
            registry.find(room("r1")).await,
            Err(RoomError::RoomNotFound(_))
        ));
        assert!(matches!(
            registry.create_room(room("r1"), default_media_codecs()).await,
            Err(RoomError::RoomAlreadyExists(_))
        ));
        assert!(!registry
            .remove_if_empty(room("r1"), RouterId::from("pending"))
            .await
            .unwrap());

        pending.await.unwrap().unwrap();
        assert!(registry.find(room("r1")).await.is_ok());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_worker_death_removes_only_hosted_rooms() {
        let engine = Arc::new(InMemoryEngine::new());
        let (registry, _pool) = registry(&engine, 2, Duration::from_secs(5)).await;

        let r1 = registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let r2 = registry
            .create_room(room("r2"), default_media_codecs())
            .await
            .unwrap();
        assert_ne!(r1.router().worker_id, r2.router().worker_id);

        let dead = r1.router().worker_id.clone();
        engine.kill_worker(&dead).await;
        let removed = registry.worker_died(dead).await.unwrap();

        assert_eq!(removed, vec![room("r1")]);
        assert!(registry.find(room("r1")).await.is_err());
        assert!(registry.find(room("r2")).await.is_ok());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_stale_removal_leaves_recreated_room_alone() {
        let engine = Arc::new(InMemoryEngine::new());
        let (registry, _pool) = registry(&engine, 2, Duration::from_secs(5)).await;

        let first = registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        let stale_router = first.router().id.clone();
        registry
            .worker_died(first.router().worker_id.clone())
            .await
            .unwrap();

        let second = registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        assert_ne!(second.router().id, stale_router);

        // A peer of the failed room leaving late must not close the new one.
        assert!(!registry
            .remove_if_empty(room("r1"), stale_router)
            .await
            .unwrap());
        assert!(registry.find(room("r1")).await.is_ok());
        assert!(
            engine
                .is_open(&EngineHandle::Router(second.router().id.clone()))
                .await
        );

        assert!(registry
            .remove_if_empty(room("r1"), second.router().id.clone())
            .await
            .unwrap());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let engine = Arc::new(InMemoryEngine::new());
        let (registry, _pool) = registry(&engine, 1, Duration::from_secs(5)).await;

        registry
            .create_room(room("r1"), default_media_codecs())
            .await
            .unwrap();
        registry.shutdown().await.unwrap();

        let status = registry.get_status().await.unwrap();
        assert!(status.is_draining);
        assert_eq!(status.room_count, 0);
        assert_eq!(engine.counts().await.routers, 0);
        assert!(matches!(
            registry.create_room(room("r2"), default_media_codecs()).await,
            Err(RoomError::Draining)
        ));

        registry.cancel();
    }
}
