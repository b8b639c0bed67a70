//! `RoomActor` - per-room actor that owns the router and peer membership.
//!
//! Each `RoomActor`:
//! - Owns exactly one router, created by the registry before the actor is
//!   spawned and closed exactly once when the room ends
//! - Owns the peer membership map (peer id -> session handle)
//! - Indexes the producers of its peers so consumers can find them
//!
//! All membership changes run on the actor's mailbox, so `add_peer` and
//! `remove_peer` for the same room are never concurrent.
//!
//! # Closing
//!
//! A room ends either through `close_if_empty` (last peer left, driven by
//! the registry) or `force_close` (worker death, shutdown). In both cases
//! the router handle is taken out of its `Option` before it is closed, so a
//! second close can never reach the engine.

use crate::errors::RoomError;
use crate::media::types::{MediaKind, ProducerId, WorkerId};
use crate::media::{EngineCall, EngineHandle, RouterHandle};

use super::messages::{ProducerInfo, RoomCloseReason, RoomMessage, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::session::PeerSessionHandle;

use common::{PeerId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
    router: RouterHandle,
}

impl RoomHandle {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Router this room was created with.
    ///
    /// Cached on the handle; the router is immutable for the room's life.
    #[must_use]
    pub fn router(&self) -> &RouterHandle {
        &self.router
    }

    /// Admit a peer.
    ///
    /// # Errors
    ///
    /// - `RoomFull` if the capacity bound would be exceeded
    /// - `RoomNotFound` if the room has already closed
    pub async fn add_peer(
        &self,
        peer_id: PeerId,
        session: PeerSessionHandle,
    ) -> Result<(), RoomError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::AddPeer {
            peer_id,
            session,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|_| RoomError::RoomNotFound(self.room_id.to_string()))?
    }

    /// Remove a peer. Idempotent; returns whether the room is now empty.
    ///
    /// A room that is already gone counts as empty.
    pub async fn remove_peer(&self, peer_id: PeerId) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .send(RoomMessage::RemovePeer {
                peer_id,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    /// Index a producer so other peers can consume it.
    ///
    /// # Errors
    ///
    /// `RoomClosed` if the room closed; `InvalidState` if the peer is not
    /// a member.
    pub async fn register_producer(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
        kind: MediaKind,
    ) -> Result<(), RoomError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::RegisterProducer {
            peer_id,
            producer_id,
            kind,
            respond_to: tx,
        })
        .await
        .map_err(|_| RoomError::RoomClosed(self.room_id.to_string()))?;

        rx.await
            .map_err(|_| RoomError::RoomClosed(self.room_id.to_string()))?
    }

    /// Drop a producer from the index and tell the other peers.
    pub async fn unregister_producer(&self, producer_id: ProducerId) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .send(RoomMessage::UnregisterProducer {
                producer_id,
                respond_to: tx,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Look up a producer of this room.
    ///
    /// # Errors
    ///
    /// `ProducerNotFound` if it is not (or no longer) registered.
    pub async fn find_producer(&self, producer_id: ProducerId) -> Result<ProducerInfo, RoomError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::FindProducer {
            producer_id: producer_id.clone(),
            respond_to: tx,
        })
        .await
        .map_err(|_| RoomError::ProducerNotFound(producer_id.clone()))?;

        rx.await
            .map_err(|_| RoomError::ProducerNotFound(producer_id))?
    }

    /// Close the room iff it has no peers. Returns whether it closed.
    ///
    /// A room that is already gone reports `true`.
    pub async fn close_if_empty(&self) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .send(RoomMessage::CloseIfEmpty { respond_to: tx })
            .await
            .is_err()
        {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    /// Close the room regardless of membership.
    pub async fn force_close(&self, reason: RoomCloseReason) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .send(RoomMessage::ForceClose {
                reason,
                respond_to: tx,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Get the current room state.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` if the actor has stopped.
    pub async fn get_state(&self) -> Result<RoomState, RoomError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::GetState { respond_to: tx }).await?;

        rx.await
            .map_err(|_| RoomError::RoomNotFound(self.room_id.to_string()))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: RoomMessage) -> Result<(), RoomError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| RoomError::RoomNotFound(self.room_id.to_string()))
    }
}

/// A peer admitted to the room.
struct Member {
    session: PeerSessionHandle,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: RoomId,
    worker_id: WorkerId,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    /// Taken exactly once when the room closes.
    router: Option<RouterHandle>,
    engine: EngineCall,
    peers: HashMap<PeerId, Member>,
    producers: HashMap<ProducerId, ProducerInfo>,
    /// 0 = unbounded.
    max_peers: usize,
    created_at: i64,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room actor around an already created router.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: RoomId,
        router: RouterHandle,
        engine: EngineCall,
        max_peers: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            worker_id: router.worker_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            router: Some(router.clone()),
            engine,
            peers: HashMap::new(),
            producers: HashMap::new(),
            max_peers,
            created_at: chrono::Utc::now().timestamp(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, room_id.as_str()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomHandle {
            sender,
            cancel_token,
            room_id,
            router,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "rc.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            worker_id = %self.worker_id,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "rc.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    // Closed through the registry without a prior close message.
                    if self.router.is_some() {
                        self.close(Some(RoomCloseReason::Shutdown)).await;
                    }
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "rc.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            if self.router.is_some() {
                                self.close(Some(RoomCloseReason::Shutdown)).await;
                            }
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: RoomMessage) -> bool {
        match message {
            RoomMessage::AddPeer {
                peer_id,
                session,
                respond_to,
            } => {
                let result = self.add_peer(peer_id, session);
                let _ = respond_to.send(result);
            }

            RoomMessage::RemovePeer {
                peer_id,
                respond_to,
            } => {
                let is_empty = self.remove_peer(&peer_id);
                let _ = respond_to.send(is_empty);
            }

            RoomMessage::RegisterProducer {
                peer_id,
                producer_id,
                kind,
                respond_to,
            } => {
                let result = self.register_producer(peer_id, producer_id, kind);
                let _ = respond_to.send(result);
            }

            RoomMessage::UnregisterProducer {
                producer_id,
                respond_to,
            } => {
                if let Some(info) = self.producers.remove(&producer_id) {
                    self.notify_producer_closed(&info);
                }
                let _ = respond_to.send(());
            }

            RoomMessage::FindProducer {
                producer_id,
                respond_to,
            } => {
                let result = self
                    .producers
                    .get(&producer_id)
                    .cloned()
                    .ok_or(RoomError::ProducerNotFound(producer_id));
                let _ = respond_to.send(result);
            }

            RoomMessage::CloseIfEmpty { respond_to } => {
                if self.peers.is_empty() {
                    self.close(None).await;
                    let _ = respond_to.send(true);
                    return true;
                }
                let _ = respond_to.send(false);
            }

            RoomMessage::ForceClose { reason, respond_to } => {
                self.close(Some(reason)).await;
                let _ = respond_to.send(());
                return true;
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
        }

        false
    }

    fn add_peer(&mut self, peer_id: PeerId, session: PeerSessionHandle) -> Result<(), RoomError> {
        if self.router.is_none() {
            return Err(RoomError::RoomNotFound(self.room_id.to_string()));
        }
        if self.peers.contains_key(&peer_id) {
            return Ok(());
        }
        if self.max_peers > 0 && self.peers.len() >= self.max_peers {
            return Err(RoomError::RoomFull(self.room_id.to_string()));
        }

        self.peers.insert(peer_id.clone(), Member { session });

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peer_count = self.peers.len(),
            "Peer joined room"
        );

        Ok(())
    }

    /// Returns whether the room is empty afterwards.
    fn remove_peer(&mut self, peer_id: &PeerId) -> bool {
        if self.peers.remove(peer_id).is_some() {
            let owned: Vec<ProducerId> = self
                .producers
                .values()
                .filter(|p| &p.owner == peer_id)
                .map(|p| p.producer_id.clone())
                .collect();
            for producer_id in owned {
                if let Some(info) = self.producers.remove(&producer_id) {
                    self.notify_producer_closed(&info);
                }
            }

            info!(
                target: "rc.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                peer_count = self.peers.len(),
                "Peer left room"
            );
        }

        self.peers.is_empty()
    }

    fn register_producer(
        &mut self,
        peer_id: PeerId,
        producer_id: ProducerId,
        kind: MediaKind,
    ) -> Result<(), RoomError> {
        if self.router.is_none() {
            return Err(RoomError::RoomClosed(self.room_id.to_string()));
        }
        if !self.peers.contains_key(&peer_id) {
            return Err(RoomError::InvalidState(format!(
                "peer {peer_id} is not in room {}",
                self.room_id
            )));
        }

        debug!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer registered"
        );

        self.producers.insert(
            producer_id.clone(),
            ProducerInfo {
                producer_id,
                owner: peer_id,
                kind,
            },
        );
        Ok(())
    }

    /// Tell every peer except the owner that a producer went away.
    fn notify_producer_closed(&self, info: &ProducerInfo) {
        for (peer_id, member) in &self.peers {
            if peer_id == &info.owner {
                continue;
            }
            if let Err(e) = member.session.notify_producer_closed(info.producer_id.clone()) {
                warn!(
                    target: "rc.actor.room",
                    room_id = %self.room_id,
                    peer_id = %peer_id,
                    error = %e,
                    "Failed to notify peer of closed producer"
                );
            }
        }
    }

    /// Close the router exactly once. With a reason, remaining peers are
    /// told the room is gone; a peer that cannot be told is cancelled.
    async fn close(&mut self, reason: Option<RoomCloseReason>) {
        let Some(router) = self.router.take() else {
            return;
        };

        if let Some(reason) = reason {
            for (peer_id, member) in self.peers.drain() {
                if let Err(e) = member
                    .session
                    .notify_room_closed(self.room_id.clone(), reason)
                {
                    warn!(
                        target: "rc.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        error = %e,
                        "Failed to notify peer of room closure, cancelling session"
                    );
                    member.session.cancel();
                }
            }
        }
        self.producers.clear();

        self.engine.close(EngineHandle::Router(router.id.clone())).await;

        info!(
            target: "rc.actor.room",
            room_id = %self.room_id,
            router_id = %router.id,
            reason = ?reason,
            "Room closed"
        );
    }

    fn state(&self) -> RoomState {
        RoomState {
            room_id: self.room_id.clone(),
            worker_id: self.worker_id.clone(),
            peers: self.peers.keys().cloned().collect(),
            producers: self.producers.values().cloned().collect(),
            router_open: self.router.is_some(),
            created_at: self.created_at,
        }
    }
}
